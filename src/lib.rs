// Copyright 2025-2026 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]

//! # cilgate
//!
//! Code-access security enforcement for untrusted CIL plug-in modules running
//! inside a shared managed runtime. Untrusted modules load into an isolated
//! context paired with a *policy* enumerating the host fields, methods, and
//! constructors they may reach; before any module code runs, every method body
//! is rewritten to interpose runtime guards at each cross-module field access,
//! call, delegate creation, and stack allocation.
//!
//! # Architecture
//!
//! - **Metadata layer** ([`metadata`]): tokens, stable member identities, the
//!   runtime type model, and fluent module builders
//! - **Instruction layer** ([`assembly`]): opcode tables, decoding, and
//!   encoding of method body instruction streams
//! - **Policy layer** ([`policy`]): accessibility-scoped type bindings
//!   compiled into immutable O(1) member sets, plus the shim table
//! - **Rewrite layer** ([`rewrite`]): the editable instruction buffer with
//!   branch retargeting, guard-cache synthesis, and the per-opcode patchers
//! - **Runtime layer** ([`runtime`]): sandbox loaders, the late-binding
//!   resolver, the guard check entry points, and violation handling
//! - **Emulation layer** ([`emulation`]): a compact interpreter standing in
//!   for the host virtual machine, with frames, heap, and native intrinsics
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cilgate::metadata::{ModuleBuilder, Registry, TypeBuilder};
//! use cilgate::policy::binding::{Accessibility, TypeBinding};
//! use cilgate::policy::CasPolicyBuilder;
//! use cilgate::runtime::SandboxLoader;
//! use cilgate::emulation::Machine;
//!
//! # fn main() -> cilgate::Result<()> {
//! let registry = Registry::new();
//!
//! // Host surface the plug-in may use.
//! let mut host = ModuleBuilder::new(&registry, "Host");
//! let shared = host.define(TypeBuilder::class("Api").namespace("Host").public())?;
//!
//! let policy = CasPolicyBuilder::new()
//!     .with_default_sandbox(&registry)
//!     .allow(TypeBinding::new(&shared, Accessibility::Public))
//!     .build();
//!
//! // Load the plug-in module; every body is guarded during the load.
//! let loader = SandboxLoader::with_options(&registry, policy, Some("plugins"), true);
//! let plugin = ModuleBuilder::new(&registry, "Plugin").build();
//! loader.load_module(&plugin)?;
//!
//! // Execute sandboxed code; violations surface through the loader's handler.
//! let _machine = Machine::new(registry);
//! # Ok(())
//! # }
//! ```
//!
//! # Error Handling
//!
//! All operations return [`Result<T, Error>`](Result). Load-time rejections
//! surface as [`Error::BadImageFormat`] or [`Error::NativeLoadDenied`];
//! runtime denials surface through the installed violation handler, by
//! default as [`Error::SecurityViolation`].
//!
//! # Thread Safety
//!
//! Policies are immutable values, the module-to-loader association is
//! lock-free, and guard state is write-once. The execution engine itself is
//! single-threaded per [`emulation::Machine`] instance.

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

pub use error::{Error, Result};

/// Convenient re-exports of the most commonly used types and traits.
pub mod prelude;

/// CIL instruction processing: decoding, representation, and encoding.
pub mod assembly;

/// Controlled execution environment standing in for the host virtual machine.
pub mod emulation;

/// Runtime metadata model: tokens, identities, types, members, and modules.
pub mod metadata;

/// Policy model: bindings, immutable allow-lists, and shims.
pub mod policy;

/// Method body rewriting: editor, guard caches, and instrumentation.
pub mod rewrite;

/// Runtime enforcement: loaders, late binding, and violation handling.
pub mod runtime;
