//! Runtime enforcement: loaders, late binding, and violation handling.
//!
//! # Key Components
//!
//! - [`loader::SandboxLoader`] - Loads and instruments modules under a policy
//! - [`loader::entry`] - The check entry points injected code calls into
//! - [`dispatch::resolve_virtual`] - Late-binding resolution for virtual and
//!   interface dispatch
//! - [`handler::ViolationHandler`] - Pluggable policy for denied accesses

pub mod dispatch;
pub mod handler;
pub mod loader;

pub use dispatch::{resolve_virtual, ReceiverKind};
pub use handler::{DefaultViolationHandler, RecordingHandler, ViolationHandler, ViolationMember};
pub use loader::{LoaderShared, SandboxLoader};
