//! # cilgate Prelude
//!
//! This module provides a convenient prelude for the most commonly used types
//! from the library. Import it to get quick access to the essentials for
//! loading, policing, and executing sandboxed modules.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all cilgate operations
pub use crate::Error;

/// The result type used throughout cilgate
pub use crate::Result;

// ================================================================================================
// Metadata System
// ================================================================================================

/// Metadata token type for referencing runtime members
pub use crate::metadata::token::Token;

/// Loader-independent identities
pub use crate::metadata::identity::{MemberId, ModuleId};

/// Structural signatures
pub use crate::metadata::signatures::{MethodSig, TypeSig};

/// The runtime type model
pub use crate::metadata::types::{CilType, CilTypeRc, CilTypeRef, TypeFlavor};

/// Methods, fields, and decoded bodies
pub use crate::metadata::method::{ExceptionHandler, Field, FieldRc, Method, MethodBody, MethodRc};

/// Modules and the process registry
pub use crate::metadata::{module::Module, module::ModuleRc, registry::Registry};

/// Fluent construction of modules and bodies
pub use crate::metadata::builder::{
    BodyAsm, FieldBuilder, MethodBuilder, ModuleBuilder, TypeBuilder,
};

/// Attribute flags
pub use crate::metadata::flags::{
    ExceptionHandlerFlags, FieldAttributes, MemberVisibility, MethodModifiers, TypeModifiers,
    TypeVisibility,
};

// ================================================================================================
// Instruction Processing
// ================================================================================================

/// CIL instruction decoding, representation, and encoding
pub use crate::assembly::{
    decode_stream, encode_body, FlowType, Immediate, Instruction, OpCode, Operand, OperandKind,
};

// ================================================================================================
// Policy Model
// ================================================================================================

/// Policies and their builders
pub use crate::policy::{CasPolicy, CasPolicyBuilder};

/// Accessibility-scoped member selection
pub use crate::policy::binding::{Accessibility, TypeBinding};

/// Shim registration for sensitive library methods
pub use crate::policy::shims::{ShimTable, SignatureHash};

// ================================================================================================
// Runtime Enforcement
// ================================================================================================

/// Sandbox loading and the guard surface
pub use crate::runtime::{
    resolve_virtual, DefaultViolationHandler, ReceiverKind, RecordingHandler, SandboxLoader,
    ViolationHandler, ViolationMember,
};

/// Instrumentation results
pub use crate::rewrite::InstrumentationReport;

// ================================================================================================
// Emulation
// ================================================================================================

/// The execution engine
pub use crate::emulation::{EmValue, Machine, NativeCall, ObjData};
