use thiserror::Error;

use crate::metadata::{identity::ModuleId, token::Token};

macro_rules! bad_image {
    // Single string version
    ($msg:expr) => {
        crate::Error::BadImageFormat {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::BadImageFormat {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can
/// potentially return.
///
/// The variants fall into four groups that mirror how failures surface to a host:
///
/// # Error Categories
///
/// ## Load-time rejection
/// - [`Error::BadImageFormat`] - A module body violates a structural rule (bad
///   stack-allocation shape, dangling branch target, missing verifier prelude)
/// - [`Error::NativeLoadDenied`] - An unmanaged library load was requested in a
///   sandboxed context
///
/// ## Runtime policy enforcement
/// - [`Error::SecurityViolation`] - A sandboxed frame touched a member outside its
///   policy and the installed violation handler raised
/// - [`Error::NullReceiver`] - Late binding was asked to resolve a virtual call on a
///   null receiver
///
/// ## Configuration errors
/// - [`Error::MemberNotFound`] / [`Error::AmbiguousMember`] - Binding refinement did
///   not select exactly one member
/// - [`Error::Unsupported`] - A requested operation is outside the supported surface
///
/// ## Internal invariant failures
/// - [`Error::NoLoaderForModule`] - A registered sandboxed module has lost its
///   loader; indicates a host bug and is not recoverable
/// - [`Error::TokenNotFound`] - A metadata token does not resolve in the registry
#[derive(Error, Debug)]
pub enum Error {
    /// A module image or method body is structurally invalid.
    ///
    /// Raised during instrumentation (unsupported `localloc` shape, managed span
    /// element types, missing verifier prelude, dangling branch targets) and at
    /// runtime when an injected stack-allocation length check fails.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("BadImageFormat - {file}:{line}: {message}")]
    BadImageFormat {
        /// The message to be printed for the error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// Loading an unmanaged library was requested inside a sandboxed context.
    ///
    /// Sandboxed modules must never reach native code, so any such request is
    /// refused outright rather than policied.
    #[error("Loading unmanaged library '{0}' is not permitted in a sandboxed context")]
    NativeLoadDenied(String),

    /// A sandboxed frame accessed a member its policy does not allow.
    ///
    /// This is what the default violation handler raises; replacement handlers may
    /// suppress it and let execution continue.
    #[error("Access to '{member}' is denied by the sandbox policy")]
    SecurityViolation {
        /// Display name of the denied member
        member: String,
    },

    /// Late binding was asked to resolve an instance method on a null receiver.
    ///
    /// Matches the null-dereference the sandboxed call would produce natively; the
    /// resolver reports it instead of silently changing semantics.
    #[error("Virtual call receiver was null")]
    NullReceiver,

    /// A binding refinement matched no member.
    #[error("Type '{type_name}' has no accessible member '{member}'")]
    MemberNotFound {
        /// Full name of the binding's target type
        type_name: String,
        /// The requested member name
        member: String,
    },

    /// A binding refinement matched more than one member.
    ///
    /// Use the signature-qualified refinement form to select a single overload.
    #[error("Member '{member}' on type '{type_name}' is ambiguous; qualify it with a signature")]
    AmbiguousMember {
        /// Full name of the binding's target type
        type_name: String,
        /// The requested member name
        member: String,
    },

    /// A module is registered as sandboxed but its loader has been dropped.
    ///
    /// The module-to-loader association is the sole authoritative link from a
    /// running frame to its policy, so losing it is a non-recoverable host bug.
    #[error("No loader is associated with module {0}")]
    NoLoaderForModule(ModuleId),

    /// Virtual dispatch found no implementation for the declared method.
    #[error("No implementation found for '{method}' on the receiver type")]
    UnresolvedDispatch {
        /// Display name of the declared method
        method: String,
    },

    /// The requested operation is outside the supported surface.
    ///
    /// Notably raised when the late-binding fallback for array receivers meets a
    /// by-reference parameter, where the resolver fails closed.
    #[error("{0}")]
    Unsupported(String),

    /// A metadata token does not resolve against the runtime registry.
    #[error("Failed to resolve metadata token {0}")]
    TokenNotFound(Token),

    /// A branch instruction could not be encoded or retargeted.
    #[error("Invalid branch: {0}")]
    InvalidBranch(String),

    /// An instruction mnemonic is not part of the supported opcode tables.
    #[error("Unknown instruction mnemonic '{0}'")]
    InvalidMnemonic(String),

    /// The emulation engine faulted while executing a method body.
    #[error("Execution fault: {0}")]
    Execution(String),

    /// Reach the maximum recursion level allowed.
    #[error("Reached the maximum call depth allowed - {0}")]
    RecursionLimit(usize),

    /// Failed to lock target.
    #[error("Failed to lock target")]
    LockError,
}

/// Result type used throughout this crate.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_image_macro_captures_location() {
        let err = bad_image!("broken body");
        match err {
            Error::BadImageFormat {
                message,
                file,
                line,
            } => {
                assert_eq!(message, "broken body");
                assert!(file.ends_with("error.rs"));
                assert!(line > 0);
            }
            _ => panic!("expected BadImageFormat"),
        }
    }

    #[test]
    fn test_bad_image_macro_formats_arguments() {
        let err = bad_image!("offset {} out of range", 42);
        assert!(err.to_string().contains("offset 42 out of range"));
    }

    #[test]
    fn test_error_display() {
        let err = Error::SecurityViolation {
            member: "Host.SharedClass::DeniedField".to_string(),
        };
        assert!(err.to_string().contains("DeniedField"));

        let err = Error::NativeLoadDenied("kernel32".to_string());
        assert!(err.to_string().contains("kernel32"));
    }
}
