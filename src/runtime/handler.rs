//! Violation handling policy.
//!
//! When a guard denies an access, the owning loader dispatches the event to its
//! installed [`ViolationHandler`]. The default raises a security error that
//! unwinds the sandboxed frame; replacements may log and continue, or record
//! violations and fail later. Handlers are called from whatever thread executes
//! the sandboxed code and must be safe to invoke concurrently.

use std::sync::Mutex;

use crate::{
    metadata::{identity::ModuleId, token::Token},
    Error, Result,
};

/// Description of the member a violation concerns.
#[derive(Debug, Clone)]
pub struct ViolationMember {
    /// Token of the denied member
    pub token: Token,
    /// Display name of the denied member
    pub display: String,
}

/// Decides what happens when a sandboxed frame is denied an access.
///
/// Returning `Ok(())` lets the access proceed; returning an error propagates it
/// through the sandboxed call.
pub trait ViolationHandler: Send + Sync {
    /// Invoked for every denied access.
    fn on_violation(&self, module: ModuleId, member: &ViolationMember) -> Result<()>;
}

/// Default policy: raise a security error that aborts the access.
#[derive(Debug, Default)]
pub struct DefaultViolationHandler;

impl ViolationHandler for DefaultViolationHandler {
    fn on_violation(&self, _module: ModuleId, member: &ViolationMember) -> Result<()> {
        Err(Error::SecurityViolation {
            member: member.display.clone(),
        })
    }
}

/// Log-and-continue policy that records every violation and lets the access
/// proceed.
///
/// Useful for auditing a plug-in before tightening its policy.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    violations: Mutex<Vec<(ModuleId, String)>>,
}

impl RecordingHandler {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the violations recorded so far.
    #[must_use]
    pub fn recorded(&self) -> Vec<(ModuleId, String)> {
        self.violations
            .lock()
            .expect("Failed to acquire lock")
            .clone()
    }
}

impl ViolationHandler for RecordingHandler {
    fn on_violation(&self, module: ModuleId, member: &ViolationMember) -> Result<()> {
        self.violations
            .lock()
            .expect("Failed to acquire lock")
            .push((module, member.display.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member() -> ViolationMember {
        ViolationMember {
            token: Token::new(0x0600_0001),
            display: "Host.File::Delete".to_string(),
        }
    }

    #[test]
    fn test_default_handler_raises() {
        let handler = DefaultViolationHandler;
        let module = ModuleId::compute("plugin", &[1u8; 16]);
        let result = handler.on_violation(module, &member());
        assert!(matches!(result, Err(Error::SecurityViolation { .. })));
    }

    #[test]
    fn test_recording_handler_continues() {
        let handler = RecordingHandler::new();
        let module = ModuleId::compute("plugin", &[1u8; 16]);

        assert!(handler.on_violation(module, &member()).is_ok());
        assert!(handler.on_violation(module, &member()).is_ok());

        let recorded = handler.recorded();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].0, module);
        assert!(recorded[0].1.contains("File::Delete"));
    }
}
