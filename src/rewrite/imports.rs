//! Imported external references for one instrumentation pass.
//!
//! Rewritten bodies embed calls to the runtime check entry points and
//! references to well-known core types by token. [`ImportedReferences`]
//! resolves that symbol table once per pass so the per-opcode patchers never
//! consult the registry for fixed symbols. Its lifetime is exactly one module
//! instrumentation.

use crate::metadata::{registry::Registry, token::Token};

/// The external symbols injected guard code references.
#[derive(Debug, Clone, Copy)]
pub struct ImportedReferences {
    /// Field-access check entry point
    pub check_access: Token,
    /// Late-bound virtual call check entry point
    pub check_virtual_call: Token,
    /// Constrained virtual call check entry point (open generic)
    pub check_virtual_call_constrained: Token,
    /// Definite-violation dispatch entry point
    pub invoke_violation_handler: Token,
    /// Checked delegate creation entry point (open generic)
    pub create_checked_delegate: Token,
    /// Stack-allocation length check entry point (open generic)
    pub verify_span_length: Token,
    /// Static flag field referenced by the external verifier's prelude
    pub verifier_probe: Token,
    /// Static flag field marking bodies already guarded by this crate
    pub guard_probe: Token,
    /// Open definition token of the span type
    pub span_type: Token,
    /// Open definition token of the `Span<T>(void*, int32)` constructor
    pub span_ctor: Token,
}

impl ImportedReferences {
    /// Resolves the symbol table from the registry's core library.
    #[must_use]
    pub fn bind(registry: &Registry) -> Self {
        let core = registry.core();
        ImportedReferences {
            check_access: core.check_access,
            check_virtual_call: core.check_virtual_call,
            check_virtual_call_constrained: core.check_virtual_call_constrained,
            invoke_violation_handler: core.invoke_violation_handler,
            create_checked_delegate: core.create_checked_delegate,
            verify_span_length: core.verify_span_length,
            verifier_probe: core.verifier_probe,
            guard_probe: core.guard_probe,
            span_type: core.span.token,
            span_ctor: core.span_ctor,
        }
    }
}
