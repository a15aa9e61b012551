//! Late-binding resolution: from declared method to actual implementation.
//!
//! Virtual and interface calls must be policied against the implementation that
//! will actually execute, not the abstract declaration, so the runtime check
//! entry points resolve dispatch before consulting the policy. Resolution is
//! read-only against the registry's dispatch structures: class virtuals resolve
//! through the receiver type's slot-indexed method table, interface methods
//! through the interface implementation maps along the base chain.
//!
//! Array receivers have no ordinary method table; their interface dispatch is
//! resolved against the runtime's array helper type instead. That fallback
//! fails closed for methods with by-reference parameters rather than silently
//! resolving to the declaration.

use crate::{
    metadata::{method::MethodRc, registry::Registry, signatures::TypeSig, types::CilTypeRc},
    Error, Result,
};

/// The receiver a virtual dispatch will execute on.
#[derive(Debug, Clone)]
pub enum ReceiverKind {
    /// Null reference
    Null,
    /// An instance of a registered type
    Instance(CilTypeRc),
    /// A single-dimensional, zero-based array with the given element type
    SzArray(TypeSig),
}

/// Resolves the method that a `(receiver, declared method)` dispatch will
/// actually execute.
///
/// # Errors
///
/// - [`Error::NullReceiver`] for instance methods dispatched on null
/// - [`Error::Unsupported`] when the array fallback meets a by-reference
///   parameter
/// - [`Error::UnresolvedDispatch`] when no implementation exists
pub fn resolve_virtual(
    registry: &Registry,
    receiver: &ReceiverKind,
    declared: &MethodRc,
) -> Result<MethodRc> {
    if matches!(receiver, ReceiverKind::Null) && declared.sig.has_this && !declared.is_ctor() {
        return Err(Error::NullReceiver);
    }

    // Non-virtual, final, and sealed-type methods resolve to themselves.
    if !declared.is_overridable() {
        return Ok(declared.clone());
    }

    match receiver {
        ReceiverKind::Null => Err(Error::NullReceiver),
        ReceiverKind::Instance(ty) => resolve_on_type(registry, ty, declared),
        ReceiverKind::SzArray(_) => resolve_on_array(registry, declared),
    }
}

fn resolve_on_type(registry: &Registry, ty: &CilTypeRc, declared: &MethodRc) -> Result<MethodRc> {
    let declaring = declared
        .declaring_type()
        .ok_or_else(|| Error::UnresolvedDispatch {
            method: declared.full_name(),
        })?;

    if declaring.is_interface() {
        let implementation =
            ty.interface_implementation(declared.token)
                .ok_or_else(|| Error::UnresolvedDispatch {
                    method: declared.full_name(),
                })?;
        return registry.method(implementation);
    }

    let slot = declared
        .slot
        .get()
        .copied()
        .ok_or_else(|| Error::UnresolvedDispatch {
            method: declared.full_name(),
        })?;

    // Walk up from the receiver type until a method table covers the slot.
    let mut current = Some(ty.clone());
    while let Some(ty) = current {
        let table = ty.method_table();
        if let Some(token) = table.get(slot as usize) {
            return registry.method(*token);
        }
        current = ty.base_type();
    }

    Err(Error::UnresolvedDispatch {
        method: declared.full_name(),
    })
}

/// Interface dispatch on array receivers, routed through the runtime's array
/// helper type.
///
/// This stands in for binding a delegate to the receiver and reading the
/// delegate's resolved target, which is the only dispatch information the
/// runtime exposes for arrays. By-reference parameters cannot round-trip
/// through that binding, so they fail closed.
fn resolve_on_array(registry: &Registry, declared: &MethodRc) -> Result<MethodRc> {
    if declared.sig.params.iter().any(TypeSig::is_byref) {
        return Err(Error::Unsupported(format!(
            "array dispatch of '{}' with by-reference parameters",
            declared.full_name()
        )));
    }

    let helper = &registry.core().szarray;
    let implementation = helper
        .interface_implementation(declared.token)
        .ok_or_else(|| Error::UnresolvedDispatch {
            method: declared.full_name(),
        })?;
    registry.method(implementation)
}
