//! Policy model: immutable allow-lists compiled from type bindings.
//!
//! A [`CasPolicy`] is the compiled form of a set of [`TypeBinding`]s: a pure,
//! immutable member-identity set offering O(1) membership tests. Policies are
//! values; they can be shared across threads and across loaders freely. The
//! [`CasPolicyBuilder`] seeds the set from the default sandbox (the curated
//! core-library surface that is safe for any plug-in) and unions in
//! host-authored bindings.
//!
//! # Key Components
//!
//! - [`CasPolicy`] - Immutable member set with `can_access` predicates
//! - [`CasPolicyBuilder`] - Accumulates bindings, then freezes
//! - [`binding::TypeBinding`] / [`binding::Accessibility`] - Member selection
//! - [`shims::ShimTable`] - Safe replacements for sensitive library methods

pub mod binding;
pub mod shims;

use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::{
    metadata::{identity::MemberId, registry::Registry},
    policy::binding::{Accessibility, TypeBinding},
};

/// An immutable set of allowed member identities.
///
/// Pure value; cloning is cheap and all lookups are O(1) against the set
/// captured at build time.
#[derive(Clone)]
pub struct CasPolicy {
    members: Arc<FxHashSet<MemberId>>,
}

impl CasPolicy {
    /// Returns true when the member identity is allowed.
    #[must_use]
    pub fn contains(&self, member: &MemberId) -> bool {
        self.members.contains(member)
    }

    /// Returns true when the field identity is allowed.
    ///
    /// Alias of [`CasPolicy::contains`] kept for call-site readability.
    #[must_use]
    pub fn can_access_field(&self, field: &MemberId) -> bool {
        self.contains(field)
    }

    /// Returns true when the method identity is allowed.
    ///
    /// Alias of [`CasPolicy::contains`] kept for call-site readability.
    #[must_use]
    pub fn can_access_method(&self, method: &MemberId) -> bool {
        self.contains(method)
    }

    /// Number of member identities in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Returns true for a policy that allows nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl std::fmt::Debug for CasPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CasPolicy({} members)", self.members.len())
    }
}

/// Accumulates type bindings into a [`CasPolicy`].
pub struct CasPolicyBuilder {
    members: FxHashSet<MemberId>,
}

impl CasPolicyBuilder {
    /// Creates a builder with an empty member set.
    #[must_use]
    pub fn new() -> Self {
        CasPolicyBuilder {
            members: FxHashSet::default(),
        }
    }

    /// Seeds the set with the default sandbox: the public surface of the core
    /// library types that are safe for any plug-in.
    #[must_use]
    pub fn with_default_sandbox(mut self, registry: &Registry) -> Self {
        let core = registry.core();
        for ty in [
            &core.object,
            &core.string,
            &core.span,
            &core.ilist,
            &core.szarray,
        ] {
            let binding = TypeBinding::new(ty, Accessibility::Public);
            self.members.extend(binding.member_ids().iter().copied());
        }
        self
    }

    /// Unions the binding's members into the set.
    #[must_use]
    pub fn allow(mut self, binding: TypeBinding) -> Self {
        self.members.extend(binding.member_ids().iter().copied());
        self
    }

    /// Freezes the accumulated set into an immutable policy.
    #[must_use]
    pub fn build(self) -> CasPolicy {
        CasPolicy {
            members: Arc::new(self.members),
        }
    }
}

impl Default for CasPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_policy() {
        let policy = CasPolicyBuilder::new().build();
        assert!(policy.is_empty());
        assert_eq!(policy.len(), 0);
    }

    #[test]
    fn test_default_sandbox_allows_core_surface() {
        let registry = Registry::new();
        let policy = CasPolicyBuilder::new()
            .with_default_sandbox(&registry)
            .build();
        assert!(!policy.is_empty());

        let core = registry.core();
        let object_ctor = registry.canonical_member(core.object_ctor).unwrap();
        assert!(policy.contains(&object_ctor));
    }

    #[test]
    fn test_policy_is_shareable() {
        let registry = Registry::new();
        let policy = CasPolicyBuilder::new()
            .with_default_sandbox(&registry)
            .build();
        let clone = policy.clone();
        assert_eq!(policy.len(), clone.len());

        let handle = std::thread::spawn(move || clone.len());
        assert_eq!(handle.join().unwrap(), policy.len());
    }
}
