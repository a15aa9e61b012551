//! Loader-independent identities for modules and their members.
//!
//! Policy sets must survive across loader instances, so they cannot key on
//! interned runtime pointers. This module provides [`ModuleId`], a stable digest
//! of a module's name and MVID, and [`MemberId`], the pair of a module identity
//! and a metadata token that uniquely names one field, method, or constructor
//! declaration.
//!
//! # Key Types
//! - [`ModuleId`] - 8-byte SHA-1 digest identity of a module
//! - [`MemberId`] - `(module, token)` pair used for O(1) policy membership

use std::fmt;

use sha1::{Digest, Sha1};

use crate::metadata::token::Token;

/// A stable, loader-independent identity for one module.
///
/// Computed as the last eight bytes (little-endian) of the SHA-1 digest over the
/// module name and MVID. Two loads of the same module bytes produce the same
/// identity regardless of which loader performed them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(u64);

impl ModuleId {
    /// Computes the identity of a module from its name and MVID.
    #[must_use]
    pub fn compute(name: &str, mvid: &[u8; 16]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(name.as_bytes());
        hasher.update(mvid);

        let digest = hasher.finalize();
        let tail: [u8; 8] = digest[digest.len() - 8..]
            .try_into()
            .expect("SHA-1 digest is 20 bytes");
        ModuleId(u64::from_le_bytes(tail))
    }

    /// Returns the raw identity value
    #[must_use]
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleId(0x{:016x})", self.0)
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// Uniquely identifies a field, method, or constructor declaration across loader
/// instances and generic instantiations.
///
/// The token component is always the *open definition* token; instantiation
/// tokens are collapsed by the registry before an identity is taken, so calls
/// through `List<int>.Add` and `List<string>.Add` test the same identity.
///
/// Equality holds iff two identities refer to the same declaration in the same
/// module, and the type hashes for O(1) set membership.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberId {
    module: ModuleId,
    token: Token,
}

impl MemberId {
    /// Creates a member identity from a declaring module and a definition token.
    ///
    /// Callers are responsible for collapsing instantiation tokens to their open
    /// definition first; use the registry's canonicalisation for arbitrary
    /// call-site tokens.
    #[must_use]
    pub fn new(module: ModuleId, token: Token) -> Self {
        MemberId { module, token }
    }

    /// The declaring module's identity
    #[must_use]
    pub fn module(&self) -> ModuleId {
        self.module
    }

    /// The member's definition token
    #[must_use]
    pub fn token(&self) -> Token {
        self.token
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberId({}, {})", self.module, self.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::token::table;
    use std::collections::HashSet;

    #[test]
    fn test_module_id_is_stable() {
        let mvid = [7u8; 16];
        let a = ModuleId::compute("Plugins.Core", &mvid);
        let b = ModuleId::compute("Plugins.Core", &mvid);
        assert_eq!(a, b);
    }

    #[test]
    fn test_module_id_differs_by_name_and_mvid() {
        let mvid = [7u8; 16];
        let a = ModuleId::compute("Plugins.Core", &mvid);
        let b = ModuleId::compute("Plugins.Extra", &mvid);
        assert_ne!(a, b);

        let other_mvid = [8u8; 16];
        let c = ModuleId::compute("Plugins.Core", &other_mvid);
        assert_ne!(a, c);
    }

    #[test]
    fn test_member_id_equality() {
        let module = ModuleId::compute("Host", &[1u8; 16]);
        let token = Token::from_parts(table::METHOD_DEF, 3);

        let a = MemberId::new(module, token);
        let b = MemberId::new(module, token);
        assert_eq!(a, b);

        let other = MemberId::new(module, Token::from_parts(table::METHOD_DEF, 4));
        assert_ne!(a, other);
    }

    #[test]
    fn test_member_id_set_membership() {
        let module = ModuleId::compute("Host", &[1u8; 16]);
        let mut set = HashSet::new();
        set.insert(MemberId::new(module, Token::from_parts(table::FIELD, 1)));

        assert!(set.contains(&MemberId::new(module, Token::from_parts(table::FIELD, 1))));
        assert!(!set.contains(&MemberId::new(module, Token::from_parts(table::FIELD, 2))));
    }

    #[test]
    fn test_member_id_distinguishes_modules() {
        let token = Token::from_parts(table::FIELD, 1);
        let a = MemberId::new(ModuleId::compute("A", &[0u8; 16]), token);
        let b = MemberId::new(ModuleId::compute("B", &[0u8; 16]), token);
        assert_ne!(a, b);
    }
}
