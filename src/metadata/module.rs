//! Module representation for the runtime metadata model.
//!
//! A [`Module`] is the unit of loading and the unit of trust: the sandbox
//! associates policies with modules, and the same-module shortcut that exempts
//! intra-module accesses from guarding keys on the identities defined here.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::metadata::{
    identity::ModuleId,
    token::{table, Token},
    types::CilTypeRc,
};

/// Reference counted [`Module`]
pub type ModuleRc = Arc<Module>;

/// A loaded module: types, interned user strings, and identity.
pub struct Module {
    /// Stable identity digest of this module
    pub id: ModuleId,
    /// Display name
    pub name: String,
    /// Module version identifier
    pub mvid: [u8; 16],
    /// All types declared by this module, including nested and synthesized ones
    pub types: boxcar::Vec<CilTypeRc>,
    /// Interned user strings addressed by `ldstr` tokens
    pub user_strings: boxcar::Vec<Arc<str>>,
    instrumented: AtomicBool,
}

impl Module {
    /// Creates an empty module with the given name and MVID.
    #[must_use]
    pub fn new(name: &str, mvid: [u8; 16]) -> Self {
        Module {
            id: ModuleId::compute(name, &mvid),
            name: name.to_string(),
            mvid,
            types: boxcar::Vec::new(),
            user_strings: boxcar::Vec::new(),
            instrumented: AtomicBool::new(false),
        }
    }

    /// Returns true once guard instrumentation has completed for this module.
    #[must_use]
    pub fn is_instrumented(&self) -> bool {
        self.instrumented.load(Ordering::Acquire)
    }

    /// Marks the module as instrumented. Further instrumentation passes become
    /// no-ops.
    pub fn mark_instrumented(&self) {
        self.instrumented.store(true, Ordering::Release);
    }

    /// Interns a user string and returns its `ldstr` token.
    ///
    /// Repeated interning of the same text returns the same token.
    pub fn intern_string(&self, text: &str) -> Token {
        for i in 0..self.user_strings.count() {
            if let Some(existing) = self.user_strings.get(i) {
                if existing.as_ref() == text {
                    return Token::from_parts(table::USER_STRING, (i + 1) as u32);
                }
            }
        }
        let index = self.user_strings.push(Arc::from(text));
        Token::from_parts(table::USER_STRING, (index + 1) as u32)
    }

    /// Resolves a user string token interned in this module.
    #[must_use]
    pub fn user_string(&self, token: Token) -> Option<Arc<str>> {
        if !token.is_user_string() || token.row() == 0 {
            return None;
        }
        self.user_strings
            .get(token.row() as usize - 1)
            .map(Arc::clone)
    }

    /// Finds a top-level type declared in this module by namespace and name.
    #[must_use]
    pub fn type_by_name(&self, namespace: &str, name: &str) -> Option<CilTypeRc> {
        for i in 0..self.types.count() {
            if let Some(ty) = self.types.get(i) {
                if ty.namespace == namespace && ty.name == name {
                    return Some(ty.clone());
                }
            }
        }
        None
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Module({}, {}, {} types)",
            self.id,
            self.name,
            self.types.count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_interning_roundtrip() {
        let module = Module::new("Test", [3u8; 16]);
        let token = module.intern_string("hello");
        assert!(token.is_user_string());
        assert_eq!(module.user_string(token).as_deref(), Some("hello"));
    }

    #[test]
    fn test_string_interning_dedupes() {
        let module = Module::new("Test", [3u8; 16]);
        let a = module.intern_string("same");
        let b = module.intern_string("same");
        assert_eq!(a, b);
        assert_eq!(module.user_strings.count(), 1);
    }

    #[test]
    fn test_unknown_string_token() {
        let module = Module::new("Test", [3u8; 16]);
        assert!(module.user_string(Token::new(0x7000_0099)).is_none());
        assert!(module.user_string(Token::new(0x0400_0001)).is_none());
    }

    #[test]
    fn test_instrumented_flag() {
        let module = Module::new("Test", [3u8; 16]);
        assert!(!module.is_instrumented());
        module.mark_instrumented();
        assert!(module.is_instrumented());
    }
}
