//! Shim table: safe replacements for sensitive library methods.
//!
//! Shims substitute ambient-authority APIs (file I/O, reflection emit, raw
//! memory helpers) with safer host-provided methods at instrumentation time.
//! The table is keyed by [`SignatureHash`], which identifies a method shape
//! independently of any closed generic instantiation, so one registration
//! covers every instantiation of a generic target.
//!
//! # Concurrency
//!
//! The table is built while the host configures the runtime and frozen when the
//! first sandboxed module loads; afterwards it is read-only and guards read it
//! without coordination.

use std::{
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicBool, Ordering},
        RwLock,
    },
};

use rustc_hash::{FxHashMap, FxHasher};

use crate::{
    metadata::{method::MethodRc, registry::Registry, token::Token},
    Error, Result,
};

/// Identity of a method shape, stable across loaders and closed generic
/// instantiations.
///
/// Equality ignores the declaring-type identity of closed instantiations but
/// preserves the open generic shape: `Write<int>` and `Write<string>` hash
/// equal, `Write<T>(T)` and `Write(object)` do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignatureHash(u64);

impl SignatureHash {
    /// Computes the signature hash of a method definition.
    #[must_use]
    pub fn of_method(method: &MethodRc) -> SignatureHash {
        let mut hasher = FxHasher::default();

        if let Some(declaring) = method.declaring_type() {
            declaring.module.value().hash(&mut hasher);
            declaring.full_name().hash(&mut hasher);
        }
        method.name.hash(&mut hasher);
        method.is_static().hash(&mut hasher);

        let open = method.sig.open();
        open.generic_arity.hash(&mut hasher);
        open.params.hash(&mut hasher);
        open.ret.hash(&mut hasher);

        SignatureHash(hasher.finish())
    }

    /// Raw hash value
    #[must_use]
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Map from sensitive method shapes to their safe replacements.
pub struct ShimTable {
    map: RwLock<FxHashMap<SignatureHash, Token>>,
    frozen: AtomicBool,
}

impl ShimTable {
    /// Creates an empty, unfrozen table.
    #[must_use]
    pub fn new() -> Self {
        ShimTable {
            map: RwLock::new(FxHashMap::default()),
            frozen: AtomicBool::new(false),
        }
    }

    /// Registers a shim for a sensitive method.
    ///
    /// Both tokens must be open method definitions. The rewriter re-attaches the
    /// call site's generic arguments when it swaps the target, so the shim must
    /// declare the same generic shape as the original.
    ///
    /// # Errors
    /// Fails once the table is frozen by the first sandboxed load, and when
    /// either token does not resolve.
    pub fn register(&self, registry: &Registry, original: Token, shim: Token) -> Result<()> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(Error::Unsupported(
                "shim table is frozen once sandboxed modules have loaded".to_string(),
            ));
        }

        let original = registry.method(original)?;
        registry.method(shim)?;

        write_lock!(self.map).insert(SignatureHash::of_method(&original), shim);
        Ok(())
    }

    /// Looks up the shim for a method shape.
    #[must_use]
    pub fn lookup(&self, hash: SignatureHash) -> Option<Token> {
        read_lock!(self.map).get(&hash).copied()
    }

    /// Looks up the shim for a resolved method.
    #[must_use]
    pub fn shim_for(&self, method: &MethodRc) -> Option<Token> {
        self.lookup(SignatureHash::of_method(method))
    }

    /// Freezes the table; called on the first sandboxed module load.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    /// Returns true once the table is read-only.
    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }
}

impl Default for ShimTable {
    fn default() -> Self {
        Self::new()
    }
}
