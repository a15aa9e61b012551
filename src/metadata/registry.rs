//! Process-wide runtime registry: token allocation and member resolution.
//!
//! The [`Registry`] models the metadata surface a managed runtime exposes to the
//! sandbox layer: every loaded type, field, and method is reachable by token,
//! instantiated generic members collapse to their open definitions, and the
//! well-known core types the rewriter imports are bootstrapped at construction.
//!
//! # Key Components
//!
//! - [`Registry`] - token allocator plus concurrent token-to-member maps
//! - [`MethodInstantiation`] - a closed generic call-site shape interned behind a
//!   `MethodSpec`-style token
//! - [`CoreTypes`] - handles to the bootstrapped core library and guard entry
//!   points
//!
//! # Concurrency
//!
//! All maps are lock-free skip lists; insertions happen while modules load and
//! readers (runtime guards, the late-binding resolver) never block.

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc, Mutex, OnceLock,
};

use crossbeam_skiplist::SkipMap;
use rustc_hash::FxHashMap;

use crate::{
    metadata::{
        identity::{MemberId, ModuleId},
        method::{FieldRc, MethodRc},
        module::ModuleRc,
        signatures::TypeSig,
        token::{table, Token},
        types::CilTypeRc,
    },
    policy::shims::ShimTable,
    Error, Result,
};

static MVID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A closed generic call-site shape.
///
/// `type_args` instantiate the declaring type's generic parameters and
/// `method_args` the method's own; either list may be empty. Interning the shape
/// behind a token lets rewritten call sites reference instantiated members the
/// same way ordinary members are referenced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodInstantiation {
    /// Open definition token of the target method
    pub definition: Token,
    /// Declaring-type generic arguments
    pub type_args: Vec<TypeSig>,
    /// Method generic arguments
    pub method_args: Vec<TypeSig>,
}

/// Handles to the bootstrapped core library.
///
/// The rewriter embeds these tokens into every instrumented module, so they act
/// as the stable symbol table the injected code depends on.
pub struct CoreTypes {
    /// The core library module
    pub module: ModuleRc,
    /// `System.Object`
    pub object: CilTypeRc,
    /// Token of the `System.Object` constructor
    pub object_ctor: Token,
    /// `System.String`
    pub string: CilTypeRc,
    /// `System.ValueType`
    pub value_type: CilTypeRc,
    /// `System.MulticastDelegate`, base of all delegate types
    pub multicast_delegate: CilTypeRc,
    /// `System.Span<T>`
    pub span: CilTypeRc,
    /// Open definition token of the `Span<T>(void*, int32)` constructor
    pub span_ctor: Token,
    /// Generic list interface used by the array dispatch fallback
    pub ilist: CilTypeRc,
    /// Runtime helper type implementing the list interface over arrays
    pub szarray: CilTypeRc,
    /// Static type hosting the guard check entry points
    pub guards: CilTypeRc,
    /// Static flag field the external verifier references in its prelude
    pub verifier_probe: Token,
    /// Static flag field marking bodies already rewritten by this crate
    pub guard_probe: Token,
    /// Entry point checking field accesses
    pub check_access: Token,
    /// Entry point checking late-bound virtual calls
    pub check_virtual_call: Token,
    /// Generic entry point checking constrained virtual calls
    pub check_virtual_call_constrained: Token,
    /// Entry point dispatching a definite policy violation
    pub invoke_violation_handler: Token,
    /// Generic entry point creating policy-checked delegates
    pub create_checked_delegate: Token,
    /// Generic entry point validating stack allocation lengths
    pub verify_span_length: Token,
}

/// Token allocator and concurrent member maps for one runtime instance.
pub struct Registry {
    next_type: AtomicU32,
    next_field: AtomicU32,
    next_method: AtomicU32,
    next_spec: AtomicU32,
    types: SkipMap<Token, CilTypeRc>,
    fields: SkipMap<Token, FieldRc>,
    methods: SkipMap<Token, MethodRc>,
    modules: SkipMap<ModuleId, ModuleRc>,
    method_specs: SkipMap<Token, MethodInstantiation>,
    spec_intern: Mutex<FxHashMap<MethodInstantiation, Token>>,
    shims: ShimTable,
    core: OnceLock<CoreTypes>,
}

impl Registry {
    /// Creates a registry with the core library bootstrapped.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let registry = Arc::new(Registry {
            next_type: AtomicU32::new(1),
            next_field: AtomicU32::new(1),
            next_method: AtomicU32::new(1),
            next_spec: AtomicU32::new(1),
            types: SkipMap::new(),
            fields: SkipMap::new(),
            methods: SkipMap::new(),
            modules: SkipMap::new(),
            method_specs: SkipMap::new(),
            spec_intern: Mutex::new(FxHashMap::default()),
            shims: ShimTable::new(),
            core: OnceLock::new(),
        });

        let core = crate::emulation::intrinsics::bootstrap(&registry);
        let _ = registry.core.set(core);
        registry
    }

    /// Produces a fresh, process-unique module version identifier.
    #[must_use]
    pub fn fresh_mvid() -> [u8; 16] {
        let serial = MVID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut mvid = [0u8; 16];
        mvid[..8].copy_from_slice(&serial.to_le_bytes());
        mvid
    }

    /// Allocates the next type definition token.
    pub fn alloc_type_token(&self) -> Token {
        Token::from_parts(table::TYPE_DEF, self.next_type.fetch_add(1, Ordering::Relaxed))
    }

    /// Allocates the next field token.
    pub fn alloc_field_token(&self) -> Token {
        Token::from_parts(table::FIELD, self.next_field.fetch_add(1, Ordering::Relaxed))
    }

    /// Allocates the next method definition token.
    pub fn alloc_method_token(&self) -> Token {
        Token::from_parts(
            table::METHOD_DEF,
            self.next_method.fetch_add(1, Ordering::Relaxed),
        )
    }

    /// Registers a type under its token.
    pub fn add_type(&self, ty: CilTypeRc) {
        self.types.insert(ty.token, ty);
    }

    /// Registers a field under its token.
    pub fn add_field(&self, field: FieldRc) {
        self.fields.insert(field.token, field);
    }

    /// Registers a method under its token.
    pub fn add_method(&self, method: MethodRc) {
        self.methods.insert(method.token, method);
    }

    /// Registers a module under its identity.
    pub fn add_module(&self, module: ModuleRc) {
        self.modules.insert(module.id, module);
    }

    /// Resolves a type definition token.
    pub fn ty(&self, token: Token) -> Result<CilTypeRc> {
        self.types
            .get(&token)
            .map(|e| e.value().clone())
            .ok_or(Error::TokenNotFound(token))
    }

    /// Resolves a field token.
    pub fn field(&self, token: Token) -> Result<FieldRc> {
        self.fields
            .get(&token)
            .map(|e| e.value().clone())
            .ok_or(Error::TokenNotFound(token))
    }

    /// Resolves a method definition token, rejecting instantiation tokens.
    pub fn method(&self, token: Token) -> Result<MethodRc> {
        self.methods
            .get(&token)
            .map(|e| e.value().clone())
            .ok_or(Error::TokenNotFound(token))
    }

    /// Resolves a loaded module by identity.
    pub fn module(&self, id: ModuleId) -> Option<ModuleRc> {
        self.modules.get(&id).map(|e| e.value().clone())
    }

    /// Resolves a method call-site token to its definition and, for instantiated
    /// sites, the generic arguments in play.
    pub fn resolve_method(&self, token: Token) -> Result<(MethodRc, Option<MethodInstantiation>)> {
        if token.is_method_spec() {
            let inst = self
                .method_specs
                .get(&token)
                .map(|e| e.value().clone())
                .ok_or(Error::TokenNotFound(token))?;
            let method = self.method(inst.definition)?;
            return Ok((method, Some(inst)));
        }
        Ok((self.method(token)?, None))
    }

    /// Interns an instantiated call-site shape and returns its token.
    ///
    /// Repeated interning of the same shape returns the same token, so rewritten
    /// call sites stay comparable.
    pub fn method_instance(
        &self,
        definition: Token,
        type_args: Vec<TypeSig>,
        method_args: Vec<TypeSig>,
    ) -> Token {
        let inst = MethodInstantiation {
            definition,
            type_args,
            method_args,
        };

        let mut intern = self.spec_intern.lock().expect("Failed to acquire lock");
        if let Some(existing) = intern.get(&inst) {
            return *existing;
        }
        let token = Token::from_parts(table::METHOD_SPEC, self.next_spec.fetch_add(1, Ordering::Relaxed));
        self.method_specs.insert(token, inst.clone());
        intern.insert(inst, token);
        token
    }

    /// Collapses an arbitrary member token to its loader-independent identity.
    ///
    /// Instantiation tokens are reduced to their open definition first, so both
    /// closed forms of a generic member share one identity.
    pub fn canonical_member(&self, token: Token) -> Result<MemberId> {
        match token.table() {
            table::FIELD => {
                let field = self.field(token)?;
                let module = field
                    .declaring_type()
                    .map(|t| t.module)
                    .ok_or(Error::TokenNotFound(token))?;
                Ok(MemberId::new(module, token))
            }
            table::METHOD_DEF => {
                let method = self.method(token)?;
                let module = method
                    .declaring_type()
                    .map(|t| t.module)
                    .ok_or(Error::TokenNotFound(token))?;
                Ok(MemberId::new(module, token))
            }
            table::METHOD_SPEC => {
                let (method, _) = self.resolve_method(token)?;
                self.canonical_member(method.token)
            }
            _ => Err(Error::TokenNotFound(token)),
        }
    }

    /// Human-readable name of a member token, for diagnostics and violations.
    #[must_use]
    pub fn member_display(&self, token: Token) -> String {
        match token.table() {
            table::FIELD => self
                .field(token)
                .map_or_else(|_| token.to_string(), |f| f.full_name()),
            table::METHOD_DEF => self
                .method(token)
                .map_or_else(|_| token.to_string(), |m| m.full_name()),
            table::METHOD_SPEC => self
                .resolve_method(token)
                .map_or_else(|_| token.to_string(), |(m, _)| m.full_name()),
            table::TYPE_DEF => self
                .ty(token)
                .map_or_else(|_| token.to_string(), |t| t.full_name()),
            _ => token.to_string(),
        }
    }

    /// The process-wide shim table for this runtime.
    #[must_use]
    pub fn shims(&self) -> &ShimTable {
        &self.shims
    }

    /// Handles to the bootstrapped core library.
    ///
    /// # Panics
    /// Panics if called during bootstrap itself.
    #[must_use]
    pub fn core(&self) -> &CoreTypes {
        self.core.get().expect("core types are set at construction")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_allocation_is_sequential_per_table() {
        let registry = Registry::new();
        let t1 = registry.alloc_type_token();
        let t2 = registry.alloc_type_token();
        assert_eq!(t2.row(), t1.row() + 1);
        assert_eq!(t1.table(), table::TYPE_DEF);

        let f1 = registry.alloc_field_token();
        assert_eq!(f1.table(), table::FIELD);
    }

    #[test]
    fn test_fresh_mvids_are_unique() {
        assert_ne!(Registry::fresh_mvid(), Registry::fresh_mvid());
    }

    #[test]
    fn test_core_is_bootstrapped() {
        let registry = Registry::new();
        let core = registry.core();
        assert_eq!(core.object.name, "Object");
        assert!(registry.ty(core.object.token).is_ok());
        assert!(registry.method(core.check_access).is_ok());
    }

    #[test]
    fn test_method_instance_interning() {
        let registry = Registry::new();
        let def = registry.core().span_ctor;

        let a = registry.method_instance(def, vec![TypeSig::I4], vec![]);
        let b = registry.method_instance(def, vec![TypeSig::I4], vec![]);
        let c = registry.method_instance(def, vec![TypeSig::I8], vec![]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.is_method_spec());
    }

    #[test]
    fn test_canonical_member_collapses_instantiations() {
        let registry = Registry::new();
        let def = registry.core().span_ctor;

        let closed_int = registry.method_instance(def, vec![TypeSig::I4], vec![]);
        let closed_i64 = registry.method_instance(def, vec![TypeSig::I8], vec![]);

        let id_int = registry.canonical_member(closed_int).unwrap();
        let id_i64 = registry.canonical_member(closed_i64).unwrap();
        let id_open = registry.canonical_member(def).unwrap();

        assert_eq!(id_int, id_i64);
        assert_eq!(id_int, id_open);
    }

    #[test]
    fn test_unknown_token_resolution() {
        let registry = Registry::new();
        assert!(matches!(
            registry.method(Token::new(0x0600_FFFF)),
            Err(Error::TokenNotFound(_))
        ));
    }
}
