//! Guard cache synthesis: per-type static "always allowed" fields.
//!
//! For each instrumented type the writer maintains a hidden nested holder type
//! containing one static boolean field per distinct call-site target, plus a
//! static constructor that initialises every field from the loader's
//! `can_access`/`can_call_always` predicates. A guarded site then costs a single
//! static field load and branch on the fast path.
//!
//! Cache correctness rests on the "always callable" predicate: static and
//! sealed-virtual targets resolve at load time, while overridable virtual
//! targets are pinned to `false` so their slow path always runs.

use std::sync::{Arc, OnceLock, RwLock, Weak};

use rustc_hash::FxHashMap;

use crate::{
    emulation::EmValue,
    metadata::{
        flags::{FieldAttributes, MemberVisibility, MethodModifiers, TypeModifiers, TypeVisibility},
        method::{Field, Method, NativeImpl},
        module::ModuleRc,
        registry::Registry,
        signatures::{MethodSig, TypeSig},
        token::Token,
        types::{CilType, CilTypeRc, CilTypeRef, TypeFlavor},
    },
    runtime::loader::LoaderShared,
};

/// What a guard cache field speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuardTarget {
    /// A field access site target
    Field(Token),
    /// A call site target
    Method(Token),
}

struct HolderState {
    ty: CilTypeRc,
    fields: FxHashMap<GuardTarget, Token>,
    entries: Vec<(Token, GuardTarget)>,
}

/// Synthesizes guard-cache holder types while a module is instrumented.
pub struct GuardWriter {
    registry: Arc<Registry>,
    loader: Weak<LoaderShared>,
    module: ModuleRc,
    holders: FxHashMap<Token, HolderState>,
    serial: u32,
    field_count: usize,
}

impl GuardWriter {
    /// Creates a writer for one module instrumentation pass.
    #[must_use]
    pub fn new(registry: &Arc<Registry>, loader: &Arc<LoaderShared>, module: &ModuleRc) -> Self {
        GuardWriter {
            registry: registry.clone(),
            loader: Arc::downgrade(loader),
            module: module.clone(),
            holders: FxHashMap::default(),
            serial: 0,
            field_count: 0,
        }
    }

    /// Returns the cache field for a call-site target within `owner`.
    ///
    /// Lookup is memoised: repeated asks for the same target during rewriting
    /// return the same field.
    pub fn cache_field(&mut self, owner: &CilTypeRc, target: GuardTarget) -> Token {
        if !self.holders.contains_key(&owner.token) {
            let holder = self.create_holder(owner);
            self.holders.insert(
                owner.token,
                HolderState {
                    ty: holder,
                    fields: FxHashMap::default(),
                    entries: Vec::new(),
                },
            );
        }
        let state = self
            .holders
            .get_mut(&owner.token)
            .expect("holder inserted above");

        if let Some(existing) = state.fields.get(&target) {
            return *existing;
        }

        let target_token = match target {
            GuardTarget::Field(token) | GuardTarget::Method(token) => token,
        };
        let field = Field {
            token: self.registry.alloc_field_token(),
            name: format!("allow_{:08x}", target_token.value()),
            visibility: MemberVisibility::Assembly,
            attributes: FieldAttributes::STATIC | FieldAttributes::SPECIAL_NAME,
            sig: TypeSig::Boolean,
            declaring: OnceLock::new(),
        };
        let _ = field.declaring.set(CilTypeRef::new(&state.ty));
        let token = field.token;

        let field = Arc::new(field);
        state.ty.fields.push(field.clone());
        self.registry.add_field(field);

        state.fields.insert(target, token);
        state.entries.push((token, target));
        self.field_count += 1;
        token
    }

    /// Number of cache fields created so far.
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.field_count
    }

    fn create_holder(&mut self, owner: &CilTypeRc) -> CilTypeRc {
        let holder = Arc::new(CilType {
            token: self.registry.alloc_type_token(),
            module: self.module.id,
            namespace: String::new(),
            name: format!("<GuardCache>{}", self.serial),
            visibility: TypeVisibility::NestedPrivate,
            modifiers: TypeModifiers::SEALED | TypeModifiers::SPECIAL_NAME,
            flavor: TypeFlavor::Class,
            generic_arity: 0,
            base: OnceLock::new(),
            enclosing: OnceLock::new(),
            nested: boxcar::Vec::new(),
            fields: boxcar::Vec::new(),
            methods: boxcar::Vec::new(),
            interface_map: crossbeam_skiplist::SkipMap::new(),
            method_table: OnceLock::new(),
        });
        self.serial += 1;

        let _ = holder.base.set(CilTypeRef::new(&self.registry.core().object));
        let _ = holder.enclosing.set(CilTypeRef::new(owner));

        owner.nested.push(holder.clone());
        self.module.types.push(holder.clone());
        self.registry.add_type(holder.clone());
        holder
    }

    /// Finalises every holder by attaching its static constructor.
    ///
    /// The constructor runs under the runtime's one-shot type initialisation and
    /// stores the loader's verdict for each target into its cache field. A
    /// holder whose loader has been collected initialises every field to false,
    /// forcing the slow path.
    pub fn finish(self) -> usize {
        let mut holders = 0;
        for (_, state) in self.holders {
            let entries = state.entries;
            let loader = self.loader.clone();
            let native: NativeImpl = Arc::new(move |machine: &mut crate::emulation::Machine, _call| {
                let loader = loader.upgrade();
                for (field, target) in &entries {
                    let allowed = match &loader {
                        Some(shared) => match target {
                            GuardTarget::Field(token) => shared.can_access_token(*token),
                            GuardTarget::Method(token) => shared.can_call_always_token(*token),
                        },
                        None => false,
                    };
                    machine.set_static(*field, EmValue::I32(i32::from(allowed)));
                }
                Ok(EmValue::Null)
            });

            let cctor = Method {
                token: self.registry.alloc_method_token(),
                name: ".cctor".to_string(),
                visibility: MemberVisibility::Private,
                modifiers: MethodModifiers::STATIC
                    | MethodModifiers::SPECIAL_NAME
                    | MethodModifiers::RT_SPECIAL_NAME,
                sig: MethodSig::new(Vec::new(), TypeSig::Void),
                declaring: OnceLock::new(),
                slot: OnceLock::new(),
                body: RwLock::new(None),
                native: OnceLock::new(),
            };
            let _ = cctor.declaring.set(CilTypeRef::new(&state.ty));
            let _ = cctor.native.set(native);

            let cctor = Arc::new(cctor);
            state.ty.methods.push(cctor.clone());
            self.registry.add_method(cctor);
            holders += 1;
        }
        holders
    }
}
