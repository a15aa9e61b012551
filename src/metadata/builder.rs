//! Fluent builders for modules, types, members, and method bodies.
//!
//! Hosts (and this crate's tests) construct runtime modules through these
//! builders: [`ModuleBuilder`] realises a [`TypeBuilder`] tree into linked
//! [`crate::metadata::types::CilType`] values with tokens assigned, dispatch
//! structures computed, and method bodies assembled through [`BodyAsm`].
//!
//! Bodies are written against the assembler's fluent emitters and finalised
//! with label resolution and automatic stack-depth tracking. Every body gets
//! the verifier prelude emitted up front unless explicitly omitted, mirroring
//! the guarantee the external bytecode verifier gives the rewriter.

use std::sync::{Arc, OnceLock, RwLock};

use rustc_hash::FxHashMap;

use crate::{
    assembly::{
        instruction::{Immediate, Instruction, OpCode, Operand},
        opcodes,
    },
    emulation::{EmValue, Machine, NativeCall},
    metadata::{
        flags::{
            ExceptionHandlerFlags, FieldAttributes, MemberVisibility, MethodModifiers,
            TypeModifiers, TypeVisibility,
        },
        method::{ExceptionHandler, Field, Method, MethodBody, MethodRc, NativeImpl},
        module::{Module, ModuleRc},
        registry::{CoreTypes, Registry},
        signatures::{MethodSig, TypeSig},
        token::Token,
        types::{CilType, CilTypeRc, CilTypeRef, TypeFlavor},
    },
    Error, Result,
};

type BodyFn = Box<dyn FnOnce(&mut BodyAsm) -> Result<()>>;

/// Visibility requested on a builder, mapped to the concrete encoding when the
/// nesting context is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestedVisibility {
    Module,
    Public,
    Family,
}

impl RequestedVisibility {
    fn realise(self, nested: bool) -> TypeVisibility {
        match (self, nested) {
            (RequestedVisibility::Module, false) => TypeVisibility::NotPublic,
            (RequestedVisibility::Public, false) => TypeVisibility::Public,
            (RequestedVisibility::Family, false) => TypeVisibility::NotPublic,
            (RequestedVisibility::Module, true) => TypeVisibility::NestedPrivate,
            (RequestedVisibility::Public, true) => TypeVisibility::NestedPublic,
            (RequestedVisibility::Family, true) => TypeVisibility::NestedFamily,
        }
    }
}

/// Declares a field on a [`TypeBuilder`].
pub struct FieldBuilder {
    name: String,
    sig: TypeSig,
    visibility: MemberVisibility,
    attributes: FieldAttributes,
}

impl FieldBuilder {
    /// Creates a private instance field.
    #[must_use]
    pub fn new(name: &str, sig: TypeSig) -> Self {
        FieldBuilder {
            name: name.to_string(),
            sig,
            visibility: MemberVisibility::Private,
            attributes: FieldAttributes::empty(),
        }
    }

    /// Makes the field public.
    #[must_use]
    pub fn public(mut self) -> Self {
        self.visibility = MemberVisibility::Public;
        self
    }

    /// Makes the field protected.
    #[must_use]
    pub fn family(mut self) -> Self {
        self.visibility = MemberVisibility::Family;
        self
    }

    /// Makes the field module-internal.
    #[must_use]
    pub fn assembly(mut self) -> Self {
        self.visibility = MemberVisibility::Assembly;
        self
    }

    /// Makes the field static.
    #[must_use]
    pub fn static_(mut self) -> Self {
        self.attributes |= FieldAttributes::STATIC;
        self
    }
}

/// Declares a method on a [`TypeBuilder`].
pub struct MethodBuilder {
    name: String,
    visibility: MemberVisibility,
    modifiers: MethodModifiers,
    params: Vec<TypeSig>,
    ret: TypeSig,
    generic_arity: u8,
    body_fn: Option<BodyFn>,
    native: Option<NativeImpl>,
    omit_prelude: bool,
}

impl MethodBuilder {
    /// Creates a private instance method.
    #[must_use]
    pub fn new(name: &str) -> Self {
        MethodBuilder {
            name: name.to_string(),
            visibility: MemberVisibility::Private,
            modifiers: MethodModifiers::HIDE_BY_SIG,
            params: Vec::new(),
            ret: TypeSig::Void,
            generic_arity: 0,
            body_fn: None,
            native: None,
            omit_prelude: false,
        }
    }

    /// Creates an instance constructor.
    #[must_use]
    pub fn ctor() -> Self {
        let mut builder = Self::new(".ctor");
        builder.modifiers |= MethodModifiers::SPECIAL_NAME | MethodModifiers::RT_SPECIAL_NAME;
        builder
    }

    /// Creates a type initialiser.
    #[must_use]
    pub fn cctor() -> Self {
        let mut builder = Self::new(".cctor");
        builder.modifiers |= MethodModifiers::STATIC
            | MethodModifiers::SPECIAL_NAME
            | MethodModifiers::RT_SPECIAL_NAME;
        builder
    }

    /// Makes the method public.
    #[must_use]
    pub fn public(mut self) -> Self {
        self.visibility = MemberVisibility::Public;
        self
    }

    /// Makes the method protected.
    #[must_use]
    pub fn family(mut self) -> Self {
        self.visibility = MemberVisibility::Family;
        self
    }

    /// Makes the method module-internal.
    #[must_use]
    pub fn assembly(mut self) -> Self {
        self.visibility = MemberVisibility::Assembly;
        self
    }

    /// Makes the method static.
    #[must_use]
    pub fn static_(mut self) -> Self {
        self.modifiers |= MethodModifiers::STATIC;
        self
    }

    /// Makes the method virtual.
    #[must_use]
    pub fn virtual_(mut self) -> Self {
        self.modifiers |= MethodModifiers::VIRTUAL;
        self
    }

    /// Marks a virtual method final.
    #[must_use]
    pub fn final_(mut self) -> Self {
        self.modifiers |= MethodModifiers::FINAL;
        self
    }

    /// Forces a fresh method table slot instead of overriding.
    #[must_use]
    pub fn new_slot(mut self) -> Self {
        self.modifiers |= MethodModifiers::NEW_SLOT;
        self
    }

    /// Marks the method abstract.
    #[must_use]
    pub fn abstract_(mut self) -> Self {
        self.modifiers |= MethodModifiers::ABSTRACT | MethodModifiers::VIRTUAL;
        self
    }

    /// Marks the method as forwarded to unmanaged code.
    #[must_use]
    pub fn pinvoke(mut self) -> Self {
        self.modifiers |= MethodModifiers::PINVOKE_IMPL | MethodModifiers::STATIC;
        self
    }

    /// Sets the parameter signatures.
    #[must_use]
    pub fn params(mut self, params: &[TypeSig]) -> Self {
        self.params = params.to_vec();
        self
    }

    /// Sets the return signature.
    #[must_use]
    pub fn returns(mut self, ret: TypeSig) -> Self {
        self.ret = ret;
        self
    }

    /// Declares generic parameters on the method.
    #[must_use]
    pub fn generic(mut self, arity: u8) -> Self {
        self.generic_arity = arity;
        self
    }

    /// Provides the IL body.
    #[must_use]
    pub fn body<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut BodyAsm) -> Result<()> + 'static,
    {
        self.body_fn = Some(Box::new(f));
        self
    }

    /// Provides a native implementation instead of IL.
    #[must_use]
    pub fn native_impl<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Machine, NativeCall) -> Result<EmValue> + Send + Sync + 'static,
    {
        self.native = Some(Arc::new(f));
        self
    }

    /// Skips the automatic verifier prelude, producing a body the loader must
    /// reject.
    #[must_use]
    pub fn without_verifier_prelude(mut self) -> Self {
        self.omit_prelude = true;
        self
    }
}

/// Declares a type, its members, and its nested types.
pub struct TypeBuilder {
    name: String,
    namespace: String,
    flavor: TypeFlavor,
    visibility: RequestedVisibility,
    modifiers: TypeModifiers,
    generic_arity: u8,
    base: Option<CilTypeRc>,
    extends_enclosing: bool,
    interfaces: Vec<CilTypeRc>,
    fields: Vec<FieldBuilder>,
    methods: Vec<MethodBuilder>,
    nested: Vec<TypeBuilder>,
}

impl TypeBuilder {
    fn with_flavor(name: &str, flavor: TypeFlavor) -> Self {
        TypeBuilder {
            name: name.to_string(),
            namespace: String::new(),
            flavor,
            visibility: RequestedVisibility::Module,
            modifiers: TypeModifiers::empty(),
            generic_arity: 0,
            base: None,
            extends_enclosing: false,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            nested: Vec::new(),
        }
    }

    /// Declares a class.
    #[must_use]
    pub fn class(name: &str) -> Self {
        Self::with_flavor(name, TypeFlavor::Class)
    }

    /// Declares an interface.
    #[must_use]
    pub fn interface(name: &str) -> Self {
        let mut builder = Self::with_flavor(name, TypeFlavor::Interface);
        builder.modifiers |= TypeModifiers::INTERFACE | TypeModifiers::ABSTRACT;
        builder
    }

    /// Declares a value type.
    #[must_use]
    pub fn value_type(name: &str) -> Self {
        let mut builder = Self::with_flavor(name, TypeFlavor::ValueType);
        builder.modifiers |= TypeModifiers::SEALED;
        builder
    }

    /// Declares an enum.
    #[must_use]
    pub fn enum_(name: &str) -> Self {
        let mut builder = Self::with_flavor(name, TypeFlavor::Enum);
        builder.modifiers |= TypeModifiers::SEALED;
        builder.fields.push(
            FieldBuilder::new("value__", TypeSig::I4)
                .public(),
        );
        builder
    }

    /// Declares a delegate type with the given invocation shape.
    #[must_use]
    pub fn delegate(name: &str, params: &[TypeSig], ret: TypeSig) -> Self {
        let mut builder = Self::with_flavor(name, TypeFlavor::Delegate);
        builder.modifiers |= TypeModifiers::SEALED;
        builder.methods.push(
            MethodBuilder::ctor()
                .public()
                .params(&[TypeSig::Object, TypeSig::IntPtr]),
        );
        builder.methods.push(
            MethodBuilder::new("Invoke")
                .public()
                .virtual_()
                .final_()
                .new_slot()
                .params(params)
                .returns(ret),
        );
        builder
    }

    /// Sets the namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    /// Makes the type public (or nested-public inside an enclosing type).
    #[must_use]
    pub fn public(mut self) -> Self {
        self.visibility = RequestedVisibility::Public;
        self
    }

    /// Makes a nested type visible to the enclosing type's subtypes.
    #[must_use]
    pub fn family(mut self) -> Self {
        self.visibility = RequestedVisibility::Family;
        self
    }

    /// Marks the type sealed.
    #[must_use]
    pub fn sealed(mut self) -> Self {
        self.modifiers |= TypeModifiers::SEALED;
        self
    }

    /// Marks the type abstract.
    #[must_use]
    pub fn abstract_(mut self) -> Self {
        self.modifiers |= TypeModifiers::ABSTRACT;
        self
    }

    /// Declares generic parameters on the type.
    #[must_use]
    pub fn generic(mut self, arity: u8) -> Self {
        self.generic_arity = arity;
        self
    }

    /// Sets the base type; defaults per flavor otherwise.
    #[must_use]
    pub fn extends(mut self, base: &CilTypeRc) -> Self {
        self.base = Some(base.clone());
        self
    }

    /// Makes a nested type derive from its enclosing type.
    #[must_use]
    pub fn extends_enclosing(mut self) -> Self {
        self.extends_enclosing = true;
        self
    }

    /// Declares an interface implementation; methods are matched by name and
    /// open signature when the type is realised.
    #[must_use]
    pub fn implements(mut self, interface: &CilTypeRc) -> Self {
        self.interfaces.push(interface.clone());
        self
    }

    /// Adds a field.
    #[must_use]
    pub fn field(mut self, field: FieldBuilder) -> Self {
        self.fields.push(field);
        self
    }

    /// Adds a method.
    #[must_use]
    pub fn method(mut self, method: MethodBuilder) -> Self {
        self.methods.push(method);
        self
    }

    /// Adds a nested type.
    #[must_use]
    pub fn nested(mut self, nested: TypeBuilder) -> Self {
        self.nested.push(nested);
        self
    }
}

/// Realises type builders into a module.
pub struct ModuleBuilder {
    registry: Arc<Registry>,
    module: ModuleRc,
}

struct PendingBody {
    method: MethodRc,
    declaring: CilTypeRc,
    body_fn: BodyFn,
    omit_prelude: bool,
}

impl ModuleBuilder {
    /// Creates a module with a fresh identity and registers it.
    #[must_use]
    pub fn new(registry: &Arc<Registry>, name: &str) -> Self {
        let module = Arc::new(Module::new(name, Registry::fresh_mvid()));
        registry.add_module(module.clone());
        ModuleBuilder {
            registry: registry.clone(),
            module,
        }
    }

    /// The module under construction.
    #[must_use]
    pub fn module(&self) -> &ModuleRc {
        &self.module
    }

    /// Realises one type builder tree, assembling its method bodies.
    ///
    /// # Errors
    /// Fails when an interface implementation cannot be matched, a body
    /// references an unknown member, or body assembly fails.
    pub fn define(&mut self, builder: TypeBuilder) -> Result<CilTypeRc> {
        let mut pending = Vec::new();
        let ty = self.realise(builder, None, &mut pending)?;

        for body in pending {
            let mut asm = BodyAsm::new(&self.registry, &self.module, &body.declaring);
            if !body.omit_prelude {
                asm.ldsfld(self.registry.core().verifier_probe)?;
                asm.pop()?;
            }
            (body.body_fn)(&mut asm)?;
            body.method.replace_body(asm.finish()?);
        }
        Ok(ty)
    }

    /// Finishes building and returns the module.
    #[must_use]
    pub fn build(self) -> ModuleRc {
        self.module
    }

    fn realise(
        &self,
        builder: TypeBuilder,
        enclosing: Option<&CilTypeRc>,
        pending: &mut Vec<PendingBody>,
    ) -> Result<CilTypeRc> {
        let core = self.registry.core();

        let ty = Arc::new(CilType {
            token: self.registry.alloc_type_token(),
            module: self.module.id,
            namespace: builder.namespace,
            name: builder.name,
            visibility: builder.visibility.realise(enclosing.is_some()),
            modifiers: builder.modifiers,
            flavor: builder.flavor,
            generic_arity: builder.generic_arity,
            base: OnceLock::new(),
            enclosing: OnceLock::new(),
            nested: boxcar::Vec::new(),
            fields: boxcar::Vec::new(),
            methods: boxcar::Vec::new(),
            interface_map: crossbeam_skiplist::SkipMap::new(),
            method_table: OnceLock::new(),
        });

        let base = if builder.extends_enclosing {
            enclosing.cloned()
        } else {
            builder.base.or_else(|| match builder.flavor {
                TypeFlavor::Class => Some(core.object.clone()),
                TypeFlavor::ValueType | TypeFlavor::Enum => Some(core.value_type.clone()),
                TypeFlavor::Delegate => Some(core.multicast_delegate.clone()),
                TypeFlavor::Interface => None,
            })
        };
        if let Some(base) = &base {
            let _ = ty.base.set(CilTypeRef::new(base));
        }
        if let Some(enclosing) = enclosing {
            let _ = ty.enclosing.set(CilTypeRef::new(enclosing));
            enclosing.nested.push(ty.clone());
        }
        self.registry.add_type(ty.clone());
        self.module.types.push(ty.clone());

        for field in builder.fields {
            let realised = Field {
                token: self.registry.alloc_field_token(),
                name: field.name,
                visibility: field.visibility,
                attributes: field.attributes,
                sig: field.sig,
                declaring: OnceLock::new(),
            };
            let _ = realised.declaring.set(CilTypeRef::new(&ty));
            let realised = Arc::new(realised);
            ty.fields.push(realised.clone());
            self.registry.add_field(realised);
        }

        for method in builder.methods {
            let is_static = method.modifiers.contains(MethodModifiers::STATIC);
            let realised = Method {
                token: self.registry.alloc_method_token(),
                name: method.name,
                visibility: method.visibility,
                modifiers: method.modifiers,
                sig: MethodSig {
                    has_this: !is_static,
                    generic_arity: method.generic_arity,
                    params: method.params,
                    ret: method.ret,
                },
                declaring: OnceLock::new(),
                slot: OnceLock::new(),
                body: RwLock::new(None),
                native: OnceLock::new(),
            };
            let _ = realised.declaring.set(CilTypeRef::new(&ty));
            if let Some(native) = method.native {
                let _ = realised.native.set(native);
            }
            let realised = Arc::new(realised);
            ty.methods.push(realised.clone());
            self.registry.add_method(realised.clone());

            if let Some(body_fn) = method.body_fn {
                pending.push(PendingBody {
                    method: realised,
                    declaring: ty.clone(),
                    body_fn,
                    omit_prelude: method.omit_prelude,
                });
            }
        }

        self.assign_slots(&ty)?;
        self.bind_interfaces(&ty, &builder.interfaces)?;

        for nested in builder.nested {
            self.realise(nested, Some(&ty), pending)?;
        }

        Ok(ty)
    }

    /// Computes method table slots: overriding virtuals reuse the base slot
    /// they match by name and open signature, new-slot virtuals append.
    fn assign_slots(&self, ty: &CilTypeRc) -> Result<()> {
        let mut table: Vec<Token> = ty
            .base_type()
            .map(|base| base.method_table().to_vec())
            .unwrap_or_default();

        for i in 0..ty.methods.count() {
            let Some(method) = ty.methods.get(i) else {
                continue;
            };
            if !method.is_virtual() {
                continue;
            }

            let mut slot = None;
            if !method.modifiers.contains(MethodModifiers::NEW_SLOT) {
                let open_params: Vec<TypeSig> =
                    method.sig.params.iter().map(TypeSig::open).collect();
                for (index, candidate) in table.iter().enumerate() {
                    let candidate = self.registry.method(*candidate)?;
                    let candidate_params: Vec<TypeSig> =
                        candidate.sig.params.iter().map(TypeSig::open).collect();
                    if candidate.name == method.name && candidate_params == open_params {
                        slot = Some(index);
                        break;
                    }
                }
            }

            let slot = match slot {
                Some(index) => {
                    table[index] = method.token;
                    index
                }
                None => {
                    table.push(method.token);
                    table.len() - 1
                }
            };
            let _ = method.slot.set(slot as u32);
        }

        let _ = ty.method_table.set(table);
        Ok(())
    }

    fn bind_interfaces(&self, ty: &CilTypeRc, interfaces: &[CilTypeRc]) -> Result<()> {
        for interface in interfaces {
            for i in 0..interface.methods.count() {
                let Some(declared) = interface.methods.get(i) else {
                    continue;
                };
                let open_params: Vec<TypeSig> =
                    declared.sig.params.iter().map(TypeSig::open).collect();
                let mut matched = None;
                for j in 0..ty.methods.count() {
                    if let Some(candidate) = ty.methods.get(j) {
                        let candidate_params: Vec<TypeSig> =
                            candidate.sig.params.iter().map(TypeSig::open).collect();
                        if candidate.name == declared.name && candidate_params == open_params {
                            matched = Some(candidate.token);
                            break;
                        }
                    }
                }
                let matched = matched.ok_or_else(|| Error::MemberNotFound {
                    type_name: ty.full_name(),
                    member: declared.name.clone(),
                })?;
                ty.interface_map.insert(declared.token, matched);
            }
        }
        Ok(())
    }
}

struct PendingHandler {
    flags: ExceptionHandlerFlags,
    try_start: String,
    try_end: String,
    handler_start: String,
    handler_end: String,
    handler_type: Option<Token>,
}

/// Fluent CIL assembler producing a [`MethodBody`].
///
/// Branch targets are labels resolved at [`BodyAsm::finish`]; the evaluation
/// stack depth is tracked in real time, including callee signatures for
/// call-family instructions.
pub struct BodyAsm {
    registry: Arc<Registry>,
    module: ModuleRc,
    declaring: CilTypeRc,
    instructions: Vec<Instruction>,
    labels: FxHashMap<String, usize>,
    fixups: Vec<(usize, String)>,
    locals: Vec<TypeSig>,
    handlers: Vec<PendingHandler>,
    depth: i32,
    max_depth: i32,
}

impl BodyAsm {
    fn new(registry: &Arc<Registry>, module: &ModuleRc, declaring: &CilTypeRc) -> Self {
        BodyAsm {
            registry: registry.clone(),
            module: module.clone(),
            declaring: declaring.clone(),
            instructions: Vec::new(),
            labels: FxHashMap::default(),
            fixups: Vec::new(),
            locals: Vec::new(),
            handlers: Vec::new(),
            depth: 0,
            max_depth: 0,
        }
    }

    /// Well-known core library handles.
    #[must_use]
    pub fn core(&self) -> &CoreTypes {
        self.registry.core()
    }

    /// Token of a field declared on the method's own type.
    pub fn this_field(&self, name: &str) -> Result<Token> {
        self.declaring.field_token(name)
    }

    /// Token of the unique method with the given name on the method's own type.
    pub fn this_method(&self, name: &str) -> Result<Token> {
        self.declaring.method_token(name)
    }

    /// Declares a local variable slot.
    pub fn local(&mut self, sig: TypeSig) -> u16 {
        self.locals.push(sig);
        (self.locals.len() - 1) as u16
    }

    /// Defines a label at the next emitted instruction.
    pub fn label(&mut self, name: &str) -> Result<&mut Self> {
        if self
            .labels
            .insert(name.to_string(), self.instructions.len())
            .is_some()
        {
            return Err(Error::InvalidBranch(format!("duplicate label '{name}'")));
        }
        Ok(self)
    }

    fn adjust(&mut self, net: i32) {
        self.depth += net;
        if self.depth < 0 {
            self.depth = 0;
        }
        if self.depth > self.max_depth {
            self.max_depth = self.depth;
        }
    }

    fn emit(&mut self, opcode: OpCode, operand: Operand) -> Result<&mut Self> {
        let spec = opcode
            .spec()
            .ok_or_else(|| Error::InvalidMnemonic(format!("0x{:02X}", opcode.code)))?;
        self.adjust(i32::from(spec.pushes) - i32::from(spec.pops));
        self.instructions.push(Instruction::new(opcode, operand));
        Ok(self)
    }

    fn emit_call_family(&mut self, opcode: OpCode, site: Token) -> Result<&mut Self> {
        let (method, _) = self.registry.resolve_method(site)?;
        let is_newobj = opcode.code == opcodes::NEWOBJ;
        let pops = method.sig.params.len()
            + usize::from(method.sig.has_this && !is_newobj);
        let pushes = if is_newobj {
            1
        } else {
            usize::from(!matches!(method.sig.ret, TypeSig::Void))
        };
        self.adjust(pushes as i32 - pops as i32);
        self.instructions
            .push(Instruction::new(opcode, Operand::Token(site)));
        Ok(self)
    }

    fn emit_branch(&mut self, opcode: OpCode, label: &str) -> Result<&mut Self> {
        let spec = opcode
            .spec()
            .ok_or_else(|| Error::InvalidMnemonic(format!("0x{:02X}", opcode.code)))?;
        self.adjust(i32::from(spec.pushes) - i32::from(spec.pops));
        self.fixups
            .push((self.instructions.len(), label.to_string()));
        self.instructions
            .push(Instruction::new(opcode, Operand::Target(u64::MAX)));
        Ok(self)
    }

    /// Adds a finally clause over the labelled regions.
    pub fn finally_handler(
        &mut self,
        try_start: &str,
        try_end: &str,
        handler_start: &str,
        handler_end: &str,
    ) -> &mut Self {
        self.handlers.push(PendingHandler {
            flags: ExceptionHandlerFlags::FINALLY,
            try_start: try_start.to_string(),
            try_end: try_end.to_string(),
            handler_start: handler_start.to_string(),
            handler_end: handler_end.to_string(),
            handler_type: None,
        });
        self
    }

    /// Adds a typed catch clause over the labelled regions.
    pub fn catch_handler(
        &mut self,
        try_start: &str,
        try_end: &str,
        handler_start: &str,
        handler_end: &str,
        exception_type: Option<Token>,
    ) -> &mut Self {
        self.handlers.push(PendingHandler {
            flags: ExceptionHandlerFlags::EXCEPTION,
            try_start: try_start.to_string(),
            try_end: try_end.to_string(),
            handler_start: handler_start.to_string(),
            handler_end: handler_end.to_string(),
            handler_type: exception_type,
        });
        self
    }

    fn finish(mut self) -> Result<MethodBody> {
        let mut offsets = Vec::with_capacity(self.instructions.len());
        let mut cursor = 0u64;
        for instruction in &self.instructions {
            offsets.push(cursor);
            cursor += instruction.byte_size();
        }
        let end = cursor;

        let resolve = |labels: &FxHashMap<String, usize>, name: &str| -> Result<u64> {
            let index = labels
                .get(name)
                .ok_or_else(|| Error::InvalidBranch(format!("undefined label '{name}'")))?;
            Ok(offsets.get(*index).copied().unwrap_or(end))
        };

        for (index, label) in &self.fixups {
            let target = resolve(&self.labels, label)?;
            if target >= end {
                return Err(Error::InvalidBranch(format!(
                    "label '{label}' does not name an instruction"
                )));
            }
            self.instructions[*index].operand = Operand::Target(target);
        }

        for (index, instruction) in self.instructions.iter_mut().enumerate() {
            instruction.offset = offsets[index];
        }

        let mut handlers = Vec::with_capacity(self.handlers.len());
        for pending in &self.handlers {
            let try_offset = resolve(&self.labels, &pending.try_start)? as u32;
            let try_end = resolve(&self.labels, &pending.try_end)? as u32;
            let handler_offset = resolve(&self.labels, &pending.handler_start)? as u32;
            let handler_end = resolve(&self.labels, &pending.handler_end)? as u32;
            handlers.push(ExceptionHandler {
                flags: pending.flags,
                try_offset,
                try_length: try_end.saturating_sub(try_offset),
                handler_offset,
                handler_length: handler_end.saturating_sub(handler_offset),
                handler_type: pending.handler_type,
                filter_offset: 0,
            });
        }

        Ok(MethodBody {
            max_stack: self.max_depth.max(1) as u16,
            init_locals: true,
            locals: self.locals,
            instructions: self.instructions,
            exception_handlers: handlers,
        })
    }

    // ── Plain emitters ─────────────────────────────────────────────────────

    /// `nop`
    pub fn nop(&mut self) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::NOP), Operand::None)
    }

    /// `ret`
    pub fn ret(&mut self) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::RET), Operand::None)
    }

    /// `dup`
    pub fn dup(&mut self) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::DUP), Operand::None)
    }

    /// `pop`
    pub fn pop(&mut self) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::POP), Operand::None)
    }

    /// `ldnull`
    pub fn ldnull(&mut self) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::LDNULL), Operand::None)
    }

    /// `throw`
    pub fn throw(&mut self) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::THROW), Operand::None)
    }

    /// `add`
    pub fn add(&mut self) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::ADD), Operand::None)
    }

    /// `sub`
    pub fn sub(&mut self) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::SUB), Operand::None)
    }

    /// `mul`
    pub fn mul(&mut self) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::MUL), Operand::None)
    }

    /// `ceq`
    pub fn ceq(&mut self) -> Result<&mut Self> {
        self.emit(OpCode::fe(opcodes::FE_CEQ), Operand::None)
    }

    /// `conv.u`
    pub fn conv_u(&mut self) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::CONV_U), Operand::None)
    }

    /// `localloc`
    pub fn localloc(&mut self) -> Result<&mut Self> {
        self.emit(OpCode::fe(opcodes::FE_LOCALLOC), Operand::None)
    }

    /// `endfinally`
    pub fn endfinally(&mut self) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::ENDFINALLY), Operand::None)
    }

    // ── Constants ──────────────────────────────────────────────────────────

    /// `ldc.i4` long form
    pub fn ldc_i4(&mut self, value: i32) -> Result<&mut Self> {
        self.emit(
            OpCode::new(opcodes::LDC_I4),
            Operand::Immediate(Immediate::Int32(value)),
        )
    }

    /// `ldc.i4.s`
    pub fn ldc_i4_s(&mut self, value: i8) -> Result<&mut Self> {
        self.emit(
            OpCode::new(opcodes::LDC_I4_S),
            Operand::Immediate(Immediate::Int8(value)),
        )
    }

    /// Loads an `int32` constant in its shortest encoding.
    pub fn ldc_i4_const(&mut self, value: i32) -> Result<&mut Self> {
        match value {
            -1..=8 => {
                let code = (opcodes::LDC_I4_0 as i32 + value) as u8;
                self.emit(OpCode::new(code), Operand::None)
            }
            _ if i8::try_from(value).is_ok() => self.ldc_i4_s(value as i8),
            _ => self.ldc_i4(value),
        }
    }

    /// `ldc.i8`
    pub fn ldc_i8(&mut self, value: i64) -> Result<&mut Self> {
        self.emit(
            OpCode::new(opcodes::LDC_I8),
            Operand::Immediate(Immediate::Int64(value)),
        )
    }

    // ── Arguments and locals ───────────────────────────────────────────────

    /// `ldarg.0`
    pub fn ldarg_0(&mut self) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::LDARG_0), Operand::None)
    }

    /// `ldarg.1`
    pub fn ldarg_1(&mut self) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::LDARG_1), Operand::None)
    }

    /// `ldarg.2`
    pub fn ldarg_2(&mut self) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::LDARG_2), Operand::None)
    }

    /// `ldarg.3`
    pub fn ldarg_3(&mut self) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::LDARG_3), Operand::None)
    }

    /// `ldarg` long form
    pub fn ldarg(&mut self, index: u16) -> Result<&mut Self> {
        self.emit(OpCode::fe(opcodes::FE_LDARG), Operand::Argument(index))
    }

    /// `ldarg.s`
    pub fn ldarg_s(&mut self, index: u8) -> Result<&mut Self> {
        self.emit(
            OpCode::new(opcodes::LDARG_S),
            Operand::Argument(u16::from(index)),
        )
    }

    /// `ldloc.0`
    pub fn ldloc_0(&mut self) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::LDLOC_0), Operand::None)
    }

    /// `ldloc.1`
    pub fn ldloc_1(&mut self) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::LDLOC_1), Operand::None)
    }

    /// `stloc.0`
    pub fn stloc_0(&mut self) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::STLOC_0), Operand::None)
    }

    /// `stloc.1`
    pub fn stloc_1(&mut self) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::STLOC_1), Operand::None)
    }

    /// `ldloc.s`
    pub fn ldloc_s(&mut self, index: u8) -> Result<&mut Self> {
        self.emit(
            OpCode::new(opcodes::LDLOC_S),
            Operand::Local(u16::from(index)),
        )
    }

    /// `stloc.s`
    pub fn stloc_s(&mut self, index: u8) -> Result<&mut Self> {
        self.emit(
            OpCode::new(opcodes::STLOC_S),
            Operand::Local(u16::from(index)),
        )
    }

    /// `ldloc` long form
    pub fn ldloc(&mut self, index: u16) -> Result<&mut Self> {
        self.emit(OpCode::fe(opcodes::FE_LDLOC), Operand::Local(index))
    }

    /// `stloc` long form
    pub fn stloc(&mut self, index: u16) -> Result<&mut Self> {
        self.emit(OpCode::fe(opcodes::FE_STLOC), Operand::Local(index))
    }

    // ── Fields ─────────────────────────────────────────────────────────────

    /// `ldsfld`
    pub fn ldsfld(&mut self, field: Token) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::LDSFLD), Operand::Token(field))
    }

    /// `stsfld`
    pub fn stsfld(&mut self, field: Token) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::STSFLD), Operand::Token(field))
    }

    /// `ldfld`
    pub fn ldfld(&mut self, field: Token) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::LDFLD), Operand::Token(field))
    }

    /// `stfld`
    pub fn stfld(&mut self, field: Token) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::STFLD), Operand::Token(field))
    }

    // ── Calls, tokens, and strings ─────────────────────────────────────────

    /// `call`
    pub fn call(&mut self, site: Token) -> Result<&mut Self> {
        self.emit_call_family(OpCode::new(opcodes::CALL), site)
    }

    /// `callvirt`
    pub fn callvirt(&mut self, site: Token) -> Result<&mut Self> {
        self.emit_call_family(OpCode::new(opcodes::CALLVIRT), site)
    }

    /// `newobj`
    pub fn newobj(&mut self, ctor: Token) -> Result<&mut Self> {
        self.emit_call_family(OpCode::new(opcodes::NEWOBJ), ctor)
    }

    /// `constrained.` prefix
    pub fn constrained(&mut self, ty: Token) -> Result<&mut Self> {
        self.emit(OpCode::fe(opcodes::FE_CONSTRAINED), Operand::Token(ty))
    }

    /// `ldftn`
    pub fn ldftn(&mut self, method: Token) -> Result<&mut Self> {
        self.emit(OpCode::fe(opcodes::FE_LDFTN), Operand::Token(method))
    }

    /// `ldvirtftn`
    pub fn ldvirtftn(&mut self, method: Token) -> Result<&mut Self> {
        self.emit(OpCode::fe(opcodes::FE_LDVIRTFTN), Operand::Token(method))
    }

    /// `ldtoken`
    pub fn ldtoken(&mut self, token: Token) -> Result<&mut Self> {
        self.emit(OpCode::new(opcodes::LDTOKEN), Operand::Token(token))
    }

    /// `ldstr`, interning the text in the declaring module
    pub fn ldstr(&mut self, text: &str) -> Result<&mut Self> {
        let token = self.module.intern_string(text);
        self.emit(OpCode::new(opcodes::LDSTR), Operand::Token(token))
    }

    // ── Branches ───────────────────────────────────────────────────────────

    /// `br`
    pub fn br(&mut self, label: &str) -> Result<&mut Self> {
        self.emit_branch(OpCode::new(opcodes::BR), label)
    }

    /// `br.s`
    pub fn br_s(&mut self, label: &str) -> Result<&mut Self> {
        self.emit_branch(OpCode::new(opcodes::BR_S), label)
    }

    /// `brtrue`
    pub fn brtrue(&mut self, label: &str) -> Result<&mut Self> {
        self.emit_branch(OpCode::new(opcodes::BRTRUE), label)
    }

    /// `brtrue.s`
    pub fn brtrue_s(&mut self, label: &str) -> Result<&mut Self> {
        self.emit_branch(OpCode::new(opcodes::BRTRUE_S), label)
    }

    /// `brfalse`
    pub fn brfalse(&mut self, label: &str) -> Result<&mut Self> {
        self.emit_branch(OpCode::new(opcodes::BRFALSE), label)
    }

    /// `brfalse.s`
    pub fn brfalse_s(&mut self, label: &str) -> Result<&mut Self> {
        self.emit_branch(OpCode::new(opcodes::BRFALSE_S), label)
    }

    /// `beq.s`
    pub fn beq_s(&mut self, label: &str) -> Result<&mut Self> {
        self.emit_branch(OpCode::new(opcodes::BEQ_S), label)
    }

    /// `leave`
    pub fn leave(&mut self, label: &str) -> Result<&mut Self> {
        self.emit_branch(OpCode::new(opcodes::LEAVE), label)
    }

    /// `leave.s`
    pub fn leave_s(&mut self, label: &str) -> Result<&mut Self> {
        self.emit_branch(OpCode::new(opcodes::LEAVE_S), label)
    }
}
