//! Evaluation-stack interpreter over the runtime metadata model.
//!
//! [`Machine`] is the controlled execution environment the sandbox runs inside:
//! it owns the managed heap, per-type static storage, one-shot type
//! initialisation, and the frame stack that records which module each executing
//! method belongs to. That frame stack is what the guard entry points consult
//! as the calling-assembly primitive.
//!
//! The interpreter covers the instruction families the instrumentor emits and
//! the bodies the builders produce. Native methods (runtime intrinsics, guard
//! cache initialisers, host stubs) execute in the caller's frame, so a native
//! guard always observes the sandboxed module that invoked it.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    assembly::{instruction::Operand, opcodes},
    emulation::value::{EmValue, HeapRef, NativeCall},
    metadata::{
        identity::ModuleId,
        method::{MethodBody, MethodRc},
        registry::{MethodInstantiation, Registry},
        signatures::TypeSig,
        token::Token,
        types::TypeFlavor,
    },
    runtime::dispatch::{resolve_virtual, ReceiverKind},
    Error, Result,
};

use std::sync::Arc;

const MAX_CALL_DEPTH: usize = 128;

/// Heap object storage.
#[derive(Debug, Clone)]
pub enum ObjData {
    /// An ordinary object instance
    Instance {
        /// Token of the object's type
        ty: Token,
        /// Instance field storage
        fields: FxHashMap<Token, EmValue>,
    },
    /// A bound delegate
    Delegate {
        /// Call-site token of the delegate's target method
        method: Token,
        /// Bound receiver, `Null` for static targets
        receiver: EmValue,
    },
    /// A single-dimensional, zero-based array
    Array {
        /// Element type
        element: TypeSig,
        /// Element storage
        items: Vec<EmValue>,
    },
}

/// The execution engine.
pub struct Machine {
    registry: Arc<Registry>,
    heap: Vec<ObjData>,
    statics: FxHashMap<Token, EmValue>,
    initialized: FxHashSet<Token>,
    frames: Vec<ModuleId>,
    depth: usize,
}

impl Machine {
    /// Creates a machine over a registry.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Machine {
            registry,
            heap: Vec::new(),
            statics: FxHashMap::default(),
            initialized: FxHashSet::default(),
            frames: Vec::new(),
            depth: 0,
        }
    }

    /// The registry this machine executes against.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Identity of the module owning the executing frame.
    ///
    /// Host-driven calls with no managed frame report the core library, which
    /// has no loader registered and is therefore trusted.
    #[must_use]
    pub fn current_module(&self) -> ModuleId {
        self.frames
            .last()
            .copied()
            .unwrap_or_else(|| self.registry.core().module.id)
    }

    /// Allocates a heap object.
    pub fn alloc(&mut self, data: ObjData) -> HeapRef {
        self.heap.push(data);
        HeapRef(self.heap.len() - 1)
    }

    /// Allocates an array value.
    pub fn alloc_array(&mut self, element: TypeSig, items: Vec<EmValue>) -> EmValue {
        EmValue::Obj(self.alloc(ObjData::Array { element, items }))
    }

    /// Allocates a bound delegate value.
    pub fn alloc_delegate(&mut self, method: Token, receiver: EmValue) -> EmValue {
        EmValue::Obj(self.alloc(ObjData::Delegate { method, receiver }))
    }

    /// Reads a heap object.
    #[must_use]
    pub fn heap_object(&self, reference: HeapRef) -> Option<&ObjData> {
        self.heap.get(reference.0)
    }

    /// Mutable access to a heap object.
    pub fn heap_object_mut(&mut self, reference: HeapRef) -> Option<&mut ObjData> {
        self.heap.get_mut(reference.0)
    }

    /// Stores a static field value directly.
    pub fn set_static(&mut self, field: Token, value: EmValue) {
        self.statics.insert(field, value);
    }

    /// Reads a static field, running the declaring type's initialiser first.
    pub fn read_static(&mut self, field: Token) -> Result<EmValue> {
        let registry = self.registry.clone();
        let field_def = registry.field(field)?;
        let declaring = field_def
            .declaring_type()
            .ok_or(Error::TokenNotFound(field))?;
        self.ensure_initialized(declaring.token)?;
        Ok(self
            .statics
            .get(&field)
            .cloned()
            .unwrap_or_else(|| EmValue::default_for(&field_def.sig)))
    }

    /// Classifies a value as a dispatch receiver.
    pub fn receiver_kind(&self, value: &EmValue) -> Result<ReceiverKind> {
        let core = self.registry.core();
        match value {
            EmValue::Null => Ok(ReceiverKind::Null),
            EmValue::Str(_) => Ok(ReceiverKind::Instance(core.string.clone())),
            EmValue::Span { .. } => Ok(ReceiverKind::Instance(core.span.clone())),
            EmValue::Obj(reference) => match self.heap_object(*reference) {
                Some(ObjData::Instance { ty, .. }) => {
                    Ok(ReceiverKind::Instance(self.registry.ty(*ty)?))
                }
                Some(ObjData::Delegate { .. }) => {
                    Ok(ReceiverKind::Instance(core.multicast_delegate.clone()))
                }
                Some(ObjData::Array { element, .. }) => {
                    Ok(ReceiverKind::SzArray(element.clone()))
                }
                None => Err(Error::Execution("dangling heap reference".to_string())),
            },
            other => Err(Error::Execution(format!(
                "value {other:?} has no receiver type"
            ))),
        }
    }

    /// Invokes a method by call-site token.
    pub fn call_method(&mut self, site: Token, args: Vec<EmValue>) -> Result<EmValue> {
        let registry = self.registry.clone();
        let (method, instantiation) = registry.resolve_method(site)?;
        self.invoke(&method, instantiation.as_ref(), args)
    }

    /// Invokes a resolved method.
    pub fn invoke(
        &mut self,
        method: &MethodRc,
        instantiation: Option<&MethodInstantiation>,
        args: Vec<EmValue>,
    ) -> Result<EmValue> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(Error::RecursionLimit(MAX_CALL_DEPTH));
        }
        self.depth += 1;
        let result = self.invoke_inner(method, instantiation, args);
        self.depth -= 1;
        result
    }

    fn invoke_inner(
        &mut self,
        method: &MethodRc,
        instantiation: Option<&MethodInstantiation>,
        args: Vec<EmValue>,
    ) -> Result<EmValue> {
        if let Some(native) = method.native() {
            // Natives execute in the caller's frame; guards read the calling
            // module from there.
            let call = NativeCall {
                args,
                type_args: instantiation.map(|i| i.type_args.clone()).unwrap_or_default(),
                method_args: instantiation
                    .map(|i| i.method_args.clone())
                    .unwrap_or_default(),
            };
            return native(self, call);
        }

        let body = method.body().ok_or_else(|| {
            Error::Execution(format!("method '{}' has no implementation", method.full_name()))
        })?;
        let module = method
            .declaring_type()
            .map(|ty| ty.module)
            .ok_or_else(|| Error::Execution("method without declaring type".to_string()))?;

        self.frames.push(module);
        let result = self.exec_body(method, &body, args);
        self.frames.pop();
        result
    }

    /// Runs a type's static initialiser exactly once.
    pub fn ensure_initialized(&mut self, ty: Token) -> Result<()> {
        if !self.initialized.insert(ty) {
            return Ok(());
        }
        let registry = self.registry.clone();
        let ty = registry.ty(ty)?;
        let mut cctor = None;
        for i in 0..ty.methods.count() {
            if let Some(method) = ty.methods.get(i) {
                if method.is_cctor() {
                    cctor = Some(method.clone());
                    break;
                }
            }
        }
        if let Some(cctor) = cctor {
            self.invoke(&cctor, None, Vec::new())?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn exec_body(
        &mut self,
        method: &MethodRc,
        body: &Arc<MethodBody>,
        mut args: Vec<EmValue>,
    ) -> Result<EmValue> {
        let registry = self.registry.clone();
        let module_id = self.current_module();

        let mut locals: Vec<EmValue> = body.locals.iter().map(EmValue::default_for).collect();
        let mut stack: Vec<EmValue> = Vec::with_capacity(usize::from(body.max_stack));

        let mut index_of: FxHashMap<u64, usize> = FxHashMap::default();
        for (index, instruction) in body.instructions.iter().enumerate() {
            index_of.insert(instruction.offset, index);
        }
        let jump = |target: u64| -> Result<usize> {
            index_of.get(&target).copied().ok_or_else(|| {
                Error::Execution(format!("branch into unmapped offset {target}"))
            })
        };

        let mut pc = 0usize;
        while pc < body.instructions.len() {
            let instruction = &body.instructions[pc];
            let mut next = pc + 1;

            match (instruction.opcode.prefix, instruction.opcode.code) {
                (0, opcodes::NOP) => {}
                (0xFE, opcodes::FE_CONSTRAINED | opcodes::FE_VOLATILE | opcodes::FE_TAIL) => {
                    // Prefix semantics are folded into the principal instruction.
                }
                (0, opcodes::DUP) => {
                    let top = pop(&mut stack)?;
                    stack.push(top.clone());
                    stack.push(top);
                }
                (0, opcodes::POP) => {
                    pop(&mut stack)?;
                }
                (0, opcodes::LDNULL) => stack.push(EmValue::Null),
                (0, code @ opcodes::LDC_I4_M1..=opcodes::LDC_I4_8) => {
                    stack.push(EmValue::I32(i32::from(code) - i32::from(opcodes::LDC_I4_0)));
                }
                (0, opcodes::LDC_I4_S) => match &instruction.operand {
                    Operand::Immediate(crate::assembly::Immediate::Int8(value)) => {
                        stack.push(EmValue::I32(i32::from(*value)));
                    }
                    other => return exec_fault(instruction.mnemonic(), other),
                },
                (0, opcodes::LDC_I4) => match &instruction.operand {
                    Operand::Immediate(crate::assembly::Immediate::Int32(value)) => {
                        stack.push(EmValue::I32(*value));
                    }
                    other => return exec_fault(instruction.mnemonic(), other),
                },
                (0, opcodes::LDC_I8) => match &instruction.operand {
                    Operand::Immediate(crate::assembly::Immediate::Int64(value)) => {
                        stack.push(EmValue::I64(*value));
                    }
                    other => return exec_fault(instruction.mnemonic(), other),
                },
                (0, opcodes::LDC_R4) => match &instruction.operand {
                    Operand::Immediate(crate::assembly::Immediate::Float32(value)) => {
                        stack.push(EmValue::F64(f64::from(*value)));
                    }
                    other => return exec_fault(instruction.mnemonic(), other),
                },
                (0, opcodes::LDC_R8) => match &instruction.operand {
                    Operand::Immediate(crate::assembly::Immediate::Float64(value)) => {
                        stack.push(EmValue::F64(*value));
                    }
                    other => return exec_fault(instruction.mnemonic(), other),
                },
                (0, code @ opcodes::LDARG_0..=opcodes::LDARG_3) => {
                    let index = usize::from(code - opcodes::LDARG_0);
                    stack.push(arg_at(&args, index)?);
                }
                (0, opcodes::LDARG_S) | (0xFE, opcodes::FE_LDARG) => {
                    let index = argument_index(instruction)?;
                    stack.push(arg_at(&args, index)?);
                }
                (0, opcodes::STARG_S) | (0xFE, opcodes::FE_STARG) => {
                    let index = argument_index(instruction)?;
                    let value = pop(&mut stack)?;
                    if index >= args.len() {
                        return Err(Error::Execution(format!(
                            "argument index {index} out of range"
                        )));
                    }
                    args[index] = value;
                }
                (0, code @ opcodes::LDLOC_0..=opcodes::LDLOC_3) => {
                    let index = usize::from(code - opcodes::LDLOC_0);
                    stack.push(local_at(&locals, index)?);
                }
                (0, opcodes::LDLOC_S) | (0xFE, opcodes::FE_LDLOC) => {
                    let index = local_index(instruction)?;
                    stack.push(local_at(&locals, index)?);
                }
                (0, code @ opcodes::STLOC_0..=opcodes::STLOC_3) => {
                    let index = usize::from(code - opcodes::STLOC_0);
                    store_local(&mut locals, index, pop(&mut stack)?)?;
                }
                (0, opcodes::STLOC_S) | (0xFE, opcodes::FE_STLOC) => {
                    let index = local_index(instruction)?;
                    store_local(&mut locals, index, pop(&mut stack)?)?;
                }
                (0, opcodes::ADD | opcodes::SUB | opcodes::MUL) => {
                    let rhs = pop(&mut stack)?;
                    let lhs = pop(&mut stack)?;
                    stack.push(arith(instruction.opcode.code, &lhs, &rhs)?);
                }
                (0xFE, opcodes::FE_CEQ) => {
                    let rhs = pop(&mut stack)?;
                    let lhs = pop(&mut stack)?;
                    stack.push(EmValue::I32(i32::from(values_equal(&lhs, &rhs))));
                }
                (0xFE, opcodes::FE_CGT) => {
                    let rhs = pop(&mut stack)?;
                    let lhs = pop(&mut stack)?;
                    stack.push(EmValue::I32(i32::from(
                        compare(&lhs, &rhs)? == std::cmp::Ordering::Greater,
                    )));
                }
                (0xFE, opcodes::FE_CLT) => {
                    let rhs = pop(&mut stack)?;
                    let lhs = pop(&mut stack)?;
                    stack.push(EmValue::I32(i32::from(
                        compare(&lhs, &rhs)? == std::cmp::Ordering::Less,
                    )));
                }
                (0, opcodes::CONV_I | opcodes::CONV_U) => {
                    // Width conversions are value-preserving in this model.
                }
                (0, opcodes::LDSTR) => {
                    let token = token_operand(instruction)?;
                    let module = registry.module(module_id).ok_or_else(|| {
                        Error::Execution(format!("module {module_id} is not registered"))
                    })?;
                    let text = module
                        .user_string(token)
                        .ok_or_else(|| Error::Execution(format!("unknown string {token}")))?;
                    stack.push(EmValue::Str(text));
                }
                (0, opcodes::LDTOKEN) => {
                    stack.push(EmValue::Token(token_operand(instruction)?));
                }
                (0xFE, opcodes::FE_LDFTN) => {
                    stack.push(EmValue::Token(token_operand(instruction)?));
                }
                (0xFE, opcodes::FE_LDVIRTFTN) => {
                    let token = token_operand(instruction)?;
                    let receiver = pop(&mut stack)?;
                    let (declared, _) = registry.resolve_method(token)?;
                    let kind = self.receiver_kind(&receiver)?;
                    let resolved = resolve_virtual(&registry, &kind, &declared)?;
                    stack.push(EmValue::Token(resolved.token));
                }
                (0xFE, opcodes::FE_LOCALLOC) => {
                    let bytes = pop(&mut stack)?.as_i32()?;
                    let bytes = u32::try_from(bytes)
                        .map_err(|_| Error::Execution("negative stack allocation".to_string()))?;
                    stack.push(EmValue::StackMem { bytes });
                }
                (0, opcodes::LDFLD) => {
                    let token = token_operand(instruction)?;
                    let receiver = pop(&mut stack)?;
                    stack.push(self.load_instance_field(&receiver, token)?);
                }
                (0, opcodes::STFLD) => {
                    let token = token_operand(instruction)?;
                    let value = pop(&mut stack)?;
                    let receiver = pop(&mut stack)?;
                    self.store_instance_field(&receiver, token, value)?;
                }
                (0, opcodes::LDSFLD) => {
                    let token = token_operand(instruction)?;
                    stack.push(self.read_static(token)?);
                }
                (0, opcodes::STSFLD) => {
                    let token = token_operand(instruction)?;
                    let registry = registry.clone();
                    let field = registry.field(token)?;
                    let declaring = field
                        .declaring_type()
                        .ok_or(Error::TokenNotFound(token))?;
                    self.ensure_initialized(declaring.token)?;
                    let value = pop(&mut stack)?;
                    self.statics.insert(token, value);
                }
                (0, opcodes::LDFLDA | opcodes::LDSFLDA) => {
                    return Err(Error::Execution(
                        "field address loads are not supported by this engine".to_string(),
                    ));
                }
                (0, opcodes::CALL) => {
                    let token = token_operand(instruction)?;
                    self.exec_call(token, false, &mut stack)?;
                }
                (0, opcodes::CALLVIRT) => {
                    let token = token_operand(instruction)?;
                    self.exec_call(token, true, &mut stack)?;
                }
                (0, opcodes::NEWOBJ) => {
                    let token = token_operand(instruction)?;
                    self.exec_newobj(token, &mut stack)?;
                }
                (0, opcodes::RET) => {
                    return if matches!(method.sig.ret, TypeSig::Void) {
                        Ok(EmValue::Null)
                    } else {
                        pop(&mut stack)
                    };
                }
                (0, opcodes::THROW) => {
                    let value = pop(&mut stack)?;
                    return Err(Error::Execution(format!(
                        "unhandled exception thrown: {value:?}"
                    )));
                }
                (0, opcodes::BR | opcodes::BR_S | opcodes::LEAVE | opcodes::LEAVE_S) => {
                    next = jump(target_operand(instruction)?)?;
                }
                (0, opcodes::BRTRUE | opcodes::BRTRUE_S) => {
                    if pop(&mut stack)?.is_truthy() {
                        next = jump(target_operand(instruction)?)?;
                    }
                }
                (0, opcodes::BRFALSE | opcodes::BRFALSE_S) => {
                    if !pop(&mut stack)?.is_truthy() {
                        next = jump(target_operand(instruction)?)?;
                    }
                }
                (0, opcodes::BEQ | opcodes::BEQ_S) => {
                    let rhs = pop(&mut stack)?;
                    let lhs = pop(&mut stack)?;
                    if values_equal(&lhs, &rhs) {
                        next = jump(target_operand(instruction)?)?;
                    }
                }
                (0, opcodes::BNE_UN | opcodes::BNE_UN_S) => {
                    let rhs = pop(&mut stack)?;
                    let lhs = pop(&mut stack)?;
                    if !values_equal(&lhs, &rhs) {
                        next = jump(target_operand(instruction)?)?;
                    }
                }
                (0, opcodes::BLT | opcodes::BLT_S) => {
                    let rhs = pop(&mut stack)?;
                    let lhs = pop(&mut stack)?;
                    if compare(&lhs, &rhs)? == std::cmp::Ordering::Less {
                        next = jump(target_operand(instruction)?)?;
                    }
                }
                (0, opcodes::BGT | opcodes::BGT_S) => {
                    let rhs = pop(&mut stack)?;
                    let lhs = pop(&mut stack)?;
                    if compare(&lhs, &rhs)? == std::cmp::Ordering::Greater {
                        next = jump(target_operand(instruction)?)?;
                    }
                }
                (0, opcodes::SWITCH) => {
                    let selector = pop(&mut stack)?.as_i32()?;
                    if let Operand::Switch(targets) = &instruction.operand {
                        if let Ok(index) = usize::try_from(selector) {
                            if let Some(target) = targets.get(index) {
                                next = jump(*target)?;
                            }
                        }
                    }
                }
                _ => {
                    return Err(Error::Execution(format!(
                        "instruction '{}' is not supported by this engine",
                        instruction.mnemonic()
                    )))
                }
            }

            pc = next;
        }

        Err(Error::Execution(format!(
            "method '{}' fell through without returning",
            method.full_name()
        )))
    }

    fn exec_call(
        &mut self,
        site: Token,
        virtual_dispatch: bool,
        stack: &mut Vec<EmValue>,
    ) -> Result<()> {
        let registry = self.registry.clone();
        let (declared, instantiation) = registry.resolve_method(site)?;

        let argc = declared.sig.params.len() + usize::from(declared.sig.has_this);
        let mut call_args = split_args(stack, argc)?;

        // Delegate invocation routes through the bound target.
        if declared.sig.has_this && declared.name == "Invoke" {
            if let Some(EmValue::Obj(reference)) = call_args.first() {
                if let Some(ObjData::Delegate { method, receiver }) =
                    self.heap_object(*reference).cloned()
                {
                    call_args.remove(0);
                    let result = self.invoke_delegate(method, receiver, call_args)?;
                    if !matches!(declared.sig.ret, TypeSig::Void) {
                        stack.push(result);
                    }
                    return Ok(());
                }
            }
        }

        let target = if virtual_dispatch && declared.sig.has_this {
            let receiver = call_args
                .first()
                .ok_or_else(|| Error::Execution("virtual call without receiver".to_string()))?;
            let kind = self.receiver_kind(receiver)?;
            resolve_virtual(&registry, &kind, &declared)?
        } else {
            declared.clone()
        };

        let result = self.invoke(&target, instantiation.as_ref(), call_args)?;
        if !matches!(target.sig.ret, TypeSig::Void) {
            stack.push(result);
        }
        Ok(())
    }

    fn invoke_delegate(
        &mut self,
        site: Token,
        receiver: EmValue,
        mut args: Vec<EmValue>,
    ) -> Result<EmValue> {
        let registry = self.registry.clone();
        let (target, instantiation) = registry.resolve_method(site)?;
        if target.sig.has_this {
            args.insert(0, receiver);
        }
        self.invoke(&target, instantiation.as_ref(), args)
    }

    fn exec_newobj(&mut self, site: Token, stack: &mut Vec<EmValue>) -> Result<()> {
        let registry = self.registry.clone();
        let (ctor, instantiation) = registry.resolve_method(site)?;
        let declaring = ctor
            .declaring_type()
            .ok_or(Error::TokenNotFound(site))?;

        let argc = ctor.sig.params.len();
        let call_args = split_args(stack, argc)?;

        match declaring.flavor {
            TypeFlavor::Delegate => {
                let mut iter = call_args.into_iter();
                let receiver = iter
                    .next()
                    .ok_or_else(|| Error::Execution("delegate constructor without target".to_string()))?;
                let method = match iter.next() {
                    Some(EmValue::Token(token)) => token,
                    other => {
                        return Err(Error::Execution(format!(
                            "delegate constructor expects a function pointer, got {other:?}"
                        )))
                    }
                };
                let delegate = self.alloc_delegate(method, receiver);
                stack.push(delegate);
            }
            TypeFlavor::ValueType if ctor.native().is_some() => {
                // Value-type intrinsic constructors return the value directly.
                let result = self.invoke(&ctor, instantiation.as_ref(), call_args)?;
                stack.push(result);
            }
            _ => {
                let reference = self.alloc(ObjData::Instance {
                    ty: declaring.token,
                    fields: FxHashMap::default(),
                });
                let mut ctor_args = Vec::with_capacity(argc + 1);
                ctor_args.push(EmValue::Obj(reference));
                ctor_args.extend(call_args);
                self.invoke(&ctor, instantiation.as_ref(), ctor_args)?;
                stack.push(EmValue::Obj(reference));
            }
        }
        Ok(())
    }

    fn load_instance_field(&mut self, receiver: &EmValue, field: Token) -> Result<EmValue> {
        let registry = self.registry.clone();
        let field_def = registry.field(field)?;
        match receiver {
            EmValue::Obj(reference) => match self.heap.get(reference.0) {
                Some(ObjData::Instance { fields, .. }) => Ok(fields
                    .get(&field)
                    .cloned()
                    .unwrap_or_else(|| EmValue::default_for(&field_def.sig))),
                _ => Err(Error::Execution("field load on non-instance".to_string())),
            },
            EmValue::Null => Err(Error::Execution(
                "null reference on field access".to_string(),
            )),
            other => Err(Error::Execution(format!(
                "field load on value {other:?}"
            ))),
        }
    }

    fn store_instance_field(
        &mut self,
        receiver: &EmValue,
        field: Token,
        value: EmValue,
    ) -> Result<()> {
        match receiver {
            EmValue::Obj(reference) => match self.heap.get_mut(reference.0) {
                Some(ObjData::Instance { fields, .. }) => {
                    fields.insert(field, value);
                    Ok(())
                }
                _ => Err(Error::Execution("field store on non-instance".to_string())),
            },
            EmValue::Null => Err(Error::Execution(
                "null reference on field access".to_string(),
            )),
            other => Err(Error::Execution(format!(
                "field store on value {other:?}"
            ))),
        }
    }
}

fn pop(stack: &mut Vec<EmValue>) -> Result<EmValue> {
    stack
        .pop()
        .ok_or_else(|| Error::Execution("evaluation stack underflow".to_string()))
}

fn split_args(stack: &mut Vec<EmValue>, count: usize) -> Result<Vec<EmValue>> {
    if stack.len() < count {
        return Err(Error::Execution(
            "evaluation stack underflow on call".to_string(),
        ));
    }
    Ok(stack.split_off(stack.len() - count))
}

fn arg_at(args: &[EmValue], index: usize) -> Result<EmValue> {
    args.get(index)
        .cloned()
        .ok_or_else(|| Error::Execution(format!("argument index {index} out of range")))
}

fn local_at(locals: &[EmValue], index: usize) -> Result<EmValue> {
    locals
        .get(index)
        .cloned()
        .ok_or_else(|| Error::Execution(format!("local index {index} out of range")))
}

fn store_local(locals: &mut [EmValue], index: usize, value: EmValue) -> Result<()> {
    let slot = locals
        .get_mut(index)
        .ok_or_else(|| Error::Execution(format!("local index {index} out of range")))?;
    *slot = value;
    Ok(())
}

fn argument_index(instruction: &crate::assembly::Instruction) -> Result<usize> {
    match &instruction.operand {
        Operand::Argument(index) => Ok(usize::from(*index)),
        other => exec_fault(instruction.mnemonic(), other),
    }
}

fn local_index(instruction: &crate::assembly::Instruction) -> Result<usize> {
    match &instruction.operand {
        Operand::Local(index) => Ok(usize::from(*index)),
        other => exec_fault(instruction.mnemonic(), other),
    }
}

fn token_operand(instruction: &crate::assembly::Instruction) -> Result<Token> {
    instruction
        .token()
        .ok_or_else(|| Error::Execution(format!("{} without token operand", instruction.mnemonic())))
}

fn target_operand(instruction: &crate::assembly::Instruction) -> Result<u64> {
    instruction.target().ok_or_else(|| {
        Error::Execution(format!("{} without branch target", instruction.mnemonic()))
    })
}

fn exec_fault<T>(mnemonic: &str, operand: &Operand) -> Result<T> {
    Err(Error::Execution(format!(
        "{mnemonic} with unexpected operand {operand:?}"
    )))
}

fn arith(code: u8, lhs: &EmValue, rhs: &EmValue) -> Result<EmValue> {
    match (lhs, rhs) {
        (EmValue::I32(a), EmValue::I32(b)) => Ok(match code {
            opcodes::ADD => EmValue::I32(a.wrapping_add(*b)),
            opcodes::SUB => EmValue::I32(a.wrapping_sub(*b)),
            _ => EmValue::I32(a.wrapping_mul(*b)),
        }),
        (EmValue::I64(a), EmValue::I64(b)) => Ok(match code {
            opcodes::ADD => EmValue::I64(a.wrapping_add(*b)),
            opcodes::SUB => EmValue::I64(a.wrapping_sub(*b)),
            _ => EmValue::I64(a.wrapping_mul(*b)),
        }),
        (EmValue::F64(a), EmValue::F64(b)) => Ok(match code {
            opcodes::ADD => EmValue::F64(a + b),
            opcodes::SUB => EmValue::F64(a - b),
            _ => EmValue::F64(a * b),
        }),
        _ => Err(Error::Execution(format!(
            "arithmetic on mismatched operands {lhs:?} and {rhs:?}"
        ))),
    }
}

fn values_equal(lhs: &EmValue, rhs: &EmValue) -> bool {
    match (lhs, rhs) {
        (EmValue::Null, EmValue::Null) => true,
        (EmValue::I32(a), EmValue::I32(b)) => a == b,
        (EmValue::I64(a), EmValue::I64(b)) => a == b,
        (EmValue::F64(a), EmValue::F64(b)) => a == b,
        (EmValue::Str(a), EmValue::Str(b)) => a == b,
        (EmValue::Obj(a), EmValue::Obj(b)) => a == b,
        (EmValue::Token(a), EmValue::Token(b)) => a == b,
        _ => false,
    }
}

fn compare(lhs: &EmValue, rhs: &EmValue) -> Result<std::cmp::Ordering> {
    match (lhs, rhs) {
        (EmValue::I32(a), EmValue::I32(b)) => Ok(a.cmp(b)),
        (EmValue::I64(a), EmValue::I64(b)) => Ok(a.cmp(b)),
        (EmValue::F64(a), EmValue::F64(b)) => a
            .partial_cmp(b)
            .ok_or_else(|| Error::Execution("unordered float comparison".to_string())),
        _ => Err(Error::Execution(format!(
            "comparison on mismatched operands {lhs:?} and {rhs:?}"
        ))),
    }
}
