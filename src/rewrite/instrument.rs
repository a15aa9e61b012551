//! Module instrumentation: walks every method body and injects access guards.
//!
//! The instrumentor drives the [`BodyEditor`] over each body, dispatching by
//! opcode family to a patcher:
//!
//! - **Field access** sites gain a cache probe and a slow-path call to the
//!   field check entry point.
//! - **Calls** resolve their target: same-module targets pass untouched,
//!   shimmed targets are swapped for their safe replacement, overridable
//!   virtual dispatch gains the spill/check/reload slow path, and everything
//!   else gains a cache probe backed by the violation dispatch entry point.
//! - **Delegate creation** pairs (`ldftn`/`ldvirtftn` + `newobj`) collapse
//!   into a call to the checked delegate factory.
//! - **Stack allocation** is only accepted in the span construction shape and
//!   gains a dynamic length check.
//!
//! Re-instrumenting is a no-op: the verifier prelude's probe field is swapped
//! to the guard probe on the first pass, and bodies that already read the
//! guard probe short-circuit.

use std::sync::Arc;

use crate::{
    assembly::{
        instruction::{Instruction, OpCode, Operand},
        opcodes,
    },
    metadata::{
        flags::MethodModifiers,
        method::{MethodBody, MethodRc},
        module::ModuleRc,
        registry::Registry,
        signatures::TypeSig,
        token::Token,
        types::{CilTypeRc, TypeFlavor},
    },
    rewrite::{
        editor::BodyEditor,
        guards::{GuardTarget, GuardWriter},
        imports::ImportedReferences,
    },
    runtime::loader::LoaderShared,
    Error, Result,
};

/// Counters describing one module instrumentation pass.
#[derive(Debug, Default, Clone)]
pub struct InstrumentationReport {
    /// Method bodies rewritten
    pub methods_rewritten: usize,
    /// Distinct guard cache fields created
    pub guard_sites: usize,
    /// Guard cache holder types synthesized
    pub guard_holders: usize,
    /// Call sites redirected to shims
    pub shimmed_calls: usize,
    /// Delegate creation sites replaced with the checked factory
    pub delegate_sites: usize,
    /// Stack allocation patterns verified and checked
    pub stackallocs: usize,
}

/// Instruments every method body of a module.
///
/// # Errors
/// Fails with [`Error::BadImageFormat`] for structural violations (missing
/// verifier prelude, raw function pointers, unsupported stack allocation
/// shapes, managed span elements) and [`Error::NativeLoadDenied`] for
/// unmanaged method implementations. Also see [`BodyEditor::finish`].
pub(crate) fn instrument_module(
    registry: &Arc<Registry>,
    loader: &Arc<LoaderShared>,
    module: &ModuleRc,
) -> Result<InstrumentationReport> {
    let mut report = InstrumentationReport::default();
    if module.is_instrumented() {
        return Ok(report);
    }

    let imports = ImportedReferences::bind(registry);
    let mut guards = GuardWriter::new(registry, loader, module);

    // Snapshot the type count: guard holders appended during the pass carry
    // native initialisers only and need no rewriting themselves.
    let type_count = module.types.count();
    for type_index in 0..type_count {
        let Some(ty) = module.types.get(type_index).cloned() else {
            continue;
        };
        let method_count = ty.methods.count();
        for method_index in 0..method_count {
            let Some(method) = ty.methods.get(method_index).cloned() else {
                continue;
            };
            if method.modifiers.contains(MethodModifiers::PINVOKE_IMPL) {
                return Err(Error::NativeLoadDenied(method.full_name()));
            }
            let Some(body) = method.body() else {
                continue;
            };
            if let Some(rewritten) = rewrite_body(
                registry,
                module,
                &imports,
                &mut guards,
                &ty,
                &method,
                &body,
                &mut report,
            )? {
                method.replace_body(rewritten);
                report.methods_rewritten += 1;
            }
        }
    }

    report.guard_sites = guards.field_count();
    report.guard_holders = guards.finish();
    module.mark_instrumented();
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn rewrite_body(
    registry: &Arc<Registry>,
    module: &ModuleRc,
    imports: &ImportedReferences,
    guards: &mut GuardWriter,
    owner: &CilTypeRc,
    method: &MethodRc,
    body: &MethodBody,
    report: &mut InstrumentationReport,
) -> Result<Option<MethodBody>> {
    let instructions = &body.instructions;

    let probe = match (instructions.first(), instructions.get(1)) {
        (Some(load), Some(pop))
            if load.opcode == OpCode::new(opcodes::LDSFLD)
                && pop.opcode == OpCode::new(opcodes::POP) =>
        {
            load.token()
        }
        _ => None,
    };
    let probe = probe.ok_or_else(|| {
        bad_image!("method '{}' lacks the verifier prelude", method.full_name())
    })?;
    if probe == imports.guard_probe {
        // Already guarded; instrumentation is idempotent.
        return Ok(None);
    }
    if probe != imports.verifier_probe {
        return Err(bad_image!(
            "method '{}' carries an unrecognised prelude probe {}",
            method.full_name(),
            probe
        ));
    }

    let mut editor = BodyEditor::start(body)?;

    // Swap the prelude probe: the body is now marked as guarded.
    editor.insert(Instruction::new(
        OpCode::new(opcodes::LDSFLD),
        Operand::Token(imports.guard_probe),
    ));
    editor.advance(false);
    editor.advance(true);

    while !editor.done() {
        let Some(current) = editor.current().cloned() else {
            return Err(bad_image!(
                "method '{}' ends with a prefix opcode",
                method.full_name()
            ));
        };

        match (current.opcode.prefix, current.opcode.code) {
            (
                0,
                opcodes::LDFLD
                | opcodes::LDFLDA
                | opcodes::STFLD
                | opcodes::LDSFLD
                | opcodes::LDSFLDA
                | opcodes::STSFLD,
            ) => patch_field(registry, module, imports, guards, owner, &mut editor, &current)?,
            (0, opcodes::CALL | opcodes::CALLVIRT | opcodes::NEWOBJ) => patch_call(
                registry,
                module,
                imports,
                guards,
                owner,
                &mut editor,
                &current,
                report,
            )?,
            (opcodes::FE_PREFIX, opcodes::FE_LDFTN | opcodes::FE_LDVIRTFTN) => {
                patch_delegate(registry, imports, &mut editor, &current)?;
                report.delegate_sites += 1;
            }
            (opcodes::FE_PREFIX, opcodes::FE_LOCALLOC) => {
                patch_stackalloc(registry, imports, &mut editor)?;
                report.stackallocs += 1;
            }
            _ => editor.advance(true),
        }
    }

    editor.finish().map(Some)
}

/// Field access guard: `ldsfld cache; brtrue past; ldtoken field; ldtoken
/// declaring; call CheckAccess; past: <original>`.
fn patch_field(
    registry: &Registry,
    module: &ModuleRc,
    imports: &ImportedReferences,
    guards: &mut GuardWriter,
    owner: &CilTypeRc,
    editor: &mut BodyEditor,
    instruction: &Instruction,
) -> Result<()> {
    let token = instruction
        .token()
        .ok_or_else(|| bad_image!("field instruction without token operand"))?;
    let field = registry.field(token)?;
    let declaring = field
        .declaring_type()
        .ok_or(Error::TokenNotFound(token))?;

    // Intra-module accesses are trusted.
    if declaring.module == module.id {
        editor.advance(true);
        return Ok(());
    }

    let cache = guards.cache_field(owner, GuardTarget::Field(token));
    editor.insert(Instruction::new(
        OpCode::new(opcodes::LDSFLD),
        Operand::Token(cache),
    ));
    editor.insert_skip(OpCode::new(opcodes::BRTRUE));
    editor.insert(Instruction::new(
        OpCode::new(opcodes::LDTOKEN),
        Operand::Token(token),
    ));
    editor.insert(Instruction::new(
        OpCode::new(opcodes::LDTOKEN),
        Operand::Token(declaring.token),
    ));
    editor.insert(Instruction::new(
        OpCode::new(opcodes::CALL),
        Operand::Token(imports.check_access),
    ));
    editor.advance(true);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn patch_call(
    registry: &Registry,
    module: &ModuleRc,
    imports: &ImportedReferences,
    guards: &mut GuardWriter,
    owner: &CilTypeRc,
    editor: &mut BodyEditor,
    instruction: &Instruction,
    report: &mut InstrumentationReport,
) -> Result<()> {
    let site = instruction
        .token()
        .ok_or_else(|| bad_image!("call instruction without token operand"))?;
    let (target, instantiation) = registry.resolve_method(site)?;
    let declaring = target.declaring_type().ok_or(Error::TokenNotFound(site))?;

    // Intra-module calls are trusted.
    if declaring.module == module.id {
        editor.advance(true);
        return Ok(());
    }

    // Shimmed targets are swapped in place, generic arguments preserved.
    if let Some(shim) = registry.shims().shim_for(&target) {
        let replacement = match &instantiation {
            Some(inst) => {
                registry.method_instance(shim, inst.type_args.clone(), inst.method_args.clone())
            }
            None => shim,
        };
        editor.insert(Instruction::new(
            OpCode::new(opcodes::CALL),
            Operand::Token(replacement),
        ));
        editor.advance(false);
        report.shimmed_calls += 1;
        return Ok(());
    }

    let constrained_type = editor
        .previous_prefix()
        .filter(|prefix| prefix.opcode == OpCode::fe(opcodes::FE_CONSTRAINED))
        .and_then(Instruction::token);

    let cache = guards.cache_field(owner, GuardTarget::Method(site));
    editor.insert(Instruction::new(
        OpCode::new(opcodes::LDSFLD),
        Operand::Token(cache),
    ));
    editor.insert_skip(OpCode::new(opcodes::BRTRUE));

    let virtual_dispatch =
        instruction.opcode == OpCode::new(opcodes::CALLVIRT) && target.is_overridable();
    if virtual_dispatch {
        // Slow path: spill arguments in reverse, duplicate the receiver, push
        // the site tokens, check, reload, fall through to the original call.
        let type_args = instantiation
            .as_ref()
            .map_or(&[] as &[TypeSig], |inst| &inst.type_args);
        let method_args = instantiation
            .as_ref()
            .map_or(&[] as &[TypeSig], |inst| &inst.method_args);

        let mut spill_slots = Vec::with_capacity(target.sig.params.len());
        for param in &target.sig.params {
            spill_slots.push(editor.add_local(param.instantiate(type_args, method_args)));
        }
        for slot in spill_slots.iter().rev() {
            editor.insert(Instruction::new(
                OpCode::fe(opcodes::FE_STLOC),
                Operand::Local(*slot),
            ));
        }
        editor.insert(Instruction::new(OpCode::new(opcodes::DUP), Operand::None));
        editor.insert(Instruction::new(
            OpCode::new(opcodes::LDTOKEN),
            Operand::Token(site),
        ));
        editor.insert(Instruction::new(
            OpCode::new(opcodes::LDTOKEN),
            Operand::Token(declaring.token),
        ));

        let entry = match constrained_type {
            Some(token) => registry.method_instance(
                imports.check_virtual_call_constrained,
                Vec::new(),
                vec![type_sig_for(registry, token)],
            ),
            None => imports.check_virtual_call,
        };
        editor.insert(Instruction::new(
            OpCode::new(opcodes::CALL),
            Operand::Token(entry),
        ));

        for slot in &spill_slots {
            editor.insert(Instruction::new(
                OpCode::fe(opcodes::FE_LDLOC),
                Operand::Local(*slot),
            ));
        }
    } else {
        // Statically resolvable target: a cold cache means the call is not
        // allowed, so the slow path reports straight to the handler.
        editor.insert(Instruction::new(
            OpCode::new(opcodes::LDTOKEN),
            Operand::Token(site),
        ));
        editor.insert(Instruction::new(
            OpCode::new(opcodes::LDTOKEN),
            Operand::Token(declaring.token),
        ));
        editor.insert(Instruction::new(
            OpCode::new(opcodes::CALL),
            Operand::Token(imports.invoke_violation_handler),
        ));
    }

    editor.advance(true);
    Ok(())
}

/// Delegate creation: replaces `ldftn`/`ldvirtftn` plus the following delegate
/// constructor with a call to the checked delegate factory.
fn patch_delegate(
    registry: &Registry,
    imports: &ImportedReferences,
    editor: &mut BodyEditor,
    instruction: &Instruction,
) -> Result<()> {
    let site = instruction
        .token()
        .ok_or_else(|| bad_image!("function pointer load without token operand"))?;
    let (target, _) = registry.resolve_method(site)?;
    let declaring = target.declaring_type().ok_or(Error::TokenNotFound(site))?;

    let next = editor
        .peek(1)
        .cloned()
        .ok_or_else(|| bad_image!("function pointer load without delegate construction"))?;
    if next.opcode != OpCode::new(opcodes::NEWOBJ) {
        return Err(bad_image!(
            "raw function pointer use is not permitted in sandboxed code"
        ));
    }
    let ctor_token = next
        .token()
        .ok_or_else(|| bad_image!("delegate construction without token operand"))?;
    let (ctor, _) = registry.resolve_method(ctor_token)?;
    let delegate_type = ctor
        .declaring_type()
        .ok_or(Error::TokenNotFound(ctor_token))?;
    if delegate_type.flavor != TypeFlavor::Delegate || !ctor.is_ctor() {
        return Err(bad_image!(
            "function pointer may only flow into a delegate constructor"
        ));
    }

    // ldvirtftn sites duplicated the receiver for the pointer load; the
    // factory takes the target explicitly, so drop the extra copy.
    if instruction.opcode == OpCode::fe(opcodes::FE_LDVIRTFTN) {
        editor.insert(Instruction::new(OpCode::new(opcodes::POP), Operand::None));
    }
    editor.insert(Instruction::new(
        OpCode::new(opcodes::LDTOKEN),
        Operand::Token(site),
    ));
    editor.insert(Instruction::new(
        OpCode::new(opcodes::LDTOKEN),
        Operand::Token(declaring.token),
    ));
    let entry = registry.method_instance(
        imports.create_checked_delegate,
        Vec::new(),
        vec![TypeSig::Class(delegate_type.token)],
    );
    editor.insert(Instruction::new(
        OpCode::new(opcodes::CALL),
        Operand::Token(entry),
    ));

    editor.extend_window()?;
    editor.advance(false);
    Ok(())
}

/// Returns true for the instruction shapes accepted as the span length load.
fn is_int_load(instruction: &Instruction) -> bool {
    match (instruction.opcode.prefix, instruction.opcode.code) {
        (0, opcodes::LDC_I4_M1..=opcodes::LDC_I4) => true,
        (0, opcodes::LDLOC_0..=opcodes::LDLOC_3 | opcodes::LDLOC_S) => true,
        (opcodes::FE_PREFIX, opcodes::FE_LDLOC) => true,
        _ => false,
    }
}

/// Stack allocation: accepts only the `localloc; <length>; newobj
/// Span<T>(void*, int32)` triple with `T` unmanaged, and injects a dynamic
/// check that the allocated byte count matches the span's element count.
fn patch_stackalloc(
    registry: &Registry,
    imports: &ImportedReferences,
    editor: &mut BodyEditor,
) -> Result<()> {
    let length_load = editor
        .peek(1)
        .cloned()
        .ok_or_else(|| bad_image!("stack allocation without span construction"))?;
    if !is_int_load(&length_load) {
        return Err(bad_image!(
            "stack allocation length must be an integer constant or local"
        ));
    }

    let ctor = editor
        .peek(2)
        .cloned()
        .ok_or_else(|| bad_image!("stack allocation without span construction"))?;
    if ctor.opcode != OpCode::new(opcodes::NEWOBJ) {
        return Err(bad_image!(
            "stack allocation must flow into a span constructor"
        ));
    }
    let ctor_token = ctor
        .token()
        .ok_or_else(|| bad_image!("span construction without token operand"))?;
    let (ctor_method, instantiation) = registry.resolve_method(ctor_token)?;
    let element = instantiation
        .filter(|inst| ctor_method.token == imports.span_ctor && inst.type_args.len() == 1)
        .map(|inst| inst.type_args[0].clone())
        .ok_or_else(|| bad_image!("stack allocation must flow into a span constructor"))?;

    if !element.is_unmanaged(registry) {
        return Err(bad_image!(
            "span over stack allocation requires an unmanaged element type, got {}",
            element
        ));
    }

    // Spill the byte count so the injected check can compare it against the
    // element count right before the span is constructed.
    let byte_count = editor.add_local(TypeSig::I4);
    editor.insert(Instruction::new(OpCode::new(opcodes::DUP), Operand::None));
    editor.insert(Instruction::new(
        OpCode::fe(opcodes::FE_STLOC),
        Operand::Local(byte_count),
    ));
    editor.advance(true); // localloc
    editor.advance(true); // length load

    editor.insert(Instruction::new(OpCode::new(opcodes::DUP), Operand::None));
    editor.insert(Instruction::new(
        OpCode::fe(opcodes::FE_LDLOC),
        Operand::Local(byte_count),
    ));
    let entry = registry.method_instance(imports.verify_span_length, Vec::new(), vec![element]);
    editor.insert(Instruction::new(
        OpCode::new(opcodes::CALL),
        Operand::Token(entry),
    ));
    editor.advance(true); // span constructor
    Ok(())
}

/// Signature form of a type token, for generic entry point instantiation.
fn type_sig_for(registry: &Registry, token: Token) -> TypeSig {
    match registry.ty(token) {
        Ok(ty) if matches!(ty.flavor, TypeFlavor::ValueType | TypeFlavor::Enum) => {
            TypeSig::ValueType(token)
        }
        _ => TypeSig::Class(token),
    }
}
