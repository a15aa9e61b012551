//! Integration tests for method body instrumentation.
//!
//! Loads sandboxed modules through a loader and inspects the rewritten
//! instruction streams: guard prologues, macro expansion, branch and
//! exception-handler retargeting, stack allocation verification, and the
//! idempotence of repeated instrumentation.

use std::sync::Arc;

use cilgate::assembly::opcodes;
use cilgate::prelude::*;

struct Fixture {
    registry: Arc<Registry>,
    host_field: Token,
    host_op: Token,
    host_virtual: Token,
}

fn build_host(registry: &Arc<Registry>) -> Fixture {
    let mut host = ModuleBuilder::new(registry, "Host.Api");
    let api = host
        .define(
            TypeBuilder::class("Api")
                .namespace("Host")
                .public()
                .field(FieldBuilder::new("Counter", TypeSig::I4).public().static_())
                .method(
                    MethodBuilder::new("Op")
                        .public()
                        .static_()
                        .returns(TypeSig::I4)
                        .body(|asm| {
                            asm.ldc_i4_const(7)?.ret()?;
                            Ok(())
                        }),
                )
                .method(
                    MethodBuilder::new("Render")
                        .public()
                        .virtual_()
                        .new_slot()
                        .params(&[TypeSig::I4, TypeSig::I8])
                        .returns(TypeSig::I4)
                        .body(|asm| {
                            asm.ldc_i4_const(0)?.ret()?;
                            Ok(())
                        }),
                ),
        )
        .unwrap();
    host.build();

    Fixture {
        registry: registry.clone(),
        host_field: api.field_token("Counter").unwrap(),
        host_op: api.method_token("Op").unwrap(),
        host_virtual: api.method_token("Render").unwrap(),
    }
}

fn sandbox_loader(registry: &Arc<Registry>) -> SandboxLoader {
    let policy = CasPolicyBuilder::new().with_default_sandbox(registry).build();
    SandboxLoader::with_options(registry, policy, Some("rewrite-tests"), false)
}

fn body_of(ty: &CilTypeRc, name: &str) -> Arc<MethodBody> {
    let token = ty.method_token(name).unwrap();
    let mut found = None;
    for i in 0..ty.methods.count() {
        if let Some(method) = ty.methods.get(i) {
            if method.token == token {
                found = method.body();
            }
        }
    }
    found.expect("method has a body")
}

fn mnemonics(body: &MethodBody) -> Vec<&'static str> {
    body.instructions.iter().map(Instruction::mnemonic).collect()
}

#[test]
fn test_field_access_gains_guard_prologue() {
    let registry = Registry::new();
    let fixture = build_host(&registry);

    let mut plugin = ModuleBuilder::new(&registry, "Plugin.FieldRead");
    let host_field = fixture.host_field;
    let ty = plugin
        .define(
            TypeBuilder::class("Reader").namespace("Plugin").public().method(
                MethodBuilder::new("ReadHost")
                    .public()
                    .static_()
                    .returns(TypeSig::I4)
                    .body(move |asm| {
                        asm.ldsfld(host_field)?.ret()?;
                        Ok(())
                    }),
            ),
        )
        .unwrap();
    let plugin = plugin.build();

    let report = sandbox_loader(&registry).load_module(&plugin).unwrap();
    assert_eq!(report.methods_rewritten, 1);
    assert_eq!(report.guard_sites, 1);
    assert_eq!(report.guard_holders, 1);

    let body = body_of(&ty, "ReadHost");
    let ops = mnemonics(&body);
    // Prelude (probe swapped), then: cache load, skip, tokens, check, original.
    assert_eq!(
        ops,
        vec![
            "ldsfld", "pop", "ldsfld", "brtrue", "ldtoken", "ldtoken", "call", "ldsfld", "ret"
        ]
    );

    // The prelude now reads the guard probe instead of the verifier probe.
    assert_eq!(
        body.instructions[0].token().unwrap(),
        registry.core().guard_probe
    );
    // The skip branch lands exactly on the original field access.
    let original_offset = body.instructions[7].offset;
    assert_eq!(body.instructions[7].token().unwrap(), host_field);
    assert_eq!(body.instructions[3].target().unwrap(), original_offset);
    // The slow path calls the field check entry point.
    assert_eq!(
        body.instructions[6].token().unwrap(),
        registry.core().check_access
    );

    // The guard holder was attached to the instrumented type.
    assert_eq!(ty.nested.count(), 1);
    let holder = ty.nested.get(0).unwrap();
    assert_eq!(holder.fields.count(), 1);
}

#[test]
fn test_intra_module_access_is_untouched() {
    let registry = Registry::new();
    build_host(&registry);

    let mut plugin = ModuleBuilder::new(&registry, "Plugin.SelfContained");
    let ty = plugin
        .define(
            TypeBuilder::class("Own")
                .namespace("Plugin")
                .public()
                .field(FieldBuilder::new("State", TypeSig::I4).public().static_())
                .method(
                    MethodBuilder::new("Helper")
                        .public()
                        .static_()
                        .returns(TypeSig::I4)
                        .body(|asm| {
                            asm.ldc_i4_const(5)?.ret()?;
                            Ok(())
                        }),
                )
                .method(
                    MethodBuilder::new("UseOwn")
                        .public()
                        .static_()
                        .returns(TypeSig::I4)
                        .body(|asm| {
                            let field = asm.this_field("State")?;
                            let helper = asm.this_method("Helper")?;
                            asm.ldsfld(field)?.pop()?.call(helper)?.ret()?;
                            Ok(())
                        }),
                ),
        )
        .unwrap();
    let plugin = plugin.build();

    let report = sandbox_loader(&registry).load_module(&plugin).unwrap();
    // Bodies are rewritten (the prelude swap), but no guard sites exist.
    assert_eq!(report.guard_sites, 0);
    assert_eq!(report.guard_holders, 0);

    let body = body_of(&ty, "UseOwn");
    assert_eq!(
        mnemonics(&body),
        vec!["ldsfld", "pop", "ldsfld", "pop", "call", "ret"]
    );
}

#[test]
fn test_macro_forms_expand_to_long_forms() {
    let registry = Registry::new();
    let fixture = build_host(&registry);

    let mut plugin = ModuleBuilder::new(&registry, "Plugin.Macros");
    let host_field = fixture.host_field;
    let ty = plugin
        .define(
            TypeBuilder::class("Macros").namespace("Plugin").public().method(
                MethodBuilder::new("Looping")
                    .public()
                    .static_()
                    .params(&[TypeSig::I4])
                    .returns(TypeSig::I4)
                    .body(move |asm| {
                        let total = asm.local(TypeSig::I4);
                        asm.ldc_i4_const(0)?;
                        asm.stloc_s(total as u8)?;
                        asm.label("loop")?;
                        asm.ldarg_0()?;
                        asm.brfalse_s("done")?;
                        // Guarded access inside the loop grows the body past
                        // any short-branch range assumptions.
                        asm.ldsfld(host_field)?;
                        asm.ldloc_s(total as u8)?;
                        asm.add()?;
                        asm.stloc_s(total as u8)?;
                        asm.br_s("loop")?;
                        asm.label("done")?;
                        asm.ldloc_s(total as u8)?;
                        asm.ret()?;
                        Ok(())
                    }),
            ),
        )
        .unwrap();
    let plugin = plugin.build();

    sandbox_loader(&registry).load_module(&plugin).unwrap();
    let body = body_of(&ty, "Looping");

    for instruction in &body.instructions {
        let code = instruction.opcode.code;
        if instruction.opcode.prefix == 0 {
            assert!(
                !(opcodes::BR_S..=opcodes::BLT_UN_S).contains(&code),
                "short branch survived rewriting: {instruction:?}"
            );
            assert!(
                !(opcodes::LDLOC_S..=opcodes::STLOC_S).contains(&code)
                    && code != opcodes::LDARG_S
                    && !(opcodes::LDARG_0..=opcodes::STLOC_3).contains(&code),
                "index macro survived rewriting: {instruction:?}"
            );
        }
    }

    // The backward branch still targets the loop head.
    let loop_branch = body
        .instructions
        .iter()
        .find(|instruction| instruction.opcode == OpCode::new(opcodes::BR))
        .expect("expanded loop branch");
    let target = loop_branch.target().unwrap();
    assert!(body.instructions.iter().any(|i| i.offset == target));

    // Round-trip the rewritten body through the byte boundary.
    let bytes = body.to_bytes().unwrap();
    let decoded = decode_stream(&bytes).unwrap();
    assert_eq!(decoded.len(), body.instructions.len());
    for (rewritten, decoded) in body.instructions.iter().zip(&decoded) {
        assert_eq!(rewritten.opcode, decoded.opcode);
        assert_eq!(rewritten.operand, decoded.operand);
    }
}

#[test]
fn test_branch_into_guarded_site_lands_on_guard_start() {
    let registry = Registry::new();
    let fixture = build_host(&registry);

    let mut plugin = ModuleBuilder::new(&registry, "Plugin.BranchTarget");
    let host_field = fixture.host_field;
    let ty = plugin
        .define(
            TypeBuilder::class("Branches").namespace("Plugin").public().method(
                MethodBuilder::new("Jumpy")
                    .public()
                    .static_()
                    .params(&[TypeSig::I4])
                    .returns(TypeSig::I4)
                    .body(move |asm| {
                        asm.ldarg_0()?;
                        asm.brtrue("read")?;
                        asm.ldc_i4_const(0)?;
                        asm.ret()?;
                        asm.label("read")?;
                        asm.ldsfld(host_field)?;
                        asm.ret()?;
                        Ok(())
                    }),
            ),
        )
        .unwrap();
    let plugin = plugin.build();

    sandbox_loader(&registry).load_module(&plugin).unwrap();
    let body = body_of(&ty, "Jumpy");

    let branch = body
        .instructions
        .iter()
        .find(|instruction| instruction.opcode == OpCode::new(opcodes::BRTRUE))
        .expect("conditional branch");
    let target = branch.target().unwrap();

    // The branch target is the cache probe, the first instruction replacing
    // the guarded field access.
    let landing = body
        .instructions
        .iter()
        .position(|instruction| instruction.offset == target)
        .expect("branch target maps to an instruction");
    assert_eq!(body.instructions[landing].opcode, OpCode::new(opcodes::LDSFLD));
    assert_ne!(body.instructions[landing].token().unwrap(), host_field);
    // The guarded original follows at the end of the prologue.
    assert_eq!(
        body.instructions[landing + 5].token().unwrap(),
        host_field
    );
}

#[test]
fn test_exception_handler_spans_cover_guards() {
    let registry = Registry::new();
    let fixture = build_host(&registry);

    let mut plugin = ModuleBuilder::new(&registry, "Plugin.Handlers");
    let host_field = fixture.host_field;
    let ty = plugin
        .define(
            TypeBuilder::class("Protected").namespace("Plugin").public().method(
                MethodBuilder::new("Guarded")
                    .public()
                    .static_()
                    .returns(TypeSig::I4)
                    .body(move |asm| {
                        asm.label("try_start")?;
                        asm.ldsfld(host_field)?;
                        asm.pop()?;
                        asm.leave_s("after")?;
                        asm.label("try_end")?;
                        asm.endfinally()?;
                        asm.label("handler_end")?;
                        asm.label("after")?;
                        asm.ldc_i4_const(1)?;
                        asm.ret()?;
                        asm.finally_handler("try_start", "try_end", "try_end", "handler_end");
                        Ok(())
                    }),
            ),
        )
        .unwrap();
    let plugin = plugin.build();

    sandbox_loader(&registry).load_module(&plugin).unwrap();
    let body = body_of(&ty, "Guarded");
    let handler = &body.exception_handlers[0];

    // The try region must start at the guard's cache probe, not at the
    // relocated original instruction.
    let cache_probe = &body.instructions[2];
    assert_eq!(cache_probe.opcode, OpCode::new(opcodes::LDSFLD));
    assert_ne!(cache_probe.token().unwrap(), host_field);
    assert_eq!(u64::from(handler.try_offset), cache_probe.offset);

    // The finally handler is exactly the endfinally instruction.
    let endfinally = body
        .instructions
        .iter()
        .find(|instruction| instruction.opcode == OpCode::new(opcodes::ENDFINALLY))
        .unwrap();
    assert_eq!(u64::from(handler.handler_offset), endfinally.offset);
    assert_eq!(handler.handler_length, 1);
}

#[test]
fn test_virtual_call_slow_path_spills_and_reloads() {
    let registry = Registry::new();
    let fixture = build_host(&registry);

    let mut plugin = ModuleBuilder::new(&registry, "Plugin.VirtualCall");
    let host_virtual = fixture.host_virtual;
    let ty = plugin
        .define(
            TypeBuilder::class("Caller").namespace("Plugin").public().method(
                MethodBuilder::new("CallRender")
                    .public()
                    .static_()
                    .params(&[TypeSig::Object])
                    .returns(TypeSig::I4)
                    .body(move |asm| {
                        asm.ldarg_0()?;
                        asm.ldc_i4_const(3)?;
                        asm.ldc_i8(9)?;
                        asm.callvirt(host_virtual)?;
                        asm.ret()?;
                        Ok(())
                    }),
            ),
        )
        .unwrap();
    let plugin = plugin.build();

    sandbox_loader(&registry).load_module(&plugin).unwrap();
    let body = body_of(&ty, "CallRender");

    let ops = mnemonics(&body);
    assert_eq!(
        ops,
        vec![
            "ldsfld", "pop", // prelude
            "ldarg", "ldc.i4.3", "ldc.i8", // original argument pushes
            "ldsfld", "brtrue", // cache probe
            "stloc", "stloc", // spill arguments in reverse
            "dup", "ldtoken", "ldtoken", "call", // receiver + tokens + check
            "ldloc", "ldloc", // reload arguments
            "callvirt", "ret",
        ]
    );

    // Spill locals were appended with the callee's parameter types.
    assert_eq!(body.locals, vec![TypeSig::I4, TypeSig::I8]);

    // Spills run in reverse: the first stloc receives the int64 on top.
    let stloc_first = &body.instructions[7];
    assert_eq!(stloc_first.operand, Operand::Local(1));
    let stloc_second = &body.instructions[8];
    assert_eq!(stloc_second.operand, Operand::Local(0));
    // Reloads restore declaration order.
    assert_eq!(body.instructions[13].operand, Operand::Local(0));
    assert_eq!(body.instructions[14].operand, Operand::Local(1));

    // The check is the late-binding entry point.
    assert_eq!(
        body.instructions[12].token().unwrap(),
        registry.core().check_virtual_call
    );
}

#[test]
fn test_constrained_prefix_stays_adjacent() {
    let registry = Registry::new();
    let fixture = build_host(&registry);

    let mut plugin = ModuleBuilder::new(&registry, "Plugin.Constrained");
    let host_virtual = fixture.host_virtual;
    let object_token = registry.core().object.token;
    let ty = plugin
        .define(
            TypeBuilder::class("Caller").namespace("Plugin").public().method(
                MethodBuilder::new("CallConstrained")
                    .public()
                    .static_()
                    .params(&[TypeSig::Object])
                    .returns(TypeSig::I4)
                    .body(move |asm| {
                        asm.ldarg_0()?;
                        asm.ldc_i4_const(1)?;
                        asm.ldc_i8(2)?;
                        asm.constrained(object_token)?;
                        asm.callvirt(host_virtual)?;
                        asm.ret()?;
                        Ok(())
                    }),
            ),
        )
        .unwrap();
    let plugin = plugin.build();

    sandbox_loader(&registry).load_module(&plugin).unwrap();
    let body = body_of(&ty, "CallConstrained");

    let prefix_index = body
        .instructions
        .iter()
        .position(|instruction| instruction.opcode == OpCode::fe(opcodes::FE_CONSTRAINED))
        .expect("constrained prefix survives");
    assert_eq!(
        body.instructions[prefix_index + 1].opcode,
        OpCode::new(opcodes::CALLVIRT)
    );

    // The slow path uses the constrained entry point instantiated with the
    // prefix's type operand.
    let check = body
        .instructions
        .iter()
        .filter_map(Instruction::token)
        .find_map(|token| {
            let (method, instantiation) = registry.resolve_method(token).ok()?;
            (method.token == registry.core().check_virtual_call_constrained)
                .then_some(instantiation)
        })
        .flatten()
        .expect("constrained check entry point");
    assert_eq!(check.method_args, vec![TypeSig::Class(object_token)]);
}

#[test]
fn test_delegate_creation_collapses_to_factory() {
    let registry = Registry::new();
    let fixture = build_host(&registry);

    let mut plugin = ModuleBuilder::new(&registry, "Plugin.Delegates");
    let writer = plugin
        .define(TypeBuilder::delegate("IntOp", &[TypeSig::I4], TypeSig::I4).namespace("Plugin").public())
        .unwrap();
    let writer_ctor = {
        let mut ctor = None;
        for i in 0..writer.methods.count() {
            if let Some(method) = writer.methods.get(i) {
                if method.is_ctor() {
                    ctor = Some(method.token);
                }
            }
        }
        ctor.unwrap()
    };
    let host_op = fixture.host_op;
    let ty = plugin
        .define(
            TypeBuilder::class("Factory").namespace("Plugin").public().method(
                MethodBuilder::new("MakeDelegate")
                    .public()
                    .static_()
                    .returns(TypeSig::Object)
                    .body(move |asm| {
                        asm.ldnull()?;
                        asm.ldftn(host_op)?;
                        asm.newobj(writer_ctor)?;
                        asm.ret()?;
                        Ok(())
                    }),
            ),
        )
        .unwrap();
    let plugin = plugin.build();

    let report = sandbox_loader(&registry).load_module(&plugin).unwrap();
    assert_eq!(report.delegate_sites, 1);

    let body = body_of(&ty, "MakeDelegate");
    let ops = mnemonics(&body);
    assert_eq!(
        ops,
        vec!["ldsfld", "pop", "ldnull", "ldtoken", "ldtoken", "call", "ret"]
    );

    // Neither the function-pointer load nor the delegate constructor survive.
    assert!(!body
        .instructions
        .iter()
        .any(|i| i.opcode == OpCode::fe(opcodes::FE_LDFTN)
            || i.opcode == OpCode::new(opcodes::NEWOBJ)));

    // The factory call is instantiated with the delegate type.
    let factory = body.instructions[5].token().unwrap();
    let (method, instantiation) = registry.resolve_method(factory).unwrap();
    assert_eq!(method.token, registry.core().create_checked_delegate);
    assert_eq!(
        instantiation.unwrap().method_args,
        vec![TypeSig::Class(writer.token)]
    );
}

#[test]
fn test_raw_function_pointer_is_rejected() {
    let registry = Registry::new();
    let fixture = build_host(&registry);

    let mut plugin = ModuleBuilder::new(&registry, "Plugin.RawFtn");
    let host_op = fixture.host_op;
    plugin
        .define(
            TypeBuilder::class("Bad").namespace("Plugin").public().method(
                MethodBuilder::new("LeakPointer")
                    .public()
                    .static_()
                    .returns(TypeSig::IntPtr)
                    .body(move |asm| {
                        asm.ldftn(host_op)?;
                        asm.ret()?;
                        Ok(())
                    }),
            ),
        )
        .unwrap();
    let plugin = plugin.build();

    let result = sandbox_loader(&registry).load_module(&plugin);
    assert!(matches!(result, Err(Error::BadImageFormat { .. })));
}

#[test]
fn test_stackalloc_span_pattern_gains_length_check() {
    let registry = Registry::new();
    build_host(&registry);

    let span_int_ctor =
        registry.method_instance(registry.core().span_ctor, vec![TypeSig::I4], vec![]);

    let mut plugin = ModuleBuilder::new(&registry, "Plugin.Stackalloc");
    let ty = plugin
        .define(
            TypeBuilder::class("Alloc").namespace("Plugin").public().method(
                MethodBuilder::new("MakeSpan")
                    .public()
                    .static_()
                    .returns(TypeSig::I4)
                    .body(move |asm| {
                        asm.ldc_i4_const(16)?;
                        asm.localloc()?;
                        asm.ldc_i4_const(4)?;
                        asm.newobj(span_int_ctor)?;
                        asm.pop()?;
                        asm.ldc_i4_const(0)?;
                        asm.ret()?;
                        Ok(())
                    }),
            ),
        )
        .unwrap();
    let plugin = plugin.build();

    let report = sandbox_loader(&registry).load_module(&plugin).unwrap();
    assert_eq!(report.stackallocs, 1);

    let body = body_of(&ty, "MakeSpan");
    let ops = mnemonics(&body);
    assert_eq!(
        ops,
        vec![
            "ldsfld", "pop", // prelude
            "ldc.i4.s", // byte count
            "dup", "stloc", // spill the byte count
            "localloc", "ldc.i4.4", // allocation and element count
            "dup", "ldloc", "call", // length check
            "newobj", "pop", "ldc.i4.0", "ret",
        ]
    );

    // One spill local of int32 was appended.
    assert_eq!(body.locals, vec![TypeSig::I4]);

    let check = body.instructions[9].token().unwrap();
    let (method, instantiation) = registry.resolve_method(check).unwrap();
    assert_eq!(method.token, registry.core().verify_span_length);
    assert_eq!(instantiation.unwrap().method_args, vec![TypeSig::I4]);
}

#[test]
fn test_raw_localloc_is_rejected_at_load() {
    let registry = Registry::new();
    build_host(&registry);

    let mut plugin = ModuleBuilder::new(&registry, "Plugin.RawAlloc");
    plugin
        .define(
            TypeBuilder::class("Bad").namespace("Plugin").public().method(
                MethodBuilder::new("RawAlloc")
                    .public()
                    .static_()
                    .returns(TypeSig::IntPtr)
                    .body(|asm| {
                        asm.ldc_i4_const(64)?;
                        asm.localloc()?;
                        asm.ret()?;
                        Ok(())
                    }),
            ),
        )
        .unwrap();
    let plugin = plugin.build();

    let result = sandbox_loader(&registry).load_module(&plugin);
    assert!(matches!(result, Err(Error::BadImageFormat { .. })));
}

#[test]
fn test_managed_span_element_is_rejected() {
    let registry = Registry::new();
    build_host(&registry);

    let span_string_ctor =
        registry.method_instance(registry.core().span_ctor, vec![TypeSig::String], vec![]);

    let mut plugin = ModuleBuilder::new(&registry, "Plugin.ManagedSpan");
    plugin
        .define(
            TypeBuilder::class("Bad").namespace("Plugin").public().method(
                MethodBuilder::new("ManagedSpan")
                    .public()
                    .static_()
                    .returns(TypeSig::I4)
                    .body(move |asm| {
                        asm.ldc_i4_const(32)?;
                        asm.localloc()?;
                        asm.ldc_i4_const(4)?;
                        asm.newobj(span_string_ctor)?;
                        asm.pop()?;
                        asm.ldc_i4_const(0)?;
                        asm.ret()?;
                        Ok(())
                    }),
            ),
        )
        .unwrap();
    let plugin = plugin.build();

    let result = sandbox_loader(&registry).load_module(&plugin);
    assert!(matches!(result, Err(Error::BadImageFormat { .. })));
}

#[test]
fn test_missing_verifier_prelude_is_rejected() {
    let registry = Registry::new();
    build_host(&registry);

    let mut plugin = ModuleBuilder::new(&registry, "Plugin.NoPrelude");
    plugin
        .define(
            TypeBuilder::class("Bad").namespace("Plugin").public().method(
                MethodBuilder::new("Unverified")
                    .public()
                    .static_()
                    .returns(TypeSig::I4)
                    .without_verifier_prelude()
                    .body(|asm| {
                        asm.ldc_i4_const(1)?.ret()?;
                        Ok(())
                    }),
            ),
        )
        .unwrap();
    let plugin = plugin.build();

    let result = sandbox_loader(&registry).load_module(&plugin);
    assert!(matches!(result, Err(Error::BadImageFormat { .. })));
}

#[test]
fn test_unmanaged_implementation_is_refused() {
    let registry = Registry::new();
    build_host(&registry);

    let mut plugin = ModuleBuilder::new(&registry, "Plugin.Native");
    plugin
        .define(
            TypeBuilder::class("Interop").namespace("Plugin").public().method(
                MethodBuilder::new("NativeCall")
                    .public()
                    .pinvoke()
                    .returns(TypeSig::I4),
            ),
        )
        .unwrap();
    let plugin = plugin.build();

    let loader = sandbox_loader(&registry);
    let result = loader.load_module(&plugin);
    assert!(matches!(result, Err(Error::NativeLoadDenied(_))));

    assert!(matches!(
        loader.load_native_library("kernel32"),
        Err(Error::NativeLoadDenied(_))
    ));
}

#[test]
fn test_instrumentation_is_idempotent() {
    let registry = Registry::new();
    let fixture = build_host(&registry);

    let mut plugin = ModuleBuilder::new(&registry, "Plugin.Twice");
    let host_field = fixture.host_field;
    let ty = plugin
        .define(
            TypeBuilder::class("Reader").namespace("Plugin").public().method(
                MethodBuilder::new("ReadHost")
                    .public()
                    .static_()
                    .returns(TypeSig::I4)
                    .body(move |asm| {
                        asm.ldsfld(host_field)?.ret()?;
                        Ok(())
                    }),
            ),
        )
        .unwrap();
    let plugin = plugin.build();

    let loader = sandbox_loader(&registry);
    let first = loader.load_module(&plugin).unwrap();
    assert_eq!(first.methods_rewritten, 1);

    let snapshot = body_of(&ty, "ReadHost").instructions.clone();

    let second = loader.load_module(&plugin).unwrap();
    assert_eq!(second.methods_rewritten, 0);
    assert_eq!(second.guard_sites, 0);

    let after = body_of(&ty, "ReadHost");
    assert_eq!(after.instructions.len(), snapshot.len());
    for (before, after) in snapshot.iter().zip(&after.instructions) {
        assert_eq!(before.opcode, after.opcode);
        assert_eq!(before.operand, after.operand);
    }
}

#[test]
fn test_shimmed_call_site_is_replaced() {
    let registry = Registry::new();
    let fixture = build_host(&registry);

    // Host-provided safe replacement with the same shape as Op.
    let mut host_extra = ModuleBuilder::new(&registry, "Host.Safe");
    let safe = host_extra
        .define(
            TypeBuilder::class("SafeApi").namespace("Host").public().method(
                MethodBuilder::new("Op")
                    .public()
                    .static_()
                    .returns(TypeSig::I4)
                    .body(|asm| {
                        asm.ldc_i4_const(42)?.ret()?;
                        Ok(())
                    }),
            ),
        )
        .unwrap();
    host_extra.build();
    let safe_op = safe.method_token("Op").unwrap();

    registry
        .shims()
        .register(&registry, fixture.host_op, safe_op)
        .unwrap();

    let mut plugin = ModuleBuilder::new(&registry, "Plugin.Shimmed");
    let host_op = fixture.host_op;
    let ty = plugin
        .define(
            TypeBuilder::class("Caller").namespace("Plugin").public().method(
                MethodBuilder::new("CallOp")
                    .public()
                    .static_()
                    .returns(TypeSig::I4)
                    .body(move |asm| {
                        asm.call(host_op)?.ret()?;
                        Ok(())
                    }),
            ),
        )
        .unwrap();
    let plugin = plugin.build();

    let report = sandbox_loader(&registry).load_module(&plugin).unwrap();
    assert_eq!(report.shimmed_calls, 1);

    let body = body_of(&ty, "CallOp");
    assert_eq!(mnemonics(&body), vec!["ldsfld", "pop", "call", "ret"]);
    assert_eq!(body.instructions[2].token().unwrap(), safe_op);
}
