//! Core library bootstrap: well-known types and native runtime stubs.
//!
//! Every registry starts with a minimal core module providing the types the
//! rewriter imports by token: the object root, strings, spans, the delegate
//! base, the generic list interface with its array helper implementation, and
//! the static guard type hosting the check entry points. Native stubs follow
//! the same shape as any other intrinsic method, so the interpreter treats
//! core and host methods uniformly.

use std::sync::{Arc, OnceLock, RwLock};

use crate::{
    emulation::{
        machine::ObjData,
        value::{EmValue, NativeCall},
        Machine,
    },
    metadata::{
        flags::{FieldAttributes, MemberVisibility, MethodModifiers, TypeModifiers, TypeVisibility},
        method::{Field, Method, NativeImpl},
        module::{Module, ModuleRc},
        registry::{CoreTypes, Registry},
        signatures::{MethodSig, TypeSig},
        token::Token,
        types::{CilType, CilTypeRc, CilTypeRef, TypeFlavor},
    },
    runtime::loader::entry,
    Error, Result,
};

fn define_type(
    registry: &Arc<Registry>,
    module: &ModuleRc,
    namespace: &str,
    name: &str,
    flavor: TypeFlavor,
    modifiers: TypeModifiers,
    generic_arity: u8,
) -> CilTypeRc {
    let ty = Arc::new(CilType {
        token: registry.alloc_type_token(),
        module: module.id,
        namespace: namespace.to_string(),
        name: name.to_string(),
        visibility: TypeVisibility::Public,
        modifiers,
        flavor,
        generic_arity,
        base: OnceLock::new(),
        enclosing: OnceLock::new(),
        nested: boxcar::Vec::new(),
        fields: boxcar::Vec::new(),
        methods: boxcar::Vec::new(),
        interface_map: crossbeam_skiplist::SkipMap::new(),
        method_table: OnceLock::new(),
    });
    registry.add_type(ty.clone());
    module.types.push(ty.clone());
    ty
}

fn set_base(ty: &CilTypeRc, base: &CilTypeRc) {
    let _ = ty.base.set(CilTypeRef::new(base));
}

fn define_field(
    registry: &Arc<Registry>,
    ty: &CilTypeRc,
    name: &str,
    sig: TypeSig,
    attributes: FieldAttributes,
) -> Token {
    let field = Field {
        token: registry.alloc_field_token(),
        name: name.to_string(),
        visibility: MemberVisibility::Public,
        attributes,
        sig,
        declaring: OnceLock::new(),
    };
    let _ = field.declaring.set(CilTypeRef::new(ty));
    let token = field.token;
    let field = Arc::new(field);
    ty.fields.push(field.clone());
    registry.add_field(field);
    token
}

fn define_method(
    registry: &Arc<Registry>,
    ty: &CilTypeRc,
    name: &str,
    modifiers: MethodModifiers,
    sig: MethodSig,
    native: Option<NativeImpl>,
) -> Token {
    let method = Method {
        token: registry.alloc_method_token(),
        name: name.to_string(),
        visibility: MemberVisibility::Public,
        modifiers,
        sig,
        declaring: OnceLock::new(),
        slot: OnceLock::new(),
        body: RwLock::new(None),
        native: OnceLock::new(),
    };
    let _ = method.declaring.set(CilTypeRef::new(ty));
    if let Some(native) = native {
        let _ = method.native.set(native);
    }
    let token = method.token;
    let method = Arc::new(method);
    ty.methods.push(method.clone());
    registry.add_method(method);
    token
}

fn array_data<'m>(machine: &'m mut Machine, value: Option<&EmValue>) -> Result<&'m mut ObjData> {
    match value {
        Some(EmValue::Obj(reference)) => machine
            .heap_object_mut(*reference)
            .ok_or_else(|| Error::Execution("dangling heap reference".to_string())),
        other => Err(Error::Execution(format!(
            "array helper invoked on {other:?}"
        ))),
    }
}

/// Builds the core module and returns the well-known handles.
#[allow(clippy::too_many_lines)]
pub(crate) fn bootstrap(registry: &Arc<Registry>) -> CoreTypes {
    let module = Arc::new(Module::new("System.Runtime", Registry::fresh_mvid()));
    registry.add_module(module.clone());

    let ctor_flags =
        MethodModifiers::SPECIAL_NAME | MethodModifiers::RT_SPECIAL_NAME | MethodModifiers::HIDE_BY_SIG;
    let static_native = MethodModifiers::STATIC | MethodModifiers::HIDE_BY_SIG;

    // System.Object and the root hierarchy.
    let object = define_type(
        registry,
        &module,
        "System",
        "Object",
        TypeFlavor::Class,
        TypeModifiers::empty(),
        0,
    );
    let object_ctor = define_method(
        registry,
        &object,
        ".ctor",
        ctor_flags,
        MethodSig::instance(Vec::new(), TypeSig::Void),
        Some(Arc::new(|_machine: &mut Machine, _call: NativeCall| {
            Ok(EmValue::Null)
        })),
    );

    let value_type = define_type(
        registry,
        &module,
        "System",
        "ValueType",
        TypeFlavor::Class,
        TypeModifiers::ABSTRACT,
        0,
    );
    set_base(&value_type, &object);

    let string = define_type(
        registry,
        &module,
        "System",
        "String",
        TypeFlavor::Class,
        TypeModifiers::SEALED,
        0,
    );
    set_base(&string, &object);
    define_method(
        registry,
        &string,
        "get_Length",
        MethodModifiers::SPECIAL_NAME | MethodModifiers::HIDE_BY_SIG,
        MethodSig::instance(Vec::new(), TypeSig::I4),
        Some(Arc::new(|_machine: &mut Machine, call: NativeCall| match call.args.first() {
            Some(EmValue::Str(text)) => Ok(EmValue::I32(text.len() as i32)),
            other => Err(Error::Execution(format!(
                "string length on {other:?}"
            ))),
        })),
    );

    let multicast_delegate = define_type(
        registry,
        &module,
        "System",
        "MulticastDelegate",
        TypeFlavor::Class,
        TypeModifiers::ABSTRACT,
        0,
    );
    set_base(&multicast_delegate, &object);

    // System.Span<T> with its unsafe constructor and accessors.
    let span = define_type(
        registry,
        &module,
        "System",
        "Span",
        TypeFlavor::ValueType,
        TypeModifiers::SEALED,
        1,
    );
    set_base(&span, &value_type);
    let span_ctor = define_method(
        registry,
        &span,
        ".ctor",
        ctor_flags,
        MethodSig::instance(
            vec![TypeSig::Ptr(Box::new(TypeSig::Void)), TypeSig::I4],
            TypeSig::Void,
        ),
        Some(Arc::new(|_machine: &mut Machine, call: NativeCall| {
            let element = call
                .type_args
                .first()
                .cloned()
                .ok_or_else(|| Error::Execution("span constructor without element type".to_string()))?;
            let length = match call.args.get(1) {
                Some(EmValue::I32(value)) => u32::try_from(*value)
                    .map_err(|_| Error::Execution("negative span length".to_string()))?,
                other => {
                    return Err(Error::Execution(format!(
                        "span length must be int32, got {other:?}"
                    )))
                }
            };
            match call.args.first() {
                Some(EmValue::StackMem { .. }) => Ok(EmValue::Span { element, length }),
                other => Err(Error::Execution(format!(
                    "span constructor expects stack memory, got {other:?}"
                ))),
            }
        })),
    );
    define_method(
        registry,
        &span,
        "get_Length",
        MethodModifiers::SPECIAL_NAME | MethodModifiers::HIDE_BY_SIG,
        MethodSig::instance(Vec::new(), TypeSig::I4),
        Some(Arc::new(|_machine: &mut Machine, call: NativeCall| match call.args.first() {
            Some(EmValue::Span { length, .. }) => Ok(EmValue::I32(*length as i32)),
            other => Err(Error::Execution(format!("span length on {other:?}"))),
        })),
    );
    define_method(
        registry,
        &span,
        "get_Item",
        MethodModifiers::SPECIAL_NAME | MethodModifiers::HIDE_BY_SIG,
        MethodSig::instance(vec![TypeSig::I4], TypeSig::Var(0)),
        Some(Arc::new(|_machine: &mut Machine, call: NativeCall| {
            match call.args.first() {
                // Stack memory is zero-initialised; reads yield the element
                // type's default value.
                Some(EmValue::Span { element, length }) => {
                    let index = call
                        .args
                        .get(1)
                        .map_or(Ok(0), EmValue::as_i32)?;
                    if index < 0 || index as u32 >= *length {
                        return Err(Error::Execution("span index out of range".to_string()));
                    }
                    Ok(EmValue::default_for(element))
                }
                other => Err(Error::Execution(format!("span index on {other:?}"))),
            }
        })),
    );

    // The generic list interface and its array-backed implementation.
    let ilist = define_type(
        registry,
        &module,
        "System.Collections.Generic",
        "IList",
        TypeFlavor::Interface,
        TypeModifiers::INTERFACE | TypeModifiers::ABSTRACT,
        1,
    );
    let iface_flags = MethodModifiers::VIRTUAL
        | MethodModifiers::ABSTRACT
        | MethodModifiers::NEW_SLOT
        | MethodModifiers::HIDE_BY_SIG;
    let ilist_get_item = define_method(
        registry,
        &ilist,
        "get_Item",
        iface_flags | MethodModifiers::SPECIAL_NAME,
        MethodSig::instance(vec![TypeSig::I4], TypeSig::Var(0)),
        None,
    );
    let ilist_set_item = define_method(
        registry,
        &ilist,
        "set_Item",
        iface_flags | MethodModifiers::SPECIAL_NAME,
        MethodSig::instance(vec![TypeSig::I4, TypeSig::Var(0)], TypeSig::Void),
        None,
    );
    let ilist_get_count = define_method(
        registry,
        &ilist,
        "get_Count",
        iface_flags | MethodModifiers::SPECIAL_NAME,
        MethodSig::instance(Vec::new(), TypeSig::I4),
        None,
    );
    let ilist_exchange = define_method(
        registry,
        &ilist,
        "Exchange",
        iface_flags,
        MethodSig::instance(
            vec![TypeSig::I4, TypeSig::ByRef(Box::new(TypeSig::Var(0)))],
            TypeSig::Void,
        ),
        None,
    );

    let szarray = define_type(
        registry,
        &module,
        "System",
        "SzArrayHelper",
        TypeFlavor::Class,
        TypeModifiers::SEALED | TypeModifiers::SPECIAL_NAME,
        0,
    );
    set_base(&szarray, &object);
    let impl_flags = MethodModifiers::VIRTUAL
        | MethodModifiers::FINAL
        | MethodModifiers::NEW_SLOT
        | MethodModifiers::HIDE_BY_SIG;
    let szarray_get_item = define_method(
        registry,
        &szarray,
        "get_Item",
        impl_flags | MethodModifiers::SPECIAL_NAME,
        MethodSig::instance(vec![TypeSig::I4], TypeSig::Object),
        Some(Arc::new(|machine: &mut Machine, call: NativeCall| {
            let index = call.args.get(1).map_or(Ok(0), EmValue::as_i32)?;
            match array_data(machine, call.args.first())? {
                ObjData::Array { items, .. } => items
                    .get(usize::try_from(index).unwrap_or(usize::MAX))
                    .cloned()
                    .ok_or_else(|| Error::Execution("array index out of range".to_string())),
                _ => Err(Error::Execution("array helper on non-array".to_string())),
            }
        })),
    );
    let szarray_set_item = define_method(
        registry,
        &szarray,
        "set_Item",
        impl_flags | MethodModifiers::SPECIAL_NAME,
        MethodSig::instance(vec![TypeSig::I4, TypeSig::Object], TypeSig::Void),
        Some(Arc::new(|machine: &mut Machine, call: NativeCall| {
            let index = call.args.get(1).map_or(Ok(0), EmValue::as_i32)?;
            let value = call.args.get(2).cloned().unwrap_or(EmValue::Null);
            match array_data(machine, call.args.first())? {
                ObjData::Array { items, .. } => {
                    let slot = items
                        .get_mut(usize::try_from(index).unwrap_or(usize::MAX))
                        .ok_or_else(|| Error::Execution("array index out of range".to_string()))?;
                    *slot = value;
                    Ok(EmValue::Null)
                }
                _ => Err(Error::Execution("array helper on non-array".to_string())),
            }
        })),
    );
    let szarray_get_count = define_method(
        registry,
        &szarray,
        "get_Count",
        impl_flags | MethodModifiers::SPECIAL_NAME,
        MethodSig::instance(Vec::new(), TypeSig::I4),
        Some(Arc::new(|machine: &mut Machine, call: NativeCall| {
            match array_data(machine, call.args.first())? {
                ObjData::Array { items, .. } => Ok(EmValue::I32(items.len() as i32)),
                _ => Err(Error::Execution("array helper on non-array".to_string())),
            }
        })),
    );
    let szarray_exchange = define_method(
        registry,
        &szarray,
        "Exchange",
        impl_flags,
        MethodSig::instance(
            vec![TypeSig::I4, TypeSig::ByRef(Box::new(TypeSig::Object))],
            TypeSig::Void,
        ),
        Some(Arc::new(|_machine: &mut Machine, _call: NativeCall| {
            Err(Error::Unsupported(
                "by-reference array exchange is not reachable through checked dispatch"
                    .to_string(),
            ))
        })),
    );
    szarray.interface_map.insert(ilist_get_item, szarray_get_item);
    szarray.interface_map.insert(ilist_set_item, szarray_set_item);
    szarray
        .interface_map
        .insert(ilist_get_count, szarray_get_count);
    szarray.interface_map.insert(ilist_exchange, szarray_exchange);

    // The static guard type the rewriter imports.
    let guards = define_type(
        registry,
        &module,
        "System.Runtime",
        "SandboxGuards",
        TypeFlavor::Class,
        TypeModifiers::ABSTRACT | TypeModifiers::SEALED,
        0,
    );
    set_base(&guards, &object);
    let verifier_probe = define_field(
        registry,
        &guards,
        "IlVerified",
        TypeSig::Boolean,
        FieldAttributes::STATIC | FieldAttributes::SPECIAL_NAME,
    );
    let guard_probe = define_field(
        registry,
        &guards,
        "AccessGuarded",
        TypeSig::Boolean,
        FieldAttributes::STATIC | FieldAttributes::SPECIAL_NAME,
    );

    let handle = TypeSig::IntPtr;
    let check_access = define_method(
        registry,
        &guards,
        "CheckAccess",
        static_native,
        MethodSig::new(vec![handle.clone(), handle.clone()], TypeSig::Void),
        Some(Arc::new(entry::check_access)),
    );
    let check_virtual_call = define_method(
        registry,
        &guards,
        "CheckVirtualCall",
        static_native,
        MethodSig::new(
            vec![TypeSig::Object, handle.clone(), handle.clone()],
            TypeSig::Void,
        ),
        Some(Arc::new(entry::check_virtual_call)),
    );
    let check_virtual_call_constrained = define_method(
        registry,
        &guards,
        "CheckVirtualCallConstrained",
        static_native,
        MethodSig {
            has_this: false,
            generic_arity: 1,
            params: vec![TypeSig::Object, handle.clone(), handle.clone()],
            ret: TypeSig::Void,
        },
        Some(Arc::new(entry::check_virtual_call_constrained)),
    );
    let invoke_violation_handler = define_method(
        registry,
        &guards,
        "InvokeViolationHandler",
        static_native,
        MethodSig::new(vec![handle.clone(), handle.clone()], TypeSig::Void),
        Some(Arc::new(entry::invoke_violation_handler)),
    );
    let create_checked_delegate = define_method(
        registry,
        &guards,
        "CreateCheckedDelegate",
        static_native,
        MethodSig {
            has_this: false,
            generic_arity: 1,
            params: vec![TypeSig::Object, handle.clone(), handle.clone()],
            ret: TypeSig::MVar(0),
        },
        Some(Arc::new(entry::create_checked_delegate)),
    );
    let verify_span_length = define_method(
        registry,
        &guards,
        "VerifySpanLength",
        static_native,
        MethodSig {
            has_this: false,
            generic_arity: 1,
            params: vec![TypeSig::I4, TypeSig::I4],
            ret: TypeSig::Void,
        },
        Some(Arc::new(entry::verify_span_length)),
    );

    CoreTypes {
        module,
        object,
        object_ctor,
        string,
        value_type,
        multicast_delegate,
        span,
        span_ctor,
        ilist,
        szarray,
        guards,
        verifier_probe,
        guard_probe,
        check_access,
        check_virtual_call,
        check_virtual_call_constrained,
        invoke_violation_handler,
        create_checked_delegate,
        verify_span_length,
    }
}
