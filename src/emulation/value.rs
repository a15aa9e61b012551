//! Runtime value representation for the emulation engine.

use std::sync::Arc;

use crate::{
    metadata::{signatures::TypeSig, token::Token},
    Error, Result,
};

/// Reference to a heap-allocated object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapRef(pub(crate) usize);

/// A value on the evaluation stack, in a local, or in a field.
#[derive(Debug, Clone)]
pub enum EmValue {
    /// Null reference, also used for void results
    Null,
    /// 32-bit integer; booleans and characters widen to this on the stack
    I32(i32),
    /// 64-bit integer
    I64(i64),
    /// Floating point value
    F64(f64),
    /// Immutable string
    Str(Arc<str>),
    /// Reference into the managed heap
    Obj(HeapRef),
    /// Runtime handle pushed by `ldtoken` and function-pointer loads
    Token(Token),
    /// Result of a stack allocation, carrying its byte count
    StackMem {
        /// Allocated byte count
        bytes: u32,
    },
    /// A constructed span over zeroed stack memory
    Span {
        /// Element type
        element: TypeSig,
        /// Element count
        length: u32,
    },
}

impl EmValue {
    /// Branch truthiness, mirroring `brtrue` semantics.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            EmValue::Null => false,
            EmValue::I32(value) => *value != 0,
            EmValue::I64(value) => *value != 0,
            EmValue::F64(value) => *value != 0.0,
            _ => true,
        }
    }

    /// Extracts a 32-bit integer.
    ///
    /// # Errors
    /// Fails for non-integer values.
    pub fn as_i32(&self) -> Result<i32> {
        match self {
            EmValue::I32(value) => Ok(*value),
            other => Err(Error::Execution(format!("expected int32, got {other:?}"))),
        }
    }

    /// Zero value for a signature, used for locals and untouched fields.
    #[must_use]
    pub fn default_for(sig: &TypeSig) -> EmValue {
        match sig {
            TypeSig::Boolean
            | TypeSig::Char
            | TypeSig::I1
            | TypeSig::U1
            | TypeSig::I2
            | TypeSig::U2
            | TypeSig::I4
            | TypeSig::U4 => EmValue::I32(0),
            TypeSig::I8 | TypeSig::U8 | TypeSig::IntPtr | TypeSig::UIntPtr => EmValue::I64(0),
            TypeSig::R4 | TypeSig::R8 => EmValue::F64(0.0),
            _ => EmValue::Null,
        }
    }
}

/// Arguments handed to a native method implementation.
///
/// Call-site generic arguments are split the same way signatures are resolved:
/// declaring-type arguments and method arguments.
#[derive(Debug, Clone)]
pub struct NativeCall {
    /// Evaluated arguments in declaration order, receiver first for instance
    /// methods
    pub args: Vec<EmValue>,
    /// Declaring-type generic arguments of the call site
    pub type_args: Vec<TypeSig>,
    /// Method generic arguments of the call site
    pub method_args: Vec<TypeSig>,
}

impl NativeCall {
    /// A call with plain arguments and no generic context.
    #[must_use]
    pub fn plain(args: Vec<EmValue>) -> Self {
        NativeCall {
            args,
            type_args: Vec::new(),
            method_args: Vec::new(),
        }
    }
}
