//! Method and field representation for the runtime metadata model.
//!
//! A [`Method`] carries either an IL body, replaced in place when the
//! instrumentor rewrites it, or a native implementation used for runtime
//! intrinsics such as the guard check entry points. [`MethodBody`] is the
//! decoded, instruction-level form the rewriter operates on; exception handler
//! clauses keep byte offsets into that instruction space.

use std::sync::{Arc, OnceLock, RwLock};

use crate::{
    assembly::instruction::Instruction,
    emulation::{EmValue, Machine, NativeCall},
    metadata::{
        flags::{ExceptionHandlerFlags, FieldAttributes, MemberVisibility, MethodModifiers},
        signatures::{MethodSig, TypeSig},
        token::Token,
        types::{CilTypeRc, CilTypeRef},
    },
    Result,
};

/// Reference counted [`Method`]
pub type MethodRc = Arc<Method>;
/// Reference counted [`Field`]
pub type FieldRc = Arc<Field>;

/// Native implementation of a runtime intrinsic method.
///
/// The guard check entry points, core library stubs, and synthesized guard-cache
/// initialisers are all expressed this way.
pub type NativeImpl = Arc<dyn Fn(&mut Machine, NativeCall) -> Result<EmValue> + Send + Sync>;

/// Exception handler defining try/catch/finally/fault regions within a method.
///
/// Offsets and lengths are byte positions in the method body's instruction
/// space. The end of a region is exclusive and may equal the body's byte length.
#[derive(Debug, Clone)]
pub struct ExceptionHandler {
    /// Flags describing the clause kind
    pub flags: ExceptionHandlerFlags,
    /// Offset in bytes of the try block from the start of the method body
    pub try_offset: u32,
    /// Length in bytes of the try block
    pub try_length: u32,
    /// Location of the handler for this try block
    pub handler_offset: u32,
    /// Size of the handler code in bytes
    pub handler_length: u32,
    /// Exception type token for typed clauses
    pub handler_type: Option<Token>,
    /// Offset of the filter expression for filter clauses
    pub filter_offset: u32,
}

/// Decoded method body.
///
/// This is the canonical representation the rewriter edits; the byte boundary is
/// crossed with [`crate::assembly::encoder::encode_body`] and
/// [`crate::assembly::decoder::decode_stream`].
#[derive(Debug, Clone)]
pub struct MethodBody {
    /// Maximum evaluation stack depth
    pub max_stack: u16,
    /// Whether locals are zero-initialised on entry
    pub init_locals: bool,
    /// Local variable signatures in slot order
    pub locals: Vec<TypeSig>,
    /// Decoded instructions with assigned byte offsets
    pub instructions: Vec<Instruction>,
    /// Exception handler clauses
    pub exception_handlers: Vec<ExceptionHandler>,
}

impl MethodBody {
    /// Byte length of the instruction stream.
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        self.instructions.iter().map(Instruction::byte_size).sum()
    }

    /// Serialises the instruction stream back to bytes.
    ///
    /// # Errors
    /// Fails when an instruction still carries an unresolved rewrite-internal
    /// operand or a branch offset out of encodable range.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        crate::assembly::encoder::encode_body(&self.instructions)
    }
}

/// A method in the runtime metadata model.
pub struct Method {
    /// Metadata token of this method
    pub token: Token,
    /// Simple name, `.ctor` and `.cctor` for constructors
    pub name: String,
    /// Declared accessibility
    pub visibility: MemberVisibility,
    /// Modifiers (static, virtual, final, abstract)
    pub modifiers: MethodModifiers,
    /// Parameter and return shape
    pub sig: MethodSig,
    /// Declaring type, set when the type is built
    pub declaring: OnceLock<CilTypeRef>,
    /// Method table slot for virtual methods
    pub slot: OnceLock<u32>,
    /// IL body; replaced in place by instrumentation
    pub body: RwLock<Option<Arc<MethodBody>>>,
    /// Native implementation for runtime intrinsics
    pub native: OnceLock<NativeImpl>,
}

impl Method {
    /// Returns true for static methods
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.modifiers.contains(MethodModifiers::STATIC)
    }

    /// Returns true for virtual methods
    #[must_use]
    pub fn is_virtual(&self) -> bool {
        self.modifiers.contains(MethodModifiers::VIRTUAL)
    }

    /// Returns true for final virtual methods
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.modifiers.contains(MethodModifiers::FINAL)
    }

    /// Returns true for instance constructors
    #[must_use]
    pub fn is_ctor(&self) -> bool {
        self.name == ".ctor"
    }

    /// Returns true for type initialisers
    #[must_use]
    pub fn is_cctor(&self) -> bool {
        self.name == ".cctor"
    }

    /// Returns true when an override of this method could execute instead of it.
    ///
    /// Non-virtual methods, final methods, and virtual methods on sealed types
    /// always resolve to themselves, which is what makes their guard results
    /// cacheable at load time.
    #[must_use]
    pub fn is_overridable(&self) -> bool {
        if !self.is_virtual() || self.is_final() {
            return false;
        }
        match self.declaring_type() {
            Some(ty) => !ty.is_sealed(),
            None => true,
        }
    }

    /// Returns the declaring type if set and still alive
    #[must_use]
    pub fn declaring_type(&self) -> Option<CilTypeRc> {
        self.declaring.get().and_then(CilTypeRef::upgrade)
    }

    /// Full display name including the declaring type.
    #[must_use]
    pub fn full_name(&self) -> String {
        match self.declaring_type() {
            Some(ty) => format!("{}::{}", ty.full_name(), self.name),
            None => self.name.clone(),
        }
    }

    /// Returns the current body, if any.
    #[must_use]
    pub fn body(&self) -> Option<Arc<MethodBody>> {
        read_lock!(self.body).clone()
    }

    /// Replaces the body, returning the previous one.
    pub fn replace_body(&self, body: MethodBody) -> Option<Arc<MethodBody>> {
        write_lock!(self.body).replace(Arc::new(body))
    }

    /// Returns the native implementation, if any.
    #[must_use]
    pub fn native(&self) -> Option<NativeImpl> {
        self.native.get().cloned()
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Method({}, {}, {:?}, {:?})",
            self.token, self.name, self.visibility, self.modifiers
        )
    }
}

/// A field in the runtime metadata model.
pub struct Field {
    /// Metadata token of this field
    pub token: Token,
    /// Simple name
    pub name: String,
    /// Declared accessibility
    pub visibility: MemberVisibility,
    /// Modifiers (static, init-only, literal)
    pub attributes: FieldAttributes,
    /// Field type
    pub sig: TypeSig,
    /// Declaring type, set when the type is built
    pub declaring: OnceLock<CilTypeRef>,
}

impl Field {
    /// Returns true for static fields
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.attributes.contains(FieldAttributes::STATIC)
    }

    /// Returns the declaring type if set and still alive
    #[must_use]
    pub fn declaring_type(&self) -> Option<CilTypeRc> {
        self.declaring.get().and_then(CilTypeRef::upgrade)
    }

    /// Full display name including the declaring type.
    #[must_use]
    pub fn full_name(&self) -> String {
        match self.declaring_type() {
            Some(ty) => format!("{}::{}", ty.full_name(), self.name),
            None => self.name.clone(),
        }
    }
}

impl std::fmt::Debug for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Field({}, {}, {:?}, {})",
            self.token, self.name, self.visibility, self.sig
        )
    }
}
