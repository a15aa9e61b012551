//! Compact type and method signatures for the runtime metadata model.
//!
//! Signatures describe the shape of fields, parameters, and return values without
//! holding references into the type registry. Generic positions are represented
//! structurally (`Var` for declaring-type parameters, `MVar` for method
//! parameters) and resolved against a concrete instantiation with
//! [`TypeSig::instantiate`], which is what the rewriter uses to type the spill
//! locals of guarded virtual calls.
//!
//! # Key Types
//! - [`TypeSig`] - Structural type signature
//! - [`MethodSig`] - Parameter and return shape of one method

use std::fmt;

use crate::metadata::{registry::Registry, token::Token};
use rustc_hash::FxHashSet;

/// A structural type signature.
///
/// Token-bearing variants (`Class`, `ValueType`, `GenericInst`) reference type
/// definitions in the registry; everything else is self-describing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeSig {
    /// No value
    Void,
    /// Boolean, one byte on the heap, `int32` on the evaluation stack
    Boolean,
    /// UTF-16 code unit
    Char,
    /// Signed 8-bit integer
    I1,
    /// Unsigned 8-bit integer
    U1,
    /// Signed 16-bit integer
    I2,
    /// Unsigned 16-bit integer
    U2,
    /// Signed 32-bit integer
    I4,
    /// Unsigned 32-bit integer
    U4,
    /// Signed 64-bit integer
    I8,
    /// Unsigned 64-bit integer
    U8,
    /// 32-bit floating point
    R4,
    /// 64-bit floating point
    R8,
    /// Native-sized signed integer
    IntPtr,
    /// Native-sized unsigned integer
    UIntPtr,
    /// Immutable string reference
    String,
    /// Root object reference
    Object,
    /// Reference type definition
    Class(Token),
    /// Value type definition
    ValueType(Token),
    /// Single-dimensional, zero-based array
    SzArray(Box<TypeSig>),
    /// Managed pointer
    ByRef(Box<TypeSig>),
    /// Unmanaged pointer
    Ptr(Box<TypeSig>),
    /// Instantiated generic type
    GenericInst {
        /// Open definition token
        definition: Token,
        /// True when the definition is a value type
        value_type: bool,
        /// Type arguments, in declaration order
        args: Vec<TypeSig>,
    },
    /// Generic parameter of the declaring type
    Var(u16),
    /// Generic parameter of the method
    MVar(u16),
}

impl TypeSig {
    /// Resolves generic positions against a concrete call-site instantiation.
    ///
    /// Declaring-type parameters consume `type_args`, method parameters consume
    /// `method_args`. Array, by-reference, pointer, and nested generic-instance
    /// shapes recurse structurally. Positions without a matching argument are
    /// left open.
    #[must_use]
    pub fn instantiate(&self, type_args: &[TypeSig], method_args: &[TypeSig]) -> TypeSig {
        match self {
            TypeSig::Var(i) => type_args
                .get(*i as usize)
                .cloned()
                .unwrap_or_else(|| self.clone()),
            TypeSig::MVar(i) => method_args
                .get(*i as usize)
                .cloned()
                .unwrap_or_else(|| self.clone()),
            TypeSig::SzArray(inner) => {
                TypeSig::SzArray(Box::new(inner.instantiate(type_args, method_args)))
            }
            TypeSig::ByRef(inner) => {
                TypeSig::ByRef(Box::new(inner.instantiate(type_args, method_args)))
            }
            TypeSig::Ptr(inner) => {
                TypeSig::Ptr(Box::new(inner.instantiate(type_args, method_args)))
            }
            TypeSig::GenericInst {
                definition,
                value_type,
                args,
            } => TypeSig::GenericInst {
                definition: *definition,
                value_type: *value_type,
                args: args
                    .iter()
                    .map(|a| a.instantiate(type_args, method_args))
                    .collect(),
            },
            other => other.clone(),
        }
    }

    /// Collapses constructed generics to their open definition.
    ///
    /// `List<int>` and `List<string>` compare equal after opening, which makes
    /// generic signatures comparable during binding refinement.
    #[must_use]
    pub fn open(&self) -> TypeSig {
        match self {
            TypeSig::GenericInst {
                definition,
                value_type,
                ..
            } => {
                if *value_type {
                    TypeSig::ValueType(*definition)
                } else {
                    TypeSig::Class(*definition)
                }
            }
            TypeSig::SzArray(inner) => TypeSig::SzArray(Box::new(inner.open())),
            TypeSig::ByRef(inner) => TypeSig::ByRef(Box::new(inner.open())),
            TypeSig::Ptr(inner) => TypeSig::Ptr(Box::new(inner.open())),
            other => other.clone(),
        }
    }

    /// Returns true for by-reference signatures
    #[must_use]
    pub fn is_byref(&self) -> bool {
        matches!(self, TypeSig::ByRef(_))
    }

    /// Returns the unaligned byte size of an unmanaged value of this type.
    ///
    /// `None` means the type is managed (or not provably unmanaged) and has no
    /// stack-allocatable size. Value-type structs recurse over their instance
    /// fields; a cycle in the field graph yields `None`.
    #[must_use]
    pub fn byte_size(&self, registry: &Registry) -> Option<u32> {
        self.byte_size_guarded(registry, &mut FxHashSet::default())
    }

    fn byte_size_guarded(&self, registry: &Registry, seen: &mut FxHashSet<Token>) -> Option<u32> {
        match self {
            TypeSig::Boolean | TypeSig::I1 | TypeSig::U1 => Some(1),
            TypeSig::Char | TypeSig::I2 | TypeSig::U2 => Some(2),
            TypeSig::I4 | TypeSig::U4 | TypeSig::R4 => Some(4),
            TypeSig::I8 | TypeSig::U8 | TypeSig::R8 => Some(8),
            TypeSig::IntPtr | TypeSig::UIntPtr | TypeSig::Ptr(_) => Some(8),
            TypeSig::ValueType(token) => {
                if !seen.insert(*token) {
                    return None;
                }
                let ty = registry.ty(*token).ok()?;
                let mut total = 0u32;
                for i in 0..ty.fields.count() {
                    let field = ty.fields.get(i)?;
                    if field.is_static() {
                        continue;
                    }
                    total = total.checked_add(field.sig.byte_size_guarded(registry, seen)?)?;
                }
                seen.remove(token);
                Some(total)
            }
            TypeSig::GenericInst {
                definition,
                value_type: true,
                args,
            } => {
                if !seen.insert(*definition) {
                    return None;
                }
                let ty = registry.ty(*definition).ok()?;
                let mut total = 0u32;
                for i in 0..ty.fields.count() {
                    let field = ty.fields.get(i)?;
                    if field.is_static() {
                        continue;
                    }
                    let resolved = field.sig.instantiate(args, &[]);
                    total = total.checked_add(resolved.byte_size_guarded(registry, seen)?)?;
                }
                seen.remove(definition);
                Some(total)
            }
            _ => None,
        }
    }

    /// Returns true when this type satisfies the unmanaged constraint.
    ///
    /// Primitives, pointers, enums, and value structs whose instance fields are
    /// all recursively unmanaged qualify. Open generic positions do not.
    #[must_use]
    pub fn is_unmanaged(&self, registry: &Registry) -> bool {
        self.byte_size(registry).is_some()
    }
}

impl fmt::Display for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSig::Void => write!(f, "void"),
            TypeSig::Boolean => write!(f, "bool"),
            TypeSig::Char => write!(f, "char"),
            TypeSig::I1 => write!(f, "int8"),
            TypeSig::U1 => write!(f, "uint8"),
            TypeSig::I2 => write!(f, "int16"),
            TypeSig::U2 => write!(f, "uint16"),
            TypeSig::I4 => write!(f, "int32"),
            TypeSig::U4 => write!(f, "uint32"),
            TypeSig::I8 => write!(f, "int64"),
            TypeSig::U8 => write!(f, "uint64"),
            TypeSig::R4 => write!(f, "float32"),
            TypeSig::R8 => write!(f, "float64"),
            TypeSig::IntPtr => write!(f, "native int"),
            TypeSig::UIntPtr => write!(f, "native uint"),
            TypeSig::String => write!(f, "string"),
            TypeSig::Object => write!(f, "object"),
            TypeSig::Class(token) => write!(f, "class {token}"),
            TypeSig::ValueType(token) => write!(f, "valuetype {token}"),
            TypeSig::SzArray(inner) => write!(f, "{inner}[]"),
            TypeSig::ByRef(inner) => write!(f, "{inner}&"),
            TypeSig::Ptr(inner) => write!(f, "{inner}*"),
            TypeSig::GenericInst {
                definition, args, ..
            } => {
                write!(f, "{definition}<")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ">")
            }
            TypeSig::Var(i) => write!(f, "!{i}"),
            TypeSig::MVar(i) => write!(f, "!!{i}"),
        }
    }
}

/// Parameter and return shape of one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSig {
    /// True for instance methods and constructors
    pub has_this: bool,
    /// Number of generic parameters declared by the method itself
    pub generic_arity: u8,
    /// Parameter signatures in declaration order, excluding the receiver
    pub params: Vec<TypeSig>,
    /// Return signature, `Void` for none
    pub ret: TypeSig,
}

impl MethodSig {
    /// Creates a static signature with the given parameters and return type.
    #[must_use]
    pub fn new(params: Vec<TypeSig>, ret: TypeSig) -> Self {
        MethodSig {
            has_this: false,
            generic_arity: 0,
            params,
            ret,
        }
    }

    /// Creates an instance signature with the given parameters and return type.
    #[must_use]
    pub fn instance(params: Vec<TypeSig>, ret: TypeSig) -> Self {
        MethodSig {
            has_this: true,
            generic_arity: 0,
            params,
            ret,
        }
    }

    /// Collapses constructed generics inside the signature to open definitions.
    #[must_use]
    pub fn open(&self) -> MethodSig {
        MethodSig {
            has_this: self.has_this,
            generic_arity: self.generic_arity,
            params: self.params.iter().map(TypeSig::open).collect(),
            ret: self.ret.open(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::token::table;

    #[test]
    fn test_instantiate_substitutes_positions() {
        let sig = TypeSig::Var(0);
        let resolved = sig.instantiate(&[TypeSig::I4], &[]);
        assert_eq!(resolved, TypeSig::I4);

        let sig = TypeSig::MVar(1);
        let resolved = sig.instantiate(&[], &[TypeSig::String, TypeSig::I8]);
        assert_eq!(resolved, TypeSig::I8);
    }

    #[test]
    fn test_instantiate_recurses_structurally() {
        let token = Token::from_parts(table::TYPE_DEF, 9);
        let sig = TypeSig::SzArray(Box::new(TypeSig::GenericInst {
            definition: token,
            value_type: false,
            args: vec![TypeSig::ByRef(Box::new(TypeSig::MVar(0)))],
        }));

        let resolved = sig.instantiate(&[], &[TypeSig::I4]);
        assert_eq!(
            resolved,
            TypeSig::SzArray(Box::new(TypeSig::GenericInst {
                definition: token,
                value_type: false,
                args: vec![TypeSig::ByRef(Box::new(TypeSig::I4))],
            }))
        );
    }

    #[test]
    fn test_instantiate_leaves_unmatched_positions_open() {
        let sig = TypeSig::Var(3);
        assert_eq!(sig.instantiate(&[TypeSig::I4], &[]), TypeSig::Var(3));
    }

    #[test]
    fn test_open_collapses_generic_instantiations() {
        let token = Token::from_parts(table::TYPE_DEF, 5);
        let closed_int = TypeSig::GenericInst {
            definition: token,
            value_type: false,
            args: vec![TypeSig::I4],
        };
        let closed_str = TypeSig::GenericInst {
            definition: token,
            value_type: false,
            args: vec![TypeSig::String],
        };

        assert_eq!(closed_int.open(), closed_str.open());
        assert_eq!(closed_int.open(), TypeSig::Class(token));
    }

    #[test]
    fn test_method_sig_open() {
        let token = Token::from_parts(table::TYPE_DEF, 5);
        let sig = MethodSig::new(
            vec![TypeSig::GenericInst {
                definition: token,
                value_type: false,
                args: vec![TypeSig::I4],
            }],
            TypeSig::Void,
        );
        assert_eq!(sig.open().params[0], TypeSig::Class(token));
    }

    #[test]
    fn test_display() {
        assert_eq!(TypeSig::I4.to_string(), "int32");
        assert_eq!(
            TypeSig::SzArray(Box::new(TypeSig::I4)).to_string(),
            "int32[]"
        );
        assert_eq!(TypeSig::ByRef(Box::new(TypeSig::R8)).to_string(), "float64&");
        assert_eq!(TypeSig::MVar(0).to_string(), "!!0");
    }
}
