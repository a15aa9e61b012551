//! Runtime type representation.
//!
//! [`CilType`] is the unit of the runtime type model: it owns its fields, methods,
//! and nested types, and carries the dispatch structures the late-binding
//! resolver consults (the slot-indexed method table and the interface
//! implementation map).
//!
//! # Architecture
//!
//! Type graphs are cyclic (nested types reference their enclosing type, subtypes
//! reference their base), so inward edges use [`CilTypeRef`], a weak reference
//! that breaks the cycles, while ownership edges (nested lists, member lists) are
//! strong. Member lists use append-only concurrent vectors so guard-cache holder
//! types can be attached while instrumentation walks the module.

use std::sync::{Arc, OnceLock, Weak};

use crossbeam_skiplist::SkipMap;

use crate::metadata::{
    flags::{TypeModifiers, TypeVisibility},
    identity::ModuleId,
    method::{FieldRc, MethodRc},
    token::Token,
};

/// Reference counted [`CilType`]
pub type CilTypeRc = Arc<CilType>;

/// A smart reference to a [`CilType`] that uses a weak reference to prevent
/// circular dependencies.
///
/// Base and enclosing edges would otherwise form reference cycles with the
/// strong nested and member lists. The weak reference becomes invalid if the
/// referenced type is dropped; accessors return [`Option`] to handle that
/// gracefully.
#[derive(Clone)]
pub struct CilTypeRef {
    weak_ref: Weak<CilType>,
}

impl CilTypeRef {
    /// Creates a new weak reference from a strong reference to a [`CilType`].
    #[must_use]
    pub fn new(strong_ref: &CilTypeRc) -> Self {
        Self {
            weak_ref: Arc::downgrade(strong_ref),
        }
    }

    /// Attempts to upgrade the weak reference to a strong reference.
    ///
    /// Returns `None` if the referenced type has been dropped.
    #[must_use]
    pub fn upgrade(&self) -> Option<CilTypeRc> {
        self.weak_ref.upgrade()
    }

    /// Returns true while the referenced type is still alive
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.weak_ref.strong_count() > 0
    }
}

/// Categorises a type for dispatch and layout purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum TypeFlavor {
    /// Reference type with a method table
    Class,
    /// Abstract contract dispatched through implementation maps
    Interface,
    /// Value type copied on the evaluation stack
    ValueType,
    /// Value type with an integral underlying representation
    Enum,
    /// Sealed reference type invoked through its `Invoke` method
    Delegate,
}

/// A type in the runtime metadata model.
///
/// Instances are immutable once their module finishes building, with two
/// exceptions that stay safe under concurrent readers: the member lists are
/// append-only (instrumentation adds guard-cache holder types and their
/// members), and the dispatch structures are write-once.
pub struct CilType {
    /// Metadata token of this type
    pub token: Token,
    /// Identity of the declaring module
    pub module: ModuleId,
    /// Namespace, empty for nested types
    pub namespace: String,
    /// Simple name
    pub name: String,
    /// Declared visibility
    pub visibility: TypeVisibility,
    /// Semantics and modifiers beyond visibility
    pub modifiers: TypeModifiers,
    /// Dispatch and layout category
    pub flavor: TypeFlavor,
    /// Number of generic parameters, 0 for non-generic types
    pub generic_arity: u8,
    /// Base type, absent only for the root object type and interfaces
    pub base: OnceLock<CilTypeRef>,
    /// Enclosing type for nested types
    pub enclosing: OnceLock<CilTypeRef>,
    /// Nested types declared inside this type
    pub nested: boxcar::Vec<CilTypeRc>,
    /// Fields declared by this type
    pub fields: boxcar::Vec<FieldRc>,
    /// Methods declared by this type
    pub methods: boxcar::Vec<MethodRc>,
    /// Maps interface method tokens to the implementing method tokens of this type
    pub interface_map: SkipMap<Token, Token>,
    /// Slot-indexed virtual method table, set once when the type is finalised
    pub method_table: OnceLock<Vec<Token>>,
}

impl CilType {
    /// Full display name including namespace and enclosing types.
    #[must_use]
    pub fn full_name(&self) -> String {
        if let Some(enclosing) = self.enclosing.get().and_then(CilTypeRef::upgrade) {
            return format!("{}/{}", enclosing.full_name(), self.name);
        }
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    /// Returns true when the type cannot be derived from
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.modifiers.contains(TypeModifiers::SEALED)
            || matches!(
                self.flavor,
                TypeFlavor::ValueType | TypeFlavor::Enum | TypeFlavor::Delegate
            )
    }

    /// Returns true for interface types
    #[must_use]
    pub fn is_interface(&self) -> bool {
        self.flavor == TypeFlavor::Interface
    }

    /// Returns the base type if it is set and still alive
    #[must_use]
    pub fn base_type(&self) -> Option<CilTypeRc> {
        self.base.get().and_then(CilTypeRef::upgrade)
    }

    /// Returns the slot-indexed method table, empty if never finalised.
    #[must_use]
    pub fn method_table(&self) -> &[Token] {
        self.method_table.get().map_or(&[], Vec::as_slice)
    }

    /// Finds a declared field by name.
    #[must_use]
    pub fn field_by_name(&self, name: &str) -> Option<FieldRc> {
        for i in 0..self.fields.count() {
            if let Some(field) = self.fields.get(i) {
                if field.name == name {
                    return Some(field.clone());
                }
            }
        }
        None
    }

    /// Collects all declared methods with the given name.
    #[must_use]
    pub fn methods_by_name(&self, name: &str) -> Vec<MethodRc> {
        let mut found = Vec::new();
        for i in 0..self.methods.count() {
            if let Some(method) = self.methods.get(i) {
                if method.name == name {
                    found.push(method.clone());
                }
            }
        }
        found
    }

    /// Returns the token of the unique method with the given name.
    ///
    /// # Errors
    /// Returns [`crate::Error::MemberNotFound`] when no method matches and
    /// [`crate::Error::AmbiguousMember`] when several do.
    pub fn method_token(&self, name: &str) -> crate::Result<Token> {
        let matches = self.methods_by_name(name);
        match matches.len() {
            0 => Err(crate::Error::MemberNotFound {
                type_name: self.full_name(),
                member: name.to_string(),
            }),
            1 => Ok(matches[0].token),
            _ => Err(crate::Error::AmbiguousMember {
                type_name: self.full_name(),
                member: name.to_string(),
            }),
        }
    }

    /// Returns the token of the unique field with the given name.
    ///
    /// # Errors
    /// Returns [`crate::Error::MemberNotFound`] when the field does not exist.
    pub fn field_token(&self, name: &str) -> crate::Result<Token> {
        self.field_by_name(name)
            .map(|f| f.token)
            .ok_or_else(|| crate::Error::MemberNotFound {
                type_name: self.full_name(),
                member: name.to_string(),
            })
    }

    /// Looks up the implementation this type (or a base type) provides for an
    /// interface method token.
    #[must_use]
    pub fn interface_implementation(&self, iface_method: Token) -> Option<Token> {
        if let Some(entry) = self.interface_map.get(&iface_method) {
            return Some(*entry.value());
        }
        self.base_type()
            .and_then(|base| base.interface_implementation(iface_method))
    }

    /// Returns true when the given method token is an interface-implementation
    /// target of this type.
    #[must_use]
    pub fn is_interface_target(&self, method: Token) -> bool {
        self.interface_map
            .iter()
            .any(|entry| *entry.value() == method)
    }
}

impl std::fmt::Debug for CilType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CilType({}, {}, {:?}, {} fields, {} methods)",
            self.token,
            self.full_name(),
            self.flavor,
            self.fields.count(),
            self.methods.count()
        )
    }
}
