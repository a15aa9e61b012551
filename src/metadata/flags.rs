//! Attribute flags for the runtime metadata model.
//!
//! This module defines the bitflags and visibility enumerations used to represent
//! type, method, and field attributes. The raw encodings follow the standard CLI
//! metadata layout so hosts can feed attribute words straight through.

use bitflags::bitflags;

/// Bitmask for member access extraction from raw attribute words
pub const MEMBER_ACCESS_MASK: u32 = 0x0007;
/// Bitmask for type visibility extraction from raw attribute words
pub const TYPE_VISIBILITY_MASK: u32 = 0x0007;

/// Declared visibility of a type.
///
/// The nested variants only occur on types enclosed in another type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeVisibility {
    /// Visible only inside the declaring module
    NotPublic,
    /// Visible to any referencing module
    Public,
    /// Nested type visible wherever the enclosing type is
    NestedPublic,
    /// Nested type visible only to the enclosing type
    NestedPrivate,
    /// Nested type visible to the enclosing type and its subtypes
    NestedFamily,
    /// Nested type visible inside the declaring module
    NestedAssembly,
    /// Nested type visible to subtypes within the declaring module
    NestedFamAndAssem,
    /// Nested type visible to subtypes or anything in the declaring module
    NestedFamOrAssem,
}

impl TypeVisibility {
    /// Extract the visibility from raw type attributes
    #[must_use]
    pub fn from_raw(flags: u32) -> Self {
        match flags & TYPE_VISIBILITY_MASK {
            1 => TypeVisibility::Public,
            2 => TypeVisibility::NestedPublic,
            3 => TypeVisibility::NestedPrivate,
            4 => TypeVisibility::NestedFamily,
            5 => TypeVisibility::NestedAssembly,
            6 => TypeVisibility::NestedFamAndAssem,
            7 => TypeVisibility::NestedFamOrAssem,
            _ => TypeVisibility::NotPublic,
        }
    }

    /// Returns true for the nested variants
    #[must_use]
    pub fn is_nested(&self) -> bool {
        !matches!(self, TypeVisibility::NotPublic | TypeVisibility::Public)
    }
}

/// Declared accessibility of a field, method, or constructor.
///
/// Fields and methods share this encoding in the low three attribute bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberVisibility {
    /// Member not referenceable
    CompilerControlled,
    /// Accessible only by the declaring type
    Private,
    /// Accessible by subtypes only within the declaring module
    FamAndAssem,
    /// Accessible by anything within the declaring module
    Assembly,
    /// Accessible only by the declaring type and its subtypes
    Family,
    /// Accessible by subtypes anywhere, plus anything in the declaring module
    FamOrAssem,
    /// Accessible by anything that can see the declaring scope
    Public,
}

impl MemberVisibility {
    /// Extract the accessibility from raw member attributes
    #[must_use]
    pub fn from_raw(flags: u32) -> Self {
        match flags & MEMBER_ACCESS_MASK {
            1 => MemberVisibility::Private,
            2 => MemberVisibility::FamAndAssem,
            3 => MemberVisibility::Assembly,
            4 => MemberVisibility::Family,
            5 => MemberVisibility::FamOrAssem,
            6 => MemberVisibility::Public,
            _ => MemberVisibility::CompilerControlled,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Type semantics and modifiers beyond visibility
    pub struct TypeModifiers: u32 {
        /// Type is an interface
        const INTERFACE = 0x0020;
        /// Type cannot be instantiated directly
        const ABSTRACT = 0x0080;
        /// Type cannot be derived from
        const SEALED = 0x0100;
        /// Type name has special meaning to tooling
        const SPECIAL_NAME = 0x0400;
        /// Static initialisation may be deferred until first static field access
        const BEFORE_FIELD_INIT = 0x0010_0000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Method modifiers and properties
    pub struct MethodModifiers: u32 {
        /// Defined on type, else per instance
        const STATIC = 0x0010;
        /// Method cannot be overridden
        const FINAL = 0x0020;
        /// Method is virtual
        const VIRTUAL = 0x0040;
        /// Method hides by name and signature, else just by name
        const HIDE_BY_SIG = 0x0080;
        /// Method always gets a new slot in the method table
        const NEW_SLOT = 0x0100;
        /// Method does not provide an implementation
        const ABSTRACT = 0x0400;
        /// Method is special
        const SPECIAL_NAME = 0x0800;
        /// Runtime provides special behavior, depending upon the name of the method
        const RT_SPECIAL_NAME = 0x1000;
        /// Implementation is forwarded through unmanaged interop
        const PINVOKE_IMPL = 0x2000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Field modifiers and properties
    pub struct FieldAttributes: u32 {
        /// Defined on type, else per instance
        const STATIC = 0x0010;
        /// Field may only be initialised, not written after construction
        const INIT_ONLY = 0x0020;
        /// Value is a compile-time constant
        const LITERAL = 0x0040;
        /// Field is special
        const SPECIAL_NAME = 0x0200;
        /// Runtime provides special behavior
        const RT_SPECIAL_NAME = 0x0400;
    }
}

bitflags! {
    /// Exception handler flags defining the type of exception handling clause.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExceptionHandlerFlags: u16 {
        /// A typed exception clause
        const EXCEPTION = 0x0000;
        /// An exception filter and handler clause
        const FILTER = 0x0001;
        /// A finally clause
        const FINALLY = 0x0002;
        /// A fault clause (finally that executes only on exception)
        const FAULT = 0x0004;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_visibility_from_raw() {
        assert_eq!(TypeVisibility::from_raw(0), TypeVisibility::NotPublic);
        assert_eq!(TypeVisibility::from_raw(1), TypeVisibility::Public);
        assert_eq!(TypeVisibility::from_raw(2), TypeVisibility::NestedPublic);
        assert_eq!(TypeVisibility::from_raw(3), TypeVisibility::NestedPrivate);
        // High bits are ignored
        assert_eq!(
            TypeVisibility::from_raw(0x0100 | 4),
            TypeVisibility::NestedFamily
        );
    }

    #[test]
    fn test_type_visibility_is_nested() {
        assert!(!TypeVisibility::Public.is_nested());
        assert!(!TypeVisibility::NotPublic.is_nested());
        assert!(TypeVisibility::NestedPrivate.is_nested());
        assert!(TypeVisibility::NestedFamOrAssem.is_nested());
    }

    #[test]
    fn test_member_visibility_from_raw() {
        assert_eq!(
            MemberVisibility::from_raw(0),
            MemberVisibility::CompilerControlled
        );
        assert_eq!(MemberVisibility::from_raw(1), MemberVisibility::Private);
        assert_eq!(MemberVisibility::from_raw(4), MemberVisibility::Family);
        assert_eq!(MemberVisibility::from_raw(6), MemberVisibility::Public);
        assert_eq!(
            MemberVisibility::from_raw(0x0010 | 6),
            MemberVisibility::Public
        );
    }

    #[test]
    fn test_method_modifiers() {
        let flags = MethodModifiers::STATIC | MethodModifiers::SPECIAL_NAME;
        assert!(flags.contains(MethodModifiers::STATIC));
        assert!(!flags.contains(MethodModifiers::VIRTUAL));
    }

    #[test]
    fn test_exception_handler_flags() {
        let finally = ExceptionHandlerFlags::FINALLY;
        assert!(finally.contains(ExceptionHandlerFlags::FINALLY));
        assert_eq!(ExceptionHandlerFlags::EXCEPTION.bits(), 0);
    }
}
