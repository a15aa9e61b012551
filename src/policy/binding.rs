//! Accessibility-scoped member selection for one target type.
//!
//! A [`TypeBinding`] collects the members of a type that a policy author wants
//! to expose, driven by an [`Accessibility`] level. Construction applies the
//! automatic inclusion rules (interface-implementation methods, visibility
//! thresholds, recursive nested types); the `with_*` refinement methods add
//! individual members and fail loudly when the selection is not unique.

use crate::{
    metadata::{
        flags::{MemberVisibility, TypeVisibility},
        identity::MemberId,
        signatures::TypeSig,
        types::{CilTypeRc, TypeFlavor},
    },
    Error, Result,
};

/// Accessibility level of a binding.
///
/// The ordering is total and monotone: a higher level includes every member
/// visible at the lower levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display)]
pub enum Accessibility {
    /// No members
    None,
    /// Public members only
    Public,
    /// Public and protected members
    Protected,
    /// All members
    Private,
}

/// Minimum accessibility level at which a member becomes visible.
fn member_requirement(visibility: MemberVisibility) -> Accessibility {
    match visibility {
        MemberVisibility::Public => Accessibility::Public,
        MemberVisibility::Family | MemberVisibility::FamOrAssem => Accessibility::Protected,
        _ => Accessibility::Private,
    }
}

/// Accessibility level a nested type declares for itself.
fn nested_declared(visibility: TypeVisibility) -> Accessibility {
    match visibility {
        TypeVisibility::NestedPublic | TypeVisibility::Public => Accessibility::Public,
        TypeVisibility::NestedFamily | TypeVisibility::NestedFamOrAssem => {
            Accessibility::Protected
        }
        _ => Accessibility::Private,
    }
}

/// Effective level for a nested type enumerated under a parent level.
///
/// A nested type declared tighter than the parent's level is clamped: class and
/// interface nested types fall back to their public surface, other kinds drop
/// out entirely. A `Private` parent level always flows through.
fn effective_accessibility(nested: &CilTypeRc, parent_level: Accessibility) -> Accessibility {
    let declared = nested_declared(nested.visibility);
    if declared > parent_level && parent_level != Accessibility::Private {
        match nested.flavor {
            TypeFlavor::Class | TypeFlavor::Interface => parent_level.min(Accessibility::Public),
            _ => Accessibility::None,
        }
    } else {
        parent_level
    }
}

/// Collects the allowed members of a single target type.
pub struct TypeBinding {
    target: CilTypeRc,
    level: Accessibility,
    members: Vec<MemberId>,
}

impl TypeBinding {
    /// Constructs a binding for `target` at the given accessibility level.
    ///
    /// Auto-includes interface-implementation methods of the type regardless of
    /// their declared visibility, all fields, constructors, and methods visible
    /// at or below the level, and recursively the nested types whose effective
    /// accessibility is not `None`.
    #[must_use]
    pub fn new(target: &CilTypeRc, level: Accessibility) -> Self {
        let mut binding = TypeBinding {
            target: target.clone(),
            level,
            members: Vec::new(),
        };
        if level == Accessibility::None {
            return binding;
        }

        for i in 0..target.fields.count() {
            if let Some(field) = target.fields.get(i) {
                if member_requirement(field.visibility) <= level {
                    binding.members.push(MemberId::new(target.module, field.token));
                }
            }
        }

        for i in 0..target.methods.count() {
            if let Some(method) = target.methods.get(i) {
                let included = target.is_interface_target(method.token)
                    || member_requirement(method.visibility) <= level;
                if included {
                    binding
                        .members
                        .push(MemberId::new(target.module, method.token));
                }
            }
        }

        for i in 0..target.nested.count() {
            if let Some(nested) = target.nested.get(i) {
                let effective = effective_accessibility(nested, level);
                if effective != Accessibility::None {
                    let nested_binding = TypeBinding::new(nested, effective);
                    binding.members.extend(nested_binding.members);
                }
            }
        }

        binding
    }

    /// The binding's target type
    #[must_use]
    pub fn target(&self) -> &CilTypeRc {
        &self.target
    }

    /// The level the binding was constructed at
    #[must_use]
    pub fn level(&self) -> Accessibility {
        self.level
    }

    /// The collected member identities
    #[must_use]
    pub fn member_ids(&self) -> &[MemberId] {
        &self.members
    }

    /// Returns true when the binding already contains the member.
    #[must_use]
    pub fn contains(&self, id: &MemberId) -> bool {
        self.members.contains(id)
    }

    /// Adds the unique instance constructor of the target type.
    ///
    /// # Errors
    /// Fails when the type declares no constructor or more than one.
    pub fn with_constructor(self) -> Result<Self> {
        self.add_unique_method(".ctor", None)
    }

    /// Adds the instance constructor with the given parameter signature.
    ///
    /// # Errors
    /// Fails when no constructor matches.
    pub fn with_constructor_sig(self, params: &[TypeSig]) -> Result<Self> {
        self.add_unique_method(".ctor", Some(params))
    }

    /// Adds the field with the given name.
    ///
    /// # Errors
    /// Fails when the field does not exist.
    pub fn with_field(mut self, name: &str) -> Result<Self> {
        let field = self
            .target
            .field_by_name(name)
            .ok_or_else(|| Error::MemberNotFound {
                type_name: self.target.full_name(),
                member: name.to_string(),
            })?;
        let id = MemberId::new(self.target.module, field.token);
        if !self.members.contains(&id) {
            self.members.push(id);
        }
        Ok(self)
    }

    /// Adds the unique method with the given name.
    ///
    /// # Errors
    /// Fails when no method matches, or when the name is overloaded; use
    /// [`TypeBinding::with_method_sig`] to disambiguate overloads.
    pub fn with_method(self, name: &str) -> Result<Self> {
        self.add_unique_method(name, None)
    }

    /// Adds the method with the given name and parameter signature.
    ///
    /// Signature comparison collapses constructed generics to their open
    /// definitions, so `List<int>` and `List<string>` parameters compare equal.
    ///
    /// # Errors
    /// Fails when no method matches the pair.
    pub fn with_method_sig(self, name: &str, params: &[TypeSig]) -> Result<Self> {
        self.add_unique_method(name, Some(params))
    }

    fn add_unique_method(mut self, name: &str, params: Option<&[TypeSig]>) -> Result<Self> {
        let mut matches = self.target.methods_by_name(name);
        if let Some(params) = params {
            let open: Vec<TypeSig> = params.iter().map(TypeSig::open).collect();
            matches.retain(|m| {
                let candidate: Vec<TypeSig> = m.sig.params.iter().map(TypeSig::open).collect();
                candidate == open
            });
        }

        match matches.len() {
            0 => Err(Error::MemberNotFound {
                type_name: self.target.full_name(),
                member: name.to_string(),
            }),
            1 => {
                let id = MemberId::new(self.target.module, matches[0].token);
                if !self.members.contains(&id) {
                    self.members.push(id);
                }
                Ok(self)
            }
            _ => Err(Error::AmbiguousMember {
                type_name: self.target.full_name(),
                member: name.to_string(),
            }),
        }
    }
}
