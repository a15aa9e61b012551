//! Sandbox loader: per-module policy binding and runtime check entry points.
//!
//! A [`SandboxLoader`] pairs every module it loads with an immutable
//! [`CasPolicy`] and a replaceable violation handler, instruments the module's
//! method bodies on load, and refuses unmanaged library loads outright. A
//! process-wide weak association maps each loaded module back to its loader;
//! it is the sole authoritative link from a running frame to its policy.
//!
//! # Runtime entry points
//!
//! The [`entry`] functions are the targets the rewriter bakes into guarded
//! bodies. Each receives the calling module from the executing frame, routes
//! through the weak association, and either falls through or dispatches to the
//! loader's violation handler. Callers without a registered loader are host
//! code and pass unchecked; that is the load-boundary rule.
//!
//! # Concurrency
//!
//! Policies are immutable, the module association is lock-free, and the
//! handler slot is a last-writer-wins read-write lock. No guard blocks.

use std::sync::{Arc, OnceLock, RwLock, Weak};

use crossbeam_skiplist::SkipMap;

use crate::{
    emulation::{EmValue, Machine, NativeCall},
    metadata::{
        identity::{MemberId, ModuleId},
        module::ModuleRc,
        registry::Registry,
        signatures::TypeSig,
        token::Token,
    },
    policy::CasPolicy,
    rewrite::instrument::{instrument_module, InstrumentationReport},
    runtime::{
        dispatch::{resolve_virtual, ReceiverKind},
        handler::{DefaultViolationHandler, ViolationHandler, ViolationMember},
    },
    Error, Result,
};

static LOADER_MAP: OnceLock<SkipMap<ModuleId, Weak<LoaderShared>>> = OnceLock::new();

fn loader_map() -> &'static SkipMap<ModuleId, Weak<LoaderShared>> {
    LOADER_MAP.get_or_init(SkipMap::new)
}

/// How a calling module relates to the sandbox.
pub(crate) enum CallerDisposition {
    /// No loader registered: host code, passes unchecked
    Trusted,
    /// Sandboxed under the given loader
    Sandboxed(Arc<LoaderShared>),
}

/// Routes a calling module to its loader.
///
/// # Errors
/// Returns [`Error::NoLoaderForModule`] when the module is registered but its
/// loader has been collected; that association is load-bearing and losing it
/// indicates a host bug.
pub(crate) fn disposition_for(module: ModuleId) -> Result<CallerDisposition> {
    match loader_map().get(&module) {
        None => Ok(CallerDisposition::Trusted),
        Some(entry) => entry
            .value()
            .upgrade()
            .map(CallerDisposition::Sandboxed)
            .ok_or(Error::NoLoaderForModule(module)),
    }
}

/// Shared state of one loader: policy, handler, and owned modules.
pub struct LoaderShared {
    name: String,
    registry: Arc<Registry>,
    policy: CasPolicy,
    handler: RwLock<Arc<dyn ViolationHandler>>,
    modules: boxcar::Vec<ModuleId>,
    collectible: bool,
}

impl LoaderShared {
    /// The loader's display name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The loader's immutable policy
    #[must_use]
    pub fn policy(&self) -> &CasPolicy {
        &self.policy
    }

    /// The runtime registry this loader loads into
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Returns true when the module was loaded by this loader.
    #[must_use]
    pub fn owns(&self, module: ModuleId) -> bool {
        for i in 0..self.modules.count() {
            if self.modules.get(i) == Some(&module) {
                return true;
            }
        }
        false
    }

    /// The same-assembly shortcut plus the policy lookup.
    pub(crate) fn member_allowed(&self, id: &MemberId) -> bool {
        self.owns(id.module()) || self.policy.contains(id)
    }

    /// Pure predicate: may sandboxed code under this loader access the field?
    #[must_use]
    pub fn can_access_token(&self, field: Token) -> bool {
        self.registry
            .canonical_member(field)
            .map(|id| self.member_allowed(&id))
            .unwrap_or(false)
    }

    /// Pure predicate: is the call target allowed for every possible receiver?
    ///
    /// True iff the target is declared in an assembly of this loader, or it is
    /// not overridable and the policy allows it. Overridable virtual targets
    /// can never be cached true because an override might bypass the check.
    #[must_use]
    pub fn can_call_always_token(&self, method: Token) -> bool {
        let Ok((resolved, _)) = self.registry.resolve_method(method) else {
            return false;
        };
        let Ok(id) = self.registry.canonical_member(method) else {
            return false;
        };
        if self.owns(id.module()) {
            return true;
        }
        !resolved.is_overridable() && self.policy.contains(&id)
    }

    /// Dispatches a denied access to the installed violation handler.
    pub(crate) fn violate(&self, module: ModuleId, token: Token) -> Result<()> {
        let member = ViolationMember {
            token,
            display: self.registry.member_display(token),
        };
        let handler = read_lock!(self.handler).clone();
        handler.on_violation(module, &member)
    }
}

/// An isolated loader enforcing code-access security on everything it loads.
pub struct SandboxLoader {
    shared: Arc<LoaderShared>,
}

impl SandboxLoader {
    /// Creates a loader with a default name and a non-collectible context.
    #[must_use]
    pub fn new(registry: &Arc<Registry>, policy: CasPolicy) -> Self {
        Self::with_options(registry, policy, None, false)
    }

    /// Creates a loader with an optional display name and collectible flag.
    #[must_use]
    pub fn with_options(
        registry: &Arc<Registry>,
        policy: CasPolicy,
        name: Option<&str>,
        collectible: bool,
    ) -> Self {
        SandboxLoader {
            shared: Arc::new(LoaderShared {
                name: name.unwrap_or("sandbox").to_string(),
                registry: registry.clone(),
                policy,
                handler: RwLock::new(Arc::new(DefaultViolationHandler)),
                modules: boxcar::Vec::new(),
                collectible,
            }),
        }
    }

    /// The loader's display name
    #[must_use]
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// True when the loader was created collectible
    #[must_use]
    pub fn is_collectible(&self) -> bool {
        self.shared.collectible
    }

    /// The loader's immutable policy
    #[must_use]
    pub fn policy(&self) -> &CasPolicy {
        self.shared.policy()
    }

    /// Replaces the violation handler. Last writer wins; the handler may be
    /// invoked from arbitrary threads.
    pub fn set_violation_handler(&self, handler: Arc<dyn ViolationHandler>) {
        *write_lock!(self.shared.handler) = handler;
    }

    /// The currently installed violation handler.
    #[must_use]
    pub fn violation_handler(&self) -> Arc<dyn ViolationHandler> {
        read_lock!(self.shared.handler).clone()
    }

    /// Loads a module into this sandbox.
    ///
    /// Instruments every method body with access guards, then registers the
    /// module in the process-wide loader association. Loading an
    /// already-instrumented module is a no-op. The shim table freezes at the
    /// first load.
    ///
    /// # Errors
    /// Propagates instrumentation failures ([`Error::BadImageFormat`] for
    /// malformed stack allocation patterns, [`Error::NativeLoadDenied`] for
    /// unmanaged method implementations); a failed module stays unregistered.
    pub fn load_module(&self, module: &ModuleRc) -> Result<InstrumentationReport> {
        self.shared.registry.shims().freeze();
        self.shared.registry.add_module(module.clone());

        let report = instrument_module(&self.shared.registry, &self.shared, module)?;

        if !self.shared.owns(module.id) {
            loader_map().insert(module.id, Arc::downgrade(&self.shared));
            self.shared.modules.push(module.id);
        }
        Ok(report)
    }

    /// Removes the module's entry from the process-wide loader association.
    ///
    /// Mirrors module unload: the association holds no strong reference to the
    /// module, so dropping the module plus this entry reclaims everything.
    pub fn unload_module(&self, module: ModuleId) {
        loader_map().remove(&module);
    }

    /// Refuses to load an unmanaged library.
    ///
    /// # Errors
    /// Always returns [`Error::NativeLoadDenied`]; sandboxed contexts never
    /// reach native code.
    pub fn load_native_library(&self, name: &str) -> Result<()> {
        Err(Error::NativeLoadDenied(name.to_string()))
    }

    /// Pure predicate mirror of the field guard.
    #[must_use]
    pub fn can_access(&self, field: Token) -> bool {
        self.shared.can_access_token(field)
    }

    /// Pure predicate mirror of the call guard cache initialiser.
    #[must_use]
    pub fn can_call_always(&self, method: Token) -> bool {
        self.shared.can_call_always_token(method)
    }

    /// Returns true when the module was loaded by this loader.
    #[must_use]
    pub fn owns(&self, module: ModuleId) -> bool {
        self.shared.owns(module)
    }

    pub(crate) fn shared(&self) -> &Arc<LoaderShared> {
        &self.shared
    }
}

/// Runtime check entry points called from injected guard code.
///
/// Every function takes the calling module from the executing frame and treats
/// callers without a registered loader as fully trusted.
pub mod entry {
    use super::{
        disposition_for, resolve_virtual, CallerDisposition, EmValue, Error, Machine, NativeCall,
        ReceiverKind, Result, Token, TypeSig,
    };

    fn token_arg(call: &NativeCall, index: usize) -> Result<Token> {
        match call.args.get(index) {
            Some(EmValue::Token(token)) => Ok(*token),
            other => Err(Error::Execution(format!(
                "guard entry point expected a runtime handle argument, got {other:?}"
            ))),
        }
    }

    /// Checks a guarded field access.
    pub fn check_access(machine: &mut Machine, call: NativeCall) -> Result<EmValue> {
        let caller = machine.current_module();
        let shared = match disposition_for(caller)? {
            CallerDisposition::Trusted => return Ok(EmValue::Null),
            CallerDisposition::Sandboxed(shared) => shared,
        };

        let field = token_arg(&call, 0)?;
        let id = machine.registry().canonical_member(field)?;
        if shared.member_allowed(&id) {
            return Ok(EmValue::Null);
        }
        shared.violate(caller, field)?;
        Ok(EmValue::Null)
    }

    /// Checks a guarded virtual call against its late-bound target.
    pub fn check_virtual_call(machine: &mut Machine, call: NativeCall) -> Result<EmValue> {
        let caller = machine.current_module();
        let shared = match disposition_for(caller)? {
            CallerDisposition::Trusted => return Ok(EmValue::Null),
            CallerDisposition::Sandboxed(shared) => shared,
        };

        let method = token_arg(&call, 1)?;
        let registry = machine.registry().clone();
        let (declared, _) = registry.resolve_method(method)?;

        let receiver = call
            .args
            .first()
            .ok_or_else(|| Error::Execution("virtual call check without receiver".to_string()))?;
        let kind = machine.receiver_kind(receiver)?;
        let resolved = resolve_virtual(&registry, &kind, &declared)?;

        let id = registry.canonical_member(resolved.token)?;
        if shared.member_allowed(&id) {
            return Ok(EmValue::Null);
        }
        shared.violate(caller, resolved.token)?;
        Ok(EmValue::Null)
    }

    /// Checks a guarded constrained virtual call.
    ///
    /// When the constrained type implements the method itself the dispatch is
    /// resolved against that type directly; otherwise the receiver is
    /// dereferenced and checked like an ordinary virtual call.
    pub fn check_virtual_call_constrained(
        machine: &mut Machine,
        call: NativeCall,
    ) -> Result<EmValue> {
        let caller = machine.current_module();
        let shared = match disposition_for(caller)? {
            CallerDisposition::Trusted => return Ok(EmValue::Null),
            CallerDisposition::Sandboxed(shared) => shared,
        };

        let method = token_arg(&call, 1)?;
        let registry = machine.registry().clone();
        let (declared, _) = registry.resolve_method(method)?;

        let constrained = call.method_args.first().cloned().ok_or_else(|| {
            Error::Execution("constrained check without a type argument".to_string())
        })?;
        let kind = match constrained {
            TypeSig::ValueType(token)
            | TypeSig::GenericInst {
                definition: token,
                value_type: true,
                ..
            } => ReceiverKind::Instance(registry.ty(token)?),
            _ => {
                let receiver = call.args.first().ok_or_else(|| {
                    Error::Execution("constrained check without receiver".to_string())
                })?;
                machine.receiver_kind(receiver)?
            }
        };
        let resolved = resolve_virtual(&registry, &kind, &declared)?;

        let id = registry.canonical_member(resolved.token)?;
        if shared.member_allowed(&id) {
            return Ok(EmValue::Null);
        }
        shared.violate(caller, resolved.token)?;
        Ok(EmValue::Null)
    }

    /// Dispatches a call site whose guard cache resolved to "not always
    /// allowed".
    ///
    /// Targets that became allowed after the cache froze (a sibling module
    /// loaded later into the same sandbox) are re-checked here instead of
    /// being reported.
    pub fn invoke_violation_handler(machine: &mut Machine, call: NativeCall) -> Result<EmValue> {
        let caller = machine.current_module();
        let shared = match disposition_for(caller)? {
            CallerDisposition::Trusted => return Ok(EmValue::Null),
            CallerDisposition::Sandboxed(shared) => shared,
        };

        let method = token_arg(&call, 0)?;
        if shared.can_call_always_token(method) {
            return Ok(EmValue::Null);
        }
        shared.violate(caller, method)?;
        Ok(EmValue::Null)
    }

    /// Creates a delegate after rewiring shims and checking the resolved
    /// target.
    pub fn create_checked_delegate(machine: &mut Machine, call: NativeCall) -> Result<EmValue> {
        let caller = machine.current_module();
        let registry = machine.registry().clone();

        let site = token_arg(&call, 1)?;
        let (mut method, instantiation) = registry.resolve_method(site)?;

        // Rewire to the shim when one is registered for the target's shape,
        // carrying the call site's generic arguments over.
        let mut target_token = site;
        if let Some(shim) = registry.shims().shim_for(&method) {
            method = registry.method(shim)?;
            target_token = match &instantiation {
                Some(inst) => registry.method_instance(
                    shim,
                    inst.type_args.clone(),
                    inst.method_args.clone(),
                ),
                None => shim,
            };
        }

        let receiver = call
            .args
            .first()
            .cloned()
            .ok_or_else(|| Error::Execution("delegate creation without target".to_string()))?;

        let resolved = if method.is_overridable() {
            let kind = machine.receiver_kind(&receiver)?;
            let resolved = resolve_virtual(&registry, &kind, &method)?;
            target_token = resolved.token;
            resolved
        } else {
            method
        };

        if let CallerDisposition::Sandboxed(shared) = disposition_for(caller)? {
            let id = registry.canonical_member(resolved.token)?;
            if !shared.member_allowed(&id) {
                shared.violate(caller, resolved.token)?;
            }
        }

        Ok(machine.alloc_delegate(target_token, receiver))
    }

    /// Validates a stack allocation against the span it constructs.
    ///
    /// The byte count handed to the allocation and the element count handed to
    /// the span constructor may diverge at runtime; a mismatch throws a
    /// bad-image error before the span is constructed.
    pub fn verify_span_length(machine: &mut Machine, call: NativeCall) -> Result<EmValue> {
        let element = call.method_args.first().ok_or_else(|| {
            Error::Execution("stack allocation check without element type".to_string())
        })?;
        let size = element
            .byte_size(machine.registry())
            .ok_or_else(|| bad_image!("stack allocation of managed element type {}", element))?;

        let length = match call.args.first() {
            Some(EmValue::I32(value)) => i64::from(*value),
            other => {
                return Err(Error::Execution(format!(
                    "stack allocation length must be int32, got {other:?}"
                )))
            }
        };
        let byte_count = match call.args.get(1) {
            Some(EmValue::I32(value)) => i64::from(*value),
            other => {
                return Err(Error::Execution(format!(
                    "stack allocation byte count must be int32, got {other:?}"
                )))
            }
        };

        if length * i64::from(size) != byte_count {
            return Err(bad_image!(
                "stack allocation of {} bytes does not match span of {} elements of {} bytes",
                byte_count,
                length,
                size
            ));
        }
        Ok(EmValue::Null)
    }
}
