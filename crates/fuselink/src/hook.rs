//! Hooks: the user-facing connection points of the engine.
//!
//! A hook references exactly one cell at every moment. Joining hooks fuses
//! their cells into one domain; isolating a hook splits it back out. Writes
//! go through [`Hook::submit`], which routes the proposed value through the
//! coordinator's full submission pipeline, so every validator in the fusion
//! domain gets a say before anything changes.
//!
//! Two handle flavors share one underlying state:
//!
//! - [`Hook<T>`] — writable. Floating hooks and composite primaries.
//! - [`ReadOnlyHook<T>`] — no write path. Composite secondaries.
//!
//! Cloning a handle creates a new reference to the **same** hook.
//!
//! # Invariants
//!
//! 1. `hook ∈ hook.cell().members` at all times; joins and isolates
//!    preserve this.
//! 2. Listeners are invoked in insertion order; duplicate adds (same `Arc`)
//!    are idempotent; removing an absent listener is a silent no-op.
//! 3. A listener panic never prevents later listeners from running.

use std::marker::PhantomData;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};

use crate::cell::{CellCore, CellRef};
use crate::composite::CompositeCore;
use crate::coordinator::Coordinator;
use crate::error::SubmitError;
use crate::fusion::{self, JoinValue};
use crate::logging::warn;
use crate::submission::SubmitMode;
use crate::value::{downcast_value, dyn_value, DynValue, Value};

/// Stable identity of a hook, for diagnostics and deterministic validation
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HookId(pub(crate) u64);

impl std::fmt::Display for HookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Argument-less change listener. The value source is the hook it is
/// attached to.
pub type Listener = Arc<dyn Fn() + Send + Sync>;

/// Post-commit reaction callback. The result is advisory: a failure is
/// logged, never rolled back.
pub type Reaction = Arc<dyn Fn() -> Result<(), String> + Send + Sync>;

pub(crate) type ValidatorFn = Arc<dyn Fn(&dyn Value) -> Result<(), String> + Send + Sync>;

/// Role of an owned hook inside its composite's binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindingRole {
    Primary,
    Secondary,
}

/// Back-reference from an owned hook to its composite.
pub(crate) struct Binding {
    pub(crate) owner: Weak<CompositeCore>,
    pub(crate) key: String,
    pub(crate) role: BindingRole,
}

/// Shared state behind both hook handle flavors.
pub(crate) struct HookCore {
    id: HookId,
    coordinator: Coordinator,
    cell: RwLock<Arc<CellCore>>,
    listeners: Mutex<Vec<Listener>>,
    validator: Option<ValidatorFn>,
    reaction: Option<Reaction>,
    binding: OnceLock<Binding>,
}

impl HookCore {
    pub(crate) fn new(
        coordinator: Coordinator,
        cell: Arc<CellCore>,
        validator: Option<ValidatorFn>,
        reaction: Option<Reaction>,
    ) -> Arc<Self> {
        let core = Arc::new(Self {
            id: coordinator.allocate_hook_id(),
            coordinator,
            cell: RwLock::new(Arc::clone(&cell)),
            listeners: Mutex::new(Vec::new()),
            validator,
            reaction,
            binding: OnceLock::new(),
        });
        cell.add_member(&core);
        core
    }

    pub(crate) fn id(&self) -> HookId {
        self.id
    }

    pub(crate) fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub(crate) fn cell(&self) -> Arc<CellCore> {
        Arc::clone(&self.cell.read())
    }

    /// Redirect this hook to a fresh cell. Fusion-ops only; callers hold
    /// the coordinator lock and maintain the membership invariant.
    pub(crate) fn set_cell(&self, cell: Arc<CellCore>) {
        *self.cell.write() = cell;
    }

    pub(crate) fn bind(&self, binding: Binding) {
        // A hook is bound at most once, at composite construction.
        let _ = self.binding.set(binding);
    }

    /// The owning composite, if this hook is owned and the owner is still
    /// alive. A dead owner demotes the hook to floating behavior.
    pub(crate) fn owner(&self) -> Option<(Arc<CompositeCore>, &Binding)> {
        let binding = self.binding.get()?;
        let owner = binding.owner.upgrade()?;
        Some((owner, binding))
    }

    pub(crate) fn has_validator(&self) -> bool {
        self.validator.is_some()
    }

    pub(crate) fn validate_isolated(&self, value: &DynValue) -> Result<(), String> {
        match &self.validator {
            Some(validator) => validator(value.as_ref()),
            None => Ok(()),
        }
    }

    pub(crate) fn run_reaction(&self) {
        if let Some(reaction) = &self.reaction {
            if let Err(reason) = reaction() {
                warn!("reaction on hook {} failed: {reason}", self.id);
            }
        }
    }

    /// Human-readable ownership description for Debug output.
    fn binding_label(&self) -> Option<String> {
        let binding = self.binding.get()?;
        let role = match binding.role {
            BindingRole::Primary => "primary",
            BindingRole::Secondary => "secondary",
        };
        match binding.owner.upgrade() {
            Some(owner) => Some(format!("{role} '{}' of composite {}", binding.key, owner.id())),
            None => Some(format!("{role} '{}' of a dropped composite", binding.key)),
        }
    }

    /// Invoke listeners in insertion order. A panicking listener is caught
    /// and logged so the remaining listeners still run; the commit that
    /// triggered the notification is already durable.
    pub(crate) fn notify_listeners(&self) {
        let listeners: Vec<Listener> = self.listeners.lock().clone();
        for listener in listeners {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| listener()));
            if let Err(payload) = result {
                warn!(
                    "listener on hook {} panicked: {}",
                    self.id,
                    panic_message(&payload)
                );
            }
        }
    }

    pub(crate) fn add_listener(&self, listener: Listener) {
        let mut listeners = self.listeners.lock();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub(crate) fn remove_listener(&self, listener: &Listener) {
        self.listeners.lock().retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub(crate) fn remove_all_listeners(&self) -> usize {
        let mut listeners = self.listeners.lock();
        let count = listeners.len();
        listeners.clear();
        count
    }

    pub(crate) fn has_listeners(&self) -> bool {
        !self.listeners.lock().is_empty()
    }

    pub(crate) fn is_listening_to(&self, listener: &Listener) -> bool {
        self.listeners.lock().iter().any(|l| Arc::ptr_eq(l, listener))
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Anything that can stand on the far side of a join or a joined-with
/// query: hooks of either flavor, or wrapper objects exposing one.
pub trait HookRef<T: Value> {
    /// Handle to the cell this hook currently references.
    fn cell_ref(&self) -> CellRef;
    /// Stable hook id.
    fn hook_id(&self) -> HookId;
}

/// A writable connection point.
pub struct Hook<T: Value> {
    core: Arc<HookCore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Value> Clone for Hook<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _marker: PhantomData,
        }
    }
}

impl<T: Value> Hook<T> {
    /// Floating hook with an initial value.
    #[must_use]
    pub fn new(coordinator: &Coordinator, initial: T) -> Self {
        Self::builder(coordinator, initial).build()
    }

    /// Builder for a floating hook with optional validator and reaction.
    #[must_use]
    pub fn builder(coordinator: &Coordinator, initial: T) -> HookBuilder<T> {
        HookBuilder {
            coordinator: coordinator.clone(),
            initial,
            validator: None,
            reaction: None,
        }
    }

    pub(crate) fn from_core(core: Arc<HookCore>) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    /// The domain's current value.
    #[must_use]
    pub fn value(&self) -> Arc<T> {
        read_typed_value(&self.core)
    }

    /// Submit a new value through the full pipeline in normal mode.
    pub fn submit(&self, value: T) -> Result<(), SubmitError> {
        self.submit_with(value, SubmitMode::Normal)
    }

    /// Submit a new value with an explicit mode.
    pub fn submit_with(&self, value: T, mode: SubmitMode) -> Result<(), SubmitError> {
        // Resolve the cell under the (reentrant) lock so a concurrent join
        // cannot slip between resolution and submission.
        let _guard = self.core.coordinator.read_section();
        self.core
            .coordinator
            .submit_cells(vec![(self.core.cell(), dyn_value(value))], mode)
            .map(|_| ())
    }

    /// Validate a prospective value without committing anything.
    pub fn check(&self, value: T) -> Result<(), SubmitError> {
        self.submit_with(value, SubmitMode::CheckOnly)
    }

    /// Fuse this hook's domain with `other`'s, adopting this hook's value.
    pub fn join(&self, other: &impl HookRef<T>) -> Result<(), SubmitError> {
        self.join_with(other, JoinValue::Caller)
    }

    /// Fuse with an explicit choice of which side's value survives.
    pub fn join_with(
        &self,
        other: &impl HookRef<T>,
        adopt: JoinValue,
    ) -> Result<(), SubmitError> {
        fusion::join(&self.core.coordinator, &self.core, || other.cell_ref(), adopt)
    }

    /// Split this hook into a fresh singleton domain carrying the same
    /// current value. No value changes, so no listeners fire.
    pub fn isolate(&self) {
        fusion::isolate(&self.core.coordinator, &self.core);
    }

    /// Whether this hook currently shares a cell with `other`.
    #[must_use]
    pub fn is_joined_with(&self, other: &impl HookRef<T>) -> bool {
        let _read = self.core.coordinator.read_section();
        Arc::ptr_eq(&self.core.cell(), &other.cell_ref().0)
    }

    /// Whether this hook shares its cell with any other live hook.
    #[must_use]
    pub fn is_joined(&self) -> bool {
        let _read = self.core.coordinator.read_section();
        self.core.cell().member_count() > 1
    }

    /// Register a change listener. Idempotent for the same `Arc`.
    pub fn add_listener(&self, listener: Listener) {
        self.core.add_listener(listener);
    }

    /// Register a listener and invoke it once immediately.
    pub fn add_listener_and_call(&self, listener: Listener) {
        self.core.add_listener(Arc::clone(&listener));
        listener();
    }

    /// Remove a listener. Absent listeners are a silent no-op.
    pub fn remove_listener(&self, listener: &Listener) {
        self.core.remove_listener(listener);
    }

    /// Drop every listener, returning how many were removed.
    pub fn remove_all_listeners(&self) -> usize {
        self.core.remove_all_listeners()
    }

    /// Whether any listener is registered.
    #[must_use]
    pub fn has_listeners(&self) -> bool {
        self.core.has_listeners()
    }

    /// Whether this exact listener (`Arc` identity) is registered.
    #[must_use]
    pub fn is_listening_to(&self, listener: &Listener) -> bool {
        self.core.is_listening_to(listener)
    }

    /// Opaque handle to the current cell, for raw coordinator proposals.
    #[must_use]
    pub fn cell_ref(&self) -> CellRef {
        let _read = self.core.coordinator.read_section();
        CellRef(self.core.cell())
    }

    /// Stable hook id.
    #[must_use]
    pub fn id(&self) -> HookId {
        self.core.id()
    }
}

impl<T: Value> HookRef<T> for Hook<T> {
    fn cell_ref(&self) -> CellRef {
        Hook::cell_ref(self)
    }

    fn hook_id(&self) -> HookId {
        self.core.id()
    }
}

impl<T: Value> std::fmt::Debug for Hook<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook")
            .field("id", &self.core.id())
            .field("cell", &self.core.cell().id())
            .field("owned_as", &self.core.binding_label())
            .finish()
    }
}

/// A connection point without a user-facing write path. Composite
/// secondaries are exposed through this handle.
pub struct ReadOnlyHook<T: Value> {
    core: Arc<HookCore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Value> Clone for ReadOnlyHook<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            _marker: PhantomData,
        }
    }
}

impl<T: Value> ReadOnlyHook<T> {
    pub(crate) fn from_core(core: Arc<HookCore>) -> Self {
        Self {
            core,
            _marker: PhantomData,
        }
    }

    /// The domain's current value.
    #[must_use]
    pub fn value(&self) -> Arc<T> {
        read_typed_value(&self.core)
    }

    /// Whether this hook currently shares a cell with `other`.
    #[must_use]
    pub fn is_joined_with(&self, other: &impl HookRef<T>) -> bool {
        let _read = self.core.coordinator.read_section();
        Arc::ptr_eq(&self.core.cell(), &other.cell_ref().0)
    }

    /// Whether this hook shares its cell with any other live hook.
    #[must_use]
    pub fn is_joined(&self) -> bool {
        let _read = self.core.coordinator.read_section();
        self.core.cell().member_count() > 1
    }

    /// Register a change listener. Idempotent for the same `Arc`.
    pub fn add_listener(&self, listener: Listener) {
        self.core.add_listener(listener);
    }

    /// Register a listener and invoke it once immediately.
    pub fn add_listener_and_call(&self, listener: Listener) {
        self.core.add_listener(Arc::clone(&listener));
        listener();
    }

    /// Remove a listener. Absent listeners are a silent no-op.
    pub fn remove_listener(&self, listener: &Listener) {
        self.core.remove_listener(listener);
    }

    /// Drop every listener, returning how many were removed.
    pub fn remove_all_listeners(&self) -> usize {
        self.core.remove_all_listeners()
    }

    /// Whether any listener is registered.
    #[must_use]
    pub fn has_listeners(&self) -> bool {
        self.core.has_listeners()
    }

    /// Whether this exact listener (`Arc` identity) is registered.
    #[must_use]
    pub fn is_listening_to(&self, listener: &Listener) -> bool {
        self.core.is_listening_to(listener)
    }

    /// Opaque handle to the current cell.
    #[must_use]
    pub fn cell_ref(&self) -> CellRef {
        let _read = self.core.coordinator.read_section();
        CellRef(self.core.cell())
    }

    /// Stable hook id.
    #[must_use]
    pub fn id(&self) -> HookId {
        self.core.id()
    }
}

impl<T: Value> HookRef<T> for ReadOnlyHook<T> {
    fn cell_ref(&self) -> CellRef {
        ReadOnlyHook::cell_ref(self)
    }

    fn hook_id(&self) -> HookId {
        self.core.id()
    }
}

impl<T: Value> std::fmt::Debug for ReadOnlyHook<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyHook")
            .field("id", &self.core.id())
            .field("cell", &self.core.cell().id())
            .field("owned_as", &self.core.binding_label())
            .finish()
    }
}

fn read_typed_value<T: Value>(core: &Arc<HookCore>) -> Arc<T> {
    let _read = core.coordinator().read_section();
    let current = core.cell().current();
    downcast_value::<T>(&current).expect("cell value type is enforced at submission")
}

/// Builder for floating hooks.
pub struct HookBuilder<T: Value> {
    coordinator: Coordinator,
    initial: T,
    validator: Option<ValidatorFn>,
    reaction: Option<Reaction>,
}

impl<T: Value> HookBuilder<T> {
    /// Attach an isolated validator: a pure predicate on the proposed value
    /// consulted in phase 4 of every submission touching this hook's cell.
    #[must_use]
    pub fn validator(
        mut self,
        validator: impl Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Arc::new(move |value: &dyn Value| {
            match value.as_any().downcast_ref::<T>() {
                Some(value) => validator(value),
                None => Err(format!(
                    "validator expected {}, got {}",
                    std::any::type_name::<T>(),
                    value.type_name()
                )),
            }
        }));
        self
    }

    /// Attach a post-commit reaction callback.
    #[must_use]
    pub fn reaction(
        mut self,
        reaction: impl Fn() -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.reaction = Some(Arc::new(reaction));
        self
    }

    /// Create the hook and its fresh singleton cell.
    #[must_use]
    pub fn build(self) -> Hook<T> {
        let cell = self.coordinator.create_cell(dyn_value(self.initial));
        let core = HookCore::new(self.coordinator, cell, self.validator, self.reaction);
        Hook::from_core(core)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Coordinator;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_listener() -> (Listener, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let captured = Arc::clone(&count);
        let listener: Listener = Arc::new(move || {
            captured.fetch_add(1, Ordering::SeqCst);
        });
        (listener, count)
    }

    #[test]
    fn duplicate_listener_add_is_idempotent() {
        let coordinator = Coordinator::new();
        let hook = Hook::new(&coordinator, 0_i64);
        let (listener, count) = counting_listener();

        hook.add_listener(Arc::clone(&listener));
        hook.add_listener(Arc::clone(&listener));
        hook.submit(1).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_absent_listener_is_silent() {
        let coordinator = Coordinator::new();
        let hook = Hook::new(&coordinator, 0_i64);
        let (listener, _count) = counting_listener();
        hook.remove_listener(&listener);
        assert!(!hook.has_listeners());
    }

    #[test]
    fn listeners_fire_in_insertion_order() {
        let coordinator = Coordinator::new();
        let hook = Hook::new(&coordinator, 0_i64);
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            hook.add_listener(Arc::new(move || order.lock().push(tag)));
        }
        hook.submit(1).unwrap();
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn panicking_listener_does_not_stop_the_rest() {
        let coordinator = Coordinator::new();
        let hook = Hook::new(&coordinator, 0_i64);
        let (listener, count) = counting_listener();

        hook.add_listener(Arc::new(|| panic!("listener boom")));
        hook.add_listener(listener);
        hook.submit(1).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(*hook.value(), 1);
    }

    #[test]
    fn add_listener_and_call_fires_once_immediately() {
        let coordinator = Coordinator::new();
        let hook = Hook::new(&coordinator, 0_i64);
        let (listener, count) = counting_listener();
        hook.add_listener_and_call(Arc::clone(&listener));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(hook.is_listening_to(&listener));
    }

    #[test]
    fn remove_all_listeners_reports_count() {
        let coordinator = Coordinator::new();
        let hook = Hook::new(&coordinator, 0_i64);
        let (a, _) = counting_listener();
        let (b, _) = counting_listener();
        hook.add_listener(a);
        hook.add_listener(b);
        assert_eq!(hook.remove_all_listeners(), 2);
        assert!(!hook.has_listeners());
    }

    #[test]
    fn clone_shares_the_hook() {
        let coordinator = Coordinator::new();
        let hook = Hook::new(&coordinator, 5_i64);
        let alias = hook.clone();
        alias.submit(9).unwrap();
        assert_eq!(*hook.value(), 9);
        assert_eq!(hook.id(), alias.id());
    }

    #[test]
    fn validator_rejects_before_commit() {
        let coordinator = Coordinator::new();
        let hook = Hook::builder(&coordinator, 1_i64)
            .validator(|v| {
                if *v > 0 {
                    Ok(())
                } else {
                    Err("must stay positive".into())
                }
            })
            .build();

        assert!(hook.submit(10).is_ok());
        let err = hook.submit(-3).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationRejected);
        assert_eq!(*hook.value(), 10);
    }
}
