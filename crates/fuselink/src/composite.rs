//! Composites: multi-hook objects with atomic cross-cell invariants.
//!
//! A composite registers a fixed set of **primary** identifiers (writable
//! cells holding authoritative state) and **secondary** identifiers (read-
//! only cells computed from the primaries). The engine drives the
//! composite's [`CompositeContract`] during three moments of a submission:
//!
//! - phase 2: [`CompositeContract::complete`] extends a partial write to a
//!   consistent set of primaries (fixed-point iterated);
//! - phase 4: [`CompositeContract::validate_primary`] then
//!   [`CompositeContract::validate_all`] accept or reject atomically;
//! - phase 6: [`CompositeContract::after_commit`] runs once per commit.
//!
//! All contract callbacks must be pure functions of the views they are
//! given. Hidden mutable state breaks fixed-point convergence.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cell::CellCore;
use crate::coordinator::Coordinator;
use crate::error::{RejectionSource, SubmitError};
use crate::hook::{Binding, BindingRole, Hook, HookCore, ReadOnlyHook};
use crate::submission::SubmitMode;
use crate::value::{downcast_value, dyn_value, DynValue, Value};

/// Stable identity of a composite, assigned at registration. The engine
/// deduplicates and orders touched composites by this id, never by value
/// equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompositeId(pub(crate) u64);

impl std::fmt::Display for CompositeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An identifier-keyed bundle of values, as handed to composite writes and
/// returned from completion callbacks.
#[derive(Default, Clone)]
pub struct ValuePatch {
    entries: BTreeMap<String, DynValue>,
}

impl ValuePatch {
    /// Empty patch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Chainable typed insert.
    #[must_use]
    pub fn set<T: Value>(mut self, key: impl Into<String>, value: T) -> Self {
        self.entries.insert(key.into(), dyn_value(value));
        self
    }

    /// Typed insert.
    pub fn insert<T: Value>(&mut self, key: impl Into<String>, value: T) {
        self.entries.insert(key.into(), dyn_value(value));
    }

    /// Insert an already-erased value.
    pub fn insert_raw(&mut self, key: impl Into<String>, value: DynValue) {
        self.entries.insert(key.into(), value);
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the patch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn into_entries(self) -> BTreeMap<String, DynValue> {
        self.entries
    }
}

impl std::fmt::Debug for ValuePatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

/// Complete identifier → value view handed to validators and secondary
/// computations.
#[derive(Clone)]
pub struct KeyValues {
    entries: BTreeMap<String, DynValue>,
}

impl KeyValues {
    pub(crate) fn new(entries: BTreeMap<String, DynValue>) -> Self {
        Self { entries }
    }

    /// Typed lookup. `None` when the key is absent or holds another type.
    #[must_use]
    pub fn get<T: Value>(&self, key: &str) -> Option<Arc<T>> {
        self.entries.get(key).and_then(downcast_value::<T>)
    }

    /// Erased lookup.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<&DynValue> {
        self.entries.get(key)
    }

    /// Keys in identifier order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the view is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn insert_raw(&mut self, key: String, value: DynValue) {
        self.entries.insert(key, value);
    }
}

impl std::fmt::Debug for KeyValues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

/// The two-part view handed to [`CompositeContract::complete`] in phase 2:
/// the primaries being written in this submission, and the current values
/// of the rest.
pub struct UpdateView {
    submitted: BTreeMap<String, DynValue>,
    current: BTreeMap<String, DynValue>,
}

impl UpdateView {
    pub(crate) fn new(
        submitted: BTreeMap<String, DynValue>,
        current: BTreeMap<String, DynValue>,
    ) -> Self {
        Self { submitted, current }
    }

    /// Whether `key` is part of the submission.
    #[must_use]
    pub fn is_submitted(&self, key: &str) -> bool {
        self.submitted.contains_key(key)
    }

    /// Submitted keys in identifier order.
    pub fn submitted_keys(&self) -> impl Iterator<Item = &str> {
        self.submitted.keys().map(String::as_str)
    }

    /// Typed lookup among the submitted values.
    #[must_use]
    pub fn submitted<T: Value>(&self, key: &str) -> Option<Arc<T>> {
        self.submitted.get(key).and_then(downcast_value::<T>)
    }

    /// Typed lookup among the not-submitted (current) values.
    #[must_use]
    pub fn current<T: Value>(&self, key: &str) -> Option<Arc<T>> {
        self.current.get(key).and_then(downcast_value::<T>)
    }

    /// The value `key` would have after this submission: submitted when
    /// present, current otherwise.
    #[must_use]
    pub fn effective<T: Value>(&self, key: &str) -> Option<Arc<T>> {
        self.submitted::<T>(key).or_else(|| self.current::<T>(key))
    }

    /// Erased variant of [`UpdateView::effective`].
    #[must_use]
    pub fn effective_raw(&self, key: &str) -> Option<&DynValue> {
        self.submitted.get(key).or_else(|| self.current.get(key))
    }
}

impl std::fmt::Debug for UpdateView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateView")
            .field("submitted", &self.submitted)
            .field("current", &self.current)
            .finish()
    }
}

/// The behavior a multi-hook object plugs into the engine.
///
/// Every method must be deterministic and side-effect free with respect to
/// the engine's state; `after_commit` may schedule external effects but
/// must not submit to the composite's own cells (that would be reentrant).
pub trait CompositeContract: Send + Sync {
    /// Extend a partial primary write to a consistent one. Returned keys
    /// must be primary identifiers of this composite; anything else fails
    /// the submission with `CompletionExtendsUnknownCell`.
    fn complete(&self, view: &UpdateView) -> ValuePatch {
        let _ = view;
        ValuePatch::new()
    }

    /// Accept or reject the complete primary view.
    fn validate_primary(&self, primaries: &KeyValues) -> Result<(), String>;

    /// Accept or reject the complete view including recomputed secondaries.
    /// Runs after `validate_primary`.
    fn validate_all(&self, values: &KeyValues) -> Result<(), String> {
        let _ = values;
        Ok(())
    }

    /// Post-commit notification, once per accepted submission touching this
    /// composite.
    fn after_commit(&self) {}
}

/// Pure function computing one secondary value from the primary view.
pub type SecondaryFn = Arc<dyn Fn(&KeyValues) -> DynValue + Send + Sync>;

/// Registration shape for a composite: primary initial values plus
/// secondary computations. The identifier sets are fixed for the
/// composite's lifetime.
#[derive(Default)]
pub struct CompositeSpec {
    primaries: BTreeMap<String, DynValue>,
    secondaries: BTreeMap<String, SecondaryFn>,
}

impl CompositeSpec {
    /// Empty spec.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a primary identifier with its initial value.
    #[must_use]
    pub fn primary<T: Value>(mut self, key: impl Into<String>, initial: T) -> Self {
        self.primaries.insert(key.into(), dyn_value(initial));
        self
    }

    /// Declare a secondary identifier with its computation.
    #[must_use]
    pub fn secondary<T: Value>(
        mut self,
        key: impl Into<String>,
        compute: impl Fn(&KeyValues) -> T + Send + Sync + 'static,
    ) -> Self {
        self.secondaries.insert(
            key.into(),
            Arc::new(move |primaries| dyn_value(compute(primaries))),
        );
        self
    }
}

pub(crate) struct SecondarySlot {
    pub(crate) hook: Arc<HookCore>,
    pub(crate) compute: SecondaryFn,
}

/// Runtime state of a registered composite: the binding from identifiers
/// to owned hooks plus the user behavior.
pub(crate) struct CompositeCore {
    id: CompositeId,
    behavior: Arc<dyn CompositeContract>,
    primaries: BTreeMap<String, Arc<HookCore>>,
    secondaries: BTreeMap<String, SecondarySlot>,
    coordinator: Coordinator,
}

impl CompositeCore {
    /// Build and validate a composite. The initial primary values must pass
    /// the behavior's validators, otherwise registration fails and nothing
    /// is created.
    pub(crate) fn build(
        coordinator: &Coordinator,
        spec: CompositeSpec,
        behavior: Arc<dyn CompositeContract>,
    ) -> Result<Arc<Self>, SubmitError> {
        let id = coordinator.allocate_composite_id();

        let initial_primaries = KeyValues::new(spec.primaries.clone());
        behavior
            .validate_primary(&initial_primaries)
            .map_err(|reason| SubmitError::ValidationRejected {
                source: RejectionSource::Composite(id),
                reason,
            })?;

        let mut all_values = initial_primaries.clone();
        let mut initial_secondaries: BTreeMap<String, DynValue> = BTreeMap::new();
        for (key, compute) in &spec.secondaries {
            let value = compute(&initial_primaries);
            initial_secondaries.insert(key.clone(), Arc::clone(&value));
            all_values.insert_raw(key.clone(), value);
        }
        behavior
            .validate_all(&all_values)
            .map_err(|reason| SubmitError::ValidationRejected {
                source: RejectionSource::Composite(id),
                reason,
            })?;

        let core = Arc::new_cyclic(|weak| {
            let mut primaries = BTreeMap::new();
            for (key, initial) in spec.primaries {
                let cell = coordinator.create_cell(initial);
                let hook = HookCore::new(coordinator.clone(), cell, None, None);
                hook.bind(Binding {
                    owner: weak.clone(),
                    key: key.clone(),
                    role: BindingRole::Primary,
                });
                primaries.insert(key, hook);
            }

            let mut secondaries = BTreeMap::new();
            for (key, compute) in spec.secondaries {
                let initial = initial_secondaries
                    .remove(&key)
                    .expect("secondary initials are computed for every declared key");
                let cell = coordinator.create_cell(initial);
                let hook = HookCore::new(coordinator.clone(), cell, None, None);
                hook.bind(Binding {
                    owner: weak.clone(),
                    key: key.clone(),
                    role: BindingRole::Secondary,
                });
                secondaries.insert(key, SecondarySlot { hook, compute });
            }

            Self {
                id,
                behavior,
                primaries,
                secondaries,
                coordinator: coordinator.clone(),
            }
        });

        Ok(core)
    }

    pub(crate) fn id(&self) -> CompositeId {
        self.id
    }

    pub(crate) fn behavior(&self) -> &dyn CompositeContract {
        self.behavior.as_ref()
    }

    pub(crate) fn primaries(&self) -> &BTreeMap<String, Arc<HookCore>> {
        &self.primaries
    }

    pub(crate) fn secondaries(&self) -> &BTreeMap<String, SecondarySlot> {
        &self.secondaries
    }

    pub(crate) fn primary_cell(&self, key: &str) -> Option<Arc<CellCore>> {
        self.primaries.get(key).map(|hook| hook.cell())
    }
}

/// Handle to a registered composite.
#[derive(Clone)]
pub struct Composite {
    core: Arc<CompositeCore>,
}

impl Composite {
    pub(crate) fn new(core: Arc<CompositeCore>) -> Self {
        Self { core }
    }

    /// Stable composite id.
    #[must_use]
    pub fn id(&self) -> CompositeId {
        self.core.id
    }

    /// Atomically write a set of primary values in normal mode.
    pub fn submit(&self, patch: ValuePatch) -> Result<(), SubmitError> {
        self.submit_with(patch, SubmitMode::Normal)
    }

    /// Atomically write a set of primary values with an explicit mode.
    pub fn submit_with(&self, patch: ValuePatch, mode: SubmitMode) -> Result<(), SubmitError> {
        // Resolve cells under the (reentrant) lock so a concurrent join
        // cannot slip between resolution and submission.
        let _guard = self.core.coordinator.read_section();
        let mut proposal = Vec::with_capacity(patch.len());
        for (key, value) in patch.into_entries() {
            let Some(cell) = self.core.primary_cell(&key) else {
                return Err(SubmitError::UnknownIdentifier {
                    composite: self.core.id,
                    identifier: key,
                });
            };
            proposal.push((cell, value));
        }
        self.core
            .coordinator
            .submit_cells(proposal, mode)
            .map(|_| ())
    }

    /// Validate a prospective write without committing anything.
    pub fn check(&self, patch: ValuePatch) -> Result<(), SubmitError> {
        self.submit_with(patch, SubmitMode::CheckOnly)
    }

    /// Typed handle to a primary (writable) hook.
    pub fn primary_hook<T: Value>(&self, key: &str) -> Result<Hook<T>, SubmitError> {
        let Some(hook) = self.core.primaries.get(key) else {
            return Err(SubmitError::UnknownIdentifier {
                composite: self.core.id,
                identifier: key.to_owned(),
            });
        };
        typed_guard::<T>(hook)?;
        Ok(Hook::from_core(Arc::clone(hook)))
    }

    /// Typed handle to a secondary (read-only) hook.
    pub fn secondary_hook<T: Value>(&self, key: &str) -> Result<ReadOnlyHook<T>, SubmitError> {
        let Some(slot) = self.core.secondaries.get(key) else {
            return Err(SubmitError::UnknownIdentifier {
                composite: self.core.id,
                identifier: key.to_owned(),
            });
        };
        typed_guard::<T>(&slot.hook)?;
        Ok(ReadOnlyHook::from_core(Arc::clone(&slot.hook)))
    }

    /// Current value of a primary or secondary identifier.
    #[must_use]
    pub fn value<T: Value>(&self, key: &str) -> Option<Arc<T>> {
        let _read = self.core.coordinator.read_section();
        let hook = self
            .core
            .primaries
            .get(key)
            .or_else(|| self.core.secondaries.get(key).map(|slot| &slot.hook))?;
        downcast_value::<T>(&hook.cell().current())
    }
}

impl std::fmt::Debug for Composite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Composite")
            .field("id", &self.core.id)
            .field("primaries", &self.core.primaries.keys().collect::<Vec<_>>())
            .field(
                "secondaries",
                &self.core.secondaries.keys().collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn typed_guard<T: Value>(hook: &Arc<HookCore>) -> Result<(), SubmitError> {
    let cell = hook.cell();
    if cell.value_type() == std::any::TypeId::of::<T>() {
        Ok(())
    } else {
        Err(SubmitError::TypeMismatch {
            cell: cell.id(),
            expected: cell.value_type_name(),
            actual: std::any::type_name::<T>(),
        })
    }
}
