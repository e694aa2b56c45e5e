//! The coordinator: global serializer and write entry point.
//!
//! One coordinator owns one synchronization universe: its cells, its
//! equality policy, its publisher hub. A single reentrant lock serializes
//! the whole submission pipeline (phases 1–6) and the structural mutations
//! of fusion ops; reads take the same lock briefly, so no reader ever
//! observes a partially committed working map.
//!
//! # Reentrancy
//!
//! Each thread tracks the set of cells it is currently committing, per
//! coordinator. A nested submission is allowed when its cell set is
//! disjoint from the active set (a listener touching an independent value)
//! and fails fast with [`SubmitError::Reentrant`] when it overlaps. The
//! active set is restored on unwind.
//!
//! Handles are cheap to clone (`Arc` inside); clones address the same
//! coordinator.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ahash::{AHashMap, AHashSet};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};

use crate::cell::{CellCore, CellDiagnostics, CellId, CellRef};
use crate::composite::{Composite, CompositeContract, CompositeCore, CompositeId, CompositeSpec};
use crate::equality::EqualityRegistry;
use crate::error::SubmitError;
use crate::hook::HookId;
use crate::publish::PublisherHub;
use crate::submission::{self, SubmitMode, SubmitReport};
use crate::value::DynValue;

static NEXT_COORDINATOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Per-thread, per-coordinator set of cells currently mid-commit.
    static ACTIVE_CELLS: RefCell<AHashMap<u64, AHashSet<CellId>>> =
        RefCell::new(AHashMap::new());
}

struct CoordinatorInner {
    id: u64,
    pipeline: ReentrantMutex<()>,
    equality: EqualityRegistry,
    cells: Mutex<Vec<Weak<CellCore>>>,
    publisher_hub: RwLock<Option<Arc<dyn PublisherHub>>>,
    next_cell_id: AtomicU64,
    next_hook_id: AtomicU64,
    next_composite_id: AtomicU64,
}

/// Handle to a synchronization coordinator.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    /// Coordinator with an empty equality registry.
    #[must_use]
    pub fn new() -> Self {
        Self::with_equality(EqualityRegistry::new())
    }

    /// Coordinator with a pre-configured equality registry.
    #[must_use]
    pub fn with_equality(equality: EqualityRegistry) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                id: NEXT_COORDINATOR_ID.fetch_add(1, Ordering::Relaxed),
                pipeline: ReentrantMutex::new(()),
                equality,
                cells: Mutex::new(Vec::new()),
                publisher_hub: RwLock::new(None),
                next_cell_id: AtomicU64::new(1),
                next_hook_id: AtomicU64::new(1),
                next_composite_id: AtomicU64::new(1),
            }),
        }
    }

    /// The equality policy consulted in phase 1 and during completion.
    #[must_use]
    pub fn equality(&self) -> &EqualityRegistry {
        &self.inner.equality
    }

    /// Install the publisher collaborator consulted in phases 3 and 6.
    pub fn set_publisher_hub(&self, hub: Arc<dyn PublisherHub>) {
        *self.inner.publisher_hub.write() = Some(hub);
    }

    pub(crate) fn publisher_hub(&self) -> Option<Arc<dyn PublisherHub>> {
        self.inner.publisher_hub.read().clone()
    }

    /// Submit a `{cell → proposed value}` map through the full pipeline.
    ///
    /// Duplicate cell entries collapse map-style: the last value wins.
    ///
    /// # Panics
    ///
    /// Panics if a cell belongs to a different coordinator; cells never
    /// migrate between coordinators.
    pub fn submit(
        &self,
        proposal: impl IntoIterator<Item = (CellRef, DynValue)>,
        mode: SubmitMode,
    ) -> Result<SubmitReport, SubmitError> {
        let proposal: Vec<(Arc<CellCore>, DynValue)> = proposal
            .into_iter()
            .map(|(cell, value)| (cell.0, value))
            .collect();
        self.submit_cells(proposal, mode)
    }

    /// Validate a proposal without committing anything (check-only mode).
    pub fn check(
        &self,
        proposal: impl IntoIterator<Item = (CellRef, DynValue)>,
    ) -> Result<SubmitReport, SubmitError> {
        self.submit(proposal, SubmitMode::CheckOnly)
    }

    /// Build a `{cell → current value}` proposal from a set of cells, the
    /// shape value-adoption and re-validation flows start from.
    #[must_use]
    pub fn proposal_from_cells(
        &self,
        cells: impl IntoIterator<Item = CellRef>,
    ) -> Vec<(CellRef, DynValue)> {
        let _read = self.read_section();
        cells
            .into_iter()
            .map(|cell| {
                let value = cell.0.current();
                (cell, value)
            })
            .collect()
    }

    /// Register a composite from its spec and behavior. The initial values
    /// must pass the behavior's own validators.
    pub fn register_composite(
        &self,
        spec: CompositeSpec,
        behavior: Arc<dyn CompositeContract>,
    ) -> Result<Composite, SubmitError> {
        let core = CompositeCore::build(self, spec, behavior)?;
        Ok(Composite::new(core))
    }

    /// Snapshot of every live cell, for diagnostics.
    #[must_use]
    pub fn live_cells(&self) -> Vec<CellDiagnostics> {
        let _read = self.read_section();
        let mut cells = self.inner.cells.lock();
        cells.retain(|cell| cell.strong_count() > 0);
        cells
            .iter()
            .filter_map(Weak::upgrade)
            .map(|cell| cell.diagnostics())
            .collect()
    }

    /// Number of live cells.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        let mut cells = self.inner.cells.lock();
        cells.retain(|cell| cell.strong_count() > 0);
        cells.len()
    }

    // ─── crate-internal plumbing ─────────────────────────────────────────

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// The coordinator lock, taken briefly by readers. Reentrant, so
    /// phase-6 callbacks on the committing thread can read freely.
    pub(crate) fn read_section(&self) -> ReentrantMutexGuard<'_, ()> {
        self.inner.pipeline.lock()
    }

    /// Allocate and register a fresh cell.
    pub(crate) fn create_cell(&self, value: DynValue) -> Arc<CellCore> {
        let id = CellId(self.inner.next_cell_id.fetch_add(1, Ordering::Relaxed));
        let cell = CellCore::new(id, self.inner.id, value);
        let mut cells = self.inner.cells.lock();
        cells.retain(|existing| existing.strong_count() > 0);
        cells.push(Arc::downgrade(&cell));
        cell
    }

    pub(crate) fn allocate_hook_id(&self) -> HookId {
        HookId(self.inner.next_hook_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn allocate_composite_id(&self) -> CompositeId {
        CompositeId(self.inner.next_composite_id.fetch_add(1, Ordering::Relaxed))
    }

    /// The single write entry point: reentrancy check, lock, active-set
    /// bookkeeping, then the six-phase engine.
    pub(crate) fn submit_cells(
        &self,
        proposal: Vec<(Arc<CellCore>, DynValue)>,
        mode: SubmitMode,
    ) -> Result<SubmitReport, SubmitError> {
        let mut dedup: BTreeMap<CellId, (Arc<CellCore>, DynValue)> = BTreeMap::new();
        for (cell, value) in proposal {
            assert_eq!(
                cell.coordinator_id(),
                self.inner.id,
                "cell {} belongs to a different coordinator",
                cell.id()
            );
            dedup.insert(cell.id(), (cell, value));
        }

        let overlap: Vec<CellId> = ACTIVE_CELLS.with(|active| {
            let active = active.borrow();
            match active.get(&self.inner.id) {
                Some(set) => dedup.keys().copied().filter(|id| set.contains(id)).collect(),
                None => Vec::new(),
            }
        });
        if !overlap.is_empty() {
            return Err(SubmitError::Reentrant { cells: overlap });
        }

        let _pipeline = self.inner.pipeline.lock();
        let _active = ActiveCellsGuard::install(self.inner.id, dedup.keys().copied().collect());
        submission::run(self, dedup.into_values().collect(), mode)
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("id", &self.inner.id)
            .field("cells", &self.cell_count())
            .finish()
    }
}

/// Marks a submission's cells active for this thread; removal is in `Drop`
/// so the set is restored on every exit path, panics included.
struct ActiveCellsGuard {
    coordinator: u64,
    cells: Vec<CellId>,
}

impl ActiveCellsGuard {
    fn install(coordinator: u64, cells: Vec<CellId>) -> Self {
        ACTIVE_CELLS.with(|active| {
            active
                .borrow_mut()
                .entry(coordinator)
                .or_default()
                .extend(cells.iter().copied());
        });
        Self { coordinator, cells }
    }
}

impl Drop for ActiveCellsGuard {
    fn drop(&mut self) {
        ACTIVE_CELLS.with(|active| {
            let mut active = active.borrow_mut();
            if let Some(set) = active.get_mut(&self.coordinator) {
                for cell in &self.cells {
                    set.remove(cell);
                }
                if set.is_empty() {
                    active.remove(&self.coordinator);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::hook::Hook;
    use crate::value::{downcast_value, dyn_value};

    #[test]
    fn raw_submit_commits_and_reports() {
        let coordinator = Coordinator::new();
        let hook = Hook::new(&coordinator, 1_i64);
        let cell = hook.cell_ref();

        let report = coordinator
            .submit([(cell.clone(), dyn_value(2_i64))], SubmitMode::Normal)
            .unwrap();
        assert_eq!(report.committed, vec![cell.id()]);
        assert_eq!(*hook.value(), 2);
    }

    #[test]
    fn duplicate_proposal_entries_last_wins() {
        let coordinator = Coordinator::new();
        let hook = Hook::new(&coordinator, 0_i64);
        let cell = hook.cell_ref();

        coordinator
            .submit(
                [
                    (cell.clone(), dyn_value(1_i64)),
                    (cell, dyn_value(2_i64)),
                ],
                SubmitMode::Normal,
            )
            .unwrap();
        assert_eq!(*hook.value(), 2);
    }

    #[test]
    fn type_mismatch_is_rejected_before_anything_changes() {
        let coordinator = Coordinator::new();
        let hook = Hook::new(&coordinator, 1_i64);
        let err = coordinator
            .submit(
                [(hook.cell_ref(), dyn_value("not an i64".to_owned()))],
                SubmitMode::Normal,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);
        assert_eq!(*hook.value(), 1);
    }

    #[test]
    fn diagnostics_track_live_cells() {
        let coordinator = Coordinator::new();
        assert_eq!(coordinator.cell_count(), 0);

        let hook = Hook::new(&coordinator, 7_i64);
        assert_eq!(coordinator.cell_count(), 1);

        let diag = &coordinator.live_cells()[0];
        assert_eq!(diag.member_count, 1);
        assert_eq!(*downcast_value::<i64>(&diag.current).unwrap(), 7);

        drop(hook);
        assert_eq!(coordinator.cell_count(), 0);
    }

    #[test]
    fn proposal_from_cells_reads_current_values() {
        let coordinator = Coordinator::new();
        let a = Hook::new(&coordinator, 3_i64);
        let b = Hook::new(&coordinator, 4_i64);

        let proposal = coordinator.proposal_from_cells([a.cell_ref(), b.cell_ref()]);
        assert_eq!(proposal.len(), 2);
        // Re-submitting current values is a no-op in normal mode.
        let report = coordinator.submit(proposal, SubmitMode::Normal).unwrap();
        assert!(report.committed.is_empty());
        assert_eq!(report.filtered.len(), 2);
    }
}
