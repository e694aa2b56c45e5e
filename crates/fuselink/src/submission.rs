//! The six-phase submission pipeline.
//!
//! Every write in the system funnels through [`run`], executed under the
//! coordinator's reentrant lock with the target cells marked active on the
//! calling thread:
//!
//! 1. **Equality filter** — drop value-equal entries (normal mode), keep
//!    everything (forced), or keep-and-record (check-only).
//! 2. **Value completion** — fixed-point extension of the working map via
//!    the touched composites' `complete` callbacks, folding in recomputed
//!    secondaries, bounded by a round cap.
//! 3. **Affected-component collection** — touched composites (identity,
//!    ordered by id), live member hooks, and interested publishers.
//! 4. **Validation** — composite validators in id order, then isolated
//!    hook validators. First failure wins; nothing has changed yet.
//! 5. **Atomic commit** — pure bulk mutation; no user code runs.
//! 6. **Notification** — after-commit hooks, reactions, publications,
//!    listeners, in that fixed order.
//!
//! Check-only submissions stop after phase 4. Phases 1–4 failures leave
//! every cell untouched by construction; phase 5 cannot fail.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashSet;

use crate::cell::{CellCore, CellId};
use crate::composite::{CompositeCore, KeyValues, UpdateView};
use crate::coordinator::Coordinator;
use crate::error::{RejectionSource, SubmitError};
use crate::hook::HookCore;
use crate::logging::debug;
use crate::publish::{CommitInfo, PublisherRef};
use crate::value::DynValue;

/// Completion rounds allowed before a submission is declared divergent.
/// Bounds both runaway user callbacks and pathological completion chains.
pub const COMPLETION_ROUND_CAP: u32 = 64;

/// How a submission treats the equality filter and the commit phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubmitMode {
    /// Filter value-equal entries in phase 1; commit and notify the rest.
    Normal,
    /// Skip the phase-1 filter: every listed cell commits, equal or not.
    Forced,
    /// Run phases 1–4 only; report whether the commit would have passed.
    CheckOnly,
}

impl std::fmt::Display for SubmitMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Normal => "NormalSubmission",
            Self::Forced => "ForcedSubmission",
            Self::CheckOnly => "CheckOnly",
        })
    }
}

/// Outcome of a successful submission.
#[derive(Debug, Clone)]
pub struct SubmitReport {
    /// The mode the submission ran under.
    pub mode: SubmitMode,
    /// Cells whose values were written, in id order. Empty for check-only
    /// submissions and for fully-filtered normal submissions.
    pub committed: Vec<CellId>,
    /// Cells whose proposed value equalled the current one in phase 1:
    /// dropped in normal mode, recorded (but kept) in check-only mode.
    pub filtered: Vec<CellId>,
}

/// Why a cell is in the working map. Secondary entries may be refreshed by
/// their own composite across completion rounds; every other collision is
/// a conflict.
enum Origin {
    Proposed,
    Completed,
    Secondary { composite: u64, identifier: String },
}

struct PlanEntry {
    cell: Arc<CellCore>,
    value: DynValue,
    origin: Origin,
}

type WorkingMap = BTreeMap<CellId, PlanEntry>;

/// Execute the pipeline. The caller holds the coordinator lock and has
/// marked the proposal's cells active for this thread.
pub(crate) fn run(
    coordinator: &Coordinator,
    proposal: Vec<(Arc<CellCore>, DynValue)>,
    mode: SubmitMode,
) -> Result<SubmitReport, SubmitError> {
    let (mut working, filtered) = filter_proposal(coordinator, proposal, mode)?;
    if working.is_empty() {
        debug!("submission ({mode}): nothing to do after equality filter");
        return Ok(SubmitReport {
            mode,
            committed: Vec::new(),
            filtered,
        });
    }

    complete_working_map(coordinator, &mut working)?;
    let affected = collect_affected(coordinator, &working);
    debug!(
        "submission ({mode}): {} cell(s), {} composite(s), {} hook(s)",
        working.len(),
        affected.composites.len(),
        affected.hooks.len()
    );
    validate(&working, &affected)?;

    if mode == SubmitMode::CheckOnly {
        return Ok(SubmitReport {
            mode,
            committed: Vec::new(),
            filtered,
        });
    }

    for entry in working.values() {
        entry.cell.commit(Arc::clone(&entry.value));
    }

    notify(coordinator, &working, &affected, mode);

    Ok(SubmitReport {
        mode,
        committed: working.keys().copied().collect(),
        filtered,
    })
}

// ─── Phase 1: equality filter ────────────────────────────────────────────

fn filter_proposal(
    coordinator: &Coordinator,
    proposal: Vec<(Arc<CellCore>, DynValue)>,
    mode: SubmitMode,
) -> Result<(WorkingMap, Vec<CellId>), SubmitError> {
    let equality = coordinator.equality();
    let mut working = WorkingMap::new();
    let mut filtered = Vec::new();

    for (cell, value) in proposal {
        if value.as_any().type_id() != cell.value_type() {
            return Err(SubmitError::TypeMismatch {
                cell: cell.id(),
                expected: cell.value_type_name(),
                actual: value.type_name(),
            });
        }

        // The registry is consulted exactly once per (cell, old, new).
        let unchanged = mode != SubmitMode::Forced
            && equality.equals(cell.current().as_ref(), value.as_ref());
        match mode {
            SubmitMode::Normal if unchanged => {
                filtered.push(cell.id());
                continue;
            }
            SubmitMode::CheckOnly if unchanged => {
                // Recorded, not dropped: validation still sees the entry.
                filtered.push(cell.id());
            }
            _ => {}
        }

        working.insert(
            cell.id(),
            PlanEntry {
                cell,
                value,
                origin: Origin::Proposed,
            },
        );
    }

    Ok((working, filtered))
}

// ─── Phase 2: iterative value completion ─────────────────────────────────

fn complete_working_map(
    coordinator: &Coordinator,
    working: &mut WorkingMap,
) -> Result<(), SubmitError> {
    for _round in 0..COMPLETION_ROUND_CAP {
        let mut changed = false;

        for owner in touched_composites(working) {
            let view = update_view(&owner, working);
            let patch = owner.behavior().complete(&view);
            for (identifier, value) in patch.into_entries() {
                let Some(cell) = owner.primary_cell(&identifier) else {
                    return Err(SubmitError::CompletionExtendsUnknownCell {
                        composite: owner.id(),
                        identifier,
                    });
                };
                changed |= insert_completed(coordinator, working, &owner, identifier, cell, value)?;
            }
        }

        // Secondaries of every touched composite track the primaries as
        // they would be after the commit. Changed ones join the working
        // map so phase 5 writes them and phase 6 notifies their hooks.
        for owner in touched_composites(working) {
            let primaries = committed_primaries(&owner, working);
            for (identifier, slot) in owner.secondaries() {
                let computed = (slot.compute)(&primaries);
                changed |= insert_secondary(
                    coordinator,
                    working,
                    &owner,
                    identifier,
                    slot.hook.cell(),
                    computed,
                )?;
            }
        }

        if !changed {
            return Ok(());
        }
    }

    Err(SubmitError::CompletionDivergent {
        rounds: COMPLETION_ROUND_CAP,
    })
}

fn insert_completed(
    coordinator: &Coordinator,
    working: &mut WorkingMap,
    owner: &Arc<CompositeCore>,
    identifier: String,
    cell: Arc<CellCore>,
    value: DynValue,
) -> Result<bool, SubmitError> {
    check_cell_type(&cell, &value)?;
    match working.entry(cell.id()) {
        Entry::Occupied(existing) => {
            if coordinator
                .equality()
                .equals(existing.get().value.as_ref(), value.as_ref())
            {
                Ok(false)
            } else {
                Err(SubmitError::CompletionConflict {
                    composite: owner.id(),
                    identifier,
                    cell: cell.id(),
                })
            }
        }
        Entry::Vacant(slot) => {
            slot.insert(PlanEntry {
                cell,
                value,
                origin: Origin::Completed,
            });
            Ok(true)
        }
    }
}

fn insert_secondary(
    coordinator: &Coordinator,
    working: &mut WorkingMap,
    owner: &Arc<CompositeCore>,
    identifier: &str,
    cell: Arc<CellCore>,
    computed: DynValue,
) -> Result<bool, SubmitError> {
    check_cell_type(&cell, &computed)?;
    let equality = coordinator.equality();
    match working.entry(cell.id()) {
        Entry::Occupied(mut existing) => {
            let entry = existing.get_mut();
            if equality.equals(entry.value.as_ref(), computed.as_ref()) {
                return Ok(false);
            }
            match &entry.origin {
                Origin::Secondary {
                    composite,
                    identifier: owned,
                } if *composite == owner.id().0 && owned == identifier => {
                    entry.value = computed;
                    Ok(true)
                }
                _ => Err(SubmitError::CompletionConflict {
                    composite: owner.id(),
                    identifier: identifier.to_owned(),
                    cell: cell.id(),
                }),
            }
        }
        Entry::Vacant(slot) => {
            if equality.equals(cell.current().as_ref(), computed.as_ref()) {
                return Ok(false);
            }
            let id = cell.id();
            slot.insert(PlanEntry {
                cell,
                value: computed,
                origin: Origin::Secondary {
                    composite: owner.id().0,
                    identifier: identifier.to_owned(),
                },
            });
            debug!("completion: secondary cell {id} joined the working map");
            Ok(true)
        }
    }
}

fn check_cell_type(cell: &CellCore, value: &DynValue) -> Result<(), SubmitError> {
    if value.as_any().type_id() == cell.value_type() {
        Ok(())
    } else {
        Err(SubmitError::TypeMismatch {
            cell: cell.id(),
            expected: cell.value_type_name(),
            actual: value.type_name(),
        })
    }
}

/// Composites owning at least one live hook on a working-map cell,
/// deduplicated by identity and ordered by composite id.
fn touched_composites(working: &WorkingMap) -> Vec<Arc<CompositeCore>> {
    let mut seen: AHashSet<u64> = AHashSet::new();
    let mut owners = Vec::new();
    for entry in working.values() {
        for hook in entry.cell.live_members() {
            if let Some((owner, _)) = hook.owner() {
                if seen.insert(owner.id().0) {
                    owners.push(owner);
                }
            }
        }
    }
    owners.sort_by_key(|owner| owner.id());
    owners
}

fn update_view(owner: &CompositeCore, working: &WorkingMap) -> UpdateView {
    let mut submitted = BTreeMap::new();
    let mut current = BTreeMap::new();
    for (key, hook) in owner.primaries() {
        let cell = hook.cell();
        match working.get(&cell.id()) {
            Some(entry) => {
                submitted.insert(key.clone(), Arc::clone(&entry.value));
            }
            None => {
                current.insert(key.clone(), cell.current());
            }
        }
    }
    UpdateView::new(submitted, current)
}

/// The owner's primary values as they would stand after the commit.
fn committed_primaries(owner: &CompositeCore, working: &WorkingMap) -> KeyValues {
    let mut values = BTreeMap::new();
    for (key, hook) in owner.primaries() {
        let cell = hook.cell();
        let value = match working.get(&cell.id()) {
            Some(entry) => Arc::clone(&entry.value),
            None => cell.current(),
        };
        values.insert(key.clone(), value);
    }
    KeyValues::new(values)
}

// ─── Phase 3: affected-component collection ──────────────────────────────

struct Affected {
    composites: Vec<Arc<CompositeCore>>,
    hooks: Vec<Arc<HookCore>>,
    publishers: Vec<PublisherRef>,
}

fn collect_affected(coordinator: &Coordinator, working: &WorkingMap) -> Affected {
    let composites = touched_composites(working);

    let mut seen_hooks: AHashSet<u64> = AHashSet::new();
    let mut hooks = Vec::new();
    for entry in working.values() {
        for hook in entry.cell.live_members() {
            if seen_hooks.insert(hook.id().0) {
                hooks.push(hook);
            }
        }
    }

    let mut publishers = Vec::new();
    if let Some(hub) = coordinator.publisher_hub() {
        let mut seen: AHashSet<usize> = AHashSet::new();
        for id in working.keys() {
            for publisher in hub.publications_for(*id) {
                let identity = Arc::as_ptr(&publisher) as *const u8 as usize;
                if seen.insert(identity) {
                    publishers.push(publisher);
                }
            }
        }
    }

    Affected {
        composites,
        hooks,
        publishers,
    }
}

// ─── Phase 4: validation ─────────────────────────────────────────────────

fn validate(working: &WorkingMap, affected: &Affected) -> Result<(), SubmitError> {
    for owner in &affected.composites {
        let primaries = committed_primaries(owner, working);
        owner
            .behavior()
            .validate_primary(&primaries)
            .map_err(|reason| SubmitError::ValidationRejected {
                source: RejectionSource::Composite(owner.id()),
                reason,
            })?;

        let mut all = primaries;
        for (key, slot) in owner.secondaries() {
            let cell = slot.hook.cell();
            let value = match working.get(&cell.id()) {
                Some(entry) => Arc::clone(&entry.value),
                None => cell.current(),
            };
            all.insert_raw(key.clone(), value);
        }
        owner
            .behavior()
            .validate_all(&all)
            .map_err(|reason| SubmitError::ValidationRejected {
                source: RejectionSource::Composite(owner.id()),
                reason,
            })?;
    }

    for entry in working.values() {
        for hook in entry.cell.live_members() {
            if hook.has_validator() {
                hook.validate_isolated(&entry.value).map_err(|reason| {
                    SubmitError::ValidationRejected {
                        source: RejectionSource::Hook(hook.id()),
                        reason,
                    }
                })?;
            }
        }
    }

    Ok(())
}

// ─── Phase 6: notification ───────────────────────────────────────────────

fn notify(coordinator: &Coordinator, working: &WorkingMap, affected: &Affected, mode: SubmitMode) {
    for owner in &affected.composites {
        owner.behavior().after_commit();
    }

    for hook in &affected.hooks {
        hook.run_reaction();
    }

    if let Some(hub) = coordinator.publisher_hub() {
        if !affected.publishers.is_empty() {
            let info = CommitInfo {
                cells: working.keys().copied().collect(),
                mode,
            };
            for publisher in &affected.publishers {
                hub.publish(publisher, &info);
            }
        }
    }

    for hook in &affected.hooks {
        hook.notify_listeners();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composite::{CompositeContract, CompositeSpec, ValuePatch};
    use crate::error::ErrorKind;
    use crate::hook::Hook;
    use crate::value::dyn_value;

    #[test]
    fn mode_tags_are_stable() {
        assert_eq!(SubmitMode::Normal.to_string(), "NormalSubmission");
        assert_eq!(SubmitMode::Forced.to_string(), "ForcedSubmission");
        assert_eq!(SubmitMode::CheckOnly.to_string(), "CheckOnly");
    }

    #[test]
    fn completion_must_stay_inside_the_binding() {
        struct Rogue;
        impl CompositeContract for Rogue {
            fn complete(&self, _view: &UpdateView) -> ValuePatch {
                ValuePatch::new().set("elsewhere", 1_i64)
            }
            fn validate_primary(&self, _primaries: &KeyValues) -> Result<(), String> {
                Ok(())
            }
        }

        let coordinator = Coordinator::new();
        let composite = coordinator
            .register_composite(
                CompositeSpec::new().primary("n", 0_i64),
                Arc::new(Rogue),
            )
            .unwrap();

        let err = composite
            .submit(ValuePatch::new().set("n", 1_i64))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CompletionExtendsUnknownCell);
        assert_eq!(*composite.value::<i64>("n").unwrap(), 0);
    }

    #[test]
    fn check_only_records_equality_decisions_without_dropping() {
        let coordinator = Coordinator::new();
        let hook = Hook::new(&coordinator, 5_i64);
        let cell = hook.cell_ref();

        let report = coordinator
            .submit([(cell.clone(), dyn_value(5_i64))], SubmitMode::CheckOnly)
            .unwrap();
        assert_eq!(report.filtered, vec![cell.id()]);
        assert!(report.committed.is_empty());
        assert_eq!(*hook.value(), 5);
    }

    #[test]
    fn normal_mode_short_circuits_on_all_equal_values() {
        let coordinator = Coordinator::new();
        let hook = Hook::new(&coordinator, 5_i64);

        let report = coordinator
            .submit(
                [(hook.cell_ref(), dyn_value(5_i64))],
                SubmitMode::Normal,
            )
            .unwrap();
        assert!(report.committed.is_empty());
        assert_eq!(report.filtered.len(), 1);
    }
}
