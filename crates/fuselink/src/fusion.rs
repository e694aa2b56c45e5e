//! Fusion ops: joining and isolating hooks.
//!
//! Joining is adopt-then-merge: the surviving value is pushed onto the
//! other side's cell through a full normal-mode submission, so every
//! validator in that domain gets a say, and only then are the two member
//! sets fused into a fresh cell. The adoption submission is also the
//! notification mechanism — its phase 6 fires exactly when the adopted
//! value actually changed, which makes value-equal joins listener-silent.
//!
//! Isolation never changes a value, so it never notifies.
//!
//! There is exactly one lock in play (the coordinator's, reentrant), so
//! nested fusion ops from a single thread cannot deadlock.

use std::sync::Arc;

use crate::cell::CellRef;
use crate::coordinator::Coordinator;
use crate::error::SubmitError;
use crate::hook::HookCore;
use crate::logging::debug;
use crate::submission::SubmitMode;

/// Which side's value survives a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinValue {
    /// The joining (calling) hook's value is adopted by the target domain.
    Caller,
    /// The target hook's value is adopted by the caller's domain.
    Target,
}

/// Fuse the caller's domain with the target's.
///
/// `target` is resolved under the coordinator lock so the join sees a
/// consistent pair of cells even with concurrent fusion ops in flight.
pub(crate) fn join(
    coordinator: &Coordinator,
    caller: &Arc<HookCore>,
    target: impl FnOnce() -> CellRef,
    adopt: JoinValue,
) -> Result<(), SubmitError> {
    let _guard = coordinator.read_section();

    let caller_cell = caller.cell();
    let target_cell = target().0;
    assert_eq!(
        target_cell.coordinator_id(),
        coordinator.id(),
        "cannot join hooks owned by different coordinators"
    );

    if Arc::ptr_eq(&caller_cell, &target_cell) {
        return Ok(());
    }

    let (donor, adopter) = match adopt {
        JoinValue::Caller => (&caller_cell, &target_cell),
        JoinValue::Target => (&target_cell, &caller_cell),
    };

    // Give every owner and validator on the adopting side a chance to
    // reject before any structure changes.
    coordinator
        .submit_cells(
            vec![(Arc::clone(adopter), donor.current())],
            SubmitMode::Normal,
        )
        .map_err(|cause| SubmitError::FusionRejected(Box::new(cause)))?;

    let merged = coordinator.create_cell(adopter.current());
    for hook in caller_cell
        .live_members()
        .into_iter()
        .chain(target_cell.live_members())
    {
        merged.add_member(&hook);
        hook.set_cell(Arc::clone(&merged));
    }
    // The old cells are superseded; a straggler holding one of them must
    // not reach the redirected hooks through its member list.
    caller_cell.clear_members();
    target_cell.clear_members();

    debug!(
        "join: cells {} + {} fused into {}",
        caller_cell.id(),
        target_cell.id(),
        merged.id()
    );
    Ok(())
}

/// Split `hook` out of its domain into a fresh singleton cell carrying the
/// same current value. A hook that is already alone keeps its cell.
pub(crate) fn isolate(coordinator: &Coordinator, hook: &Arc<HookCore>) {
    let _guard = coordinator.read_section();

    let cell = hook.cell();
    if cell.live_members().len() <= 1 {
        return;
    }

    let isolated = coordinator.create_cell(cell.current());
    cell.remove_member(hook);
    isolated.add_member(hook);
    hook.set_cell(Arc::clone(&isolated));

    debug!(
        "isolate: hook {} moved from cell {} to {}",
        hook.id(),
        cell.id(),
        isolated.id()
    );
}
