//! Cell: the shared value store of a fusion domain.
//!
//! A cell holds the current and previous value for every hook joined into
//! its domain, plus a weak member list. Exactly one cell exists per domain
//! at any moment; joins rebuild a fresh cell over the union of members and
//! isolates split a hook into a fresh singleton cell.
//!
//! # Invariants
//!
//! 1. Every write goes through the submission engine; there is no external
//!    mutation path for `current`.
//! 2. `previous == current` at creation; after a commit, `previous` is the
//!    value from immediately before that commit.
//! 3. Members are held weakly: a cell never keeps a hook alive, and dead
//!    member references are pruned transparently during iteration.

use std::any::TypeId;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::RwLock;

use crate::hook::HookCore;
use crate::value::DynValue;

/// Stable identity of a cell, assigned from a per-coordinator monotonic
/// counter. Survives for the cell's lifetime; fresh cells from joins and
/// isolates get fresh ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellId(pub(crate) u64);

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub(crate) struct CellState {
    pub(crate) current: DynValue,
    pub(crate) previous: DynValue,
    pub(crate) members: Vec<Weak<HookCore>>,
}

/// Value storage for one fusion domain.
pub(crate) struct CellCore {
    id: CellId,
    coordinator_id: u64,
    value_type: TypeId,
    value_type_name: &'static str,
    created_at: Instant,
    state: RwLock<CellState>,
}

impl CellCore {
    /// New cell carrying `value`. `previous` starts as the same shared
    /// allocation.
    pub(crate) fn new(id: CellId, coordinator_id: u64, value: DynValue) -> Arc<Self> {
        let value_type = value.as_any().type_id();
        let value_type_name = value.type_name();
        Arc::new(Self {
            id,
            coordinator_id,
            value_type,
            value_type_name,
            created_at: Instant::now(),
            state: RwLock::new(CellState {
                previous: Arc::clone(&value),
                current: value,
                members: Vec::new(),
            }),
        })
    }

    pub(crate) fn id(&self) -> CellId {
        self.id
    }

    /// Id of the coordinator this cell belongs to. Cells never migrate.
    pub(crate) fn coordinator_id(&self) -> u64 {
        self.coordinator_id
    }

    /// The domain type fixed at creation; every committed value must match.
    pub(crate) fn value_type(&self) -> TypeId {
        self.value_type
    }

    pub(crate) fn value_type_name(&self) -> &'static str {
        self.value_type_name
    }

    pub(crate) fn current(&self) -> DynValue {
        Arc::clone(&self.state.read().current)
    }

    pub(crate) fn previous(&self) -> DynValue {
        Arc::clone(&self.state.read().previous)
    }

    /// Engine-only bulk-mutation step: shift `current` into `previous` and
    /// store the new value. Callers hold the coordinator lock.
    pub(crate) fn commit(&self, value: DynValue) {
        let mut state = self.state.write();
        state.previous = Arc::clone(&state.current);
        state.current = value;
    }

    pub(crate) fn add_member(&self, hook: &Arc<HookCore>) {
        self.state.write().members.push(Arc::downgrade(hook));
    }

    pub(crate) fn remove_member(&self, hook: &HookCore) {
        self.state
            .write()
            .members
            .retain(|member| member.upgrade().is_some_and(|m| !std::ptr::eq(m.as_ref(), hook)));
    }

    /// Upgrade the member list, pruning dead references in place.
    /// Callers hold the coordinator lock.
    pub(crate) fn live_members(&self) -> Vec<Arc<HookCore>> {
        let mut state = self.state.write();
        let mut live = Vec::with_capacity(state.members.len());
        state.members.retain(|member| match member.upgrade() {
            Some(hook) => {
                live.push(hook);
                true
            }
            None => false,
        });
        live
    }

    /// Drop every member reference. Fusion-ops only, when this cell has
    /// been superseded by a merged one.
    pub(crate) fn clear_members(&self) {
        self.state.write().members.clear();
    }

    pub(crate) fn member_count(&self) -> usize {
        self.state
            .read()
            .members
            .iter()
            .filter(|member| member.strong_count() > 0)
            .count()
    }

    pub(crate) fn diagnostics(&self) -> CellDiagnostics {
        let state = self.state.read();
        CellDiagnostics {
            id: self.id,
            current: Arc::clone(&state.current),
            previous: Arc::clone(&state.previous),
            member_count: state
                .members
                .iter()
                .filter(|member| member.strong_count() > 0)
                .count(),
            created_at: self.created_at,
        }
    }
}

/// Opaque public handle to a cell, used to build raw submission proposals.
#[derive(Clone)]
pub struct CellRef(pub(crate) Arc<CellCore>);

impl CellRef {
    /// The cell's stable id.
    #[must_use]
    pub fn id(&self) -> CellId {
        self.0.id()
    }
}

impl std::fmt::Debug for CellRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellRef").field("id", &self.0.id()).finish()
    }
}

/// Point-in-time snapshot of one live cell, for diagnostic queries.
#[derive(Clone)]
pub struct CellDiagnostics {
    /// Stable cell id.
    pub id: CellId,
    /// Value after the last accepted commit.
    pub current: DynValue,
    /// Value before the last accepted commit.
    pub previous: DynValue,
    /// Live member hooks at snapshot time.
    pub member_count: usize,
    /// When the cell was created.
    pub created_at: Instant,
}

impl std::fmt::Debug for CellDiagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellDiagnostics")
            .field("id", &self.id)
            .field("current", &self.current)
            .field("previous", &self.previous)
            .field("member_count", &self.member_count)
            .finish()
    }
}
