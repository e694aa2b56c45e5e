//! Publisher collaborator interface.
//!
//! Publish/subscribe lives outside the core. The engine only knows how to
//! ask an installed [`PublisherHub`] which publishers care about a cell
//! (phase 3) and to hand each of them a [`CommitInfo`] after a successful
//! commit (phase 6). Whatever the hub does with that — queue it, dispatch
//! it on an executor, drop it — is outside the commit's atomicity promise.

use std::any::Any;
use std::sync::Arc;

use crate::cell::CellId;
use crate::submission::SubmitMode;

/// Opaque publisher token. The core never inspects it; identity (`Arc`
/// pointer) is used for deduplication across touched cells.
pub type PublisherRef = Arc<dyn Any + Send + Sync>;

/// Summary of an accepted commit, handed to publishers.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    /// Cells whose values changed in this commit, in id order.
    pub cells: Vec<CellId>,
    /// The submission mode that produced the commit.
    pub mode: SubmitMode,
}

/// The downward-facing collaborator the engine consults for publications.
pub trait PublisherHub: Send + Sync {
    /// Publishers registered against `cell`. Called once per touched cell
    /// in phase 3.
    fn publications_for(&self, cell: CellId) -> Vec<PublisherRef>;

    /// Dispatch one publication. Called in phase 6 after the commit is
    /// durable; may hand off to an asynchronous executor.
    fn publish(&self, publisher: &PublisherRef, info: &CommitInfo);
}
