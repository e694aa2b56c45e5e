//! Error taxonomy for the submission pipeline and fusion operations.
//!
//! Every failure surfaced at an entry point (`submit`, `join`) is one of the
//! [`SubmitError`] variants. Each variant maps to a stable [`ErrorKind`]
//! tag so tests can assert on the failure class without string matching.
//!
//! Failure timing guarantees:
//!
//! - Phase 1–4 errors leave every cell untouched.
//! - Phase 5 cannot fail (pure mutation on already-validated data).
//! - Phase 6 callback panics are captured and logged, never surfaced; the
//!   commit has already happened and is not rolled back.

use thiserror::Error;

use crate::cell::CellId;
use crate::composite::CompositeId;
use crate::hook::HookId;

/// Stable identifier for a [`SubmitError`] class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A phase-4 validator rejected the proposed values.
    ValidationRejected,
    /// Two completion callbacks asked for incompatible values on one cell.
    CompletionConflict,
    /// Value completion exceeded the round cap.
    CompletionDivergent,
    /// A completion callback named an identifier outside its own binding.
    CompletionExtendsUnknownCell,
    /// A nested submission intersected this thread's active cell set.
    Reentrant,
    /// The value-adoption submission inside a join failed.
    FusionRejected,
    /// A value's concrete type does not match the cell's domain type.
    TypeMismatch,
    /// A composite write named an identifier that is not one of its
    /// primaries. Surfaced at the wrapper boundary, never by the engine.
    UnknownIdentifier,
}

/// Which validator produced a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionSource {
    /// A composite's `validate_primary` or `validate_all`.
    Composite(CompositeId),
    /// A hook's isolated validator.
    Hook(HookId),
}

impl std::fmt::Display for RejectionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Composite(id) => write!(f, "composite {id}"),
            Self::Hook(id) => write!(f, "hook {id}"),
        }
    }
}

impl std::error::Error for RejectionSource {}

/// A failed submission or fusion operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubmitError {
    /// A phase-4 check failed. Carries the first failure in deterministic
    /// order (composites by id, identifiers in key order, then hooks).
    #[error("validation rejected by {source}: {reason}")]
    ValidationRejected {
        /// The validator that rejected.
        source: RejectionSource,
        /// The reason string returned by the validator.
        reason: String,
    },

    /// Phase 2 produced two incompatible values for the same cell.
    #[error("completion conflict: composite {composite} wants a different value for '{identifier}' on cell {cell}")]
    CompletionConflict {
        /// The composite whose completion collided.
        composite: CompositeId,
        /// The identifier inside that composite's binding.
        identifier: String,
        /// The contested cell.
        cell: CellId,
    },

    /// Phase 2 did not reach a fixed point within the round cap.
    #[error("value completion did not converge after {rounds} rounds")]
    CompletionDivergent {
        /// Rounds executed before giving up.
        rounds: u32,
    },

    /// A completion callback returned an identifier it does not own.
    #[error("composite {composite} completion returned unknown identifier '{identifier}'")]
    CompletionExtendsUnknownCell {
        /// The offending composite.
        composite: CompositeId,
        /// The identifier that is not a primary of that composite.
        identifier: String,
    },

    /// A nested submission on this thread targeted cells that are already
    /// mid-commit.
    #[error("reentrant submission: {} cell(s) already committing on this thread", cells.len())]
    Reentrant {
        /// The overlapping cell ids.
        cells: Vec<CellId>,
    },

    /// The value-adoption submission inside `join` failed; the original
    /// error is preserved.
    #[error("fusion rejected: {0}")]
    FusionRejected(#[source] Box<SubmitError>),

    /// A proposed value's concrete type does not match the cell's domain.
    #[error("type mismatch for cell {cell}: expected {expected}, got {actual}")]
    TypeMismatch {
        /// The target cell.
        cell: CellId,
        /// The cell's domain type name.
        expected: &'static str,
        /// The offered value's type name.
        actual: &'static str,
    },

    /// A composite write named an identifier that is not a primary of the
    /// composite (wrapper-layer error, like [`SubmitError::TypeMismatch`]).
    #[error("composite {composite} has no writable identifier '{identifier}'")]
    UnknownIdentifier {
        /// The composite that was asked to write.
        composite: CompositeId,
        /// The unknown or read-only identifier.
        identifier: String,
    },
}

impl SubmitError {
    /// The stable class tag for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationRejected { .. } => ErrorKind::ValidationRejected,
            Self::CompletionConflict { .. } => ErrorKind::CompletionConflict,
            Self::CompletionDivergent { .. } => ErrorKind::CompletionDivergent,
            Self::CompletionExtendsUnknownCell { .. } => ErrorKind::CompletionExtendsUnknownCell,
            Self::Reentrant { .. } => ErrorKind::Reentrant,
            Self::FusionRejected(_) => ErrorKind::FusionRejected,
            Self::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            Self::UnknownIdentifier { .. } => ErrorKind::UnknownIdentifier,
        }
    }

    /// For a [`SubmitError::FusionRejected`], the wrapped cause; otherwise
    /// the error itself.
    #[must_use]
    pub fn root_cause(&self) -> &SubmitError {
        match self {
            Self::FusionRejected(inner) => inner.root_cause(),
            other => other,
        }
    }
}

/// Equality-registry bookkeeping errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// `register` was called for a type pair that already has a callback.
    #[error("equality callback for ({left}, {right}) already exists")]
    AlreadyRegistered {
        /// Left type name.
        left: &'static str,
        /// Right type name.
        right: &'static str,
    },

    /// `unregister` or `replace` named a pair with no callback.
    #[error("no equality callback registered for ({left}, {right})")]
    NotRegistered {
        /// Left type name.
        left: &'static str,
        /// Right type name.
        right: &'static str,
    },
}
