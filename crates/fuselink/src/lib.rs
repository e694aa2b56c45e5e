//! # fuselink
//!
//! A reactive state-synchronization engine: dynamic networks of connection
//! points ("hooks") kept in agreement about shared values, with
//! application-level invariants enforced atomically across any number of
//! those networks.
//!
//! ## Model
//!
//! - A [`Cell`](cell::CellRef) stores the value of one *fusion domain* —
//!   the equivalence class of hooks that currently share it.
//! - A [`Hook`] is the user-facing handle: read, submit, listen. Joining
//!   two hooks fuses their domains (with validation); isolating a hook
//!   splits it back into a singleton domain.
//! - A [`Composite`] owns several hooks under named identifiers and keeps
//!   multi-hook invariants through the [`CompositeContract`]: completion of
//!   partial writes, atomic validation, post-commit notification.
//! - The [`Coordinator`] serializes everything behind one reentrant lock
//!   and runs every write through a six-phase submission pipeline:
//!   equality filter → value completion → affected-component collection →
//!   validation → atomic commit → notification.
//!
//! Either every proposed (and completed) value commits, or none do.
//! Listeners observe a single consistent snapshot per commit. Nested
//! submissions from callbacks are permitted on disjoint cell sets and
//! rejected as [`ErrorKind::Reentrant`] on overlapping ones.
//!
//! ## Example
//!
//! ```
//! use fuselink::{Coordinator, Hook};
//!
//! let coordinator = Coordinator::new();
//! let celsius = Hook::new(&coordinator, 0.0_f64);
//! let display = Hook::new(&coordinator, 0.0_f64);
//!
//! // Fuse the two domains; the caller's value survives.
//! celsius.join(&display)?;
//!
//! celsius.submit(21.5)?;
//! assert_eq!(*display.value(), 21.5);
//! # Ok::<(), fuselink::SubmitError>(())
//! ```
//!
//! Values are stored by reference ([`DynValue`] is an `Arc`) and never
//! copied by the engine; commit cost is independent of value size.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]
#![warn(missing_docs)]

pub mod cell;
pub mod composite;
pub mod coordinator;
pub mod equality;
pub mod error;
pub mod fusion;
pub mod hook;
mod logging;
pub mod publish;
pub mod submission;
pub mod value;

pub use cell::{CellDiagnostics, CellId, CellRef};
pub use composite::{
    Composite, CompositeContract, CompositeId, CompositeSpec, KeyValues, SecondaryFn, UpdateView,
    ValuePatch,
};
pub use coordinator::Coordinator;
pub use equality::{approx_f64, EqualityRegistry, DEFAULT_TOLERANCE};
pub use error::{ErrorKind, RegistryError, RejectionSource, SubmitError};
pub use fusion::JoinValue;
pub use hook::{Hook, HookBuilder, HookId, HookRef, Listener, Reaction, ReadOnlyHook};
pub use publish::{CommitInfo, PublisherHub, PublisherRef};
pub use submission::{SubmitMode, SubmitReport, COMPLETION_ROUND_CAP};
pub use value::{downcast_value, dyn_value, DynValue, Value};
