//! Type-erased value storage for cells.
//!
//! A cell stores one [`DynValue`]: a shared, reference-counted, type-erased
//! value. Values are never copied by the engine — equality checks, commits,
//! and propagation to joined hooks all move `Arc`s around.
//!
//! [`Value`] is blanket-implemented for every `'static` type that is
//! `PartialEq + Debug + Send + Sync`, so user code rarely names it. The
//! trait exists to give the engine two dyn-safe capabilities:
//!
//! 1. Structural equality across erased values ([`Value::dyn_eq`]), used as
//!    the fallback when no type-pair callback is registered.
//! 2. Arc-preserving downcasts back to the concrete type
//!    ([`downcast_value`]), used by the typed [`Hook`](crate::hook::Hook)
//!    read path.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A value that can live in a cell.
///
/// Blanket-implemented; do not implement manually.
pub trait Value: Any + Send + Sync + fmt::Debug {
    /// Structural equality against another erased value.
    ///
    /// Values of different concrete types are never structurally equal;
    /// cross-type equality requires a registered callback on the
    /// [`EqualityRegistry`](crate::equality::EqualityRegistry).
    fn dyn_eq(&self, other: &dyn Value) -> bool;

    /// Borrowed `Any` view for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Owned `Any` view, preserving the allocation.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Concrete type name, for diagnostics and error messages.
    fn type_name(&self) -> &'static str;
}

impl<T> Value for T
where
    T: Any + PartialEq + Send + Sync + fmt::Debug,
{
    fn dyn_eq(&self, other: &dyn Value) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| self == other)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Shared handle to an erased cell value.
pub type DynValue = Arc<dyn Value>;

/// Erase a concrete value into a [`DynValue`].
pub fn dyn_value<T: Value>(value: T) -> DynValue {
    Arc::new(value)
}

/// Downcast an erased value back to `Arc<T>` without cloning the payload.
///
/// Returns `None` when the stored type is not `T`.
pub fn downcast_value<T: Value>(value: &DynValue) -> Option<Arc<T>> {
    Arc::clone(value).as_any_arc().downcast::<T>().ok()
}
