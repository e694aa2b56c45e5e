//! Type-pair equality dispatch with tolerance.
//!
//! The registry maps unordered pairs of concrete types to comparator
//! callbacks. [`EqualityRegistry::equals`] looks up `(type(a), type(b))`,
//! falls back to the swapped pair (with swapped arguments), and finally to
//! structural equality via [`Value::dyn_eq`]. Every callback receives the
//! registry's scalar tolerance as its third argument; non-numerical
//! comparators are free to ignore it.
//!
//! The engine consults the registry exactly once per `{cell, old, new}`
//! pair during phase 1. Registrations made while a submission is in flight
//! are serialized by the interior lock.

use std::any::TypeId;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::error::RegistryError;
use crate::value::Value;

/// Default comparison tolerance handed to callbacks.
pub const DEFAULT_TOLERANCE: f64 = 1e-9;

type ErasedEqualityFn = Box<dyn Fn(&dyn Value, &dyn Value, f64) -> bool + Send + Sync>;

struct RegisteredPair {
    callback: ErasedEqualityFn,
    names: (&'static str, &'static str),
}

/// Registry of cross-type equality callbacks plus a scalar tolerance.
pub struct EqualityRegistry {
    pairs: RwLock<AHashMap<(TypeId, TypeId), RegisteredPair>>,
    tolerance: RwLock<f64>,
}

impl Default for EqualityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EqualityRegistry {
    /// Empty registry with the default tolerance.
    #[must_use]
    pub fn new() -> Self {
        Self::with_tolerance(DEFAULT_TOLERANCE)
    }

    /// Empty registry with an explicit tolerance.
    #[must_use]
    pub fn with_tolerance(tolerance: f64) -> Self {
        Self {
            pairs: RwLock::new(AHashMap::new()),
            tolerance: RwLock::new(tolerance),
        }
    }

    /// Current tolerance.
    #[must_use]
    pub fn tolerance(&self) -> f64 {
        *self.tolerance.read()
    }

    /// Replace the tolerance used for subsequent comparisons.
    pub fn set_tolerance(&self, tolerance: f64) {
        *self.tolerance.write() = tolerance;
    }

    /// Register a comparator for the `(A, B)` type pair.
    ///
    /// Fails if the exact pair is already registered. The swapped pair
    /// `(B, A)` counts as a distinct registration slot; lookups try both.
    pub fn register<A, B>(
        &self,
        callback: impl Fn(&A, &B, f64) -> bool + Send + Sync + 'static,
    ) -> Result<(), RegistryError>
    where
        A: Value,
        B: Value,
    {
        let key = (TypeId::of::<A>(), TypeId::of::<B>());
        let mut pairs = self.pairs.write();
        if pairs.contains_key(&key) {
            return Err(RegistryError::AlreadyRegistered {
                left: std::any::type_name::<A>(),
                right: std::any::type_name::<B>(),
            });
        }
        pairs.insert(key, Self::erase(callback));
        Ok(())
    }

    /// Swap the comparator for an already-registered pair.
    pub fn replace<A, B>(
        &self,
        callback: impl Fn(&A, &B, f64) -> bool + Send + Sync + 'static,
    ) -> Result<(), RegistryError>
    where
        A: Value,
        B: Value,
    {
        let key = (TypeId::of::<A>(), TypeId::of::<B>());
        let mut pairs = self.pairs.write();
        if !pairs.contains_key(&key) {
            return Err(RegistryError::NotRegistered {
                left: std::any::type_name::<A>(),
                right: std::any::type_name::<B>(),
            });
        }
        pairs.insert(key, Self::erase(callback));
        Ok(())
    }

    /// Remove the comparator for the `(A, B)` pair.
    pub fn unregister<A, B>(&self) -> Result<(), RegistryError>
    where
        A: Value,
        B: Value,
    {
        let key = (TypeId::of::<A>(), TypeId::of::<B>());
        if self.pairs.write().remove(&key).is_none() {
            return Err(RegistryError::NotRegistered {
                left: std::any::type_name::<A>(),
                right: std::any::type_name::<B>(),
            });
        }
        Ok(())
    }

    /// Whether the exact `(A, B)` pair has a comparator.
    #[must_use]
    pub fn contains<A, B>(&self) -> bool
    where
        A: Value,
        B: Value,
    {
        self.pairs
            .read()
            .contains_key(&(TypeId::of::<A>(), TypeId::of::<B>()))
    }

    /// Type-name pairs of all registered comparators, for diagnostics.
    #[must_use]
    pub fn registered_pairs(&self) -> Vec<(&'static str, &'static str)> {
        let mut names: Vec<_> = self.pairs.read().values().map(|p| p.names).collect();
        names.sort_unstable();
        names
    }

    /// Compare two erased values under the registry's policy.
    #[must_use]
    pub fn equals(&self, a: &dyn Value, b: &dyn Value) -> bool {
        let tolerance = self.tolerance();
        let key = (a.as_any().type_id(), b.as_any().type_id());
        let pairs = self.pairs.read();
        if let Some(pair) = pairs.get(&key) {
            return (pair.callback)(a, b, tolerance);
        }
        if let Some(pair) = pairs.get(&(key.1, key.0)) {
            return (pair.callback)(b, a, tolerance);
        }
        a.dyn_eq(b)
    }

    fn erase<A, B>(callback: impl Fn(&A, &B, f64) -> bool + Send + Sync + 'static) -> RegisteredPair
    where
        A: Value,
        B: Value,
    {
        RegisteredPair {
            callback: Box::new(move |a, b, tolerance| {
                match (
                    a.as_any().downcast_ref::<A>(),
                    b.as_any().downcast_ref::<B>(),
                ) {
                    (Some(a), Some(b)) => callback(a, b, tolerance),
                    // Unreachable through `equals` (keyed by TypeId), kept
                    // total so the callback type stays honest.
                    _ => false,
                }
            }),
            names: (std::any::type_name::<A>(), std::any::type_name::<B>()),
        }
    }
}

/// Tolerance-aware `f64` comparator, the conventional registration for
/// float-valued domains.
#[must_use]
pub fn approx_f64(a: &f64, b: &f64, tolerance: f64) -> bool {
    if a == b {
        return true;
    }
    if a.is_nan() && b.is_nan() {
        return true;
    }
    (a - b).abs() <= tolerance
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::dyn_value;

    #[test]
    fn structural_fallback() {
        let registry = EqualityRegistry::new();
        assert!(registry.equals(dyn_value(5_i64).as_ref(), dyn_value(5_i64).as_ref()));
        assert!(!registry.equals(dyn_value(5_i64).as_ref(), dyn_value(6_i64).as_ref()));
        // Cross-type without a callback: unequal.
        assert!(!registry.equals(dyn_value(5_i64).as_ref(), dyn_value(5.0_f64).as_ref()));
    }

    #[test]
    fn registered_pair_and_swapped_lookup() {
        let registry = EqualityRegistry::new();
        registry
            .register::<i64, f64>(|a, b, tolerance| (*a as f64 - b).abs() <= tolerance)
            .unwrap();

        let int = dyn_value(5_i64);
        let float = dyn_value(5.0_f64);
        assert!(registry.equals(int.as_ref(), float.as_ref()));
        // Swapped argument order routes through the same callback.
        assert!(registry.equals(float.as_ref(), int.as_ref()));
    }

    #[test]
    fn duplicate_register_and_missing_unregister_fail() {
        let registry = EqualityRegistry::new();
        registry.register::<f64, f64>(approx_f64).unwrap();
        assert!(matches!(
            registry.register::<f64, f64>(approx_f64),
            Err(RegistryError::AlreadyRegistered { .. })
        ));
        registry.unregister::<f64, f64>().unwrap();
        assert!(matches!(
            registry.unregister::<f64, f64>(),
            Err(RegistryError::NotRegistered { .. })
        ));
    }

    #[test]
    fn replace_swaps_behavior() {
        let registry = EqualityRegistry::new();
        registry.register::<i64, i64>(|_, _, _| false).unwrap();
        assert!(!registry.equals(dyn_value(1_i64).as_ref(), dyn_value(1_i64).as_ref()));
        registry.replace::<i64, i64>(|a, b, _| a == b).unwrap();
        assert!(registry.equals(dyn_value(1_i64).as_ref(), dyn_value(1_i64).as_ref()));
    }

    #[test]
    fn tolerance_reaches_callbacks() {
        let registry = EqualityRegistry::with_tolerance(0.5);
        registry.register::<f64, f64>(approx_f64).unwrap();
        assert!(registry.equals(dyn_value(1.0_f64).as_ref(), dyn_value(1.4_f64).as_ref()));
        registry.set_tolerance(0.1);
        assert!(!registry.equals(dyn_value(1.0_f64).as_ref(), dyn_value(1.4_f64).as_ref()));
    }

    #[test]
    fn registered_pairs_lists_names() {
        let registry = EqualityRegistry::new();
        registry.register::<f64, f64>(approx_f64).unwrap();
        let pairs = registry.registered_pairs();
        assert_eq!(pairs, vec![("f64", "f64")]);
        assert!(registry.contains::<f64, f64>());
        assert!(!registry.contains::<i64, f64>());
    }
}
