//! Registry of named circuit-breaker state.
//!
//! The registry is what makes circuits shared: every policy built against the
//! same registry and circuit name holds the same state object. A process-wide
//! default registry exists for convenience; tests create their own or call
//! [`CircuitBreakerRegistry::clear`].

use crate::circuit_breaker::{CircuitListenerGuard, CircuitMetrics, CircuitShared, CircuitState};
use crate::clock::Clock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// Handle to inspect and control one named circuit.
#[derive(Clone, Debug)]
pub struct CircuitHandle {
    pub(crate) shared: Arc<CircuitShared>,
}

impl CircuitHandle {
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn state(&self) -> CircuitState {
        self.shared.state()
    }

    pub fn metrics(&self) -> CircuitMetrics {
        self.shared.metrics()
    }

    /// Force the circuit back to closed, clearing consecutive counters.
    pub fn reset(&self) {
        self.shared.reset();
    }

    /// Register a state-change listener on this circuit.
    pub fn add_state_change_listener<F>(&self, listener: F) -> CircuitListenerGuard
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        Arc::clone(&self.shared).add_listener(Arc::new(listener))
    }
}

/// Registry keyed by circuit name.
#[derive(Default, Clone, Debug)]
pub struct CircuitBreakerRegistry {
    inner: Arc<Mutex<HashMap<String, Arc<CircuitShared>>>>,
}

static GLOBAL_CIRCUITS: OnceLock<CircuitBreakerRegistry> = OnceLock::new();

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide default registry.
    pub fn global() -> &'static CircuitBreakerRegistry {
        GLOBAL_CIRCUITS.get_or_init(CircuitBreakerRegistry::new)
    }

    /// Shared state for `name`, created with `clock` on first use. An
    /// existing circuit keeps the clock it was created with.
    pub(crate) fn shared(&self, name: &str, clock: Arc<dyn Clock>) -> Arc<CircuitShared> {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitShared::new(name.to_string(), clock))),
        )
    }

    /// Handle to a registered circuit, if present.
    pub fn get(&self, name: &str) -> Option<CircuitHandle> {
        let map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        map.get(name).map(|shared| CircuitHandle { shared: Arc::clone(shared) })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).contains_key(name)
    }

    /// Reset a registered circuit by name.
    pub fn reset(&self, name: &str) -> Result<(), UnknownCircuit> {
        match self.get(name) {
            Some(handle) => {
                handle.reset();
                Ok(())
            }
            None => Err(UnknownCircuit { name: name.to_string() }),
        }
    }

    /// Snapshot of all circuits, sorted by name.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(name, shared)| (name.clone(), shared.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every registered circuit. Intended for tests against the global
    /// registry; policies holding state keep their own handles alive.
    pub fn clear(&self) {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

/// Error returned when addressing a circuit that was never registered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no circuit registered under '{name}'")]
pub struct UnknownCircuit {
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;

    fn clock() -> Arc<dyn Clock> {
        Arc::new(MonotonicClock::default())
    }

    #[test]
    fn shared_returns_the_same_state_per_name() {
        let registry = CircuitBreakerRegistry::new();
        let a = registry.shared("svc", clock());
        let b = registry.shared("svc", clock());
        let other = registry.shared("other", clock());

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn get_and_contains_reflect_registrations() {
        let registry = CircuitBreakerRegistry::new();
        assert!(registry.get("svc").is_none());
        assert!(!registry.contains("svc"));

        let _ = registry.shared("svc", clock());
        let handle = registry.get("svc").unwrap();
        assert_eq!(handle.name(), "svc");
        assert_eq!(handle.state(), CircuitState::Closed);
        assert!(registry.contains("svc"));
    }

    #[test]
    fn reset_unknown_circuit_errors() {
        let registry = CircuitBreakerRegistry::new();
        let err = registry.reset("missing").unwrap_err();
        assert_eq!(err.name, "missing");
    }

    #[test]
    fn snapshot_is_sorted_by_name() {
        let registry = CircuitBreakerRegistry::new();
        let _ = registry.shared("zeta", clock());
        let _ = registry.shared("alpha", clock());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].0, "alpha");
        assert_eq!(snapshot[1].0, "zeta");
    }

    #[test]
    fn clear_empties_the_registry() {
        let registry = CircuitBreakerRegistry::new();
        let _ = registry.shared("svc", clock());
        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn global_registry_is_a_singleton() {
        let a = CircuitBreakerRegistry::global();
        let b = CircuitBreakerRegistry::global();
        assert!(Arc::ptr_eq(&a.inner, &b.inner));
    }
}
