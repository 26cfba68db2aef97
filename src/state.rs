//! Shared state store for crews.
//!
//! Every crew owns a single mutable key/value mapping that acts as the
//! backplane for cost records and cross-agent task context. Any agent or
//! function may read or write any key; there is no per-key access control.
//! That is a deliberate trade-off (simplicity over isolation) and part of
//! the store's contract.
//!
//! Stores are handed out by a [`StateRegistry`], one store per crew id.
//! Creation is idempotent: the first caller creates the store, later
//! callers with the same id receive the same instance.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::Value;

// ---------------------------------------------------------------------------
// SharedState
// ---------------------------------------------------------------------------

/// A crew's shared key/value store.
///
/// Cheap to clone; clones share the same underlying map. Overlapping
/// non-additive writes follow last-writer-wins; additive records (costs,
/// metrics) are merged commutatively by their owners, which tolerates
/// interleaving from concurrently suspended tasks.
#[derive(Debug, Clone, Default)]
pub struct SharedState {
    inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl SharedState {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the value for a key, if present.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().get(key).cloned()
    }

    /// Set a key to a value.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.inner.write().insert(key.into(), value);
    }

    /// Remove a key, returning its previous value.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.write().remove(key)
    }

    /// Snapshot copy of the entire store.
    pub fn get_all(&self) -> HashMap<String, Value> {
        self.inner.read().clone()
    }

    /// All keys currently present.
    pub fn keys(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    /// Clear all keys.
    pub fn reset(&self) {
        self.inner.write().clear();
    }
}

// ---------------------------------------------------------------------------
// StateRegistry
// ---------------------------------------------------------------------------

/// Hands out shared state stores, one per crew id.
///
/// An explicit injectable service rather than a module-level global, so
/// tests and multi-crew hosts can isolate their stores. A process-wide
/// default is available through [`default_registry`] for hosts that do not
/// care.
#[derive(Debug, Default)]
pub struct StateRegistry {
    stores: DashMap<String, SharedState>,
}

impl StateRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the store for a crew id, creating it on first request.
    ///
    /// Idempotent: re-requesting the same id returns the same store.
    pub fn store_for(&self, crew_id: &str) -> SharedState {
        self.stores
            .entry(crew_id.to_string())
            .or_default()
            .clone()
    }

    /// Tear down the store for a crew id: reset it to empty and drop the
    /// registry entry.
    pub fn teardown(&self, crew_id: &str) {
        if let Some((_, store)) = self.stores.remove(crew_id) {
            store.reset();
        }
    }

    /// Number of live stores.
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// Whether the registry holds no stores.
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

static DEFAULT_REGISTRY: Lazy<Arc<StateRegistry>> = Lazy::new(|| Arc::new(StateRegistry::new()));

/// Process-wide default state registry.
pub fn default_registry() -> Arc<StateRegistry> {
    DEFAULT_REGISTRY.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_set_reset() {
        let state = SharedState::new();
        assert!(state.get("k").is_none());

        state.set("k", json!({"v": 1}));
        assert_eq!(state.get("k").unwrap()["v"], 1);

        state.reset();
        assert!(state.get("k").is_none());
    }

    #[test]
    fn test_get_all_is_snapshot() {
        let state = SharedState::new();
        state.set("a", json!(1));
        let snapshot = state.get_all();
        state.set("b", json!(2));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(state.get_all().len(), 2);
    }

    #[test]
    fn test_clones_share_storage() {
        let state = SharedState::new();
        let clone = state.clone();
        clone.set("k", json!("v"));
        assert_eq!(state.get("k").unwrap(), "v");
    }

    #[test]
    fn test_registry_idempotent_lookup() {
        let registry = StateRegistry::new();
        let a = registry.store_for("crew-1");
        a.set("k", json!(42));

        // Second lookup returns the same store, not a fresh one.
        let b = registry.store_for("crew-1");
        assert_eq!(b.get("k").unwrap(), 42);
        assert_eq!(registry.len(), 1);

        let other = registry.store_for("crew-2");
        assert!(other.get("k").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_teardown_resets_and_removes() {
        let registry = StateRegistry::new();
        let store = registry.store_for("crew-1");
        store.set("k", json!(1));

        registry.teardown("crew-1");
        // The old handle was reset; a new lookup creates a fresh store.
        assert!(store.get("k").is_none());
        assert!(registry.store_for("crew-1").get("k").is_none());
    }
}
