use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use modelops::{derive_key, CatalogEntry, ModelId, ModelKey, StateSnapshot};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

pub type SharedState = Arc<RuntimeState>;

/// Position of one model key in the load state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LoadPhase {
    Idle,
    Checking,
    AlreadyLoaded,
    Waiting,
    Requesting,
    Ready,
    Failed,
}

/// All mutable state one coordinator owns. Guarded by a single mutex that
/// is never held across an await point.
#[derive(Default)]
pub struct RuntimeState {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    snapshot: Arc<StateSnapshot>,
    fetched_at: Option<Instant>,
    native_api: Option<bool>,
    native_checked_at: Option<Instant>,
    loaded_ids: BTreeSet<ModelId>,
    loaded_keys: BTreeSet<ModelKey>,
    loading_ids: BTreeSet<ModelId>,
    loading_keys: BTreeSet<ModelKey>,
    cooldowns: HashMap<ModelKey, Instant>,
    phases: HashMap<ModelKey, LoadPhase>,
    catalog: Option<(Instant, Arc<Vec<CatalogEntry>>)>,
}

impl RuntimeState {
    pub fn new() -> SharedState {
        Arc::new(Self::default())
    }

    // --- state cache ---

    pub fn snapshot(&self) -> Arc<StateSnapshot> {
        self.inner.lock().snapshot.clone()
    }

    /// Cached snapshot if it is younger than `min_interval`.
    pub fn fresh_snapshot(&self, min_interval: Duration) -> Option<Arc<StateSnapshot>> {
        let inner = self.inner.lock();
        match inner.fetched_at {
            Some(at) if at.elapsed() < min_interval => Some(inner.snapshot.clone()),
            _ => None,
        }
    }

    /// Replace the snapshot and rebuild the resident sets from it.
    pub fn install_snapshot(&self, snapshot: StateSnapshot) -> Arc<StateSnapshot> {
        let now = Instant::now();
        let snapshot = Arc::new(snapshot);
        let mut inner = self.inner.lock();
        inner.loaded_ids = snapshot.loaded_ids();
        inner.loaded_keys = snapshot.loaded_keys();
        inner.snapshot = snapshot.clone();
        inner.fetched_at = Some(now);
        inner.native_api = Some(true);
        inner.native_checked_at = Some(now);
        snapshot
    }

    // --- capability ---

    /// `None` until the first probe or fetch classifies the server.
    pub fn native_api(&self) -> Option<bool> {
        self.inner.lock().native_api
    }

    pub fn native_unavailable(&self) -> bool {
        self.native_api() == Some(false)
    }

    pub fn set_native_api(&self, available: bool) {
        let mut inner = self.inner.lock();
        inner.native_api = Some(available);
        inner.native_checked_at = Some(Instant::now());
    }

    /// Cached capability if classified within `ttl`.
    pub fn fresh_native_api(&self, ttl: Duration) -> Option<bool> {
        let inner = self.inner.lock();
        match (inner.native_api, inner.native_checked_at) {
            (Some(v), Some(at)) if at.elapsed() < ttl => Some(v),
            _ => None,
        }
    }

    // --- resident set ---

    pub fn is_resident(&self, model: &str) -> bool {
        let inner = self.inner.lock();
        inner.loaded_ids.contains(model) || inner.loaded_keys.contains(&derive_key(model))
    }

    pub fn mark_resident(&self, model: &str) {
        let mut inner = self.inner.lock();
        inner.loaded_ids.insert(model.to_string());
        inner.loaded_keys.insert(derive_key(model));
    }

    pub fn clear_resident(&self, model: &str) {
        let mut inner = self.inner.lock();
        inner.loaded_ids.remove(model);
        inner.loaded_keys.remove(&derive_key(model));
    }

    /// Drop one unloaded instance id, leaving its family key alone.
    pub fn forget_instance(&self, id: &str) {
        let mut inner = self.inner.lock();
        inner.loaded_ids.remove(id);
        inner.loading_ids.remove(id);
    }

    /// Drop every marker for a family that was unloaded.
    pub fn forget_family(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.loaded_ids.retain(|id| derive_key(id) != key);
        inner.loading_ids.retain(|id| derive_key(id) != key);
        inner.loaded_keys.remove(key);
        inner.loading_keys.remove(key);
        inner.cooldowns.remove(key);
    }

    pub fn mark_loading(&self, model: &str) {
        let mut inner = self.inner.lock();
        inner.loading_ids.insert(model.to_string());
        inner.loading_keys.insert(derive_key(model));
    }

    pub fn clear_loading(&self, model: &str) {
        let mut inner = self.inner.lock();
        inner.loading_ids.remove(model);
        inner.loading_keys.remove(&derive_key(model));
    }

    pub fn is_loading(&self, model: &str) -> bool {
        let inner = self.inner.lock();
        inner.loading_ids.contains(model) || inner.loading_keys.contains(&derive_key(model))
    }

    // --- cooldowns ---

    pub fn set_cooldown(&self, key: &str, period: Duration) {
        self.inner.lock().cooldowns.insert(key.to_string(), Instant::now() + period);
    }

    pub fn clear_cooldown(&self, key: &str) {
        self.inner.lock().cooldowns.remove(key);
    }

    pub fn cooldown_active(&self, key: &str) -> bool {
        self.inner.lock().cooldowns.get(key).map_or(false, |until| *until > Instant::now())
    }

    // --- phases ---

    pub fn set_phase(&self, key: &str, phase: LoadPhase) {
        self.inner.lock().phases.insert(key.to_string(), phase);
    }

    pub fn phase(&self, key: &str) -> LoadPhase {
        self.inner.lock().phases.get(key).copied().unwrap_or(LoadPhase::Idle)
    }

    // --- catalog ---

    pub fn fresh_catalog(&self, min_interval: Duration) -> Option<Arc<Vec<CatalogEntry>>> {
        match &self.inner.lock().catalog {
            Some((at, cat)) if at.elapsed() < min_interval => Some(cat.clone()),
            _ => None,
        }
    }

    pub fn store_catalog(&self, catalog: Vec<CatalogEntry>) -> Arc<Vec<CatalogEntry>> {
        let catalog = Arc::new(catalog);
        self.inner.lock().catalog = Some((Instant::now(), catalog.clone()));
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resident_matches_by_family() {
        let st = RuntimeState::new();
        st.mark_resident("m:2");
        assert!(st.is_resident("m"));
        assert!(st.is_resident("m:5"));
        st.forget_family("m");
        assert!(!st.is_resident("m:2"));
    }

    #[tokio::test]
    async fn test_cooldown_expires() {
        let st = RuntimeState::new();
        st.set_cooldown("m", Duration::from_millis(20));
        assert!(st.cooldown_active("m"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!st.cooldown_active("m"));
    }

    #[test]
    fn test_phase_defaults_to_idle() {
        let st = RuntimeState::new();
        assert_eq!(st.phase("x"), LoadPhase::Idle);
        st.set_phase("x", LoadPhase::Waiting);
        assert_eq!(st.phase("x"), LoadPhase::Waiting);
    }
}
