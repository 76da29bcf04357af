//! Load/unload orchestration.
//!
//! Reconciles "use model X now" with what the server reports. Every public
//! operation degrades to a boolean; network trouble never escapes.
//!
//! Per model key the flow is
//! `Idle -> Checking -> (AlreadyLoaded | Waiting | Requesting -> Waiting) -> Ready | Failed`.
//! At most one load per key is in flight; a second caller attaches to it.

use std::sync::Arc;
use std::time::Duration;

use modelops::{derive_key, keep_order, normalize_id, ModelId, ModelKey, ModelStateInfo};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::{AppConfig, Timings};
use crate::error::{CoordError, Result};
use crate::probe::CapabilityProbe;
use crate::provider_lmstudio::LmStudioClient;
use crate::single_flight::SingleFlight;
use crate::state::{LoadPhase, RuntimeState, SharedState};
use crate::state_cache::{Refresh, StateCache};

/// Coordinator context. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ModelRuntime {
    cfg: Arc<AppConfig>,
    client: LmStudioClient,
    state: SharedState,
    cache: StateCache,
    probe: CapabilityProbe,
    loads: SingleFlight<ModelKey, bool>,
}

impl ModelRuntime {
    pub fn new(cfg: AppConfig) -> Self {
        let client = LmStudioClient::new(&cfg);
        let state = RuntimeState::new();
        Self {
            cache: StateCache::new(client.clone(), state.clone()),
            probe: CapabilityProbe::new(client.clone(), state.clone()),
            loads: SingleFlight::new(),
            cfg: Arc::new(cfg),
            client,
            state,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.cfg
    }

    pub fn timings(&self) -> &Timings {
        &self.cfg.timings
    }

    pub fn client(&self) -> &LmStudioClient {
        &self.client
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn cache(&self) -> &StateCache {
        &self.cache
    }

    /// Capability probe with the configured TTL.
    pub async fn native_api_available(&self) -> bool {
        self.probe.probe(false, self.timings().probe_ttl).await
    }

    pub fn load_phase(&self, model: &str) -> LoadPhase {
        self.state.phase(&derive_key(model))
    }

    /// True while a load request for the model's family is outstanding.
    pub fn is_loading(&self, model: &str) -> bool {
        self.loads.is_running(&derive_key(model)) || self.state.is_loading(&normalize_id(model))
    }

    pub async fn is_loaded(&self, model: &str) -> bool {
        self.cache
            .is_loaded(model, Refresh::within(self.timings().state_min_interval))
            .await
    }

    /// Make `model` usable before a completion is sent.
    pub async fn ensure_ready(&self, model: &str) -> bool {
        let model = normalize_id(model);
        if model.is_empty() {
            return false;
        }
        if self.state.is_resident(&model) {
            return true;
        }
        if let Some(pending) = self.loads.in_flight(&derive_key(&model)) {
            if pending.await {
                return true;
            }
        }
        if !self.native_api_available().await {
            return true;
        }
        if self.is_loaded(&model).await {
            return true;
        }
        if self.load(&model, true).await {
            return true;
        }
        // The load may have raced with one started elsewhere.
        self.is_loaded(&model).await
    }

    /// Load `model`, deduplicated per model key. Without `force`, an active
    /// cooldown on the key turns the call into a no-op returning false.
    pub async fn load(&self, model: &str, force: bool) -> bool {
        let model = normalize_id(model);
        if model.is_empty() {
            return false;
        }
        if !self.native_api_available().await {
            return true;
        }
        if self.state.is_resident(&model) {
            return true;
        }
        let key = derive_key(&model);
        let this = self.clone();
        self.loads.run(key, move || this.load_task(model, force)).await
    }

    async fn load_task(self, model: ModelId, force: bool) -> bool {
        let key = derive_key(&model);
        let t = self.cfg.timings.clone();
        self.state.set_phase(&key, LoadPhase::Checking);

        let snap = self.cache.refresh(Refresh::forced()).await;
        if self.state.native_unavailable() {
            self.state.set_phase(&key, LoadPhase::Ready);
            return true;
        }

        if snap.family_matches(&model, ModelStateInfo::is_loaded) {
            debug!(model=%model, "load: already loaded");
            self.state.set_phase(&key, LoadPhase::AlreadyLoaded);
            self.state.mark_resident(&model);
            self.reconcile_duplicates(&key).await;
            self.state.set_phase(&key, LoadPhase::Ready);
            return true;
        }

        if snap.family_matches(&model, ModelStateInfo::is_loading) {
            info!(model=%model, "load: already loading on server, waiting");
            self.state.set_phase(&key, LoadPhase::Waiting);
            let ready = self.wait_for_loaded(&model, t.loading_wait, t.poll_interval).await;
            if ready {
                self.state.mark_resident(&model);
                self.reconcile_duplicates(&key).await;
            }
            self.settle(&key, ready);
            return ready;
        }

        if !force && self.state.cooldown_active(&key) {
            debug!(model=%model, "load: cooldown active, skipping");
            self.state.set_phase(&key, LoadPhase::Idle);
            return false;
        }

        self.state.mark_loading(&model);
        self.state.set_cooldown(&key, t.load_cooldown);
        self.state.set_phase(&key, LoadPhase::Requesting);
        info!(model=%model, "load: requesting");

        let ready = match self.request_load(&model, &t).await {
            Ok(()) => {
                self.state.mark_resident(&model);
                self.reconcile_duplicates(&key).await;
                true
            }
            Err(e) => {
                // 400/409/423 usually mean the server is mid-transition.
                let recover = match e.status() {
                    Some(400 | 409 | 423) => t.recover_transition_wait,
                    _ => t.recover_short_wait,
                };
                warn!(model=%model, "load: {e}; polling {recover:?} for recovery");
                if self.wait_for_loaded(&model, recover, t.poll_interval).await {
                    self.state.mark_resident(&model);
                    true
                } else {
                    self.state.clear_cooldown(&key);
                    self.state.clear_resident(&model);
                    false
                }
            }
        };

        self.state.clear_loading(&model);
        self.settle(&key, ready);
        ready
    }

    async fn request_load(&self, model: &str, t: &Timings) -> Result<()> {
        self.client.load_model(model).await?;
        self.state.set_phase(&derive_key(model), LoadPhase::Waiting);
        if self.wait_for_loaded(model, t.ready_wait, t.poll_interval).await {
            Ok(())
        } else {
            Err(CoordError::LoadTimeout(t.ready_wait))
        }
    }

    fn settle(&self, key: &str, ready: bool) {
        if ready {
            info!(key=%key, "load: ready");
            self.state.set_phase(key, LoadPhase::Ready);
        } else {
            warn!(key=%key, "load: failed");
            self.state.set_phase(key, LoadPhase::Failed);
        }
    }

    /// Poll until the model is observed loaded or `timeout` lapses, then
    /// make one last authoritative check.
    pub async fn wait_for_loaded(&self, model: &str, timeout: Duration, interval: Duration) -> bool {
        let model = normalize_id(model);
        if model.is_empty() {
            return false;
        }
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.state.native_unavailable() {
                return true;
            }
            if self.cache.is_loaded(&model, Refresh::forced()).await {
                return true;
            }
            sleep(interval).await;
        }
        self.cache.is_loaded(&model, Refresh::forced()).await
    }

    /// Keep exactly one loaded instance of a family: the bare key if it is
    /// loaded, else the lexicographically first id.
    pub async fn reconcile_duplicates(&self, key: &str) {
        let key = key.trim();
        if key.is_empty() || !self.native_api_available().await {
            return;
        }
        let snap = self.cache.refresh(Refresh::forced()).await;
        let mut ids = snap.loaded_in_family(key);
        if ids.len() <= 1 {
            return;
        }
        keep_order(key, &mut ids);
        let keep = ids.remove(0);
        info!(key=%key, keep=%keep, extra=ids.len(), "load: unloading duplicate instances");

        for id in &ids {
            if self.unload_instance(id).await {
                self.state.forget_instance(id);
            }
        }
        self.cache.refresh(Refresh::forced()).await;
        self.state.set_cooldown(key, self.timings().settle_cooldown);
        self.state.mark_resident(&keep);
    }

    /// True only when the server acknowledged the unload.
    pub async fn unload_instance(&self, id: &str) -> bool {
        let id = normalize_id(id);
        if id.is_empty() || !self.native_api_available().await {
            return false;
        }
        match self.client.unload_model(&id).await {
            Ok(()) => {
                info!(model=%id, "unload: done");
                true
            }
            Err(e) => {
                warn!(model=%id, "unload: {e}");
                false
            }
        }
    }

    /// Auto-unload policy on selection change. Does nothing unless enabled,
    /// when `prev` and `next` share a family, or when `prev`'s family is in
    /// `keep`. Returns how many instances the server unloaded.
    pub async fn maybe_unload_previous(&self, prev: &str, next: &str, keep: &[&str]) -> usize {
        let prev = normalize_id(prev);
        let prev_key = derive_key(&prev);
        if !self.cfg.auto_unload || prev.is_empty() || prev_key == derive_key(next) {
            return 0;
        }
        if keep.iter().any(|m| derive_key(m) == prev_key) {
            return 0;
        }
        if !self.native_api_available().await {
            return 0;
        }

        let min_interval = self.timings().state_min_interval;
        let snap = self.cache.refresh(Refresh::within(min_interval)).await;
        let targets = snap.loaded_in_family(&prev_key);
        if targets.is_empty() {
            return 0;
        }

        let mut unloaded = 0;
        for id in &targets {
            if self.unload_instance(id).await {
                self.state.forget_instance(id);
                unloaded += 1;
            }
        }
        self.cache.refresh(Refresh::within(min_interval)).await;
        self.state.forget_family(&prev_key);
        unloaded
    }

    /// Selection change: release the previous family, then load the next.
    pub async fn switch_model(&self, prev: &str, next: &str, keep: &[&str]) -> bool {
        self.maybe_unload_previous(prev, next, keep).await;
        self.load(next, false).await
    }
}
