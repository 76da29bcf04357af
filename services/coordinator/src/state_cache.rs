use std::sync::Arc;
use std::time::Duration;

use modelops::{normalize_id, StateSnapshot};
use tracing::{debug, warn};

use crate::error::CoordError;
use crate::provider_lmstudio::LmStudioClient;
use crate::single_flight::SingleFlight;
use crate::state::SharedState;

/// How fresh a refresh must be.
#[derive(Clone, Copy, Debug)]
pub struct Refresh {
    pub force: bool,
    pub min_interval: Duration,
}

impl Refresh {
    pub fn forced() -> Self {
        Self {
            force: true,
            min_interval: Duration::ZERO,
        }
    }

    pub fn within(min_interval: Duration) -> Self {
        Self {
            force: false,
            min_interval,
        }
    }
}

/// TTL-bounded cache of the server's native model states. Concurrent
/// refreshes share one fetch; fetch failures never escape this layer.
#[derive(Clone)]
pub struct StateCache {
    client: LmStudioClient,
    state: SharedState,
    flight: SingleFlight<(), Arc<StateSnapshot>>,
}

impl StateCache {
    pub fn new(client: LmStudioClient, state: SharedState) -> Self {
        Self {
            client,
            state,
            flight: SingleFlight::new(),
        }
    }

    pub async fn refresh(&self, opts: Refresh) -> Arc<StateSnapshot> {
        if let Some(pending) = self.flight.in_flight(&()) {
            return pending.await;
        }
        if !opts.force {
            if let Some(snap) = self.state.fresh_snapshot(opts.min_interval) {
                return snap;
            }
        }
        let this = self.clone();
        self.flight.run((), move || async move { this.fetch().await }).await
    }

    async fn fetch(&self) -> Arc<StateSnapshot> {
        match self.client.native_listing().await {
            Ok(listing) => {
                debug!(models = listing.entries.len(), "state_cache: refreshed");
                self.state.install_snapshot(StateSnapshot::from_entries(listing.entries))
            }
            Err(CoordError::Rejected { status: 404 }) | Err(CoordError::ProtocolMismatch) => {
                debug!("state_cache: native model API not available");
                self.state.set_native_api(false);
                self.state.snapshot()
            }
            Err(e) => {
                warn!("state_cache: fetch failed, keeping previous snapshot: {e}");
                self.state.snapshot()
            }
        }
    }

    /// Fail-open loaded check: without native state every model counts as
    /// loaded. Falls back to the resident-set hint when the listing says
    /// nothing about the model.
    pub async fn is_loaded(&self, model: &str, opts: Refresh) -> bool {
        let model = normalize_id(model);
        if model.is_empty() {
            return false;
        }
        if self.state.native_unavailable() {
            return true;
        }
        let snap = self.refresh(opts).await;
        if self.state.native_unavailable() {
            return true;
        }
        snap.loaded_verdict(&model)
            .unwrap_or_else(|| self.state.is_resident(&model))
    }
}
