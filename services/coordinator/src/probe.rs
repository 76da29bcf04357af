use std::time::Duration;

use tracing::debug;

use crate::provider_lmstudio::LmStudioClient;
use crate::single_flight::SingleFlight;
use crate::state::SharedState;

/// Classifies whether the server exposes native load state at all.
///
/// Any failure to get a listing with `state`/`loaded` fields (404, other
/// statuses, transport errors, undecodable bodies, a bare OpenAI listing)
/// counts as "unavailable" until the TTL lapses.
#[derive(Clone)]
pub struct CapabilityProbe {
    client: LmStudioClient,
    state: SharedState,
    flight: SingleFlight<(), bool>,
}

impl CapabilityProbe {
    pub fn new(client: LmStudioClient, state: SharedState) -> Self {
        Self {
            client,
            state,
            flight: SingleFlight::new(),
        }
    }

    pub async fn probe(&self, force: bool, ttl: Duration) -> bool {
        if !force {
            if let Some(cached) = self.state.fresh_native_api(ttl) {
                return cached;
            }
        }
        let this = self.clone();
        self.flight.run((), move || async move { this.classify().await }).await
    }

    async fn classify(&self) -> bool {
        let available = match self.client.native_listing().await {
            Ok(_) => true,
            Err(e) => {
                debug!("probe: native model API unavailable: {e}");
                false
            }
        };
        self.state.set_native_api(available);
        available
    }
}
