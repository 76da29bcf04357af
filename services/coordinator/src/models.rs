use std::sync::Arc;

use modelops::{build_catalog, CatalogEntry};
use tracing::{debug, warn};

use crate::runtime::ModelRuntime;
use crate::state_cache::Refresh;

impl ModelRuntime {
    /// Selectable chat models with their load state. Throttled: calls
    /// inside the catalog interval get the previous listing back.
    pub async fn fetch_catalog(&self) -> Arc<Vec<CatalogEntry>> {
        if let Some(cached) = self.state().fresh_catalog(self.timings().catalog_min_interval) {
            return cached;
        }
        let ids = match self.client().list_models().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("models: listing failed: {e}");
                Vec::new()
            }
        };
        let snapshot = self.cache().refresh(Refresh::forced()).await;
        let catalog = build_catalog(ids, &snapshot);
        debug!(models = catalog.len(), "models: catalog refreshed");
        self.state().store_catalog(catalog)
    }
}
