use std::time::Duration;

use anyhow::{bail, Context, Result};

const DEFAULT_BASE_URL: &str = "http://localhost:1234/v1";

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// OpenAI-compatible base, e.g. `http://localhost:1234/v1`.
    pub base_url: String,
    pub api_key: Option<String>,
    /// Unload the previous model family when the selection changes.
    pub auto_unload: bool,
    pub request_timeout: Duration,
    pub timings: Timings,
}

/// Every TTL, cooldown and polling bound the coordinator uses.
#[derive(Clone, Debug)]
pub struct Timings {
    pub state_min_interval: Duration,
    pub probe_ttl: Duration,
    pub poll_interval: Duration,
    /// Wait after an accepted load request.
    pub ready_wait: Duration,
    /// Wait when the server already reports the model as loading.
    pub loading_wait: Duration,
    /// Recovery wait after HTTP 400/409/423 (server mid-transition).
    pub recover_transition_wait: Duration,
    pub recover_short_wait: Duration,
    pub load_cooldown: Duration,
    pub settle_cooldown: Duration,
    pub catalog_min_interval: Duration,
    pub fallback_attempts: u32,
    pub fallback_backoff: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            state_min_interval: Duration::from_millis(1800),
            probe_ttl: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
            ready_wait: Duration::from_secs(45),
            loading_wait: Duration::from_secs(120),
            recover_transition_wait: Duration::from_secs(120),
            recover_short_wait: Duration::from_secs(15),
            load_cooldown: Duration::from_secs(20),
            settle_cooldown: Duration::from_secs(6),
            catalog_min_interval: Duration::from_secs(3),
            fallback_attempts: 2,
            fallback_backoff: Duration::from_millis(450),
        }
    }
}

impl AppConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            auto_unload: false,
            request_timeout: Duration::from_secs(10),
            timings: Timings::default(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("LMCOORD_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let api_key = std::env::var("LMCOORD_API_KEY").ok().filter(|k| !k.trim().is_empty());
        let auto_unload = std::env::var("LMCOORD_AUTO_UNLOAD")
            .ok()
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
            .unwrap_or(false);
        let request_timeout = match std::env::var("LMCOORD_REQUEST_TIMEOUT_SECS") {
            Ok(v) => Duration::from_secs(
                v.parse()
                    .with_context(|| format!("LMCOORD_REQUEST_TIMEOUT_SECS is not a number: {v}"))?,
            ),
            Err(_) => Duration::from_secs(10),
        };

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            bail!("LMCOORD_BASE_URL must start with http:// or https://");
        }

        Ok(Self {
            api_key,
            auto_unload,
            request_timeout,
            ..Self::new(base_url)
        })
    }

    /// `scheme://host[:port]` of the base URL; the native API hangs off it.
    pub fn lm_root(&self) -> Option<String> {
        let url = reqwest::Url::parse(&self.base_url).ok()?;
        let host = url.host_str()?;
        Some(match url.port() {
            Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
            None => format!("{}://{}", url.scheme(), host),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lm_root_drops_path() {
        let cfg = AppConfig::new("http://localhost:1234/v1/");
        assert_eq!(cfg.base_url, "http://localhost:1234/v1");
        assert_eq!(cfg.lm_root().as_deref(), Some("http://localhost:1234"));

        let cfg = AppConfig::new("https://lm.example.org/api/v1");
        assert_eq!(cfg.lm_root().as_deref(), Some("https://lm.example.org"));

        assert_eq!(AppConfig::new("not a url").lm_root(), None);
    }
}
