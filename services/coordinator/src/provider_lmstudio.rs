use std::time::Duration;

use modelops::NativeListing;
use reqwest::RequestBuilder;
use serde_json::Value;

use crate::config::AppConfig;
use crate::error::{CoordError, Result};

/// HTTP surface of an LM Studio-style server: the OpenAI-compatible routes
/// under `base_url` and the native model API under the host root.
#[derive(Clone, Debug)]
pub struct LmStudioClient {
    base_url: String,
    lm_root: String,
    api_key: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl LmStudioClient {
    pub fn new(cfg: &AppConfig) -> Self {
        let base_url = cfg.base_url.trim_end_matches('/').to_string();
        Self {
            lm_root: cfg.lm_root().unwrap_or_else(|| base_url.clone()),
            base_url,
            api_key: cfg.api_key.clone(),
            timeout: cfg.request_timeout,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authed(&self, rb: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => rb.bearer_auth(key),
            None => rb,
        }
    }

    async fn send(&self, rb: RequestBuilder) -> Result<reqwest::Response> {
        let resp = self.authed(rb).send().await?;
        if !resp.status().is_success() {
            return Err(CoordError::Rejected { status: resp.status().as_u16() });
        }
        Ok(resp)
    }

    /// `GET {lmRoot}/api/v1/models`. A listing where no entry carries
    /// `state` or `loaded` is reported as `ProtocolMismatch`.
    pub async fn native_listing(&self) -> Result<NativeListing> {
        let url = format!("{}/api/v1/models", self.lm_root);
        let resp = self.send(self.client.get(url).timeout(self.timeout)).await?;
        let body: Value = serde_json::from_slice(&resp.bytes().await?)?;
        let listing = modelops::parse_native_listing(&body);
        if !listing.has_native_fields {
            return Err(CoordError::ProtocolMismatch);
        }
        Ok(listing)
    }

    /// `GET {base}/models`: ids of the OpenAI-compatible listing.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/models", self.base_url);
        let resp = self.send(self.client.get(url).timeout(self.timeout)).await?;
        let body: Value = serde_json::from_slice(&resp.bytes().await?)?;
        Ok(body["data"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// 2xx means the server accepted the request, not that loading finished.
    pub async fn load_model(&self, model: &str) -> Result<()> {
        let url = format!("{}/api/v1/models/load", self.lm_root);
        let body = serde_json::json!({ "model": model });
        self.send(self.client.post(url).json(&body).timeout(self.timeout)).await?;
        Ok(())
    }

    pub async fn unload_model(&self, model: &str) -> Result<()> {
        let url = format!("{}/api/v1/models/unload", self.lm_root);
        let body = serde_json::json!({ "model": model });
        self.send(self.client.post(url).json(&body).timeout(self.timeout)).await?;
        Ok(())
    }

    /// `POST {base}/chat/completions`. No request timeout: streams are
    /// bounded by their cancellation token instead.
    pub async fn chat_completions(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        self.send(self.client.post(url).json(body)).await
    }
}
