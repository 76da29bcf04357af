#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coordinator::{AppConfig, Timings};
use parking_lot::Mutex;
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Millisecond-scale bounds so wait and cooldown paths finish quickly.
pub fn fast_timings() -> Timings {
    Timings {
        state_min_interval: Duration::from_millis(20),
        probe_ttl: Duration::from_millis(500),
        poll_interval: Duration::from_millis(10),
        ready_wait: Duration::from_millis(300),
        loading_wait: Duration::from_millis(300),
        recover_transition_wait: Duration::from_millis(150),
        recover_short_wait: Duration::from_millis(50),
        load_cooldown: Duration::from_secs(5),
        settle_cooldown: Duration::from_millis(100),
        catalog_min_interval: Duration::from_millis(200),
        fallback_attempts: 2,
        fallback_backoff: Duration::from_millis(5),
    }
}

pub fn config_for(server: &MockServer) -> AppConfig {
    let mut cfg = AppConfig::new(format!("{}/v1", server.uri()));
    cfg.request_timeout = Duration::from_secs(2);
    cfg.timings = fast_timings();
    cfg
}

fn requested_model(req: &Request) -> String {
    serde_json::from_slice::<Value>(&req.body)
        .ok()
        .and_then(|v| v["model"].as_str().map(str::to_string))
        .unwrap_or_default()
}

/// LM Studio stand-in whose native listing reflects load/unload calls.
pub struct FakeLmStudio {
    pub server: MockServer,
    models: Arc<Mutex<BTreeMap<String, String>>>,
    loads: Arc<Mutex<Vec<String>>>,
    unloads: Arc<Mutex<Vec<String>>>,
    load_status: Arc<AtomicU16>,
}

impl FakeLmStudio {
    pub async fn start(models: &[(&str, &str)]) -> Self {
        let fake = Self {
            server: MockServer::start().await,
            models: Arc::new(Mutex::new(
                models.iter().map(|(id, st)| (id.to_string(), st.to_string())).collect(),
            )),
            loads: Arc::default(),
            unloads: Arc::default(),
            load_status: Arc::new(AtomicU16::new(200)),
        };

        let models = fake.models.clone();
        Mock::given(method("GET"))
            .and(path("/api/v1/models"))
            .respond_with(move |_: &Request| {
                let data: Vec<Value> = models
                    .lock()
                    .iter()
                    .map(|(id, st)| json!({ "id": id, "state": st, "quantization": {"name": "Q4_K_M"} }))
                    .collect();
                ResponseTemplate::new(200).set_body_json(json!({ "data": data }))
            })
            .mount(&fake.server)
            .await;

        let models = fake.models.clone();
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(move |_: &Request| {
                let data: Vec<Value> = models.lock().keys().map(|id| json!({ "id": id })).collect();
                ResponseTemplate::new(200).set_body_json(json!({ "object": "list", "data": data }))
            })
            .mount(&fake.server)
            .await;

        let (models, loads, status) = (fake.models.clone(), fake.loads.clone(), fake.load_status.clone());
        Mock::given(method("POST"))
            .and(path("/api/v1/models/load"))
            .respond_with(move |req: &Request| {
                let model = requested_model(req);
                loads.lock().push(model.clone());
                let code = status.load(Ordering::SeqCst);
                if code == 200 {
                    models.lock().insert(model, "loaded".into());
                }
                ResponseTemplate::new(code).set_delay(Duration::from_millis(30))
            })
            .mount(&fake.server)
            .await;

        let (models, unloads) = (fake.models.clone(), fake.unloads.clone());
        Mock::given(method("POST"))
            .and(path("/api/v1/models/unload"))
            .respond_with(move |req: &Request| {
                let model = requested_model(req);
                unloads.lock().push(model.clone());
                models.lock().insert(model, "not-loaded".into());
                ResponseTemplate::new(200)
            })
            .mount(&fake.server)
            .await;

        fake
    }

    pub fn config(&self) -> AppConfig {
        config_for(&self.server)
    }

    pub fn set_state(&self, id: &str, state: &str) {
        self.models.lock().insert(id.to_string(), state.to_string());
    }

    pub fn state_of(&self, id: &str) -> Option<String> {
        self.models.lock().get(id).cloned()
    }

    pub fn fail_loads_with(&self, status: u16) {
        self.load_status.store(status, Ordering::SeqCst);
    }

    pub fn loads(&self) -> Vec<String> {
        self.loads.lock().clone()
    }

    pub fn unloads(&self) -> Vec<String> {
        self.unloads.lock().clone()
    }
}

/// How many native listing GETs the server has seen.
pub async fn native_listing_hits(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == "/api/v1/models")
        .count()
}

/// Event-stream body with one content delta per part.
pub fn sse_body(parts: &[&str]) -> String {
    let mut body = String::new();
    for p in parts {
        body.push_str(&format!("data: {}\n\n", json!({"choices": [{"delta": {"content": p}}]})));
    }
    body.push_str("data: [DONE]\n\n");
    body
}
