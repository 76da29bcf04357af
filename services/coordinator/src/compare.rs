//! Dual-stream compare: one prompt, two models, two independent streams.
//!
//! The two sides never share a cancellation token. A side that ends with
//! nothing to show after a genuine error is retried without streaming.

use std::sync::Arc;

use modelops::derive_key;
use serde::Serialize;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CoordError;
use crate::provider::ChatProvider;
use crate::runtime::ModelRuntime;
use crate::session::StreamSession;
use crate::stream::{ChatRequest, DeltaSink, StreamDelta, StreamingEngine};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompareError {
    #[error("both compare slots need a model")]
    MissingModel,
    #[error("compare needs two different models (both are {0})")]
    SameFamily(String),
}

/// How a side's final buffer came to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SideStatus {
    Streamed,
    Recovered,
    Cancelled,
    Failed,
    NotReady,
}

/// One slot of a compare run.
pub struct CompareSide {
    pub request: ChatRequest,
    pub cancel: CancellationToken,
}

impl CompareSide {
    pub fn new(request: ChatRequest) -> Self {
        Self {
            request,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug)]
pub struct SideOutcome {
    pub session: StreamSession,
    pub status: SideStatus,
    /// Last error seen on this side, if any.
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct CompareOutcome {
    pub a: SideOutcome,
    pub b: SideOutcome,
}

/// Called with the side's session after every applied delta.
pub type SideUpdate<'a> = &'a mut (dyn FnMut(&StreamSession) + Send);

pub struct CompareRunner {
    runtime: ModelRuntime,
    provider: Arc<dyn ChatProvider>,
}

impl CompareRunner {
    pub fn new(runtime: ModelRuntime, provider: Arc<dyn ChatProvider>) -> Self {
        Self { runtime, provider }
    }

    /// Runner streaming through the runtime's own server.
    pub fn with_engine(runtime: ModelRuntime) -> Self {
        let engine = StreamingEngine::new(runtime.client().clone());
        Self::new(runtime, Arc::new(engine))
    }

    pub async fn run(
        &self,
        a: CompareSide,
        b: CompareSide,
        on_a: SideUpdate<'_>,
        on_b: SideUpdate<'_>,
    ) -> Result<CompareOutcome, CompareError> {
        let (model_a, model_b) = (a.request.model.trim(), b.request.model.trim());
        if model_a.is_empty() || model_b.is_empty() {
            return Err(CompareError::MissingModel);
        }
        let key = derive_key(model_a);
        if key == derive_key(model_b) {
            return Err(CompareError::SameFamily(key));
        }
        info!(a=%model_a, b=%model_b, "compare: starting");

        let (ready_a, ready_b) = tokio::join!(
            self.runtime.ensure_ready(model_a),
            self.runtime.ensure_ready(model_b),
        );

        let mut session_a = StreamSession::new(model_a, a.cancel.clone());
        let mut session_b = StreamSession::new(model_b, b.cancel.clone());

        let (res_a, res_b) = tokio::join!(
            self.stream_side(ready_a, &a.request, &mut session_a, on_a),
            self.stream_side(ready_b, &b.request, &mut session_b, on_b),
        );

        let a = self.settle_side(&a.request, session_a, res_a, on_a).await;
        let b = self.settle_side(&b.request, session_b, res_b, on_b).await;
        debug!(a=?a.status, b=?b.status, "compare: done");
        Ok(CompareOutcome { a, b })
    }

    async fn stream_side(
        &self,
        ready: bool,
        request: &ChatRequest,
        session: &mut StreamSession,
        on_update: SideUpdate<'_>,
    ) -> Option<Result<(), CoordError>> {
        if !ready {
            warn!(model=%request.model, "compare: model not ready, skipping side");
            session.content = format!("[error] model failed to load ({})", request.model);
            on_update(session);
            return None;
        }
        let cancel = session.cancel.clone();
        let mut sink = |d: StreamDelta<'_>| {
            session.apply(&d);
            on_update(session);
        };
        Some(self.provider.stream(request, &cancel, &mut sink).await)
    }

    /// `streamed` is `None` for a side that never streamed.
    async fn settle_side(
        &self,
        request: &ChatRequest,
        mut session: StreamSession,
        streamed: Option<Result<(), CoordError>>,
        on_update: SideUpdate<'_>,
    ) -> SideOutcome {
        let Some(result) = streamed else {
            return SideOutcome {
                session,
                status: SideStatus::NotReady,
                error: None,
            };
        };
        let error = result.err();
        let cancelled = session.is_cancelled() || error.as_ref().is_some_and(CoordError::is_cancelled);
        let error_text = error.as_ref().map(ToString::to_string);

        if cancelled {
            return SideOutcome {
                session,
                status: SideStatus::Cancelled,
                error: None,
            };
        }
        if !session.content.trim().is_empty() {
            return SideOutcome {
                session,
                status: SideStatus::Streamed,
                error: error_text,
            };
        }

        if let Some(e) = &error {
            warn!(model=%request.model, "compare: stream failed, retrying without streaming: {e}");
        }
        let (status, error) = match self.recover(request, error).await {
            Ok(text) => {
                session.content = text;
                (SideStatus::Recovered, error_text)
            }
            Err(last) => {
                session.content = match &last {
                    Some(msg) => format!("[error] {msg}"),
                    None => "[error] no response received".to_string(),
                };
                (SideStatus::Failed, last)
            }
        };
        on_update(&session);
        SideOutcome { session, status, error }
    }

    /// Non-streaming retries. An empty reply uses up an attempt; an error
    /// ends the retries unless it is transient.
    async fn recover(&self, request: &ChatRequest, first: Option<CoordError>) -> Result<String, Option<String>> {
        let t = self.runtime.timings();
        let mut last = first.map(|e| e.to_string());
        for attempt in 0..t.fallback_attempts {
            match self.provider.complete_once(request).await {
                Ok(text) if !text.trim().is_empty() => {
                    info!(model=%request.model, attempt, "compare: recovered");
                    return Ok(text);
                }
                Ok(_) => debug!(model=%request.model, attempt, "compare: empty fallback reply"),
                Err(e) => {
                    let retry = e.is_transient() && attempt + 1 < t.fallback_attempts;
                    last = Some(e.to_string());
                    if !retry {
                        break;
                    }
                    sleep(t.fallback_backoff * (attempt + 1)).await;
                }
            }
        }
        Err(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, Timings};
    use crate::error::Result;
    use crate::stream::ChatMessage;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Scripted replies per model: streamed text or a stream error status,
    /// then a queue of fallback results.
    #[derive(Default)]
    struct Scripted {
        streams: HashMap<String, std::result::Result<Vec<&'static str>, u16>>,
        fallbacks: Mutex<HashMap<String, Vec<std::result::Result<&'static str, u16>>>>,
        fallback_calls: Mutex<HashMap<String, usize>>,
    }

    #[async_trait]
    impl ChatProvider for Scripted {
        async fn stream(
            &self,
            request: &ChatRequest,
            cancel: &CancellationToken,
            on_delta: &mut DeltaSink<'_>,
        ) -> Result<()> {
            if cancel.is_cancelled() {
                return Err(CoordError::Cancelled);
            }
            match &self.streams[&request.model] {
                Ok(parts) => {
                    for p in parts {
                        on_delta(StreamDelta { content: p, reasoning: "", choice: &Value::Null });
                    }
                    Ok(())
                }
                Err(status) => Err(CoordError::Rejected { status: *status }),
            }
        }

        async fn complete_once(&self, request: &ChatRequest) -> Result<String> {
            *self.fallback_calls.lock().entry(request.model.clone()).or_default() += 1;
            let mut queues = self.fallbacks.lock();
            let queue = queues.entry(request.model.clone()).or_default();
            if queue.is_empty() {
                return Ok(String::new());
            }
            match queue.remove(0) {
                Ok(text) => Ok(text.to_string()),
                Err(status) => Err(CoordError::Rejected { status }),
            }
        }
    }

    fn runner(provider: Scripted) -> (CompareRunner, Arc<Scripted>) {
        // Unroutable port: the probe fails fast and every model counts as ready.
        let mut cfg = AppConfig::new("http://127.0.0.1:9/v1");
        cfg.request_timeout = Duration::from_millis(200);
        cfg.timings = Timings {
            fallback_backoff: Duration::from_millis(1),
            ..Timings::default()
        };
        let provider = Arc::new(provider);
        (CompareRunner::new(ModelRuntime::new(cfg), provider.clone()), provider)
    }

    fn side(model: &str) -> CompareSide {
        CompareSide::new(ChatRequest::new(model, vec![ChatMessage::user("hi")]))
    }

    fn calls(p: &Scripted, model: &str) -> usize {
        p.fallback_calls.lock().get(model).copied().unwrap_or(0)
    }

    #[tokio::test]
    async fn test_rejects_same_family_and_missing_model() {
        let (r, _) = runner(Scripted::default());
        let (mut na, mut nb) = (|_: &StreamSession| {}, |_: &StreamSession| {});
        let err = r.run(side("m:1"), side("m:2"), &mut na, &mut nb).await.unwrap_err();
        assert_eq!(err, CompareError::SameFamily("m".into()));
        let err = r.run(side(" "), side("m"), &mut na, &mut nb).await.unwrap_err();
        assert_eq!(err, CompareError::MissingModel);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_only_failed_side() {
        let mut p = Scripted::default();
        p.streams.insert("a".into(), Err(500));
        p.streams.insert("b".into(), Ok(vec!["fine"]));
        p.fallbacks.lock().insert("a".into(), vec![Err(503), Ok("late answer")]);
        let (r, p) = runner(p);

        let (sa, sb) = (side("a"), side("b"));
        let cancel_b = sb.cancel.clone();
        let (mut na, mut nb) = (|_: &StreamSession| {}, |_: &StreamSession| {});
        let out = r.run(sa, sb, &mut na, &mut nb).await.unwrap();

        assert_eq!(out.a.status, SideStatus::Recovered);
        assert_eq!(out.a.session.content, "late answer");
        assert_eq!(out.b.status, SideStatus::Streamed);
        assert_eq!(out.b.session.content, "fine");
        assert!(!cancel_b.is_cancelled());
        assert_eq!(calls(&p, "a"), 2);
        assert_eq!(calls(&p, "b"), 0);
    }

    #[tokio::test]
    async fn test_non_transient_fallback_error_stops_retrying() {
        let mut p = Scripted::default();
        p.streams.insert("a".into(), Err(500));
        p.streams.insert("b".into(), Ok(vec!["x"]));
        p.fallbacks.lock().insert("a".into(), vec![Err(400), Ok("never")]);
        let (r, p) = runner(p);

        let (mut na, mut nb) = (|_: &StreamSession| {}, |_: &StreamSession| {});
        let out = r.run(side("a"), side("b"), &mut na, &mut nb).await.unwrap();
        assert_eq!(out.a.status, SideStatus::Failed);
        assert_eq!(out.a.session.content, "[error] HTTP 400");
        assert_eq!(calls(&p, "a"), 1);
    }

    #[tokio::test]
    async fn test_empty_stream_and_empty_fallbacks_leave_placeholder() {
        let mut p = Scripted::default();
        p.streams.insert("a".into(), Ok(vec![]));
        p.streams.insert("b".into(), Ok(vec!["x"]));
        let (r, p) = runner(p);

        let (mut na, mut nb) = (|_: &StreamSession| {}, |_: &StreamSession| {});
        let out = r.run(side("a"), side("b"), &mut na, &mut nb).await.unwrap();
        assert_eq!(out.a.status, SideStatus::Failed);
        assert_eq!(out.a.session.content, "[error] no response received");
        assert_eq!(calls(&p, "a"), 2);
    }

    #[tokio::test]
    async fn test_cancelled_side_stays_empty() {
        let mut p = Scripted::default();
        p.streams.insert("a".into(), Ok(vec!["unused"]));
        p.streams.insert("b".into(), Ok(vec!["b ", "done"]));
        let (r, p) = runner(p);

        let (sa, sb) = (side("a"), side("b"));
        sa.cancel.cancel();
        let cancel_b = sb.cancel.clone();
        let mut updates_b = 0;
        let mut na = |_: &StreamSession| {};
        let mut nb = |_: &StreamSession| updates_b += 1;
        let out = r.run(sa, sb, &mut na, &mut nb).await.unwrap();

        assert_eq!(out.a.status, SideStatus::Cancelled);
        assert!(out.a.session.content.is_empty());
        assert_eq!(out.b.session.content, "b done");
        assert!(!cancel_b.is_cancelled());
        assert_eq!(calls(&p, "a"), 0);
        assert_eq!(updates_b, 2);
    }
}
