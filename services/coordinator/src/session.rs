use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::stream::StreamDelta;

const MAX_LOGPROBS: usize = 120;
const MAX_ALTERNATIVES: usize = 3;

/// Per-token log probability as shown next to a reply.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LogprobEntry {
    pub token: String,
    pub logprob: Option<f64>,
    /// Up to three `tok (-0.12)` candidates, comma separated.
    pub alternatives: String,
}

fn escape_newlines(s: &str) -> String {
    s.replace('\n', "\\n")
}

/// Entries of `choice.logprobs.content`, skipping empty tokens.
pub fn extract_logprobs(choice: &Value) -> Vec<LogprobEntry> {
    let Some(entries) = choice["logprobs"]["content"].as_array() else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let token = escape_newlines(entry["token"].as_str().unwrap_or(""));
            if token.is_empty() {
                return None;
            }
            let alternatives = entry["top_logprobs"]
                .as_array()
                .map(|alts| {
                    alts.iter()
                        .take(MAX_ALTERNATIVES)
                        .map(|alt| {
                            let tok = escape_newlines(alt["token"].as_str().unwrap_or(""));
                            let lp = alt["logprob"].as_f64().unwrap_or(f64::NAN);
                            format!("{tok} ({lp:.2})")
                        })
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default();
            Some(LogprobEntry {
                token,
                logprob: entry["logprob"].as_f64().filter(|v| v.is_finite()),
                alternatives,
            })
        })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub total_tokens: u64,
    pub elapsed_ms: u64,
    pub tokens_per_second: f64,
    pub time_to_first_token_ms: u64,
}

/// Token throughput of one stream. A "token" is one delta that carried
/// content or reasoning text.
#[derive(Clone, Debug)]
pub struct StreamMetrics {
    started: Instant,
    token_count: u64,
    first_token_at: Option<Instant>,
    last_token_at: Option<Instant>,
}

impl StreamMetrics {
    pub fn start_at(started: Instant) -> Self {
        Self {
            started,
            token_count: 0,
            first_token_at: None,
            last_token_at: None,
        }
    }

    pub fn record_at(&mut self, now: Instant) {
        self.token_count += 1;
        self.first_token_at.get_or_insert(now);
        self.last_token_at = Some(now);
    }

    pub fn token_count(&self) -> u64 {
        self.token_count
    }

    /// Tokens per second since the stream started, as of `now`.
    pub fn live_rate(&self, now: Instant) -> f64 {
        rate(self.token_count, now.saturating_duration_since(self.started))
    }

    /// Elapsed time runs from start to the last token.
    pub fn summary(&self) -> MetricsSummary {
        let since = |at: Option<Instant>| {
            at.map(|t| t.saturating_duration_since(self.started))
                .unwrap_or_default()
        };
        let elapsed = since(self.last_token_at);
        MetricsSummary {
            total_tokens: self.token_count,
            elapsed_ms: elapsed.as_millis() as u64,
            tokens_per_second: (rate(self.token_count, elapsed) * 10.0).round() / 10.0,
            time_to_first_token_ms: since(self.first_token_at).as_millis() as u64,
        }
    }
}

fn rate(tokens: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        tokens as f64 / secs
    } else {
        0.0
    }
}

/// Everything one completion accumulates while it streams.
#[derive(Debug)]
pub struct StreamSession {
    pub id: Uuid,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    pub content: String,
    pub reasoning: String,
    pub logprobs: VecDeque<LogprobEntry>,
    pub metrics: StreamMetrics,
}

impl StreamSession {
    pub fn new(model: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            model: model.into(),
            started_at: Utc::now(),
            cancel,
            content: String::new(),
            reasoning: String::new(),
            logprobs: VecDeque::new(),
            metrics: StreamMetrics::start_at(Instant::now()),
        }
    }

    pub fn apply(&mut self, delta: &StreamDelta<'_>) {
        self.apply_at(delta, Instant::now());
    }

    pub fn apply_at(&mut self, delta: &StreamDelta<'_>, now: Instant) {
        if !delta.reasoning.is_empty() {
            self.reasoning.push_str(delta.reasoning);
            self.metrics.record_at(now);
        }
        if !delta.content.is_empty() {
            self.content.push_str(delta.content);
            self.metrics.record_at(now);
        }
        for entry in extract_logprobs(delta.choice) {
            if self.logprobs.len() == MAX_LOGPROBS {
                self.logprobs.pop_front();
            }
            self.logprobs.push_back(entry);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
