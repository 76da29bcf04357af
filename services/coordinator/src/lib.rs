//! Model-lifecycle coordinator for an LM Studio-style inference server.
//!
//! [`ModelRuntime`] decides when a model must be loaded, waits for it and
//! cleans up duplicate instances; [`StreamingEngine`] turns the streamed
//! chat-completion body into deltas; [`CompareRunner`] drives two of those
//! side by side.

pub mod compare;
pub mod config;
pub mod error;
mod models;
pub mod probe;
pub mod provider;
pub mod provider_lmstudio;
pub mod runtime;
pub mod session;
pub mod single_flight;
pub mod state;
pub mod state_cache;
pub mod stream;

pub use compare::{CompareError, CompareOutcome, CompareRunner, CompareSide, SideOutcome, SideStatus};
pub use config::{AppConfig, Timings};
pub use error::{CoordError, Result};
pub use provider::ChatProvider;
pub use provider_lmstudio::LmStudioClient;
pub use runtime::ModelRuntime;
pub use session::{LogprobEntry, MetricsSummary, StreamMetrics, StreamSession};
pub use state::LoadPhase;
pub use stream::{ChatMessage, ChatRequest, StreamDelta, StreamingEngine};
