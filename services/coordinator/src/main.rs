use std::io::Write;

use anyhow::{bail, Context, Result};
use coordinator::{AppConfig, ChatMessage, ChatRequest, CoordError, ModelRuntime, StreamDelta, StreamSession, StreamingEngine};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = AppConfig::from_env()?;
    info!(base_url=%cfg.base_url, auto_unload=cfg.auto_unload, "coordinator: starting");
    let runtime = ModelRuntime::new(cfg);

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        let catalog = runtime.fetch_catalog().await;
        if catalog.is_empty() {
            println!("no models available at {}", runtime.client().base_url());
        }
        for entry in catalog.iter() {
            println!("{}", entry.display_label());
        }
        return Ok(());
    }
    if args.len() < 2 {
        bail!("usage: coordinator [<model> <prompt>...]");
    }

    let model = args[0].clone();
    let prompt = args[1..].join(" ");
    if !runtime.ensure_ready(&model).await {
        bail!("model {model} did not become ready");
    }

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let engine = StreamingEngine::new(runtime.client().clone());
    let request = ChatRequest::new(model.clone(), vec![ChatMessage::user(prompt)]);
    let mut session = StreamSession::new(model, cancel.clone());
    let mut stdout = std::io::stdout();
    let mut on_delta = |d: StreamDelta<'_>| {
        session.apply(&d);
        if !d.content.is_empty() {
            let _ = write!(stdout, "{}", d.content);
            let _ = stdout.flush();
        }
    };

    match engine.stream(&request, &cancel, &mut on_delta).await {
        Ok(()) => {
            println!();
            let summary = session.metrics.summary();
            info!(
                session=%session.id,
                tokens = summary.total_tokens,
                tokens_per_second = summary.tokens_per_second,
                ttft_ms = summary.time_to_first_token_ms,
                "coordinator: stream finished"
            );
        }
        Err(CoordError::Cancelled) => {
            println!();
            info!(session=%session.id, "coordinator: stream cancelled");
        }
        Err(e) => return Err(e).context("streaming completion failed"),
    }
    Ok(())
}
