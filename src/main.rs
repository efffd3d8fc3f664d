//! Stand-alone queue worker.
//!
//! Reads gateway messages as JSON lines on stdin. Replies and broadcast
//! events are written as JSON lines on stdout; logs go to stderr.
//! `{"type":"CONNECTIVITY","online":bool}` lines feed platform connectivity
//! events to the worker.

use std::sync::Arc;

use anyhow::Context;
use edit_queue::{
    BackgroundWorker, FileStore, HttpProbe, MemoryStore, QueueStore, ReqwestTransport,
    SqliteStore, StoreLocation, WorkerConfig,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = WorkerConfig::from_env().context("reading EDIT_QUEUE_* configuration")?;

    let store: Arc<dyn QueueStore> = match config.store_location() {
        StoreLocation::Sqlite(path) => Arc::new(
            SqliteStore::open(path)
                .with_context(|| format!("opening queue database {}", path.display()))?,
        ),
        StoreLocation::File(path) => {
            info!(path = %path.display(), "using single-file queue store");
            Arc::new(FileStore::new(path))
        }
        StoreLocation::Memory => {
            warn!("no database path configured, queue is not durable");
            Arc::new(MemoryStore::new())
        }
    };

    let client = reqwest::Client::new();
    let probe = Arc::new(HttpProbe::new(
        client.clone(),
        config.probe_url().clone(),
        config.probe_timeout(),
    ));
    let transport = Arc::new(ReqwestTransport::new(client));

    let worker = BackgroundWorker::start(config, store, transport, probe)
        .await
        .context("starting worker")?;
    let gateway = worker.gateway();
    let mut events = worker.subscribe();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let output = tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else { break };
                let Some(message) = parse_line(&line) else { continue };

                if message["type"] == "CONNECTIVITY" {
                    let online = message["online"].as_bool().unwrap_or(false);
                    worker.connectivity_changed(online).await;
                    continue;
                }
                match gateway.request_value(message).await.context("gateway call")? {
                    Some(reply) => json!({ "reply": reply }),
                    None => continue,
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                serde_json::to_value(event).context("encoding event")?
            }
        };

        stdout.write_all(format!("{output}\n").as_bytes()).await?;
        stdout.flush().await?;
    }

    info!("stdin closed, shutting down");
    worker.shutdown().await;
    Ok(())
}

fn parse_line(line: &str) -> Option<Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "skipping input line that is not JSON");
            None
        }
    }
}
