//! Demo worker for drover.
//!
//! Listens on `DROVER_DEMO_PORT` through the supervisor and answers one
//! line-oriented command per line:
//!
//! ```text
//! pid                      -> this worker's PID
//! query <channel>          -> aggregated answers from every worker
//! dispatch <channel> <json> -> broadcast, answers "ok"
//! seen <channel>           -> broadcasts this worker has received
//! ```
//!
//! Provides `demo.value` (`DROVER_DEMO_VALUE`, or slot + 1) and records
//! everything broadcast on `demo.broadcast`.

use anyhow::{Context, Result};
use drover_core::{AddressType, SharedStream, WorkerRuntime};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const PORT_ENV: &str = "DROVER_DEMO_PORT";
const VALUE_ENV: &str = "DROVER_DEMO_VALUE";
const VALUE_CHANNEL: &str = "demo.value";
const BROADCAST_CHANNEL: &str = "demo.broadcast";

type Seen = Arc<Mutex<HashMap<String, Vec<Value>>>>;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let runtime = WorkerRuntime::from_env().context("Not started by a drover supervisor")?;

    let value = match std::env::var(VALUE_ENV) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        Err(_) => json!(runtime.slot() + 1),
    };
    runtime.register_provider(VALUE_CHANNEL, move || value.clone());

    let seen: Seen = Arc::default();
    runtime.register_listener(BROADCAST_CHANNEL, {
        let seen = Arc::clone(&seen);
        move |data: &Value| {
            seen.lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .entry(BROADCAST_CHANNEL.to_string())
                .or_default()
                .push(data.clone());
        }
    });

    let port: u16 = match std::env::var(PORT_ENV) {
        Ok(raw) => raw.parse().with_context(|| format!("{} is not a port", PORT_ENV))?,
        Err(_) => 0,
    };
    let mut listener = runtime.listen("127.0.0.1", port, AddressType::Tcp4).await?;
    info!(
        "Worker {} (slot {}) serving {} ({})",
        runtime.worker_id(),
        runtime.slot(),
        listener.key(),
        if listener.is_round_robin() { "round-robin" } else { "shared" }
    );

    loop {
        tokio::select! {
            _ = runtime.closed() => {
                info!("Supervisor is gone, exiting");
                break;
            }
            conn = listener.accept() => {
                let stream = conn?;
                let runtime = runtime.clone();
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, runtime, seen).await {
                        debug!("Connection ended: {}", e);
                    }
                });
            }
        }
    }
    Ok(())
}

async fn serve(stream: SharedStream, runtime: WorkerRuntime, seen: Seen) -> Result<()> {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let reply = execute(line.trim(), &runtime, &seen).await;
        writer.write_all(format!("{}\n", reply).as_bytes()).await?;
    }
    Ok(())
}

async fn execute(line: &str, runtime: &WorkerRuntime, seen: &Seen) -> Value {
    let mut parts = line.splitn(3, ' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("pid"), None, None) => json!(std::process::id()),
        (Some("query"), Some(channel), None) => json!(runtime.query(channel).await),
        (Some("dispatch"), Some(channel), Some(raw)) => {
            let data = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            match runtime.dispatch(channel, data) {
                Ok(()) => json!("ok"),
                Err(e) => {
                    warn!("Dispatch on {} failed: {}", channel, e);
                    json!({ "error": e.to_string() })
                }
            }
        }
        (Some("seen"), Some(channel), None) => {
            let seen = seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            json!(seen.get(channel).cloned().unwrap_or_default())
        }
        _ => json!({ "error": format!("unknown command: {}", line) }),
    }
}
