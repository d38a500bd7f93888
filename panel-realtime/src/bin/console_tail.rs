//! console-tail - stream the consoles of some servers to the log
//!
//! PANEL_TOKEN=... PANEL_SERVERS=srv-1,srv-2 console-tail

use std::rc::Rc;

use anyhow::Context;
use panel_realtime::{
    AllocationTable, Collaborators, EventKind, RealtimeClient, RealtimeConfig, StaticCredential,
    TopicChange,
};
use tokio::sync::broadcast;
use tokio::task::LocalSet;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "console_tail=info,panel_realtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RealtimeConfig::from_env()?;
    let token = std::env::var("PANEL_TOKEN").context("PANEL_TOKEN must be set")?;
    let servers: Vec<String> = std::env::var("PANEL_SERVERS")
        .context("PANEL_SERVERS must be set")?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect();
    if servers.is_empty() {
        anyhow::bail!("PANEL_SERVERS lists no servers");
    }

    info!(ws_url = %config.ws_url, servers = servers.len(), "console-tail starting");

    LocalSet::new().run_until(run(config, token, servers)).await
}

async fn run(config: RealtimeConfig, token: String, servers: Vec<String>) -> anyhow::Result<()> {
    let auth = Rc::new(StaticCredential::new(token));
    let metadata = Rc::new(AllocationTable::new());
    let collaborators = Collaborators::panel(&config, auth, metadata);
    let client = RealtimeClient::new(config, collaborators);

    let _handler = client.on_event(|event| {
        match &event.kind {
            EventKind::ConsoleLine { stream, text } => {
                info!(server = %event.server_id, %stream, "{text}");
            }
            EventKind::StateChange { state, reason } => {
                info!(server = %event.server_id, ?state, reason = reason.as_deref().unwrap_or(""), "state changed");
            }
            EventKind::ResourceSample(sample) => {
                info!(
                    server = %event.server_id,
                    cpu = sample.cpu_percent,
                    memory_mb = sample.memory_usage_mb,
                    "resources"
                );
            }
            EventKind::OperationResult(result) => {
                info!(server = %event.server_id, operation = %result.operation, success = result.success, "operation finished");
            }
        }
        Ok(())
    });

    let _topics: Vec<_> = servers.iter().map(|server| client.watch(server)).collect();
    client.connect()?;

    let mut connectivity = client.connectivity();
    let mut changes = client.changes();
    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(TopicChange::HistoryLoaded { server_id }) => {
                    let Some(snapshot) = client.console(&server_id) else {
                        continue;
                    };
                    for entry in snapshot.entries.iter().filter(|entry| entry.seq.is_none()) {
                        info!(server = %server_id, stream = %entry.stream, history = true, "{}", entry.text);
                    }
                }
                Ok(TopicChange::HistoryUnavailable { server_id, reason }) => {
                    tracing::warn!(server = %server_id, %reason, "console history unavailable");
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "change stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = connectivity.changed() => {
                if changed.is_err() {
                    break;
                }
                let connected = *connectivity.borrow_and_update();
                info!(connected, "connectivity changed");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    client.disconnect();
    Ok(())
}
