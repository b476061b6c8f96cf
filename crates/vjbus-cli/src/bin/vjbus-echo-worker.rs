//! Reference worker: echoes commands back and publishes a `tick` stream.
//!
//! Verbs:
//! - `echo`: replies with the command data
//! - `set_config`: stores the data as state under `config_version` (taken
//!   from the command, or from `data.config_version`)
//! - `sleep {ms}`: replies after `ms` milliseconds

use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use vjbus::config::worker_name_from_env;
use vjbus::{BusConfig, Command, CommandError, CommandReply, WorkerNode, handler_fn};

const TICK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Deserialize)]
struct Sleep {
    ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vjbus::logging::init_tracing();

    let name = worker_name_from_env().unwrap_or_else(|| "echo".to_string());
    let bus = BusConfig::from_env().context("invalid environment")?;
    let registry = bus.registry()?;
    let mut node = WorkerNode::new(name.clone(), bus, registry)?;

    node.command(
        "echo",
        handler_fn(|cmd: Command| async move {
            Ok(CommandReply::data(Value::Object(cmd.data().clone())))
        }),
    );

    let sender = node.sender();
    node.command(
        "set_config",
        handler_fn(move |cmd: Command| {
            let sender = sender.clone();
            async move {
                let version = cmd
                    .config_version()
                    .or_else(|| cmd.data().get("config_version").and_then(Value::as_u64));
                sender
                    .send_state(version, Value::Object(cmd.data().clone()))
                    .map_err(|e| CommandError::failed(e.to_string()))?;
                let reply = CommandReply::ok().with_message("config applied");
                Ok::<_, CommandError>(match version {
                    Some(v) => reply.with_applied_config_version(v),
                    None => reply,
                })
            }
        }),
    );

    node.command(
        "sleep",
        handler_fn(|cmd: Command| async move {
            let sleep: Sleep = cmd.data_as()?;
            tokio::time::sleep(Duration::from_millis(sleep.ms)).await;
            Ok::<_, CommandError>(CommandReply::data(json!({ "slept_ms": sleep.ms })))
        }),
    );

    node.start().await?;
    tracing::info!(worker = %name, generation = node.generation(), "Echo worker running");

    let cancel = node.cancellation_token();
    let ticker = tokio::spawn(tick(node.sender(), cancel.clone()));

    wait_for_shutdown(&cancel).await;
    tracing::info!(worker = %name, "Echo worker stopping");
    node.stop().await?;
    let _ = ticker.await;
    Ok(())
}

async fn tick(sender: vjbus::NodeSender, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    let mut n: u64 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = sender.send_telemetry("tick", json!({ "n": n })) {
                    tracing::debug!(error = %e, "Tick not published");
                }
                n += 1;
            }
        }
    }
}

async fn wait_for_shutdown(cancel: &CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut term) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
                _ = cancel.cancelled() => {}
            }
            return;
        }
    }
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = cancel.cancelled() => {}
    }
}
