//! Headless call desk agent.
//!
//! Run with: cargo run -p headless-agent -- [config.toml]
//!
//! Reads one command per line from stdin:
//! `incoming <caller-id> <name...>`, `accept`, `reject`, `end`,
//! `status <status>`, `dnd <minutes>`, `mute`, `hold`, `auto on|off`,
//! `show`, `quit`.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use call_desk_core::{AgentStatus, CallerInfo, DeskConfig, MetricsStorage};
use call_desk_session::{
    CallSessionCoordinator,
    storage::{FileStorage, MemoryStorage},
};
use futures::StreamExt;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = DeskConfig::load(config_path.as_deref()).context("loading configuration")?;

    let storage: Arc<dyn MetricsStorage> = match &config.storage.metrics_path {
        Some(path) => Arc::new(FileStorage::new(path)),
        None => match FileStorage::in_data_dir() {
            Ok(storage) => Arc::new(storage),
            Err(e) => {
                tracing::warn!(error = %e, "Metrics will not survive a restart");
                Arc::new(MemoryStorage::new())
            }
        },
    };

    let desk = CallSessionCoordinator::start(config, storage).await;
    desk.set_status(AgentStatus::Available);
    spawn_event_log(&desk);

    tracing::info!("Ready. Type a command, or `quit`.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                if !run_command(&desk, line.trim()).await {
                    break;
                }
            }
        }
    }

    desk.shutdown().await.context("shutting down")?;
    Ok(())
}

/// Execute one command line. Returns `false` to quit.
async fn run_command(desk: &CallSessionCoordinator, line: &str) -> bool {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return true;
    };

    match command {
        "incoming" => {
            let Some(caller_id) = words.next() else {
                tracing::warn!("usage: incoming <caller-id> <name...>");
                return true;
            };
            let name = words.collect::<Vec<_>>().join(" ");
            desk.on_incoming_call(caller_id, CallerInfo::new(caller_id, name));
        }
        "accept" => {
            if let Err(e) = desk.accept_call().await {
                tracing::warn!(error = %e, "Accept failed");
            }
        }
        "reject" => {
            desk.reject_call();
        }
        "end" => match desk.end_call().await {
            Ok(summary) => tracing::info!(caller_id = %summary.caller_id, duration_secs = summary.duration_secs, "Call summary"),
            Err(e) => tracing::warn!(error = %e, "End failed"),
        },
        "status" => match words.next().and_then(parse_status) {
            Some(status) => desk.set_status(status),
            None => tracing::warn!("usage: status <available|break|offline|...>"),
        },
        "dnd" => match words.next().and_then(|m| m.parse().ok()) {
            Some(minutes) => desk.start_do_not_disturb(minutes, desk.machine().status()),
            None => tracing::warn!("usage: dnd <minutes>"),
        },
        "mute" => {
            desk.toggle_mute();
        }
        "hold" => {
            desk.toggle_hold();
        }
        "auto" => {
            let enabled = words.next() == Some("on");
            desk.set_auto_accept(enabled);
            desk.set_auto_call_enabled(enabled);
        }
        "show" => {
            let snapshot = desk.machine().snapshot();
            let insights = desk.insights().snapshot();
            println!(
                "{}",
                serde_json::json!({
                    "status": snapshot.status,
                    "callState": snapshot.call_state,
                    "caller": snapshot.caller,
                    "callsHandledToday": snapshot.calls_handled_today,
                    "connection": desk.connection().state(),
                    "insights": insights,
                })
            );
        }
        "quit" | "exit" => return false,
        other => tracing::warn!(command = other, "Unknown command"),
    }
    true
}

fn parse_status(raw: &str) -> Option<AgentStatus> {
    AgentStatus::ALL.into_iter().find(|s| s.as_str() == raw)
}

fn spawn_event_log(desk: &CallSessionCoordinator) {
    let mut status_events = desk.machine().subscribe();
    tokio::spawn(async move {
        loop {
            match status_events.recv().await {
                Ok(event) => tracing::debug!(?event, "Status event"),
                Err(RecvError::Lagged(skipped)) => tracing::debug!(skipped, "Status log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut insight_updates = desk.insights().updates_stream();
    tokio::spawn(async move {
        while let Some(update) = insight_updates.next().await {
            tracing::info!(?update, "Insight update");
        }
    });
}
