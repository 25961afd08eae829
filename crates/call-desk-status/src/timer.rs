//! One-second countdown tickers.

use std::{ops::ControlFlow, time::Duration};

use call_desk_core::{AgentStatus, TimerCategory};
use serde::Serialize;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

const TICK: Duration = Duration::from_secs(1);

/// A running countdown owned by the status machine.
///
/// `generation` is unique per started timer; a tick whose generation no
/// longer matches the slot it belongs to is from a superseded timer and
/// must do nothing. `marker` is the status the machine was in when the
/// timer started; completion only applies while the machine is still in it.
pub(crate) struct Countdown {
    pub(crate) category: TimerCategory,
    pub(crate) generation: u64,
    pub(crate) marker: AgentStatus,
    pub(crate) remaining_secs: u64,
    handle: JoinHandle<()>,
}

impl Countdown {
    /// Spawn a ticker that calls `on_tick` once per second until it breaks.
    ///
    /// Must be called within a Tokio runtime.
    pub(crate) fn start<F>(
        category: TimerCategory,
        generation: u64,
        marker: AgentStatus,
        total_secs: u64,
        mut on_tick: F,
    ) -> Self
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + TICK, TICK);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if on_tick().is_break() {
                    break;
                }
            }
        });

        tracing::debug!(%category, generation, total_secs, "Countdown started");

        Self {
            category,
            generation,
            marker,
            remaining_secs: total_secs,
            handle,
        }
    }

    /// Stop the ticker. Any tick already running finds its slot empty.
    pub(crate) fn cancel(self) {
        tracing::debug!(category = %self.category, generation = self.generation, "Countdown cancelled");
        self.handle.abort();
    }

    pub(crate) fn snapshot(&self) -> TimerSnapshot {
        TimerSnapshot {
            category: self.category,
            remaining_secs: self.remaining_secs,
            marker: self.marker,
        }
    }
}

/// Read-only view of a running countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimerSnapshot {
    pub category: TimerCategory,
    pub remaining_secs: u64,
    pub marker: AgentStatus,
}
