//! Agent status and call-state machine.

use std::{
    collections::BTreeMap,
    ops::ControlFlow,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use call_desk_core::{AgentStatus, CallState, CallerInfo, PersistedMetrics, TimerCategory};
use chrono::NaiveDate;
use serde::Serialize;
use tokio::{sync::broadcast, time::Instant};

use crate::timer::{Countdown, TimerSnapshot};

/// Notification published on every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    StatusChanged {
        from: AgentStatus,
        to: AgentStatus,
    },
    CallStateChanged {
        from: CallState,
        to: CallState,
    },
    TimerTick {
        category: TimerCategory,
        remaining_secs: u64,
    },
    /// A countdown reached zero. `applied` is false when the machine had
    /// already left the timer's status and the expiry was discarded.
    TimerExpired {
        category: TimerCategory,
        applied: bool,
    },
}

/// Outcome of `end_call`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSummary {
    pub caller_id: String,
    pub duration_secs: u64,
}

/// Point-in-time view of the whole machine.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSnapshot {
    pub status: AgentStatus,
    pub time_in_current_status: Duration,
    pub time_in_status: BTreeMap<AgentStatus, Duration>,
    pub call_state: CallState,
    pub caller: Option<CallerInfo>,
    pub call_duration: Duration,
    pub muted: bool,
    pub on_hold: bool,
    pub calls_handled_today: u32,
    pub total_handle_time_secs: u64,
    pub auto_call_enabled: bool,
    pub queue_count: u32,
    pub after_call_work: Option<TimerSnapshot>,
    pub do_not_disturb: Option<TimerSnapshot>,
}

struct Inner {
    status: AgentStatus,
    status_since: Instant,
    online_since: Instant,
    /// Time accumulated before `online_since` (restored from storage).
    carried_over: Duration,
    time_in_status: BTreeMap<AgentStatus, Duration>,

    call_state: CallState,
    caller: Option<CallerInfo>,
    call_start: Option<Instant>,
    muted: bool,
    on_hold: bool,

    calls_handled_today: u32,
    total_handle_time_secs: u64,
    auto_call_enabled: bool,
    queue_count: u32,
    day: Option<NaiveDate>,

    after_call_work: Option<Countdown>,
    do_not_disturb: Option<Countdown>,
    dnd_original: Option<AgentStatus>,
    next_generation: u64,

    events: broadcast::Sender<StatusEvent>,
}

impl Inner {
    fn emit(&self, event: StatusEvent) {
        let _ = self.events.send(event);
    }

    fn flush_time(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.status_since);
        *self.time_in_status.entry(self.status).or_default() += elapsed;
        self.status_since = now;
    }

    /// Move to `to` without touching timers.
    fn transition(&mut self, to: AgentStatus) {
        self.flush_time(Instant::now());
        let from = std::mem::replace(&mut self.status, to);
        tracing::info!(%from, %to, "Agent status changed");
        self.emit(StatusEvent::StatusChanged { from, to });
    }

    fn cancel_status_timers(&mut self) {
        if let Some(timer) = self.after_call_work.take() {
            timer.cancel();
        }
        if let Some(timer) = self.do_not_disturb.take() {
            timer.cancel();
        }
        self.dnd_original = None;
    }

    fn set_status(&mut self, to: AgentStatus) {
        self.cancel_status_timers();
        self.transition(to);
    }

    fn set_call_state(&mut self, to: CallState) {
        let from = std::mem::replace(&mut self.call_state, to);
        if from != to {
            tracing::debug!(?from, ?to, "Call state changed");
            self.emit(StatusEvent::CallStateChanged { from, to });
        }
    }

    fn reset_call_fields(&mut self) {
        self.caller = None;
        self.call_start = None;
        self.muted = false;
        self.on_hold = false;
    }

    fn timer_slot(&mut self, category: TimerCategory) -> Option<&mut Option<Countdown>> {
        match category {
            TimerCategory::AfterCallWork => Some(&mut self.after_call_work),
            TimerCategory::DoNotDisturb => Some(&mut self.do_not_disturb),
            _ => None,
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Apply an expired timer if the machine is still in the timer's status.
    fn complete_timer(&mut self, category: TimerCategory, marker: AgentStatus) -> bool {
        if self.status != marker {
            tracing::debug!(
                %category,
                %marker,
                current = %self.status,
                "Status changed while countdown ran, discarding expiry"
            );
            return false;
        }
        let to = match category {
            TimerCategory::DoNotDisturb => {
                restorable(self.dnd_original.take().unwrap_or(AgentStatus::Available))
            }
            _ => AgentStatus::Available,
        };
        self.transition(to);
        true
    }

    fn time_in_status_with_current(&self, now: Instant) -> BTreeMap<AgentStatus, Duration> {
        let mut totals = self.time_in_status.clone();
        *totals.entry(self.status).or_default() += now.saturating_duration_since(self.status_since);
        totals
    }
}

/// DND never restores into a timed status whose timer is gone.
const fn restorable(status: AgentStatus) -> AgentStatus {
    match status {
        AgentStatus::AfterCallWork | AgentStatus::DoNotDisturb => AgentStatus::Available,
        other => other,
    }
}

fn tick(weak: &Weak<Shared>, category: TimerCategory, generation: u64) -> ControlFlow<()> {
    let Some(shared) = weak.upgrade() else {
        return ControlFlow::Break(());
    };
    let mut inner = shared.lock();

    let remaining = match inner.timer_slot(category) {
        Some(Some(timer)) if timer.generation == generation => {
            timer.remaining_secs = timer.remaining_secs.saturating_sub(1);
            timer.remaining_secs
        }
        _ => return ControlFlow::Break(()),
    };

    if remaining > 0 {
        inner.emit(StatusEvent::TimerTick {
            category,
            remaining_secs: remaining,
        });
        return ControlFlow::Continue(());
    }

    let marker = inner
        .timer_slot(category)
        .and_then(Option::take)
        .map(|timer| timer.marker);
    let applied = marker.is_some_and(|marker| inner.complete_timer(category, marker));
    inner.emit(StatusEvent::TimerExpired { category, applied });
    ControlFlow::Break(())
}

struct Shared {
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Tracks agent status, the current call, and the wrap-up/DND countdowns.
///
/// State changes only through the named transitions below; every
/// transition runs under one lock, so timer expiry, user actions and
/// network-driven calls never interleave mid-transition.
///
/// Timer-starting operations must be called within a Tokio runtime.
#[derive(Clone)]
pub struct AgentStatusMachine {
    shared: Arc<Shared>,
}

impl Default for AgentStatusMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentStatusMachine {
    /// Create a machine with empty metrics, status `offline`.
    #[must_use]
    pub fn new() -> Self {
        Self::restore(PersistedMetrics::default(), chrono::Local::now().date_naive())
    }

    /// Create a machine from persisted metrics.
    ///
    /// Live fields are always reset: status `offline`, call `idle`, queue 0.
    /// Daily counters from a day other than `today` are dropped.
    #[must_use]
    pub fn restore(mut metrics: PersistedMetrics, today: NaiveDate) -> Self {
        metrics.roll_over(today);

        let time_in_status: BTreeMap<AgentStatus, Duration> = metrics
            .time_in_status_ms
            .iter()
            .map(|(status, ms)| (*status, Duration::from_millis(*ms)))
            .collect();
        let carried_over = time_in_status.values().sum();
        let now = Instant::now();
        let (events, _) = broadcast::channel(256);

        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    status: AgentStatus::Offline,
                    status_since: now,
                    online_since: now,
                    carried_over,
                    time_in_status,
                    call_state: CallState::Idle,
                    caller: None,
                    call_start: None,
                    muted: false,
                    on_hold: false,
                    calls_handled_today: metrics.calls_handled_today,
                    total_handle_time_secs: metrics.total_handle_time_secs,
                    auto_call_enabled: metrics.auto_call_enabled,
                    queue_count: 0,
                    day: metrics.day,
                    after_call_work: None,
                    do_not_disturb: None,
                    dnd_original: None,
                    next_generation: 0,
                    events,
                }),
            }),
        }
    }

    /// Subscribe to state-change notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.shared.lock().events.subscribe()
    }

    // ---- status ----

    /// Manually set the agent status. Always permitted.
    ///
    /// Cancels any running after-call-work or DND countdown.
    pub fn set_status(&self, status: AgentStatus) {
        self.shared.lock().set_status(status);
    }

    #[must_use]
    pub fn status(&self) -> AgentStatus {
        self.shared.lock().status
    }

    /// True iff the agent is available and opted into automatic calls.
    #[must_use]
    pub fn can_accept_calls(&self) -> bool {
        let inner = self.shared.lock();
        inner.status == AgentStatus::Available && inner.auto_call_enabled
    }

    pub fn set_auto_call_enabled(&self, enabled: bool) {
        self.shared.lock().auto_call_enabled = enabled;
    }

    #[must_use]
    pub fn auto_call_enabled(&self) -> bool {
        self.shared.lock().auto_call_enabled
    }

    pub fn set_queue_count(&self, count: u32) {
        self.shared.lock().queue_count = count;
    }

    // ---- timed statuses ----

    /// Enter after-call work for `duration_secs`, then return to `available`
    /// unless the status was changed in the meantime.
    pub fn start_after_call_work(&self, duration_secs: u64) {
        let weak = Arc::downgrade(&self.shared);
        let mut inner = self.shared.lock();
        inner.set_status(AgentStatus::AfterCallWork);

        let generation = inner.next_generation();
        let category = TimerCategory::AfterCallWork;
        inner.after_call_work = Some(Countdown::start(
            category,
            generation,
            AgentStatus::AfterCallWork,
            duration_secs.max(1),
            move || tick(&weak, category, generation),
        ));
    }

    /// Stop after-call work early. Returns to `available` only if the agent
    /// is still in after-call work.
    pub fn cancel_after_call_work(&self) {
        let mut inner = self.shared.lock();
        if let Some(timer) = inner.after_call_work.take() {
            timer.cancel();
        }
        if inner.status == AgentStatus::AfterCallWork {
            inner.set_status(AgentStatus::Available);
        }
    }

    /// Enter do-not-disturb for `duration_minutes`, then restore
    /// `original_status` unless the status was changed in the meantime.
    pub fn start_do_not_disturb(&self, duration_minutes: u64, original_status: AgentStatus) {
        let weak = Arc::downgrade(&self.shared);
        let mut inner = self.shared.lock();
        inner.set_status(AgentStatus::DoNotDisturb);
        inner.dnd_original = Some(original_status);

        let generation = inner.next_generation();
        let category = TimerCategory::DoNotDisturb;
        inner.do_not_disturb = Some(Countdown::start(
            category,
            generation,
            AgentStatus::DoNotDisturb,
            duration_minutes.saturating_mul(60).max(1),
            move || tick(&weak, category, generation),
        ));
    }

    /// Stop do-not-disturb early, restoring the remembered status only if
    /// the agent is still in DND.
    pub fn cancel_do_not_disturb(&self) {
        let mut inner = self.shared.lock();
        if let Some(timer) = inner.do_not_disturb.take() {
            timer.cancel();
        }
        let original = inner.dnd_original.take();
        if inner.status == AgentStatus::DoNotDisturb {
            inner.set_status(restorable(original.unwrap_or(AgentStatus::Available)));
        }
    }

    /// Remaining seconds of the countdown in `category`, if one is running.
    #[must_use]
    pub fn remaining(&self, category: TimerCategory) -> Option<u64> {
        let inner = self.shared.lock();
        match category {
            TimerCategory::AfterCallWork => inner.after_call_work.as_ref(),
            TimerCategory::DoNotDisturb => inner.do_not_disturb.as_ref(),
            _ => None,
        }
        .map(|timer| timer.remaining_secs)
    }

    // ---- calls ----

    /// Offer a call to the agent. Only meaningful while idle.
    ///
    /// Returns `false` (and changes nothing) if a call is already present.
    pub fn start_call(&self, caller_id: impl Into<String>, mut info: CallerInfo) -> bool {
        let mut inner = self.shared.lock();
        if inner.call_state != CallState::Idle {
            tracing::warn!(call_state = ?inner.call_state, "Ignoring new call while another is present");
            return false;
        }
        info.caller_id = caller_id.into();
        tracing::info!(caller_id = %info.caller_id, "Incoming call");
        inner.reset_call_fields();
        inner.caller = Some(info);
        inner.set_call_state(CallState::Incoming);
        true
    }

    /// Mark the offered call as ringing at the agent.
    pub fn mark_ringing(&self) -> bool {
        let mut inner = self.shared.lock();
        if inner.call_state != CallState::Incoming {
            return false;
        }
        inner.set_call_state(CallState::Ringing);
        true
    }

    /// Answer the offered call.
    ///
    /// No-op returning `false` if no call is offered.
    pub fn accept_call(&self) -> bool {
        let mut inner = self.shared.lock();
        if inner.caller.is_none() || !inner.call_state.is_offered() {
            tracing::warn!(call_state = ?inner.call_state, "accept_call without an offered call");
            return false;
        }
        inner.call_start = Some(Instant::now());
        inner.set_call_state(CallState::Active);
        inner.set_status(AgentStatus::OnCall);
        true
    }

    /// Decline the offered call. Status is left untouched.
    pub fn reject_call(&self) -> bool {
        let mut inner = self.shared.lock();
        if !inner.call_state.is_offered() {
            return false;
        }
        tracing::info!(caller_id = ?inner.caller.as_ref().map(|c| &c.caller_id), "Call rejected");
        inner.reset_call_fields();
        inner.set_call_state(CallState::Idle);
        true
    }

    /// Hang up. Returns to `available` and idle, counting the call if it
    /// lasted at least one second.
    ///
    /// Returns `None` if there was no call.
    pub fn end_call(&self) -> Option<CallSummary> {
        let mut inner = self.shared.lock();
        if inner.call_state == CallState::Idle {
            tracing::warn!("end_call without a call");
            return None;
        }

        let duration_secs = inner
            .call_start
            .map_or(0, |start| Instant::now().saturating_duration_since(start).as_secs());
        let caller_id = inner
            .caller
            .as_ref()
            .map(|c| c.caller_id.clone())
            .unwrap_or_default();

        inner.reset_call_fields();
        inner.set_call_state(CallState::Ended);
        inner.set_call_state(CallState::Idle);
        inner.set_status(AgentStatus::Available);

        if duration_secs > 0 {
            inner.calls_handled_today += 1;
            inner.total_handle_time_secs += duration_secs;
        }
        tracing::info!(%caller_id, duration_secs, "Call ended");

        Some(CallSummary {
            caller_id,
            duration_secs,
        })
    }

    /// Flip mute on the active call. Returns the new state.
    pub fn toggle_mute(&self) -> Option<bool> {
        let mut inner = self.shared.lock();
        if inner.call_state != CallState::Active {
            return None;
        }
        inner.muted = !inner.muted;
        Some(inner.muted)
    }

    /// Flip hold on the active call. Returns the new state.
    pub fn toggle_hold(&self) -> Option<bool> {
        let mut inner = self.shared.lock();
        if inner.call_state != CallState::Active {
            return None;
        }
        inner.on_hold = !inner.on_hold;
        Some(inner.on_hold)
    }

    #[must_use]
    pub fn call_state(&self) -> CallState {
        self.shared.lock().call_state
    }

    #[must_use]
    pub fn caller(&self) -> Option<CallerInfo> {
        self.shared.lock().caller.clone()
    }

    // ---- metrics ----

    /// Total time covered by `time_in_status`, i.e. carried-over time plus
    /// time since this machine was created.
    #[must_use]
    pub fn online_time(&self) -> Duration {
        let inner = self.shared.lock();
        inner.carried_over + inner.online_since.elapsed()
    }

    /// Everything that should survive a reload.
    #[must_use]
    pub fn metrics(&self) -> PersistedMetrics {
        let inner = self.shared.lock();
        let totals = inner.time_in_status_with_current(Instant::now());
        PersistedMetrics {
            calls_handled_today: inner.calls_handled_today,
            total_handle_time_secs: inner.total_handle_time_secs,
            time_in_status_ms: totals
                .into_iter()
                .map(|(status, d)| (status, u64::try_from(d.as_millis()).unwrap_or(u64::MAX)))
                .collect(),
            auto_call_enabled: inner.auto_call_enabled,
            day: inner.day,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> AgentSnapshot {
        let inner = self.shared.lock();
        let now = Instant::now();
        AgentSnapshot {
            status: inner.status,
            time_in_current_status: now.saturating_duration_since(inner.status_since),
            time_in_status: inner.time_in_status.clone(),
            call_state: inner.call_state,
            caller: inner.caller.clone(),
            call_duration: inner
                .call_start
                .map_or(Duration::ZERO, |start| now.saturating_duration_since(start)),
            muted: inner.muted,
            on_hold: inner.on_hold,
            calls_handled_today: inner.calls_handled_today,
            total_handle_time_secs: inner.total_handle_time_secs,
            auto_call_enabled: inner.auto_call_enabled,
            queue_count: inner.queue_count,
            after_call_work: inner.after_call_work.as_ref().map(Countdown::snapshot),
            do_not_disturb: inner.do_not_disturb.as_ref().map(Countdown::snapshot),
        }
    }
}
