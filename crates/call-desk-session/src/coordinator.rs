//! Call session coordinator: sequences connection teardown and setup
//! around call accept and end, and runs the auto-accept timer.

use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, Weak,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use call_desk_core::{
    AgentStatus, CallerInfo, ConnectionState, DeskConfig, InsightStore, MetricsStorage,
    SessionKey, StorageError, TimerCategory,
};
use call_desk_status::{AgentStatusMachine, CallSummary, StatusEvent};
use call_desk_transport::{ConnectionManager, MessageRouter, OutboundMessage, TransportError};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};

#[cfg(feature = "ai-service")]
use crate::ai_service::{AiServiceClient, CallNotice};

/// Session coordinator error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("No call is being offered")]
    NoOfferedCall,
    #[error("No call in progress")]
    NoCall,
}

#[derive(Debug, Clone, Copy)]
enum AiAction {
    Start,
    Stop,
}

struct PendingAutoAccept {
    id: u64,
    caller_id: String,
    handle: JoinHandle<()>,
}

struct Inner {
    config: DeskConfig,
    machine: AgentStatusMachine,
    manager: ConnectionManager,
    store: Arc<InsightStore>,
    router: Arc<MessageRouter>,
    router_task: JoinHandle<()>,
    status_task: JoinHandle<()>,
    storage: Arc<dyn MetricsStorage>,
    #[cfg(feature = "ai-service")]
    ai: Option<AiServiceClient>,
    auto_accept_enabled: AtomicBool,
    auto_accept: Mutex<Option<PendingAutoAccept>>,
    next_auto_accept: AtomicU64,
    session: Mutex<Option<SessionKey>>,
    /// Serializes accept and end so their connection sequences never
    /// interleave.
    call_ops: tokio::sync::Mutex<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(pending) = lock(&self.auto_accept).take() {
            pending.handle.abort();
        }
        self.manager.disconnect();
        self.router_task.abort();
        self.status_task.abort();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Composes the status machine, the gateway connection and the insight
/// store into call-level operations. Cheap to clone.
///
/// Accepting a call always runs disconnect, clear, connect in that order,
/// so nothing from a previous caller survives into the new session.
#[derive(Clone)]
pub struct CallSessionCoordinator {
    inner: Arc<Inner>,
}

impl CallSessionCoordinator {
    /// Load persisted metrics and wire up a coordinator.
    ///
    /// Unreadable metrics are replaced by defaults.
    pub async fn start(config: DeskConfig, storage: Arc<dyn MetricsStorage>) -> Self {
        let metrics = match storage.load().await {
            Ok(metrics) => metrics.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load metrics, starting fresh");
                call_desk_core::PersistedMetrics::default()
            }
        };
        let machine = AgentStatusMachine::restore(metrics, chrono::Local::now().date_naive());
        Self::with_machine(config, storage, machine)
    }

    /// Wire up a coordinator around an existing machine.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn with_machine(
        config: DeskConfig,
        storage: Arc<dyn MetricsStorage>,
        machine: AgentStatusMachine,
    ) -> Self {
        let store = Arc::new(InsightStore::new());
        let (manager, inbound) = ConnectionManager::new(config.connection.clone());
        let router = Arc::new(MessageRouter::new(Arc::clone(&store), manager.clone()));
        let router_task = Arc::clone(&router).spawn(inbound);

        #[cfg(feature = "ai-service")]
        let ai = config.ai_service.base_url.as_deref().map(AiServiceClient::new);

        tracing::info!(agent_id = %config.agent.agent_id, "Call session coordinator ready");

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let status_task = spawn_status_watch(weak.clone(), &machine);
            Inner {
                auto_accept_enabled: AtomicBool::new(config.agent.auto_accept_enabled),
                config,
                machine,
                manager,
                store,
                router,
                router_task,
                status_task,
                storage,
                #[cfg(feature = "ai-service")]
                ai,
                auto_accept: Mutex::new(None),
                next_auto_accept: AtomicU64::new(0),
                session: Mutex::new(None),
                call_ops: tokio::sync::Mutex::new(()),
            }
        });
        Self { inner }
    }

    // ---- accessors ----

    #[must_use]
    pub fn machine(&self) -> &AgentStatusMachine {
        &self.inner.machine
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.manager
    }

    #[must_use]
    pub fn insights(&self) -> &Arc<InsightStore> {
        &self.inner.store
    }

    #[must_use]
    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    #[must_use]
    pub fn config(&self) -> &DeskConfig {
        &self.inner.config
    }

    /// The (agent, caller) pair of the open session, if any.
    #[must_use]
    pub fn session(&self) -> Option<SessionKey> {
        lock(&self.inner.session).clone()
    }

    // ---- calls ----

    /// Offer a call to the agent, arming auto-accept when it applies.
    ///
    /// Returns `false` if another call is already present.
    pub fn on_incoming_call(&self, caller_id: impl Into<String>, info: CallerInfo) -> bool {
        if !self.inner.machine.start_call(caller_id.into(), info) {
            return false;
        }
        self.arm_auto_accept_if_eligible();
        true
    }

    /// Accept the offered call.
    ///
    /// # Errors
    /// Returns error if no call is offered or the gateway URL is invalid.
    pub async fn accept_call(&self) -> Result<CallerInfo, SessionError> {
        self.cancel_auto_accept();
        let _guard = self.inner.call_ops.lock().await;
        self.accept_offered().await
    }

    /// Decline the offered call.
    pub fn reject_call(&self) -> bool {
        self.cancel_auto_accept();
        self.inner.machine.reject_call()
    }

    /// Hang up, tear down the session and persist metrics.
    ///
    /// # Errors
    /// Returns error if there is no call.
    pub async fn end_call(&self) -> Result<CallSummary, SessionError> {
        self.cancel_auto_accept();
        let _guard = self.inner.call_ops.lock().await;

        let machine = &self.inner.machine;
        let snapshot = machine.snapshot();
        let caller = snapshot.caller.ok_or(SessionError::NoCall)?;
        let session = lock(&self.inner.session).take();

        if let Some(key) = &session {
            let duration = snapshot.call_duration.as_secs();
            self.inner
                .manager
                .send_message(OutboundMessage::end_call(&key.caller_id, &key.agent_id, duration));
        }
        self.inner.manager.disconnect();

        let summary = machine.end_call().ok_or(SessionError::NoCall)?;

        if let Some(key) = &session {
            self.notify_ai(AiAction::Stop, key, Some(&caller.name));
        }

        // A call that was never answered has nothing to wrap up.
        let answered = session.is_some() || summary.duration_secs > 0;
        let wrap_up = self.inner.config.agent.after_call_work_secs;
        if answered && wrap_up > 0 {
            machine.start_after_call_work(wrap_up);
        }

        if let Err(e) = self.persist().await {
            tracing::warn!(error = %e, "Failed to persist metrics after call");
        }
        Ok(summary)
    }

    /// Claim the offered call, then rebuild the session around it.
    ///
    /// Callers hold `call_ops`.
    async fn accept_offered(&self) -> Result<CallerInfo, SessionError> {
        let inner = &self.inner;
        let caller = inner
            .machine
            .caller()
            .filter(|_| inner.machine.call_state().is_offered())
            .ok_or(SessionError::NoOfferedCall)?;

        let agent = &inner.config.agent;
        let key = SessionKey::new(agent.agent_id.as_str(), caller.caller_id.as_str());
        inner.manager.target_url(&key.agent_id, &key.caller_id, agent.port)?;

        if !inner.machine.accept_call() {
            return Err(SessionError::NoOfferedCall);
        }
        tracing::info!(agent_id = %key.agent_id, caller_id = %key.caller_id, "Call accepted");

        inner.manager.disconnect();
        inner.store.clear();
        inner.manager.connect(&key.agent_id, &key.caller_id, agent.port)?;
        *lock(&inner.session) = Some(key.clone());

        if inner
            .manager
            .wait_for(ConnectionState::Connected, agent.accept_handshake_timeout())
            .await
        {
            inner.manager.send_message(OutboundMessage::accept_call(
                &key.caller_id,
                &key.agent_id,
                &caller.name,
            ));
        } else {
            tracing::warn!(caller_id = %key.caller_id, "Gateway not connected in time, accept_call not sent");
        }

        self.notify_ai(AiAction::Start, &key, Some(&caller.name));
        Ok(caller)
    }

    // ---- auto-accept ----

    #[must_use]
    pub fn auto_accept_enabled(&self) -> bool {
        self.inner.auto_accept_enabled.load(Ordering::Acquire)
    }

    /// Turn auto-accept on or off. Turning it off drops a pending timer;
    /// turning it on arms one for a call already waiting.
    pub fn set_auto_accept(&self, enabled: bool) {
        self.inner.auto_accept_enabled.store(enabled, Ordering::Release);
        if enabled {
            self.arm_auto_accept_if_eligible();
        } else {
            self.cancel_auto_accept();
        }
    }

    /// Whether an auto-accept timer is armed.
    #[must_use]
    pub fn auto_accept_pending(&self) -> bool {
        lock(&self.inner.auto_accept).is_some()
    }

    /// Arm the timer for the offered call if none is armed for it and the
    /// agent can take calls.
    fn arm_auto_accept_if_eligible(&self) {
        let machine = &self.inner.machine;
        if !self.auto_accept_enabled() || !machine.can_accept_calls() || !machine.call_state().is_offered() {
            return;
        }
        let Some(caller) = machine.caller() else {
            return;
        };
        let armed = lock(&self.inner.auto_accept)
            .as_ref()
            .is_some_and(|pending| pending.caller_id == caller.caller_id);
        if !armed {
            self.schedule_auto_accept(caller.caller_id);
        }
    }

    fn schedule_auto_accept(&self, caller_id: String) {
        let delay = self.inner.config.agent.auto_accept_delay();
        let id = self.inner.next_auto_accept.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        // Hold the slot while spawning so the timer cannot look for itself
        // before it is registered.
        let mut slot = lock(&self.inner.auto_accept);
        let task_caller = caller_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                Self { inner }.fire_auto_accept(id, &task_caller).await;
            }
        });

        tracing::debug!(
            %caller_id,
            timer = %TimerCategory::AutoAccept,
            delay_ms = self.inner.config.agent.auto_accept_delay_ms,
            "Auto-accept armed"
        );
        if let Some(previous) = slot.replace(PendingAutoAccept {
            id,
            caller_id,
            handle,
        }) {
            previous.handle.abort();
        }
    }

    fn cancel_auto_accept(&self) {
        if let Some(pending) = lock(&self.inner.auto_accept).take() {
            tracing::debug!(caller_id = %pending.caller_id, timer = %TimerCategory::AutoAccept, "Auto-accept cancelled");
            pending.handle.abort();
        }
    }

    async fn fire_auto_accept(&self, id: u64, caller_id: &str) {
        {
            let mut slot = lock(&self.inner.auto_accept);
            if slot.as_ref().is_none_or(|pending| pending.id != id) {
                return;
            }
            // Detach rather than abort: this task is the one running.
            slot.take();
        }

        let _guard = self.inner.call_ops.lock().await;
        let machine = &self.inner.machine;
        let still_offered = machine.call_state().is_offered()
            && machine.caller().is_some_and(|c| c.caller_id == caller_id)
            && machine.can_accept_calls()
            && self.auto_accept_enabled();
        if !still_offered {
            tracing::debug!(caller_id, "Auto-accept skipped, call no longer eligible");
            return;
        }

        tracing::info!(caller_id, "Auto-accepting call");
        if let Err(e) = self.accept_offered().await {
            tracing::warn!(caller_id, error = %e, "Auto-accept failed");
        }
    }

    // ---- status passthroughs ----

    pub fn set_status(&self, status: AgentStatus) {
        self.inner.machine.set_status(status);
    }

    pub fn set_auto_call_enabled(&self, enabled: bool) {
        self.inner.machine.set_auto_call_enabled(enabled);
        if enabled {
            self.arm_auto_accept_if_eligible();
        }
    }

    pub fn start_do_not_disturb(&self, duration_minutes: u64, original_status: AgentStatus) {
        self.inner.machine.start_do_not_disturb(duration_minutes, original_status);
    }

    pub fn cancel_do_not_disturb(&self) {
        self.inner.machine.cancel_do_not_disturb();
    }

    pub fn cancel_after_call_work(&self) {
        self.inner.machine.cancel_after_call_work();
    }

    pub fn toggle_mute(&self) -> Option<bool> {
        self.inner.machine.toggle_mute()
    }

    pub fn toggle_hold(&self) -> Option<bool> {
        self.inner.machine.toggle_hold()
    }

    // ---- lifecycle ----

    /// Save the machine's metrics.
    ///
    /// # Errors
    /// Returns error if the storage backend fails.
    pub async fn persist(&self) -> Result<(), SessionError> {
        self.inner.storage.save(&self.inner.machine.metrics()).await?;
        Ok(())
    }

    /// Stop timers, go offline, disconnect and persist.
    ///
    /// # Errors
    /// Returns error if the final save fails.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.cancel_auto_accept();
        self.inner.machine.set_status(AgentStatus::Offline);
        self.inner.manager.disconnect();
        lock(&self.inner.session).take();
        tracing::info!("Call session coordinator shut down");
        self.persist().await
    }

    #[cfg(feature = "ai-service")]
    fn notify_ai(&self, action: AiAction, key: &SessionKey, caller_name: Option<&str>) {
        let Some(ai) = &self.inner.ai else {
            return;
        };
        let mut notice = CallNotice::new(key.caller_id.as_str(), key.agent_id.as_str());
        if let Some(name) = caller_name {
            notice = notice.with_caller_name(name);
        }
        match action {
            AiAction::Start => ai.notify_start(notice),
            AiAction::Stop => ai.notify_stop(notice),
        }
    }

    #[cfg(not(feature = "ai-service"))]
    fn notify_ai(&self, action: AiAction, key: &SessionKey, _caller_name: Option<&str>) {
        tracing::trace!(?action, caller_id = %key.caller_id, "AI side-channel disabled");
    }
}

/// Re-arm auto-accept when the agent becomes available with a call still
/// waiting, e.g. one offered during after-call work.
fn spawn_status_watch(weak: Weak<Inner>, machine: &AgentStatusMachine) -> JoinHandle<()> {
    let mut events = machine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(StatusEvent::StatusChanged {
                    to: AgentStatus::Available,
                    ..
                }) => {
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    CallSessionCoordinator { inner }.arm_auto_accept_if_eligible();
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Status watch lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
