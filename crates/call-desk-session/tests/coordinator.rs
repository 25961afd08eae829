//! Call flows against an in-process gateway and AI service.

use std::{sync::Arc, time::Duration};

use call_desk_core::{AgentStatus, CallState, CallerInfo, ConnectionState, DeskConfig, MetricsStorage};
use call_desk_session::{CallSessionCoordinator, storage::MemoryStorage};
use call_desk_testkit::{MockAiService, MockGateway};

const WAIT: Duration = Duration::from_secs(5);

fn config(gateway: &MockGateway) -> DeskConfig {
    let mut config = DeskConfig::default();
    config.connection.base_url = gateway.base_url();
    config.connection.reconnect_base_ms = 20;
    config.connection.heartbeat_interval_ms = 1_000;
    config.agent.agent_id = "agent-7".to_string();
    config.agent.port = gateway.port();
    config.agent.auto_accept_delay_ms = 50;
    config
}

async fn available(config: DeskConfig, storage: Arc<MemoryStorage>) -> CallSessionCoordinator {
    let coordinator = CallSessionCoordinator::start(config, storage).await;
    coordinator.set_status(AgentStatus::Available);
    coordinator.set_auto_call_enabled(true);
    coordinator
}

async fn wait_for_call_state(c: &CallSessionCoordinator, state: CallState) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while c.machine().call_state() != state {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}

#[tokio::test]
async fn test_accept_opens_session_and_notifies_gateway() {
    let gateway = MockGateway::start().await;
    let c = available(config(&gateway), Arc::new(MemoryStorage::new())).await;

    c.on_incoming_call("caller-1", CallerInfo::new("", "Jane Doe"));
    c.accept_call().await.unwrap();

    assert_eq!(c.connection().state(), ConnectionState::Connected);
    assert!(gateway.wait_until(WAIT, |g| !g.received_of("accept_call").is_empty()).await);

    let accept = &gateway.received_of("accept_call")[0];
    assert_eq!(accept.caller_id.as_deref(), Some("caller-1"));
    assert_eq!(accept.message["agentId"], "agent-7");
    assert_eq!(accept.message["callerName"], "Jane Doe");

    let handshake = &gateway.handshakes()[0];
    assert_eq!(handshake.get("agentId").map(String::as_str), Some("agent-7"));
}

#[tokio::test]
async fn test_insights_flow_during_call() {
    let gateway = MockGateway::start().await;
    let c = available(config(&gateway), Arc::new(MemoryStorage::new())).await;

    c.on_incoming_call("caller-1", CallerInfo::new("", "Jane Doe"));
    c.accept_call().await.unwrap();
    assert!(gateway.wait_until(WAIT, |g| g.open_connections() == 1).await);

    gateway.send_to_all(r#"{"type":"customer","data":{"name":"Jane Doe","tier":"gold"}}"#);
    gateway.send_to_all(r#"{"type":"transcript","data":{"text":"I was double charged","speaker":"customer"}}"#);

    let deadline = tokio::time::Instant::now() + WAIT;
    while c.insights().snapshot().transcript.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let insights = c.insights().snapshot();
    let customer = insights.customer.unwrap();
    assert!(customer.id.contains("JANE-DOE"), "{}", customer.id);
    assert_eq!(insights.transcript[0].text, "I was double charged");
}

#[tokio::test]
async fn test_end_call_sends_end_then_disconnects() {
    let gateway = MockGateway::start().await;
    let storage = Arc::new(MemoryStorage::new());
    let c = available(config(&gateway), Arc::clone(&storage)).await;

    c.on_incoming_call("caller-1", CallerInfo::new("", "Jane Doe"));
    c.accept_call().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_100)).await;

    let summary = c.end_call().await.unwrap();
    assert!(summary.duration_secs >= 1);

    assert!(gateway.wait_until(WAIT, |g| !g.received_of("end_call").is_empty()).await);
    let end = &gateway.received_of("end_call")[0];
    assert_eq!(end.message["callerId"], "caller-1");
    assert!(end.message["duration"].as_u64().unwrap() >= 1);

    assert!(gateway.wait_until(WAIT, |g| g.open_connections() == 0).await);
    assert_eq!(c.machine().status(), AgentStatus::AfterCallWork);

    let saved = storage.load().await.unwrap().unwrap();
    assert_eq!(saved.calls_handled_today, 1);
}

#[tokio::test]
async fn test_next_call_replaces_session() {
    let gateway = MockGateway::start().await;
    let mut config = config(&gateway);
    config.agent.after_call_work_secs = 0;
    let c = available(config, Arc::new(MemoryStorage::new())).await;

    c.on_incoming_call("caller-1", CallerInfo::new("", "Jane Doe"));
    c.accept_call().await.unwrap();
    c.end_call().await.unwrap();
    assert_eq!(c.machine().status(), AgentStatus::Available);

    c.on_incoming_call("caller-2", CallerInfo::new("", "John Roe"));
    c.accept_call().await.unwrap();

    assert!(gateway.wait_until(WAIT, |g| g.total_connections() == 2 && g.open_connections() == 1).await);
    assert_eq!(
        gateway.handshakes()[1].get("callerId").map(String::as_str),
        Some("caller-2")
    );
}

#[tokio::test]
async fn test_auto_accept_fires_after_delay() {
    let gateway = MockGateway::start().await;
    let mut config = config(&gateway);
    config.agent.auto_accept_enabled = true;
    let c = available(config, Arc::new(MemoryStorage::new())).await;

    c.on_incoming_call("caller-1", CallerInfo::new("", "Jane Doe"));
    assert!(c.auto_accept_pending());

    assert!(wait_for_call_state(&c, CallState::Active).await);
    assert_eq!(c.machine().status(), AgentStatus::OnCall);
    assert!(gateway.wait_until(WAIT, |g| !g.received_of("accept_call").is_empty()).await);
    assert!(!c.auto_accept_pending());
}

#[tokio::test]
async fn test_manual_status_change_blocks_auto_accept() {
    let gateway = MockGateway::start().await;
    let mut config = config(&gateway);
    config.agent.auto_accept_enabled = true;
    config.agent.auto_accept_delay_ms = 100;
    let c = available(config, Arc::new(MemoryStorage::new())).await;

    c.on_incoming_call("caller-1", CallerInfo::new("", "Jane Doe"));
    c.set_status(AgentStatus::Break);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(c.machine().call_state(), CallState::Incoming);
    assert_eq!(gateway.total_connections(), 0);
}

#[tokio::test]
async fn test_ai_service_sees_start_and_stop() {
    let gateway = MockGateway::start().await;
    let ai = MockAiService::start().await;
    let mut config = config(&gateway);
    config.ai_service.base_url = Some(ai.base_url());
    let c = available(config, Arc::new(MemoryStorage::new())).await;

    c.on_incoming_call("caller-1", CallerInfo::new("", "Jane Doe"));
    c.accept_call().await.unwrap();
    c.end_call().await.unwrap();

    assert!(ai.wait_for_notices(2, WAIT).await);
    let mut actions: Vec<String> = ai.notices().into_iter().map(|n| n.action).collect();
    actions.sort();
    assert_eq!(actions, vec!["start".to_string(), "stop".to_string()]);
    assert!(ai.notices().iter().all(|n| n.body["callerId"] == "caller-1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_manual_accept_racing_auto_accept_keeps_one_socket() {
    let gateway = MockGateway::start().await;
    let mut config = config(&gateway);
    config.agent.auto_accept_enabled = true;
    config.agent.auto_accept_delay_ms = 1;
    let c = available(config, Arc::new(MemoryStorage::new())).await;

    c.on_incoming_call("caller-1", CallerInfo::new("", "Jane Doe"));
    tokio::time::sleep(Duration::from_millis(1)).await;
    // Either path may claim the call; the other must leave it alone.
    let _ = c.accept_call().await;

    assert!(wait_for_call_state(&c, CallState::Active).await);
    assert!(c.connection().wait_for(ConnectionState::Connected, WAIT).await);
    assert!(gateway.wait_until(WAIT, |g| g.received_of("accept_call").len() == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(gateway.received_of("accept_call").len(), 1);
    assert_eq!(gateway.open_connections(), 1);
    assert_eq!(gateway.total_connections(), 1);
    assert!(!c.auto_accept_pending());
    assert_eq!(c.session().map(|s| s.caller_id), Some("caller-1".to_string()));
}
