//! Connection and routing against an in-process gateway.

use std::{sync::Arc, time::Duration};

use call_desk_core::{ConnectionState, InsightStore, config::ConnectionConfig};
use call_desk_testkit::MockGateway;
use call_desk_transport::{ConnectionManager, MessageRouter, OutboundMessage};

const WAIT: Duration = Duration::from_secs(5);

fn config(gateway: &MockGateway) -> ConnectionConfig {
    ConnectionConfig {
        base_url: gateway.base_url(),
        reconnect_base_ms: 20,
        reconnect_max_delay_ms: 100,
        max_reconnect_attempts: 3,
        heartbeat_interval_ms: 50,
        ..ConnectionConfig::default()
    }
}

struct Client {
    manager: ConnectionManager,
    router: Arc<MessageRouter>,
    store: Arc<InsightStore>,
}

fn client(config: ConnectionConfig) -> Client {
    let store = Arc::new(InsightStore::new());
    let (manager, inbound) = ConnectionManager::new(config);
    let router = Arc::new(MessageRouter::new(Arc::clone(&store), manager.clone()));
    let _task = Arc::clone(&router).spawn(inbound);
    Client {
        manager,
        router,
        store,
    }
}

#[tokio::test]
async fn test_connect_sends_handshake_and_heartbeats() {
    let gateway = MockGateway::start().await;
    let c = client(config(&gateway));

    c.manager.connect("agent-7", "caller-1", gateway.port()).unwrap();
    assert!(c.manager.wait_for(ConnectionState::Connected, WAIT).await);

    assert!(gateway.wait_until(WAIT, |g| g.open_connections() == 1).await);
    let handshake = &gateway.handshakes()[0];
    assert_eq!(handshake.get("callerId").map(String::as_str), Some("caller-1"));
    assert_eq!(handshake.get("agentId").map(String::as_str), Some("agent-7"));
    assert_eq!(handshake.get("role").map(String::as_str), Some("agent"));

    assert!(gateway.wait_until(WAIT, |g| g.received_of("heartbeat").len() >= 2).await);

    let deadline = tokio::time::Instant::now() + WAIT;
    while c.router.heartbeat_acks() == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(c.router.heartbeat_acks() > 0);

    c.manager.disconnect();
}

#[tokio::test]
async fn test_outbound_and_inbound_messages() {
    let gateway = MockGateway::start().await;
    let c = client(config(&gateway));

    c.manager.connect("agent-7", "caller-1", gateway.port()).unwrap();
    assert!(c.manager.wait_for(ConnectionState::Connected, WAIT).await);

    assert!(c.manager.send_message(OutboundMessage::accept_call("caller-1", "agent-7", "Jane Doe")));
    assert!(gateway.wait_until(WAIT, |g| !g.received_of("accept_call").is_empty()).await);
    let accept = &gateway.received_of("accept_call")[0];
    assert_eq!(accept.message["callerId"], "caller-1");
    assert_eq!(accept.message["callerName"], "Jane Doe");

    assert!(gateway.wait_until(WAIT, |g| g.open_connections() == 1).await);
    gateway.send_to_all(r#"{"type":"sentiment","data":{"sentiment":"negative","score":-0.6}}"#);

    let deadline = tokio::time::Instant::now() + WAIT;
    while c.store.snapshot().sentiment.is_none() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(c.store.snapshot().sentiment.unwrap().label, "negative");

    c.manager.disconnect();
}

#[tokio::test]
async fn test_disconnect_then_connect_keeps_one_socket() {
    let gateway = MockGateway::start().await;
    let c = client(config(&gateway));

    c.manager.connect("agent-7", "caller-1", gateway.port()).unwrap();
    assert!(c.manager.wait_for(ConnectionState::Connected, WAIT).await);

    c.manager.disconnect();
    assert_eq!(c.manager.state(), ConnectionState::Disconnected);
    c.manager.connect("agent-7", "caller-2", gateway.port()).unwrap();
    assert!(c.manager.wait_for(ConnectionState::Connected, WAIT).await);

    assert!(gateway.wait_until(WAIT, |g| g.total_connections() == 2 && g.open_connections() == 1).await);
    assert_eq!(
        gateway.handshakes()[1].get("callerId").map(String::as_str),
        Some("caller-2")
    );

    c.manager.disconnect();
}

#[tokio::test]
async fn test_connect_twice_is_a_no_op() {
    let gateway = MockGateway::start().await;
    let c = client(config(&gateway));

    let first = c.manager.connect("agent-7", "caller-1", gateway.port()).unwrap();
    let second = c.manager.connect("agent-7", "caller-1", gateway.port()).unwrap();
    assert_eq!(first, second);

    assert!(c.manager.wait_for(ConnectionState::Connected, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(gateway.total_connections(), 1);

    c.manager.disconnect();
}

#[tokio::test]
async fn test_reconnects_after_server_close() {
    let gateway = MockGateway::start().await;
    let c = client(config(&gateway));

    let generation = c.manager.connect("agent-7", "caller-1", gateway.port()).unwrap();
    assert!(gateway.wait_until(WAIT, |g| g.open_connections() == 1).await);

    gateway.kick_all();
    assert!(gateway.wait_until(WAIT, |g| g.total_connections() == 2 && g.open_connections() == 1).await);
    assert!(c.manager.wait_for(ConnectionState::Connected, WAIT).await);
    assert!(c.manager.is_current(generation));

    c.manager.disconnect();
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let c = client(ConnectionConfig {
        base_url: "ws://127.0.0.1".to_string(),
        reconnect_base_ms: 10,
        reconnect_max_delay_ms: 20,
        max_reconnect_attempts: 2,
        ..ConnectionConfig::default()
    });

    c.manager.connect("agent-7", "caller-1", port).unwrap();
    assert!(c.manager.wait_for(ConnectionState::Error, WAIT).await);
    assert!(!c.manager.send_message(OutboundMessage::Heartbeat));

    // A fresh connect is allowed once the previous attempt gave up.
    c.manager.connect("agent-7", "caller-1", port).unwrap();
    assert_ne!(c.manager.state(), ConnectionState::Error);
    c.manager.disconnect();
}

#[tokio::test]
async fn test_messages_queued_for_closed_socket_are_not_resent() {
    let gateway = MockGateway::start().await;
    let c = client(ConnectionConfig {
        heartbeat_interval_ms: 60_000,
        ..config(&gateway)
    });

    c.manager.connect("agent-7", "caller-1", gateway.port()).unwrap();
    assert!(c.manager.wait_for(ConnectionState::Connected, WAIT).await);
    assert!(gateway.wait_until(WAIT, |g| g.open_connections() == 1).await);

    gateway.kick_all();
    // No await in between: the client has not seen the close yet.
    for _ in 0..500 {
        assert!(c.manager.send_message(OutboundMessage::accept_call("caller-1", "agent-7", "Jane Doe")));
    }

    assert!(gateway.wait_until(WAIT, |g| g.total_connections() == 2 && g.open_connections() == 1).await);
    assert!(c.manager.wait_for(ConnectionState::Connected, WAIT).await);
    assert!(c.manager.send_message(OutboundMessage::end_call("caller-1", "agent-7", 0)));
    assert!(gateway.wait_until(WAIT, |g| !g.received_of("end_call").is_empty()).await);

    let second = gateway.received_of("end_call")[0].connection;
    assert!(
        gateway
            .received_of("accept_call")
            .iter()
            .all(|r| r.connection != second)
    );

    c.manager.disconnect();
}

#[tokio::test]
async fn test_silent_gateway_is_dropped_and_redialed() {
    let gateway = MockGateway::start().await;
    gateway.set_silent(true);
    let c = client(ConnectionConfig {
        heartbeat_timeout_ms: Some(200),
        ..config(&gateway)
    });

    let generation = c.manager.connect("agent-7", "caller-1", gateway.port()).unwrap();
    assert!(gateway.wait_until(WAIT, |g| g.total_connections() >= 3).await);

    assert!(c.manager.is_current(generation));
    assert_ne!(c.manager.state(), ConnectionState::Error);
    assert!(!gateway.received_of("heartbeat").is_empty());
    assert_eq!(c.router.heartbeat_acks(), 0);

    c.manager.disconnect();
}

#[tokio::test]
async fn test_answered_heartbeats_keep_socket_alive() {
    let gateway = MockGateway::start().await;
    let c = client(ConnectionConfig {
        heartbeat_timeout_ms: Some(400),
        ..config(&gateway)
    });

    c.manager.connect("agent-7", "caller-1", gateway.port()).unwrap();
    assert!(c.manager.wait_for(ConnectionState::Connected, WAIT).await);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(gateway.total_connections(), 1);
    assert_eq!(c.manager.state(), ConnectionState::Connected);

    c.manager.disconnect();
}
