//! Reconnecting WebSocket connection to the call-routing gateway.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use call_desk_core::{ConnectionState, TimerCategory, config::ConnectionConfig};
use futures::{Sink, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{backoff::Backoff, protocol::OutboundMessage};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid gateway URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// A text frame tagged with the connection generation it arrived on.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub generation: u64,
    pub text: String,
}

/// An outbound message stamped with the socket it was accepted for.
#[derive(Debug)]
struct Queued {
    socket: u64,
    message: OutboundMessage,
}

struct ActiveConnection {
    generation: u64,
    outbound: mpsc::UnboundedSender<Queued>,
    /// Sequence number of the open socket, 0 while none is open.
    socket: Arc<AtomicU64>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Shared {
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    inbound: mpsc::UnboundedSender<InboundFrame>,
    generation: AtomicU64,
    active: Mutex<Option<ActiveConnection>>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    /// Publish `next` unless `generation` has been superseded.
    ///
    /// The check runs under the watch lock, the same lock `connect` and
    /// `disconnect` bump the generation under.
    fn set_state(&self, generation: u64, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if !self.is_current(generation) || *state == next {
                return false;
            }
            tracing::debug!(generation, from = ?*state, to = ?next, "Connection state changed");
            *state = next;
            true
        });
    }
}

/// Handle to the gateway connection. Cheap to clone.
///
/// Every `connect` and `disconnect` starts a new generation. Frames are
/// delivered tagged with the generation they arrived on, so consumers can
/// discard anything a superseded socket delivers after the fact.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a disconnected manager and the receiving end of its inbound
    /// frame channel.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> (Self, mpsc::UnboundedReceiver<InboundFrame>) {
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let manager = Self {
            shared: Arc::new(Shared {
                config,
                state,
                inbound,
                generation: AtomicU64::new(0),
                active: Mutex::new(None),
            }),
        };
        (manager, inbound_rx)
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveConnection>> {
        self.shared.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build the gateway URL for one caller.
    ///
    /// # Errors
    /// Returns error if the configured base URL and path do not form a URL.
    pub fn target_url(&self, agent_id: &str, caller_id: &str, port: u16) -> Result<Url, TransportError> {
        let cfg = &self.shared.config;
        let base = cfg.base_url.trim_end_matches('/');
        let mut url = Url::parse(&format!("{base}:{port}{}", cfg.call_center_path))?;
        url.query_pairs_mut()
            .append_pair("callerId", caller_id)
            .append_pair("agentId", agent_id)
            .append_pair("role", &cfg.role);
        Ok(url)
    }

    /// Open a connection for `caller_id` and keep it open until `disconnect`.
    ///
    /// Does nothing if a connection is already open or being opened.
    /// Returns the generation of the live connection.
    ///
    /// # Errors
    /// Returns error if the gateway URL cannot be built.
    pub fn connect(&self, agent_id: &str, caller_id: &str, port: u16) -> Result<u64, TransportError> {
        let mut slot = self.lock_active();
        if let Some(active) = slot.as_ref()
            && !active.task.is_finished()
            && self.state() != ConnectionState::Error
        {
            tracing::debug!(generation = active.generation, "Already connected or connecting");
            return Ok(active.generation);
        }

        let url = self.target_url(agent_id, caller_id, port)?;
        if let Some(spent) = slot.take() {
            spent.cancel.cancel();
        }

        let mut generation = 0;
        self.shared.state.send_modify(|state| {
            generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
            *state = ConnectionState::Connecting;
        });

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let socket = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();

        tracing::info!(generation, %url, caller_id, "Connecting to gateway");

        let task = tokio::spawn(drive(
            Arc::clone(&self.shared),
            generation,
            url,
            outbound_rx,
            Arc::clone(&socket),
            cancel.clone(),
        ));

        *slot = Some(ActiveConnection {
            generation,
            outbound,
            socket,
            cancel,
            task,
        });
        Ok(generation)
    }

    /// Close the connection and stop reconnecting. Idempotent.
    ///
    /// Frames still in flight from the closed socket carry a stale
    /// generation once this returns.
    pub fn disconnect(&self) {
        let active = self.lock_active().take();

        self.shared.state.send_modify(|state| {
            self.shared.generation.fetch_add(1, Ordering::AcqRel);
            *state = ConnectionState::Disconnected;
        });

        if let Some(active) = active {
            active.socket.store(0, Ordering::Release);
            active.cancel.cancel();
            tracing::info!(generation = active.generation, "Disconnected from gateway");
        }
    }

    /// Queue a message on the open socket.
    ///
    /// Returns `false` and drops the message if no socket is open. A queued
    /// message is only ever written to the socket that was open when it was
    /// queued; if that socket closes first, the message is discarded.
    pub fn send_message(&self, message: OutboundMessage) -> bool {
        let slot = self.lock_active();
        let socket = slot
            .as_ref()
            .map_or(0, |active| active.socket.load(Ordering::Acquire));
        match slot.as_ref() {
            Some(active) if socket != 0 => active.outbound.send(Queued { socket, message }).is_ok(),
            _ => {
                tracing::warn!(?message, "Socket not open, dropping outbound message");
                false
            }
        }
    }

    /// Whether frames tagged `generation` belong to the current connection.
    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        self.shared.is_current(generation)
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the connection reaches `target`.
    ///
    /// Returns `false` if it did not within `timeout`.
    pub async fn wait_for(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.watch_state();
        tokio::time::timeout(timeout, rx.wait_for(|state| *state == target))
            .await
            .is_ok_and(|res| res.is_ok())
    }
}

/// Why a socket stopped pumping.
enum Closed {
    Cancelled,
    Remote,
    Stale,
    Error(String),
}

/// Connect, pump, and reconnect with backoff until cancelled or out of
/// attempts.
async fn drive(
    shared: Arc<Shared>,
    generation: u64,
    url: Url,
    mut outbound_rx: mpsc::UnboundedReceiver<Queued>,
    open_socket: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    let cfg = &shared.config;
    let mut backoff = Backoff::new(
        cfg.reconnect_base(),
        cfg.reconnect_max_delay(),
        cfg.max_reconnect_attempts,
    );

    let mut sockets = 0u64;

    loop {
        shared.set_state(generation, ConnectionState::Connecting);

        let connected = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            res = connect_async(url.as_str()) => res,
        };

        match connected {
            Ok((socket, _response)) => {
                backoff.reset();
                sockets += 1;
                open_socket.store(sockets, Ordering::Release);
                shared.set_state(generation, ConnectionState::Connected);
                tracing::info!(generation, socket = sockets, "Gateway connection open");

                let closed = pump(&shared, generation, sockets, socket, &mut outbound_rx, &cancel).await;
                open_socket.store(0, Ordering::Release);

                match closed {
                    Closed::Cancelled => return,
                    Closed::Remote => tracing::warn!(generation, "Gateway closed the connection"),
                    Closed::Stale => tracing::warn!(
                        generation,
                        timer = %TimerCategory::Heartbeat,
                        "No traffic from gateway, dropping connection"
                    ),
                    Closed::Error(err) => tracing::warn!(generation, error = %err, "Gateway connection failed"),
                }

                // The next socket is a fresh session.
                let dropped = discard_queued(&mut outbound_rx);
                if dropped > 0 {
                    tracing::warn!(generation, dropped, "Dropped messages queued for the closed socket");
                }
            }
            Err(err) => {
                tracing::warn!(generation, attempt = backoff.attempt(), error = %err, "Failed to connect to gateway");
            }
        }

        let Some(delay) = backoff.next_delay() else {
            tracing::error!(generation, attempts = backoff.attempt(), "Giving up on gateway connection");
            shared.set_state(generation, ConnectionState::Error);
            return;
        };

        shared.set_state(generation, ConnectionState::Disconnected);
        tracing::info!(
            generation,
            attempt = backoff.attempt(),
            ?delay,
            timer = %TimerCategory::ReconnectBackoff,
            "Reconnecting"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

async fn pump(
    shared: &Shared,
    generation: u64,
    socket_seq: u64,
    socket: Socket,
    outbound_rx: &mut mpsc::UnboundedReceiver<Queued>,
    cancel: &CancellationToken,
) -> Closed {
    let (mut sink, mut stream) = socket.split();

    let every = shared.config.heartbeat_interval();
    let mut heartbeat = tokio::time::interval_at(Instant::now() + every, every);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let liveness = shared.config.heartbeat_timeout();
    let mut last_seen = Instant::now();

    loop {
        let deadline = liveness.map(|timeout| last_seen + timeout);

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                // Flush what was queued before the disconnect, then close.
                while let Ok(queued) = outbound_rx.try_recv() {
                    if queued.socket == socket_seq && send_json(&mut sink, &queued.message).await.is_err() {
                        break;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                return Closed::Cancelled;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    last_seen = Instant::now();
                    let _ = shared.inbound.send(InboundFrame {
                        generation,
                        text: text.to_string(),
                    });
                }
                Some(Ok(Message::Close(_))) | None => return Closed::Remote,
                Some(Ok(_)) => last_seen = Instant::now(),
                Some(Err(err)) => return Closed::Error(err.to_string()),
            },
            Some(queued) = outbound_rx.recv() => {
                if queued.socket != socket_seq {
                    tracing::debug!(generation, message = ?queued.message, "Discarding message queued for an earlier socket");
                    continue;
                }
                if let Err(err) = send_json(&mut sink, &queued.message).await {
                    return Closed::Error(err);
                }
            }
            _ = heartbeat.tick() => {
                if let Err(err) = send_json(&mut sink, &OutboundMessage::Heartbeat).await {
                    return Closed::Error(err);
                }
                tracing::trace!(generation, timer = %TimerCategory::Heartbeat, "Heartbeat sent");
            }
            () = sleep_until(deadline) => return Closed::Stale,
        }
    }
}

async fn send_json<S>(sink: &mut S, message: &OutboundMessage) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(message).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json.into())).await.map_err(|e| e.to_string())
}

fn discard_queued(outbound_rx: &mut mpsc::UnboundedReceiver<Queued>) -> usize {
    let mut dropped = 0;
    while outbound_rx.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ConnectionManager {
        let config = ConnectionConfig {
            base_url: "ws://gateway.local".to_string(),
            ..ConnectionConfig::default()
        };
        ConnectionManager::new(config).0
    }

    #[test]
    fn test_target_url() {
        let url = manager().target_url("agent-7", "caller 1", 8000).unwrap();
        assert_eq!(url.host_str(), Some("gateway.local"));
        assert_eq!(url.port(), Some(8000));
        assert_eq!(url.path(), "/ws/call-center");

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("callerId".to_string(), "caller 1".to_string()),
                ("agentId".to_string(), "agent-7".to_string()),
                ("role".to_string(), "agent".to_string()),
            ]
        );
    }

    #[test]
    fn test_send_without_socket_is_dropped() {
        let manager = manager();
        assert!(!manager.send_message(OutboundMessage::Heartbeat));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_disconnect_is_idempotent_and_bumps_generation() {
        let manager = manager();
        let before = manager.generation();
        manager.disconnect();
        manager.disconnect();
        assert_eq!(manager.generation(), before + 2);
        assert!(!manager.is_current(before));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
