//! Routes inbound gateway frames into the insight store.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use call_desk_core::{InsightStore, InsightUpdate, insights::CustomerProfile};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    connection::{ConnectionManager, InboundFrame},
    protocol::{CustomerFields, InboundEvent, now_ms},
};

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Stored state changed.
    Applied,
    /// Payload equal to what is stored.
    Unchanged,
    /// Arrived on a connection that has since been replaced.
    Stale,
    /// Valid but carries nothing to store.
    Ignored,
    /// Could not be parsed.
    Malformed,
}

/// Parses frames, normalizes them and writes them to the store.
///
/// Writes only land while the frame's connection generation is still
/// current, checked under the store lock.
pub struct MessageRouter {
    store: Arc<InsightStore>,
    manager: ConnectionManager,
    heartbeat_acks: AtomicU64,
}

impl MessageRouter {
    #[must_use]
    pub fn new(store: Arc<InsightStore>, manager: ConnectionManager) -> Self {
        Self {
            store,
            manager,
            heartbeat_acks: AtomicU64::new(0),
        }
    }

    /// Drain `inbound` until every sender is gone.
    #[must_use]
    pub fn spawn(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<InboundFrame>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                self.route(&frame);
            }
            tracing::debug!("Inbound channel closed, router stopping");
        })
    }

    /// Handle one frame.
    pub fn route(&self, frame: &InboundFrame) -> RouteOutcome {
        let event = match InboundEvent::parse(&frame.text, now_ms()) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(generation = frame.generation, error = %err, "Dropping malformed frame");
                return RouteOutcome::Malformed;
            }
        };

        let update = match event {
            InboundEvent::Sentiment(s) => InsightUpdate::Sentiment(s),
            InboundEvent::Priority(p) => InsightUpdate::Priority(p),
            InboundEvent::Intent(i) => InsightUpdate::Intent(i),
            InboundEvent::Actions(a) => InsightUpdate::Actions(a),
            InboundEvent::Knowledge(k) => InsightUpdate::Knowledge(k),
            InboundEvent::Transcript(entry) => {
                if entry.text.trim().is_empty() {
                    return RouteOutcome::Ignored;
                }
                InsightUpdate::Transcript(entry)
            }
            InboundEvent::Customer(fields) => {
                let existing = self.store.customer();
                InsightUpdate::Customer(resolve_customer(fields, existing.as_ref(), now_ms()))
            }
            InboundEvent::HeartbeatAck => {
                self.heartbeat_acks.fetch_add(1, Ordering::Relaxed);
                return RouteOutcome::Ignored;
            }
            InboundEvent::Unknown(kind) => {
                tracing::debug!(kind, "Ignoring unhandled frame type");
                return RouteOutcome::Ignored;
            }
        };

        let generation = frame.generation;
        let mut stale = false;
        let changed = self.store.apply_if(update, || {
            stale = !self.manager.is_current(generation);
            !stale
        });

        if stale {
            RouteOutcome::Stale
        } else if changed {
            RouteOutcome::Applied
        } else {
            RouteOutcome::Unchanged
        }
    }

    /// Heartbeat acknowledgements seen so far.
    #[must_use]
    pub fn heartbeat_acks(&self) -> u64 {
        self.heartbeat_acks.load(Ordering::Relaxed)
    }
}

/// Pick a stable id for the caller.
///
/// Explicit ids win. Otherwise an already stored profile with the same name
/// keeps its id, and a new one is minted from the name and `now_ms`.
fn resolve_customer(
    fields: CustomerFields,
    existing: Option<&CustomerProfile>,
    now_ms: i64,
) -> CustomerProfile {
    let id = fields
        .id
        .or(fields.customer_id)
        .or_else(|| {
            existing
                .filter(|c| c.name.trim().eq_ignore_ascii_case(fields.name.trim()))
                .map(|c| c.id.clone())
        })
        .unwrap_or_else(|| format!("CUST-{}-{now_ms}", id_slug(&fields.name)));

    CustomerProfile {
        id,
        name: fields.name,
        phone: fields.phone,
        email: fields.email,
        tier: fields.tier,
        account_number: fields.account_number,
    }
}

fn id_slug(name: &str) -> String {
    let slug = name
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(str::to_ascii_uppercase)
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() { "UNKNOWN".to_string() } else { slug }
}
