//! Broadcast + snapshot store for live-call insights.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::insights::{
    CustomerProfile, InsightUpdate, Intent, KnowledgeArticle, LiveInsights, Priority, Sentiment,
    SuggestedAction, TranscriptEntry,
};

/// Transcript lines kept per call.
const MAX_TRANSCRIPT_ENTRIES: usize = 1000;

#[derive(Default)]
struct Inner {
    sentiment: Option<Sentiment>,
    priority: Option<Priority>,
    intent: Option<Intent>,
    actions: Vec<SuggestedAction>,
    knowledge: Vec<KnowledgeArticle>,
    transcript: VecDeque<TranscriptEntry>,
    customer: Option<CustomerProfile>,
}

/// Per-call insight state with change broadcast.
///
/// Writes are equality-gated: applying a payload equal to what is already
/// stored changes nothing and notifies nobody. All writes and `clear()`
/// serialize on one lock, so a guarded write either lands before a clear
/// or is rejected after it.
pub struct InsightStore {
    inner: Mutex<Inner>,
    sender: broadcast::Sender<InsightUpdate>,
}

impl Default for InsightStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InsightStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            inner: Mutex::new(Inner {
                transcript: VecDeque::with_capacity(64),
                ..Inner::default()
            }),
            sender,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply an update unconditionally.
    ///
    /// Returns `true` if stored state changed.
    pub fn apply(&self, update: InsightUpdate) -> bool {
        self.apply_if(update, || true)
    }

    /// Apply an update only if `is_current` still holds once the store lock
    /// is taken.
    ///
    /// Returns `true` if stored state changed.
    pub fn apply_if(&self, update: InsightUpdate, is_current: impl FnOnce() -> bool) -> bool {
        let mut inner = self.lock();
        if !is_current() {
            tracing::debug!("Dropping insight update from a superseded session");
            return false;
        }

        let changed = match &update {
            InsightUpdate::Sentiment(s) => replace_if_changed(&mut inner.sentiment, s),
            InsightUpdate::Priority(p) => replace_if_changed(&mut inner.priority, p),
            InsightUpdate::Intent(i) => replace_if_changed(&mut inner.intent, i),
            InsightUpdate::Customer(c) => replace_if_changed(&mut inner.customer, c),
            InsightUpdate::Actions(a) => {
                if inner.actions == *a {
                    false
                } else {
                    inner.actions.clone_from(a);
                    true
                }
            }
            InsightUpdate::Knowledge(k) => {
                if inner.knowledge == *k {
                    false
                } else {
                    inner.knowledge.clone_from(k);
                    true
                }
            }
            InsightUpdate::Transcript(entry) => push_transcript(&mut inner.transcript, entry),
            InsightUpdate::Cleared => {
                reset(&mut inner);
                true
            }
        };

        if changed {
            let _ = self.sender.send(update);
        }
        changed
    }

    /// Drop all per-call state.
    pub fn clear(&self) {
        let mut inner = self.lock();
        reset(&mut inner);
        let _ = self.sender.send(InsightUpdate::Cleared);
    }

    /// Currently stored customer, if any.
    #[must_use]
    pub fn customer(&self) -> Option<CustomerProfile> {
        self.lock().customer.clone()
    }

    /// Get a snapshot of everything stored.
    #[must_use]
    pub fn snapshot(&self) -> LiveInsights {
        let inner = self.lock();
        LiveInsights {
            sentiment: inner.sentiment.clone(),
            priority: inner.priority.clone(),
            intent: inner.intent.clone(),
            actions: inner.actions.clone(),
            knowledge: inner.knowledge.clone(),
            transcript: inner.transcript.iter().cloned().collect(),
            customer: inner.customer.clone(),
        }
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<InsightUpdate> {
        self.sender.subscribe()
    }

    /// Stream of live updates. Lagged receivers skip what they missed.
    #[must_use]
    pub fn updates_stream(&self) -> futures::stream::BoxStream<'static, InsightUpdate> {
        BroadcastStream::new(self.subscribe())
            .filter_map(|res| async move { res.ok() })
            .boxed()
    }

    /// Stream that yields the stored transcript first, then live lines.
    #[must_use]
    pub fn transcript_plus_stream(&self) -> futures::stream::BoxStream<'static, TranscriptEntry> {
        // Subscribe under the lock so no line falls between history and live.
        let (history, rx) = {
            let inner = self.lock();
            let history: Vec<TranscriptEntry> = inner.transcript.iter().cloned().collect();
            (history, self.sender.subscribe())
        };

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move {
            match res {
                Ok(InsightUpdate::Transcript(entry)) => Some(entry),
                _ => None,
            }
        });

        hist.chain(live).boxed()
    }
}

fn replace_if_changed<T: Clone + PartialEq>(slot: &mut Option<T>, value: &T) -> bool {
    if slot.as_ref() == Some(value) {
        return false;
    }
    *slot = Some(value.clone());
    true
}

/// Interim lines from the same speaker are superseded by the next line.
fn push_transcript(transcript: &mut VecDeque<TranscriptEntry>, entry: &TranscriptEntry) -> bool {
    if let Some(last) = transcript.back_mut() {
        if last == entry {
            return false;
        }
        if !last.is_final && last.speaker == entry.speaker {
            *last = entry.clone();
            return true;
        }
    }

    while transcript.len() >= MAX_TRANSCRIPT_ENTRIES {
        transcript.pop_front();
    }
    transcript.push_back(entry.clone());
    true
}

fn reset(inner: &mut Inner) {
    inner.sentiment = None;
    inner.priority = None;
    inner.intent = None;
    inner.actions.clear();
    inner.knowledge.clear();
    inner.transcript.clear();
    inner.customer = None;
}
