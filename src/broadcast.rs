//! Live subscriber set and the periodic snapshot push.
//!
//! Each subscriber owns a bounded outbound queue drained by its own writer
//! task. The hub only ever `try_send`s, so one slow or dead connection never
//! holds up the tick for anybody else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::SUBSCRIBER_QUEUE_CAPACITY;
use crate::game_service::GameService;
use crate::types::Snapshot;

pub const CLOSE_CODE_GOING_AWAY: u16 = 1001;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundMessage {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Skip this message for a subscriber whose queue is full.
    DropOnFull,
    /// Treat a full queue like a dead connection.
    DisconnectOnFull,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Connecting,
    Open,
    Closed,
    Failed,
}

impl SubscriptionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    Dropped,
    Removed,
    Unknown,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub queued: usize,
    pub dropped: usize,
    pub removed: usize,
}

#[derive(Debug)]
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<OutboundMessage>,
}

pub struct BroadcastHub {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<OutboundMessage>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    shutdown: watch::Sender<bool>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(SUBSCRIBER_QUEUE_CAPACITY)
    }
}

impl BroadcastHub {
    pub fn new(queue_capacity: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            shutdown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, mpsc::Sender<OutboundMessage>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `None` once `shutdown` has been called. The flag is checked
    /// under the subscriber lock, so a subscriber either lands in the set
    /// before `shutdown` drains it or is refused.
    pub fn subscribe(&self) -> Option<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, receiver) = mpsc::channel(self.queue_capacity);
        let count = {
            let mut subscribers = self.lock();
            if self.is_shutting_down() {
                return None;
            }
            subscribers.insert(id, tx);
            subscribers.len()
        };
        debug!(subscriber_id = id, subscribers = count, "subscriber added");
        Some(Subscription { id, receiver })
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            debug!(subscriber_id = id, "subscriber removed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn send_to(&self, id: u64, message: OutboundMessage, policy: QueuePolicy) -> SendOutcome {
        let mut subscribers = self.lock();
        let Some(tx) = subscribers.get(&id) else {
            return SendOutcome::Unknown;
        };
        let outcome = classify(tx.try_send(message), policy);
        if outcome == SendOutcome::Removed {
            subscribers.remove(&id);
            debug!(subscriber_id = id, "subscriber dropped after failed send");
        }
        outcome
    }

    pub fn broadcast(&self, payload: &str, policy: QueuePolicy) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut subscribers = self.lock();
        subscribers.retain(|id, tx| {
            match classify(tx.try_send(OutboundMessage::Text(payload.to_string())), policy) {
                SendOutcome::Queued => report.queued += 1,
                SendOutcome::Dropped => report.dropped += 1,
                SendOutcome::Removed | SendOutcome::Unknown => {
                    debug!(subscriber_id = *id, "subscriber dropped after failed send");
                    report.removed += 1;
                    return false;
                }
            }
            true
        });
        report
    }

    pub fn publish_snapshot(&self, snapshot: &Snapshot) -> BroadcastReport {
        match serde_json::to_string(snapshot) {
            Ok(payload) => self.broadcast(&payload, QueuePolicy::DropOnFull),
            Err(error) => {
                warn!(%error, "failed to serialize snapshot");
                BroadcastReport::default()
            }
        }
    }

    /// Sends the current snapshot to a single subscriber right after it joins.
    pub fn send_snapshot_to(&self, id: u64, snapshot: &Snapshot) -> SendOutcome {
        match serde_json::to_string(snapshot) {
            Ok(payload) => self.send_to(id, OutboundMessage::Text(payload), QueuePolicy::DisconnectOnFull),
            Err(error) => {
                warn!(%error, "failed to serialize snapshot");
                SendOutcome::Dropped
            }
        }
    }

    /// Starts the repeating snapshot push. The task ends once `shutdown` is
    /// called.
    pub fn spawn_ticker(self: &Arc<Self>, service: Arc<GameService>, tick: Duration) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                if *shutdown_rx.borrow() {
                    break;
                }
                if hub.subscriber_count() == 0 {
                    continue;
                }
                let report = hub.publish_snapshot(&service.snapshot());
                if report.dropped > 0 || report.removed > 0 {
                    debug!(
                        queued = report.queued,
                        dropped = report.dropped,
                        removed = report.removed,
                        "snapshot tick"
                    );
                }
            }
            debug!("snapshot ticker stopped");
        })
    }

    /// Stops the ticker and closes every subscription.
    pub fn shutdown(&self) {
        // Set before draining; `subscribe` reads it under the same lock.
        self.shutdown.send_replace(true);
        let subscribers: Vec<(u64, mpsc::Sender<OutboundMessage>)> = self.lock().drain().collect();
        info!(subscribers = subscribers.len(), "closing subscriptions");
        for (_, tx) in subscribers {
            let _ = tx.try_send(OutboundMessage::Close {
                code: CLOSE_CODE_GOING_AWAY,
                reason: "server shutting down".to_string(),
            });
        }
    }
}

/// Waits for a ticker started by `spawn_ticker`. Returns false, after logging,
/// when the task panicked or was cancelled.
pub async fn join_ticker(ticker: JoinHandle<()>) -> bool {
    match ticker.await {
        Ok(()) => true,
        Err(error) => {
            warn!(%error, "snapshot ticker ended abnormally");
            false
        }
    }
}

fn classify(result: Result<(), TrySendError<OutboundMessage>>, policy: QueuePolicy) -> SendOutcome {
    match result {
        Ok(()) => SendOutcome::Queued,
        Err(TrySendError::Full(_)) if policy == QueuePolicy::DropOnFull => SendOutcome::Dropped,
        Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => SendOutcome::Removed,
    }
}
