use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::claims::ClaimProgress;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PING_TIMEOUT: Duration = Duration::from_secs(120);

/// Messages delivered to a subscriber's socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberEvent {
    Update(ClaimProgress),
    Ping,
    Close { reason: &'static str },
}

/// A live subscription handed to the socket task.
pub struct Subscription {
    pub id: u64,
    pub claim_idx: u64,
    pub events: mpsc::UnboundedReceiver<SubscriberEvent>,
}

struct Subscriber {
    id: u64,
    claim_idx: u64,
    sender: mpsc::UnboundedSender<SubscriberEvent>,
    last_seen: Mutex<Instant>,
}

#[derive(Default)]
struct HubInner {
    subscribers: Vec<Arc<Subscriber>>,
    last_broadcast: Option<ClaimProgress>,
    next_id: u64,
}

/// Fan-out channel for claim progress.
///
/// Producers call [`NotificationHub::broadcast`]; each subscriber receives
/// the update and is closed once the confirmed watermark reaches its claim.
/// The lock is never held across socket I/O: delivery goes through
/// unbounded channels drained by the per-socket tasks.
#[derive(Default)]
pub struct NotificationHub {
    inner: Mutex<HubInner>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber interested in `claim_idx`. The last
    /// broadcast, if any, is replayed immediately.
    pub fn subscribe(&self, claim_idx: u64) -> Subscription {
        let (sender, events) = mpsc::unbounded_channel();

        let mut inner = self.inner.lock().expect("hub lock poisoned");
        inner.next_id += 1;
        let subscriber = Arc::new(Subscriber {
            id: inner.next_id,
            claim_idx,
            sender,
            last_seen: Mutex::new(Instant::now()),
        });

        let mut keep = true;
        if let Some(last) = inner.last_broadcast {
            keep = Self::deliver(&subscriber, last);
        }
        if keep {
            inner.subscribers.push(subscriber.clone());
        }

        Subscription {
            id: subscriber.id,
            claim_idx,
            events,
        }
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().expect("hub lock poisoned");
        inner.subscribers.retain(|sub| sub.id != id);
    }

    /// Records keepalive traffic from the subscriber's socket.
    pub fn seen(&self, id: u64) {
        let inner = self.inner.lock().expect("hub lock poisoned");
        if let Some(sub) = inner.subscribers.iter().find(|sub| sub.id == id) {
            *sub.last_seen.lock().expect("subscriber lock poisoned") = Instant::now();
        }
    }

    /// Replaces the last-broadcast slot and delivers the update to a
    /// snapshot of the subscriber list; subscribers whose claim confirmed
    /// are closed and removed.
    pub fn broadcast(&self, progress: ClaimProgress) {
        let subscribers: Vec<Arc<Subscriber>> = {
            let mut inner = self.inner.lock().expect("hub lock poisoned");
            inner.last_broadcast = Some(progress);
            inner.subscribers.clone()
        };

        let mut closed = Vec::new();
        for subscriber in &subscribers {
            if !Self::deliver(subscriber, progress) {
                closed.push(subscriber.id);
            }
        }

        if !closed.is_empty() {
            let mut inner = self.inner.lock().expect("hub lock poisoned");
            inner.subscribers.retain(|sub| !closed.contains(&sub.id));
        }
    }

    #[must_use]
    pub fn last_broadcast(&self) -> Option<ClaimProgress> {
        self.inner.lock().expect("hub lock poisoned").last_broadcast
    }

    /// Clears the last-broadcast slot. Used when the pipeline shuts down.
    pub fn reset(&self) {
        self.inner.lock().expect("hub lock poisoned").last_broadcast = None;
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("hub lock poisoned").subscribers.len()
    }

    /// Delivers `progress`; returns false when the subscriber should be
    /// removed (dead channel or claim confirmed).
    fn deliver(subscriber: &Subscriber, progress: ClaimProgress) -> bool {
        if subscriber
            .sender
            .send(SubscriberEvent::Update(progress))
            .is_err()
        {
            return false;
        }

        if progress.confirmed_idx >= subscriber.claim_idx {
            debug!(claim_idx = subscriber.claim_idx, "Closing confirmed subscriber");
            subscriber
                .sender
                .send(SubscriberEvent::Close {
                    reason: "claim confirmed",
                })
                .ok();
            return false;
        }

        true
    }

    /// Keepalive loop: pings every 30 s, drops subscribers silent for
    /// more than 120 s.
    pub async fn run_pinger(self: Arc<Self>) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            self.ping_round();
        }
    }

    fn ping_round(&self) {
        let subscribers: Vec<Arc<Subscriber>> = {
            let inner = self.inner.lock().expect("hub lock poisoned");
            inner.subscribers.clone()
        };

        let mut closed = Vec::new();
        for subscriber in &subscribers {
            let silent_for = subscriber
                .last_seen
                .lock()
                .expect("subscriber lock poisoned")
                .elapsed();

            if silent_for > PING_TIMEOUT {
                subscriber
                    .sender
                    .send(SubscriberEvent::Close {
                        reason: "ping timeout",
                    })
                    .ok();
                closed.push(subscriber.id);
            } else if subscriber.sender.send(SubscriberEvent::Ping).is_err() {
                closed.push(subscriber.id);
            }
        }

        if !closed.is_empty() {
            let mut inner = self.inner.lock().expect("hub lock poisoned");
            inner.subscribers.retain(|sub| !closed.contains(&sub.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(processed_idx: u64, confirmed_idx: u64) -> ClaimProgress {
        ClaimProgress {
            processed_idx,
            confirmed_idx,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_broadcasts() {
        let hub = NotificationHub::new();
        let mut sub = hub.subscribe(5);

        hub.broadcast(progress(1, 0));

        assert_eq!(
            sub.events.recv().await,
            Some(SubscriberEvent::Update(progress(1, 0)))
        );
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn new_subscriber_replays_last_broadcast() {
        let hub = NotificationHub::new();
        hub.broadcast(progress(3, 2));

        let mut sub = hub.subscribe(5);

        assert_eq!(
            sub.events.recv().await,
            Some(SubscriberEvent::Update(progress(3, 2)))
        );
    }

    #[tokio::test]
    async fn subscriber_closed_once_claim_confirms() {
        let hub = NotificationHub::new();
        let mut sub = hub.subscribe(2);

        hub.broadcast(progress(2, 1));
        hub.broadcast(progress(3, 2));

        assert_eq!(
            sub.events.recv().await,
            Some(SubscriberEvent::Update(progress(2, 1)))
        );
        assert_eq!(
            sub.events.recv().await,
            Some(SubscriberEvent::Update(progress(3, 2)))
        );
        assert_eq!(
            sub.events.recv().await,
            Some(SubscriberEvent::Close {
                reason: "claim confirmed"
            })
        );
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn replayed_broadcast_can_close_immediately() {
        let hub = NotificationHub::new();
        hub.broadcast(progress(7, 7));

        let mut sub = hub.subscribe(4);

        assert_eq!(
            sub.events.recv().await,
            Some(SubscriberEvent::Update(progress(7, 7)))
        );
        assert_eq!(
            sub.events.recv().await,
            Some(SubscriberEvent::Close {
                reason: "claim confirmed"
            })
        );
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_during_broadcast() {
        let hub = NotificationHub::new();
        let sub = hub.subscribe(10);
        drop(sub);

        hub.broadcast(progress(1, 0));

        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn reset_clears_last_broadcast() {
        let hub = NotificationHub::new();
        hub.broadcast(progress(1, 1));
        hub.reset();

        assert_eq!(hub.last_broadcast(), None);

        let mut sub = hub.subscribe(1);
        // nothing replayed after a reset
        assert!(sub.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_subscriber_is_dropped_by_pinger() {
        let hub = Arc::new(NotificationHub::new());
        let mut sub = hub.subscribe(10);

        tokio::spawn(hub.clone().run_pinger());

        // Never answer: pings keep arriving until the timeout closes us.
        loop {
            match sub.events.recv().await {
                Some(SubscriberEvent::Ping) => {}
                Some(SubscriberEvent::Close {
                    reason: "ping timeout",
                }) => break,
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(hub.subscriber_count(), 0);
    }
}
