//! Broadcast layer — at-least-once fan-out to subscribed viewers.
//!
//! Each subscriber owns an mpsc receiver. Sequences are monotonic per
//! (viewer, channel). When a viewer's channel closes (or backs up), its
//! messages are queued instead of dropped; `reconnect` within the grace
//! period flushes the queue in order, after the grace the subscription is
//! swept and a fresh subscribe + backfill is required.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};

use mirror_core::ViewerId;

use crate::error::TransportError;
use crate::protocol::{Channel, Envelope, SubscriptionFilter, ViewerPayload};

/// Per-viewer mpsc capacity.
const VIEWER_QUEUE: usize = 256;

#[derive(Debug)]
struct Subscriber {
    filter: SubscriptionFilter,
    tx: mpsc::Sender<Envelope>,
    sequences: HashMap<Channel, u64>,
    /// Messages not yet handed to a live receiver, oldest first.
    undelivered: VecDeque<Envelope>,
    disconnected_at: Option<Instant>,
}

impl Subscriber {
    fn next_sequence(&mut self, channel: &Channel) -> u64 {
        let counter = self.sequences.entry(channel.clone()).or_insert(0);
        let seq = *counter;
        *counter += 1;
        seq
    }
}

/// Viewer fan-out hub for one engine instance.
#[derive(Debug)]
pub struct Broadcaster {
    subscribers: Mutex<HashMap<ViewerId, Subscriber>>,
    grace: Duration,
}

impl Broadcaster {
    /// `grace` is how long a disconnected subscription (and its queue) is
    /// retained before being swept.
    pub fn new(grace: Duration) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            grace,
        }
    }

    /// Register interest and return the viewer's receiving end.
    ///
    /// Subscribing an already-known viewer replaces the old subscription
    /// (fresh sequences, empty queue).
    pub fn subscribe(
        &self,
        viewer_id: ViewerId,
        filter: SubscriptionFilter,
    ) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(VIEWER_QUEUE);
        let mut subscribers = self.lock();
        subscribers.insert(
            viewer_id,
            Subscriber {
                filter,
                tx,
                sequences: HashMap::new(),
                undelivered: VecDeque::new(),
                disconnected_at: None,
            },
        );
        rx
    }

    /// Drop a subscription immediately, queue included.
    pub fn unsubscribe(&self, viewer_id: &ViewerId) {
        self.lock().remove(viewer_id);
    }

    /// Fan a payload out to every matching subscriber.
    ///
    /// Returns how many viewers got (or will get, via their retained queue)
    /// the message.
    pub fn publish(&self, payload: ViewerPayload) -> usize {
        let channel = payload.channel();
        let mut subscribers = self.lock();
        let mut matched = 0usize;

        for subscriber in subscribers.values_mut() {
            if !subscriber.filter.matches(&channel) {
                continue;
            }
            matched += 1;
            let envelope = Envelope {
                channel: channel.clone(),
                sequence: subscriber.next_sequence(&channel),
                payload: payload.clone(),
            };

            // Order is per (viewer, channel): once anything is queued,
            // everything later queues behind it.
            if subscriber.disconnected_at.is_some() || !subscriber.undelivered.is_empty() {
                subscriber.undelivered.push_back(envelope);
                continue;
            }
            match subscriber.tx.try_send(envelope) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(envelope)) => {
                    subscriber.undelivered.push_back(envelope);
                }
                Err(mpsc::error::TrySendError::Closed(envelope)) => {
                    subscriber.disconnected_at = Some(Instant::now());
                    subscriber.undelivered.push_back(envelope);
                }
            }
        }
        matched
    }

    /// Re-attach a viewer within the grace period.
    ///
    /// The retained queue is flushed, in order, into the fresh receiver;
    /// sequences continue where they left off so the viewer can verify it
    /// missed nothing.
    pub fn reconnect(
        &self,
        viewer_id: &ViewerId,
    ) -> Result<mpsc::Receiver<Envelope>, TransportError> {
        let mut subscribers = self.lock();
        let expired = {
            let subscriber =
                subscribers
                    .get(viewer_id)
                    .ok_or_else(|| TransportError::UnknownViewer {
                        id: viewer_id.clone(),
                    })?;
            subscriber
                .disconnected_at
                .map(|at| at.elapsed() > self.grace)
                .unwrap_or(false)
        };
        if expired {
            subscribers.remove(viewer_id);
            return Err(TransportError::SubscriptionExpired {
                id: viewer_id.clone(),
            });
        }
        let Some(subscriber) = subscribers.get_mut(viewer_id) else {
            return Err(TransportError::UnknownViewer {
                id: viewer_id.clone(),
            });
        };

        let capacity = VIEWER_QUEUE.max(subscriber.undelivered.len());
        let (tx, rx) = mpsc::channel(capacity);
        for envelope in subscriber.undelivered.drain(..) {
            // Capacity covers the whole queue; a failure means the caller
            // dropped the fresh receiver already.
            if tx.try_send(envelope).is_err() {
                break;
            }
        }
        subscriber.tx = tx;
        subscriber.disconnected_at = None;
        Ok(rx)
    }

    /// Drop subscriptions disconnected longer than the grace period.
    /// Returns the number swept.
    pub fn sweep(&self) -> usize {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        let grace = self.grace;
        subscribers.retain(|viewer_id, subscriber| {
            let keep = subscriber
                .disconnected_at
                .map(|at| at.elapsed() <= grace)
                .unwrap_or(true);
            if !keep {
                tracing::info!(viewer = %viewer_id, "dropping expired subscription");
            }
            keep
        });
        before - subscribers.len()
    }

    /// Run the sweeper until `shutdown` fires.
    pub async fn run_sweeper(&self, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }
    }

    /// Number of live + grace-retained subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ViewerId, Subscriber>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use mirror_core::{
        ChunkKind, MirroredResource, OutputChunk, ResourcePath, SessionId, StreamKind,
        SyncOrigin, TargetHealth, TargetId,
    };

    use super::*;

    fn chunk_payload(session: &str, seq: u64) -> ViewerPayload {
        ViewerPayload::chunk(OutputChunk {
            session_id: SessionId::from(session),
            sequence: seq,
            timestamp: Utc::now(),
            bytes: b"x".to_vec(),
            stream: StreamKind::Stdout,
            kind: ChunkKind::Data,
        })
    }

    fn sync_payload(path: &str, version: u64) -> ViewerPayload {
        ViewerPayload::sync_event(
            MirroredResource {
                path: ResourcePath::from(path),
                content_hash: format!("hash-{version}"),
                version,
                last_writer: "api".to_string(),
                last_modified_at: Utc::now(),
            },
            SyncOrigin::Api,
        )
    }

    #[tokio::test]
    async fn publish_delivers_with_monotonic_sequences() {
        let hub = Broadcaster::new(Duration::from_secs(60));
        let mut rx = hub.subscribe(ViewerId::from("v1"), SubscriptionFilter::all());

        for i in 0..3 {
            assert_eq!(hub.publish(chunk_payload("s1", i)), 1);
        }

        for expected in 0..3u64 {
            let envelope = rx.recv().await.expect("recv");
            assert_eq!(envelope.sequence, expected);
            assert_eq!(envelope.channel, Channel::Session(SessionId::from("s1")));
        }
    }

    #[tokio::test]
    async fn sequences_are_independent_per_channel() {
        let hub = Broadcaster::new(Duration::from_secs(60));
        let mut rx = hub.subscribe(ViewerId::from("v1"), SubscriptionFilter::all());

        hub.publish(chunk_payload("s1", 0));
        hub.publish(sync_payload("a.txt", 1));
        hub.publish(chunk_payload("s1", 1));

        let mut by_channel: HashMap<Channel, Vec<u64>> = HashMap::new();
        for _ in 0..3 {
            let envelope = rx.recv().await.expect("recv");
            by_channel
                .entry(envelope.channel.clone())
                .or_default()
                .push(envelope.sequence);
        }
        assert_eq!(
            by_channel[&Channel::Session(SessionId::from("s1"))],
            vec![0, 1]
        );
        assert_eq!(
            by_channel[&Channel::Resource(ResourcePath::from("a.txt"))],
            vec![0]
        );
    }

    #[tokio::test]
    async fn filter_limits_delivery() {
        let hub = Broadcaster::new(Duration::from_secs(60));
        let mut rx = hub.subscribe(
            ViewerId::from("v1"),
            SubscriptionFilter::resources([ResourcePath::from("a.txt")]),
        );

        assert_eq!(hub.publish(sync_payload("b.txt", 1)), 0);
        assert_eq!(hub.publish(chunk_payload("s1", 0)), 0);
        assert_eq!(hub.publish(sync_payload("a.txt", 1)), 1);

        let envelope = rx.recv().await.expect("recv");
        assert_eq!(
            envelope.channel,
            Channel::Resource(ResourcePath::from("a.txt"))
        );
    }

    #[tokio::test]
    async fn health_notices_reach_every_subscriber() {
        let hub = Broadcaster::new(Duration::from_secs(60));
        let mut narrow = hub.subscribe(
            ViewerId::from("narrow"),
            SubscriptionFilter::resources([ResourcePath::from("a.txt")]),
        );
        let mut wide = hub.subscribe(ViewerId::from("wide"), SubscriptionFilter::all());

        let delivered = hub.publish(ViewerPayload::target_health(
            TargetId::from("t1"),
            TargetHealth::Offline,
        ));
        assert_eq!(delivered, 2);
        assert!(matches!(
            narrow.recv().await.expect("recv").payload,
            ViewerPayload::TargetHealth { .. }
        ));
        assert!(matches!(
            wide.recv().await.expect("recv").payload,
            ViewerPayload::TargetHealth { .. }
        ));
    }

    #[tokio::test]
    async fn disconnect_queues_and_reconnect_flushes_in_order() {
        let hub = Broadcaster::new(Duration::from_secs(60));
        let rx = hub.subscribe(ViewerId::from("v1"), SubscriptionFilter::all());
        drop(rx);

        for i in 0..3 {
            hub.publish(chunk_payload("s1", i));
        }

        let mut rx = hub.reconnect(&ViewerId::from("v1")).expect("reconnect");
        for expected in 0..3u64 {
            let envelope = rx.recv().await.expect("recv");
            assert_eq!(envelope.sequence, expected, "no gaps after reconnect");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expired_subscription_is_swept_and_cannot_reconnect() {
        let hub = Broadcaster::new(Duration::from_secs(5));
        let rx = hub.subscribe(ViewerId::from("v1"), SubscriptionFilter::all());
        drop(rx);
        hub.publish(chunk_payload("s1", 0));
        assert_eq!(hub.subscriber_count(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(hub.sweep(), 1);
        assert_eq!(hub.subscriber_count(), 0);

        let err = hub.reconnect(&ViewerId::from("v1")).unwrap_err();
        assert!(matches!(err, TransportError::UnknownViewer { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_grace_reports_expired() {
        let hub = Broadcaster::new(Duration::from_secs(5));
        let rx = hub.subscribe(ViewerId::from("v1"), SubscriptionFilter::all());
        drop(rx);
        hub.publish(chunk_payload("s1", 0));

        tokio::time::advance(Duration::from_secs(6)).await;
        let err = hub.reconnect(&ViewerId::from("v1")).unwrap_err();
        assert!(matches!(err, TransportError::SubscriptionExpired { .. }));
        assert_eq!(hub.subscriber_count(), 0, "expired entry removed");
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = Broadcaster::new(Duration::from_secs(60));
        let _rx = hub.subscribe(ViewerId::from("v1"), SubscriptionFilter::all());
        hub.unsubscribe(&ViewerId::from("v1"));
        assert_eq!(hub.publish(chunk_payload("s1", 0)), 0);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
