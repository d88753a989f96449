// In-process subject router.
// Subscribers register a subject pattern and get a bounded queue; publish fans
// a message out to every matching pattern. The pull API responder in
// `jetstream` and the client-side `InProcessConnection` both sit on top of it.
use jetpull_transport::{Message, TransportError};
use parking_lot::Mutex;
use slab::Slab;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod connection;
pub mod jetstream;

pub use connection::InProcessConnection;
pub use jetstream::{JetStreamServer, JetStreamServerConfig};

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("subscriber queue capacity must be non-zero")]
    InvalidCapacity,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),
    #[error("stream not found: {0}")]
    StreamNotFound(String),
    #[error("stream already exists: {0}")]
    StreamExists(String),
    #[error("server stopped")]
    ServerStopped,
}

impl From<BrokerError> for TransportError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::InvalidSubject(subject) => TransportError::InvalidSubject(subject),
            _ => TransportError::ConnectionClosed,
        }
    }
}

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;
const DEFAULT_SUB_QUEUE_POLICY: SubQueuePolicy = SubQueuePolicy::DropNew;
static GLOBAL_SUBSCRIPTIONS: AtomicUsize = AtomicUsize::new(0);
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// What publish does when a subscriber queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubQueuePolicy {
    // Wait for room (or for the subscriber to go away).
    Block,
    DropNew,
}

#[derive(Debug)]
struct SubscriberEntry {
    // Slab ids are reused; the generation pins removals to one registration.
    generation: u64,
    pattern: String,
    sender: mpsc::Sender<Message>,
    closed: CancellationToken,
}

#[derive(Debug)]
pub struct Broker {
    subscribers: Mutex<Slab<SubscriberEntry>>,
    subscriber_capacity: usize,
    subscriber_queue_policy: SubQueuePolicy,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Slab::new()),
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            subscriber_queue_policy: DEFAULT_SUB_QUEUE_POLICY,
        }
    }

    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(BrokerError::InvalidCapacity);
        }
        self.subscriber_capacity = capacity;
        Ok(self)
    }

    pub fn with_subscriber_queue_policy(mut self, policy: SubQueuePolicy) -> Self {
        self.subscriber_queue_policy = policy;
        self
    }

    /// Registers interest in `pattern`; `*` matches one token and a trailing
    /// `>` matches one or more.
    pub fn subscribe(self: &Arc<Self>, pattern: &str) -> Result<BrokerSubscription> {
        validate_subject(pattern, true)?;
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        let closed = CancellationToken::new();
        let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
        let id = self.subscribers.lock().insert(SubscriberEntry {
            generation,
            pattern: pattern.to_string(),
            sender: tx,
            closed: closed.clone(),
        });
        let active = GLOBAL_SUBSCRIPTIONS.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("jetpull_broker_subscriptions").set(active as f64);
        tracing::trace!(pattern, id, "subscriber registered");
        Ok(BrokerSubscription {
            subject: pattern.to_string(),
            receiver: tokio::sync::Mutex::new(rx),
            guard: SubscriptionGuard {
                broker: Arc::downgrade(self),
                subscriber_id: id,
                generation,
                closed,
            },
        })
    }

    /// Routes `message` to every matching subscriber. Returns how many
    /// subscribers matched, including any whose full queue dropped it.
    pub async fn publish(&self, message: Message) -> Result<usize> {
        validate_subject(&message.subject, false)?;
        let targets: Vec<(usize, u64, mpsc::Sender<Message>, CancellationToken)> = {
            let subscribers = self.subscribers.lock();
            subscribers
                .iter()
                .filter(|(_, entry)| subject_matches(&entry.pattern, &message.subject))
                .map(|(id, entry)| {
                    (
                        id,
                        entry.generation,
                        entry.sender.clone(),
                        entry.closed.clone(),
                    )
                })
                .collect()
        };
        metrics::counter!("jetpull_broker_published_total").increment(1);
        let matched = targets.len();
        let mut closed_subscribers = Vec::new();
        for (id, generation, sender, closed) in targets {
            match self.subscriber_queue_policy {
                SubQueuePolicy::Block => {
                    let delivered = tokio::select! {
                        sent = sender.send(message.clone()) => sent.is_ok(),
                        _ = closed.cancelled() => false,
                    };
                    if !delivered {
                        closed_subscribers.push((id, generation));
                    }
                }
                SubQueuePolicy::DropNew => match sender.try_send(message.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        metrics::counter!("jetpull_broker_dropped_total").increment(1);
                        tracing::debug!(subject = %message.subject, id, "subscriber queue full; dropping");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        closed_subscribers.push((id, generation))
                    }
                },
            }
        }
        for (id, generation) in closed_subscribers {
            self.remove_subscriber(id, generation);
        }
        Ok(matched)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn remove_subscriber(&self, id: usize, generation: u64) {
        let removed = {
            let mut subscribers = self.subscribers.lock();
            let current = subscribers
                .get(id)
                .is_some_and(|entry| entry.generation == generation);
            if current { subscribers.try_remove(id) } else { None }
        };
        if let Some(entry) = removed {
            entry.closed.cancel();
            let active = GLOBAL_SUBSCRIPTIONS
                .fetch_sub(1, Ordering::Relaxed)
                .saturating_sub(1);
            metrics::gauge!("jetpull_broker_subscriptions").set(active as f64);
            tracing::trace!(pattern = %entry.pattern, id, "subscriber removed");
        }
    }
}

/// RAII handle that unregisters a subscriber on drop.
#[derive(Debug)]
struct SubscriptionGuard {
    broker: Weak<Broker>,
    subscriber_id: usize,
    generation: u64,
    closed: CancellationToken,
}

impl SubscriptionGuard {
    fn release(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        if let Some(broker) = self.broker.upgrade() {
            broker.remove_subscriber(self.subscriber_id, self.generation);
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Receiving side of a broker subscription.
#[derive(Debug)]
pub struct BrokerSubscription {
    subject: String,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    guard: SubscriptionGuard,
}

impl BrokerSubscription {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, or `None` once the subscription is released.
    pub async fn recv(&self) -> Option<Message> {
        if self.guard.closed.is_cancelled() {
            return None;
        }
        let mut receiver = self.receiver.lock().await;
        tokio::select! {
            biased;
            _ = self.guard.closed.cancelled() => None,
            message = receiver.recv() => message,
        }
    }

    pub fn unsubscribe(&self) {
        self.guard.release();
    }

    pub fn is_closed(&self) -> bool {
        self.guard.closed.is_cancelled()
    }
}

/// Token-wise subject match with `*` and trailing `>` wildcards.
///
/// ```
/// use jetpull_broker::subject_matches;
///
/// assert!(subject_matches("orders.*", "orders.new"));
/// assert!(subject_matches("$JS.API.>", "$JS.API.CONSUMER.INFO.S.c"));
/// assert!(!subject_matches("orders.*", "orders.new.eu"));
/// assert!(!subject_matches("orders.>", "orders"));
/// ```
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    for token in pattern.split('.') {
        match (token, subject_tokens.next()) {
            (">", Some(_)) => return true,
            ("*", Some(_)) => {}
            (literal, Some(actual)) if literal == actual => {}
            _ => return false,
        }
    }
    subject_tokens.next().is_none()
}

fn validate_subject(subject: &str, allow_wildcards: bool) -> Result<()> {
    let invalid = || BrokerError::InvalidSubject(subject.to_string());
    if subject.is_empty() || subject.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let tokens: Vec<&str> = subject.split('.').collect();
    for (idx, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(invalid());
        }
        let wildcard = *token == "*" || *token == ">";
        if wildcard && !allow_wildcards {
            return Err(invalid());
        }
        if *token == ">" && idx + 1 != tokens.len() {
            return Err(invalid());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn message(subject: &str, payload: &'static [u8]) -> Message {
        Message::new(subject, Bytes::from_static(payload))
    }

    #[tokio::test]
    async fn publish_delivers_to_matching_subscribers() {
        let broker = Arc::new(Broker::new());
        let exact = broker.subscribe("orders.new").expect("subscribe");
        let wildcard = broker.subscribe("orders.*").expect("subscribe");
        let other = broker.subscribe("billing.>").expect("subscribe");

        let matched = broker
            .publish(message("orders.new", b"hello"))
            .await
            .expect("publish");
        assert_eq!(matched, 2);
        assert_eq!(exact.recv().await.expect("recv").payload, "hello");
        assert_eq!(wildcard.recv().await.expect("recv").payload, "hello");
        let pending = tokio::time::timeout(Duration::from_millis(20), other.recv()).await;
        assert!(pending.is_err(), "billing subscriber must not see orders");
    }

    #[tokio::test]
    async fn publish_without_subscribers_returns_zero() {
        let broker = Broker::new();
        let matched = broker
            .publish(message("nobody.home", b"payload"))
            .await
            .expect("publish");
        assert_eq!(matched, 0);
    }

    #[tokio::test]
    async fn drop_new_policy_drops_when_queue_full() {
        let broker = Arc::new(
            Broker::new()
                .with_subscriber_capacity(1)
                .expect("capacity")
                .with_subscriber_queue_policy(SubQueuePolicy::DropNew),
        );
        let sub = broker.subscribe("a").expect("subscribe");
        broker.publish(message("a", b"1")).await.expect("publish");
        let matched = broker.publish(message("a", b"2")).await.expect("publish");
        assert_eq!(matched, 1);
        assert_eq!(sub.recv().await.expect("recv").payload, "1");
        let next = tokio::time::timeout(Duration::from_millis(20), sub.recv()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn blocked_publish_is_released_by_unsubscribe() {
        let broker = Arc::new(
            Broker::new()
                .with_subscriber_capacity(1)
                .expect("capacity")
                .with_subscriber_queue_policy(SubQueuePolicy::Block),
        );
        let sub = broker.subscribe("a").expect("subscribe");
        broker.publish(message("a", b"1")).await.expect("publish");
        let publisher = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.publish(message("a", b"2")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!publisher.is_finished());
        sub.unsubscribe();
        let matched = publisher.await.expect("join").expect("publish");
        assert_eq!(matched, 1);
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_closes_receiver() {
        let broker = Arc::new(Broker::new());
        let sub = broker.subscribe("a.b").expect("subscribe");
        assert_eq!(broker.subscriber_count(), 1);
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(sub.is_closed());
        assert_eq!(broker.subscriber_count(), 0);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_subscription_unregisters_subscriber() {
        let broker = Arc::new(Broker::new());
        let sub = broker.subscribe("a").expect("subscribe");
        assert_eq!(broker.subscriber_count(), 1);
        drop(sub);
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn invalid_subjects_are_rejected() {
        let broker = Arc::new(Broker::new());
        for pattern in ["", "a..b", "a.>.b", "has space"] {
            assert_eq!(
                broker.subscribe(pattern).map(|_| ()),
                Err(BrokerError::InvalidSubject(pattern.to_string())),
                "{pattern:?}"
            );
        }
        let err = broker
            .publish(message("orders.*", b"x"))
            .await
            .expect_err("wildcard publish");
        assert_eq!(err, BrokerError::InvalidSubject("orders.*".to_string()));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(
            Broker::new().with_subscriber_capacity(0).map(|_| ()),
            Err(BrokerError::InvalidCapacity)
        );
    }

    #[test]
    fn wildcard_matching() {
        assert!(subject_matches(">", "a"));
        assert!(subject_matches("a.*.c", "a.b.c"));
        assert!(!subject_matches("a.*.c", "a.b.d"));
        assert!(!subject_matches("a.b", "a"));
        assert!(!subject_matches("a", "a.b"));
    }
}
