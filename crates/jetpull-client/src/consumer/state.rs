use jetpull_transport::{Subscription, Transport};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::Result;

/// Shared per-consumer state: the lazily created pull inbox and the flag that
/// marks an active `stream`.
///
/// The inbox slot is only touched under the mutex and the mutex is never held
/// across an await; creating a subscription happens outside of it and the
/// loser of a creation race drops its own subscription.
pub(crate) struct ConsumerState {
    subscription: Mutex<Option<Arc<dyn Subscription>>>,
    streaming: AtomicBool,
}

impl ConsumerState {
    pub(crate) fn new() -> Self {
        Self {
            subscription: Mutex::new(None),
            streaming: AtomicBool::new(false),
        }
    }

    /// Returns the current inbox subscription, creating one on first use.
    pub(crate) async fn subscription(
        &self,
        transport: &dyn Transport,
    ) -> Result<Arc<dyn Subscription>> {
        if let Some(subscription) = self.subscription.lock().as_ref() {
            return Ok(Arc::clone(subscription));
        }
        let inbox = transport.new_inbox();
        let created = transport.subscribe(&inbox).await?;
        let mut slot = self.subscription.lock();
        if let Some(existing) = slot.as_ref() {
            created.unsubscribe();
            return Ok(Arc::clone(existing));
        }
        tracing::debug!(inbox = %inbox, "pull inbox subscribed");
        *slot = Some(Arc::clone(&created));
        Ok(created)
    }

    /// Unsubscribes and forgets the inbox; the next fetch creates a new one.
    pub(crate) fn release_subscription(&self) {
        let mut slot = self.subscription.lock();
        if let Some(subscription) = slot.take() {
            subscription.unsubscribe();
            tracing::debug!(inbox = %subscription.subject(), "pull inbox released");
        }
    }

    #[cfg(test)]
    pub(crate) fn has_subscription(&self) -> bool {
        self.subscription.lock().is_some()
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    /// Claims the streaming flag; false if another `stream` holds it.
    pub(crate) fn try_start_streaming(&self) -> bool {
        self.streaming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn finish_streaming(&self) {
        self.streaming.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jetpull_broker::{Broker, InProcessConnection};

    fn connection() -> InProcessConnection {
        InProcessConnection::new(Arc::new(Broker::new()))
    }

    #[tokio::test]
    async fn subscription_is_created_once_and_reused() {
        let connection = connection();
        let state = ConsumerState::new();
        let first = state.subscription(&connection).await.expect("subscribe");
        let second = state.subscription(&connection).await.expect("subscribe");
        assert_eq!(first.subject(), second.subject());
        assert_eq!(connection.broker().subscriber_count(), 1);
    }

    #[tokio::test]
    async fn release_unsubscribes_and_next_use_recreates() {
        let connection = connection();
        let state = ConsumerState::new();
        let first = state.subscription(&connection).await.expect("subscribe");
        state.release_subscription();
        state.release_subscription();
        assert!(!state.has_subscription());
        assert_eq!(connection.broker().subscriber_count(), 0);

        let second = state.subscription(&connection).await.expect("subscribe");
        assert_ne!(first.subject(), second.subject());
    }

    #[test]
    fn streaming_flag_is_exclusive() {
        let state = ConsumerState::new();
        assert!(state.try_start_streaming());
        assert!(state.is_streaming());
        assert!(!state.try_start_streaming());
        state.finish_streaming();
        assert!(!state.is_streaming());
        assert!(state.try_start_streaming());
    }
}
