// In-process connection: a `Transport` backed by a shared `Broker`.
use async_trait::async_trait;
use jetpull_transport::{Message, Subscription, Transport, TransportError};
use jetpull_wire::status::STATUS_NO_RESPONDERS;
use std::sync::Arc;
use tokio::time::Instant;

use crate::{Broker, BrokerSubscription};

/// Connection handle over a broker running in this process.
///
/// Requests published with a reply subject that no subscriber matches get a
/// `503` status on the reply subject, like a server without responders.
///
/// ```
/// use bytes::Bytes;
/// use jetpull_broker::{Broker, InProcessConnection};
/// use jetpull_transport::{Message, Subscription, Transport};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let broker = Arc::new(Broker::new());
/// let connection = InProcessConnection::new(broker);
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let sub = connection.subscribe("updates").await.expect("subscribe");
///     connection
///         .publish(Message::new("updates", Bytes::from_static(b"payload")))
///         .await
///         .expect("publish");
///     let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
///     let msg = sub.next_msg(deadline).await.expect("recv");
///     assert_eq!(msg.payload, Bytes::from_static(b"payload"));
/// });
/// ```
#[derive(Clone)]
pub struct InProcessConnection {
    broker: Arc<Broker>,
}

impl InProcessConnection {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }
}

#[async_trait]
impl Transport for InProcessConnection {
    async fn subscribe(&self, subject: &str) -> jetpull_transport::Result<Arc<dyn Subscription>> {
        let subscription = self.broker.subscribe(subject)?;
        Ok(Arc::new(subscription))
    }

    async fn publish(&self, message: Message) -> jetpull_transport::Result<()> {
        let reply = message.reply.clone();
        let matched = self.broker.publish(message).await?;
        if matched == 0
            && let Some(reply) = reply
        {
            tracing::trace!(%reply, "no responders");
            self.broker
                .publish(Message::status(reply, STATUS_NO_RESPONDERS, "No Responders"))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Subscription for BrokerSubscription {
    fn subject(&self) -> &str {
        BrokerSubscription::subject(self)
    }

    async fn next_msg(&self, deadline: Instant) -> jetpull_transport::Result<Message> {
        match tokio::time::timeout_at(deadline, self.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(TransportError::SubscriptionClosed(self.subject().to_string())),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    fn unsubscribe(&self) {
        BrokerSubscription::unsubscribe(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn connection() -> InProcessConnection {
        InProcessConnection::new(Arc::new(Broker::new()))
    }

    #[tokio::test]
    async fn next_msg_times_out_at_deadline() {
        let connection = connection();
        let sub = connection.subscribe("quiet").await.expect("subscribe");
        let start = Instant::now();
        let err = sub
            .next_msg(start + Duration::from_millis(30))
            .await
            .expect_err("timeout");
        assert_eq!(err, TransportError::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn next_msg_after_unsubscribe_reports_closed() {
        let connection = connection();
        let sub = connection.subscribe("gone").await.expect("subscribe");
        sub.unsubscribe();
        let err = sub
            .next_msg(Instant::now() + Duration::from_secs(1))
            .await
            .expect_err("closed");
        assert_eq!(err, TransportError::SubscriptionClosed("gone".to_string()));
        assert_eq!(connection.broker().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn request_without_responders_fails_fast() {
        let connection = connection();
        let err = connection
            .request("$JS.API.CONSUMER.INFO.S.c", Bytes::new(), Duration::from_secs(5))
            .await
            .expect_err("no responders");
        assert_eq!(
            err,
            TransportError::NoResponders("$JS.API.CONSUMER.INFO.S.c".to_string())
        );
        // The throwaway inbox is released afterwards.
        assert_eq!(connection.broker().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn request_gets_reply_from_responder() {
        let connection = connection();
        let responder = connection.subscribe("echo").await.expect("subscribe");
        let server = {
            let connection = connection.clone();
            tokio::spawn(async move {
                let request = responder
                    .next_msg(Instant::now() + Duration::from_secs(1))
                    .await
                    .expect("request");
                let reply = request.reply.expect("reply subject");
                connection
                    .publish(Message::new(reply, request.payload))
                    .await
                    .expect("reply");
            })
        };
        let reply = connection
            .request("echo", Bytes::from_static(b"ping"), Duration::from_secs(1))
            .await
            .expect("request");
        assert_eq!(reply.payload, Bytes::from_static(b"ping"));
        server.await.expect("join");
    }

    #[tokio::test]
    async fn invalid_subject_maps_to_transport_error() {
        let connection = connection();
        let err = connection
            .publish(Message::new("bad subject", Bytes::new()))
            .await
            .expect_err("invalid");
        assert_eq!(err, TransportError::InvalidSubject("bad subject".to_string()));
    }
}
