// Transport contract consumed by the pull engine.
// A connection offers subject-based publish/subscribe with reply subjects;
// the engine only needs ephemeral inbox subscriptions, publish-with-reply and
// a deadline-bounded receive. Reconnection and flow control live below this seam.
use async_trait::async_trait;
use bytes::Bytes;
use jetpull_wire::Headers;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

pub const INBOX_PREFIX: &str = "_INBOX";

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("timed out waiting for a message")]
    Timeout,
    #[error("subscription closed: {0}")]
    SubscriptionClosed(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("no responders available for {0}")]
    NoResponders(String),
    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),
}

/// A message as carried by the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Option<Headers>,
    pub payload: Bytes,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: Bytes) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: None,
            payload,
        }
    }

    /// Empty-payload status reply (`Status` / `Description` headers).
    pub fn status(subject: impl Into<String>, code: u16, description: &str) -> Self {
        Self::new(subject, Bytes::new()).with_headers(Headers::status(code, description))
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// Generates a unique reply subject under [`INBOX_PREFIX`].
///
/// ```
/// let inbox = jetpull_transport::new_inbox();
/// assert!(inbox.starts_with("_INBOX."));
/// assert_ne!(inbox, jetpull_transport::new_inbox());
/// ```
pub fn new_inbox() -> String {
    format!("{INBOX_PREFIX}.{}", Uuid::new_v4().simple())
}

/// Synchronous-style subscription: messages are pulled one at a time.
///
/// `next_msg` takes `&self` so one subscription can be shared behind an `Arc`
/// while the owner keeps the right to tear it down.
#[async_trait]
pub trait Subscription: Send + Sync {
    fn subject(&self) -> &str;

    /// Waits for the next message until `deadline`; fails with
    /// [`TransportError::Timeout`] once it passes and with
    /// [`TransportError::SubscriptionClosed`] after `unsubscribe`.
    async fn next_msg(&self, deadline: Instant) -> Result<Message>;

    /// Stops delivery. Calling it more than once is a no-op.
    fn unsubscribe(&self);
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn new_inbox(&self) -> String {
        new_inbox()
    }

    async fn subscribe(&self, subject: &str) -> Result<Arc<dyn Subscription>>;

    async fn publish(&self, message: Message) -> Result<()>;

    async fn publish_request(&self, subject: &str, reply: &str, payload: Bytes) -> Result<()> {
        self.publish(Message::new(subject, payload).with_reply(reply))
            .await
    }

    /// Request/reply over a throwaway inbox.
    async fn request(&self, subject: &str, payload: Bytes, timeout: Duration) -> Result<Message> {
        let inbox = self.new_inbox();
        let subscription = self.subscribe(&inbox).await?;
        let outcome = async {
            self.publish_request(subject, &inbox, payload).await?;
            subscription.next_msg(Instant::now() + timeout).await
        }
        .await;
        subscription.unsubscribe();
        let reply = outcome?;
        if reply.payload.is_empty()
            && reply
                .headers
                .as_ref()
                .and_then(Headers::status_code)
                .is_some_and(|code| code == jetpull_wire::status::STATUS_NO_RESPONDERS)
        {
            tracing::debug!(subject, "request had no responders");
            return Err(TransportError::NoResponders(subject.to_string()));
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_message_has_empty_payload_and_status_header() {
        let message = Message::status("_INBOX.x", 404, "No Messages");
        assert!(message.payload.is_empty());
        let headers = message.headers.expect("headers");
        assert_eq!(headers.status_code(), Some(404));
        assert_eq!(headers.get("Description"), Some("No Messages"));
    }

    #[test]
    fn builder_sets_reply_subject() {
        let message = Message::new("orders.new", Bytes::from_static(b"x")).with_reply("_INBOX.r");
        assert_eq!(message.reply.as_deref(), Some("_INBOX.r"));
        assert!(message.headers.is_none());
    }

    #[test]
    fn inboxes_are_unique_and_single_token_suffixed() {
        let inbox = new_inbox();
        let suffix = inbox.strip_prefix("_INBOX.").expect("prefix");
        assert!(!suffix.contains('.'));
        assert_eq!(suffix.len(), 32);
    }
}
