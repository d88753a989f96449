// Single pull round trip: publish one request, collect its replies.
use jetpull_transport::Transport;
use jetpull_wire::{PullRequest, ReplyKind, classify_reply};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::state::ConsumerState;
use crate::{ConsumerError, JetStreamMessage, Result};

#[derive(Clone)]
pub(crate) struct BatchFetcher {
    transport: Arc<dyn Transport>,
    state: Arc<ConsumerState>,
    request_subject: Arc<str>,
}

impl BatchFetcher {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        state: Arc<ConsumerState>,
        request_subject: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            transport,
            state,
            request_subject: request_subject.into(),
        }
    }

    /// Publishes `request` and forwards user messages into `sink` until
    /// `request.batch` of them arrived.
    ///
    /// Idle heartbeats are signalled on `heartbeat` (never blocking, a full
    /// channel already carries the news) when the request asked for them.
    /// Every terminal status ends the fetch with its error; the local
    /// `deadline` ends it with [`ConsumerError::Timeout`].
    pub(crate) async fn fetch(
        &self,
        deadline: Instant,
        request: &PullRequest,
        sink: &mpsc::Sender<JetStreamMessage>,
        heartbeat: Option<&mpsc::Sender<()>>,
    ) -> Result<()> {
        request.validate()?;
        let payload = request.encode()?;
        let subscription = self.state.subscription(self.transport.as_ref()).await?;
        self.transport
            .publish_request(&self.request_subject, subscription.subject(), payload)
            .await?;
        tracing::trace!(
            subject = %self.request_subject,
            batch = request.batch,
            expires = ?request.expires,
            no_wait = request.no_wait,
            "pull request published"
        );

        let mut delivered = 0;
        while delivered < request.batch {
            let reply = subscription.next_msg(deadline).await?;
            match classify_reply(reply.headers.as_ref(), &reply.payload) {
                ReplyKind::User => {
                    if sink.send(JetStreamMessage::new(reply)).await.is_err() {
                        tracing::debug!(delivered, "message sink closed during fetch");
                        return Ok(());
                    }
                    delivered += 1;
                    metrics::counter!("jetpull_fetch_messages_total").increment(1);
                }
                ReplyKind::IdleHeartbeat => {
                    if !request.heartbeat.is_zero()
                        && let Some(heartbeat) = heartbeat
                    {
                        let _ = heartbeat.try_send(());
                    }
                }
                ReplyKind::NoMessages => return Err(ConsumerError::NoMessages),
                ReplyKind::RequestTimeout => return Err(ConsumerError::Timeout),
                ReplyKind::NoResponders => return Err(ConsumerError::NoResponders),
                ReplyKind::Status { code, description } => {
                    return Err(ConsumerError::Status { code, description });
                }
            }
        }
        Ok(())
    }
}
