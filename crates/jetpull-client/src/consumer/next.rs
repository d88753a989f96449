use jetpull_wire::PullRequest;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{PullConsumer, deadline_after, heartbeat_deadline};
use crate::config::{EXPIRY_MARGIN, MIN_EXPIRING_TIMEOUT};
use crate::{ConsumerError, JetStreamMessage, NextOpt, Result};

impl PullConsumer {
    /// Pulls a single message.
    ///
    /// Waits up to `timeout` (the configured default when `None`). Running
    /// out of time or finding nothing to deliver is `Ok(None)`, not an error.
    /// With [`NextOpt::Heartbeat`], two missed heartbeats in a row fail with
    /// [`ConsumerError::NoHeartbeat`] and drop the pull inbox.
    pub async fn next(
        &self,
        timeout: Option<Duration>,
        opts: &[NextOpt],
    ) -> Result<Option<JetStreamMessage>> {
        if self.state.is_streaming() {
            return Err(ConsumerError::ConsumerBusy);
        }
        let timeout = timeout.unwrap_or(self.js.config().next_timeout);
        let mut request = PullRequest::new(1);
        if timeout >= MIN_EXPIRING_TIMEOUT {
            request.expires = timeout - EXPIRY_MARGIN;
        }
        for opt in opts {
            opt.apply(&mut request)?;
        }
        request.validate()?;

        let deadline = deadline_after(timeout);
        let (message_tx, mut message_rx) = mpsc::channel(1);
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel(1);
        let interval = request.heartbeat;
        let watch_heartbeats = !interval.is_zero();

        let fetch = self
            .fetcher
            .fetch(deadline, &request, &message_tx, Some(&heartbeat_tx));
        tokio::pin!(fetch);
        let dead_man = tokio::time::sleep_until(if watch_heartbeats {
            heartbeat_deadline(interval)
        } else {
            deadline
        });
        tokio::pin!(dead_man);
        let mut fetch_done = false;

        loop {
            tokio::select! {
                biased;
                Some(message) = message_rx.recv() => return Ok(Some(message)),
                outcome = &mut fetch, if !fetch_done => {
                    fetch_done = true;
                    match outcome {
                        // The message is already queued.
                        Ok(()) => continue,
                        Err(err) if err.is_empty_outcome() => return Ok(None),
                        Err(err) => return Err(err),
                    }
                }
                Some(()) = heartbeat_rx.recv() => {
                    dead_man.as_mut().reset(heartbeat_deadline(interval));
                }
                _ = &mut dead_man, if watch_heartbeats => {
                    tracing::warn!(
                        stream = %self.stream,
                        consumer = %self.name,
                        heartbeat = ?interval,
                        "no heartbeat received for pending next"
                    );
                    metrics::counter!("jetpull_heartbeat_lost_total").increment(1);
                    self.state.release_subscription();
                    return Err(ConsumerError::NoHeartbeat);
                }
            }
        }
    }
}
