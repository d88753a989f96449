// Continuous delivery: a fetch task keeps a bounded buffer topped up while a
// dispatch task feeds the handler and watches heartbeats.
use jetpull_wire::PullRequest;
use std::sync::Arc;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{BatchFetcher, ConsumerState, PullConsumer, deadline_after, heartbeat_deadline};
use crate::config::EXPIRY_MARGIN;
use crate::options::check_stream_batch;
use crate::{ConsumerError, JetStreamMessage, Result, StreamOpt};

/// Receives every delivered message and every error reported by `stream`.
pub type MessageHandler = Box<dyn FnMut(Result<JetStreamMessage>) + Send + 'static>;

impl PullConsumer {
    /// Starts delivering messages to `handler` in the background.
    ///
    /// Returns once the background tasks are running. They stop when `cancel`
    /// fires or, with [`StreamOpt::Heartbeat`], after the handler saw
    /// [`ConsumerError::NoHeartbeat`]. Empty pulls are retried silently;
    /// other fetch errors reach the handler and the stream keeps going. If
    /// fetching dies the handler gets [`ConsumerError::FetchStopped`] last.
    ///
    /// ```no_run
    /// # async fn run(consumer: jetpull_client::PullConsumer) -> jetpull_client::Result<()> {
    /// use jetpull_client::{JetStreamMessage, MessageHandler, Result, StreamOpt};
    /// use std::time::Duration;
    /// use tokio_util::sync::CancellationToken;
    ///
    /// let cancel = CancellationToken::new();
    /// let handler: MessageHandler = Box::new(|delivery: Result<JetStreamMessage>| match delivery {
    ///     Ok(msg) => println!("{}: {} bytes", msg.subject(), msg.payload().len()),
    ///     Err(err) => eprintln!("stream error: {err}"),
    /// });
    /// consumer.stream(
    ///     &cancel,
    ///     Some(handler),
    ///     &[StreamOpt::BatchSize(10), StreamOpt::Heartbeat(Duration::from_secs(5))],
    /// )?;
    /// # cancel.cancel();
    /// # Ok(())
    /// # }
    /// ```
    pub fn stream(
        &self,
        cancel: &CancellationToken,
        handler: Option<MessageHandler>,
        opts: &[StreamOpt],
    ) -> Result<()> {
        if self.state.is_streaming() {
            return Err(ConsumerError::ConsumerBusy);
        }
        let Some(handler) = handler else {
            return Err(ConsumerError::HandlerRequired);
        };
        let config = self.js.config();
        let mut request = PullRequest {
            batch: config.stream_batch,
            expires: config.stream_expiry,
            ..Default::default()
        };
        for opt in opts {
            opt.apply(&mut request)?;
        }
        request.validate()?;
        check_stream_batch(request.batch)?;
        if !self.state.try_start_streaming() {
            return Err(ConsumerError::ConsumerBusy);
        }

        let cancel = cancel.child_token();
        let (pending_tx, pending_rx) = mpsc::channel(request.batch * 2);
        let (error_tx, error_rx) = mpsc::channel(1);
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(1);
        let drained = Arc::new(Notify::new());
        let heartbeat = request.heartbeat;
        tracing::debug!(
            stream = %self.stream,
            consumer = %self.name,
            batch = request.batch,
            expires = ?request.expires,
            heartbeat = ?heartbeat,
            "stream started"
        );

        let fetch_task = tokio::spawn(
            FetchLoop {
                fetcher: self.fetcher.clone(),
                request,
                pending: pending_tx,
                errors: error_tx,
                heartbeats: heartbeat_tx,
                drained: Arc::clone(&drained),
                cancel: cancel.clone(),
            }
            .run(),
        );
        tokio::spawn(
            DispatchLoop {
                state: Arc::clone(&self.state),
                label: format!("{}/{}", self.stream, self.name),
                heartbeat,
                pending: pending_rx,
                errors: error_rx,
                heartbeats: heartbeat_rx,
                drained,
                cancel,
                fetch_task,
                handler,
            }
            .run(),
        );
        Ok(())
    }
}

struct FetchLoop {
    fetcher: BatchFetcher,
    request: PullRequest,
    pending: mpsc::Sender<JetStreamMessage>,
    errors: mpsc::Sender<ConsumerError>,
    heartbeats: mpsc::Sender<()>,
    drained: Arc<Notify>,
    cancel: CancellationToken,
}

impl FetchLoop {
    async fn run(self) {
        let capacity = self.pending.max_capacity();
        loop {
            let queued = capacity - self.pending.capacity();
            metrics::gauge!("jetpull_stream_pending").set(queued as f64);
            if queued >= self.request.batch {
                // A full batch is already waiting for the handler.
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.drained.notified() => continue,
                }
            }

            let deadline = deadline_after(self.request.expires.saturating_add(EXPIRY_MARGIN));
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                outcome = self.fetcher.fetch(
                    deadline,
                    &self.request,
                    &self.pending,
                    Some(&self.heartbeats),
                ) => outcome,
            };
            match outcome {
                Ok(()) => {}
                Err(err) if err.is_empty_outcome() => {
                    tracing::trace!(error = %err, "empty pull, retrying");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "stream fetch failed");
                    metrics::counter!("jetpull_stream_errors_total").increment(1);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        sent = self.errors.send(err) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        tracing::trace!("stream fetch loop exited");
    }
}

struct DispatchLoop {
    state: Arc<ConsumerState>,
    label: String,
    heartbeat: std::time::Duration,
    pending: mpsc::Receiver<JetStreamMessage>,
    errors: mpsc::Receiver<ConsumerError>,
    heartbeats: mpsc::Receiver<()>,
    drained: Arc<Notify>,
    cancel: CancellationToken,
    fetch_task: JoinHandle<()>,
    handler: MessageHandler,
}

impl DispatchLoop {
    async fn run(mut self) {
        let watch_heartbeats = !self.heartbeat.is_zero();
        let dead_man = tokio::time::sleep_until(heartbeat_deadline(self.heartbeat));
        tokio::pin!(dead_man);
        let mut fetch_exited = false;
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(message) = self.pending.recv() => {
                    self.drained.notify_one();
                    (self.handler)(Ok(message));
                }
                Some(err) = self.errors.recv() => (self.handler)(Err(err)),
                joined = &mut self.fetch_task => {
                    fetch_exited = true;
                    let reason = match joined {
                        Ok(()) => "fetch loop exited".to_string(),
                        Err(err) => err.to_string(),
                    };
                    tracing::warn!(
                        consumer = %self.label,
                        reason = %reason,
                        "stream fetch task stopped unexpectedly"
                    );
                    metrics::counter!("jetpull_stream_errors_total").increment(1);
                    (self.handler)(Err(ConsumerError::FetchStopped(reason)));
                    break;
                }
                Some(()) = self.heartbeats.recv() => {}
                _ = &mut dead_man, if watch_heartbeats => {
                    tracing::warn!(
                        consumer = %self.label,
                        heartbeat = ?self.heartbeat,
                        "no heartbeat received, stopping stream"
                    );
                    metrics::counter!("jetpull_heartbeat_lost_total").increment(1);
                    (self.handler)(Err(ConsumerError::NoHeartbeat));
                    self.cancel.cancel();
                    break;
                }
            }
            dead_man.as_mut().reset(heartbeat_deadline(self.heartbeat));
        }

        self.cancel.cancel();
        if !fetch_exited
            && let Err(err) = self.fetch_task.await
        {
            tracing::warn!(error = %err, consumer = %self.label, "stream fetch task failed");
        }
        self.state.release_subscription();
        self.state.finish_streaming();
        tracing::debug!(consumer = %self.label, "stream stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn dispatch_reports_dead_fetch_task_and_releases_consumer() {
        let state = Arc::new(ConsumerState::new());
        assert!(state.try_start_streaming());
        let (_pending_tx, pending_rx) = mpsc::channel(2);
        let (_error_tx, error_rx) = mpsc::channel(1);
        let (_heartbeat_tx, heartbeat_rx) = mpsc::channel(1);
        let fetch_task = tokio::spawn(async { panic!("fetch loop crashed") });
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let handler: MessageHandler = Box::new(move |delivery: Result<JetStreamMessage>| {
            let _ = seen_tx.send(delivery);
        });
        let cancel = CancellationToken::new();

        let dispatch = DispatchLoop {
            state: Arc::clone(&state),
            label: "ORDERS/worker".to_string(),
            heartbeat: Duration::ZERO,
            pending: pending_rx,
            errors: error_rx,
            heartbeats: heartbeat_rx,
            drained: Arc::new(Notify::new()),
            cancel: cancel.clone(),
            fetch_task,
            handler,
        };
        tokio::time::timeout(Duration::from_secs(2), dispatch.run())
            .await
            .expect("dispatch stops on its own");

        let delivery = seen_rx.recv().await.expect("failure reported");
        assert!(matches!(
            delivery,
            Err(ConsumerError::FetchStopped(reason)) if reason.contains("panicked")
        ));
        assert!(seen_rx.recv().await.is_none());
        assert!(!state.is_streaming());
        assert!(cancel.is_cancelled());
    }
}
