// Pull consumer handle and the delivery operations that run on it.
mod fetch;
mod next;
mod state;
mod stream;

use jetpull_wire::{ApiSubject, ConsumerInfo};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::{JetStream, Result};
pub(crate) use fetch::BatchFetcher;
pub(crate) use state::ConsumerState;
pub use stream::MessageHandler;

/// Missed heartbeat intervals after which a pull is considered dead.
const HEARTBEAT_MISSES: u32 = 2;

// Waits longer than this never end in practice.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(wait: Duration) -> Instant {
    Instant::now() + wait.min(FAR_FUTURE)
}

fn heartbeat_deadline(interval: Duration) -> Instant {
    deadline_after(interval.saturating_mul(HEARTBEAT_MISSES))
}

/// Handle on one server-side pull consumer.
///
/// `next` may be called concurrently. `stream` claims the consumer: while it
/// runs, `next` and a second `stream` fail with
/// [`crate::ConsumerError::ConsumerBusy`].
pub struct PullConsumer {
    js: JetStream,
    stream: String,
    name: String,
    durable: bool,
    info: Mutex<ConsumerInfo>,
    pub(crate) state: Arc<ConsumerState>,
    pub(crate) fetcher: BatchFetcher,
}

impl PullConsumer {
    pub(crate) fn new(js: JetStream, info: ConsumerInfo) -> Self {
        let state = Arc::new(ConsumerState::new());
        let request_subject = ApiSubject::RequestNext {
            stream: info.stream.clone(),
            consumer: info.name.clone(),
        }
        .render(&js.config().api_prefix);
        let fetcher = BatchFetcher::new(
            Arc::clone(js.transport()),
            Arc::clone(&state),
            request_subject,
        );
        Self {
            stream: info.stream.clone(),
            name: info.name.clone(),
            durable: info.config.durable.is_some(),
            info: Mutex::new(info),
            js,
            state,
            fetcher,
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.stream
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// True while a `stream` operation owns this consumer.
    pub fn is_streaming(&self) -> bool {
        self.state.is_streaming()
    }

    /// Info as of creation or the last [`PullConsumer::info`] call.
    pub fn cached_info(&self) -> ConsumerInfo {
        self.info.lock().clone()
    }

    /// Fetches fresh info from the server and refreshes the cache.
    pub async fn info(&self) -> Result<ConsumerInfo> {
        let info = self.js.consumer_info(&self.stream, &self.name).await?;
        *self.info.lock() = info.clone();
        Ok(info)
    }
}

impl std::fmt::Debug for PullConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullConsumer")
            .field("stream", &self.stream)
            .field("name", &self.name)
            .field("durable", &self.durable)
            .field("streaming", &self.state.is_streaming())
            .finish()
    }
}
