// Pull request modifiers accepted by `next` and `stream`.
use jetpull_wire::PullRequest;
use std::time::Duration;

use crate::{ConsumerError, Result};

/// Largest `stream` batch. Up to two batches are buffered in one channel.
pub(crate) const MAX_STREAM_BATCH: usize = usize::MAX >> 4;

/// Options for [`crate::PullConsumer::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextOpt {
    // Ask the server to answer right away instead of parking the request.
    NoWait,
    Heartbeat(Duration),
    MaxBytes(usize),
}

/// Options for [`crate::PullConsumer::stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOpt {
    BatchSize(usize),
    Expiry(Duration),
    Heartbeat(Duration),
    MaxBytes(usize),
}

impl NextOpt {
    pub(crate) fn apply(&self, request: &mut PullRequest) -> Result<()> {
        match *self {
            NextOpt::NoWait => request.no_wait = true,
            NextOpt::Heartbeat(interval) => request.heartbeat = positive("heartbeat", interval)?,
            NextOpt::MaxBytes(max_bytes) => request.max_bytes = max_bytes,
        }
        Ok(())
    }
}

impl StreamOpt {
    pub(crate) fn apply(&self, request: &mut PullRequest) -> Result<()> {
        match *self {
            StreamOpt::BatchSize(batch) => {
                check_stream_batch(batch)?;
                request.batch = batch;
            }
            StreamOpt::Expiry(expiry) => request.expires = positive("expiry", expiry)?,
            StreamOpt::Heartbeat(interval) => request.heartbeat = positive("heartbeat", interval)?,
            StreamOpt::MaxBytes(max_bytes) => request.max_bytes = max_bytes,
        }
        Ok(())
    }
}

pub(crate) fn check_stream_batch(batch: usize) -> Result<()> {
    if batch == 0 {
        return Err(ConsumerError::InvalidArgument(
            "batch size must be at least 1".to_string(),
        ));
    }
    if batch > MAX_STREAM_BATCH {
        return Err(ConsumerError::InvalidArgument(format!(
            "batch size {batch} exceeds {MAX_STREAM_BATCH}"
        )));
    }
    Ok(())
}

fn positive(name: &str, value: Duration) -> Result<Duration> {
    if value.is_zero() {
        return Err(ConsumerError::InvalidArgument(format!(
            "{name} must be greater than zero"
        )));
    }
    Ok(value)
}
