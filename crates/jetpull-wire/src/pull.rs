// Pull request published to the per-consumer "request next batch" subject.
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::duration::{is_default, nanos};
use crate::{Error, Result};

/// Request for the next batch of messages from a pull consumer.
///
/// Zero / false fields are omitted on the wire so the broker applies its own
/// defaults for them.
///
/// ```
/// use jetpull_wire::PullRequest;
/// use std::time::Duration;
///
/// let request = PullRequest {
///     batch: 10,
///     expires: Duration::from_secs(5),
///     ..Default::default()
/// };
/// let encoded = request.encode().expect("encode");
/// assert_eq!(&encoded[..], br#"{"expires":5000000000,"batch":10}"#);
/// assert_eq!(PullRequest::decode(&encoded).expect("decode"), request);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    #[serde(with = "nanos", default, skip_serializing_if = "is_default")]
    pub expires: Duration,
    #[serde(default, skip_serializing_if = "is_default")]
    pub batch: usize,
    #[serde(default, skip_serializing_if = "is_default")]
    pub max_bytes: usize,
    #[serde(default, skip_serializing_if = "is_default")]
    pub no_wait: bool,
    #[serde(
        rename = "idle_heartbeat",
        with = "nanos",
        default,
        skip_serializing_if = "is_default"
    )]
    pub heartbeat: Duration,
}

impl PullRequest {
    pub fn new(batch: usize) -> Self {
        Self {
            batch,
            ..Default::default()
        }
    }

    /// Checks the invariants the broker relies on before anything is sent.
    pub fn validate(&self) -> Result<()> {
        if self.batch < 1 {
            return Err(Error::InvalidPullRequest(
                "batch size must be at least 1".to_string(),
            ));
        }
        // At least one heartbeat must fit inside the request lifetime.
        if !self.heartbeat.is_zero() && self.heartbeat >= self.expires {
            return Err(Error::InvalidPullRequest(format!(
                "idle heartbeat {:?} must be less than expiry {:?}",
                self.heartbeat, self.expires
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(Error::Serialize)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(Error::Deserialize)
    }
}
