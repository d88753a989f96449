// Wire format for the pull-consumer API.
// Everything the client and the in-process broker exchange is JSON with
// durations encoded as integer nanoseconds; status replies are empty-payload
// messages whose meaning lives in the `Status` / `Description` headers.
pub mod api;
pub mod consumer;
mod duration;
pub mod pull;
pub mod status;

pub use api::{ApiError, ApiErrorResponse, ApiSubject, DEFAULT_API_PREFIX, decode_api_response};
pub use consumer::{
    AckPolicy, ClusterInfo, ConsumerConfig, ConsumerDeleteResponse, ConsumerInfo,
    CreateConsumerRequest, DeliverPolicy, PeerInfo, ReplayPolicy, SequenceInfo, SequencePair,
};
pub use pull::PullRequest;
pub use status::{Headers, ReplyKind, classify_reply};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid pull request: {0}")]
    InvalidPullRequest(String),
    #[error("failed to serialize message")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(#[source] serde_json::Error),
}
