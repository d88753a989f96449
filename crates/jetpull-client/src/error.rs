use jetpull_transport::TransportError;
use jetpull_wire::ApiError;

pub type Result<T> = std::result::Result<T, ConsumerError>;

#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no messages")]
    NoMessages,
    #[error("timeout")]
    Timeout,
    #[error("no heartbeat received")]
    NoHeartbeat,
    #[error("consumer has an active streaming operation")]
    ConsumerBusy,
    #[error("message handler is required")]
    HandlerRequired,
    #[error("stream fetch loop stopped: {0}")]
    FetchStopped(String),
    #[error("no responders available for request")]
    NoResponders,
    #[error("unexpected status {code}: {description}")]
    Status { code: u16, description: String },
    #[error("consumer not found")]
    ConsumerNotFound,
    #[error("stream not found")]
    StreamNotFound,
    #[error("invalid consumer name: {0:?}")]
    InvalidConsumerName(String),
    #[error("configuration mismatch: {0}")]
    ConfigMismatch(String),
    #[error("not a jetstream message: {0:?}")]
    NotJetStreamMessage(String),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("wire error: {0}")]
    Wire(#[source] jetpull_wire::Error),
    #[error("transport error: {0}")]
    Transport(#[source] TransportError),
}

impl ConsumerError {
    /// Outcomes that only mean "nothing arrived in time".
    pub fn is_empty_outcome(&self) -> bool {
        matches!(self, ConsumerError::NoMessages | ConsumerError::Timeout)
    }
}

impl From<jetpull_wire::Error> for ConsumerError {
    fn from(err: jetpull_wire::Error) -> Self {
        match err {
            jetpull_wire::Error::InvalidPullRequest(reason) => ConsumerError::InvalidArgument(reason),
            other => ConsumerError::Wire(other),
        }
    }
}

impl From<TransportError> for ConsumerError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => ConsumerError::Timeout,
            TransportError::NoResponders(_) => ConsumerError::NoResponders,
            other => ConsumerError::Transport(other),
        }
    }
}
