// Delivered messages and the metadata encoded in their ack subject.
use bytes::Bytes;
use chrono::{DateTime, Utc};
use jetpull_transport::Message;
use jetpull_wire::status::SUBJECT_HEADER;
use jetpull_wire::{Headers, SequencePair};

use crate::{ConsumerError, Result};

const ACK_PREFIX: &str = "$JS.ACK";
// `$JS.ACK.<stream>.<consumer>.<delivered>.<sseq>.<cseq>.<ts>.<pending>`
const V1_TOKEN_COUNT: usize = 9;
// `$JS.ACK.<domain>.<account>.<stream>...<pending>[.<token>]`
const V2_MIN_TOKEN_COUNT: usize = 11;
const NO_DOMAIN: &str = "_";

/// A user message handed out by `next` or `stream`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JetStreamMessage {
    message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    pub domain: Option<String>,
    pub stream: String,
    pub consumer: String,
    pub num_delivered: u64,
    pub sequence: SequencePair,
    pub timestamp: DateTime<Utc>,
    pub num_pending: u64,
}

impl JetStreamMessage {
    pub(crate) fn new(message: Message) -> Self {
        Self { message }
    }

    /// Stream subject the message was published on.
    pub fn subject(&self) -> &str {
        self.message
            .headers
            .as_ref()
            .and_then(|headers| headers.get(SUBJECT_HEADER))
            .unwrap_or(self.message.subject.as_str())
    }

    pub fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    pub fn headers(&self) -> Option<&Headers> {
        self.message.headers.as_ref()
    }

    pub fn reply(&self) -> Option<&str> {
        self.message.reply.as_deref()
    }

    pub fn into_inner(self) -> Message {
        self.message
    }

    pub fn metadata(&self) -> Result<MessageMetadata> {
        let reply = self.reply().unwrap_or_default();
        parse_ack_subject(reply)
            .ok_or_else(|| ConsumerError::NotJetStreamMessage(reply.to_string()))
    }
}

fn parse_ack_subject(reply: &str) -> Option<MessageMetadata> {
    if !reply.starts_with(ACK_PREFIX) {
        return None;
    }
    let tokens: Vec<&str> = reply.split('.').collect();
    let (domain, rest) = match tokens.len() {
        V1_TOKEN_COUNT => (None, &tokens[2..]),
        len if len >= V2_MIN_TOKEN_COUNT => {
            let domain = (tokens[2] != NO_DOMAIN).then(|| tokens[2].to_string());
            (domain, &tokens[4..])
        }
        _ => return None,
    };
    let number = |idx: usize| rest.get(idx)?.parse::<u64>().ok();
    let timestamp = rest.get(5)?.parse::<i64>().ok()?;
    Some(MessageMetadata {
        domain,
        stream: rest.first()?.to_string(),
        consumer: rest.get(1)?.to_string(),
        num_delivered: number(2)?,
        sequence: SequencePair {
            stream: number(3)?,
            consumer: number(4)?,
        },
        timestamp: DateTime::from_timestamp_nanos(timestamp),
        num_pending: number(6)?,
    })
}
