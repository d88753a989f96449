// Consumer configuration and info payloads of the admin API.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::duration::{is_default, nanos, nanos_vec};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    // Start from the first message in the stream.
    #[default]
    #[serde(alias = "undefined")]
    All,
    // Start with the last message in the stream.
    Last,
    // Only messages published after the consumer was created.
    New,
    // Start at `opt_start_seq`.
    ByStartSequence,
    // Start at `opt_start_time`.
    ByStartTime,
    // Last message of every subject.
    LastPerSubject,
}

impl fmt::Display for DeliverPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeliverPolicy::All => "all",
            DeliverPolicy::Last => "last",
            DeliverPolicy::New => "new",
            DeliverPolicy::ByStartSequence => "by_start_sequence",
            DeliverPolicy::ByStartTime => "by_start_time",
            DeliverPolicy::LastPerSubject => "last_per_subject",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    #[default]
    None,
    // Acking a sequence implicitly acks everything below it.
    All,
    Explicit,
}

impl fmt::Display for AckPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AckPolicy::None => "AckNone",
            AckPolicy::All => "AckAll",
            AckPolicy::Explicit => "AckExplicit",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
    #[default]
    Instant,
    // Keep the original publish timing between messages.
    Original,
}

impl fmt::Display for ReplayPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplayPolicy::Instant => "instant",
            ReplayPolicy::Original => "original",
        };
        f.write_str(name)
    }
}

/// Consumer configuration as exchanged with the admin API.
///
/// ```
/// use jetpull_wire::{AckPolicy, ConsumerConfig};
///
/// let config = ConsumerConfig::durable("orders-worker").with_ack_policy(AckPolicy::Explicit);
/// let json = serde_json::to_value(&config).expect("encode");
/// assert_eq!(json["durable_name"], "orders-worker");
/// assert_eq!(json["ack_policy"], "explicit");
/// assert!(json.get("ack_wait").is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    #[serde(rename = "durable_name", skip_serializing_if = "Option::is_none")]
    pub durable: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub deliver_policy: DeliverPolicy,
    #[serde(skip_serializing_if = "is_default")]
    pub opt_start_seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opt_start_time: Option<DateTime<Utc>>,
    pub ack_policy: AckPolicy,
    #[serde(with = "nanos", skip_serializing_if = "is_default")]
    pub ack_wait: Duration,
    #[serde(skip_serializing_if = "is_default")]
    pub max_deliver: i64,
    #[serde(rename = "backoff", with = "nanos_vec", skip_serializing_if = "Vec::is_empty")]
    pub back_off: Vec<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_subject: Option<String>,
    pub replay_policy: ReplayPolicy,
    // Bits per second.
    #[serde(rename = "rate_limit_bps", skip_serializing_if = "is_default")]
    pub rate_limit: u64,
    #[serde(rename = "sample_freq", skip_serializing_if = "Option::is_none")]
    pub sample_frequency: Option<String>,
    #[serde(skip_serializing_if = "is_default")]
    pub max_waiting: i64,
    #[serde(skip_serializing_if = "is_default")]
    pub max_ack_pending: i64,
    #[serde(skip_serializing_if = "is_default")]
    pub flow_control: bool,
    #[serde(rename = "idle_heartbeat", with = "nanos", skip_serializing_if = "is_default")]
    pub heartbeat: Duration,
    #[serde(skip_serializing_if = "is_default")]
    pub headers_only: bool,

    // Pull options.
    #[serde(rename = "max_batch", skip_serializing_if = "is_default")]
    pub max_request_batch: i64,
    #[serde(rename = "max_expires", with = "nanos", skip_serializing_if = "is_default")]
    pub max_request_expires: Duration,

    // Push options; carried so server configs round-trip unchanged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deliver_subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deliver_group: Option<String>,

    // Ephemeral inactivity threshold.
    #[serde(with = "nanos", skip_serializing_if = "is_default")]
    pub inactive_threshold: Duration,

    #[serde(rename = "num_replicas")]
    pub replicas: usize,
    #[serde(rename = "mem_storage", skip_serializing_if = "is_default")]
    pub memory_storage: bool,
}

impl ConsumerConfig {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            durable: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn ephemeral() -> Self {
        Self::default()
    }

    pub fn with_deliver_policy(mut self, policy: DeliverPolicy) -> Self {
        self.deliver_policy = policy;
        self
    }

    pub fn with_ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    pub fn with_filter_subject(mut self, subject: impl Into<String>) -> Self {
        self.filter_subject = Some(subject.into());
        self
    }

    pub fn with_opt_start_seq(mut self, seq: u64) -> Self {
        self.opt_start_seq = seq;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceInfo {
    #[serde(rename = "consumer_seq")]
    pub consumer: u64,
    #[serde(rename = "stream_seq")]
    pub stream: u64,
    #[serde(rename = "last_active", default, skip_serializing_if = "Option::is_none")]
    pub last: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencePair {
    #[serde(rename = "consumer_seq")]
    pub consumer: u64,
    #[serde(rename = "stream_seq")]
    pub stream: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerInfo {
    pub name: String,
    pub current: bool,
    #[serde(skip_serializing_if = "is_default")]
    pub offline: bool,
    #[serde(with = "nanos")]
    pub active: Duration,
    #[serde(skip_serializing_if = "is_default")]
    pub lag: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub replicas: Vec<PeerInfo>,
}

/// Consumer state snapshot returned by create and info calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerInfo {
    #[serde(rename = "stream_name")]
    pub stream: String,
    pub name: String,
    pub created: DateTime<Utc>,
    pub config: ConsumerConfig,
    pub delivered: SequenceInfo,
    pub ack_floor: SequenceInfo,
    pub num_ack_pending: i64,
    pub num_redelivered: i64,
    pub num_waiting: i64,
    pub num_pending: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterInfo>,
    #[serde(skip_serializing_if = "is_default")]
    pub push_bound: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateConsumerRequest {
    #[serde(rename = "stream_name")]
    pub stream: String,
    pub config: ConsumerConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerDeleteResponse {
    #[serde(default)]
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deliver_policy_accepts_undefined_alias() {
        let policy: DeliverPolicy = serde_json::from_str("\"undefined\"").expect("decode");
        assert_eq!(policy, DeliverPolicy::All);
        let policy: DeliverPolicy = serde_json::from_str("\"last_per_subject\"").expect("decode");
        assert_eq!(policy, DeliverPolicy::LastPerSubject);
        assert!(serde_json::from_str::<DeliverPolicy>("\"sometimes\"").is_err());
    }

    #[test]
    fn policies_display_like_the_api_names() {
        assert_eq!(DeliverPolicy::ByStartTime.to_string(), "by_start_time");
        assert_eq!(AckPolicy::Explicit.to_string(), "AckExplicit");
        assert_eq!(ReplayPolicy::Original.to_string(), "original");
    }

    #[test]
    fn consumer_config_durations_are_nanos() {
        let config = ConsumerConfig {
            ack_wait: Duration::from_secs(30),
            back_off: vec![Duration::from_secs(1), Duration::from_secs(5)],
            ..ConsumerConfig::durable("dur")
        };
        let value = serde_json::to_value(&config).expect("encode");
        assert_eq!(value["ack_wait"], 30_000_000_000i64);
        assert_eq!(
            value["backoff"],
            serde_json::json!([1_000_000_000i64, 5_000_000_000i64])
        );
        assert_eq!(value["num_replicas"], 0);
        let decoded: ConsumerConfig = serde_json::from_value(value).expect("decode");
        assert_eq!(decoded, config);
    }

    #[test]
    fn consumer_info_decodes_server_payload() {
        let payload = r#"{
            "stream_name": "ORDERS",
            "name": "worker",
            "created": "2024-03-01T12:00:00Z",
            "config": {"durable_name": "worker", "deliver_policy": "all", "ack_policy": "explicit", "replay_policy": "instant", "num_replicas": 1},
            "delivered": {"consumer_seq": 4, "stream_seq": 9, "last_active": "2024-03-01T12:05:00Z"},
            "ack_floor": {"consumer_seq": 3, "stream_seq": 8},
            "num_ack_pending": 1,
            "num_redelivered": 0,
            "num_waiting": 2,
            "num_pending": 17
        }"#;
        let info: ConsumerInfo = serde_json::from_str(payload).expect("decode");
        assert_eq!(info.stream, "ORDERS");
        assert_eq!(info.config.durable.as_deref(), Some("worker"));
        assert_eq!(info.config.ack_policy, AckPolicy::Explicit);
        assert_eq!(info.delivered.stream, 9);
        assert!(info.delivered.last.is_some());
        assert!(info.ack_floor.last.is_none());
        assert_eq!(info.num_pending, 17);
        assert!(info.cluster.is_none());
    }
}
