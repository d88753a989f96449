use jetpull_wire::ConsumerConfig;
use std::fmt::Debug;

use crate::{ConsumerError, Result};

/// Checks that an existing consumer's config satisfies a requested one.
///
/// Fields the server fills with its own defaults (`ack_wait`, `max_waiting`,
/// `max_ack_pending`, `opt_start_time`) only count when the request set them,
/// and a requested `max_deliver` of 0 matches the server's unlimited `-1`.
/// The first differing field is reported.
pub fn compare_consumer_config(server: &ConsumerConfig, requested: &ConsumerConfig) -> Result<()> {
    let s = server;
    let u = requested;
    if u.durable != s.durable {
        return Err(mismatch("durable", &u.durable, &s.durable));
    }
    if u.description != s.description {
        return Err(mismatch("description", &u.description, &s.description));
    }
    if u.deliver_policy != s.deliver_policy {
        return Err(mismatch("deliver policy", &u.deliver_policy, &s.deliver_policy));
    }
    if u.opt_start_seq != s.opt_start_seq {
        return Err(mismatch("optional start sequence", &u.opt_start_seq, &s.opt_start_seq));
    }
    if u.opt_start_time.is_some() && u.opt_start_time != s.opt_start_time {
        return Err(mismatch("optional start time", &u.opt_start_time, &s.opt_start_time));
    }
    if u.ack_policy != s.ack_policy {
        return Err(mismatch("ack policy", &u.ack_policy, &s.ack_policy));
    }
    if !u.ack_wait.is_zero() && u.ack_wait != s.ack_wait {
        return Err(mismatch("ack wait", &u.ack_wait, &s.ack_wait));
    }
    if !(u.max_deliver == 0 && s.max_deliver == -1) && u.max_deliver != s.max_deliver {
        return Err(mismatch("max deliver", &u.max_deliver, &s.max_deliver));
    }
    if u.back_off != s.back_off {
        return Err(mismatch("backoff", &u.back_off, &s.back_off));
    }
    if u.filter_subject != s.filter_subject {
        return Err(mismatch("filter subject", &u.filter_subject, &s.filter_subject));
    }
    if u.replay_policy != s.replay_policy {
        return Err(mismatch("replay policy", &u.replay_policy, &s.replay_policy));
    }
    if u.rate_limit != s.rate_limit {
        return Err(mismatch("rate limit", &u.rate_limit, &s.rate_limit));
    }
    if u.sample_frequency != s.sample_frequency {
        return Err(mismatch("sample frequency", &u.sample_frequency, &s.sample_frequency));
    }
    if u.max_waiting != 0 && u.max_waiting != s.max_waiting {
        return Err(mismatch("max waiting", &u.max_waiting, &s.max_waiting));
    }
    if u.max_ack_pending != 0 && u.max_ack_pending != s.max_ack_pending {
        return Err(mismatch("max ack pending", &u.max_ack_pending, &s.max_ack_pending));
    }
    if u.flow_control != s.flow_control {
        return Err(mismatch("flow control", &u.flow_control, &s.flow_control));
    }
    if u.heartbeat != s.heartbeat {
        return Err(mismatch("heartbeat", &u.heartbeat, &s.heartbeat));
    }
    if u.headers_only != s.headers_only {
        return Err(mismatch("headers only", &u.headers_only, &s.headers_only));
    }
    if u.max_request_batch != s.max_request_batch {
        return Err(mismatch("max request batch", &u.max_request_batch, &s.max_request_batch));
    }
    if u.max_request_expires != s.max_request_expires {
        return Err(mismatch(
            "max request expires",
            &u.max_request_expires,
            &s.max_request_expires,
        ));
    }
    if u.deliver_subject != s.deliver_subject {
        return Err(mismatch("deliver subject", &u.deliver_subject, &s.deliver_subject));
    }
    if u.deliver_group != s.deliver_group {
        return Err(mismatch("deliver group", &u.deliver_group, &s.deliver_group));
    }
    if u.inactive_threshold != s.inactive_threshold {
        return Err(mismatch(
            "inactive threshold",
            &u.inactive_threshold,
            &s.inactive_threshold,
        ));
    }
    if u.replicas != s.replicas {
        return Err(mismatch("replicas", &u.replicas, &s.replicas));
    }
    if u.memory_storage != s.memory_storage {
        return Err(mismatch("memory storage", &u.memory_storage, &s.memory_storage));
    }
    Ok(())
}

fn mismatch(field: &str, requested: &impl Debug, server: &impl Debug) -> ConsumerError {
    ConsumerError::ConfigMismatch(format!(
        "configuration requests {field} to be {requested:?}, but consumer's value is {server:?}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jetpull_wire::{AckPolicy, DeliverPolicy};
    use std::time::Duration;

    fn server_config() -> ConsumerConfig {
        ConsumerConfig {
            max_deliver: -1,
            ack_wait: Duration::from_secs(30),
            max_waiting: 512,
            max_ack_pending: 1000,
            ..ConsumerConfig::durable("worker")
        }
    }

    #[test]
    fn server_defaults_satisfy_unset_fields() {
        let requested = ConsumerConfig::durable("worker");
        compare_consumer_config(&server_config(), &requested).expect("match");
    }

    #[test]
    fn explicit_values_must_match() {
        let requested = ConsumerConfig {
            max_waiting: 10,
            ..ConsumerConfig::durable("worker")
        };
        let err = compare_consumer_config(&server_config(), &requested).expect_err("mismatch");
        assert!(
            matches!(&err, ConsumerError::ConfigMismatch(msg) if msg.contains("max waiting to be 10")),
            "{err}"
        );

        let requested = ConsumerConfig::durable("worker").with_deliver_policy(DeliverPolicy::New);
        let err = compare_consumer_config(&server_config(), &requested).expect_err("mismatch");
        assert!(err.to_string().contains("deliver policy"));
    }

    #[test]
    fn first_differing_field_is_reported() {
        let requested = ConsumerConfig {
            description: Some("audit".to_string()),
            ..ConsumerConfig::durable("worker").with_ack_policy(AckPolicy::Explicit)
        };
        let err = compare_consumer_config(&server_config(), &requested).expect_err("mismatch");
        assert!(err.to_string().contains("description"));
        assert!(!err.to_string().contains("ack policy"));
    }

    #[test]
    fn max_deliver_zero_matches_unlimited_only() {
        let mut server = server_config();
        let requested = ConsumerConfig::durable("worker");
        server.max_deliver = 5;
        let err = compare_consumer_config(&server, &requested).expect_err("mismatch");
        assert!(err.to_string().contains("max deliver"));
    }
}
