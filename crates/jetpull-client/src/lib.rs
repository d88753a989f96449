// Pull-consumer client for a JetStream-style API.
//
// DELIVERY MODEL
// --------------
// Every delivery path bottoms out in one primitive: publish a pull request
// to `<prefix>.CONSUMER.MSG.NEXT.<stream>.<consumer>` with the consumer's
// private inbox as reply subject, then read that inbox until the batch is
// complete or a status reply ends the pull.
//
// - `next` runs one pull of batch 1 and treats "nothing arrived in time" as
//   an empty result rather than an error.
// - `stream` runs two tasks: a fetcher that keeps at most one pull in flight
//   and never lets more than one batch sit unconsumed, and a dispatcher that
//   is the only caller of the user handler.
// - Idle heartbeats feed a dead-man timer. Two missed intervals tear down
//   the inbox so a stuck pull cannot leak replies into the next one.
//
// The inbox is created lazily, shared by all operations on one consumer, and
// only ever replaced after a teardown.
mod compare;
mod config;
mod consumer;
mod error;
mod jetstream;
mod message;
mod options;

pub use compare::compare_consumer_config;
pub use config::ClientConfig;
pub use consumer::{MessageHandler, PullConsumer};
pub use error::{ConsumerError, Result};
pub use jetstream::{JetStream, validate_durable_name};
pub use message::{JetStreamMessage, MessageMetadata};
pub use options::{NextOpt, StreamOpt};
