// Pull-consumer API responder.
// A single actor task owns every stream and consumer. API requests arriving on
// `<prefix>.>`, control commands from `JetStreamServer` handles and the
// expiry/heartbeat tick are serialised through one select loop, so no state is
// shared across tasks.
use ahash::RandomState;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use jetpull_transport::Message;
use jetpull_wire::api::{
    ERR_CODE_BAD_REQUEST, ERR_CODE_CONSUMER_NOT_FOUND, ERR_CODE_STREAM_NOT_FOUND,
};
use jetpull_wire::status::{
    STATUS_BAD_REQUEST, STATUS_CONFLICT, STATUS_IDLE_HEARTBEAT, STATUS_NO_MESSAGES,
    STATUS_NO_RESPONDERS, STATUS_REQUEST_TIMEOUT, SUBJECT_HEADER,
};
use jetpull_wire::{
    AckPolicy, ApiError, ApiErrorResponse, ApiSubject, ConsumerConfig, ConsumerDeleteResponse,
    ConsumerInfo, CreateConsumerRequest, DEFAULT_API_PREFIX, DeliverPolicy, Headers, PullRequest,
    SequenceInfo,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{Broker, BrokerError, BrokerSubscription, Result, subject_matches};

const COMMAND_QUEUE_DEPTH: usize = 64;
const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(5);
const NOT_FOUND: u16 = 404;
const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_ACK_PENDING: i64 = 1000;
const DEFAULT_MAX_WAITING: i64 = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JetStreamServerConfig {
    pub api_prefix: String,
    // Resolution of request expiry and idle heartbeats.
    pub tick_interval: Duration,
}

impl Default for JetStreamServerConfig {
    fn default() -> Self {
        Self {
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

impl JetStreamServerConfig {
    pub fn with_api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.api_prefix = prefix.into();
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}

enum Command {
    AddStream {
        name: String,
        response: oneshot::Sender<Result<()>>,
    },
    Publish {
        stream: String,
        subject: String,
        payload: Bytes,
        response: oneshot::Sender<Result<u64>>,
    },
    SuspendHeartbeats {
        suspended: bool,
        response: oneshot::Sender<()>,
    },
    WaitingRequests {
        stream: String,
        consumer: String,
        response: oneshot::Sender<Option<usize>>,
    },
}

/// Handle to a running pull API responder.
///
/// Dropping the handle stops the actor task.
pub struct JetStreamServer {
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl JetStreamServer {
    /// Subscribes to `<api_prefix>.>` on `broker` and spawns the actor task.
    /// Must be called from within a Tokio runtime.
    pub fn start(broker: Arc<Broker>, config: JetStreamServerConfig) -> Result<Self> {
        if config.tick_interval.is_zero() {
            return Err(BrokerError::InvalidConfig(
                "tick interval must be non-zero".to_string(),
            ));
        }
        let api_prefix = config.api_prefix.trim_end_matches('.').to_string();
        let api = broker.subscribe(&format!("{api_prefix}.>"))?;
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        let state = ServerState {
            broker,
            api_prefix,
            streams: HashMap::with_hasher(RandomState::new()),
            consumers: HashMap::with_hasher(RandomState::new()),
            heartbeats_suspended: false,
        };
        let task = tokio::spawn(run_server(
            state,
            api,
            rx,
            cancel.clone(),
            config.tick_interval,
        ));
        tracing::info!(prefix = %config.api_prefix, "pull api responder started");
        Ok(Self {
            commands: tx,
            cancel,
            task: Some(task),
        })
    }

    pub async fn add_stream(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let name = name.to_string();
        self.call(|response| Command::AddStream { name, response })
            .await?
    }

    /// Appends a message to `stream`; returns its stream sequence.
    pub async fn publish(
        &self,
        stream: &str,
        subject: &str,
        payload: impl Into<Bytes>,
    ) -> Result<u64> {
        let stream = stream.to_string();
        let subject = subject.to_string();
        let payload = payload.into();
        self.call(|response| Command::Publish {
            stream,
            subject,
            payload,
            response,
        })
        .await?
    }

    /// Stops (or resumes) idle heartbeats for every waiting pull request.
    pub async fn suspend_heartbeats(&self, suspended: bool) -> Result<()> {
        self.call(|response| Command::SuspendHeartbeats {
            suspended,
            response,
        })
        .await
    }

    /// Number of pull requests parked on a consumer, `None` if it does not exist.
    pub async fn waiting_requests(&self, stream: &str, consumer: &str) -> Result<Option<usize>> {
        let stream = stream.to_string();
        let consumer = consumer.to_string();
        self.call(|response| Command::WaitingRequests {
            stream,
            consumer,
            response,
        })
        .await
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| BrokerError::ServerStopped)?;
        rx.await.map_err(|_| BrokerError::ServerStopped)
    }
}

impl Drop for JetStreamServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_server(
    mut state: ServerState,
    api: BrokerSubscription,
    mut commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,
    tick_interval: Duration,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => state.apply(command).await,
                None => break,
            },
            request = api.recv() => match request {
                Some(request) => state.handle_api(request).await,
                None => break,
            },
            _ = ticker.tick() => state.on_tick().await,
        }
    }
    api.unsubscribe();
    tracing::debug!("pull api responder stopped");
}

struct StoredMessage {
    seq: u64,
    subject: String,
    payload: Bytes,
    timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct StreamLog {
    // messages[i] has sequence i + 1.
    messages: Vec<StoredMessage>,
}

impl StreamLog {
    fn last_seq(&self) -> u64 {
        self.messages.len() as u64
    }

    fn append(&mut self, subject: String, payload: Bytes) -> u64 {
        let seq = self.last_seq() + 1;
        self.messages.push(StoredMessage {
            seq,
            subject,
            payload,
            timestamp: Utc::now(),
        });
        seq
    }

    fn from_seq(&self, seq: u64) -> impl Iterator<Item = &StoredMessage> {
        let skip = usize::try_from(seq.saturating_sub(1)).unwrap_or(usize::MAX);
        self.messages.iter().skip(skip)
    }

    fn next_matching(&self, seq: u64, filter: Option<&str>) -> Option<&StoredMessage> {
        self.from_seq(seq)
            .find(|stored| filter.is_none_or(|filter| subject_matches(filter, &stored.subject)))
    }

    fn pending(&self, seq: u64, filter: Option<&str>) -> u64 {
        self.from_seq(seq)
            .filter(|stored| filter.is_none_or(|filter| subject_matches(filter, &stored.subject)))
            .count() as u64
    }

    fn start_seq(&self, config: &ConsumerConfig) -> u64 {
        match config.deliver_policy {
            DeliverPolicy::All | DeliverPolicy::LastPerSubject => 1,
            DeliverPolicy::New => self.last_seq() + 1,
            DeliverPolicy::Last => self.last_seq().max(1),
            DeliverPolicy::ByStartSequence => config.opt_start_seq,
            DeliverPolicy::ByStartTime => {
                let Some(start) = config.opt_start_time else {
                    return 1;
                };
                self.messages
                    .iter()
                    .find(|stored| stored.timestamp >= start)
                    .map_or(self.last_seq() + 1, |stored| stored.seq)
            }
        }
    }
}

struct WaitingPull {
    reply: String,
    remaining: usize,
    // Zero means unbounded.
    max_bytes: usize,
    expires_at: Option<Instant>,
    heartbeat: Duration,
    last_activity: Instant,
    delivered: usize,
}

struct ConsumerCursor {
    info: ConsumerInfo,
    next_seq: u64,
    delivered: SequenceInfo,
    waiting: VecDeque<WaitingPull>,
}

impl ConsumerCursor {
    fn snapshot(&self, stream: &StreamLog) -> ConsumerInfo {
        let filter = self.info.config.filter_subject.as_deref();
        let mut info = self.info.clone();
        info.delivered = self.delivered.clone();
        // Acks are not tracked; everything delivered counts as acknowledged.
        info.ack_floor = self.delivered.clone();
        info.num_waiting = self.waiting.len() as i64;
        info.num_pending = stream.pending(self.next_seq, filter);
        info
    }
}

type ConsumerKey = (String, String);

struct ServerState {
    broker: Arc<Broker>,
    api_prefix: String,
    streams: HashMap<String, StreamLog, RandomState>,
    consumers: HashMap<ConsumerKey, ConsumerCursor, RandomState>,
    heartbeats_suspended: bool,
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn bad_request(description: impl Into<String>) -> ApiError {
    ApiError::new(STATUS_BAD_REQUEST, ERR_CODE_BAD_REQUEST, description)
}

fn stream_not_found() -> ApiError {
    ApiError::new(NOT_FOUND, ERR_CODE_STREAM_NOT_FOUND, "stream not found")
}

fn consumer_not_found() -> ApiError {
    ApiError::new(NOT_FOUND, ERR_CODE_CONSUMER_NOT_FOUND, "consumer not found")
}

impl ServerState {
    async fn apply(&mut self, command: Command) {
        match command {
            Command::AddStream { name, response } => {
                let outcome = if self.streams.contains_key(&name) {
                    Err(BrokerError::StreamExists(name))
                } else {
                    tracing::debug!(stream = %name, "stream added");
                    self.streams.insert(name, StreamLog::default());
                    Ok(())
                };
                let _ = response.send(outcome);
            }
            Command::Publish {
                stream,
                subject,
                payload,
                response,
            } => {
                let Some(log) = self.streams.get_mut(&stream) else {
                    let _ = response.send(Err(BrokerError::StreamNotFound(stream)));
                    return;
                };
                let seq = log.append(subject, payload);
                let _ = response.send(Ok(seq));
                let names: Vec<String> = self
                    .consumers
                    .keys()
                    .filter(|(owner, _)| *owner == stream)
                    .map(|(_, name)| name.clone())
                    .collect();
                for name in names {
                    self.serve_consumer(&(stream.clone(), name)).await;
                }
            }
            Command::SuspendHeartbeats {
                suspended,
                response,
            } => {
                self.heartbeats_suspended = suspended;
                let _ = response.send(());
            }
            Command::WaitingRequests {
                stream,
                consumer,
                response,
            } => {
                let waiting = self
                    .consumers
                    .get(&(stream, consumer))
                    .map(|cursor| cursor.waiting.len());
                let _ = response.send(waiting);
            }
        }
    }

    async fn handle_api(&mut self, request: Message) {
        let Some(subject) = ApiSubject::parse(&self.api_prefix, &request.subject) else {
            tracing::debug!(subject = %request.subject, "unknown api subject");
            let outcome: ApiResult<()> = Err(bad_request("unknown api subject"));
            self.respond(request.reply.as_deref(), outcome).await;
            return;
        };
        let reply = request.reply.as_deref();
        match subject {
            ApiSubject::ConsumerCreate { stream } => {
                metrics::counter!("jetpull_server_api_requests_total", "api" => "create")
                    .increment(1);
                let outcome = self.create_consumer(&stream, None, &request.payload);
                self.respond(reply, outcome).await;
            }
            ApiSubject::DurableCreate { stream, durable } => {
                metrics::counter!("jetpull_server_api_requests_total", "api" => "create")
                    .increment(1);
                let outcome = self.create_consumer(&stream, Some(durable), &request.payload);
                self.respond(reply, outcome).await;
            }
            ApiSubject::ConsumerInfo { stream, consumer } => {
                metrics::counter!("jetpull_server_api_requests_total", "api" => "info")
                    .increment(1);
                let outcome = self.consumer_info(&stream, &consumer);
                self.respond(reply, outcome).await;
            }
            ApiSubject::ConsumerDelete { stream, consumer } => {
                metrics::counter!("jetpull_server_api_requests_total", "api" => "delete")
                    .increment(1);
                let outcome = self.delete_consumer(&stream, &consumer).await;
                self.respond(reply, outcome).await;
            }
            ApiSubject::RequestNext { stream, consumer } => {
                metrics::counter!("jetpull_server_api_requests_total", "api" => "next")
                    .increment(1);
                let Some(reply) = request.reply.clone() else {
                    tracing::debug!(%stream, %consumer, "pull request without reply subject");
                    return;
                };
                self.request_next(stream, consumer, reply, &request.payload)
                    .await;
            }
        }
    }

    fn create_consumer(
        &mut self,
        stream: &str,
        durable: Option<String>,
        payload: &[u8],
    ) -> ApiResult<ConsumerInfo> {
        let request: CreateConsumerRequest = serde_json::from_slice(payload)
            .map_err(|err| bad_request(format!("invalid consumer create request: {err}")))?;
        if request.stream != stream {
            return Err(bad_request("stream name in subject does not match request"));
        }
        let mut config = request.config;
        if let Some(durable) = durable {
            match config.durable.as_deref() {
                Some(name) if name != durable => {
                    return Err(bad_request(
                        "consumer name in subject does not match durable name in request",
                    ));
                }
                Some(_) => {}
                None => config.durable = Some(durable),
            }
        }
        if config.deliver_subject.is_some() {
            return Err(bad_request("push consumers are not supported"));
        }
        match config.deliver_policy {
            DeliverPolicy::ByStartSequence if config.opt_start_seq == 0 => {
                return Err(bad_request("consumer deliver policy requires a start sequence"));
            }
            DeliverPolicy::ByStartTime if config.opt_start_time.is_none() => {
                return Err(bad_request("consumer deliver policy requires a start time"));
            }
            _ => {}
        }
        let Some(log) = self.streams.get(stream) else {
            return Err(stream_not_found());
        };
        apply_server_defaults(&mut config);
        let name = match &config.durable {
            Some(name) => {
                validate_name(name).map_err(|_| bad_request("invalid consumer name"))?;
                name.clone()
            }
            None => ephemeral_name(),
        };
        let key = (stream.to_string(), name.clone());
        if let Some(existing) = self.consumers.get_mut(&key) {
            if existing.info.config.deliver_policy != config.deliver_policy {
                return Err(bad_request("deliver policy can not be updated"));
            }
            existing.info.config = config;
            tracing::debug!(%stream, consumer = %name, "consumer updated");
            return Ok(existing.snapshot(log));
        }
        let next_seq = log.start_seq(&config);
        let cursor = ConsumerCursor {
            info: ConsumerInfo {
                stream: stream.to_string(),
                name: name.clone(),
                created: Utc::now(),
                config,
                ..Default::default()
            },
            next_seq,
            delivered: SequenceInfo::default(),
            waiting: VecDeque::new(),
        };
        let info = cursor.snapshot(log);
        tracing::debug!(%stream, consumer = %name, start = cursor.next_seq, "consumer created");
        self.consumers.insert(key, cursor);
        Ok(info)
    }

    fn consumer_info(&self, stream: &str, consumer: &str) -> ApiResult<ConsumerInfo> {
        let log = self.streams.get(stream).ok_or_else(stream_not_found)?;
        let cursor = self
            .consumers
            .get(&(stream.to_string(), consumer.to_string()))
            .ok_or_else(consumer_not_found)?;
        Ok(cursor.snapshot(log))
    }

    async fn delete_consumer(
        &mut self,
        stream: &str,
        consumer: &str,
    ) -> ApiResult<ConsumerDeleteResponse> {
        if !self.streams.contains_key(stream) {
            return Err(stream_not_found());
        }
        let cursor = self
            .consumers
            .remove(&(stream.to_string(), consumer.to_string()))
            .ok_or_else(consumer_not_found)?;
        for pull in cursor.waiting {
            self.send_status(&pull.reply, STATUS_CONFLICT, "Consumer Deleted")
                .await;
        }
        tracing::debug!(%stream, %consumer, "consumer deleted");
        Ok(ConsumerDeleteResponse { success: true })
    }

    async fn request_next(
        &mut self,
        stream: String,
        consumer: String,
        reply: String,
        payload: &[u8],
    ) {
        let key = (stream, consumer);
        let Some(cursor) = self.consumers.get_mut(&key) else {
            // Nothing listens on the subject of a consumer that does not exist.
            self.send_status(&reply, STATUS_NO_RESPONDERS, "No Responders")
                .await;
            return;
        };
        let request = match PullRequest::decode(payload) {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!(error = %err, "malformed pull request");
                self.send_status(&reply, STATUS_BAD_REQUEST, "Bad Request")
                    .await;
                return;
            }
        };
        let config = &cursor.info.config;
        let batch = request.batch.max(1);
        let limit = if config.max_request_batch > 0 && batch as i64 > config.max_request_batch {
            Some(format!("Exceeded MaxRequestBatch of {}", config.max_request_batch))
        } else if !config.max_request_expires.is_zero()
            && request.expires > config.max_request_expires
        {
            Some(format!(
                "Exceeded MaxRequestExpires of {:?}",
                config.max_request_expires
            ))
        } else if config.max_waiting > 0 && cursor.waiting.len() as i64 >= config.max_waiting {
            Some("Exceeded MaxWaiting".to_string())
        } else {
            None
        };
        if let Some(description) = limit {
            self.send_status(&reply, STATUS_CONFLICT, &description).await;
            return;
        }
        let now = Instant::now();
        cursor.waiting.push_back(WaitingPull {
            reply: reply.clone(),
            remaining: batch,
            max_bytes: request.max_bytes,
            expires_at: (!request.expires.is_zero())
                .then(|| now.checked_add(request.expires))
                .flatten(),
            heartbeat: request.heartbeat,
            last_activity: now,
            delivered: 0,
        });
        self.serve_consumer(&key).await;
        if !request.no_wait {
            return;
        }
        // no_wait: whatever could not be served right away ends the request.
        let Some(cursor) = self.consumers.get_mut(&key) else {
            return;
        };
        let Some(position) = cursor.waiting.iter().position(|pull| pull.reply == reply) else {
            return;
        };
        if let Some(pull) = cursor.waiting.remove(position) {
            let (code, description) = if pull.delivered == 0 {
                (STATUS_NO_MESSAGES, "No Messages")
            } else {
                (STATUS_REQUEST_TIMEOUT, "Request Timeout")
            };
            self.send_status(&pull.reply, code, description).await;
        }
    }

    /// Hands available messages to the consumer's waiting pull requests in
    /// arrival order.
    async fn serve_consumer(&mut self, key: &ConsumerKey) {
        loop {
            let (Some(cursor), Some(log)) = (self.consumers.get_mut(key), self.streams.get(&key.0))
            else {
                return;
            };
            let Some(pull) = cursor.waiting.front() else {
                return;
            };
            let filter = cursor.info.config.filter_subject.as_deref();
            let Some(stored) = log.next_matching(cursor.next_seq, filter) else {
                return;
            };
            let reply = pull.reply.clone();
            if pull.max_bytes > 0 && stored.payload.len() > pull.max_bytes {
                cursor.waiting.pop_front();
                self.send_status(&reply, STATUS_CONFLICT, "Message Size Exceeds MaxBytes")
                    .await;
                continue;
            }
            let consumer_seq = cursor.delivered.consumer + 1;
            let pending = log.pending(stored.seq + 1, filter);
            let timestamp = stored.timestamp.timestamp_nanos_opt().unwrap_or_default();
            let mut headers = Headers::new();
            headers.insert(SUBJECT_HEADER, stored.subject.clone());
            let delivery = Message::new(reply.clone(), stored.payload.clone())
                .with_headers(headers)
                .with_reply(format!(
                    "$JS.ACK.{}.{}.1.{}.{consumer_seq}.{timestamp}.{pending}",
                    key.0, key.1, stored.seq
                ));
            let seq = stored.seq;
            let payload_len = stored.payload.len();

            let matched = self.broker.publish(delivery).await.unwrap_or_default();
            let Some(cursor) = self.consumers.get_mut(key) else {
                return;
            };
            if matched == 0 {
                // The requester is gone; keep the message for the next pull.
                tracing::trace!(%reply, "dropping pull request without listener");
                cursor.waiting.pop_front();
                continue;
            }
            metrics::counter!("jetpull_server_delivered_total").increment(1);
            cursor.next_seq = seq + 1;
            cursor.delivered = SequenceInfo {
                consumer: consumer_seq,
                stream: seq,
                last: Some(Utc::now()),
            };
            let Some(pull) = cursor.waiting.front_mut() else {
                return;
            };
            pull.remaining -= 1;
            pull.delivered += 1;
            pull.last_activity = Instant::now();
            if pull.max_bytes > 0 {
                pull.max_bytes = pull.max_bytes.saturating_sub(payload_len).max(1);
            }
            if pull.remaining == 0 {
                cursor.waiting.pop_front();
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        let suspended = self.heartbeats_suspended;
        let mut outbound = Vec::new();
        for cursor in self.consumers.values_mut() {
            cursor.waiting.retain_mut(|pull| {
                if pull.expires_at.is_some_and(|at| at <= now) {
                    outbound.push((pull.reply.clone(), STATUS_REQUEST_TIMEOUT, "Request Timeout"));
                    return false;
                }
                if !suspended
                    && !pull.heartbeat.is_zero()
                    && now.duration_since(pull.last_activity) >= pull.heartbeat
                {
                    pull.last_activity = now;
                    outbound.push((pull.reply.clone(), STATUS_IDLE_HEARTBEAT, "Idle Heartbeat"));
                }
                true
            });
        }
        for (reply, code, description) in outbound {
            if code == STATUS_IDLE_HEARTBEAT {
                metrics::counter!("jetpull_server_heartbeats_total").increment(1);
            }
            if self.send_status(&reply, code, description).await == 0 {
                for cursor in self.consumers.values_mut() {
                    cursor.waiting.retain(|pull| pull.reply != reply);
                }
            }
        }
    }

    async fn send_status(&self, reply: &str, code: u16, description: &str) -> usize {
        match self
            .broker
            .publish(Message::status(reply, code, description))
            .await
        {
            Ok(matched) => matched,
            Err(err) => {
                tracing::warn!(%reply, error = %err, "failed to send status");
                0
            }
        }
    }

    async fn respond<T: Serialize>(&self, reply: Option<&str>, outcome: ApiResult<T>) {
        let Some(reply) = reply else {
            return;
        };
        let encoded = match outcome {
            Ok(body) => serde_json::to_vec(&body),
            Err(error) => serde_json::to_vec(&ApiErrorResponse { error }),
        };
        let payload = match encoded {
            Ok(payload) => Bytes::from(payload),
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode api response");
                return;
            }
        };
        if let Err(err) = self.broker.publish(Message::new(reply, payload)).await {
            tracing::warn!(%reply, error = %err, "failed to send api response");
        }
    }
}

// Fills the fields a server reports back even when the request left them unset.
fn apply_server_defaults(config: &mut ConsumerConfig) {
    if config.max_deliver == 0 {
        config.max_deliver = -1;
    }
    if config.ack_policy != AckPolicy::None {
        if config.ack_wait.is_zero() {
            config.ack_wait = DEFAULT_ACK_WAIT;
        }
        if config.max_ack_pending == 0 {
            config.max_ack_pending = DEFAULT_MAX_ACK_PENDING;
        }
    }
    if config.max_waiting == 0 {
        config.max_waiting = DEFAULT_MAX_WAITING;
    }
}

fn ephemeral_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_uppercase()
}

fn validate_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace());
    if invalid {
        return Err(BrokerError::InvalidSubject(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InProcessConnection;
    use jetpull_transport::{Subscription, Transport, TransportError};
    use jetpull_wire::{ReplyKind, classify_reply, decode_api_response};

    const STREAM: &str = "ORDERS";

    async fn setup() -> (JetStreamServer, InProcessConnection) {
        let broker = Arc::new(Broker::new());
        let server =
            JetStreamServer::start(Arc::clone(&broker), JetStreamServerConfig::default())
                .expect("start");
        server.add_stream(STREAM).await.expect("stream");
        (server, InProcessConnection::new(broker))
    }

    async fn api<T: serde::de::DeserializeOwned>(
        connection: &InProcessConnection,
        subject: ApiSubject,
        body: Bytes,
    ) -> ApiResult<T> {
        let reply = connection
            .request(&subject.render(DEFAULT_API_PREFIX), body, Duration::from_secs(1))
            .await
            .expect("api reply");
        decode_api_response(&reply.payload).expect("json")
    }

    async fn create(connection: &InProcessConnection, config: ConsumerConfig) -> ConsumerInfo {
        let body = serde_json::to_vec(&CreateConsumerRequest {
            stream: STREAM.to_string(),
            config,
        })
        .expect("encode");
        api(
            connection,
            ApiSubject::ConsumerCreate {
                stream: STREAM.to_string(),
            },
            Bytes::from(body),
        )
        .await
        .expect("create")
    }

    async fn pull(
        connection: &InProcessConnection,
        consumer: &str,
        request: PullRequest,
    ) -> Arc<dyn Subscription> {
        let inbox = connection.new_inbox();
        let sub = connection.subscribe(&inbox).await.expect("inbox");
        let subject = ApiSubject::RequestNext {
            stream: STREAM.to_string(),
            consumer: consumer.to_string(),
        }
        .render(DEFAULT_API_PREFIX);
        connection
            .publish_request(&subject, &inbox, request.encode().expect("encode"))
            .await
            .expect("publish");
        sub
    }

    async fn next_kind(sub: &Arc<dyn Subscription>) -> (ReplyKind, Message) {
        let msg = sub
            .next_msg(Instant::now() + Duration::from_secs(2))
            .await
            .expect("reply");
        (classify_reply(msg.headers.as_ref(), &msg.payload), msg)
    }

    #[tokio::test]
    async fn durable_consumer_lifecycle() {
        let (_server, connection) = setup().await;
        let info = create(&connection, ConsumerConfig::durable("worker")).await;
        assert_eq!(info.name, "worker");
        assert_eq!(info.stream, STREAM);
        assert_eq!(info.config.max_deliver, -1);
        assert_eq!(info.config.max_waiting, 512);

        let fetched: ConsumerInfo = api(
            &connection,
            ApiSubject::ConsumerInfo {
                stream: STREAM.to_string(),
                consumer: "worker".to_string(),
            },
            Bytes::new(),
        )
        .await
        .expect("info");
        assert_eq!(fetched.created, info.created);

        let deleted: ConsumerDeleteResponse = api(
            &connection,
            ApiSubject::ConsumerDelete {
                stream: STREAM.to_string(),
                consumer: "worker".to_string(),
            },
            Bytes::new(),
        )
        .await
        .expect("delete");
        assert!(deleted.success);

        let err = api::<ConsumerInfo>(
            &connection,
            ApiSubject::ConsumerInfo {
                stream: STREAM.to_string(),
                consumer: "worker".to_string(),
            },
            Bytes::new(),
        )
        .await
        .expect_err("gone");
        assert_eq!(err.err_code, ERR_CODE_CONSUMER_NOT_FOUND);
    }

    #[tokio::test]
    async fn create_on_missing_stream_reports_stream_not_found() {
        let (_server, connection) = setup().await;
        let body = serde_json::to_vec(&CreateConsumerRequest {
            stream: "MISSING".to_string(),
            config: ConsumerConfig::durable("d"),
        })
        .expect("encode");
        let err = api::<ConsumerInfo>(
            &connection,
            ApiSubject::ConsumerCreate {
                stream: "MISSING".to_string(),
            },
            Bytes::from(body),
        )
        .await
        .expect_err("missing stream");
        assert_eq!(err.err_code, ERR_CODE_STREAM_NOT_FOUND);
        assert_eq!(err.code, 404);
    }

    #[tokio::test]
    async fn ephemeral_consumers_get_generated_names() {
        let (_server, connection) = setup().await;
        let first = create(&connection, ConsumerConfig::ephemeral()).await;
        let second = create(&connection, ConsumerConfig::ephemeral()).await;
        assert_eq!(first.name.len(), 8);
        assert_ne!(first.name, second.name);
    }

    #[tokio::test]
    async fn pull_delivers_with_ack_metadata() {
        let (server, connection) = setup().await;
        server
            .publish(STREAM, "orders.new", "first")
            .await
            .expect("publish");
        create(&connection, ConsumerConfig::durable("worker")).await;

        let sub = pull(&connection, "worker", PullRequest::new(1)).await;
        let (kind, msg) = next_kind(&sub).await;
        assert_eq!(kind, ReplyKind::User);
        assert_eq!(msg.payload, "first");
        assert_eq!(
            msg.headers.as_ref().and_then(|h| h.get(SUBJECT_HEADER)),
            Some("orders.new")
        );
        let ack = msg.reply.expect("ack subject");
        assert!(ack.starts_with("$JS.ACK.ORDERS.worker.1.1.1."), "{ack}");
        assert!(ack.ends_with(".0"), "{ack}");
    }

    #[tokio::test]
    async fn waiting_pull_is_served_by_later_publish() {
        let (server, connection) = setup().await;
        create(&connection, ConsumerConfig::durable("worker")).await;
        let sub = pull(&connection, "worker", PullRequest::new(2)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            server.waiting_requests(STREAM, "worker").await.expect("waiting"),
            Some(1)
        );
        server.publish(STREAM, "orders.new", "a").await.expect("publish");
        server.publish(STREAM, "orders.new", "b").await.expect("publish");
        assert_eq!(next_kind(&sub).await.1.payload, "a");
        assert_eq!(next_kind(&sub).await.1.payload, "b");
        assert_eq!(
            server.waiting_requests(STREAM, "worker").await.expect("waiting"),
            Some(0)
        );
    }

    #[tokio::test]
    async fn no_wait_on_empty_consumer_replies_no_messages() {
        let (_server, connection) = setup().await;
        create(&connection, ConsumerConfig::durable("worker")).await;
        let request = PullRequest {
            no_wait: true,
            ..PullRequest::new(5)
        };
        let sub = pull(&connection, "worker", request).await;
        assert_eq!(next_kind(&sub).await.0, ReplyKind::NoMessages);
    }

    #[tokio::test]
    async fn expired_pull_replies_request_timeout() {
        let (_server, connection) = setup().await;
        create(&connection, ConsumerConfig::durable("worker")).await;
        let request = PullRequest {
            expires: Duration::from_millis(30),
            ..PullRequest::new(1)
        };
        let sub = pull(&connection, "worker", request).await;
        assert_eq!(next_kind(&sub).await.0, ReplyKind::RequestTimeout);
    }

    #[tokio::test]
    async fn pull_with_unbounded_expiry_stays_waiting() {
        let (server, connection) = setup().await;
        create(&connection, ConsumerConfig::durable("worker")).await;
        let request = PullRequest {
            expires: Duration::MAX,
            ..PullRequest::new(1)
        };
        let sub = pull(&connection, "worker", request).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            server.waiting_requests(STREAM, "worker").await.expect("waiting"),
            Some(1)
        );
        server.publish(STREAM, "orders.new", "late").await.expect("publish");
        let (kind, msg) = next_kind(&sub).await;
        assert_eq!(kind, ReplyKind::User);
        assert_eq!(msg.payload, "late");
    }

    #[tokio::test]
    async fn idle_pull_receives_heartbeats_until_suspended() {
        let (server, connection) = setup().await;
        create(&connection, ConsumerConfig::durable("worker")).await;
        let request = PullRequest {
            expires: Duration::from_secs(5),
            heartbeat: Duration::from_millis(20),
            ..PullRequest::new(1)
        };
        let sub = pull(&connection, "worker", request).await;
        assert_eq!(next_kind(&sub).await.0, ReplyKind::IdleHeartbeat);
        assert_eq!(next_kind(&sub).await.0, ReplyKind::IdleHeartbeat);

        server.suspend_heartbeats(true).await.expect("suspend");
        // Drain anything sent before the suspension took effect.
        while sub
            .next_msg(Instant::now() + Duration::from_millis(10))
            .await
            .is_ok()
        {}
        let quiet = sub
            .next_msg(Instant::now() + Duration::from_millis(80))
            .await
            .expect_err("no heartbeat");
        assert_eq!(quiet, TransportError::Timeout);
    }

    #[tokio::test]
    async fn deleting_consumer_fails_waiting_pulls() {
        let (_server, connection) = setup().await;
        create(&connection, ConsumerConfig::durable("worker")).await;
        let sub = pull(&connection, "worker", PullRequest::new(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _: ConsumerDeleteResponse = api(
            &connection,
            ApiSubject::ConsumerDelete {
                stream: STREAM.to_string(),
                consumer: "worker".to_string(),
            },
            Bytes::new(),
        )
        .await
        .expect("delete");
        assert_eq!(
            next_kind(&sub).await.0,
            ReplyKind::Status {
                code: STATUS_CONFLICT,
                description: "Consumer Deleted".to_string()
            }
        );
    }

    #[tokio::test]
    async fn pull_on_unknown_consumer_has_no_responders() {
        let (_server, connection) = setup().await;
        let sub = pull(&connection, "ghost", PullRequest::new(1)).await;
        assert_eq!(next_kind(&sub).await.0, ReplyKind::NoResponders);
    }

    #[tokio::test]
    async fn filter_subject_skips_other_messages() {
        let (server, connection) = setup().await;
        server.publish(STREAM, "orders.eu", "eu").await.expect("publish");
        server.publish(STREAM, "orders.us", "us").await.expect("publish");
        create(
            &connection,
            ConsumerConfig::durable("us-only").with_filter_subject("orders.us"),
        )
        .await;
        let sub = pull(&connection, "us-only", PullRequest::new(1)).await;
        assert_eq!(next_kind(&sub).await.1.payload, "us");
    }

    #[tokio::test]
    async fn deliver_new_skips_existing_messages() {
        let (server, connection) = setup().await;
        server.publish(STREAM, "orders.old", "old").await.expect("publish");
        let info = create(
            &connection,
            ConsumerConfig::durable("fresh").with_deliver_policy(DeliverPolicy::New),
        )
        .await;
        assert_eq!(info.num_pending, 0);
        server.publish(STREAM, "orders.new", "new").await.expect("publish");
        let sub = pull(&connection, "fresh", PullRequest::new(1)).await;
        assert_eq!(next_kind(&sub).await.1.payload, "new");
    }

    #[tokio::test]
    async fn adding_a_stream_twice_fails() {
        let (server, _connection) = setup().await;
        assert_eq!(
            server.add_stream(STREAM).await,
            Err(BrokerError::StreamExists(STREAM.to_string()))
        );
        assert!(matches!(
            server.add_stream("bad.name").await,
            Err(BrokerError::InvalidSubject(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_releases_api_subscription() {
        let broker = Arc::new(Broker::new());
        let server = JetStreamServer::start(Arc::clone(&broker), JetStreamServerConfig::default())
            .expect("start");
        server.shutdown().await;
        // The api subscription is released with the actor.
        assert_eq!(broker.subscriber_count(), 0);
    }
}
