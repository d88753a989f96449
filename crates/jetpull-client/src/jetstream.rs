// Admin requests against the consumer API.
use bytes::Bytes;
use jetpull_transport::Transport;
use jetpull_wire::api::{ERR_CODE_CONSUMER_NOT_FOUND, ERR_CODE_STREAM_NOT_FOUND};
use jetpull_wire::{
    ApiError, ApiSubject, ConsumerConfig, ConsumerDeleteResponse, ConsumerInfo,
    CreateConsumerRequest, decode_api_response,
};
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::{ClientConfig, ConsumerError, PullConsumer, Result, compare_consumer_config};

/// Entry point: a transport plus the client configuration.
#[derive(Clone)]
pub struct JetStream {
    transport: Arc<dyn Transport>,
    config: Arc<ClientConfig>,
}

impl JetStream {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, ClientConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Self {
            transport,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Creates the consumer, or updates it when a durable of that name exists.
    pub async fn create_or_update_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<PullConsumer> {
        if config.deliver_subject.is_some() {
            return Err(ConsumerError::InvalidArgument(
                "push consumers are not supported".to_string(),
            ));
        }
        let subject = match config.durable.as_deref() {
            Some(durable) => {
                validate_durable_name(durable)?;
                ApiSubject::DurableCreate {
                    stream: stream.to_string(),
                    durable: durable.to_string(),
                }
            }
            None => ApiSubject::ConsumerCreate {
                stream: stream.to_string(),
            },
        };
        let body = CreateConsumerRequest {
            stream: stream.to_string(),
            config,
        };
        let payload = serde_json::to_vec(&body).map_err(jetpull_wire::Error::Serialize)?;
        let info: ConsumerInfo = self.api_request(subject, Bytes::from(payload)).await?;
        tracing::debug!(stream, consumer = %info.name, "consumer created");
        Ok(PullConsumer::new(self.clone(), info))
    }

    /// Binds to an existing consumer.
    pub async fn consumer(&self, stream: &str, name: &str) -> Result<PullConsumer> {
        let info = self.consumer_info(stream, name).await?;
        Ok(PullConsumer::new(self.clone(), info))
    }

    /// Binds to the durable named in `config` if it exists and matches,
    /// otherwise creates it. Ephemeral configs always create.
    pub async fn ensure_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<PullConsumer> {
        let Some(durable) = config.durable.clone() else {
            return self.create_or_update_consumer(stream, config).await;
        };
        match self.consumer(stream, &durable).await {
            Ok(consumer) => {
                compare_consumer_config(&consumer.cached_info().config, &config)?;
                Ok(consumer)
            }
            Err(ConsumerError::ConsumerNotFound) => {
                self.create_or_update_consumer(stream, config).await
            }
            Err(err) => Err(err),
        }
    }

    pub async fn delete_consumer(&self, stream: &str, name: &str) -> Result<()> {
        validate_durable_name(name)?;
        let subject = ApiSubject::ConsumerDelete {
            stream: stream.to_string(),
            consumer: name.to_string(),
        };
        let response: ConsumerDeleteResponse = self.api_request(subject, Bytes::new()).await?;
        if !response.success {
            return Err(ConsumerError::Status {
                code: 500,
                description: format!("consumer {name} was not deleted"),
            });
        }
        tracing::debug!(stream, consumer = name, "consumer deleted");
        Ok(())
    }

    pub(crate) async fn consumer_info(&self, stream: &str, name: &str) -> Result<ConsumerInfo> {
        validate_durable_name(name)?;
        let subject = ApiSubject::ConsumerInfo {
            stream: stream.to_string(),
            consumer: name.to_string(),
        };
        self.api_request(subject, Bytes::new()).await
    }

    async fn api_request<T: DeserializeOwned>(
        &self,
        subject: ApiSubject,
        payload: Bytes,
    ) -> Result<T> {
        let subject = subject.render(&self.config.api_prefix);
        let reply = self
            .transport
            .request(&subject, payload, self.config.admin_timeout)
            .await?;
        decode_api_response::<T>(&reply.payload)?.map_err(|err| {
            tracing::debug!(%subject, error = %err, "api request rejected");
            api_error(err)
        })
    }
}

fn api_error(err: ApiError) -> ConsumerError {
    match err.err_code {
        ERR_CODE_CONSUMER_NOT_FOUND => ConsumerError::ConsumerNotFound,
        ERR_CODE_STREAM_NOT_FOUND => ConsumerError::StreamNotFound,
        _ => ConsumerError::Api(err),
    }
}

/// Durable names end up as a subject token, so they may not contain `.`.
pub fn validate_durable_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('.') {
        return Err(ConsumerError::InvalidConsumerName(name.to_string()));
    }
    Ok(())
}
