// Admin/pull API subjects and the JSON error envelope.
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_API_PREFIX: &str = "$JS.API";

pub const ERR_CODE_CONSUMER_NOT_FOUND: u16 = 10014;
pub const ERR_CODE_STREAM_NOT_FOUND: u16 = 10059;
pub const ERR_CODE_CONSUMER_EXISTS: u16 = 10148;
pub const ERR_CODE_BAD_REQUEST: u16 = 10003;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("api error {code} (err_code {err_code}): {description}")]
pub struct ApiError {
    pub code: u16,
    #[serde(default)]
    pub err_code: u16,
    #[serde(default)]
    pub description: String,
}

impl ApiError {
    pub fn new(code: u16, err_code: u16, description: impl Into<String>) -> Self {
        Self {
            code,
            err_code,
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: ApiError,
}

/// Decodes an admin API reply: either the success payload or the `error`
/// envelope the server sends instead.
///
/// ```
/// use jetpull_wire::{ConsumerDeleteResponse, decode_api_response};
///
/// let ok = decode_api_response::<ConsumerDeleteResponse>(br#"{"success":true}"#).expect("json");
/// assert!(ok.expect("api ok").success);
///
/// let err = decode_api_response::<ConsumerDeleteResponse>(
///     br#"{"error":{"code":404,"err_code":10014,"description":"consumer not found"}}"#,
/// )
/// .expect("json");
/// assert_eq!(err.expect_err("api error").err_code, 10014);
/// ```
pub fn decode_api_response<T: DeserializeOwned>(
    payload: &[u8],
) -> Result<std::result::Result<T, ApiError>> {
    let mut value: serde_json::Value =
        serde_json::from_slice(payload).map_err(Error::Deserialize)?;
    if let Some(error) = value.get_mut("error").map(serde_json::Value::take)
        && !error.is_null()
    {
        let error: ApiError = serde_json::from_value(error).map_err(Error::Deserialize)?;
        return Ok(Err(error));
    }
    serde_json::from_value(value)
        .map(Ok)
        .map_err(Error::Deserialize)
}

/// API endpoints addressed by the client, relative to the API prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiSubject {
    ConsumerCreate { stream: String },
    DurableCreate { stream: String, durable: String },
    ConsumerInfo { stream: String, consumer: String },
    ConsumerDelete { stream: String, consumer: String },
    RequestNext { stream: String, consumer: String },
}

impl ApiSubject {
    pub fn render(&self, prefix: &str) -> String {
        let suffix = match self {
            ApiSubject::ConsumerCreate { stream } => format!("CONSUMER.CREATE.{stream}"),
            ApiSubject::DurableCreate { stream, durable } => {
                format!("CONSUMER.DURABLE.CREATE.{stream}.{durable}")
            }
            ApiSubject::ConsumerInfo { stream, consumer } => {
                format!("CONSUMER.INFO.{stream}.{consumer}")
            }
            ApiSubject::ConsumerDelete { stream, consumer } => {
                format!("CONSUMER.DELETE.{stream}.{consumer}")
            }
            ApiSubject::RequestNext { stream, consumer } => {
                format!("CONSUMER.MSG.NEXT.{stream}.{consumer}")
            }
        };
        if prefix.is_empty() {
            return suffix;
        }
        format!("{}.{suffix}", prefix.trim_end_matches('.'))
    }

    /// Inverse of [`ApiSubject::render`]; `None` for subjects outside the
    /// consumer API.
    pub fn parse(prefix: &str, subject: &str) -> Option<Self> {
        let prefix = prefix.trim_end_matches('.');
        let rest = if prefix.is_empty() {
            subject
        } else {
            subject.strip_prefix(prefix)?.strip_prefix('.')?
        };
        let tokens: Vec<&str> = rest.split('.').collect();
        match tokens.as_slice() {
            ["CONSUMER", "CREATE", stream] => Some(ApiSubject::ConsumerCreate {
                stream: stream.to_string(),
            }),
            ["CONSUMER", "DURABLE", "CREATE", stream, durable] => Some(ApiSubject::DurableCreate {
                stream: stream.to_string(),
                durable: durable.to_string(),
            }),
            ["CONSUMER", "INFO", stream, consumer] => Some(ApiSubject::ConsumerInfo {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
            }),
            ["CONSUMER", "DELETE", stream, consumer] => Some(ApiSubject::ConsumerDelete {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
            }),
            ["CONSUMER", "MSG", "NEXT", stream, consumer] => Some(ApiSubject::RequestNext {
                stream: stream.to_string(),
                consumer: consumer.to_string(),
            }),
            _ => None,
        }
    }
}
