// Message headers and classification of pull replies.
pub const STATUS_HEADER: &str = "Status";
pub const DESCRIPTION_HEADER: &str = "Description";
// Stream subject of a message delivered to a pull inbox.
pub const SUBJECT_HEADER: &str = "Nats-Subject";

pub const STATUS_IDLE_HEARTBEAT: u16 = 100;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_NO_MESSAGES: u16 = 404;
pub const STATUS_REQUEST_TIMEOUT: u16 = 408;
pub const STATUS_CONFLICT: u16 = 409;
pub const STATUS_NO_RESPONDERS: u16 = 503;

/// Ordered header list. Lookups are case-insensitive and return the first
/// value stored under a name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Headers of an empty-payload status reply.
    pub fn status(code: u16, description: impl Into<String>) -> Self {
        let mut headers = Self::new();
        headers.insert(STATUS_HEADER, code.to_string());
        let description = description.into();
        if !description.is_empty() {
            headers.insert(DESCRIPTION_HEADER, description);
        }
        headers
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Numeric status code, if a `Status` header is present.
    pub fn status_code(&self) -> Option<u16> {
        let raw = self.get(STATUS_HEADER)?.trim();
        raw.get(..3).unwrap_or(raw).parse().ok()
    }
}

/// What a reply on a pull inbox means to the fetcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyKind {
    User,
    IdleHeartbeat,
    NoMessages,
    RequestTimeout,
    NoResponders,
    Status { code: u16, description: String },
}

/// Classifies a reply received on a pull inbox.
///
/// Anything carrying a payload, or lacking a `Status` header, is a user
/// message.
///
/// ```
/// use jetpull_wire::{Headers, ReplyKind, classify_reply};
///
/// let heartbeat = Headers::status(100, "Idle Heartbeat");
/// assert_eq!(classify_reply(Some(&heartbeat), b""), ReplyKind::IdleHeartbeat);
/// assert_eq!(classify_reply(None, b"payload"), ReplyKind::User);
/// ```
pub fn classify_reply(headers: Option<&Headers>, payload: &[u8]) -> ReplyKind {
    if !payload.is_empty() {
        return ReplyKind::User;
    }
    let Some(headers) = headers else {
        return ReplyKind::User;
    };
    if headers.get(STATUS_HEADER).is_none() {
        return ReplyKind::User;
    }
    let description = headers.get(DESCRIPTION_HEADER).unwrap_or_default();
    match headers.status_code() {
        Some(STATUS_IDLE_HEARTBEAT) => ReplyKind::IdleHeartbeat,
        Some(STATUS_NO_MESSAGES) => ReplyKind::NoMessages,
        Some(STATUS_REQUEST_TIMEOUT) => ReplyKind::RequestTimeout,
        Some(STATUS_NO_RESPONDERS) => ReplyKind::NoResponders,
        code => ReplyKind::Status {
            code: code.unwrap_or_default(),
            description: description.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_headers_are_classified() {
        let cases = [
            (STATUS_IDLE_HEARTBEAT, ReplyKind::IdleHeartbeat),
            (STATUS_NO_MESSAGES, ReplyKind::NoMessages),
            (STATUS_REQUEST_TIMEOUT, ReplyKind::RequestTimeout),
            (STATUS_NO_RESPONDERS, ReplyKind::NoResponders),
        ];
        for (code, expected) in cases {
            let headers = Headers::status(code, "");
            assert_eq!(classify_reply(Some(&headers), b""), expected, "code {code}");
        }
    }

    #[test]
    fn unknown_status_keeps_description() {
        let headers = Headers::status(STATUS_CONFLICT, "Consumer Deleted");
        assert_eq!(
            classify_reply(Some(&headers), b""),
            ReplyKind::Status {
                code: 409,
                description: "Consumer Deleted".to_string()
            }
        );
    }

    #[test]
    fn payload_wins_over_status_header() {
        let headers = Headers::status(STATUS_NO_MESSAGES, "No Messages");
        assert_eq!(classify_reply(Some(&headers), b"data"), ReplyKind::User);
    }

    #[test]
    fn empty_message_without_status_is_user_message() {
        let mut headers = Headers::new();
        headers.insert("X-Trace", "abc");
        assert_eq!(classify_reply(Some(&headers), b""), ReplyKind::User);
        assert_eq!(classify_reply(None, b""), ReplyKind::User);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.insert("status", "404 No Messages");
        assert_eq!(headers.get("Status"), Some("404 No Messages"));
        assert_eq!(headers.status_code(), Some(404));
    }
}
