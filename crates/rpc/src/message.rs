//! Message value objects exchanged with the transport.

use std::str::Utf8Error;

use bytes::Bytes;
use courier_transport::{Delivery, Headers};
use serde::de::DeserializeOwned;

use crate::error::Result;

/// Header carrying the caller-visible request id.
pub const REQUEST_ID_HEADER: &str = "requestId";

/// Header carrying the logical operation name.
pub const ROUTINE_ID_HEADER: &str = "routineId";

/// Header carrying the progress status of a response.
pub const STATUS_HEADER: &str = "status";

/// Status of an intermediate streaming response.
pub const STATUS_PROGRESS: &str = "progress";

/// Status of a final, successful response.
pub const STATUS_COMPLETED: &str = "completed";

/// Status of a final, failed response.
pub const STATUS_FAILED: &str = "failed";

/// A response (or subscription) message: body plus headers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    headers: Headers,
    payload: Bytes,
}

impl Message {
    /// Creates a message.
    pub fn new(payload: impl Into<Bytes>, headers: Headers) -> Self {
        Self {
            headers,
            payload: payload.into(),
        }
    }

    /// The raw body.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// All headers.
    #[must_use]
    pub const fn headers(&self) -> &Headers {
        &self.headers
    }

    /// A single header value.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// The `status` header, if any.
    #[must_use]
    pub fn status(&self) -> Option<&str> {
        self.header(STATUS_HEADER)
    }

    /// Whether this message ends a streamed response.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.status(), Some(STATUS_COMPLETED | STATUS_FAILED))
    }

    /// Whether the responder flagged this message as a failure.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status() == Some(STATUS_FAILED)
    }

    /// The body as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid UTF-8.
    pub fn text(&self) -> std::result::Result<&str, Utf8Error> {
        std::str::from_utf8(&self.payload)
    }

    /// Decodes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the body does not decode into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Splits the message into body and headers.
    #[must_use]
    pub fn into_parts(self) -> (Bytes, Headers) {
        (self.payload, self.headers)
    }
}

impl From<Delivery> for Message {
    fn from(delivery: Delivery) -> Self {
        Self::new(delivery.payload, delivery.properties.headers)
    }
}

/// A request body. Text is always sent as UTF-8, so text and bytes with the
/// same content produce the same wire bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// Raw bytes, sent as-is.
    Bytes(Bytes),
    /// Text, sent UTF-8 encoded.
    Text(String),
}

impl Payload {
    /// The wire bytes.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Text(text) => Bytes::from(text.into_bytes()),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Payload {
    fn from(bytes: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_and_bytes_share_wire_encoding() {
        let text = Payload::from("héllo").into_bytes();
        let bytes = Payload::from("héllo".as_bytes().to_vec()).into_bytes();
        assert_eq!(text, bytes);
    }

    #[test]
    fn test_terminal_status() {
        let mut headers = Headers::new();
        assert!(!Message::new("x", headers.clone()).is_terminal());

        headers.insert(STATUS_HEADER.to_string(), STATUS_PROGRESS.to_string());
        assert!(!Message::new("x", headers.clone()).is_terminal());

        headers.insert(STATUS_HEADER.to_string(), STATUS_FAILED.to_string());
        let failed = Message::new("boom", headers);
        assert!(failed.is_terminal());
        assert!(failed.is_failed());
        assert_eq!(failed.text().unwrap(), "boom");
    }
}
