//! Connection Contract
//!
//! The interface every transport variant implements, together with the
//! request/response value types that cross it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::error::Result;
use crate::params::Terminator;

// ============================================================================
// Payload
// ============================================================================

/// Data handed to `send()` or delivered by a receive callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Text(text) => text.is_empty(),
            Payload::Binary(bytes) => bytes.is_empty(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(bytes) => bytes,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Text(text) => text.into_bytes(),
            Payload::Binary(bytes) => bytes,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Binary(bytes) => std::str::from_utf8(bytes).ok(),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Text(String::new())
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Text(text) => f.write_str(text),
            Payload::Binary(bytes) => {
                for (i, b) in bytes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{:02X}", b)?;
                }
                Ok(())
            },
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Binary(bytes.to_vec())
    }
}

// ============================================================================
// Send request
// ============================================================================

/// HTTP method of a request/response exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestMethod {
    #[default]
    Get,
    Post,
}

/// Everything a caller can pass to [`Connection::send`]
///
/// Only `payload` is used by every variant; the remaining fields are read by
/// the variants they concern and ignored by the others.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendRequest {
    /// URL, text or raw bytes depending on the transport
    pub payload: Payload,
    #[serde(alias = "request_method")]
    pub method: RequestMethod,
    pub headers: BTreeMap<String, String>,
    /// Query parameters for GET, JSON body for POST
    pub data: serde_json::Map<String, serde_json::Value>,
    pub cookies: BTreeMap<String, String>,
    /// Multipart form field name to file path
    pub files: BTreeMap<String, PathBuf>,
    /// Serial reply framing; `None` means no reply is read
    pub limit_response: Option<Terminator>,
}

impl SendRequest {
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn post(mut self) -> Self {
        self.method = RequestMethod::Post;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn with_file(mut self, field: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.files.insert(field.into(), path.into());
        self
    }

    pub fn limit_response(mut self, limit: impl Into<Terminator>) -> Self {
        self.limit_response = Some(limit.into());
        self
    }
}

impl From<&str> for SendRequest {
    fn from(payload: &str) -> Self {
        SendRequest::new(payload)
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Per-connection counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkStats {
    pub open_attempts: u64,
    pub successful_opens: u64,
    pub disconnections: u64,
    pub sends: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub last_connection: Option<SystemTime>,
}

impl LinkStats {
    pub fn record_open_attempt(&mut self) {
        self.open_attempts += 1;
    }

    pub fn record_successful_open(&mut self) {
        self.successful_opens += 1;
        self.last_connection = Some(SystemTime::now());
    }

    pub fn record_disconnection(&mut self) {
        self.disconnections += 1;
    }

    pub fn record_send(&mut self, bytes: usize) {
        self.sends += 1;
        self.bytes_sent += bytes as u64;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.frames_received += 1;
        self.bytes_received += bytes as u64;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ============================================================================
// Contract
// ============================================================================

/// Uniform lifecycle of every transport variant
///
/// All methods take `&self`: variants keep their mutable state behind
/// interior mutability so a connection can be shared with its own worker
/// threads and with callbacks.
pub trait Connection: Send + Sync + fmt::Debug {
    /// Transport type tag (e.g. "serial")
    fn kind(&self) -> &str;

    /// Human-readable connection name
    fn name(&self) -> &str;

    /// Establish the transport and start listener threads.
    ///
    /// Returns the connected state after the attempt.
    fn open(&self) -> bool;

    /// Tear down the transport. Returns only after every worker thread
    /// started by this connection has terminated. Safe to call when closed.
    fn close(&self);

    /// Send a request, opening the connection first if auto-connect is set.
    ///
    /// Returns the reply for request/response transports and `None` for
    /// transports that deliver data through the receive callback.
    fn send(&self, request: &SendRequest) -> Result<Option<Payload>>;

    fn connected(&self) -> bool;

    fn stats(&self) -> LinkStats;

    /// Whether `value` is the expected reply to `command`
    fn check_reply(&self, _command: &str, _value: &Payload) -> bool {
        false
    }

    /// Key-value pairs of diagnostic information
    fn diagnostics(&self) -> HashMap<String, String> {
        let stats = self.stats();
        let mut diag = HashMap::new();
        diag.insert("kind".to_string(), self.kind().to_string());
        diag.insert("name".to_string(), self.name().to_string());
        diag.insert("connected".to_string(), self.connected().to_string());
        diag.insert("sends".to_string(), stats.sends.to_string());
        diag.insert(
            "frames_received".to_string(),
            stats.frames_received.to_string(),
        );
        diag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_helpers() {
        assert!(Payload::from("").is_empty());
        assert!(Payload::Binary(Vec::new()).is_empty());
        assert_eq!(Payload::from("abc").as_bytes(), b"abc");
        assert_eq!(Payload::from(vec![1u8, 0xAB]).to_string(), "01 AB");
        assert_eq!(Payload::from(&b"ok"[..]).as_text(), Some("ok"));
    }

    #[test]
    fn test_send_request_from_plugin_dict() {
        let request: SendRequest = serde_json::from_value(json!({
            "payload": "http://device/cmd",
            "request_method": "post",
            "headers": {"X-Token": "abc"},
            "data": {"volume": 10},
        }))
        .unwrap();

        assert_eq!(request.payload, Payload::from("http://device/cmd"));
        assert_eq!(request.method, RequestMethod::Post);
        assert_eq!(request.headers.get("X-Token").map(String::as_str), Some("abc"));
        assert_eq!(request.data.get("volume"), Some(&json!(10)));
        assert!(request.limit_response.is_none());
    }

    #[test]
    fn test_send_request_builder() {
        let request = SendRequest::new("PWR?")
            .limit_response(&b"\r"[..])
            .with_cookie("session", "1");
        assert_eq!(request.method, RequestMethod::Get);
        assert_eq!(request.limit_response, Some(Terminator::Bytes(b"\r".to_vec())));
        assert_eq!(request.cookies.len(), 1);
    }
}
