//! Connection Parameter Set
//!
//! Every option a transport variant understands, with a default for each one,
//! so downstream code never has to branch on "option present". Raw values from
//! plugin configuration (often plain strings) are coerced by the flexible
//! deserializers at the bottom of this module.

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::callbacks::LinkCallbacks;
use crate::constants::{MIN_POLL_INTERVAL, TIMEOUT_MULTIPLIER};
use crate::error::{LinkError, Result};

// ============================================================================
// Frame terminator
// ============================================================================

/// How a byte stream is cut into frames
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Terminator {
    /// No framing: read until timeout / pass chunks through
    #[default]
    None,
    /// Fixed-length frames of N bytes
    Length(usize),
    /// Frames end with (and include) this byte sequence
    Bytes(Vec<u8>),
}

impl Terminator {
    pub fn is_none(&self) -> bool {
        matches!(self, Terminator::None)
    }

    /// Build a terminator from a configuration string.
    ///
    /// Digits-only strings select fixed-length framing, everything else is a
    /// delimiter with `\r`, `\n`, `\t`, `\0`, `\\` and `\xHH` escapes resolved.
    pub fn parse(raw: &str) -> Self {
        if raw.is_empty() {
            return Terminator::None;
        }
        if raw.bytes().all(|b| b.is_ascii_digit()) {
            return match raw.parse::<usize>() {
                Ok(0) | Err(_) => Terminator::None,
                Ok(n) => Terminator::Length(n),
            };
        }
        Terminator::from_bytes(unescape(raw))
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        if bytes.is_empty() {
            Terminator::None
        } else {
            Terminator::Bytes(bytes)
        }
    }
}

impl From<usize> for Terminator {
    fn from(len: usize) -> Self {
        if len == 0 {
            Terminator::None
        } else {
            Terminator::Length(len)
        }
    }
}

impl From<&[u8]> for Terminator {
    fn from(bytes: &[u8]) -> Self {
        Terminator::from_bytes(bytes)
    }
}

impl<const N: usize> From<&[u8; N]> for Terminator {
    fn from(bytes: &[u8; N]) -> Self {
        Terminator::from_bytes(&bytes[..])
    }
}

impl From<&str> for Terminator {
    fn from(raw: &str) -> Self {
        Terminator::parse(raw)
    }
}

/// Resolve backslash escapes in a configured terminator
fn unescape(raw: &str) -> Vec<u8> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' || i + 1 >= bytes.len() {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        match bytes[i + 1] {
            b'r' => out.push(b'\r'),
            b'n' => out.push(b'\n'),
            b't' => out.push(b'\t'),
            b'0' => out.push(0),
            b'\\' => out.push(b'\\'),
            b'x' if i + 3 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 2..i + 4]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 4;
                        continue;
                    },
                    None => {
                        out.extend_from_slice(&bytes[i..i + 2]);
                    },
                }
            },
            other => {
                out.push(b'\\');
                out.push(other);
            },
        }
        i += 2;
    }
    out
}

fn escape(bytes: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(bytes).ok()?;
    if text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(text.replace('\\', "\\\\"))
}

impl Serialize for Terminator {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Terminator::None => serializer.serialize_str(""),
            Terminator::Length(n) => serializer.serialize_u64(*n as u64),
            Terminator::Bytes(bytes) => match escape(bytes) {
                Some(text) => serializer.serialize_str(&text),
                None => bytes.serialize(serializer),
            },
        }
    }
}

impl<'de> Deserialize<'de> for Terminator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct TerminatorVisitor;

        impl<'de> Visitor<'de> for TerminatorVisitor {
            type Value = Terminator;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte count, a terminator string, a byte list or null")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Terminator, E> {
                Ok(Terminator::from(v as usize))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Terminator, E> {
                if v < 0 {
                    return Err(E::custom(format!("negative terminator length {}", v)));
                }
                Ok(Terminator::from(v as usize))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Terminator, E> {
                Ok(Terminator::parse(v))
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Terminator, E> {
                Ok(Terminator::from_bytes(v))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<Terminator, A::Error> {
                let mut bytes = Vec::new();
                while let Some(b) = seq.next_element::<u8>()? {
                    bytes.push(b);
                }
                Ok(Terminator::from_bytes(bytes))
            }

            fn visit_unit<E: de::Error>(self) -> std::result::Result<Terminator, E> {
                Ok(Terminator::None)
            }

            fn visit_none<E: de::Error>(self) -> std::result::Result<Terminator, E> {
                Ok(Terminator::None)
            }

            fn visit_some<D2: Deserializer<'de>>(
                self,
                deserializer: D2,
            ) -> std::result::Result<Terminator, D2::Error> {
                deserializer.deserialize_any(self)
            }
        }

        deserializer.deserialize_any(TerminatorVisitor)
    }
}

// ============================================================================
// Serial line settings
// ============================================================================

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

impl FromStr for Parity {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "n" | "none" => Ok(Parity::None),
            "e" | "even" => Ok(Parity::Even),
            "o" | "odd" => Ok(Parity::Odd),
            _ => Err(LinkError::config(format!("Unknown parity: {}", s))),
        }
    }
}

impl TryFrom<String> for Parity {
    type Error = LinkError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Parity> for String {
    fn from(parity: Parity) -> Self {
        match parity {
            Parity::None => "N",
            Parity::Even => "E",
            Parity::Odd => "O",
        }
        .to_string()
    }
}

/// Serial stop bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    #[default]
    One,
    Two,
}

impl Serialize for StopBits {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(match self {
            StopBits::One => 1,
            StopBits::Two => 2,
        })
    }
}

impl<'de> Deserialize<'de> for StopBits {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let bits: u8 = number_flexible(deserializer)?;
        match bits {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            _ => Err(de::Error::custom(format!(
                "Stop bits must be 1 or 2, got {}",
                bits
            ))),
        }
    }
}

// ============================================================================
// Parameter set
// ============================================================================

/// Validated transport configuration owned by one connection
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    /// Name used for log lines, thread names and callback sources
    pub name: String,
    /// Explicit transport type tag or custom variant name
    pub connection: Option<String>,

    /// Serial port path (e.g., "/dev/ttyUSB0", "COM1")
    pub serial_port: String,
    #[serde(deserialize_with = "number_flexible")]
    pub baudrate: u32,
    /// Data bits (5, 6, 7, 8)
    #[serde(deserialize_with = "number_flexible")]
    pub bytesize: u8,
    pub parity: Parity,
    pub stopbits: StopBits,

    /// Opaque protocol tag, not interpreted by this layer
    pub protocol: Option<String>,

    /// Remote host
    pub host: String,
    /// Remote port, or the local port for listeners
    #[serde(alias = "local_port", deserialize_with = "number_flexible")]
    pub port: u16,

    /// Skip UTF-8 decoding of received data
    #[serde(alias = "binary", deserialize_with = "deserialize_bool_flexible")]
    pub binary_mode: bool,
    /// Base I/O timeout in seconds
    #[serde(deserialize_with = "float_flexible")]
    pub timeout: f64,
    #[serde(alias = "autoreconnect", deserialize_with = "deserialize_bool_flexible")]
    pub auto_reconnect: bool,
    #[serde(alias = "autoconnect", deserialize_with = "deserialize_bool_flexible")]
    pub auto_connect: bool,
    /// Attempts of the `open()` retry loop
    #[serde(deserialize_with = "number_flexible")]
    pub connect_retries: u32,
    /// Seconds between `open()` attempts
    #[serde(deserialize_with = "float_flexible")]
    pub connect_cycle: f64,
    /// Seconds between reconnect cycles of the TCP client
    #[serde(deserialize_with = "float_flexible")]
    pub retry_cycle: f64,
    /// Failed reconnect cycles before the TCP client aborts (0 = never)
    #[serde(deserialize_with = "number_flexible")]
    pub retry_suspend: u32,
    pub terminator: Terminator,
    /// Serialize `open()`/`send()` through the send-lock
    #[serde(deserialize_with = "deserialize_bool_flexible")]
    pub serialize_sends: bool,

    #[serde(skip)]
    pub callbacks: LinkCallbacks,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            name: String::new(),
            connection: None,
            serial_port: String::new(),
            baudrate: 9600,
            bytesize: 8,
            parity: Parity::None,
            stopbits: StopBits::One,
            protocol: None,
            host: String::new(),
            port: 0,
            binary_mode: false,
            timeout: 1.0,
            auto_reconnect: true,
            auto_connect: true,
            connect_retries: 3,
            connect_cycle: 5.0,
            retry_cycle: 30.0,
            retry_suspend: 0,
            terminator: Terminator::None,
            serialize_sends: false,
            callbacks: LinkCallbacks::default(),
        }
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("name", &self.name)
            .field("connection", &self.connection)
            .field("serial_port", &self.serial_port)
            .field("baudrate", &self.baudrate)
            .field("bytesize", &self.bytesize)
            .field("parity", &self.parity)
            .field("stopbits", &self.stopbits)
            .field("protocol", &self.protocol)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("binary_mode", &self.binary_mode)
            .field("timeout", &self.timeout)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("auto_connect", &self.auto_connect)
            .field("connect_retries", &self.connect_retries)
            .field("connect_cycle", &self.connect_cycle)
            .field("retry_cycle", &self.retry_cycle)
            .field("retry_suspend", &self.retry_suspend)
            .field("terminator", &self.terminator)
            .field("serialize_sends", &self.serialize_sends)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

/// Older spellings of a few options, with the key they stand for
const KEY_ALIASES: &[(&str, &str)] = &[
    ("local_port", "port"),
    ("binary", "binary_mode"),
    ("autoreconnect", "auto_reconnect"),
    ("autoconnect", "auto_connect"),
];

/// Fold alias keys into their canonical key; the canonical key wins
fn normalize_keys(map: &mut serde_json::Map<String, serde_json::Value>) {
    for (alias, canonical) in KEY_ALIASES {
        if let Some(value) = map.remove(*alias) {
            if map.contains_key(*canonical) {
                debug!("ignoring '{}', '{}' is already set", alias, canonical);
            } else {
                map.insert((*canonical).to_string(), value);
            }
        }
    }
}

impl ConnectionParams {
    /// Merge caller overrides over the defaults.
    ///
    /// Unknown keys are ignored, raw strings are coerced to typed values.
    pub fn from_map(overrides: HashMap<String, serde_json::Value>) -> Result<Self> {
        Self::from_value(serde_json::Value::Object(overrides.into_iter().collect()))
    }

    /// Same as [`ConnectionParams::from_map`] for a JSON object
    pub fn from_value(overrides: serde_json::Value) -> Result<Self> {
        if !overrides.is_object() && !overrides.is_null() {
            return Err(LinkError::config("connection parameters must be a key/value map"));
        }
        let mut overrides = match overrides {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        normalize_keys(&mut overrides);
        let overrides = serde_json::Value::Object(overrides);
        let params: ConnectionParams = serde_json::from_value(overrides)
            .map_err(|e| LinkError::config(format!("Invalid connection parameters: {}", e)))?;
        params.validate()?;
        Ok(params)
    }

    /// Reject values no transport can work with
    pub fn validate(&self) -> Result<()> {
        if !(5..=8).contains(&self.bytesize) {
            return Err(LinkError::config(format!(
                "bytesize must be 5, 6, 7 or 8, got {}",
                self.bytesize
            )));
        }
        if self.baudrate == 0 {
            return Err(LinkError::config("baudrate must be greater than zero"));
        }
        if !self.timeout.is_finite() || self.timeout <= 0.0 {
            return Err(LinkError::config(format!(
                "timeout must be a positive number of seconds, got {}",
                self.timeout
            )));
        }
        for (field, value) in [
            ("connect_cycle", self.connect_cycle),
            ("retry_cycle", self.retry_cycle),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(LinkError::config(format!(
                    "{} must be zero or a positive number of seconds, got {}",
                    field, value
                )));
            }
        }
        Ok(())
    }

    /// Host configured (non-default)
    pub fn has_host(&self) -> bool {
        !self.host.trim().is_empty()
    }

    /// Serial port configured (non-default)
    pub fn has_serial_port(&self) -> bool {
        !self.serial_port.trim().is_empty()
    }

    /// Base I/O timeout, never below the minimum poll interval
    pub fn timeout_duration(&self) -> Duration {
        secs_to_duration(self.timeout).max(MIN_POLL_INTERVAL)
    }

    /// Overall deadline of one serial read call
    pub fn read_deadline(&self) -> Duration {
        secs_to_duration(self.timeout * TIMEOUT_MULTIPLIER).max(MIN_POLL_INTERVAL)
    }

    pub fn connect_cycle_duration(&self) -> Duration {
        secs_to_duration(self.connect_cycle)
    }

    pub fn retry_cycle_duration(&self) -> Duration {
        secs_to_duration(self.retry_cycle)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_serial_port(mut self, serial_port: impl Into<String>) -> Self {
        self.serial_port = serial_port.into();
        self
    }

    pub fn with_terminator(mut self, terminator: impl Into<Terminator>) -> Self {
        self.terminator = terminator.into();
        self
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn with_binary_mode(mut self, binary_mode: bool) -> Self {
        self.binary_mode = binary_mode;
        self
    }

    pub fn with_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    pub fn with_retries(mut self, connect_retries: u32, connect_cycle: f64) -> Self {
        self.connect_retries = connect_retries;
        self.connect_cycle = connect_cycle;
        self
    }

    pub fn with_retry_cycle(mut self, retry_cycle: f64, retry_suspend: u32) -> Self {
        self.retry_cycle = retry_cycle;
        self.retry_suspend = retry_suspend;
        self
    }

    pub fn with_serialized_sends(mut self, serialize_sends: bool) -> Self {
        self.serialize_sends = serialize_sends;
        self
    }

    pub fn on_connect(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.callbacks.on_connect = Some(Arc::new(callback));
        self
    }

    pub fn on_disconnect(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.callbacks.on_disconnect = Some(Arc::new(callback));
        self
    }

    pub fn on_suspend(mut self, callback: impl Fn(bool, &str) + Send + Sync + 'static) -> Self {
        self.callbacks.on_suspend = Some(Arc::new(callback));
        self
    }

    pub fn init_on_open(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.init_on_open = Some(Arc::new(hook));
        self
    }

    pub fn init_on_send(mut self, hook: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.callbacks.init_on_send = Some(Arc::new(hook));
        self
    }
}

fn secs_to_duration(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::from_secs_f64(seconds)
    } else {
        Duration::ZERO
    }
}

// ============================================================================
// Custom Deserializers
// ============================================================================

/// Boolean from JSON booleans, 0/1 integers and "true"/"false"/"yes"/"no"/"on"/"off"
pub fn deserialize_bool_flexible<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrStringOrInt {
        Bool(bool),
        Int(i64),
        String(String),
    }

    match BoolOrStringOrInt::deserialize(deserializer)? {
        BoolOrStringOrInt::Bool(b) => Ok(b),
        BoolOrStringOrInt::Int(i) => match i {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(de::Error::custom(format!(
                "Invalid integer value {}, expected 0 or 1",
                i
            ))),
        },
        BoolOrStringOrInt::String(s) => match s.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(de::Error::custom(format!(
                "Invalid boolean value '{}', expected true/false, yes/no, on/off or 1/0",
                s
            ))),
        },
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Int(i64),
    Float(f64),
    String(String),
}

/// Integer from JSON numbers or numeric strings
pub fn number_flexible<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64> + FromStr,
    <T as FromStr>::Err: fmt::Display,
{
    let out_of_range = |v: &dyn fmt::Display| de::Error::custom(format!("value {} out of range", v));
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Int(i) => T::try_from(i).map_err(|_| out_of_range(&i)),
        NumberOrString::Float(f) if f.fract() == 0.0 => {
            T::try_from(f as i64).map_err(|_| out_of_range(&f))
        },
        NumberOrString::Float(f) => Err(de::Error::custom(format!(
            "expected an integer, got {}",
            f
        ))),
        NumberOrString::String(s) => s
            .trim()
            .parse::<T>()
            .map_err(|e| de::Error::custom(format!("invalid number '{}': {}", s, e))),
    }
}

/// Float from JSON numbers or numeric strings
pub fn float_flexible<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Int(i) => Ok(i as f64),
        NumberOrString::Float(f) => Ok(f),
        NumberOrString::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| de::Error::custom(format!("invalid number '{}': {}", s, e))),
    }
}
