//! Connection factory
//!
//! Resolves a transport variant from the parameter set and builds it. The
//! factory never fails: anything it cannot resolve or construct falls back to
//! the [`NullConnection`], so the caller always gets a usable connection.
//!
//! Resolution order:
//! 1. an explicit constructor passed to [`ConnectionFactory::create_with`]
//! 2. `connection` naming a built-in type tag
//! 3. `connection` naming a registered custom variant
//! 4. inference: host set → `net_tcp_request`, serial port set → `serial`,
//!    otherwise `null`

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::callbacks::DataCallback;
use crate::connection::{
    Connection, NullConnection, SerialAsyncConnection, SerialConnection, TcpClientConnection,
    TcpRequestConnection, UdpRequestConnection,
};
use crate::error::{LinkError, Result};
use crate::params::ConnectionParams;

/// Shared handle to any connection variant
pub type DynConnection = Arc<dyn Connection>;

/// Constructor of a connection variant
pub type ConnectionConstructor =
    Arc<dyn Fn(ConnectionParams, Option<DataCallback>) -> Result<DynConnection> + Send + Sync>;

// ============================================================================
// Type tags
// ============================================================================

/// Built-in transport types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Null,
    NetTcpRequest,
    NetTcpClient,
    NetUdpRequest,
    Serial,
    SerialAsync,
}

impl ConnectionType {
    pub const ALL: [ConnectionType; 6] = [
        ConnectionType::Null,
        ConnectionType::NetTcpRequest,
        ConnectionType::NetTcpClient,
        ConnectionType::NetUdpRequest,
        ConnectionType::Serial,
        ConnectionType::SerialAsync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Null => "null",
            ConnectionType::NetTcpRequest => "net_tcp_request",
            ConnectionType::NetTcpClient => "net_tcp_client",
            ConnectionType::NetUdpRequest => "net_udp_request",
            ConnectionType::Serial => "serial",
            ConnectionType::SerialAsync => "serial_async",
        }
    }

    /// Pick a type from the configured endpoint
    pub fn infer(params: &ConnectionParams) -> Self {
        if params.has_host() {
            ConnectionType::NetTcpRequest
        } else if params.has_serial_port() {
            ConnectionType::Serial
        } else {
            ConnectionType::Null
        }
    }

    /// Build the variant for this tag
    pub fn build(
        &self,
        params: ConnectionParams,
        data_callback: Option<DataCallback>,
    ) -> Result<DynConnection> {
        Ok(match self {
            ConnectionType::Null => Arc::new(NullConnection::new(params, data_callback)),
            ConnectionType::NetTcpRequest => {
                Arc::new(TcpRequestConnection::new(params, data_callback)?)
            },
            ConnectionType::NetTcpClient => {
                Arc::new(TcpClientConnection::new(params, data_callback)?)
            },
            ConnectionType::NetUdpRequest => {
                Arc::new(UdpRequestConnection::new(params, data_callback)?)
            },
            ConnectionType::Serial => Arc::new(SerialConnection::new(params, data_callback)?),
            ConnectionType::SerialAsync => {
                Arc::new(SerialAsyncConnection::new(params, data_callback)?)
            },
        })
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionType {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self> {
        let tag = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == tag)
            .ok_or_else(|| LinkError::config(format!("unknown connection type: {}", s)))
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Outcome of resolving the parameter set
#[derive(Clone)]
pub enum Resolution {
    Builtin(ConnectionType),
    Custom(String, ConnectionConstructor),
    /// Named variant that nobody registered
    Unknown(String),
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Builtin(t) => f.debug_tuple("Builtin").field(t).finish(),
            Resolution::Custom(name, _) => f.debug_tuple("Custom").field(name).finish(),
            Resolution::Unknown(name) => f.debug_tuple("Unknown").field(name).finish(),
        }
    }
}

/// Builds connections and keeps the registry of custom variants
#[derive(Default)]
pub struct ConnectionFactory {
    custom: DashMap<String, ConnectionConstructor>,
    created: DashMap<String, u64>,
}

impl fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("custom", &self.registered())
            .field("created", &self.created.len())
            .finish()
    }
}

impl ConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom variant under `name`.
    ///
    /// Built-in tags cannot be shadowed.
    pub fn register(&self, name: impl Into<String>, constructor: ConnectionConstructor) -> Result<()> {
        let name = name.into();
        if ConnectionType::from_str(&name).is_ok() {
            return Err(LinkError::config(format!(
                "{} is a built-in connection type",
                name
            )));
        }
        if self.custom.insert(name.clone(), constructor).is_some() {
            warn!("Replaced custom connection variant {}", name);
        } else {
            info!("Registered custom connection variant {}", name);
        }
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.custom.remove(name).is_some()
    }

    /// Names of registered custom variants, sorted
    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.custom.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Work out which variant `params` asks for
    pub fn resolve(&self, params: &ConnectionParams) -> Resolution {
        match params.connection.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => {
                if let Ok(kind) = ConnectionType::from_str(name) {
                    return Resolution::Builtin(kind);
                }
                match self.custom.get(name) {
                    Some(ctor) => Resolution::Custom(name.to_string(), Arc::clone(ctor.value())),
                    None => Resolution::Unknown(name.to_string()),
                }
            },
            _ => Resolution::Builtin(ConnectionType::infer(params)),
        }
    }

    /// Build the connection `params` asks for
    pub fn create(&self, params: ConnectionParams, data_callback: Option<DataCallback>) -> DynConnection {
        let resolution = self.resolve(&params);
        debug!("Resolved connection {:?} for {}", resolution, params.name);

        let (label, built) = match resolution {
            Resolution::Builtin(kind) => (
                kind.as_str().to_string(),
                kind.build(params.clone(), data_callback.clone()),
            ),
            Resolution::Custom(name, ctor) => {
                let built = ctor(params.clone(), data_callback.clone());
                (name, built)
            },
            Resolution::Unknown(name) => {
                warn!(
                    "Could not identify connection type {}, using null connection",
                    name
                );
                return self.fallback(params, data_callback);
            },
        };
        self.finish(label, built, params, data_callback)
    }

    /// Build with an explicit constructor, bypassing resolution
    pub fn create_with(
        &self,
        constructor: &ConnectionConstructor,
        params: ConnectionParams,
        data_callback: Option<DataCallback>,
    ) -> DynConnection {
        let built = constructor(params.clone(), data_callback.clone());
        let label = match &built {
            Ok(conn) => conn.kind().to_string(),
            Err(_) => "explicit".to_string(),
        };
        self.finish(label, built, params, data_callback)
    }

    /// Connections built so far, per variant
    pub fn creation_counts(&self) -> Vec<(String, u64)> {
        let mut counts: Vec<(String, u64)> = self
            .created
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        counts.sort();
        counts
    }

    fn finish(
        &self,
        label: String,
        built: Result<DynConnection>,
        params: ConnectionParams,
        data_callback: Option<DataCallback>,
    ) -> DynConnection {
        match built {
            Ok(conn) => {
                info!("Created {} connection {}", conn.kind(), conn.name());
                *self.created.entry(label).or_insert(0) += 1;
                conn
            },
            Err(e) => {
                warn!(
                    "Could not create {} connection: {}, using null connection",
                    label, e
                );
                self.fallback(params, data_callback)
            },
        }
    }

    fn fallback(&self, params: ConnectionParams, data_callback: Option<DataCallback>) -> DynConnection {
        *self
            .created
            .entry(ConnectionType::Null.as_str().to_string())
            .or_insert(0) += 1;
        Arc::new(NullConnection::new(params, data_callback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Payload;
    use serde_json::json;
    use tracing_test::traced_test;

    fn params(value: serde_json::Value) -> ConnectionParams {
        ConnectionParams::from_value(value).unwrap()
    }

    #[test]
    fn test_type_tags() {
        for kind in ConnectionType::ALL {
            assert_eq!(kind.as_str().parse::<ConnectionType>().unwrap(), kind);
            assert_eq!(kind.to_string(), kind.as_str());
        }
        assert_eq!(
            " Serial_Async ".parse::<ConnectionType>().unwrap(),
            ConnectionType::SerialAsync
        );
        assert!("modbus".parse::<ConnectionType>().is_err());
        assert_eq!(
            serde_json::to_value(ConnectionType::NetUdpRequest).unwrap(),
            json!("net_udp_request")
        );
    }

    #[test]
    fn test_inference_order() {
        let factory = ConnectionFactory::new();
        let both = params(json!({"host": "10.0.0.5", "serial_port": "/dev/ttyUSB0"}));
        assert!(matches!(
            factory.resolve(&both),
            Resolution::Builtin(ConnectionType::NetTcpRequest)
        ));

        let serial = params(json!({"serial_port": "/dev/ttyUSB0"}));
        assert!(matches!(
            factory.resolve(&serial),
            Resolution::Builtin(ConnectionType::Serial)
        ));

        let blank = params(json!({"host": "  "}));
        assert!(matches!(
            factory.resolve(&blank),
            Resolution::Builtin(ConnectionType::Null)
        ));
    }

    #[test]
    fn test_explicit_tag_beats_inference() {
        let factory = ConnectionFactory::new();
        let p = params(json!({"connection": "null", "host": "10.0.0.5"}));
        let conn = factory.create(p, None);
        assert_eq!(conn.kind(), "null");
    }

    #[test]
    fn test_builds_inferred_tcp_request() {
        let factory = ConnectionFactory::new();
        let conn = factory.create(params(json!({"host": "127.0.0.1", "name": "web"})), None);
        assert_eq!(conn.kind(), "net_tcp_request");
        assert_eq!(conn.name(), "web");
        assert_eq!(factory.creation_counts(), vec![("net_tcp_request".to_string(), 1)]);
    }

    #[traced_test]
    #[test]
    fn test_unknown_name_falls_back_to_null() {
        let factory = ConnectionFactory::new();
        let conn = factory.create(params(json!({"connection": "ConnectionModbusRtu"})), None);
        assert_eq!(conn.kind(), "null");
        assert!(conn.open());
        assert!(logs_contain("using null connection"));
    }

    #[traced_test]
    #[test]
    fn test_constructor_error_falls_back_to_null() {
        let factory = ConnectionFactory::new();
        // persistent client without a host cannot be built
        let conn = factory.create(params(json!({"connection": "net_tcp_client"})), None);
        assert_eq!(conn.kind(), "null");
        assert!(logs_contain("Could not create net_tcp_client connection"));
        assert_eq!(factory.creation_counts(), vec![("null".to_string(), 1)]);
    }

    #[test]
    fn test_custom_variant() {
        let factory = ConnectionFactory::new();
        let ctor: ConnectionConstructor = Arc::new(
            |params: ConnectionParams, cb: Option<DataCallback>| -> Result<DynConnection> {
                Ok(Arc::new(NullConnection::new(params, cb).with_dummy("custom reply")))
            },
        );
        factory.register("loopback", ctor).unwrap();
        assert_eq!(factory.registered(), vec!["loopback".to_string()]);

        let conn = factory.create(params(json!({"connection": "loopback"})), None);
        let reply = conn.send(&"ping".into()).unwrap();
        assert_eq!(reply, Some(Payload::from("custom reply")));
        assert_eq!(factory.creation_counts(), vec![("loopback".to_string(), 1)]);

        assert!(factory.unregister("loopback"));
        let conn = factory.create(params(json!({"connection": "loopback"})), None);
        assert_eq!(conn.send(&"ping".into()).unwrap(), None);
    }

    #[test]
    fn test_builtin_names_cannot_be_registered() {
        let factory = ConnectionFactory::new();
        let ctor: ConnectionConstructor = Arc::new(
            |params: ConnectionParams, cb: Option<DataCallback>| -> Result<DynConnection> {
                Ok(Arc::new(NullConnection::new(params, cb)))
            },
        );
        assert!(matches!(
            factory.register("serial", ctor),
            Err(LinkError::Config(_))
        ));
    }

    #[test]
    fn test_create_with_explicit_constructor() {
        let factory = ConnectionFactory::new();
        let ctor: ConnectionConstructor = Arc::new(
            |params: ConnectionParams, cb: Option<DataCallback>| -> Result<DynConnection> {
                Ok(Arc::new(NullConnection::new(params, cb).with_dummy("explicit")))
            },
        );
        // explicit constructor wins over the configured tag
        let conn = factory.create_with(&ctor, params(json!({"connection": "serial"})), None);
        assert_eq!(conn.send(&"x".into()).unwrap(), Some(Payload::from("explicit")));

        let failing: ConnectionConstructor = Arc::new(
            |_: ConnectionParams, _: Option<DataCallback>| -> Result<DynConnection> {
                Err(LinkError::config("broken constructor"))
            },
        );
        let conn = factory.create_with(&failing, ConnectionParams::default(), None);
        assert_eq!(conn.kind(), "null");
    }
}
