//! Network primitives shared by the socket transports

pub mod reconnect;
pub mod tcp_client;

pub use reconnect::{
    ConnectionState, ReconnectContext, ReconnectHelper, ReconnectPolicy, ReconnectStats,
    ReconnectStep,
};
pub use tcp_client::{AbortCallback, ClientCallbacks, TcpClient, TcpClientConfig};
