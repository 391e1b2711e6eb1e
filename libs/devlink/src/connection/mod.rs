//! Connection Module
//!
//! The connection contract and its transport variants.
//!
//! # Variants
//!
//! - **NullConnection**: no transport, fixed dummy reply
//! - **TcpRequestConnection**: stateless HTTP request/response
//! - **UdpRequestConnection**: HTTP requests plus a UDP receive thread
//! - **TcpClientConnection**: persistent socket with a reconnecting listener
//! - **SerialConnection**: blocking serial exchange with framed reads
//! - **SerialAsyncConnection**: serial listener feeding a dispatch queue

pub mod core;
pub mod null;
pub mod serial;
pub mod serial_async;
pub mod tcp_client;
pub mod tcp_request;
pub mod traits;
pub mod udp_request;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use self::core::ConnectionCore;
pub use null::NullConnection;
pub use serial::{native_opener, SerialConnection, SerialIo, SerialLink, SerialOpener};
pub use serial_async::SerialAsyncConnection;
pub use tcp_client::TcpClientConnection;
pub use tcp_request::{HttpRequester, TcpRequestConnection};
pub use traits::{Connection, LinkStats, Payload, RequestMethod, SendRequest};
pub use udp_request::UdpRequestConnection;
