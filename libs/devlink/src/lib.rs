//! Device Connection Layer
//!
//! One contract for opening, maintaining and exchanging data with devices
//! over heterogeneous transports.
//!
//! # Architecture
//!
//! - **Connection Contract**: [`Connection`] trait, shared state in [`ConnectionCore`]
//! - **Parameter Set**: [`ConnectionParams`] with defaults and sanitizing deserializers
//! - **Transports**: request/response TCP, persistent TCP client, UDP listener,
//!   synchronous and asynchronous serial
//! - **Factory**: [`ConnectionFactory`] resolves the transport from the parameters
//!
//! # Example
//!
//! ```no_run
//! use devlink::{ConnectionFactory, ConnectionParams, Payload, SendRequest};
//! use std::sync::Arc;
//!
//! let params = ConnectionParams::default()
//!     .with_serial_port("/dev/ttyUSB0")
//!     .with_terminator("\r\n");
//! let factory = ConnectionFactory::new();
//! let conn = factory.create(
//!     params,
//!     Some(Arc::new(|source: &str, data: Payload| println!("{source}: {data}"))),
//! );
//!
//! if conn.open() {
//!     let reply = conn.send(&SendRequest::new("PWR?\r").limit_response("\r"));
//!     println!("{:?}", reply);
//!     conn.close();
//! }
//! ```
//!
//! # Features
//!
//! - `test-utils` - export `connection::mock::MockSerialPort` for downstream tests

pub mod callbacks;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod factory;
pub mod framing;
pub mod logging;
pub mod net;
pub mod params;
pub mod sync;

pub use callbacks::{DataCallback, LifecycleCallback, LinkCallbacks, SuspendCallback};
pub use connection::{
    Connection, ConnectionCore, LinkStats, NullConnection, Payload, RequestMethod, SendRequest,
    SerialAsyncConnection, SerialConnection, TcpClientConnection, TcpRequestConnection,
    UdpRequestConnection,
};
pub use error::{LinkError, Result};
pub use factory::{ConnectionConstructor, ConnectionFactory, ConnectionType, DynConnection};
pub use params::{ConnectionParams, Parity, StopBits, Terminator};
