//! Fixed timing and buffer constants of the connection layer

use std::time::Duration;

/// Overall serial read deadline is `timeout * TIMEOUT_MULTIPLIER`
pub const TIMEOUT_MULTIPLIER: f64 = 3.0;

/// Maximum wait for the serial read lock before a read is skipped
pub const READ_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Receive buffer for a single UDP datagram
pub const UDP_BUFFER_SIZE: usize = 1024;

/// Local address the UDP listener binds to
pub const UDP_BIND_ADDRESS: [u8; 4] = [0, 0, 0, 0];

/// Upper bound `open()` waits for the persistent TCP client to come up
pub const CONNECT_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Poll step while waiting for the persistent TCP client to settle
pub const CONNECT_SETTLE_POLL: Duration = Duration::from_millis(50);

/// Read chunk size of the persistent TCP client
pub const TCP_READ_BUFFER_SIZE: usize = 4096;

/// Smallest socket/serial poll interval; zero timeouts would block forever
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Source tag suffix used by the UDP listener lifecycle callbacks
pub const UDP_LISTENER_SUFFIX: &str = "UDP_listener";

/// Largest single read from a serial port
pub const SERIAL_READ_CHUNK: usize = 256;
