//! UDP listener connection
//!
//! Outbound requests behave exactly like [`TcpRequestConnection`]; inbound
//! data arrives as UDP datagrams on the configured local port and is handed
//! to the data callback as `(source_host, text)`.
//!
//! [`TcpRequestConnection`]: crate::connection::TcpRequestConnection

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::callbacks::DataCallback;
use crate::connection::core::ConnectionCore;
use crate::connection::tcp_request::HttpRequester;
use crate::connection::traits::{Connection, LinkStats, Payload, SendRequest};
use crate::constants::{UDP_BIND_ADDRESS, UDP_BUFFER_SIZE, UDP_LISTENER_SUFFIX};
use crate::error::Result;
use crate::params::ConnectionParams;
use crate::sync::{join_worker, spawn_named};

#[derive(Debug)]
pub struct UdpRequestConnection {
    core: Arc<ConnectionCore>,
    http: HttpRequester,
    alive: Arc<AtomicBool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl UdpRequestConnection {
    pub fn new(params: ConnectionParams, data_callback: Option<DataCallback>) -> Result<Self> {
        let core = Arc::new(ConnectionCore::new(
            "net_udp_request",
            params,
            data_callback,
        ));
        let http = HttpRequester::new(core.name(), core.params())?;
        Ok(Self {
            core,
            http,
            alive: Arc::new(AtomicBool::new(false)),
            listener: Mutex::new(None),
        })
    }

    pub fn core(&self) -> &Arc<ConnectionCore> {
        &self.core
    }

    /// Listener thread still running
    pub fn listening(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn start_listener(&self) -> bool {
        let mut slot = self.listener.lock();
        if let Some(handle) = slot.as_ref() {
            if !handle.is_finished() {
                debug!("[{}] UDP listener already running", self.core.name());
                return true;
            }
        }
        if let Some(stale) = slot.take() {
            join_worker(stale, "UDP listener");
        }

        self.alive.store(true, Ordering::SeqCst);
        let core = Arc::clone(&self.core);
        let alive = Arc::clone(&self.alive);
        let thread_name = format!("{}-udp", self.core.name());
        match spawn_named(thread_name, move || run_listener(core, alive)) {
            Ok(handle) => {
                *slot = Some(handle);
                true
            },
            Err(e) => {
                error!(
                    "[{}] could not start UDP listener thread: {}",
                    self.core.name(),
                    e
                );
                self.alive.store(false, Ordering::SeqCst);
                false
            },
        }
    }

    fn stop_listener(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let handle = self.listener.lock().take();
        if let Some(handle) = handle {
            debug!("[{}] waiting for UDP listener to stop", self.core.name());
            join_worker(handle, "UDP listener");
        }
    }
}

impl Connection for UdpRequestConnection {
    fn kind(&self) -> &str {
        self.core.kind()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn open(&self) -> bool {
        self.core.open_with(|| self.start_listener())
    }

    fn close(&self) {
        self.core.close_with(|| self.stop_listener());
    }

    fn send(&self, request: &SendRequest) -> Result<Option<Payload>> {
        self.core.send_with(
            request,
            || self.start_listener(),
            |request| self.http.execute(request),
        )
    }

    fn connected(&self) -> bool {
        self.core.is_connected()
    }

    fn stats(&self) -> LinkStats {
        self.core.stats()
    }
}

impl Drop for UdpRequestConnection {
    fn drop(&mut self) {
        self.stop_listener();
    }
}

/// Bind the receive socket with address (and port) reuse enabled
fn bind_listener(port: u16, read_timeout: Duration) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;

    let addr = SocketAddr::from((UDP_BIND_ADDRESS, port));
    socket.bind(&addr.into())?;

    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(read_timeout))?;
    Ok(socket)
}

fn run_listener(core: Arc<ConnectionCore>, alive: Arc<AtomicBool>) {
    let source = format!("{} {}", core.name(), UDP_LISTENER_SUFFIX);
    let port = core.params().port;

    let socket = match bind_listener(port, core.params().timeout_duration()) {
        Ok(socket) => socket,
        Err(e) => {
            error!("[{}] could not bind UDP port {}: {}", core.name(), port, e);
            alive.store(false, Ordering::SeqCst);
            core.on_disconnect(&source);
            return;
        },
    };

    info!("[{}] UDP listener bound to port {}", core.name(), port);
    core.on_connect(&source);

    let mut buffer = [0u8; UDP_BUFFER_SIZE];
    while alive.load(Ordering::SeqCst) {
        let (len, addr) = match socket.recv_from(&mut buffer) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                if alive.load(Ordering::SeqCst) {
                    error!("[{}] UDP receive failed: {}", core.name(), e);
                }
                break;
            },
        };

        let host = match addr {
            SocketAddr::V4(v4) => v4.ip().to_string(),
            other => {
                warn!(
                    "[{}] malformed source address {}, stopping UDP listener",
                    core.name(),
                    other
                );
                break;
            },
        };

        match std::str::from_utf8(&buffer[..len]) {
            Ok(text) => core.on_data_received(&host, Payload::Text(text.to_string())),
            Err(e) => warn!(
                "[{}] dropping undecodable datagram from {}: {}",
                core.name(),
                host,
                e
            ),
        }
    }

    alive.store(false, Ordering::SeqCst);
    debug!("[{}] UDP listener stopped", core.name());
    core.on_disconnect(&source);
}
