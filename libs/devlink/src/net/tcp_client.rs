//! Reusable auto-reconnecting TCP client
//!
//! One background worker per client. The worker connects (following the
//! [`ReconnectHelper`] policy), then reads with a short timeout so that a
//! stop request is noticed, slices the stream into frames and reports them
//! through the data callback. Writes happen on the caller's thread through a
//! cloned stream handle.

use parking_lot::{Mutex, RwLock};
use socket2::SockRef;
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::callbacks::{DataCallback, LifecycleCallback};
use crate::constants::TCP_READ_BUFFER_SIZE;
use crate::error::{LinkError, Result};
use crate::framing::{decode_frame, FrameSplitter};
use crate::net::reconnect::{ReconnectHelper, ReconnectPolicy, ReconnectStats, ReconnectStep};
use crate::params::{ConnectionParams, Terminator};
use crate::sync::{join_worker, spawn_named, StopSignal};

/// Fired once the reconnect policy aborts
pub type AbortCallback = Arc<dyn Fn() + Send + Sync>;

/// TCP client configuration
#[derive(Debug, Clone)]
pub struct TcpClientConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    /// Timeout of one connect attempt and of each read poll
    pub timeout: Duration,
    pub terminator: Terminator,
    pub binary_mode: bool,
    pub policy: ReconnectPolicy,
}

impl TcpClientConfig {
    pub fn from_params(params: &ConnectionParams, name: &str) -> Self {
        Self {
            host: params.host.clone(),
            port: params.port,
            name: name.to_string(),
            timeout: params.timeout_duration(),
            terminator: params.terminator.clone(),
            binary_mode: params.binary_mode,
            policy: ReconnectPolicy::from_params(params),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(LinkError::config("TCP client requires a host"));
        }
        if self.port == 0 {
            return Err(LinkError::config("TCP client requires a port"));
        }
        Ok(())
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Callbacks of the TCP client
#[derive(Clone, Default)]
pub struct ClientCallbacks {
    pub data_received: Option<DataCallback>,
    pub connected: Option<LifecycleCallback>,
    pub disconnected: Option<LifecycleCallback>,
    pub abort: Option<AbortCallback>,
}

struct Shared {
    config: TcpClientConfig,
    writer: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
    stop: StopSignal,
    callbacks: RwLock<ClientCallbacks>,
    reconnect: Mutex<ReconnectHelper>,
}

pub struct TcpClient {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TcpClient {
    pub fn new(config: TcpClientConfig) -> Result<Self> {
        config.validate()?;
        let reconnect = ReconnectHelper::new(config.policy.clone());
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                writer: Mutex::new(None),
                connected: AtomicBool::new(false),
                stop: StopSignal::new(),
                callbacks: RwLock::new(ClientCallbacks::default()),
                reconnect: Mutex::new(reconnect),
            }),
            worker: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &TcpClientConfig {
        &self.shared.config
    }

    pub fn set_callbacks(&self, callbacks: ClientCallbacks) {
        *self.shared.callbacks.write() = callbacks;
    }

    pub fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Worker thread alive (connecting, connected or waiting to retry)
    pub fn running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn reconnect_stats(&self) -> ReconnectStats {
        self.shared.reconnect.lock().stats().clone()
    }

    /// Start the background worker; no-op while it is running
    pub fn connect(&self) -> Result<()> {
        let mut slot = self.worker.lock();
        if let Some(handle) = slot.as_ref() {
            if !handle.is_finished() {
                debug!("[{}] connect: worker already running", self.shared.config.name);
                return Ok(());
            }
        }
        if let Some(stale) = slot.take() {
            join_worker(stale, "TCP client");
        }

        self.shared.stop.reset();
        self.shared.reconnect.lock().reset();
        let shared = Arc::clone(&self.shared);
        let handle = spawn_named(format!("{}-tcp", self.shared.config.name), move || {
            run_worker(shared)
        })?;
        *slot = Some(handle);
        Ok(())
    }

    /// Write `data` to the peer
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        let mut writer = self.shared.writer.lock();
        let stream = writer.as_mut().ok_or_else(|| {
            LinkError::not_connected(format!("{}: TCP client not connected", self.shared.config.name))
        })?;

        debug!(
            "[{}] send {} bytes: {:02X?}",
            self.shared.config.name,
            data.len(),
            data
        );
        if let Err(e) = stream.write_all(data).and_then(|_| stream.flush()) {
            warn!("[{}] write failed: {}", self.shared.config.name, e);
            let _ = stream.shutdown(Shutdown::Both);
            return Err(LinkError::write_failed(e.to_string()));
        }
        Ok(data.len())
    }

    /// Stop the worker and drop the connection; returns after the worker exited
    pub fn close(&self) {
        debug!("[{}] closing TCP client", self.shared.config.name);
        self.shared.stop.stop();
        if let Some(stream) = self.shared.writer.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            join_worker(handle, "TCP client");
        }
        self.shared.connected.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpClient")
            .field("endpoint", &self.shared.config.endpoint())
            .field("connected", &self.connected())
            .finish()
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn connect_once(config: &TcpClientConfig) -> std::io::Result<TcpStream> {
    let addrs: Vec<SocketAddr> = (config.host.as_str(), config.port)
        .to_socket_addrs()?
        .collect();
    let mut last_error =
        std::io::Error::new(ErrorKind::AddrNotAvailable, "host resolved to no address");

    for addr in addrs {
        match TcpStream::connect_timeout(&addr, config.timeout) {
            Ok(stream) => {
                if let Err(e) = SockRef::from(&stream).set_keepalive(true) {
                    warn!("Failed to set keep-alive: {e}");
                }
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {e}");
                }
                stream.set_read_timeout(Some(config.timeout))?;
                return Ok(stream);
            },
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

fn run_worker(shared: Arc<Shared>) {
    let config = &shared.config;
    let endpoint = config.endpoint();

    while !shared.stop.is_stopped() {
        shared.reconnect.lock().begin_attempt();
        let stream = match connect_once(config).and_then(|s| s.try_clone().map(|r| (s, r))) {
            Ok(pair) => pair,
            Err(e) => {
                let step = shared
                    .reconnect
                    .lock()
                    .record_failure(&format!("{}: {}", endpoint, e));
                match step {
                    ReconnectStep::Retry(delay) => {
                        if shared.stop.wait_timeout(delay) {
                            break;
                        }
                        continue;
                    },
                    ReconnectStep::Abort => {
                        let abort = shared.callbacks.read().abort.clone();
                        if let Some(abort) = abort {
                            abort();
                        }
                        break;
                    },
                    ReconnectStep::GiveUp => break,
                }
            },
        };
        let (writer, reader) = stream;

        {
            let mut slot = shared.writer.lock();
            if shared.stop.is_stopped() {
                let _ = writer.shutdown(Shutdown::Both);
                break;
            }
            *slot = Some(writer);
        }
        shared.reconnect.lock().mark_connected();
        shared.connected.store(true, Ordering::SeqCst);
        info!("[{}] connected to {}", config.name, endpoint);
        let connected = shared.callbacks.read().connected.clone();
        if let Some(callback) = connected {
            callback(&config.host);
        }

        receive_loop(&shared, reader);

        shared.connected.store(false, Ordering::SeqCst);
        if let Some(stream) = shared.writer.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        shared.reconnect.lock().mark_disconnected();
        let disconnected = shared.callbacks.read().disconnected.clone();
        if let Some(callback) = disconnected {
            callback(&config.host);
        }

        if shared.stop.is_stopped() || !config.policy.auto_reconnect {
            break;
        }
        info!("[{}] connection to {} lost, reconnecting", config.name, endpoint);
        shared.reconnect.lock().reset();
    }

    shared.connected.store(false, Ordering::SeqCst);
    debug!("[{}] TCP client worker stopped", config.name);
}

fn receive_loop(shared: &Shared, mut reader: TcpStream) {
    let config = &shared.config;
    let mut splitter = FrameSplitter::new(config.terminator.clone());
    let mut buffer = [0u8; TCP_READ_BUFFER_SIZE];

    while !shared.stop.is_stopped() {
        let n = match reader.read(&mut buffer) {
            Ok(0) => {
                debug!("[{}] peer closed the connection", config.name);
                return;
            },
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                if !shared.stop.is_stopped() {
                    error!("[{}] receive failed: {}", config.name, e);
                }
                return;
            },
        };

        debug!("[{}] recv {} bytes: {:02X?}", config.name, n, &buffer[..n]);
        let callback = shared.callbacks.read().data_received.clone();
        for frame in splitter.push(&buffer[..n]) {
            match decode_frame(frame, config.binary_mode) {
                Ok(payload) => {
                    if let Some(callback) = &callback {
                        callback(&config.host, payload);
                    }
                },
                Err(e) => warn!("[{}] dropping frame: {}", config.name, e),
            }
        }
    }
}
