//! Shared connection state and the open/close/send contract
//!
//! Every variant owns an `Arc<ConnectionCore>` and routes its public
//! operations through `open_with`, `close_with` and `send_with`, passing its
//! own transport steps as closures. Worker threads hold a clone of the
//! `Arc` to report data and lifecycle events.

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::callbacks::{DataCallback, SuspendCallback};
use crate::connection::traits::{LinkStats, Payload, SendRequest};
use crate::error::{LinkError, Result};
use crate::params::ConnectionParams;

pub struct ConnectionCore {
    kind: &'static str,
    name: String,
    params: ConnectionParams,
    connected: AtomicBool,
    send_lock: Option<Mutex<()>>,
    data_callback: RwLock<Option<DataCallback>>,
    suspend_callback: RwLock<Option<SuspendCallback>>,
    stats: Mutex<LinkStats>,
}

impl ConnectionCore {
    pub fn new(
        kind: &'static str,
        params: ConnectionParams,
        data_callback: Option<DataCallback>,
    ) -> Self {
        let name = if params.name.is_empty() {
            kind.to_string()
        } else {
            params.name.clone()
        };
        let send_lock = params.serialize_sends.then(|| Mutex::new(()));
        let suspend_callback = params.callbacks.on_suspend.clone();

        Self {
            kind,
            name,
            params,
            connected: AtomicBool::new(false),
            send_lock,
            data_callback: RwLock::new(data_callback),
            suspend_callback: RwLock::new(suspend_callback),
            stats: Mutex::new(LinkStats::default()),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        if was && !connected {
            self.stats.lock().record_disconnection();
        }
    }

    pub fn set_data_callback(&self, callback: Option<DataCallback>) {
        *self.data_callback.write() = callback;
    }

    pub fn set_suspend_callback(&self, callback: Option<SuspendCallback>) {
        *self.suspend_callback.write() = callback;
    }

    pub fn stats(&self) -> LinkStats {
        self.stats.lock().clone()
    }

    /// Run the variant's open step under the send-lock, then the post-open hook
    pub fn open_with(&self, open: impl FnOnce() -> bool) -> bool {
        debug!("[{}] open called", self.name);
        let _guard = self.send_lock.as_ref().map(|lock| lock.lock());

        self.stats.lock().record_open_attempt();
        if open() {
            self.connected.store(true, Ordering::SeqCst);
            self.stats.lock().record_successful_open();
            if let Some(hook) = &self.params.callbacks.init_on_open {
                hook();
            }
        }
        self.is_connected()
    }

    /// Run the variant's close step, then mark the connection closed
    pub fn close_with(&self, close: impl FnOnce()) {
        debug!("[{}] close called", self.name);
        close();
        self.set_connected(false);
    }

    /// The send contract: payload check, implicit open, send-lock, pre-send hook
    pub fn send_with(
        &self,
        request: &SendRequest,
        open: impl FnOnce() -> bool,
        send: impl FnOnce(&SendRequest) -> Result<Option<Payload>>,
    ) -> Result<Option<Payload>> {
        if request.payload.is_empty() {
            return Err(LinkError::EmptyPayload);
        }

        if !self.is_connected() {
            if !self.params.auto_connect {
                return Err(LinkError::not_connected(format!(
                    "{}: not connected and auto_connect disabled",
                    self.name
                )));
            }
            debug!("[{}] not connected, auto-connecting before send", self.name);
            self.stats.lock().record_open_attempt();
            if open() {
                self.connected.store(true, Ordering::SeqCst);
                self.stats.lock().record_successful_open();
            }
            if !self.is_connected() {
                return Err(LinkError::not_connected(format!(
                    "{}: auto_connect did not open a connection",
                    self.name
                )));
            }
        }

        let _guard = self.send_lock.as_ref().map(|lock| {
            debug!("[{}] waiting for send lock", self.name);
            lock.lock()
        });

        if let Some(hook) = &self.params.callbacks.init_on_send {
            if !hook() {
                debug!("[{}] send cancelled by init_on_send hook", self.name);
                return Ok(None);
            }
        }

        let response = send(request)?;
        self.stats.lock().record_send(request.payload.len());
        Ok(response)
    }

    /// Forward received data to the data callback, empty data is dropped
    pub fn on_data_received(&self, source: &str, data: Payload) {
        if data.is_empty() {
            return;
        }
        debug!("[{}] received data \"{}\" from {}", self.name, data, source);
        self.stats.lock().record_received(data.len());
        let callback = self.data_callback.read().clone();
        if let Some(callback) = callback {
            callback(source, data);
        }
    }

    pub fn on_connect(&self, source: &str) {
        self.connected.store(true, Ordering::SeqCst);
        info!("[{}] connected ({})", self.name, source);
        if let Some(callback) = &self.params.callbacks.on_connect {
            callback(source);
        }
    }

    pub fn on_disconnect(&self, source: &str) {
        debug!("[{}] disconnected ({})", self.name, source);
        self.set_connected(false);
        if let Some(callback) = &self.params.callbacks.on_disconnect {
            callback(source);
        }
    }

    /// Ask the owner to suspend; returns whether anyone was listening
    pub fn on_suspend(&self, by: &str) -> bool {
        let callback = self.suspend_callback.read().clone();
        match callback {
            Some(callback) => {
                callback(true, by);
                true
            },
            None => {
                warn!(
                    "[{}] suspend callback wanted, but not set by plugin",
                    self.name
                );
                false
            },
        }
    }
}

impl fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .field("serialize_sends", &self.send_lock.is_some())
            .finish()
    }
}
