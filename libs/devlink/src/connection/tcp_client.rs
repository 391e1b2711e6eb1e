//! Persistent TCP client connection
//!
//! Wraps [`TcpClient`]: one long-lived socket, replies are delivered only
//! through the data callback so `send()` always returns `None`. Reconnects
//! are handled by the client; when its policy aborts, the owner's suspend
//! callback is asked to pause the plugin.

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

use crate::callbacks::DataCallback;
use crate::connection::core::ConnectionCore;
use crate::connection::traits::{Connection, LinkStats, Payload, SendRequest};
use crate::constants::{CONNECT_SETTLE_DELAY, CONNECT_SETTLE_POLL};
use crate::error::Result;
use crate::net::reconnect::ReconnectStats;
use crate::net::tcp_client::{ClientCallbacks, TcpClient, TcpClientConfig};
use crate::params::ConnectionParams;

#[derive(Debug)]
pub struct TcpClientConnection {
    core: Arc<ConnectionCore>,
    client: TcpClient,
}

impl TcpClientConnection {
    pub fn new(params: ConnectionParams, data_callback: Option<DataCallback>) -> Result<Self> {
        let core = Arc::new(ConnectionCore::new(
            "net_tcp_client",
            params,
            data_callback,
        ));
        let client = TcpClient::new(TcpClientConfig::from_params(core.params(), core.name()))?;

        let on_data = Arc::clone(&core);
        let on_connect = Arc::clone(&core);
        let on_disconnect = Arc::clone(&core);
        let on_abort = Arc::clone(&core);
        client.set_callbacks(ClientCallbacks {
            data_received: Some(Arc::new(move |source: &str, data: Payload| {
                on_data.on_data_received(source, data)
            })),
            connected: Some(Arc::new(move |source: &str| on_connect.on_connect(source))),
            disconnected: Some(Arc::new(move |source: &str| {
                on_disconnect.on_disconnect(source)
            })),
            abort: Some(Arc::new(move || {
                on_abort.on_suspend(on_abort.kind());
            })),
        });

        Ok(Self { core, client })
    }

    pub fn core(&self) -> &Arc<ConnectionCore> {
        &self.core
    }

    pub fn reconnect_stats(&self) -> ReconnectStats {
        self.client.reconnect_stats()
    }

    /// Start the client and give the first attempt a moment to settle.
    ///
    /// Only the `on_connect` callback reliably reports a later success.
    fn open_client(&self) -> bool {
        if self.client.connected() {
            return true;
        }
        if let Err(e) = self.client.connect() {
            error!("[{}] could not start TCP client: {}", self.core.name(), e);
            return false;
        }

        let deadline = Instant::now() + CONNECT_SETTLE_DELAY;
        while !self.client.connected() && Instant::now() < deadline {
            std::thread::sleep(CONNECT_SETTLE_POLL);
        }
        debug!(
            "[{}] TCP client connected after settle: {}",
            self.core.name(),
            self.client.connected()
        );
        self.client.connected()
    }
}

impl Connection for TcpClientConnection {
    fn kind(&self) -> &str {
        self.core.kind()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn open(&self) -> bool {
        self.core.open_with(|| self.open_client())
    }

    fn close(&self) {
        self.core.close_with(|| self.client.close());
    }

    fn send(&self, request: &SendRequest) -> Result<Option<Payload>> {
        self.core.send_with(
            request,
            || self.open_client(),
            |request| {
                self.client.send(request.payload.as_bytes())?;
                Ok(None)
            },
        )
    }

    fn connected(&self) -> bool {
        self.core.is_connected()
    }

    fn stats(&self) -> LinkStats {
        self.core.stats()
    }
}
