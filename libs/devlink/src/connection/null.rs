//! Null connection
//!
//! Explicit "no transport" fallback: opening always succeeds and sending
//! returns a fixed dummy reply. The factory hands this out whenever no real
//! transport can be resolved.

use std::sync::Arc;
use tracing::debug;

use crate::callbacks::DataCallback;
use crate::connection::core::ConnectionCore;
use crate::connection::traits::{Connection, LinkStats, Payload, SendRequest};
use crate::error::Result;
use crate::params::ConnectionParams;

#[derive(Debug)]
pub struct NullConnection {
    core: Arc<ConnectionCore>,
    dummy: Option<Payload>,
}

impl NullConnection {
    pub fn new(params: ConnectionParams, data_callback: Option<DataCallback>) -> Self {
        Self {
            core: Arc::new(ConnectionCore::new("null", params, data_callback)),
            dummy: None,
        }
    }

    /// Reply returned by every send
    pub fn with_dummy(mut self, dummy: impl Into<Payload>) -> Self {
        self.dummy = Some(dummy.into());
        self
    }

    pub fn core(&self) -> &Arc<ConnectionCore> {
        &self.core
    }
}

impl Connection for NullConnection {
    fn kind(&self) -> &str {
        self.core.kind()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn open(&self) -> bool {
        self.core.open_with(|| {
            debug!("[{}] simulating open", self.core.name());
            true
        })
    }

    fn close(&self) {
        self.core
            .close_with(|| debug!("[{}] simulating close", self.core.name()));
    }

    fn send(&self, request: &SendRequest) -> Result<Option<Payload>> {
        self.core.send_with(
            request,
            || true,
            |request| {
                debug!(
                    "[{}] simulating send of \"{}\"",
                    self.core.name(),
                    request.payload
                );
                Ok(self.dummy.clone())
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
