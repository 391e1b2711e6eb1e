//! Serial connections
//!
//! [`SerialLink`] holds everything the synchronous and the asynchronous
//! serial variants share: opening with retries, framed reads bounded by a
//! deadline, writes, and the receive buffer that carries bytes read past a
//! terminator into the next read. [`SerialConnection`] is the synchronous
//! variant: replies are read on the caller's thread right after the write.

use parking_lot::Mutex;
use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::callbacks::DataCallback;
use crate::connection::core::ConnectionCore;
use crate::connection::traits::{Connection, LinkStats, Payload, SendRequest};
use crate::constants::{READ_LOCK_TIMEOUT, SERIAL_READ_CHUNK};
use crate::error::{LinkError, Result};
use crate::framing::{decode_reply, find_subsequence};
use crate::params::{ConnectionParams, Parity, StopBits, Terminator};
use crate::sync::TimeoutLock;

// ============================================================================
// Port abstraction
// ============================================================================

/// Byte-level access to an open serial port
pub trait SerialIo: Read + Write + Send {
    /// Discard input the device sent but nobody read yet
    fn clear_input(&mut self) -> io::Result<()>;

    /// Second handle to the same port, used to read while another thread writes
    fn try_clone_io(&self) -> io::Result<Box<dyn SerialIo>>;
}

/// Opens a port for a parameter set
pub type SerialOpener =
    Arc<dyn Fn(&ConnectionParams) -> Result<Box<dyn SerialIo>> + Send + Sync>;

struct NativePort(Box<dyn tokio_serial::SerialPort>);

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl SerialIo for NativePort {
    fn clear_input(&mut self) -> io::Result<()> {
        self.0
            .clear(tokio_serial::ClearBuffer::Input)
            .map_err(io::Error::from)
    }

    fn try_clone_io(&self) -> io::Result<Box<dyn SerialIo>> {
        let port = self.0.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(NativePort(port)))
    }
}

fn data_bits(bytesize: u8) -> Result<tokio_serial::DataBits> {
    match bytesize {
        5 => Ok(tokio_serial::DataBits::Five),
        6 => Ok(tokio_serial::DataBits::Six),
        7 => Ok(tokio_serial::DataBits::Seven),
        8 => Ok(tokio_serial::DataBits::Eight),
        other => Err(LinkError::config(format!("Unsupported data bits: {}", other))),
    }
}

fn parity(parity: Parity) -> tokio_serial::Parity {
    match parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Even => tokio_serial::Parity::Even,
        Parity::Odd => tokio_serial::Parity::Odd,
    }
}

fn stop_bits(stop_bits: StopBits) -> tokio_serial::StopBits {
    match stop_bits {
        StopBits::One => tokio_serial::StopBits::One,
        StopBits::Two => tokio_serial::StopBits::Two,
    }
}

/// Opener for real serial devices
pub fn native_opener() -> SerialOpener {
    Arc::new(|params: &ConnectionParams| -> Result<Box<dyn SerialIo>> {
        let port = tokio_serial::new(params.serial_port.as_str(), params.baudrate)
            .data_bits(data_bits(params.bytesize)?)
            .parity(parity(params.parity))
            .stop_bits(stop_bits(params.stopbits))
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(params.timeout_duration())
            .open()?;
        Ok(Box::new(NativePort(port)))
    })
}

// ============================================================================
// Shared serial machinery
// ============================================================================

pub struct SerialLink {
    core: Arc<ConnectionCore>,
    opener: SerialOpener,
    writer: Mutex<Option<Box<dyn SerialIo>>>,
    reader: Mutex<Option<Box<dyn SerialIo>>>,
    read_lock: TimeoutLock,
    read_buffer: Mutex<Vec<u8>>,
    listener_active: AtomicBool,
}

impl SerialLink {
    pub fn new(
        kind: &'static str,
        params: ConnectionParams,
        data_callback: Option<DataCallback>,
        opener: SerialOpener,
    ) -> Result<Self> {
        if !params.has_serial_port() {
            return Err(LinkError::config("serial connection requires serial_port"));
        }
        data_bits(params.bytesize)?;

        Ok(Self {
            core: Arc::new(ConnectionCore::new(kind, params, data_callback)),
            opener,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            read_lock: TimeoutLock::new(),
            read_buffer: Mutex::new(Vec::new()),
            listener_active: AtomicBool::new(false),
        })
    }

    pub fn core(&self) -> &Arc<ConnectionCore> {
        &self.core
    }

    pub fn port_name(&self) -> &str {
        &self.core.params().serial_port
    }

    pub fn listener_active(&self) -> bool {
        self.listener_active.load(Ordering::SeqCst)
    }

    pub fn set_listener_active(&self, active: bool) {
        self.listener_active.store(active, Ordering::SeqCst);
    }

    /// Bytes read past the last terminator, waiting for the next read
    pub fn pending_buffer(&self) -> Vec<u8> {
        self.read_buffer.lock().clone()
    }

    /// Open the port, retrying up to `connect_retries` attempts.
    ///
    /// Configuration errors end the sequence at once. After a successful
    /// open `setup_listener` runs, and only then the connect callback fires.
    pub fn open_transport(&self, setup_listener: &dyn Fn()) -> bool {
        if self.core.is_connected() && self.writer.lock().is_some() {
            debug!("[{}] open called while connected, doing nothing", self.core.name());
            return true;
        }

        // exclusive ports refuse a second open while a stale handle lingers
        self.writer.lock().take();
        self.reader.lock().take();

        let params = self.core.params();
        let max_attempts = params.connect_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(
                "[{}] opening {} (attempt {}/{})",
                self.core.name(),
                self.port_name(),
                attempt,
                max_attempts
            );

            let opened = {
                let _guard = self.read_lock.lock();
                (self.opener)(params).and_then(|writer| {
                    let reader = writer.try_clone_io()?;
                    *self.writer.lock() = Some(writer);
                    *self.reader.lock() = Some(reader);
                    Ok(())
                })
            };

            match opened {
                Ok(()) => {
                    self.core.set_connected(true);
                    info!("[{}] connected to {}", self.core.name(), self.port_name());
                    setup_listener();
                    self.core.on_connect(self.core.name());
                    return true;
                },
                Err(e) if e.is_fatal_open_error() => {
                    error!(
                        "[{}] error on connection to {}, giving up: {}",
                        self.core.name(),
                        self.port_name(),
                        e
                    );
                    return false;
                },
                Err(e) => {
                    error!(
                        "[{}] error on connection to {}: {}",
                        self.core.name(),
                        self.port_name(),
                        e
                    );
                    if attempt >= max_attempts {
                        error!(
                            "[{}] max number of connection attempts reached for {}",
                            self.core.name(),
                            self.port_name()
                        );
                        return false;
                    }
                    debug!(
                        "[{}] sleeping {:?} before next connection attempt",
                        self.core.name(),
                        params.connect_cycle_duration()
                    );
                    std::thread::sleep(params.connect_cycle_duration());
                },
            }
        }
    }

    /// Drop the port handles and report the disconnect
    pub fn close_transport(&self) {
        self.core.set_connected(false);
        self.writer.lock().take();
        self.reader.lock().take();
        info!("[{}] connection to {} closed", self.core.name(), self.port_name());
        self.core.on_disconnect(self.core.name());
    }

    /// Write all of `data`
    pub fn write_bytes(&self, data: &[u8]) -> Result<usize> {
        let mut writer = self.writer.lock();
        let port = writer.as_mut().ok_or_else(|| {
            LinkError::not_connected(format!("{}: serial port not open", self.port_name()))
        })?;

        debug!("[{}] send {} bytes: {:02X?}", self.core.name(), data.len(), data);
        port.write_all(data)
            .and_then(|_| port.flush())
            .map_err(|e| LinkError::write_failed(format!("{}: {}", self.port_name(), e)))?;
        Ok(data.len())
    }

    /// Read one framed reply.
    ///
    /// `Length(n)` stops after n bytes, `Bytes(t)` stops after the terminator
    /// and keeps anything behind it for the next call, `None` reads until the
    /// device goes quiet. Every call ends after `timeout * 3` at the latest.
    /// A failing port gives back whatever was read before the failure.
    pub fn read_bytes(&self, limit: &Terminator, clear_buffer: bool) -> Vec<u8> {
        let total = match self.try_read_bytes(limit, clear_buffer) {
            Ok(total) => total,
            Err(e) => {
                warn!("[{}] {}", self.core.name(), e);
                if !self.listener_active() {
                    self.core.set_connected(false);
                }
                std::mem::take(&mut *self.read_buffer.lock())
            },
        };

        if total.is_empty() && !self.listener_active() {
            // the device stopped answering: make the next send reopen the port
            debug!("[{}] nothing read, marking connection as down", self.core.name());
            self.core.set_connected(false);
        }
        total
    }

    /// Like [`read_bytes`](Self::read_bytes), but a port error other than a
    /// timeout is returned instead of ending the read. Bytes read before the
    /// error stay in the receive buffer.
    pub fn try_read_bytes(&self, limit: &Terminator, clear_buffer: bool) -> Result<Vec<u8>> {
        if !self.core.is_connected() {
            return Ok(Vec::new());
        }

        let Some(_guard) = self.read_lock.acquire(READ_LOCK_TIMEOUT) else {
            warn!(
                "[{}] read_bytes couldn't get lock on serial, skipping read",
                self.core.name()
            );
            return Ok(Vec::new());
        };

        let start = Instant::now();
        let deadline = self.core.params().read_deadline();
        let mut total = {
            let mut carried = self.read_buffer.lock();
            if clear_buffer {
                carried.clear();
            }
            std::mem::take(&mut *carried)
        };

        let mut reader = self.reader.lock();
        let Some(port) = reader.as_mut() else {
            return Ok(total);
        };

        let mut chunk = [0u8; SERIAL_READ_CHUNK];
        loop {
            if let Some(frame) = self.take_frame(&mut total, limit) {
                return Ok(frame);
            }
            if start.elapsed() > deadline {
                return Ok(total);
            }

            let want = match limit {
                Terminator::Length(n) if *n > 0 => (*n - total.len()).min(SERIAL_READ_CHUNK),
                _ => SERIAL_READ_CHUNK,
            };
            match port.read(&mut chunk[..want]) {
                Ok(0) => return Ok(total),
                Ok(n) => total.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    return Ok(total)
                },
                Err(e) => {
                    let mut carried = self.read_buffer.lock();
                    total.append(&mut carried);
                    *carried = total;
                    return Err(LinkError::read_failed(format!("{}: {}", self.port_name(), e)));
                },
            }
        }
    }

    /// Drop the port handles after the device failed underneath us
    pub fn mark_down(&self) {
        self.core.set_connected(false);
        self.writer.lock().take();
        self.reader.lock().take();
    }

    /// Split a complete frame off `total`; surplus goes to the receive buffer
    fn take_frame(&self, total: &mut Vec<u8>, limit: &Terminator) -> Option<Vec<u8>> {
        let end = match limit {
            Terminator::Length(n) if *n > 0 && total.len() >= *n => *n,
            Terminator::Bytes(term) => find_subsequence(total, term)? + term.len(),
            _ => return None,
        };
        let rest = total.split_off(end);
        if !rest.is_empty() {
            self.read_buffer.lock().extend_from_slice(&rest);
        }
        Some(std::mem::take(total))
    }

    /// Write the payload and, unless a listener owns the port, read the reply
    pub fn exchange(
        &self,
        request: &SendRequest,
        setup_listener: &dyn Fn(),
    ) -> Result<Option<Payload>> {
        let data = request.payload.as_bytes();
        if data.is_empty() {
            return Err(LinkError::EmptyPayload);
        }

        if self.core.params().auto_connect && !self.core.is_connected() {
            self.open_transport(setup_listener);
        }
        if !self.core.is_connected() {
            return Err(LinkError::not_connected(format!(
                "trying to send to {}, but connection can't be opened",
                self.port_name()
            )));
        }

        if let Err(e) = self.write_bytes(data) {
            self.core.set_connected(false);
            return Err(match e {
                LinkError::WriteFailed(_) => e,
                other => LinkError::write_failed(other.to_string()),
            });
        }

        if self.listener_active() {
            return Ok(None);
        }
        let Some(limit) = &request.limit_response else {
            return Ok(None);
        };

        let raw = self.read_bytes(limit, false);
        let reply = decode_reply(raw, self.core.params().binary_mode);
        self.core.on_data_received(self.core.name(), reply.clone());
        Ok(Some(reply))
    }

    pub fn reset_input_buffer(&self) -> Result<()> {
        if let Some(port) = self.writer.lock().as_mut() {
            port.clear_input()?;
        }
        Ok(())
    }
}

impl fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialLink")
            .field("core", &self.core)
            .field("port", &self.port_name())
            .field("listener_active", &self.listener_active())
            .finish()
    }
}

// ============================================================================
// Synchronous serial
// ============================================================================

#[derive(Debug)]
pub struct SerialConnection {
    link: SerialLink,
}

impl SerialConnection {
    pub fn new(params: ConnectionParams, data_callback: Option<DataCallback>) -> Result<Self> {
        Self::with_opener(params, data_callback, native_opener())
    }

    pub fn with_opener(
        params: ConnectionParams,
        data_callback: Option<DataCallback>,
        opener: SerialOpener,
    ) -> Result<Self> {
        Ok(Self {
            link: SerialLink::new("serial", params, data_callback, opener)?,
        })
    }

    pub fn link(&self) -> &SerialLink {
        &self.link
    }

    pub fn read_bytes(&self, limit: &Terminator, clear_buffer: bool) -> Vec<u8> {
        self.link.read_bytes(limit, clear_buffer)
    }

    pub fn reset_input_buffer(&self) -> Result<()> {
        self.link.reset_input_buffer()
    }
}

impl Connection for SerialConnection {
    fn kind(&self) -> &str {
        self.link.core().kind()
    }

    fn name(&self) -> &str {
        self.link.core().name()
    }

    fn open(&self) -> bool {
        self.link
            .core()
            .open_with(|| self.link.open_transport(&|| {}))
    }

    fn close(&self) {
        self.link.core().close_with(|| self.link.close_transport());
    }

    fn send(&self, request: &SendRequest) -> Result<Option<Payload>> {
        self.link.core().send_with(
            request,
            || self.link.open_transport(&|| {}),
            |request| self.link.exchange(request, &|| {}),
        )
    }

    fn connected(&self) -> bool {
        self.link.core().is_connected()
    }

    fn stats(&self) -> LinkStats {
        self.link.core().stats()
    }
}
