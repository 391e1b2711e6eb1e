//! In-memory serial port for testing
//!
//! Scripted device input, write capture and a read timeout that behaves like
//! a real port: a read with nothing pending waits up to the timeout and then
//! fails with `TimedOut`. Clones share the same device state, the way
//! `try_clone` handles of a real port share one file descriptor.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::connection::serial::{SerialIo, SerialOpener};
use crate::error::{LinkError, Result};
use crate::params::ConnectionParams;

#[derive(Debug, Default)]
struct MockDevice {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    fail_write: bool,
    fail_read: bool,
    reads: usize,
    writes: usize,
    clears: usize,
}

/// Scripted serial device
#[derive(Debug, Clone)]
pub struct MockSerialPort {
    device: Arc<(Mutex<MockDevice>, Condvar)>,
    read_timeout: Duration,
}

impl MockSerialPort {
    pub fn new(read_timeout: Duration) -> Self {
        Self {
            device: Arc::new((Mutex::new(MockDevice::default()), Condvar::new())),
            read_timeout,
        }
    }

    /// Make the device send `bytes`
    pub fn feed(&self, bytes: &[u8]) {
        let (device, cond) = &*self.device;
        device.lock().rx.extend(bytes.iter().copied());
        cond.notify_all();
    }

    /// Everything written to the device so far
    pub fn written(&self) -> Vec<u8> {
        self.device.0.lock().tx.clone()
    }

    pub fn set_fail_write(&self, fail: bool) {
        self.device.0.lock().fail_write = fail;
    }

    /// Make every read fail the way an unplugged device does
    pub fn set_fail_read(&self, fail: bool) {
        let (device, cond) = &*self.device;
        device.lock().fail_read = fail;
        cond.notify_all();
    }

    /// Bytes the device sent that nobody has read yet
    pub fn pending_input(&self) -> Vec<u8> {
        self.device.0.lock().rx.iter().copied().collect()
    }

    /// Read and write calls made against the device
    pub fn io_calls(&self) -> usize {
        let device = self.device.0.lock();
        device.reads + device.writes
    }

    pub fn clears(&self) -> usize {
        self.device.0.lock().clears
    }

    /// Opener handing out this port on every call
    pub fn opener(&self) -> SerialOpener {
        let port = self.clone();
        Arc::new(move |_params: &ConnectionParams| -> Result<Box<dyn SerialIo>> {
            Ok(Box::new(port.clone()))
        })
    }

    /// Opener failing `failures` times before handing out this port;
    /// every call is counted in `attempts`
    pub fn flaky_opener(&self, failures: usize, attempts: Arc<AtomicUsize>) -> SerialOpener {
        let port = self.clone();
        Arc::new(move |params: &ConnectionParams| -> Result<Box<dyn SerialIo>> {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= failures {
                return Err(LinkError::open_failed(format!(
                    "{}: device busy (attempt {})",
                    params.serial_port, attempt
                )));
            }
            Ok(Box::new(port.clone()))
        })
    }
}

impl Read for MockSerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (device, cond) = &*self.device;
        let deadline = Instant::now() + self.read_timeout;
        let mut device = device.lock();
        device.reads += 1;

        while device.rx.is_empty() {
            if device.fail_read {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
            }
            if cond.wait_until(&mut device, deadline).timed_out() && device.rx.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "Operation timed out"));
            }
        }

        let n = buf.len().min(device.rx.len());
        for (slot, byte) in buf.iter_mut().zip(device.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockSerialPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut device = self.device.0.lock();
        device.writes += 1;
        if device.fail_write {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        device.tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialIo for MockSerialPort {
    fn clear_input(&mut self) -> io::Result<()> {
        let mut device = self.device.0.lock();
        device.rx.clear();
        device.clears += 1;
        Ok(())
    }

    fn try_clone_io(&self) -> io::Result<Box<dyn SerialIo>> {
        Ok(Box::new(self.clone()))
    }
}
