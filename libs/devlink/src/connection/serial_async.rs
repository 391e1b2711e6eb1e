//! Asynchronous serial connection
//!
//! Two worker threads per open port. The receive thread reads continuously,
//! slices frames out of a rolling buffer and pushes them onto a channel; the
//! queue thread pops them and runs the data callback one frame at a time, in
//! arrival order. A slow callback therefore never stalls the byte-level
//! receive loop. `send()` only writes: replies arrive through the callback.
//!
//! Shutdown is two-staged: the receive thread stops reading, enqueues a
//! shutdown marker behind the frames still in flight, and the queue thread
//! delivers everything up to the marker before it exits.
//!
//! Every thread pair has its own run flag. A reopen stops and joins the old
//! pair before the port is opened again, so a stale receive thread never
//! reads from the new port handle.

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

use crate::callbacks::DataCallback;
use crate::connection::core::ConnectionCore;
use crate::connection::serial::{native_opener, SerialLink, SerialOpener};
use crate::connection::traits::{Connection, LinkStats, Payload, SendRequest};
use crate::constants::MIN_POLL_INTERVAL;
use crate::error::Result;
use crate::framing::{decode_frame, FrameSplitter};
use crate::params::{ConnectionParams, Terminator};
use crate::sync::{join_worker, spawn_named};

/// Item on the dispatch queue
#[derive(Debug)]
enum Dispatch {
    Frame(Payload),
    Shutdown,
}

#[derive(Debug)]
struct ListenerThreads {
    running: Arc<AtomicBool>,
    receiver: JoinHandle<()>,
    queue: JoinHandle<()>,
}

#[derive(Debug)]
pub struct SerialAsyncConnection {
    link: Arc<SerialLink>,
    threads: Mutex<Option<ListenerThreads>>,
}

impl SerialAsyncConnection {
    pub fn new(params: ConnectionParams, data_callback: Option<DataCallback>) -> Result<Self> {
        Self::with_opener(params, data_callback, native_opener())
    }

    pub fn with_opener(
        params: ConnectionParams,
        data_callback: Option<DataCallback>,
        opener: SerialOpener,
    ) -> Result<Self> {
        Ok(Self {
            link: Arc::new(SerialLink::new(
                "serial_async",
                params,
                data_callback,
                opener,
            )?),
            threads: Mutex::new(None),
        })
    }

    pub fn link(&self) -> &SerialLink {
        &self.link
    }

    /// Both listener threads still running
    pub fn listening(&self) -> bool {
        self.threads
            .lock()
            .as_ref()
            .is_some_and(|t| !t.receiver.is_finished() && !t.queue.is_finished())
    }

    pub fn reset_input_buffer(&self) -> Result<()> {
        self.link.reset_input_buffer()
    }

    fn start_listener(&self) {
        let mut slot = self.threads.lock();
        if let Some(stale) = slot.take() {
            join_threads(stale);
        }

        let name = self.link.core().name().to_string();
        let (tx, rx) = unbounded();
        let running = Arc::new(AtomicBool::new(true));
        self.link.set_listener_active(true);

        let core = Arc::clone(self.link.core());
        let queue = match spawn_named(format!("{}-queue", name), move || queue_worker(core, rx)) {
            Ok(handle) => handle,
            Err(e) => {
                error!("[{}] could not start serial queue thread: {}", name, e);
                self.link.set_listener_active(false);
                return;
            },
        };

        let link = Arc::clone(&self.link);
        let flag = Arc::clone(&running);
        let shutdown = tx.clone();
        match spawn_named(format!("{}-receive", name), move || {
            receive_worker(link, flag, tx)
        }) {
            Ok(receiver) => {
                *slot = Some(ListenerThreads {
                    running,
                    receiver,
                    queue,
                })
            },
            Err(e) => {
                error!("[{}] could not start serial receive thread: {}", name, e);
                self.link.set_listener_active(false);
                let _ = shutdown.send(Dispatch::Shutdown);
                join_worker(queue, "serial queue");
            },
        }
    }

    fn stop_listener(&self) {
        self.link.set_listener_active(false);
        let threads = self.threads.lock().take();
        if let Some(threads) = threads {
            debug!("[{}] waiting for serial listener threads", self.link.core().name());
            join_threads(threads);
        }
    }

    /// Open the port, retiring the listener of a link that went down first
    fn reopen(&self) -> bool {
        if !self.link.core().is_connected() {
            self.stop_listener();
        }
        self.link.open_transport(&|| self.start_listener())
    }
}

impl Connection for SerialAsyncConnection {
    fn kind(&self) -> &str {
        self.link.core().kind()
    }

    fn name(&self) -> &str {
        self.link.core().name()
    }

    fn open(&self) -> bool {
        self.link
            .core()
            .open_with(|| self.reopen())
    }

    fn close(&self) {
        self.link.core().close_with(|| {
            self.stop_listener();
            self.link.close_transport();
        });
    }

    fn send(&self, request: &SendRequest) -> Result<Option<Payload>> {
        self.link.core().send_with(
            request,
            || self.reopen(),
            |request| self.link.exchange(request, &|| self.start_listener()),
        )
    }

    fn connected(&self) -> bool {
        self.link.core().is_connected()
    }

    fn stats(&self) -> LinkStats {
        self.link.core().stats()
    }
}

impl Drop for SerialAsyncConnection {
    fn drop(&mut self) {
        self.stop_listener();
    }
}

/// Receiver first: it queues the shutdown marker the queue thread waits for
fn join_threads(threads: ListenerThreads) {
    threads.running.store(false, Ordering::SeqCst);
    join_worker(threads.receiver, "serial receive");
    join_worker(threads.queue, "serial queue");
}

fn receive_worker(link: Arc<SerialLink>, running: Arc<AtomicBool>, tx: Sender<Dispatch>) {
    let core = link.core();
    let binary_mode = core.params().binary_mode;
    let mut splitter = FrameSplitter::new(core.params().terminator.clone());

    while core.is_connected() && running.load(Ordering::SeqCst) {
        let chunk = match link.try_read_bytes(&Terminator::None, false) {
            Ok(chunk) => chunk,
            Err(e) => {
                error!("[{}] serial receive thread failed: {}", core.name(), e);
                link.mark_down();
                core.on_disconnect(core.name());
                break;
            },
        };
        if chunk.is_empty() {
            std::thread::sleep(MIN_POLL_INTERVAL);
            continue;
        }
        debug!(
            "[{}] received raw data {:02X?}, buffered {} bytes",
            core.name(),
            chunk,
            splitter.pending().len()
        );

        for frame in splitter.push(&chunk) {
            match decode_frame(frame, binary_mode) {
                Ok(payload) => {
                    if tx.send(Dispatch::Frame(payload)).is_err() {
                        warn!("[{}] dispatch queue closed, dropping frame", core.name());
                    }
                },
                Err(e) => warn!("[{}] dropping undecodable frame: {}", core.name(), e),
            }
        }
    }

    // only a pair that ended on its own releases the port for direct reads
    if running.swap(false, Ordering::SeqCst) {
        debug!("[{}] serial receive thread stopping, port is down", core.name());
        link.set_listener_active(false);
    } else {
        debug!("[{}] serial listener shut down", core.name());
    }
    let _ = tx.send(Dispatch::Shutdown);
}

fn queue_worker(core: Arc<ConnectionCore>, rx: Receiver<Dispatch>) {
    for item in rx.iter() {
        match item {
            Dispatch::Frame(payload) => core.on_data_received(core.name(), payload),
            Dispatch::Shutdown => break,
        }
    }
    debug!("[{}] serial queue thread stopped", core.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::MockSerialPort;
    use crate::error::LinkError;
    use crossbeam::channel::bounded;
    use serde_json::json;
    use std::time::{Duration, Instant};

    type Frames = Arc<Mutex<Vec<(String, Payload)>>>;

    fn connection(port: &MockSerialPort, extra: serde_json::Value) -> (SerialAsyncConnection, Frames) {
        let mut base = json!({
            "name": "async",
            "serial_port": "/dev/ttyMOCK1",
            "timeout": 0.05,
            "connect_cycle": 0,
            "terminator": "\\r\\n",
        });
        if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
            base.extend(extra.clone());
        }
        let frames: Frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        let conn = SerialAsyncConnection::with_opener(
            ConnectionParams::from_value(base).unwrap(),
            Some(Arc::new(move |source: &str, data: Payload| {
                sink.lock().push((source.to_string(), data));
            })),
            port.opener(),
        )
        .unwrap();
        (conn, frames)
    }

    fn wait_for(frames: &Frames, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while frames.lock().len() < count && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_frames_delivered_in_order() {
        let port = MockSerialPort::new(Duration::from_millis(20));
        let (conn, frames) = connection(&port, json!({}));
        assert!(conn.open());
        assert!(conn.listening());

        let mut stream = Vec::new();
        for i in 0..1000 {
            stream.extend_from_slice(format!("frame-{:04}\r\n", i).as_bytes());
        }
        // uneven chunks so frames straddle reads
        for chunk in stream.chunks(37) {
            port.feed(chunk);
        }

        wait_for(&frames, 1000);
        conn.close();

        let frames = frames.lock();
        assert_eq!(frames.len(), 1000);
        for (i, (source, payload)) in frames.iter().enumerate() {
            assert_eq!(source, "async");
            assert_eq!(payload, &Payload::Text(format!("frame-{:04}", i)));
        }
    }

    #[test]
    fn test_fixed_length_frames_in_binary_mode() {
        let port = MockSerialPort::new(Duration::from_millis(20));
        let (conn, frames) = connection(&port, json!({"terminator": 3, "binary_mode": true}));
        assert!(conn.open());

        port.feed(&[1, 2, 3, 4, 5, 6, 7]);
        wait_for(&frames, 2);
        conn.close();

        let frames = frames.lock();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].1, Payload::Binary(vec![1, 2, 3]));
        assert_eq!(frames[1].1, Payload::Binary(vec![4, 5, 6]));
    }

    #[test]
    fn test_invalid_utf8_frame_is_dropped() {
        let port = MockSerialPort::new(Duration::from_millis(20));
        let (conn, frames) = connection(&port, json!({}));
        assert!(conn.open());

        port.feed(b"good\r\n");
        port.feed(&[0xff, 0xfe, b'\r', b'\n']);
        port.feed(b"next\r\n");
        wait_for(&frames, 2);
        conn.close();

        let frames = frames.lock();
        let texts: Vec<_> = frames.iter().map(|(_, p)| p.clone()).collect();
        assert_eq!(texts, vec![Payload::from("good"), Payload::from("next")]);
    }

    #[test]
    fn test_send_returns_none_while_listening() {
        let port = MockSerialPort::new(Duration::from_millis(20));
        let (conn, frames) = connection(&port, json!({}));
        assert!(conn.open());

        let reply = conn
            .send(&SendRequest::new("STATUS?\r\n").limit_response(&b"\r\n"[..]))
            .unwrap();
        assert_eq!(reply, None);
        assert_eq!(port.written(), b"STATUS?\r\n".to_vec());

        port.feed(b"STATUS OK\r\n");
        wait_for(&frames, 1);
        conn.close();
        assert_eq!(frames.lock()[0].1, Payload::from("STATUS OK"));
    }

    #[test]
    fn test_close_joins_all_threads() {
        let port = MockSerialPort::new(Duration::from_millis(20));
        let (conn, _frames) = connection(&port, json!({}));
        assert!(conn.open());

        let (receiver, queue) = {
            let threads = conn.threads.lock();
            let threads = threads.as_ref().unwrap();
            (threads.receiver.thread().id(), threads.queue.thread().id())
        };
        assert_ne!(receiver, queue);

        conn.close();
        assert!(!conn.listening());
        assert!(conn.threads.lock().is_none());
        assert!(!conn.link().listener_active());
        assert!(!conn.connected());

        // reopening starts a fresh pair of threads
        assert!(conn.open());
        assert!(conn.listening());
        conn.close();
    }

    #[test]
    fn test_slow_callback_does_not_lose_frames() {
        let port = MockSerialPort::new(Duration::from_millis(20));
        let frames: Frames = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&frames);
        let conn = SerialAsyncConnection::with_opener(
            ConnectionParams::from_value(json!({
                "serial_port": "/dev/ttyMOCK2",
                "timeout": 0.05,
                "terminator": "\\n",
            }))
            .unwrap(),
            Some(Arc::new(move |source: &str, data: Payload| {
                std::thread::sleep(Duration::from_millis(2));
                sink.lock().push((source.to_string(), data));
            })),
            port.opener(),
        )
        .unwrap();
        assert!(conn.open());

        for i in 0..50 {
            port.feed(format!("{}\n", i).as_bytes());
        }
        wait_for(&frames, 50);
        conn.close();

        let values: Vec<_> = frames.lock().iter().map(|(_, p)| p.to_string()).collect();
        let expected: Vec<_> = (0..50).map(|i| i.to_string()).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn test_send_after_write_failure_reopens_port() {
        let port = MockSerialPort::new(Duration::from_millis(20));
        let (conn, frames) = connection(&port, json!({}));
        let conn = Arc::new(conn);
        assert!(conn.open());

        port.set_fail_write(true);
        assert!(matches!(
            conn.send(&SendRequest::new("X")),
            Err(LinkError::WriteFailed(_))
        ));
        assert!(!conn.connected());
        port.set_fail_write(false);

        let (tx, rx) = bounded(1);
        let sender = Arc::clone(&conn);
        std::thread::spawn(move || {
            let _ = tx.send(sender.send(&SendRequest::new("Y")));
        });
        let result = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("send after a write failure did not return");
        assert_eq!(result, Ok(None));
        assert!(conn.connected());
        assert!(conn.listening());
        assert_eq!(port.written(), b"Y".to_vec());

        port.feed(b"back\r\n");
        wait_for(&frames, 1);
        conn.close();
        assert!(!conn.listening());
        assert_eq!(frames.lock()[0].1, Payload::from("back"));
    }

    #[test]
    fn test_dead_port_ends_listener() {
        let port = MockSerialPort::new(Duration::from_millis(20));
        let (conn, _frames) = connection(&port, json!({}));
        assert!(conn.open());
        assert!(conn.listening());

        port.set_fail_read(true);
        let deadline = Instant::now() + Duration::from_secs(5);
        while (conn.connected() || conn.listening()) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!conn.connected());
        assert!(!conn.listening());
        assert!(!conn.link().listener_active());

        // the next send brings the port and the listener back
        port.set_fail_read(false);
        assert_eq!(conn.send(&SendRequest::new("PING\r\n")), Ok(None));
        assert!(conn.connected());
        assert!(conn.listening());
        conn.close();
    }
}
