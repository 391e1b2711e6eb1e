//! UDP listener over loopback
//!
//! The listener binds `0.0.0.0` on the configured local port; datagrams are
//! delivered to the data callback with the sender's IPv4 address as source.

// Allow unwrap() in tests for cleaner test code
#![allow(clippy::unwrap_used)]

use crossbeam::channel::{unbounded, Receiver};
use devlink::{Connection, ConnectionParams, Payload, UdpRequestConnection};
use serde_json::json;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

/// Port nobody is bound to right now
fn free_udp_port() -> u16 {
    let spare = UdpSocket::bind("0.0.0.0:0").unwrap();
    spare.local_addr().unwrap().port()
}

/// Port 9999 when available, any free port otherwise
fn well_known_port() -> u16 {
    match UdpSocket::bind("0.0.0.0:9999") {
        Ok(_) => 9999,
        Err(_) => free_udp_port(),
    }
}

fn sender() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:5555").unwrap_or_else(|_| UdpSocket::bind("127.0.0.1:0").unwrap())
}

struct Listener {
    conn: UdpRequestConnection,
    data: Receiver<(String, Payload)>,
    events: Receiver<String>,
    port: u16,
}

fn listener(name: &str, port: u16) -> Listener {
    let (data_tx, data) = unbounded();
    let (event_tx, events) = unbounded();
    let up = event_tx.clone();

    let params = ConnectionParams::from_value(json!({
        "name": name,
        "local_port": port,
        "timeout": 0.05,
    }))
    .unwrap()
    .on_connect(move |source| {
        let _ = up.send(format!("up:{}", source));
    })
    .on_disconnect(move |source| {
        let _ = event_tx.send(format!("down:{}", source));
    });

    let conn = UdpRequestConnection::new(
        params,
        Some(Arc::new(move |source: &str, payload: Payload| {
            let _ = data_tx.send((source.to_string(), payload));
        })),
    )
    .unwrap();

    Listener {
        conn,
        data,
        events,
        port,
    }
}

#[test]
fn test_datagram_reaches_callback_once() {
    let listener = listener("udp", well_known_port());
    assert!(listener.conn.open());
    assert_eq!(
        listener.events.recv_timeout(Duration::from_secs(5)).unwrap(),
        "up:udp UDP_listener"
    );

    let socket = sender();
    socket
        .send_to(b"hello", ("127.0.0.1", listener.port))
        .unwrap();

    let (source, payload) = listener.data.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(source, "127.0.0.1");
    assert_eq!(payload, Payload::from("hello"));

    // exactly one callback for one datagram
    assert!(listener
        .data
        .recv_timeout(Duration::from_millis(200))
        .is_err());

    listener.conn.close();
    assert_eq!(
        listener.events.recv_timeout(Duration::from_secs(5)).unwrap(),
        "down:udp UDP_listener"
    );
    assert!(!listener.conn.connected());
}

#[test]
fn test_invalid_utf8_datagram_is_dropped() {
    let listener = listener("udp-bytes", free_udp_port());
    assert!(listener.conn.open());
    listener.events.recv_timeout(Duration::from_secs(5)).unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .send_to(&[0xff, 0xfe, 0x00], ("127.0.0.1", listener.port))
        .unwrap();
    socket
        .send_to(b"still alive", ("127.0.0.1", listener.port))
        .unwrap();

    let (_, payload) = listener.data.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(payload, Payload::from("still alive"));
    assert!(listener.conn.listening());

    listener.conn.close();
    assert!(!listener.conn.listening());
}

#[test]
fn test_reopen_after_close() {
    let listener = listener("udp-reopen", free_udp_port());
    assert!(listener.conn.open());
    listener.events.recv_timeout(Duration::from_secs(5)).unwrap();
    listener.conn.close();
    listener.events.recv_timeout(Duration::from_secs(5)).unwrap();

    assert!(listener.conn.open());
    assert_eq!(
        listener.events.recv_timeout(Duration::from_secs(5)).unwrap(),
        "up:udp-reopen UDP_listener"
    );

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .send_to(b"again", ("127.0.0.1", listener.port))
        .unwrap();
    let (_, payload) = listener.data.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(payload, Payload::from("again"));
    listener.conn.close();
}
