//! Factory resolution through the public API

// Allow unwrap() in tests for cleaner test code
#![allow(clippy::unwrap_used)]

use devlink::{ConnectionFactory, ConnectionParams, ConnectionType, LinkError, SendRequest};
use serde_json::json;
use std::collections::HashMap;

fn params(value: serde_json::Value) -> ConnectionParams {
    ConnectionParams::from_value(value).unwrap()
}

#[test]
fn test_every_builtin_tag_builds_its_variant() {
    let factory = ConnectionFactory::new();
    let base = json!({
        "host": "127.0.0.1",
        "port": 4998,
        "serial_port": "/dev/devlink-missing",
    });

    for kind in ConnectionType::ALL {
        let mut value = base.clone();
        value["connection"] = json!(kind.as_str());
        let conn = factory.create(params(value), None);
        assert_eq!(conn.kind(), kind.as_str());
        assert!(!conn.connected());
    }

    let counts = factory.creation_counts();
    assert_eq!(counts.len(), ConnectionType::ALL.len());
    assert!(counts.iter().all(|(_, n)| *n == 1));
}

#[test]
fn test_sanitized_map_drives_inference() {
    let factory = ConnectionFactory::new();
    let mut raw = HashMap::new();
    raw.insert("serial_port".to_string(), json!("/dev/devlink-missing"));
    raw.insert("baudrate".to_string(), json!("115200"));
    raw.insert("connect_retries".to_string(), json!("2"));
    raw.insert("connect_cycle".to_string(), json!("0"));
    raw.insert("auto_connect".to_string(), json!("false"));

    let params = ConnectionParams::from_map(raw).unwrap();
    assert_eq!(params.baudrate, 115_200);

    let conn = factory.create(params, None);
    assert_eq!(conn.kind(), "serial");

    // the device does not exist: open gives up, send refuses without reopening
    assert!(!conn.open());
    assert!(matches!(
        conn.send(&SendRequest::new("PING\r")),
        Err(LinkError::NotConnected(_))
    ));
    assert!(conn.stats().open_attempts >= 1);
}

#[test]
fn test_nothing_configured_gives_working_null() {
    let factory = ConnectionFactory::new();
    let conn = factory.create(ConnectionParams::default(), None);
    assert_eq!(conn.kind(), "null");
    assert!(conn.open());
    assert_eq!(conn.send(&SendRequest::new("anything")).unwrap(), None);
    assert_eq!(
        conn.send(&SendRequest::default()),
        Err(LinkError::EmptyPayload)
    );
    conn.close();
    assert!(!conn.connected());
}
