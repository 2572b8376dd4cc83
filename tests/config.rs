//! Loading configuration and stream descriptions from files.

use sensorstream::{
    FieldDef, FieldType, RecordSchema, StreamConfig, StreamDescription, StreamError,
    StreamRequest, Transport, WireFormat,
};
use std::fs;
use tempfile::TempDir;

// --- Stream Configuration ---

#[test]
fn test_load_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stream.json");
    fs::write(
        &path,
        r#"{
            "channel": { "high_water_mark": 4096, "poll_interval_ms": 100 },
            "subscription": { "max_buffered": 50, "live_timeout_ms": 30000 },
            "client": {
                "transport": "websocket",
                "stream_url": "ws://sensors.local/stream",
                "description_url": "http://sensors.local/stream/description",
                "max_reconnect_attempts": 5,
                "reconnect_timeout_ms": 600000
            }
        }"#,
    )
    .unwrap();

    let config = StreamConfig::from_json_file(&path).unwrap();
    assert_eq!(config.channel.high_water_mark, 4096);
    assert_eq!(config.channel.idle_poll_ms, 50);
    assert_eq!(config.subscription.max_buffered, 50);
    assert_eq!(config.subscription.live_timeout_ms, Some(30_000));
    assert_eq!(config.client.transport, Transport::WebSocket);
    assert_eq!(config.client.max_reconnect_attempts, Some(5));
    assert_eq!(config.client.reconnect_delay_ms, 1000);
}

#[test]
fn test_missing_file() {
    let dir = TempDir::new().unwrap();
    let result = StreamConfig::from_json_file(dir.path().join("absent.json"));
    assert!(matches!(result, Err(StreamError::Io(_))));
}

#[test]
fn test_invalid_values_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stream.json");

    fs::write(&path, r#"{ "subscription": { "max_buffered": 0 } }"#).unwrap();
    assert!(matches!(
        StreamConfig::from_json_file(&path),
        Err(StreamError::InvalidConfig(_))
    ));

    fs::write(&path, r#"{ "client": { "connect_timeout_ms": 0 } }"#).unwrap();
    assert!(matches!(
        StreamConfig::from_json_file(&path),
        Err(StreamError::InvalidConfig(_))
    ));
}

// --- Stream Description ---

#[test]
fn test_description_file_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("description.json");

    let request = StreamRequest::new(
        WireFormat::Text,
        RecordSchema::new(vec![
            FieldDef::new("depth", FieldType::Decimal),
            FieldDef::new("label", FieldType::Text),
        ]),
    )
    .with_separator(';')
    .with_fields(vec!["label".into()]);

    let description = request.description().unwrap();
    fs::write(&path, description.to_json().unwrap()).unwrap();

    let loaded = StreamDescription::from_json_file(&path).unwrap();
    assert_eq!(loaded, description);
    assert_eq!(loaded.separator, ';');
    assert_eq!(loaded.schema.len(), 1);
    assert_eq!(loaded.schema.fields[0].name, "label");
}
