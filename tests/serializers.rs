//! Serializer pipeline tests through the public API: readiness gating and
//! agreement between the wire formats.

use parking_lot::Mutex;
use quick_xml::events::Event;
use quick_xml::Reader;
use sensorstream::{
    encode_all, DataValue, DomainItem, FieldDef, FieldType, Framing, ItemId, NamedValue,
    Observation, OutputChannel, ReadyCallback, RecordDecoder, RecordSchema, Result, ResultRecord,
    SerializerState, StreamError, StreamRequest, StreamSerializer, Subscription, Timestamp,
    WireFormat,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// In-memory channel drained explicitly by the test, one tick at a time.
struct TickChannel {
    framing: Framing,
    out: Mutex<Vec<u8>>,
    writes: AtomicUsize,
    pending: AtomicUsize,
    max_pending: AtomicUsize,
    high_water_mark: usize,
    callback: Mutex<Option<ReadyCallback>>,
    closed: AtomicBool,
}

impl TickChannel {
    fn new(framing: Framing, high_water_mark: usize) -> Arc<Self> {
        Arc::new(Self {
            framing,
            out: Mutex::new(Vec::new()),
            writes: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            max_pending: AtomicUsize::new(0),
            high_water_mark,
            callback: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn tick(&self) {
        self.pending.store(0, Ordering::SeqCst);
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn bytes(&self) -> Vec<u8> {
        self.out.lock().clone()
    }
}

impl OutputChannel for TickChannel {
    fn framing(&self) -> Framing {
        self.framing
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(StreamError::ChannelClosed);
        }
        if !self.is_ready() {
            return Err(StreamError::ProtocolViolation("write while not ready".into()));
        }
        self.out.lock().extend_from_slice(bytes);
        self.writes.fetch_add(1, Ordering::SeqCst);
        let pending = self.pending.fetch_add(bytes.len(), Ordering::SeqCst) + bytes.len();
        self.max_pending.fetch_max(pending, Ordering::SeqCst);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.pending.load(Ordering::SeqCst) < self.high_water_mark
    }

    fn on_ready_again(&self, callback: ReadyCallback) {
        if self.is_ready() || self.is_closed() {
            callback();
        } else {
            *self.callback.lock() = Some(callback);
        }
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn bytes_written(&self) -> u64 {
        self.out.lock().len() as u64
    }
}

fn schema() -> RecordSchema {
    RecordSchema::new(vec![
        FieldDef::new("temperature", FieldType::Decimal),
        FieldDef::new("status", FieldType::Text),
        FieldDef::new("valid", FieldType::Boolean),
    ])
}

fn ten_records() -> Vec<ResultRecord> {
    (0..10)
        .map(|i| {
            ResultRecord::new(
                Timestamp::from_secs(1_700_000_000 + i * 60),
                vec![
                    DataValue::Decimal(18.5 + i as f64 * 0.125),
                    DataValue::Text(match i % 3 {
                        0 => "ok".to_string(),
                        1 => "drift, \"minor\"".to_string(),
                        _ => "<recalibrate> & retry".to_string(),
                    }),
                    DataValue::Boolean(i % 2 == 0),
                ],
            )
        })
        .collect()
}

fn items() -> Vec<DomainItem> {
    ten_records().into_iter().map(Into::into).collect()
}

fn push_all(subscription: &Subscription<DomainItem>, items: &[DomainItem]) {
    for (i, item) in items.iter().enumerate() {
        subscription.push(item.clone(), i == items.len() - 1);
    }
}

// --- Readiness Gating ---

#[test]
fn test_writes_stop_at_high_water_mark_until_tick() {
    for format in [WireFormat::Json, WireFormat::Xml, WireFormat::Text] {
        let request = StreamRequest::new(format, schema());
        let channel = TickChannel::new(Framing::Wrapped, 64);
        let serializer = StreamSerializer::new();
        serializer.init(channel.clone(), &request).unwrap();
        let subscription = Subscription::subscribe(serializer.clone());

        // The producer outruns the channel: everything is pushed up front.
        let items = items();
        push_all(&subscription, &items);
        assert_eq!(serializer.state(), SerializerState::AwaitingCapacity, "{}", format);

        let mut ticks = 0;
        while !serializer.is_done() {
            // Paused only because the mark was reached.
            assert!(!channel.is_ready(), "{}", format);
            let written = channel.bytes_written();
            channel.tick();
            assert!(serializer.is_done() || channel.bytes_written() > written);
            ticks += 1;
            assert!(ticks < 1000, "{} never finished", format);
        }

        assert!(ticks > 1, "{}", format);
        assert!(serializer.error().is_none(), "{}", format);
        assert!(channel.is_closed());
        assert_eq!(subscription.delivered(), 10);

        // One write may cross the mark, never more.
        let largest_item = items
            .iter()
            .map(|item| encode_all(&request, Framing::PerItem, [item]).unwrap().len())
            .max()
            .unwrap();
        let separator = 2;
        assert!(channel.max_pending.load(Ordering::SeqCst) < 64 + largest_item + separator);

        let reference = encode_all(&request, Framing::Wrapped, &items).unwrap();
        assert_eq!(channel.bytes_written(), reference.len() as u64, "{}", format);
        assert_eq!(channel.bytes(), reference, "{}", format);
    }
}

#[test]
fn test_no_pause_with_large_mark() {
    let request = StreamRequest::new(WireFormat::Json, schema());
    let channel = TickChannel::new(Framing::Wrapped, 1 << 20);
    let serializer = StreamSerializer::new();
    serializer.init(channel.clone(), &request).unwrap();
    let subscription = Subscription::subscribe(serializer.clone());

    push_all(&subscription, &items());

    assert_eq!(serializer.state(), SerializerState::Done);
    assert_eq!(channel.bytes(), encode_all(&request, Framing::Wrapped, &items()).unwrap());
}

// --- Multi-format Equivalence ---

fn stream(format: WireFormat, framing: Framing) -> (StreamRequest, Vec<u8>) {
    let request = StreamRequest::new(format, schema());
    let channel = TickChannel::new(framing, usize::MAX);
    let serializer = StreamSerializer::new();
    serializer.init(channel.clone(), &request).unwrap();
    let subscription = Subscription::subscribe(serializer.clone());
    push_all(&subscription, &items());
    assert!(serializer.is_done());
    (request, channel.bytes())
}

fn decode(request: &StreamRequest, framing: Framing, bytes: &[u8]) -> Vec<ResultRecord> {
    let mut decoder = RecordDecoder::new(&request.description().unwrap(), framing);
    let records = decoder.feed(bytes).unwrap();
    assert!(decoder.finish().unwrap());
    records
}

#[test]
fn test_json_stream_is_valid_and_decodes() {
    let (request, bytes) = stream(WireFormat::Json, Framing::Wrapped);

    let document: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let array = document.as_array().unwrap();
    assert_eq!(array.len(), 10);
    assert_eq!(array[1]["status"], "drift, \"minor\"");

    assert_eq!(decode(&request, Framing::Wrapped, &bytes), ten_records());
}

#[test]
fn test_xml_stream_is_well_formed_and_decodes() {
    let (request, bytes) = stream(WireFormat::Xml, Framing::Wrapped);

    let text = String::from_utf8(bytes.clone()).unwrap();
    let mut reader = Reader::from_str(&text);
    let mut depth = 0i32;
    let mut records = 0;
    loop {
        match reader.read_event().unwrap() {
            Event::Start(e) => {
                if e.name().as_ref() == b"ss:ResultRecord" {
                    records += 1;
                }
                depth += 1;
            }
            Event::End(_) => depth -= 1,
            Event::Eof => break,
            _ => {}
        }
    }
    assert_eq!(depth, 0);
    assert_eq!(records, 10);

    assert_eq!(decode(&request, Framing::Wrapped, &bytes), ten_records());
}

#[test]
fn test_text_stream_has_one_line_per_record_and_decodes() {
    let (request, bytes) = stream(WireFormat::Text, Framing::Wrapped);

    let text = String::from_utf8(bytes.clone()).unwrap();
    assert_eq!(text.lines().count(), 10);

    assert_eq!(decode(&request, Framing::Wrapped, &bytes), ten_records());
}

#[test]
fn test_per_item_framing_writes_standalone_items() {
    for format in [WireFormat::Json, WireFormat::Xml, WireFormat::Text] {
        let request = StreamRequest::new(format, schema());
        let channel = TickChannel::new(Framing::PerItem, usize::MAX);
        let serializer = StreamSerializer::new();
        serializer.init(channel.clone(), &request).unwrap();
        let subscription = Subscription::subscribe(serializer.clone());
        push_all(&subscription, &items());

        assert!(serializer.is_done());
        assert_eq!(channel.writes.load(Ordering::SeqCst), 10, "{}", format);
    }
}

// --- Mixed Items ---

#[test]
fn test_field_selection_applies_to_all_formats() {
    let observation: DomainItem = Observation {
        id: ItemId(7),
        procedure: "urn:sensor:1".to_string(),
        feature_of_interest: None,
        observed_property: "urn:property:air".to_string(),
        phenomenon_time: Timestamp::from_secs(1_700_000_000),
        result_time: Timestamp::from_secs(1_700_000_000),
        result: vec![
            NamedValue::new("temperature", DataValue::Decimal(21.0)),
            NamedValue::new("status", DataValue::Text("ok".into())),
        ],
    }
    .into();

    for format in [WireFormat::Json, WireFormat::Xml] {
        let request = StreamRequest::new(format, schema()).with_fields(vec!["status".into()]);
        let bytes = encode_all(&request, Framing::Wrapped, [&observation]).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("status"), "{}", format);
        assert!(!text.contains("temperature"), "{}", format);
    }
}

#[test]
fn test_unknown_field_rejected_at_init() {
    let request = StreamRequest::new(WireFormat::Json, schema()).with_fields(vec!["humidity".into()]);
    let serializer = StreamSerializer::new();
    let channel = TickChannel::new(Framing::Wrapped, 64);
    assert!(matches!(
        serializer.init(channel, &request),
        Err(StreamError::InvalidRequest(_))
    ));
}
