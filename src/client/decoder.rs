//! Incremental record decoding.
//!
//! Bytes arrive in arbitrary pieces (HTTP chunks split anywhere) or as whole
//! items (one per WebSocket frame). The decoder buffers partial input and
//! returns every record completed by each piece.

use crate::channel::Framing;
use crate::error::{Result, StreamError};
use crate::serializers::{
    split_line, StreamDescription, WireFormat, OBSERVATION_TAG, PROCEDURE_TAG, RECORD_ELEMENT,
    ROOT_ELEMENT, VALUE_ELEMENT,
};
use crate::types::{DataValue, RecordSchema, ResultRecord, Timestamp};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::{Map, Value};

/// Brace/string tracking for a JSON array read in pieces.
#[derive(Default)]
struct JsonScan {
    /// Bytes of `buf` already scanned.
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
    started: bool,
    /// Start of the object being read, if any.
    object_start: Option<usize>,
}

/// Decodes result records of one stream connection.
pub struct RecordDecoder {
    format: WireFormat,
    framing: Framing,
    schema: RecordSchema,
    separator: char,
    buf: Vec<u8>,
    json: JsonScan,
    complete: bool,
}

impl RecordDecoder {
    pub fn new(description: &StreamDescription, framing: Framing) -> Self {
        Self {
            format: description.format,
            framing,
            schema: description.schema.clone(),
            separator: description.separator,
            buf: Vec::new(),
            json: JsonScan::default(),
            complete: false,
        }
    }

    /// Decode the records completed by `bytes`.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<ResultRecord>> {
        if self.complete {
            if bytes.iter().all(u8::is_ascii_whitespace) {
                return Ok(Vec::new());
            }
            return Err(StreamError::Decode("data after end of stream".into()));
        }

        if self.framing == Framing::PerItem {
            return Ok(self.decode_item(bytes)?.into_iter().collect());
        }

        self.buf.extend_from_slice(bytes);
        match self.format {
            WireFormat::Json => self.scan_json(),
            WireFormat::Xml => self.scan_xml(),
            WireFormat::Text => self.scan_lines(),
        }
    }

    /// True once the end-of-stream marker of a wrapped format was decoded.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The connection ended cleanly. Returns whether the stream was complete
    /// rather than cut short.
    pub fn finish(&mut self) -> Result<bool> {
        Ok(match (self.framing, self.format) {
            (Framing::PerItem, _) => true,
            (Framing::Wrapped, WireFormat::Text) => self.buf.is_empty(),
            (Framing::Wrapped, _) => self.complete,
        })
    }

    /// One standalone item (per-item framing). Non-record items yield None.
    fn decode_item(&self, bytes: &[u8]) -> Result<Option<ResultRecord>> {
        match self.format {
            WireFormat::Json => self.decode_json_object(bytes),
            WireFormat::Xml => {
                let xml = std::str::from_utf8(bytes)
                    .map_err(|e| StreamError::Decode(format!("invalid UTF-8: {}", e)))?;
                if !xml.trim_start().starts_with(&format!("<{}", RECORD_ELEMENT)) {
                    return Ok(None);
                }
                self.decode_xml_record(xml).map(Some)
            }
            WireFormat::Text => {
                let line = std::str::from_utf8(bytes)
                    .map_err(|e| StreamError::Decode(format!("invalid UTF-8: {}", e)))?;
                self.decode_line(line.trim_end_matches(['\n', '\r']))
            }
        }
    }

    // --- JSON ---

    fn scan_json(&mut self) -> Result<Vec<ResultRecord>> {
        let mut records = Vec::new();
        let mut i = self.json.pos;

        while i < self.buf.len() {
            let b = self.buf[i];
            i += 1;

            if self.json.in_string {
                if self.json.escaped {
                    self.json.escaped = false;
                } else if b == b'\\' {
                    self.json.escaped = true;
                } else if b == b'"' {
                    self.json.in_string = false;
                }
                continue;
            }

            if self.json.depth > 0 {
                match b {
                    b'"' => self.json.in_string = true,
                    b'{' | b'[' => self.json.depth += 1,
                    b'}' | b']' => {
                        self.json.depth -= 1;
                        if self.json.depth == 0 {
                            let start = self.json.object_start.take().unwrap_or(0);
                            if let Some(record) = self.decode_json_object(&self.buf[start..i])? {
                                records.push(record);
                            }
                        }
                    }
                    _ => {}
                }
                continue;
            }

            match b {
                b'[' if !self.json.started => self.json.started = true,
                b'{' if self.json.started => {
                    self.json.depth = 1;
                    self.json.object_start = Some(i - 1);
                }
                b']' if self.json.started => {
                    self.complete = true;
                    break;
                }
                b',' if self.json.started => {}
                b if b.is_ascii_whitespace() => {}
                other => {
                    return Err(StreamError::Decode(format!(
                        "unexpected byte {:?} in JSON stream",
                        other as char
                    )));
                }
            }
        }

        // Keep only the object in progress.
        let keep_from = self.json.object_start.unwrap_or(i);
        self.buf.drain(..keep_from);
        self.json.pos = i - keep_from;
        if self.json.object_start.is_some() {
            self.json.object_start = Some(0);
        }

        Ok(records)
    }

    fn decode_json_object(&self, bytes: &[u8]) -> Result<Option<ResultRecord>> {
        let object: Map<String, Value> = serde_json::from_slice(bytes)
            .map_err(|e| StreamError::Decode(format!("invalid JSON item: {}", e)))?;

        // Observations and procedures are tagged; only records are decoded.
        if object.contains_key("type") {
            return Ok(None);
        }

        let time = object
            .get("time")
            .and_then(Value::as_str)
            .ok_or_else(|| StreamError::Decode("record without time".into()))?;
        let time = Timestamp::parse_iso(time)?;

        let values = self
            .schema
            .fields
            .iter()
            .map(|field| {
                let value = object
                    .get(&field.name)
                    .ok_or_else(|| StreamError::Decode(format!("missing field {}", field.name)))?;
                DataValue::from_json(field.field_type, value)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(ResultRecord::new(time, values)))
    }

    // --- XML ---

    fn scan_xml(&mut self) -> Result<Vec<ResultRecord>> {
        let start_tag = format!("<{}", RECORD_ELEMENT);
        let end_tag = format!("</{}>", RECORD_ELEMENT);
        let root_end = format!("</{}>", ROOT_ELEMENT);

        let mut records = Vec::new();
        let mut cursor = 0;

        loop {
            let rest = &self.buf[cursor..];
            let next_record = find(rest, start_tag.as_bytes());
            let closing = find(rest, root_end.as_bytes());

            if let Some(end) = closing {
                if next_record.map_or(true, |s| end < s) {
                    self.complete = true;
                    cursor = self.buf.len();
                    break;
                }
            }

            let Some(start) = next_record else {
                // Keep a tail that may hold the beginning of a tag.
                let tail = root_end.len().max(start_tag.len());
                cursor = self.buf.len().saturating_sub(tail).max(cursor);
                break;
            };
            let Some(len) = find(&rest[start..], end_tag.as_bytes()) else {
                cursor += start;
                break;
            };

            let element = &rest[start..start + len + end_tag.len()];
            let xml = std::str::from_utf8(element)
                .map_err(|e| StreamError::Decode(format!("invalid UTF-8: {}", e)))?;
            records.push(self.decode_xml_record(xml)?);
            cursor += start + len + end_tag.len();
        }

        self.buf.drain(..cursor);
        Ok(records)
    }

    fn decode_xml_record(&self, xml: &str) -> Result<ResultRecord> {
        let mut reader = Reader::from_str(xml);
        let mut time = None;
        let mut values: Vec<Option<DataValue>> = vec![None; self.schema.len()];
        let mut current: Option<usize> = None;
        let mut text = String::new();

        loop {
            match reader.read_event()? {
                Event::Start(e) if e.name().as_ref() == RECORD_ELEMENT.as_bytes() => {
                    for attr in e.attributes() {
                        let attr = attr?;
                        if attr.key.as_ref() == b"time" {
                            time = Some(Timestamp::parse_iso(&attr.unescape_value()?)?);
                        }
                    }
                }
                Event::Start(e) if e.name().as_ref() == VALUE_ELEMENT.as_bytes() => {
                    let mut index = None;
                    for attr in e.attributes() {
                        let attr = attr?;
                        if attr.key.as_ref() == b"name" {
                            let name = attr.unescape_value()?;
                            index = self.schema.fields.iter().position(|f| f.name == name);
                        }
                    }
                    current = Some(index.ok_or_else(|| {
                        StreamError::Decode("value of unknown field".into())
                    })?);
                    text.clear();
                }
                Event::Text(t) if current.is_some() => text.push_str(&t.unescape()?),
                Event::End(e) if e.name().as_ref() == VALUE_ELEMENT.as_bytes() => {
                    if let Some(index) = current.take() {
                        let field_type = self.schema.fields[index].field_type;
                        values[index] = Some(DataValue::parse_text(field_type, &text)?);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        let time = time.ok_or_else(|| StreamError::Decode("record without time".into()))?;
        let values = values
            .into_iter()
            .zip(&self.schema.fields)
            .map(|(v, field)| {
                v.ok_or_else(|| StreamError::Decode(format!("missing field {}", field.name)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ResultRecord::new(time, values))
    }

    // --- Text ---

    fn scan_lines(&mut self) -> Result<Vec<ResultRecord>> {
        let mut records = Vec::new();
        let mut consumed = 0;

        while let Some(len) = self.buf[consumed..].iter().position(|&b| b == b'\n') {
            let line = std::str::from_utf8(&self.buf[consumed..consumed + len])
                .map_err(|e| StreamError::Decode(format!("invalid UTF-8: {}", e)))?;
            let line = line.trim_end_matches('\r');
            if let Some(record) = self.decode_line(line)? {
                records.push(record);
            }
            consumed += len + 1;
        }

        self.buf.drain(..consumed);
        Ok(records)
    }

    /// One text line. Blank lines and tagged non-record lines yield None.
    fn decode_line(&self, line: &str) -> Result<Option<ResultRecord>> {
        if line.is_empty() {
            return Ok(None);
        }
        let tokens = split_line(line, self.separator);
        if matches!(tokens[0].as_str(), OBSERVATION_TAG | PROCEDURE_TAG) {
            return Ok(None);
        }
        if tokens.len() != self.schema.len() + 1 {
            return Err(StreamError::Decode(format!(
                "expected {} tokens, got {}",
                self.schema.len() + 1,
                tokens.len()
            )));
        }

        let time = Timestamp::parse_iso(&tokens[0])?;
        let values = tokens[1..]
            .iter()
            .zip(&self.schema.fields)
            .map(|(token, field)| DataValue::parse_text(field.field_type, token))
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(ResultRecord::new(time, values)))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
