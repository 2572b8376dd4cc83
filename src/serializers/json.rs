//! JSON encoding.

use crate::channel::Framing;
use crate::error::{Result, StreamError};
use crate::types::{DomainItem, Observation, ProcedureDescription, RecordSchema, ResultRecord};
use serde::Serialize;

use super::FormatEncoder;

/// Tagged view used for non-record items.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ItemView<'a> {
    Observation(&'a Observation),
    Procedure(&'a ProcedureDescription),
}

/// Writes a JSON array of item objects (wrapped) or one object per frame.
///
/// Result records are written as flat objects, sampling time first:
/// `{"time":"2020-03-01T10:00:00.000000Z","temp":21.5}`.
pub struct JsonEncoder {
    framing: Framing,
    field_names: Vec<String>,
    first: bool,
}

impl JsonEncoder {
    pub fn new(framing: Framing, schema: &RecordSchema) -> Self {
        Self {
            framing,
            field_names: schema.fields.iter().map(|f| f.name.clone()).collect(),
            first: true,
        }
    }

    fn write_record(&self, record: &ResultRecord, out: &mut Vec<u8>) -> Result<()> {
        if record.values.len() != self.field_names.len() {
            return Err(StreamError::Serialization(format!(
                "record has {} values, stream has {} fields",
                record.values.len(),
                self.field_names.len()
            )));
        }

        out.extend_from_slice(b"{\"time\":");
        serde_json::to_writer(&mut *out, &record.time.to_iso()).map_err(ser_error)?;
        for (name, value) in self.field_names.iter().zip(&record.values) {
            out.push(b',');
            serde_json::to_writer(&mut *out, name).map_err(ser_error)?;
            out.push(b':');
            serde_json::to_writer(&mut *out, value).map_err(ser_error)?;
        }
        out.push(b'}');
        Ok(())
    }
}

impl FormatEncoder for JsonEncoder {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn write_prologue(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if self.framing == Framing::Wrapped {
            out.push(b'[');
        }
        Ok(())
    }

    fn write_item(&mut self, item: &DomainItem, out: &mut Vec<u8>) -> Result<()> {
        if self.framing == Framing::Wrapped {
            let separator: &[u8] = if self.first { b"\n" } else { b",\n" };
            out.extend_from_slice(separator);
        }
        self.first = false;

        match item {
            DomainItem::Result(record) => self.write_record(record, out),
            DomainItem::Observation(obs) => {
                serde_json::to_writer(&mut *out, &ItemView::Observation(obs)).map_err(ser_error)
            }
            DomainItem::Procedure(procedure) => {
                serde_json::to_writer(&mut *out, &ItemView::Procedure(procedure)).map_err(ser_error)
            }
        }
    }

    fn write_epilogue(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if self.framing == Framing::Wrapped {
            out.extend_from_slice(b"\n]");
        }
        Ok(())
    }
}

fn ser_error(e: serde_json::Error) -> StreamError {
    StreamError::Serialization(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataValue, FieldDef, FieldType, ItemId, NamedValue, Timestamp};

    fn schema() -> RecordSchema {
        RecordSchema::new(vec![
            FieldDef::new("temp", FieldType::Decimal),
            FieldDef::new("status", FieldType::Text),
        ])
    }

    fn record(secs: i64, temp: f64) -> DomainItem {
        ResultRecord::new(
            Timestamp::from_secs(secs),
            vec![DataValue::Decimal(temp), DataValue::Text("ok".into())],
        )
        .into()
    }

    fn encode(framing: Framing, items: &[DomainItem]) -> String {
        let mut encoder = JsonEncoder::new(framing, &schema());
        let mut out = Vec::new();
        encoder.write_prologue(&mut out).unwrap();
        for item in items {
            encoder.write_item(item, &mut out).unwrap();
        }
        encoder.write_epilogue(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_wrapped_array() {
        let json = encode(Framing::Wrapped, &[record(0, 1.5), record(1, -2.0)]);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        let array = parsed.as_array().unwrap();

        assert_eq!(array.len(), 2);
        assert_eq!(array[0]["time"], "1970-01-01T00:00:00.000000Z");
        assert_eq!(array[0]["temp"], 1.5);
        assert_eq!(array[1]["status"], "ok");
    }

    #[test]
    fn test_empty_array() {
        let json = encode(Framing::Wrapped, &[]);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed.as_array().unwrap().is_empty());
    }

    #[test]
    fn test_per_item_has_no_wrapper() {
        let json = encode(Framing::PerItem, &[record(0, 1.0)]);
        assert!(json.starts_with('{'));
        assert!(json.ends_with('}'));
    }

    #[test]
    fn test_record_not_matching_schema() {
        let mut encoder = JsonEncoder::new(Framing::PerItem, &schema());
        let short: DomainItem = ResultRecord::new(Timestamp(0), vec![]).into();
        assert!(encoder.write_item(&short, &mut Vec::new()).is_err());
    }

    #[test]
    fn test_observation_is_tagged() {
        let obs = Observation {
            id: ItemId(7),
            procedure: "urn:sensor:1".into(),
            feature_of_interest: None,
            observed_property: "temperature".into(),
            phenomenon_time: Timestamp(0),
            result_time: Timestamp(0),
            result: vec![NamedValue::new("temp", DataValue::Decimal(20.0))],
        };
        let json = encode(Framing::PerItem, &[obs.into()]);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["type"], "observation");
        assert_eq!(parsed["observedProperty"], "temperature");
        assert_eq!(parsed["result"][0]["value"], 20.0);
    }
}
