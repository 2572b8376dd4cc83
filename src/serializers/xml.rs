//! XML encoding.

use crate::channel::Framing;
use crate::error::{Result, StreamError};
use crate::types::{DataValue, DomainItem, Observation, ProcedureDescription, RecordSchema, ResultRecord};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use super::{FormatEncoder, XML_NAMESPACE};

/// Root element of a wrapped stream.
pub(crate) const ROOT_ELEMENT: &str = "ss:DataStream";
pub(crate) const RECORD_ELEMENT: &str = "ss:ResultRecord";
pub(crate) const VALUE_ELEMENT: &str = "ss:value";
const OBSERVATION_ELEMENT: &str = "ss:Observation";
const PROCEDURE_ELEMENT: &str = "ss:Procedure";

/// Writes items as namespace-qualified elements.
///
/// ```text
/// <ss:DataStream xmlns:ss="urn:sensorstream:stream:1.0">
/// <ss:ResultRecord time="2020-03-01T10:00:00.000000Z"><ss:value name="temp">21.5</ss:value></ss:ResultRecord>
/// </ss:DataStream>
/// ```
///
/// With per-item framing each element carries its own namespace declaration.
pub struct XmlEncoder {
    framing: Framing,
    field_names: Vec<String>,
}

impl XmlEncoder {
    pub fn new(framing: Framing, schema: &RecordSchema) -> Self {
        Self {
            framing,
            field_names: schema.fields.iter().map(|f| f.name.clone()).collect(),
        }
    }

    fn start<'a>(&self, name: &'a str) -> BytesStart<'a> {
        let mut start = BytesStart::new(name);
        if self.framing == Framing::PerItem {
            start.push_attribute(("xmlns:ss", XML_NAMESPACE));
        }
        start
    }

    fn write_record(&self, writer: &mut Writer<&mut Vec<u8>>, record: &ResultRecord) -> Result<()> {
        if record.values.len() != self.field_names.len() {
            return Err(StreamError::Serialization(format!(
                "record has {} values, stream has {} fields",
                record.values.len(),
                self.field_names.len()
            )));
        }

        let mut start = self.start(RECORD_ELEMENT);
        start.push_attribute(("time", record.time.to_iso().as_str()));
        writer.write_event(Event::Start(start))?;
        for (name, value) in self.field_names.iter().zip(&record.values) {
            write_value(writer, name, value, false)?;
        }
        writer.write_event(Event::End(BytesEnd::new(RECORD_ELEMENT)))?;
        Ok(())
    }

    fn write_observation(&self, writer: &mut Writer<&mut Vec<u8>>, obs: &Observation) -> Result<()> {
        let mut start = self.start(OBSERVATION_ELEMENT);
        start.push_attribute(("id", obs.id.to_string().as_str()));
        start.push_attribute(("procedure", obs.procedure.as_str()));
        if let Some(foi) = &obs.feature_of_interest {
            start.push_attribute(("featureOfInterest", foi.as_str()));
        }
        start.push_attribute(("observedProperty", obs.observed_property.as_str()));
        start.push_attribute(("phenomenonTime", obs.phenomenon_time.to_iso().as_str()));
        start.push_attribute(("resultTime", obs.result_time.to_iso().as_str()));

        writer.write_event(Event::Start(start))?;
        for v in &obs.result {
            write_value(writer, &v.name, &v.value, true)?;
        }
        writer.write_event(Event::End(BytesEnd::new(OBSERVATION_ELEMENT)))?;
        Ok(())
    }

    fn write_procedure(
        &self,
        writer: &mut Writer<&mut Vec<u8>>,
        procedure: &ProcedureDescription,
    ) -> Result<()> {
        let mut start = self.start(PROCEDURE_ELEMENT);
        start.push_attribute(("id", procedure.id.to_string().as_str()));
        start.push_attribute(("uid", procedure.uid.as_str()));
        start.push_attribute(("validTime", procedure.valid_time.to_iso().as_str()));

        writer.write_event(Event::Start(start))?;
        write_text_element(writer, "ss:name", &procedure.name)?;
        if let Some(description) = &procedure.description {
            write_text_element(writer, "ss:description", description)?;
        }
        writer.write_event(Event::End(BytesEnd::new(PROCEDURE_ELEMENT)))?;
        Ok(())
    }
}

fn write_value(
    writer: &mut Writer<&mut Vec<u8>>,
    name: &str,
    value: &DataValue,
    typed: bool,
) -> Result<()> {
    let mut start = BytesStart::new(VALUE_ELEMENT);
    start.push_attribute(("name", name));
    if typed {
        let type_name = match value {
            DataValue::Boolean(_) => "boolean",
            DataValue::Integer(_) => "integer",
            DataValue::Decimal(_) => "decimal",
            DataValue::Text(_) => "text",
        };
        start.push_attribute(("type", type_name));
    }

    writer.write_event(Event::Start(start))?;
    writer.write_event(Event::Text(BytesText::new(&value.to_text())))?;
    writer.write_event(Event::End(BytesEnd::new(VALUE_ELEMENT)))?;
    Ok(())
}

fn write_text_element(writer: &mut Writer<&mut Vec<u8>>, name: &str, text: &str) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

impl FormatEncoder for XmlEncoder {
    fn content_type(&self) -> &'static str {
        "application/xml"
    }

    fn write_prologue(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if self.framing == Framing::PerItem {
            return Ok(());
        }

        let mut writer = Writer::new(out);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        writer.get_mut().push(b'\n');

        let mut root = BytesStart::new(ROOT_ELEMENT);
        root.push_attribute(("xmlns:ss", XML_NAMESPACE));
        writer.write_event(Event::Start(root))?;
        Ok(())
    }

    fn write_item(&mut self, item: &DomainItem, out: &mut Vec<u8>) -> Result<()> {
        if self.framing == Framing::Wrapped {
            out.push(b'\n');
        }

        let mut writer = Writer::new(out);
        match item {
            DomainItem::Result(record) => self.write_record(&mut writer, record),
            DomainItem::Observation(obs) => self.write_observation(&mut writer, obs),
            DomainItem::Procedure(procedure) => self.write_procedure(&mut writer, procedure),
        }
    }

    fn write_epilogue(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if self.framing == Framing::PerItem {
            return Ok(());
        }

        out.push(b'\n');
        let mut writer = Writer::new(out);
        writer.write_event(Event::End(BytesEnd::new(ROOT_ELEMENT)))?;
        writer.get_mut().push(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldDef, FieldType, ItemId, Timestamp};

    fn schema() -> RecordSchema {
        RecordSchema::new(vec![
            FieldDef::new("temp", FieldType::Decimal),
            FieldDef::new("note", FieldType::Text),
        ])
    }

    fn encode(framing: Framing, items: &[DomainItem]) -> String {
        let mut encoder = XmlEncoder::new(framing, &schema());
        let mut out = Vec::new();
        encoder.write_prologue(&mut out).unwrap();
        for item in items {
            encoder.write_item(item, &mut out).unwrap();
        }
        encoder.write_epilogue(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    fn record(note: &str) -> DomainItem {
        ResultRecord::new(
            Timestamp(0),
            vec![DataValue::Decimal(21.5), DataValue::Text(note.into())],
        )
        .into()
    }

    #[test]
    fn test_wrapped_document() {
        let xml = encode(Framing::Wrapped, &[record("a")]);

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<ss:DataStream xmlns:ss=\"urn:sensorstream:stream:1.0\">"));
        assert!(xml.contains(
            "<ss:ResultRecord time=\"1970-01-01T00:00:00.000000Z\"><ss:value name=\"temp\">21.5</ss:value>"
        ));
        assert!(xml.trim_end().ends_with("</ss:DataStream>"));
    }

    #[test]
    fn test_text_is_escaped() {
        let xml = encode(Framing::PerItem, &[record("<a & b>")]);
        assert!(xml.contains("&lt;a &amp; b&gt;"));
        assert!(xml.contains("xmlns:ss="));
    }

    #[test]
    fn test_document_is_well_formed() {
        let procedure = ProcedureDescription {
            id: ItemId(3),
            uid: "urn:sensor:1".into(),
            name: "Thermometer".into(),
            description: Some("roof".into()),
            valid_time: Timestamp(0),
        };
        let xml = encode(Framing::Wrapped, &[record("a"), procedure.into(), record("b")]);

        let mut reader = quick_xml::Reader::from_str(&xml);
        let mut depth = 0i32;
        loop {
            match reader.read_event().unwrap() {
                Event::Start(_) => depth += 1,
                Event::End(_) => depth -= 1,
                Event::Eof => break,
                _ => {}
            }
        }
        assert_eq!(depth, 0);
    }
}
