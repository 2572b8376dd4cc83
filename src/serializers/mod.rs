//! Wire-format serializers riding on the subscription protocol.
//!
//! A [`StreamSerializer`] is the [`Subscriber`](crate::subscriptions::Subscriber)
//! end of a subscription: it pulls one item at a time, encodes it with a
//! [`FormatEncoder`] and writes it to an [`OutputChannel`], pausing whenever
//! the channel reports it is not ready.
//!
//! Three encodings are provided, all sharing the same state machine:
//! - [`JsonEncoder`]: a JSON array of item objects
//! - [`XmlEncoder`]: a namespace-qualified root element with one child per item
//! - [`TextEncoder`]: one delimited line per item
//!
//! With [`Framing::PerItem`] channels the prologue and epilogue are omitted
//! and every item is written as a standalone document.

mod json;
mod serializer;
mod text;
mod xml;

pub use json::JsonEncoder;
pub use serializer::{SerializerState, StreamSerializer};
pub use text::TextEncoder;
pub(crate) use text::{split_line, OBSERVATION_TAG, PROCEDURE_TAG};
pub use xml::XmlEncoder;

pub(crate) use xml::{RECORD_ELEMENT, ROOT_ELEMENT, VALUE_ELEMENT};

use crate::channel::{Framing, OutputChannel};
use crate::error::{Result, StreamError};
use crate::subscriptions::SubscriptionFilter;
use crate::types::{DomainItem, RecordSchema};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Namespace of the XML encoding.
pub const XML_NAMESPACE: &str = "urn:sensorstream:stream:1.0";

/// Encodes items of one wire format.
pub trait FormatEncoder: Send {
    /// MIME type of the encoded stream.
    fn content_type(&self) -> &'static str;

    /// Bytes opening the stream. Empty for per-item framing.
    fn write_prologue(&mut self, out: &mut Vec<u8>) -> Result<()>;

    /// Bytes for one item, including any separator from the previous one.
    fn write_item(&mut self, item: &DomainItem, out: &mut Vec<u8>) -> Result<()>;

    /// Bytes closing the stream. Empty for per-item framing.
    fn write_epilogue(&mut self, out: &mut Vec<u8>) -> Result<()>;
}

/// Supported wire formats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Json,
    Xml,
    Text,
}

impl WireFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            WireFormat::Json => "application/json",
            WireFormat::Xml => "application/xml",
            WireFormat::Text => "text/plain",
        }
    }

    /// Build an encoder for this format.
    pub fn encoder(
        &self,
        framing: Framing,
        schema: &RecordSchema,
        separator: char,
    ) -> Box<dyn FormatEncoder> {
        match self {
            WireFormat::Json => Box::new(JsonEncoder::new(framing, schema)),
            WireFormat::Xml => Box::new(XmlEncoder::new(framing, schema)),
            WireFormat::Text => Box::new(TextEncoder::new(separator)),
        }
    }
}

impl FromStr for WireFormat {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" | "application/json" => Ok(WireFormat::Json),
            "xml" | "application/xml" | "text/xml" => Ok(WireFormat::Xml),
            "text" | "csv" | "text/plain" => Ok(WireFormat::Text),
            other => Err(StreamError::InvalidRequest(format!("unsupported format: {}", other))),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WireFormat::Json => "json",
            WireFormat::Xml => "xml",
            WireFormat::Text => "text",
        };
        f.write_str(name)
    }
}

fn default_separator() -> char {
    ','
}

/// Parameters of one streaming request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub format: WireFormat,

    /// Full structure of the result records in the source.
    pub schema: RecordSchema,

    /// Result fields to include (None = all).
    #[serde(default)]
    pub fields: Option<Vec<String>>,

    /// Items reaching the subscription at all.
    #[serde(default)]
    pub filter: SubscriptionFilter,

    /// Field separator of the text format.
    #[serde(default = "default_separator")]
    pub separator: char,
}

impl StreamRequest {
    pub fn new(format: WireFormat, schema: RecordSchema) -> Self {
        Self {
            format,
            schema,
            fields: None,
            filter: SubscriptionFilter::default(),
            separator: default_separator(),
        }
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_filter(mut self, filter: SubscriptionFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_separator(mut self, separator: char) -> Self {
        self.separator = separator;
        self
    }

    /// Resolve the field selection against the schema.
    pub fn projection(&self) -> Result<Projection> {
        if matches!(self.separator, '\n' | '\r' | '\\') {
            return Err(StreamError::InvalidRequest(format!(
                "invalid separator {:?}",
                self.separator
            )));
        }

        match &self.fields {
            None => Ok(Projection {
                schema: self.schema.clone(),
                indices: None,
            }),
            Some(names) => {
                let (schema, indices) = self.schema.select(names)?;
                Ok(Projection {
                    schema,
                    indices: Some(indices),
                })
            }
        }
    }

    /// Structure of the stream this request produces.
    pub fn description(&self) -> Result<StreamDescription> {
        Ok(StreamDescription {
            format: self.format,
            schema: self.projection()?.schema,
            separator: self.separator,
        })
    }
}

/// Field selection resolved against a schema.
#[derive(Clone, Debug, PartialEq)]
pub struct Projection {
    /// Structure of the projected records.
    pub schema: RecordSchema,
    /// Kept value indices (None = everything).
    indices: Option<Vec<usize>>,
}

impl Projection {
    /// Restrict an item to the selected fields.
    pub fn apply(&self, item: &DomainItem) -> DomainItem {
        let Some(indices) = &self.indices else {
            return item.clone();
        };

        match item {
            DomainItem::Result(record) => DomainItem::Result(record.project(indices)),
            DomainItem::Observation(obs) => {
                let mut obs = obs.clone();
                obs.result
                    .retain(|v| self.schema.field(&v.name).is_some());
                DomainItem::Observation(obs)
            }
            DomainItem::Procedure(_) => item.clone(),
        }
    }
}

/// What a client needs to decode a stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamDescription {
    pub format: WireFormat,
    pub schema: RecordSchema,
    #[serde(default = "default_separator")]
    pub separator: char,
}

impl StreamDescription {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| StreamError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

/// Encode a whole item sequence in one pass, the way a
/// [`StreamSerializer`] would write it to a channel with `framing`.
///
/// Items are filtered and projected per the request. With per-item framing
/// the frames are simply concatenated.
pub fn encode_all<'a, I>(request: &StreamRequest, framing: Framing, items: I) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = &'a DomainItem>,
{
    let projection = request.projection()?;
    let mut encoder = request
        .format
        .encoder(framing, &projection.schema, request.separator);
    let mut out = Vec::new();

    encoder.write_prologue(&mut out)?;
    for item in items.into_iter().filter(|i| request.filter.matches(i)) {
        encoder.write_item(&projection.apply(item), &mut out)?;
    }
    encoder.write_epilogue(&mut out)?;

    Ok(out)
}

/// Write to a channel, skipping empty output so no empty frame is sent.
pub(crate) fn write_nonempty(channel: &dyn OutputChannel, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    channel.write(bytes)
}
