//! Core types for the streaming pipeline.

use crate::error::{Result, StreamError};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier for an observation or a procedure description.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(pub u64);

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemId({})", self.0)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Timestamp(micros)
    }

    /// Saturates at the representable range.
    pub fn from_secs(secs: i64) -> Self {
        Timestamp(secs.saturating_mul(1_000_000))
    }

    /// ISO 8601 UTC representation with microsecond precision.
    pub fn to_iso(&self) -> String {
        match DateTime::<Utc>::from_timestamp_micros(self.0) {
            Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Micros, true),
            None => self.0.to_string(),
        }
    }

    /// Parse an ISO 8601 / RFC 3339 timestamp.
    pub fn parse_iso(s: &str) -> Result<Self> {
        let dt = DateTime::parse_from_rfc3339(s.trim())
            .map_err(|e| StreamError::Decode(format!("invalid time '{}': {}", s, e)))?;
        Ok(Timestamp(dt.timestamp_micros()))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso())
    }
}

/// Half-open time interval `[begin, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub begin: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    pub fn new(begin: Timestamp, end: Timestamp) -> Self {
        Self { begin, end }
    }

    pub fn contains(&self, t: Timestamp) -> bool {
        t >= self.begin && t < self.end
    }
}

/// Type of a result field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Boolean,
    Integer,
    Decimal,
    Text,
}

/// A single value inside a result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataValue {
    Boolean(bool),
    Integer(i64),
    Decimal(f64),
    Text(String),
}

impl DataValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            DataValue::Boolean(_) => FieldType::Boolean,
            DataValue::Integer(_) => FieldType::Integer,
            DataValue::Decimal(_) => FieldType::Decimal,
            DataValue::Text(_) => FieldType::Text,
        }
    }

    /// Plain text form, used by the delimited text and XML encodings.
    pub fn to_text(&self) -> String {
        match self {
            DataValue::Boolean(b) => b.to_string(),
            DataValue::Integer(i) => i.to_string(),
            DataValue::Decimal(d) => d.to_string(),
            DataValue::Text(s) => s.clone(),
        }
    }

    /// Parse the plain text form according to a field type.
    pub fn parse_text(field_type: FieldType, s: &str) -> Result<Self> {
        Ok(match field_type {
            FieldType::Boolean => DataValue::Boolean(s.trim().parse().map_err(|e| bad_text(field_type, s, e))?),
            FieldType::Integer => DataValue::Integer(s.trim().parse().map_err(|e| bad_text(field_type, s, e))?),
            FieldType::Decimal => DataValue::Decimal(s.trim().parse().map_err(|e| bad_text(field_type, s, e))?),
            FieldType::Text => DataValue::Text(s.to_string()),
        })
    }

    /// Convert a decoded JSON value according to a field type.
    pub fn from_json(field_type: FieldType, value: &serde_json::Value) -> Result<Self> {
        let mismatch = || StreamError::Decode(format!("expected {:?}, got {}", field_type, value));
        Ok(match field_type {
            FieldType::Boolean => DataValue::Boolean(value.as_bool().ok_or_else(mismatch)?),
            FieldType::Integer => DataValue::Integer(value.as_i64().ok_or_else(mismatch)?),
            FieldType::Decimal => match value {
                serde_json::Value::Null => DataValue::Decimal(f64::NAN),
                v => DataValue::Decimal(v.as_f64().ok_or_else(mismatch)?),
            },
            FieldType::Text => DataValue::Text(value.as_str().ok_or_else(mismatch)?.to_string()),
        })
    }
}

fn bad_text(field_type: FieldType, s: &str, e: impl fmt::Display) -> StreamError {
    StreamError::Decode(format!("invalid {:?} '{}': {}", field_type, s, e))
}

/// Describes one field of a result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Structure of the results carried by a stream. The sampling time is
/// implicit and always comes first; `fields` describes the values after it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSchema {
    pub fields: Vec<FieldDef>,
}

impl RecordSchema {
    pub fn new(fields: Vec<FieldDef>) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Restrict the schema to the named fields, keeping schema order.
    ///
    /// Returns the projected schema and the indices of the kept fields.
    pub fn select(&self, names: &[String]) -> Result<(RecordSchema, Vec<usize>)> {
        if let Some(unknown) = names.iter().find(|n| self.field(n).is_none()) {
            return Err(StreamError::InvalidRequest(format!("unknown field: {}", unknown)));
        }

        let indices: Vec<usize> = self
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| names.contains(&f.name))
            .map(|(i, _)| i)
            .collect();
        let fields = indices.iter().map(|&i| self.fields[i].clone()).collect();

        Ok((RecordSchema { fields }, indices))
    }
}

/// One sampled result of a data stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub time: Timestamp,
    pub values: Vec<DataValue>,
}

impl ResultRecord {
    pub fn new(time: Timestamp, values: Vec<DataValue>) -> Self {
        Self { time, values }
    }

    /// Keep only the values at the given indices.
    pub fn project(&self, indices: &[usize]) -> ResultRecord {
        ResultRecord {
            time: self.time,
            values: indices
                .iter()
                .filter_map(|&i| self.values.get(i).cloned())
                .collect(),
        }
    }

    /// Check the values against a schema.
    pub fn check(&self, schema: &RecordSchema) -> Result<()> {
        if self.values.len() != schema.len() {
            return Err(StreamError::InvalidRequest(format!(
                "record has {} values, schema has {} fields",
                self.values.len(),
                schema.len()
            )));
        }
        for (value, field) in self.values.iter().zip(&schema.fields) {
            if value.field_type() != field.field_type {
                return Err(StreamError::InvalidRequest(format!(
                    "field {} expects {:?}, got {:?}",
                    field.name,
                    field.field_type,
                    value.field_type()
                )));
            }
        }
        Ok(())
    }
}

/// A named observed value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedValue {
    pub name: String,
    pub value: DataValue,
}

impl NamedValue {
    pub fn new(name: impl Into<String>, value: DataValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// An observation made by a procedure on a feature of interest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub id: ItemId,
    pub procedure: String,
    pub feature_of_interest: Option<String>,
    pub observed_property: String,
    pub phenomenon_time: Timestamp,
    pub result_time: Timestamp,
    pub result: Vec<NamedValue>,
}

/// Description of a sensor or process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureDescription {
    pub id: ItemId,
    pub uid: String,
    pub name: String,
    pub description: Option<String>,
    pub valid_time: Timestamp,
}

/// Kind of a domain item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Observation,
    Procedure,
    Result,
}

/// Anything that flows through the pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum DomainItem {
    Observation(Observation),
    Procedure(ProcedureDescription),
    Result(ResultRecord),
}

impl DomainItem {
    pub fn kind(&self) -> ItemKind {
        match self {
            DomainItem::Observation(_) => ItemKind::Observation,
            DomainItem::Procedure(_) => ItemKind::Procedure,
            DomainItem::Result(_) => ItemKind::Result,
        }
    }

    /// Time used for ordering and time filters.
    pub fn timestamp(&self) -> Timestamp {
        match self {
            DomainItem::Observation(o) => o.phenomenon_time,
            DomainItem::Procedure(p) => p.valid_time,
            DomainItem::Result(r) => r.time,
        }
    }

    /// Procedure the item belongs to, if it names one.
    pub fn procedure(&self) -> Option<&str> {
        match self {
            DomainItem::Observation(o) => Some(&o.procedure),
            DomainItem::Procedure(p) => Some(&p.uid),
            DomainItem::Result(_) => None,
        }
    }
}

impl From<Observation> for DomainItem {
    fn from(o: Observation) -> Self {
        DomainItem::Observation(o)
    }
}

impl From<ProcedureDescription> for DomainItem {
    fn from(p: ProcedureDescription) -> Self {
        DomainItem::Procedure(p)
    }
}

impl From<ResultRecord> for DomainItem {
    fn from(r: ResultRecord) -> Self {
        DomainItem::Result(r)
    }
}
