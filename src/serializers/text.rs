//! Delimited text encoding.

use crate::error::Result;
use crate::types::{DataValue, DomainItem};

use super::FormatEncoder;

pub(crate) const OBSERVATION_TAG: &str = "observation";
pub(crate) const PROCEDURE_TAG: &str = "procedure";

/// Writes one line per item: the item time followed by its values, joined
/// by the separator. Occurrences of the separator, a line break or a
/// backslash inside a value are escaped with a backslash.
///
/// Observation and procedure lines lead with their kind tag (`observation`,
/// `procedure`), so readers can tell them from result records, whose first
/// token is always a time.
///
/// Lines are self-delimiting, so the encoding needs no prologue or epilogue
/// under either framing.
pub struct TextEncoder {
    separator: char,
}

impl TextEncoder {
    pub fn new(separator: char) -> Self {
        Self { separator }
    }

    fn push_token(&self, line: &mut String, token: &str) {
        for c in token.chars() {
            match c {
                '\\' => line.push_str("\\\\"),
                '\n' => line.push_str("\\n"),
                '\r' => line.push_str("\\r"),
                c if c == self.separator => {
                    line.push('\\');
                    line.push(c);
                }
                c => line.push(c),
            }
        }
    }

    fn push_values<'a>(&self, line: &mut String, values: impl Iterator<Item = &'a DataValue>) {
        for value in values {
            line.push(self.separator);
            self.push_token(line, &value.to_text());
        }
    }
}

impl FormatEncoder for TextEncoder {
    fn content_type(&self) -> &'static str {
        "text/plain"
    }

    fn write_prologue(&mut self, _out: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn write_item(&mut self, item: &DomainItem, out: &mut Vec<u8>) -> Result<()> {
        let mut line = match item {
            DomainItem::Observation(_) => format!("{}{}", OBSERVATION_TAG, self.separator),
            DomainItem::Procedure(_) => format!("{}{}", PROCEDURE_TAG, self.separator),
            DomainItem::Result(_) => String::new(),
        };
        line.push_str(&item.timestamp().to_iso());

        match item {
            DomainItem::Result(record) => self.push_values(&mut line, record.values.iter()),
            DomainItem::Observation(obs) => {
                line.push(self.separator);
                self.push_token(&mut line, &obs.procedure);
                line.push(self.separator);
                self.push_token(&mut line, &obs.observed_property);
                self.push_values(&mut line, obs.result.iter().map(|v| &v.value));
            }
            DomainItem::Procedure(procedure) => {
                line.push(self.separator);
                self.push_token(&mut line, &procedure.uid);
                line.push(self.separator);
                self.push_token(&mut line, &procedure.name);
            }
        }

        line.push('\n');
        out.extend_from_slice(line.as_bytes());
        Ok(())
    }

    fn write_epilogue(&mut self, _out: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }
}

/// Split one encoded line (without its line break) into unescaped tokens.
pub(crate) fn split_line(line: &str, separator: char) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some('n') => current.push('\n'),
                Some('r') => current.push('\r'),
                Some(escaped) => current.push(escaped),
                None => current.push('\\'),
            },
            c if c == separator => tokens.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    tokens.push(current);
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ItemId, ProcedureDescription, ResultRecord, Timestamp};

    fn encode(separator: char, values: Vec<DataValue>) -> String {
        let mut encoder = TextEncoder::new(separator);
        let mut out = Vec::new();
        let item: DomainItem = ResultRecord::new(Timestamp::from_secs(60), values).into();
        encoder.write_item(&item, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_record_line() {
        let line = encode(
            ',',
            vec![DataValue::Decimal(1.25), DataValue::Integer(-3), DataValue::Boolean(false)],
        );
        assert_eq!(line, "1970-01-01T00:01:00.000000Z,1.25,-3,false\n");
    }

    #[test]
    fn test_non_record_lines_are_tagged() {
        let mut encoder = TextEncoder::new(',');
        let mut out = Vec::new();
        let procedure = DomainItem::Procedure(ProcedureDescription {
            id: ItemId(1),
            uid: "urn:sensor:1".into(),
            name: "weather, roof".into(),
            description: None,
            valid_time: Timestamp::from_secs(0),
        });
        encoder.write_item(&procedure, &mut out).unwrap();

        let line = String::from_utf8(out).unwrap();
        let tokens = split_line(line.trim_end_matches('\n'), ',');
        assert_eq!(tokens[0], PROCEDURE_TAG);
        assert_eq!(tokens[2], "urn:sensor:1");
        assert_eq!(tokens[3], "weather, roof");
    }

    #[test]
    fn test_escaping_roundtrip() {
        let text = "a;b\\c\nd";
        let line = encode(';', vec![DataValue::Text(text.into())]);
        assert_eq!(line.matches('\n').count(), 1);

        let tokens = split_line(line.trim_end_matches('\n'), ';');
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[1], text);
    }

    #[test]
    fn test_empty_value_kept() {
        let line = encode(',', vec![DataValue::Text(String::new()), DataValue::Integer(1)]);
        let tokens = split_line(line.trim_end_matches('\n'), ',');
        assert_eq!(tokens, vec!["1970-01-01T00:01:00.000000Z", "", "1"]);
    }
}
