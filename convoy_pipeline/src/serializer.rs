//! Event serialization.
//!
//! A channel turns every event into one record of its blob's format. JSON
//! records are either the whole event or the configured columns; CSV records
//! always follow the columns. Records larger than the field limit are
//! truncated unless truncation is disabled.

use bytes::Bytes;
use serde_json::{Map, Value};
use tracing::warn;

use crate::{
    Event,
    config::{ColumnOptions, EventFormat, SerializerOptions},
};

pub trait Serializer: Send + Sync {
    /// Serialize the event, or `None` if it has nothing to write.
    fn serialize(&self, event: &Event) -> Option<Bytes>;
}

pub fn serializer_for(format: EventFormat, options: SerializerOptions) -> Box<dyn Serializer> {
    match format {
        EventFormat::Json => Box::new(JsonSerializer::new(options)),
        EventFormat::Csv => Box::new(CsvSerializer::new(options)),
    }
}

pub struct JsonSerializer {
    options: SerializerOptions,
}

impl JsonSerializer {
    pub fn new(options: SerializerOptions) -> Self {
        Self { options }
    }

    fn record(&self, event: &Event) -> Option<String> {
        let record = if self.options.columns.is_empty() {
            event.clone()
        } else {
            let mut record = Map::new();
            for column in &self.options.columns {
                if let Some(value) = column_value(&self.options, event, column) {
                    record.insert(column.name.clone(), value.clone());
                }
            }
            record
        };

        if record.is_empty() {
            return None;
        }

        let json = Value::Object(record);
        let serialized = json.to_string();
        if serialized.len() < self.options.max_field_bytes || self.options.disable_truncation {
            return Some(serialized);
        }

        let Value::Object(mut record) = json else {
            return Some(serialized);
        };
        for (name, value) in record.iter_mut() {
            truncate_value(name, value, self.options.max_field_bytes);
        }
        Some(Value::Object(record).to_string())
    }

    fn serialized_field(&self, value: &Value) -> Option<String> {
        match value {
            Value::String(record) => Some(record.clone()),
            Value::Object(object) => self.record(object),
            Value::Array(values) if !self.options.columns.is_empty() => {
                let object = self
                    .options
                    .columns
                    .iter()
                    .zip(values)
                    .map(|(column, value)| (column.name.clone(), value.clone()))
                    .collect();
                self.record(&object)
            }
            _ => None,
        }
    }
}

impl Serializer for JsonSerializer {
    fn serialize(&self, event: &Event) -> Option<Bytes> {
        let record = match serialized_event_field(&self.options, event) {
            Some(value) => self.serialized_field(value),
            None => self.record(event),
        };
        record.map(Bytes::from)
    }
}

pub struct CsvSerializer {
    options: SerializerOptions,
}

impl CsvSerializer {
    pub fn new(options: SerializerOptions) -> Self {
        Self { options }
    }

    fn record(&self, event: &Event) -> Option<String> {
        if self.options.columns.is_empty() {
            return None;
        }

        let fields = self
            .options
            .columns
            .iter()
            .map(|column| {
                let value = column_value(&self.options, event, column);
                match value {
                    Some(value) if column.column_type.is_structured() => value.to_string(),
                    Some(value) => scalar_text(value),
                    None => self.options.csv_default_value.clone(),
                }
            })
            .collect::<Vec<_>>();

        self.row(fields)
    }

    fn row(&self, mut fields: Vec<String>) -> Option<String> {
        if fields.is_empty() {
            return None;
        }

        let row = csv_row(&fields, &self.options.csv_separator);
        if row.len() < self.options.max_field_bytes || self.options.disable_truncation {
            return Some(row);
        }

        for (index, field) in fields.iter_mut().enumerate() {
            let name = self
                .options
                .columns
                .get(index)
                .map(|column| column.name.clone())
                .unwrap_or_else(|| (index + 1).to_string());
            if let Some(truncated) = truncate_str(field, self.options.max_field_bytes) {
                warn!(
                    field = %name,
                    truncated,
                    max_field_bytes = self.options.max_field_bytes,
                    "field truncated"
                );
            }
        }
        Some(csv_row(&fields, &self.options.csv_separator))
    }
}

impl Serializer for CsvSerializer {
    fn serialize(&self, event: &Event) -> Option<Bytes> {
        let record = match serialized_event_field(&self.options, event) {
            Some(Value::String(record)) => Some(record.clone()),
            Some(Value::Object(object)) => self.record(object),
            Some(Value::Array(values)) => self.row(values.iter().map(scalar_text).collect()),
            Some(_) => None,
            None => self.record(event),
        };
        record.map(Bytes::from)
    }
}

fn serialized_event_field<'a>(options: &SerializerOptions, event: &'a Event) -> Option<&'a Value> {
    options
        .serialized_event_field
        .as_deref()
        .and_then(|field| event.get(field))
        .filter(|value| !value.is_null())
}

/// The value of a column: the event field, else the column default.
fn column_value<'a>(
    options: &SerializerOptions,
    event: &'a Event,
    column: &'a ColumnOptions,
) -> Option<&'a Value> {
    let field = column.field_name();
    let value = if options.case_insensitive_columns {
        event
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(field))
            .map(|(_, value)| value)
    } else {
        event.get(field)
    };

    value
        .filter(|value| !value.is_null())
        .or(column.default.as_ref())
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Render one CSV row, quoting fields that need it.
pub fn csv_row(fields: &[String], separator: &str) -> String {
    fields
        .iter()
        .map(|field| {
            let needs_quotes = field.contains(separator)
                || field.contains('"')
                || field.contains('\r')
                || field.contains('\n');
            if needs_quotes {
                format!("\"{}\"", field.replace('"', "\"\""))
            } else {
                field.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(separator)
}

/// Cut `text` to at most `max_bytes` on a character boundary.
///
/// Returns how many bytes were removed, if any.
pub fn truncate_str(text: &mut String, max_bytes: usize) -> Option<usize> {
    if text.len() <= max_bytes {
        return None;
    }

    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let removed = text.len() - end;
    text.truncate(end);
    Some(removed)
}

/// Shrink a value until its JSON text fits in `max_bytes`.
///
/// Strings are cut; objects and arrays cut their largest string member until
/// they fit, and are emptied when no string is left to cut.
pub fn truncate_value(name: &str, value: &mut Value, max_bytes: usize) {
    let before = value.to_string().len();

    match value {
        Value::String(text) => {
            truncate_str(text, max_bytes);
        }
        Value::Object(_) | Value::Array(_) => loop {
            let size = value.to_string().len();
            if size <= max_bytes {
                break;
            }
            let delta = size - max_bytes;

            let largest = match value {
                Value::Object(object) => object.values_mut().filter_map(as_string_mut).max_by_key(|s| s.len()),
                Value::Array(values) => values.iter_mut().filter_map(as_string_mut).max_by_key(|s| s.len()),
                _ => None,
            };

            match largest {
                Some(text) if !text.is_empty() => {
                    let keep = text.len().saturating_sub(delta);
                    truncate_str(text, keep);
                }
                _ => {
                    *value = match value {
                        Value::Array(_) => Value::Array(Vec::new()),
                        _ => Value::Object(Map::new()),
                    };
                    break;
                }
            }
        },
        _ => return,
    }

    let after = value.to_string().len();
    if after < before {
        warn!(
            field = name,
            truncated = before - after,
            max_field_bytes = max_bytes,
            "field truncated"
        );
    }
}

fn as_string_mut(value: &mut Value) -> Option<&mut String> {
    match value {
        Value::String(text) => Some(text),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::ColumnType;

    fn options(columns: Vec<ColumnOptions>) -> SerializerOptions {
        SerializerOptions {
            serialized_event_field: None,
            columns,
            csv_separator: ",".to_string(),
            csv_default_value: String::new(),
            case_insensitive_columns: false,
            max_field_bytes: 1024,
            disable_truncation: false,
        }
    }

    fn event(value: Value) -> Event {
        match value {
            Value::Object(object) => object,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_json_whole_event() {
        let serializer = JsonSerializer::new(options(vec![]));
        let bytes = serializer.serialize(&event(json!({"a": 1, "b": "x"}))).unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, json!({"a": 1, "b": "x"}));

        assert!(serializer.serialize(&Map::new()).is_none());
    }

    #[test]
    fn test_json_columns_with_defaults() {
        let serializer = JsonSerializer::new(options(vec![
            ColumnOptions::new("id"),
            ColumnOptions::new("level").with_default("info"),
            ColumnOptions::new("missing"),
        ]));

        let bytes = serializer
            .serialize(&event(json!({"id": 7, "other": true})))
            .unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, json!({"id": 7, "level": "info"}));
    }

    #[test]
    fn test_case_insensitive_columns() {
        let mut options = options(vec![ColumnOptions::new("name")]);
        options.case_insensitive_columns = true;
        let serializer = JsonSerializer::new(options);

        let bytes = serializer.serialize(&event(json!({"NaMe": "x"}))).unwrap();
        assert_eq!(bytes, Bytes::from(r#"{"name":"x"}"#));
    }

    #[test]
    fn test_serialized_event_field_is_used_verbatim() {
        let mut options = options(vec![]);
        options.serialized_event_field = Some("message".to_string());
        let serializer = JsonSerializer::new(options);

        let bytes = serializer
            .serialize(&event(json!({"message": "raw line", "other": 1})))
            .unwrap();
        assert_eq!(bytes, Bytes::from("raw line"));
    }

    #[test]
    fn test_csv_quoting_defaults_and_structured_columns() {
        let mut options = options(vec![
            ColumnOptions::new("id").with_type(ColumnType::Number),
            ColumnOptions::new("text"),
            ColumnOptions::new("tags").with_type(ColumnType::Array),
            ColumnOptions::new("level").with_default("info"),
            ColumnOptions::new("missing"),
        ]);
        options.csv_default_value = "n/a".to_string();
        let serializer = CsvSerializer::new(options);

        let bytes = serializer
            .serialize(&event(json!({
                "id": 3,
                "text": "say \"hi\", bye",
                "tags": ["a", "b"],
            })))
            .unwrap();
        assert_eq!(
            bytes,
            Bytes::from(r#"3,"say ""hi"", bye","[""a"",""b""]",info,n/a"#)
        );
    }

    #[test]
    fn test_csv_requires_columns() {
        let serializer = CsvSerializer::new(options(vec![]));
        assert!(serializer.serialize(&event(json!({"a": 1}))).is_none());
    }

    #[test]
    fn test_truncate_str_respects_char_boundaries() {
        let mut text = "aé".repeat(4);
        let removed = truncate_str(&mut text, 4).unwrap();
        assert_eq!(text, "aéa");
        assert_eq!(removed, 8);

        let mut short = "abc".to_string();
        assert_eq!(truncate_str(&mut short, 10), None);
    }

    #[test]
    fn test_large_json_fields_are_truncated() {
        let mut options = options(vec![]);
        options.max_field_bytes = 16;
        let serializer = JsonSerializer::new(options);

        let bytes = serializer
            .serialize(&event(json!({
                "long": "x".repeat(40),
                "nested": {"a": "y".repeat(40), "n": 1},
            })))
            .unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(parsed["long"], json!("x".repeat(16)));
        assert!(parsed["nested"].to_string().len() <= 16);
        assert_eq!(parsed["nested"]["n"], json!(1));
    }

    #[test]
    fn test_truncation_can_be_disabled() {
        let mut options = options(vec![]);
        options.max_field_bytes = 4;
        options.disable_truncation = true;
        let serializer = JsonSerializer::new(options);

        let bytes = serializer
            .serialize(&event(json!({"long": "x".repeat(40)})))
            .unwrap();
        assert!(bytes.len() > 40);
    }
}
