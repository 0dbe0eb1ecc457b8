use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{Map, Value};

use super::names::{NameMapper, NameTransformation};
use super::DataMapper;
use crate::postgres::{ColumnValue, ColumnValues};
use crate::Result;

/// Maps a row to a JSON object keyed by (transformed) column name.
///
/// Values are typed by column OID; unchanged TOAST values are omitted.
#[derive(Debug, Clone, Default)]
pub struct JsonMapper {
    names: NameTransformation,
}

impl JsonMapper {
    pub fn new(names: NameTransformation) -> Self {
        Self { names }
    }
}

impl DataMapper for JsonMapper {
    type Output = Value;

    fn map(&self, values: &ColumnValues) -> Result<Value> {
        let mut object = Map::with_capacity(values.len());

        for (column, value) in values.iter() {
            let json = match value {
                ColumnValue::Null => Value::Null,
                ColumnValue::Unchanged => continue,
                ColumnValue::Text(text) => parse_postgres_value(text, column.type_id),
                ColumnValue::Binary(bytes) => parse_postgres_binary_value(bytes, column.type_id),
            };
            object.insert(self.names.to_field(&column.name), json);
        }

        Ok(Value::Object(object))
    }
}

/// Converts a text-format value to JSON according to its type OID.
pub fn parse_postgres_value(text: &str, type_id: u32) -> Value {
    match type_id {
        16 => match text {
            "t" => Value::Bool(true),
            "f" => Value::Bool(false),
            _ => Value::String(text.to_string()),
        },
        20 | 21 | 23 | 26 => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        700 | 701 => text
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(Value::from)
            .unwrap_or_else(|| Value::String(text.to_string())),
        114 | 3802 => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }
        _ => match array_element_type(type_id) {
            Some(element_type) => parse_array(text, element_type)
                .unwrap_or_else(|| Value::String(text.to_string())),
            // numeric stays textual to keep its precision
            None => Value::String(text.to_string()),
        },
    }
}

/// Converts a binary-format value to JSON according to its type OID.
pub fn parse_postgres_binary_value(data: &[u8], type_id: u32) -> Value {
    match (type_id, data.len()) {
        (_, 0) if type_id == 16 => Value::Null,
        (16, _) => Value::Bool(data[0] != 0),
        (21, 2) => Value::from(i16::from_be_bytes([data[0], data[1]])),
        (23, 4) => Value::from(i32::from_be_bytes([data[0], data[1], data[2], data[3]])),
        (20, 8) => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(data);
            Value::from(i64::from_be_bytes(buf))
        }
        (700, 4) => Value::from(f32::from_be_bytes([data[0], data[1], data[2], data[3]]) as f64),
        (701, 8) => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(data);
            Value::from(f64::from_be_bytes(buf))
        }
        (2950, 16) => {
            let mut buf = [0u8; 16];
            buf.copy_from_slice(data);
            Value::String(uuid::Uuid::from_bytes(buf).to_string())
        }
        (25 | 1043, _) => Value::String(String::from_utf8_lossy(data).to_string()),
        _ => Value::String(format!("base64:{}", BASE64.encode(data))),
    }
}

fn array_element_type(type_id: u32) -> Option<u32> {
    match type_id {
        1000 => Some(16),
        1005 => Some(21),
        1007 => Some(23),
        1016 => Some(20),
        1021 => Some(700),
        1022 => Some(701),
        1009 => Some(25),
        1015 => Some(1043),
        1231 => Some(1700),
        2951 => Some(2950),
        _ => None,
    }
}

/// Parses a one-dimensional array literal such as `{1,2,NULL}` or
/// `{"a b",c}`. Returns `None` for anything more complex.
fn parse_array(text: &str, element_type: u32) -> Option<Value> {
    let inner = text.strip_prefix('{')?.strip_suffix('}')?;
    if inner.is_empty() {
        return Some(Value::Array(Vec::new()));
    }

    let mut elements = Vec::new();
    let mut chars = inner.chars().peekable();

    loop {
        let element = if chars.peek() == Some(&'"') {
            chars.next();
            let mut value = String::new();
            loop {
                match chars.next()? {
                    '\\' => value.push(chars.next()?),
                    '"' => break,
                    c => value.push(c),
                }
            }
            parse_postgres_value(&value, element_type)
        } else {
            let mut value = String::new();
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                if c == '{' || c == '"' {
                    return None;
                }
                value.push(c);
                chars.next();
            }
            if value == "NULL" {
                Value::Null
            } else {
                parse_postgres_value(&value, element_type)
            }
        };
        elements.push(element);

        match chars.next() {
            Some(',') => continue,
            None => break,
            Some(_) => return None,
        }
    }

    Some(Value::Array(elements))
}
