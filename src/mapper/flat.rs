use bigdecimal::BigDecimal;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::marker::PhantomData;
use std::str::FromStr;
use uuid::Uuid;

use super::names::NameMapper;
use super::DataMapper;
use crate::postgres::{ColumnValue, ColumnValues};
use crate::{Error, Result};

/// A record type that can be populated column by column.
///
/// Usually implemented through [`flat_record!`](crate::flat_record).
pub trait FlatRecord: Sized {
    /// Declared field names, in the target naming convention.
    const FIELDS: &'static [&'static str];

    fn from_fields(fields: &FieldReader<'_>) -> Result<Self>;
}

/// Field → column name table for one record type, built once per mapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordDescriptor {
    fields: Vec<(&'static str, String)>,
}

impl RecordDescriptor {
    pub fn new(fields: &[&'static str], names: &dyn NameMapper) -> Self {
        Self {
            fields: fields
                .iter()
                .map(|field| (*field, names.to_column(field)))
                .collect(),
        }
    }

    pub fn column_for(&self, field: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, column)| column.as_str())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.fields.iter().map(|(field, column)| (*field, column.as_str()))
    }
}

/// Typed access to one row's values through a [`RecordDescriptor`].
pub struct FieldReader<'a> {
    values: &'a ColumnValues,
    descriptor: &'a RecordDescriptor,
    defaults_for_missing: bool,
}

impl<'a> FieldReader<'a> {
    pub fn new(
        values: &'a ColumnValues,
        descriptor: &'a RecordDescriptor,
        defaults_for_missing: bool,
    ) -> Self {
        Self {
            values,
            descriptor,
            defaults_for_missing,
        }
    }

    pub fn get<V: FromColumnValue>(&self, field: &str) -> Result<V> {
        let column = self
            .descriptor
            .column_for(field)
            .ok_or_else(|| Error::mapping(field, "field is not declared by the record"))?;

        let absent = |reason: &str| {
            V::absent()
                .or_else(|| self.defaults_for_missing.then(V::zero).flatten())
                .ok_or_else(|| Error::mapping(field, format!("column '{}' {}", column, reason)))
        };

        match self.values.get(column) {
            None => absent("is missing from the row"),
            Some(ColumnValue::Null) => absent("is null"),
            Some(ColumnValue::Unchanged) => absent("holds an unchanged TOAST value"),
            Some(value) => V::from_column(value).map_err(|message| Error::mapping(field, message)),
        }
    }
}

/// Conversion from a raw column value to a field type.
pub trait FromColumnValue: Sized {
    /// Converts a present, non-null value.
    fn from_column(value: &ColumnValue) -> std::result::Result<Self, String>;

    /// Value for an absent, null or unchanged column. `None` makes the field required.
    fn absent() -> Option<Self> {
        None
    }

    /// Zero value used when a mapper fills missing required fields.
    fn zero() -> Option<Self> {
        None
    }
}

fn text(value: &ColumnValue) -> std::result::Result<&str, String> {
    match value {
        ColumnValue::Text(text) => Ok(text),
        ColumnValue::Binary(_) => Err("binary column values are not supported".to_string()),
        ColumnValue::Null | ColumnValue::Unchanged => Err("no value".to_string()),
    }
}

macro_rules! from_str_column {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FromColumnValue for $ty {
                fn from_column(value: &ColumnValue) -> std::result::Result<Self, String> {
                    let text = text(value)?;
                    <$ty>::from_str(text.trim())
                        .map_err(|e| format!("cannot convert '{}' to {}: {}", text, stringify!($ty), e))
                }

                fn zero() -> Option<Self> {
                    Some(<$ty>::default())
                }
            }
        )*
    };
}

from_str_column!(i16, i32, i64, u16, u32, u64, f32, f64, BigDecimal);

impl FromColumnValue for bool {
    fn from_column(value: &ColumnValue) -> std::result::Result<Self, String> {
        match text(value)? {
            "t" | "true" => Ok(true),
            "f" | "false" => Ok(false),
            other => Err(format!("cannot convert '{}' to bool", other)),
        }
    }

    fn zero() -> Option<Self> {
        Some(false)
    }
}

impl FromColumnValue for String {
    fn from_column(value: &ColumnValue) -> std::result::Result<Self, String> {
        text(value).map(str::to_string)
    }

    fn zero() -> Option<Self> {
        Some(String::new())
    }
}

impl FromColumnValue for char {
    fn from_column(value: &ColumnValue) -> std::result::Result<Self, String> {
        let text = text(value)?;
        let mut chars = text.trim_end().chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(c),
            _ => Err(format!("cannot convert '{}' to char", text)),
        }
    }

    fn zero() -> Option<Self> {
        Some('\0')
    }
}

impl FromColumnValue for DateTime<Utc> {
    fn from_column(value: &ColumnValue) -> std::result::Result<Self, String> {
        let text = text(value)?;
        DateTime::parse_from_rfc3339(text)
            .or_else(|_| DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z"))
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|_| parse_naive_datetime(text).map(|naive| naive.and_utc()))
            .map_err(|_| format!("cannot convert '{}' to a timestamp", text))
    }

    fn zero() -> Option<Self> {
        Some(DateTime::<Utc>::default())
    }
}

impl FromColumnValue for NaiveDateTime {
    fn from_column(value: &ColumnValue) -> std::result::Result<Self, String> {
        let text = text(value)?;
        parse_naive_datetime(text).map_err(|_| format!("cannot convert '{}' to a timestamp", text))
    }

    fn zero() -> Option<Self> {
        Some(NaiveDateTime::default())
    }
}

fn parse_naive_datetime(text: &str) -> chrono::ParseResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
}

impl FromColumnValue for NaiveDate {
    fn from_column(value: &ColumnValue) -> std::result::Result<Self, String> {
        let text = text(value)?;
        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map_err(|_| format!("cannot convert '{}' to a date", text))
    }

    fn zero() -> Option<Self> {
        Some(NaiveDate::default())
    }
}

impl FromColumnValue for Uuid {
    fn from_column(value: &ColumnValue) -> std::result::Result<Self, String> {
        let text = text(value)?;
        Uuid::parse_str(text).map_err(|e| format!("cannot convert '{}' to uuid: {}", text, e))
    }

    fn zero() -> Option<Self> {
        Some(Uuid::nil())
    }
}

impl FromColumnValue for serde_json::Value {
    fn from_column(value: &ColumnValue) -> std::result::Result<Self, String> {
        serde_json::from_str(text(value)?).map_err(|e| format!("invalid json: {}", e))
    }

    fn absent() -> Option<Self> {
        Some(serde_json::Value::Null)
    }
}

impl FromColumnValue for Vec<u8> {
    fn from_column(value: &ColumnValue) -> std::result::Result<Self, String> {
        match value {
            ColumnValue::Binary(bytes) => Ok(bytes.to_vec()),
            other => decode_bytea_hex(text(other)?),
        }
    }

    fn zero() -> Option<Self> {
        Some(Vec::new())
    }
}

impl FromColumnValue for Bytes {
    fn from_column(value: &ColumnValue) -> std::result::Result<Self, String> {
        match value {
            ColumnValue::Binary(bytes) => Ok(bytes.clone()),
            other => decode_bytea_hex(text(other)?).map(Bytes::from),
        }
    }

    fn zero() -> Option<Self> {
        Some(Bytes::new())
    }
}

fn decode_bytea_hex(text: &str) -> std::result::Result<Vec<u8>, String> {
    let hex = text
        .strip_prefix("\\x")
        .ok_or_else(|| "bytea value is not in hex format".to_string())?;

    if hex.len() % 2 != 0 {
        return Err("bytea hex value has odd length".to_string());
    }

    hex.as_bytes()
        .chunks(2)
        .map(|pair| match (hex_digit(pair[0]), hex_digit(pair[1])) {
            (Some(high), Some(low)) => Ok(high << 4 | low),
            _ => Err(format!(
                "invalid bytea hex digits '{}'",
                String::from_utf8_lossy(pair)
            )),
        })
        .collect()
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

/// Column value passed through untouched, e.g. PostGIS geometries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawValue(pub Bytes);

impl RawValue {
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl FromColumnValue for RawValue {
    fn from_column(value: &ColumnValue) -> std::result::Result<Self, String> {
        match value {
            ColumnValue::Text(text) => Ok(RawValue(Bytes::copy_from_slice(text.as_bytes()))),
            ColumnValue::Binary(bytes) => Ok(RawValue(bytes.clone())),
            ColumnValue::Null | ColumnValue::Unchanged => Err("no value".to_string()),
        }
    }

    fn zero() -> Option<Self> {
        Some(RawValue::default())
    }
}

impl<V: FromColumnValue> FromColumnValue for Option<V> {
    fn from_column(value: &ColumnValue) -> std::result::Result<Self, String> {
        V::from_column(value).map(Some)
    }

    fn absent() -> Option<Self> {
        Some(None)
    }
}

/// Maps rows onto a [`FlatRecord`] by transformed column name.
///
/// Columns without a matching field are ignored. A required field whose
/// column is missing or null fails with [`Error::Mapping`] unless
/// [`FlatObjectMapper::with_defaults_for_missing`] was set, in which case the
/// type's zero value is used.
pub struct FlatObjectMapper<T> {
    descriptor: RecordDescriptor,
    defaults_for_missing: bool,
    _record: PhantomData<fn() -> T>,
}

impl<T: FlatRecord> FlatObjectMapper<T> {
    pub fn new(names: impl NameMapper) -> Self {
        Self {
            descriptor: RecordDescriptor::new(T::FIELDS, &names),
            defaults_for_missing: false,
            _record: PhantomData,
        }
    }

    pub fn with_defaults_for_missing(mut self) -> Self {
        self.defaults_for_missing = true;
        self
    }

    pub fn descriptor(&self) -> &RecordDescriptor {
        &self.descriptor
    }
}

impl<T: FlatRecord + Send> DataMapper for FlatObjectMapper<T> {
    type Output = T;

    fn map(&self, values: &ColumnValues) -> Result<T> {
        T::from_fields(&FieldReader::new(
            values,
            &self.descriptor,
            self.defaults_for_missing,
        ))
    }
}

/// Declares a struct and its [`FlatRecord`] implementation.
///
/// Field names are the Rust identifiers; the mapper's [`NameMapper`] turns
/// them into column names.
///
/// ```rust
/// use chrono::{DateTime, Utc};
/// use pg_subscription::flat_record;
///
/// flat_record! {
///     #[derive(Debug, Clone)]
///     pub struct Trip {
///         pub id: i64,
///         pub vehicle_id: i32,
///         pub started_at: DateTime<Utc>,
///         pub note: Option<String>,
///     }
/// }
/// ```
#[macro_export]
macro_rules! flat_record {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$field_meta:meta])*
                $field_vis:vis $field:ident : $ty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $(
                $(#[$field_meta])*
                $field_vis $field: $ty,
            )*
        }

        impl $crate::mapper::FlatRecord for $name {
            const FIELDS: &'static [&'static str] = &[$(stringify!($field)),*];

            fn from_fields(
                fields: &$crate::mapper::FieldReader<'_>,
            ) -> $crate::Result<Self> {
                Ok(Self {
                    $($field: fields.get(stringify!($field))?,)*
                })
            }
        }
    };
}
