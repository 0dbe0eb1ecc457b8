//! Row → value mapping.
//!
//! A [`DataMapper`] turns one row image into the caller's type. Two are
//! provided: [`FlatObjectMapper`] for flat records declared with
//! [`flat_record!`](crate::flat_record), and [`JsonMapper`] for untyped JSON.

pub mod flat;
pub mod json;
pub mod names;


use serde::{Deserialize, Serialize};

use crate::postgres::ColumnValues;
use crate::Result;

pub use flat::{FieldReader, FlatObjectMapper, FlatRecord, FromColumnValue, RawValue, RecordDescriptor};
pub use json::{parse_postgres_binary_value, parse_postgres_value, JsonMapper};
pub use names::{NameMapper, NameTransformation};

/// Produces a value of type [`DataMapper::Output`] from a row image.
///
/// Implementations must be side-effect free; one instance serves every row
/// of a subscription.
pub trait DataMapper: Send + Sync {
    type Output: Send;

    fn map(&self, values: &ColumnValues) -> Result<Self::Output>;
}

/// What a subscription does with a row its mapper rejects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingErrorPolicy {
    /// End the subscription with the mapping error.
    #[default]
    Fail,
    /// Log a warning and continue with the next row.
    Skip,
}
