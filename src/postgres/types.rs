use bytes::Bytes;
use postgres_protocol::escape::escape_identifier;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::lsn::Lsn;
use crate::{Error, Result};

/// A schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parses `table` or `schema.table`; unqualified names live in `public`.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        let (schema, name) = match parts.as_slice() {
            [name] => ("public", *name),
            [schema, name] => (*schema, *name),
            _ => {
                return Err(Error::Config(format!("invalid table name '{}'", s)));
            }
        };

        for part in [schema, name] {
            if !is_valid_identifier(part) {
                return Err(Error::Config(format!("invalid table name '{}'", s)));
            }
        }

        Ok(Self::new(schema, name))
    }

    /// Returns `"schema"."name"` suitable for embedding in SQL.
    pub fn as_quoted_identifier(&self) -> String {
        format!(
            "{}.{}",
            escape_identifier(&self.schema),
            escape_identifier(&self.name)
        )
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Returns true for `[A-Za-z_][A-Za-z0-9_$]*` of at most 63 bytes.
pub fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    s.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Returns true for names the server accepts as replication slot names.
pub fn is_valid_slot_name(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Column metadata shared by snapshot rows and stream tuples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub type_id: u32,
}

/// A single raw column value as delivered by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    Null,
    /// Unchanged TOASTed value; the server omitted it from the tuple.
    Unchanged,
    Text(String),
    Binary(Bytes),
}

impl ColumnValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// An ordered row image: column metadata paired with raw values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnValues {
    entries: Vec<(Column, ColumnValue)>,
}

impl ColumnValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, column: Column, value: ColumnValue) {
        self.entries.push((column, value));
    }

    pub fn get(&self, name: &str) -> Option<&ColumnValue> {
        self.entries
            .iter()
            .find(|(column, _)| column.name == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Column, &ColumnValue)> {
        self.entries.iter().map(|(column, value)| (column, value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// One decoded row change.
///
/// Snapshot rows are `Insert` changes without a position.
#[derive(Debug, Clone)]
pub struct RowChange {
    pub kind: ChangeKind,
    pub table: TableName,
    pub before: Option<ColumnValues>,
    pub after: Option<ColumnValues>,
    /// Commit position of the enclosing transaction; `None` for snapshot rows.
    pub position: Option<Lsn>,
    pub xid: Option<u32>,
}

impl RowChange {
    pub fn snapshot_row(table: TableName, values: ColumnValues) -> Self {
        Self {
            kind: ChangeKind::Insert,
            table,
            before: None,
            after: Some(values),
            position: None,
            xid: None,
        }
    }
}
