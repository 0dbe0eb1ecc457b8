use bytes::Bytes;
use futures::StreamExt;
use postgres_protocol::escape::{escape_identifier, escape_literal};
use std::pin::Pin;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Config, CopyOutStream, SimpleQueryMessage};
use tracing::{debug, info};

use super::connection::PgConnection;
use super::types::{Column, ColumnValue, ColumnValues, RowChange, TableName};
use crate::{Error, Result};

/// Reads a table's contents as of an exported snapshot.
pub struct SnapshotReader {
    config: Config,
}

impl SnapshotReader {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Opens a dedicated connection, attaches it to `snapshot_name` and
    /// starts copying `table`.
    ///
    /// The snapshot is imported before this returns, so the exporting
    /// replication connection is free for other commands afterwards.
    pub async fn read_rows(&self, snapshot_name: &str, table: &TableName) -> Result<SnapshotRows> {
        info!(snapshot = %snapshot_name, table = %table, "Reading table snapshot");

        let connection = PgConnection::connect(&self.config).await?;
        let client = connection.client();

        client
            .batch_execute("BEGIN READ ONLY ISOLATION LEVEL REPEATABLE READ")
            .await?;

        let set_snapshot = format!("SET TRANSACTION SNAPSHOT {}", escape_literal(snapshot_name));
        if let Err(e) = client.batch_execute(&set_snapshot).await {
            return Err(match e.code() {
                Some(code)
                    if *code == SqlState::INVALID_PARAMETER_VALUE
                        || *code == SqlState::OBJECT_NOT_IN_PREREQUISITE_STATE =>
                {
                    Error::SnapshotExpired {
                        snapshot: snapshot_name.to_string(),
                    }
                }
                _ => Error::Postgres(e),
            });
        }

        let columns = table_columns(&connection, table).await?;
        if columns.is_empty() {
            return Err(Error::Config(format!("table {} has no columns", table)));
        }

        let column_list = columns
            .iter()
            .map(|column| escape_identifier(&column.name))
            .collect::<Vec<_>>()
            .join(", ");
        let copy_query = format!(
            "COPY (SELECT {} FROM {}) TO STDOUT",
            column_list,
            table.as_quoted_identifier()
        );

        let stream = client.copy_out_simple(&copy_query).await?;

        Ok(SnapshotRows {
            connection: Some(connection),
            table: table.clone(),
            columns,
            stream: Box::pin(stream),
            rows_read: 0,
        })
    }
}

/// Columns of `table` as the replication stream carries them. Generated
/// columns (PostgreSQL 12+) are excluded; pgoutput does not send them.
async fn table_columns(connection: &PgConnection, table: &TableName) -> Result<Vec<Column>> {
    let query = columns_query(table, server_version_num(connection).await?);

    let mut columns = Vec::new();
    for message in connection.client().simple_query(&query).await? {
        if let SimpleQueryMessage::Row(row) = message {
            let name = row.try_get("attname")?.unwrap_or_default().to_string();
            let type_id = row
                .try_get("atttypid")?
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            columns.push(Column { name, type_id });
        }
    }

    debug!("Snapshot columns for {}: {:?}", table, columns);
    Ok(columns)
}

async fn server_version_num(connection: &PgConnection) -> Result<u32> {
    for message in connection.client().simple_query("SHOW server_version_num").await? {
        if let SimpleQueryMessage::Row(row) = message {
            if let Some(version) = row.try_get(0)?.and_then(|v| v.parse().ok()) {
                return Ok(version);
            }
        }
    }
    Err(Error::Protocol("server_version_num not reported".to_string()))
}

fn columns_query(table: &TableName, server_version: u32) -> String {
    let generated = if server_version >= 120000 {
        " AND a.attgenerated = ''"
    } else {
        ""
    };
    format!(
        "SELECT a.attname, a.atttypid FROM pg_catalog.pg_attribute a \
         WHERE a.attrelid = {}::regclass AND a.attnum > 0 AND NOT a.attisdropped{} \
         ORDER BY a.attnum",
        escape_literal(&table.as_quoted_identifier()),
        generated
    )
}

/// Lazily yields the rows of one snapshot read.
///
/// The read transaction is committed and the connection closed once the last
/// row has been returned. Dropping the value early abandons the read.
pub struct SnapshotRows {
    connection: Option<PgConnection>,
    table: TableName,
    columns: Vec<Column>,
    stream: Pin<Box<CopyOutStream>>,
    rows_read: u64,
}

impl SnapshotRows {
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    pub async fn next_row(&mut self) -> Result<Option<RowChange>> {
        if self.connection.is_none() {
            return Ok(None);
        }

        match self.stream.next().await {
            Some(Ok(line)) => {
                let values = parse_copy_row(&line, &self.columns)?;
                self.rows_read += 1;
                Ok(Some(RowChange::snapshot_row(self.table.clone(), values)))
            }
            Some(Err(e)) => Err(Error::Postgres(e)),
            None => {
                self.finish().await?;
                Ok(None)
            }
        }
    }

    async fn finish(&mut self) -> Result<()> {
        if let Some(connection) = self.connection.take() {
            connection.client().batch_execute("COMMIT").await?;
            connection.close();
            info!(
                table = %self.table,
                rows = self.rows_read,
                "Snapshot read finished"
            );
        }
        Ok(())
    }

    /// Stops reading; the read-only transaction is discarded with the connection.
    pub fn abandon(mut self) {
        if let Some(connection) = self.connection.take() {
            debug!(table = %self.table, rows = self.rows_read, "Snapshot read abandoned");
            connection.close();
        }
    }
}

/// Parses one COPY text-format line into column values.
pub fn parse_copy_row(line: &Bytes, columns: &[Column]) -> Result<ColumnValues> {
    let line = line.strip_suffix(b"\n").unwrap_or(&line[..]);
    let fields: Vec<&[u8]> = line.split(|b| *b == b'\t').collect();

    if fields.len() != columns.len() {
        return Err(Error::invalid_message(format!(
            "COPY row has {} fields, expected {}",
            fields.len(),
            columns.len()
        )));
    }

    let mut values = ColumnValues::with_capacity(columns.len());
    for (column, field) in columns.iter().zip(fields) {
        let value = if field == b"\\N" {
            ColumnValue::Null
        } else {
            ColumnValue::Text(unescape_copy_field(field))
        };
        values.push(column.clone(), value);
    }

    Ok(values)
}

fn unescape_copy_field(field: &[u8]) -> String {
    let mut out = Vec::with_capacity(field.len());
    let mut i = 0;

    while i < field.len() {
        let b = field[i];
        if b != b'\\' || i + 1 == field.len() {
            out.push(b);
            i += 1;
            continue;
        }

        let next = field[i + 1];
        i += 2;
        match next {
            b'b' => out.push(0x08),
            b'f' => out.push(0x0C),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'v' => out.push(0x0B),
            b'0'..=b'7' => {
                let mut value = (next - b'0') as u32;
                let mut digits = 1;
                while digits < 3 && i < field.len() && (b'0'..=b'7').contains(&field[i]) {
                    value = value * 8 + (field[i] - b'0') as u32;
                    i += 1;
                    digits += 1;
                }
                out.push(value as u8);
            }
            b'x' if i < field.len() && field[i].is_ascii_hexdigit() => {
                let mut value = 0u32;
                let mut digits = 0;
                while digits < 2 && i < field.len() && field[i].is_ascii_hexdigit() {
                    value = value * 16 + (field[i] as char).to_digit(16).unwrap_or(0);
                    i += 1;
                    digits += 1;
                }
                out.push(value as u8);
            }
            other => out.push(other),
        }
    }

    String::from_utf8_lossy(&out).to_string()
}
