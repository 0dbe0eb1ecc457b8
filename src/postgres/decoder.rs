use bytes::{Buf, Bytes};
use std::collections::HashMap;
use tracing::{debug, trace};

use super::types::{ChangeKind, Column, ColumnValue, ColumnValues, RowChange, TableName};
use crate::lsn::Lsn;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct RelationInfo {
    pub id: u32,
    pub table: TableName,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub type_id: u32,
    pub is_key: bool,
}

/// Decoder for `pgoutput` protocol version 1 messages.
///
/// Relation messages are cached by OID so later tuple messages can be
/// resolved to column names. The current transaction's commit position is
/// taken from BEGIN and stamped on every change in that transaction.
#[derive(Default)]
pub struct PgOutputDecoder {
    relations: HashMap<u32, RelationInfo>,
    current_final_lsn: Option<Lsn>,
    current_xid: Option<u32>,
}

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relation(&self, id: u32) -> Option<&RelationInfo> {
        self.relations.get(&id)
    }

    /// Decodes one XLogData payload.
    pub fn decode(&mut self, data: &[u8]) -> Result<Option<DecodedMessage>> {
        if data.is_empty() {
            return Ok(None);
        }

        let mut cursor = data;
        let msg_type = cursor.get_u8();

        match msg_type {
            b'B' => self.decode_begin(cursor),
            b'C' => self.decode_commit(cursor),
            b'R' => self.decode_relation(cursor),
            b'I' => self.decode_insert(cursor),
            b'U' => self.decode_update(cursor),
            b'D' => self.decode_delete(cursor),
            b'T' => self.decode_truncate(cursor),
            b'O' | b'Y' | b'M' => {
                trace!("Ignoring pgoutput message type: {}", msg_type as char);
                Ok(None)
            }
            _ => {
                debug!("Unknown pgoutput message type: {}", msg_type as char);
                Ok(None)
            }
        }
    }

    fn decode_begin(&mut self, mut cursor: &[u8]) -> Result<Option<DecodedMessage>> {
        if cursor.remaining() < 20 {
            return Err(Error::invalid_message("Invalid BEGIN message size"));
        }

        let final_lsn = Lsn(cursor.get_u64());
        let _timestamp = cursor.get_i64();
        let xid = cursor.get_u32();

        self.current_final_lsn = Some(final_lsn);
        self.current_xid = Some(xid);

        trace!("BEGIN: final_lsn={}, xid={}", final_lsn, xid);
        Ok(Some(DecodedMessage::Begin { final_lsn, xid }))
    }

    fn decode_commit(&mut self, mut cursor: &[u8]) -> Result<Option<DecodedMessage>> {
        if cursor.remaining() < 25 {
            return Err(Error::invalid_message("Invalid COMMIT message size"));
        }

        let _flags = cursor.get_u8();
        let commit_lsn = Lsn(cursor.get_u64());
        let end_lsn = Lsn(cursor.get_u64());
        let _timestamp = cursor.get_i64();

        self.current_final_lsn = None;
        self.current_xid = None;

        trace!("COMMIT: commit_lsn={}, end_lsn={}", commit_lsn, end_lsn);
        Ok(Some(DecodedMessage::Commit {
            commit_lsn,
            end_lsn,
        }))
    }

    fn decode_relation(&mut self, mut cursor: &[u8]) -> Result<Option<DecodedMessage>> {
        if cursor.remaining() < 4 {
            return Err(Error::invalid_message("Invalid RELATION message size"));
        }

        let rel_id = cursor.get_u32();
        let schema = read_cstring(&mut cursor, "namespace")?;
        let table = read_cstring(&mut cursor, "relation name")?;

        if cursor.remaining() < 3 {
            return Err(Error::invalid_message("Invalid RELATION message size"));
        }
        let _replica_identity = cursor.get_u8();
        let num_columns = cursor.get_u16();

        let mut columns = Vec::with_capacity(num_columns as usize);

        for _ in 0..num_columns {
            if cursor.remaining() < 1 {
                return Err(Error::invalid_message("Truncated RELATION column"));
            }
            let flags = cursor.get_u8();
            let is_key = (flags & 1) != 0;
            let name = read_cstring(&mut cursor, "column name")?;

            if cursor.remaining() < 8 {
                return Err(Error::invalid_message("Truncated RELATION column"));
            }
            let type_id = cursor.get_u32();
            let _type_modifier = cursor.get_i32();

            columns.push(ColumnInfo {
                name,
                type_id,
                is_key,
            });
        }

        let relation = RelationInfo {
            id: rel_id,
            table: TableName::new(schema, table),
            columns,
        };

        debug!("RELATION: {}={}", rel_id, relation.table);
        self.relations.insert(rel_id, relation);

        Ok(None)
    }

    fn decode_insert(&mut self, mut cursor: &[u8]) -> Result<Option<DecodedMessage>> {
        if cursor.remaining() < 5 {
            return Err(Error::invalid_message("Invalid INSERT message size"));
        }

        let rel_id = cursor.get_u32();
        let tuple_type = cursor.get_u8();

        if tuple_type != b'N' {
            return Err(Error::invalid_message(format!(
                "Unexpected tuple type in INSERT: {}",
                tuple_type as char
            )));
        }

        let relation = self.lookup_relation(rel_id)?;
        let after = decode_tuple_data(&mut cursor, &relation.columns)?;

        Ok(Some(DecodedMessage::Change(self.change(
            ChangeKind::Insert,
            relation.table.clone(),
            None,
            Some(after),
        ))))
    }

    fn decode_update(&mut self, mut cursor: &[u8]) -> Result<Option<DecodedMessage>> {
        if cursor.remaining() < 5 {
            return Err(Error::invalid_message("Invalid UPDATE message size"));
        }

        let rel_id = cursor.get_u32();
        let relation = self.lookup_relation(rel_id)?;

        let mut before = None;
        let mut tuple_type = cursor.get_u8();

        if tuple_type == b'O' || tuple_type == b'K' {
            before = Some(decode_tuple_data(&mut cursor, &relation.columns)?);
            if cursor.remaining() < 1 {
                return Err(Error::invalid_message("UPDATE message missing new tuple"));
            }
            tuple_type = cursor.get_u8();
        }

        if tuple_type != b'N' {
            return Err(Error::invalid_message(format!(
                "Unexpected tuple type in UPDATE: {}",
                tuple_type as char
            )));
        }

        let after = decode_tuple_data(&mut cursor, &relation.columns)?;

        Ok(Some(DecodedMessage::Change(self.change(
            ChangeKind::Update,
            relation.table.clone(),
            before,
            Some(after),
        ))))
    }

    fn decode_delete(&mut self, mut cursor: &[u8]) -> Result<Option<DecodedMessage>> {
        if cursor.remaining() < 5 {
            return Err(Error::invalid_message("Invalid DELETE message size"));
        }

        let rel_id = cursor.get_u32();
        let tuple_type = cursor.get_u8();

        if tuple_type != b'O' && tuple_type != b'K' {
            return Err(Error::invalid_message(format!(
                "Unexpected tuple type in DELETE: {}",
                tuple_type as char
            )));
        }

        let relation = self.lookup_relation(rel_id)?;
        let before = decode_tuple_data(&mut cursor, &relation.columns)?;

        Ok(Some(DecodedMessage::Change(self.change(
            ChangeKind::Delete,
            relation.table.clone(),
            Some(before),
            None,
        ))))
    }

    fn decode_truncate(&mut self, mut cursor: &[u8]) -> Result<Option<DecodedMessage>> {
        if cursor.remaining() < 5 {
            return Err(Error::invalid_message("Invalid TRUNCATE message size"));
        }

        let num_relations = cursor.get_u32();
        let _options = cursor.get_u8();
        if cursor.remaining() < num_relations as usize * 4 {
            return Err(Error::invalid_message("Invalid TRUNCATE message size"));
        }

        let tables = (0..num_relations)
            .filter_map(|_| self.relations.get(&cursor.get_u32()))
            .map(|relation| relation.table.clone())
            .collect();

        debug!("TRUNCATE of {} relation(s) received", num_relations);
        Ok(Some(DecodedMessage::Truncate { tables }))
    }

    fn lookup_relation(&self, rel_id: u32) -> Result<&RelationInfo> {
        self.relations
            .get(&rel_id)
            .ok_or_else(|| Error::invalid_message(format!("Unknown relation ID: {}", rel_id)))
    }

    fn change(
        &self,
        kind: ChangeKind,
        table: TableName,
        before: Option<ColumnValues>,
        after: Option<ColumnValues>,
    ) -> RowChange {
        RowChange {
            kind,
            table,
            before,
            after,
            position: self.current_final_lsn,
            xid: self.current_xid,
        }
    }
}

fn read_cstring(cursor: &mut &[u8], what: &str) -> Result<String> {
    let end = cursor
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::invalid_message(format!("Unterminated {}", what)))?;
    let value = String::from_utf8_lossy(&cursor[..end]).to_string();
    cursor.advance(end + 1);
    Ok(value)
}

fn decode_tuple_data(cursor: &mut &[u8], columns: &[ColumnInfo]) -> Result<ColumnValues> {
    if cursor.remaining() < 2 {
        return Err(Error::invalid_message("Missing tuple column count"));
    }
    let num_columns = cursor.get_u16();

    if num_columns as usize != columns.len() {
        return Err(Error::invalid_message(format!(
            "Column count mismatch: {} vs {}",
            num_columns,
            columns.len()
        )));
    }

    let mut tuple = ColumnValues::with_capacity(columns.len());

    for column in columns.iter() {
        if cursor.remaining() < 1 {
            return Err(Error::invalid_message("Truncated tuple data"));
        }
        let col_type = cursor.get_u8();

        let value = match col_type {
            b'n' => ColumnValue::Null,
            b'u' => ColumnValue::Unchanged,
            b't' | b'b' => {
                if cursor.remaining() < 4 {
                    return Err(Error::invalid_message("Truncated value length"));
                }
                let len = cursor.get_u32() as usize;
                if cursor.remaining() < len {
                    return Err(Error::invalid_message("Invalid value length"));
                }
                let raw = &cursor[..len];
                let value = if col_type == b't' {
                    ColumnValue::Text(String::from_utf8_lossy(raw).to_string())
                } else {
                    ColumnValue::Binary(Bytes::copy_from_slice(raw))
                };
                cursor.advance(len);
                value
            }
            _ => {
                return Err(Error::invalid_message(format!(
                    "Unknown column type: {}",
                    col_type
                )));
            }
        };

        tuple.push(
            Column {
                name: column.name.clone(),
                type_id: column.type_id,
            },
            value,
        );
    }

    Ok(tuple)
}

#[derive(Debug)]
pub enum DecodedMessage {
    Begin { final_lsn: Lsn, xid: u32 },
    Commit { commit_lsn: Lsn, end_lsn: Lsn },
    Change(RowChange),
    Truncate { tables: Vec<TableName> },
}
