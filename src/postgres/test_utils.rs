use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

/// Builds pgoutput payloads and CopyData frames for decoder and stream tests.
pub struct MockMessageBuilder {
    lsn: u64,
    timestamp: i64,
    relations: HashMap<u32, MockRelation>,
}

#[derive(Debug, Clone)]
pub struct MockRelation {
    pub id: u32,
    pub schema: String,
    pub table: String,
    pub columns: Vec<MockColumn>,
}

#[derive(Debug, Clone)]
pub struct MockColumn {
    pub name: String,
    pub type_id: u32,
    pub is_key: bool,
}

/// Value kinds a tuple column can carry on the wire.
#[derive(Debug, Clone)]
pub enum TupleValue {
    Null,
    Unchanged,
    Text(String),
    Binary(Vec<u8>),
}

impl From<Option<&str>> for TupleValue {
    fn from(value: Option<&str>) -> Self {
        match value {
            Some(text) => TupleValue::Text(text.to_string()),
            None => TupleValue::Null,
        }
    }
}

impl MockMessageBuilder {
    pub fn new() -> Self {
        Self {
            lsn: 0x1000,
            timestamp: 750_681_000_000_000, // 2023-10-15 10:30:00 UTC, Postgres epoch
            relations: HashMap::new(),
        }
    }

    pub fn with_lsn(mut self, lsn: u64) -> Self {
        self.lsn = lsn;
        self
    }

    pub fn add_relation(
        mut self,
        id: u32,
        schema: &str,
        table: &str,
        columns: Vec<(&str, u32, bool)>,
    ) -> Self {
        let columns = columns
            .into_iter()
            .map(|(name, type_id, is_key)| MockColumn {
                name: name.to_string(),
                type_id,
                is_key,
            })
            .collect();

        self.relations.insert(
            id,
            MockRelation {
                id,
                schema: schema.to_string(),
                table: table.to_string(),
                columns,
            },
        );
        self
    }

    pub fn begin_message(&self, xid: u32) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(self.lsn); // final LSN
        buf.put_i64(self.timestamp);
        buf.put_u32(xid);
        buf.freeze()
    }

    pub fn commit_message(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(0); // flags
        buf.put_u64(self.lsn);
        buf.put_u64(self.end_lsn());
        buf.put_i64(self.timestamp);
        buf.freeze()
    }

    /// End LSN reported by [`Self::commit_message`].
    pub fn end_lsn(&self) -> u64 {
        self.lsn + 0x30
    }

    pub fn relation_message(&self, rel_id: u32) -> Bytes {
        let relation = self
            .relations
            .get(&rel_id)
            .expect("Relation not found. Use add_relation() first.");

        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(rel_id);
        put_cstring(&mut buf, &relation.schema);
        put_cstring(&mut buf, &relation.table);
        buf.put_u8(b'd'); // replica identity default
        buf.put_u16(relation.columns.len() as u16);

        for column in &relation.columns {
            buf.put_u8(u8::from(column.is_key));
            put_cstring(&mut buf, &column.name);
            buf.put_u32(column.type_id);
            buf.put_i32(-1); // type modifier
        }

        buf.freeze()
    }

    pub fn insert_message(&self, rel_id: u32, values: Vec<(&str, Option<&str>)>) -> Bytes {
        self.insert_tuple(rel_id, text_tuple(values))
    }

    pub fn insert_tuple(&self, rel_id: u32, values: Vec<TupleValue>) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(rel_id);
        buf.put_u8(b'N');
        put_tuple(&mut buf, &values);
        buf.freeze()
    }

    pub fn update_message(
        &self,
        rel_id: u32,
        old_values: Option<Vec<(&str, Option<&str>)>>,
        new_values: Vec<(&str, Option<&str>)>,
    ) -> Bytes {
        self.update_tuple(rel_id, old_values.map(text_tuple), text_tuple(new_values))
    }

    pub fn update_tuple(
        &self,
        rel_id: u32,
        old_values: Option<Vec<TupleValue>>,
        new_values: Vec<TupleValue>,
    ) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(rel_id);

        if let Some(old) = old_values {
            buf.put_u8(b'O');
            put_tuple(&mut buf, &old);
        }

        buf.put_u8(b'N');
        put_tuple(&mut buf, &new_values);
        buf.freeze()
    }

    pub fn delete_message(&self, rel_id: u32, key_values: Vec<(&str, Option<&str>)>) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_u32(rel_id);
        buf.put_u8(b'K');
        put_tuple(&mut buf, &text_tuple(key_values));
        buf.freeze()
    }

    pub fn truncate_message(&self, rel_ids: Vec<u32>) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'T');
        buf.put_u32(rel_ids.len() as u32);
        buf.put_u8(0); // options

        for rel_id in rel_ids {
            buf.put_u32(rel_id);
        }

        buf.freeze()
    }

    /// Wraps a pgoutput payload in an XLogData CopyData frame.
    pub fn xlog_frame(&self, payload: &Bytes) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(self.lsn);
        buf.put_u64(self.end_lsn());
        buf.put_i64(self.timestamp);
        buf.put(payload.as_ref());
        buf.freeze()
    }

    pub fn keepalive_frame(&self, wal_end: u64, reply_requested: bool) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(wal_end);
        buf.put_i64(self.timestamp);
        buf.put_u8(u8::from(reply_requested));
        buf.freeze()
    }

    /// BEGIN, RELATION, INSERT, COMMIT for relation 1.
    pub fn simple_transaction(&self, xid: u32, values: Vec<(&str, Option<&str>)>) -> Vec<Bytes> {
        vec![
            self.begin_message(xid),
            self.relation_message(1),
            self.insert_message(1, values),
            self.commit_message(),
        ]
    }
}

fn put_cstring(buf: &mut BytesMut, value: &str) {
    buf.put(value.as_bytes());
    buf.put_u8(0);
}

fn text_tuple(values: Vec<(&str, Option<&str>)>) -> Vec<TupleValue> {
    values
        .into_iter()
        .map(|(_, value)| TupleValue::from(value))
        .collect()
}

fn put_tuple(buf: &mut BytesMut, values: &[TupleValue]) {
    buf.put_u16(values.len() as u16);

    for value in values {
        match value {
            TupleValue::Null => buf.put_u8(b'n'),
            TupleValue::Unchanged => buf.put_u8(b'u'),
            TupleValue::Text(text) => {
                buf.put_u8(b't');
                buf.put_u32(text.len() as u32);
                buf.put(text.as_bytes());
            }
            TupleValue::Binary(data) => {
                buf.put_u8(b'b');
                buf.put_u32(data.len() as u32);
                buf.put(data.as_slice());
            }
        }
    }
}

/// Common PostgreSQL type OIDs for testing
pub mod type_oids {
    pub const BOOL: u32 = 16;
    pub const INT4: u32 = 23;
    pub const INT8: u32 = 20;
    pub const TEXT: u32 = 25;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const UUID: u32 = 2950;
    pub const JSONB: u32 = 3802;
    pub const NUMERIC: u32 = 1700;
    pub const TEXT_ARRAY: u32 = 1009;
}

/// Predefined test scenarios
pub mod scenarios {
    use super::*;

    /// A `public.items (id, name)` relation; the table most tests stream from.
    pub fn items_builder() -> MockMessageBuilder {
        MockMessageBuilder::new().add_relation(
            1,
            "public",
            "items",
            vec![("id", type_oids::INT4, true), ("name", type_oids::TEXT, false)],
        )
    }

    /// A user table transaction with an insert, update and delete.
    pub fn user_table_transaction() -> (MockMessageBuilder, Vec<Bytes>) {
        let builder = MockMessageBuilder::new().add_relation(
            2,
            "public",
            "users",
            vec![
                ("id", type_oids::INT4, true),
                ("name", type_oids::TEXT, false),
                ("email", type_oids::TEXT, false),
                ("active", type_oids::BOOL, false),
                ("created_at", type_oids::TIMESTAMPTZ, false),
            ],
        );

        let row = |email: &'static str| {
            vec![
                ("id", Some("1")),
                ("name", Some("John Doe")),
                ("email", Some(email)),
                ("active", Some("t")),
                ("created_at", Some("2023-10-15 10:30:00+00")),
            ]
        };

        let messages = vec![
            builder.begin_message(12345),
            builder.relation_message(2),
            builder.insert_message(2, row("john@example.com")),
            builder.update_message(2, Some(row("john@example.com")), row("john.doe@example.com")),
            builder.delete_message(2, vec![
                ("id", Some("1")),
                ("name", None),
                ("email", None),
                ("active", None),
                ("created_at", None),
            ]),
            builder.commit_message(),
        ];

        (builder, messages)
    }
}
