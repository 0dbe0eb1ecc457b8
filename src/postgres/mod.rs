pub mod connection;
pub mod decoder;
pub mod publication;
pub mod replication;
pub mod slot;
pub mod snapshot;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use connection::{PgConnection, ReplicationConnection, SystemInfo};
pub use decoder::{ColumnInfo, DecodedMessage, PgOutputDecoder, RelationInfo};
pub use publication::{PublicationManager, PublicationOptions, PublicationOutcome};
pub use replication::{ReplicationFrame, ReplicationStream, StreamSettings};
pub use slot::{CreateReplicationSlotResult, CreateStyle, ReplicationSlotManager, SlotInfo};
pub use snapshot::{SnapshotReader, SnapshotRows};
pub use types::*;
