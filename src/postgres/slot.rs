use postgres_protocol::escape::{escape_identifier, escape_literal};
use serde::{Deserialize, Serialize};
use tokio_postgres::error::SqlState;
use tracing::{debug, info, warn};

use super::connection::ReplicationConnection;
use super::types::TableName;
use crate::lsn::Lsn;
use crate::{Error, Result};

/// Creation policy for publications and replication slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateStyle {
    /// The object is provisioned out of band; never touch the catalog.
    Never,
    /// Reuse the object if present, otherwise create it.
    #[default]
    WhenNotExists,
    /// Drop and create unconditionally. Loses the slot's retained position.
    AlwaysRecreate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateReplicationSlotResult {
    /// No snapshot was exported; only live changes are available.
    AlreadyExists,
    Created {
        table: TableName,
        snapshot_name: String,
        consistent_point: Lsn,
    },
}

/// Row of `pg_replication_slots` for one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub active: bool,
    pub active_pid: Option<i32>,
    pub confirmed_flush_lsn: Option<Lsn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotAction {
    Reuse,
    Create,
    DropAndCreate { terminate: Option<i32> },
}

fn plan(style: CreateStyle, slot_name: &str, existing: Option<&SlotInfo>) -> Result<SlotAction> {
    match (style, existing) {
        (CreateStyle::Never, _) => Ok(SlotAction::Reuse),
        (_, None) => Ok(SlotAction::Create),
        (CreateStyle::WhenNotExists, Some(info)) if info.active => Err(Error::SlotInUse {
            slot: slot_name.to_string(),
        }),
        (CreateStyle::WhenNotExists, Some(_)) => Ok(SlotAction::Reuse),
        (CreateStyle::AlwaysRecreate, Some(info)) => Ok(SlotAction::DropAndCreate {
            terminate: if info.active { info.active_pid } else { None },
        }),
    }
}

fn claim_query(slot_name: &str) -> String {
    format!(
        "SELECT pg_try_advisory_lock(hashtext('pg_subscription'), hashtext({}))",
        escape_literal(slot_name)
    )
}

/// Ensures a logical replication slot exists according to a [`CreateStyle`].
pub struct ReplicationSlotManager<'a> {
    connection: &'a ReplicationConnection,
}

impl<'a> ReplicationSlotManager<'a> {
    pub fn new(connection: &'a ReplicationConnection) -> Self {
        Self { connection }
    }

    /// Looks the slot up in `pg_replication_slots`.
    pub async fn find(&self, slot_name: &str) -> Result<Option<SlotInfo>> {
        let query = format!(
            "SELECT active, active_pid, confirmed_flush_lsn FROM pg_replication_slots \
             WHERE slot_name = {}",
            escape_literal(slot_name)
        );

        let rows = self
            .connection
            .simple_query(&query)
            .await
            .map_err(|e| Error::provisioning(format!("failed to inspect slot '{}': {}", slot_name, e)))?;

        let Some(row) = rows.first() else {
            return Ok(None);
        };

        let confirmed_flush_lsn = match row.try_get("confirmed_flush_lsn")? {
            Some(lsn) => Some(Lsn::parse(lsn)?),
            None => None,
        };

        Ok(Some(SlotInfo {
            active: row.try_get("active")? == Some("t"),
            active_pid: row.try_get("active_pid")?.and_then(|s| s.parse().ok()),
            confirmed_flush_lsn,
        }))
    }

    /// Makes sure `slot_name` exists.
    ///
    /// A freshly created slot exports a snapshot that stays valid only until
    /// this connection runs its next command.
    pub async fn ensure(
        &self,
        slot_name: &str,
        table: &TableName,
        style: CreateStyle,
    ) -> Result<CreateReplicationSlotResult> {
        if style != CreateStyle::AlwaysRecreate {
            self.claim(slot_name).await?;
        }

        let existing = match style {
            CreateStyle::Never => None,
            _ => self.find(slot_name).await?,
        };

        match plan(style, slot_name, existing.as_ref())? {
            SlotAction::Reuse => {
                info!(slot = %slot_name, ?style, "Using existing replication slot");
                Ok(CreateReplicationSlotResult::AlreadyExists)
            }
            SlotAction::Create => self.create(slot_name, table).await,
            SlotAction::DropAndCreate { terminate } => {
                if let Some(pid) = terminate {
                    self.terminate_backend(slot_name, pid).await?;
                }
                self.drop_slot(slot_name).await?;
                self.create(slot_name, table).await
            }
        }
    }

    /// Takes the session advisory lock for `slot_name`, held until this
    /// connection closes. A new slot reads inactive in `pg_replication_slots`
    /// while its snapshot drains; the lock covers that window.
    async fn claim(&self, slot_name: &str) -> Result<()> {
        let rows = self
            .connection
            .simple_query(&claim_query(slot_name))
            .await
            .map_err(|e| Error::provisioning(format!("failed to claim slot '{}': {}", slot_name, e)))?;

        match rows.first().map(|row| row.try_get(0)).transpose()?.flatten() {
            Some("t") => {
                debug!(slot = %slot_name, "Claimed replication slot");
                Ok(())
            }
            _ => Err(Error::SlotInUse {
                slot: slot_name.to_string(),
            }),
        }
    }

    async fn create(&self, slot_name: &str, table: &TableName) -> Result<CreateReplicationSlotResult> {
        let query = format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL pgoutput EXPORT_SNAPSHOT",
            escape_identifier(slot_name)
        );

        let rows = match self.connection.simple_query(&query).await {
            Ok(rows) => rows,
            Err(Error::Postgres(e)) if e.code() == Some(&SqlState::DUPLICATE_OBJECT) => {
                return Err(Error::provisioning(format!(
                    "replication slot '{}' was created concurrently",
                    slot_name
                )));
            }
            Err(e) => {
                return Err(Error::provisioning(format!(
                    "failed to create replication slot '{}': {}",
                    slot_name, e
                )));
            }
        };

        let row = rows.first().ok_or_else(|| {
            Error::Protocol("CREATE_REPLICATION_SLOT returned no rows".to_string())
        })?;

        let consistent_point = Lsn::parse(row.try_get("consistent_point")?.ok_or_else(|| {
            Error::Protocol("CREATE_REPLICATION_SLOT returned no consistent point".to_string())
        })?)?;
        let snapshot_name = row
            .try_get("snapshot_name")?
            .ok_or_else(|| {
                Error::Protocol("CREATE_REPLICATION_SLOT returned no snapshot".to_string())
            })?
            .to_string();

        info!(
            slot = %slot_name,
            snapshot = %snapshot_name,
            lsn = %consistent_point,
            "Created replication slot"
        );

        Ok(CreateReplicationSlotResult::Created {
            table: table.clone(),
            snapshot_name,
            consistent_point,
        })
    }

    async fn terminate_backend(&self, slot_name: &str, pid: i32) -> Result<()> {
        warn!(slot = %slot_name, pid, "Terminating backend holding replication slot");

        self.connection
            .simple_query(&format!("SELECT pg_terminate_backend({})", pid))
            .await
            .map_err(|e| {
                Error::provisioning(format!(
                    "failed to terminate backend {} holding slot '{}': {}",
                    pid, slot_name, e
                ))
            })?;
        Ok(())
    }

    /// Drops the slot, waiting for an active consumer to release it.
    pub async fn drop_slot(&self, slot_name: &str) -> Result<()> {
        let query = format!("DROP_REPLICATION_SLOT {} WAIT", escape_identifier(slot_name));

        match self.connection.simple_query(&query).await {
            Ok(_) => {
                info!(slot = %slot_name, "Dropped replication slot");
                Ok(())
            }
            Err(Error::Postgres(e)) if e.code() == Some(&SqlState::UNDEFINED_OBJECT) => {
                debug!(slot = %slot_name, "Replication slot already gone");
                Ok(())
            }
            Err(e) => Err(Error::provisioning(format!(
                "failed to drop replication slot '{}': {}",
                slot_name, e
            ))),
        }
    }
}
