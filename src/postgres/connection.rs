use bytes::Bytes;
use postgres_protocol::escape::{escape_identifier, escape_literal};
use tokio::task::JoinHandle;
use tokio_postgres::config::ReplicationMode;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use tracing::{debug, error, info};

use super::replication::{ReplicationStream, StreamSettings};
use crate::lsn::Lsn;
use crate::{Error, Result};

/// A regular (non-replication) connection with its driver task.
pub struct PgConnection {
    client: Client,
    connection_task: JoinHandle<()>,
}

impl PgConnection {
    pub async fn connect(config: &Config) -> Result<Self> {
        let (client, connection) = config.connect(NoTls).await?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Connection error: {}", e);
            }
        });

        debug!("Connected to PostgreSQL");

        Ok(Self {
            client,
            connection_task,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn close(self) {
        drop(self.client);
        self.connection_task.abort();
    }
}

/// A connection opened in logical replication mode.
///
/// Accepts replication commands (`IDENTIFY_SYSTEM`, `CREATE_REPLICATION_SLOT`,
/// `START_REPLICATION`, ...) as well as plain SQL over the simple query
/// protocol.
pub struct ReplicationConnection {
    client: Client,
    connection_task: JoinHandle<()>,
}

impl ReplicationConnection {
    pub async fn connect(config: &Config) -> Result<Self> {
        info!("Creating replication connection to PostgreSQL");

        let mut config = config.clone();
        config.replication_mode(ReplicationMode::Logical);

        let (client, connection) = config.connect(NoTls).await?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Replication connection error: {}", e);
            }
        });

        info!("Successfully connected to PostgreSQL in replication mode");

        Ok(Self {
            client,
            connection_task,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn simple_query(&self, query: &str) -> Result<Vec<SimpleQueryRow>> {
        let rows = self
            .client
            .simple_query(query)
            .await?
            .into_iter()
            .filter_map(|message| match message {
                SimpleQueryMessage::Row(row) => Some(row),
                _ => None,
            })
            .collect();

        Ok(rows)
    }

    pub async fn identify_system(&self) -> Result<SystemInfo> {
        debug!("Sending IDENTIFY_SYSTEM command");

        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows.first().ok_or_else(|| Error::Protocol(
            "IDENTIFY_SYSTEM returned no rows".to_string(),
        ))?;

        let info = SystemInfo {
            system_id: row.try_get("systemid")?.unwrap_or_default().to_string(),
            timeline: row
                .try_get("timeline")?
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
            xlogpos: match row.try_get("xlogpos")? {
                Some(pos) => Lsn::parse(pos)?,
                None => Lsn::ZERO,
            },
            dbname: row.try_get("dbname")?.map(|s| s.to_string()),
        };

        debug!("System info: {:?}", info);
        Ok(info)
    }

    /// Starts streaming changes from `slot_name`, consuming the connection.
    pub async fn start_replication(
        self,
        slot_name: &str,
        publication_name: &str,
        start_lsn: Lsn,
        settings: StreamSettings,
    ) -> Result<ReplicationStream> {
        info!(
            slot = %slot_name,
            publication = %publication_name,
            lsn = %start_lsn,
            "Starting logical replication"
        );

        let query = format!(
            r#"START_REPLICATION SLOT {} LOGICAL {} ("proto_version" '1', "publication_names" {})"#,
            escape_identifier(slot_name),
            start_lsn,
            escape_literal(&escape_identifier(publication_name)),
        );

        let duplex = match self.client.copy_both_simple::<Bytes>(&query).await {
            Ok(duplex) => duplex,
            Err(e) => {
                error!("Failed to start replication: {}", e);
                return Err(match e.code() {
                    Some(code) if *code == SqlState::OBJECT_IN_USE => Error::SlotInUse {
                        slot: slot_name.to_string(),
                    },
                    Some(code) if *code == SqlState::UNDEFINED_OBJECT => {
                        Error::provisioning(format!(
                            "replication slot '{}' or publication '{}' does not exist",
                            slot_name, publication_name
                        ))
                    }
                    _ => Error::Postgres(e),
                });
            }
        };

        Ok(ReplicationStream::new(self, duplex, start_lsn, settings))
    }

    pub fn close(self) {
        info!("Closing replication connection");
        drop(self.client);
        self.connection_task.abort();
    }
}

#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub system_id: String,
    pub timeline: i32,
    pub xlogpos: Lsn,
    pub dbname: Option<String>,
}
