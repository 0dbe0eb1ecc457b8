use postgres_protocol::escape::{escape_identifier, escape_literal};
use tokio_postgres::{Client, SimpleQueryMessage};
use tracing::{debug, info};

use super::slot::CreateStyle;
use super::types::TableName;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicationOptions {
    pub name: String,
    pub create_style: CreateStyle,
    /// Add the target table to an existing publication that lacks it.
    pub reconcile_tables: bool,
}

impl PublicationOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            create_style: CreateStyle::WhenNotExists,
            reconcile_tables: true,
        }
    }

    pub fn create_style(mut self, style: CreateStyle) -> Self {
        self.create_style = style;
        self
    }

    pub fn reconcile_tables(mut self, reconcile: bool) -> Self {
        self.reconcile_tables = reconcile;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicationOutcome {
    /// `CreateStyle::Never`; the catalog was not consulted.
    Skipped,
    Existing,
    Created,
    TableAdded,
    Recreated,
}

/// Manages the publication a subscription streams from.
///
/// Only simple-query statements are issued so the manager works over a
/// replication-mode connection as well as a regular one.
pub struct PublicationManager<'a> {
    client: &'a Client,
}

impl<'a> PublicationManager<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client }
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        let query = format!(
            "SELECT 1 FROM pg_catalog.pg_publication WHERE pubname = {}",
            escape_literal(name)
        );
        self.has_rows(&query).await
    }

    pub async fn contains_table(&self, name: &str, table: &TableName) -> Result<bool> {
        let query = format!(
            "SELECT 1 FROM pg_catalog.pg_publication_tables \
             WHERE pubname = {} AND schemaname = {} AND tablename = {}",
            escape_literal(name),
            escape_literal(&table.schema),
            escape_literal(&table.name)
        );
        self.has_rows(&query).await
    }

    /// Creates `name` for `table` unless a publication with that name exists.
    pub async fn ensure(&self, table: &TableName, name: &str) -> Result<()> {
        if self.exists(name).await? {
            debug!(publication = %name, "Publication already exists");
            return Ok(());
        }
        self.create(table, name).await
    }

    pub async fn setup(
        &self,
        table: &TableName,
        options: &PublicationOptions,
    ) -> Result<PublicationOutcome> {
        let name = options.name.as_str();

        let outcome = match options.create_style {
            CreateStyle::Never => PublicationOutcome::Skipped,
            CreateStyle::WhenNotExists => {
                if !self.exists(name).await? {
                    self.create(table, name).await?;
                    PublicationOutcome::Created
                } else if options.reconcile_tables && !self.contains_table(name, table).await? {
                    self.add_table(table, name).await?;
                    PublicationOutcome::TableAdded
                } else {
                    PublicationOutcome::Existing
                }
            }
            CreateStyle::AlwaysRecreate => {
                self.execute(&format!(
                    "DROP PUBLICATION IF EXISTS {}",
                    escape_identifier(name)
                ))
                .await?;
                self.create(table, name).await?;
                PublicationOutcome::Recreated
            }
        };

        info!(publication = %name, table = %table, ?outcome, "Publication ready");
        Ok(outcome)
    }

    async fn create(&self, table: &TableName, name: &str) -> Result<()> {
        info!(publication = %name, table = %table, "Creating publication");
        self.execute(&format!(
            "CREATE PUBLICATION {} FOR TABLE {}",
            escape_identifier(name),
            table.as_quoted_identifier()
        ))
        .await
    }

    async fn add_table(&self, table: &TableName, name: &str) -> Result<()> {
        info!(publication = %name, table = %table, "Adding table to publication");
        self.execute(&format!(
            "ALTER PUBLICATION {} ADD TABLE {}",
            escape_identifier(name),
            table.as_quoted_identifier()
        ))
        .await
    }

    async fn execute(&self, statement: &str) -> Result<()> {
        self.client
            .simple_query(statement)
            .await
            .map(|_| ())
            .map_err(|e| Error::provisioning(format!("`{}` failed: {}", statement, e)))
    }

    async fn has_rows(&self, query: &str) -> Result<bool> {
        let messages = self
            .client
            .simple_query(query)
            .await
            .map_err(|e| Error::provisioning(format!("catalog lookup failed: {}", e)))?;

        Ok(messages
            .iter()
            .any(|message| matches!(message, SimpleQueryMessage::Row(_))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publication_options_defaults() {
        let options = PublicationOptions::new("trips_pub");
        assert_eq!(options.name, "trips_pub");
        assert_eq!(options.create_style, CreateStyle::WhenNotExists);
        assert!(options.reconcile_tables);

        let options = options
            .create_style(CreateStyle::Never)
            .reconcile_tables(false);
        assert_eq!(options.create_style, CreateStyle::Never);
        assert!(!options.reconcile_tables);
    }
}
