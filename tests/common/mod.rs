#![allow(dead_code)]

use pg_subscription::config::{Config, PostgresConfig, SslMode, SubscriptionConfig};
use pg_subscription::mapper::{FlatObjectMapper, NameTransformation};
use pg_subscription::{flat_record, SubscriptionOptions};
use std::env;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio_postgres::{Client, NoTls};

static NEXT_ID: AtomicU32 = AtomicU32::new(0);

flat_record! {
    #[derive(Debug, Clone, PartialEq)]
    pub struct Item {
        pub id: i32,
        pub name: String,
    }
}

/// Get test configuration from environment variables
pub fn get_test_config(prefix: &str) -> Config {
    let suffix = format!(
        "{}_{}_{}",
        prefix,
        std::process::id(),
        NEXT_ID.fetch_add(1, Ordering::Relaxed)
    );

    let postgres = PostgresConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        connect_timeout_secs: 10,
        ssl_mode: SslMode::Disable,
    };

    let subscription = SubscriptionConfig {
        slot_name: format!("slot_{}", suffix),
        publication_name: format!("pub_{}", suffix),
        table_name: format!("public.items_{}", suffix),
        slot_create_style: Default::default(),
        publication_create_style: Default::default(),
        reconcile_publication_tables: true,
        mapping_error_policy: Default::default(),
        include_deletes: false,
        status_interval_ms: 200,
        close_timeout_ms: 2000,
        start_lsn: None,
    };

    Config {
        postgres,
        subscription,
    }
}

/// A scratch `items` table with its own slot and publication names.
pub struct TestTable {
    pub client: Client,
    pub config: Config,
}

impl TestTable {
    pub async fn create(prefix: &str) -> Self {
        let config = get_test_config(prefix);
        let (client, connection) = config
            .connection_config()
            .unwrap()
            .connect(NoTls)
            .await
            .expect("Failed to connect to test database");
        tokio::spawn(async move {
            let _ = connection.await;
        });

        client
            .batch_execute(&format!(
                "CREATE TABLE {} (id INT PRIMARY KEY, name TEXT)",
                config.subscription.table_name
            ))
            .await
            .unwrap();

        Self { client, config }
    }

    pub fn table(&self) -> &str {
        &self.config.subscription.table_name
    }

    pub fn slot(&self) -> &str {
        &self.config.subscription.slot_name
    }

    pub fn publication(&self) -> &str {
        &self.config.subscription.publication_name
    }

    pub fn connection_config(&self) -> tokio_postgres::Config {
        self.config.connection_config().unwrap()
    }

    pub fn options(&self) -> SubscriptionOptions<FlatObjectMapper<Item>> {
        SubscriptionOptions::from_config(
            &self.config,
            FlatObjectMapper::new(NameTransformation::Identity),
        )
        .unwrap()
    }

    pub async fn execute(&self, sql: &str) {
        self.client
            .batch_execute(&sql.replace("{table}", self.table()))
            .await
            .unwrap();
    }

    pub async fn slot_active(&self) -> Option<bool> {
        self.client
            .query_opt(
                "SELECT active FROM pg_replication_slots WHERE slot_name = $1",
                &[&self.slot()],
            )
            .await
            .unwrap()
            .map(|row| row.get(0))
    }

    /// Polls until no backend holds the slot. Returns false on timeout.
    pub async fn wait_slot_released(&self) -> bool {
        for _ in 0..20 {
            if self.slot_active().await != Some(true) {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }
        false
    }

    pub async fn cleanup(&self) {
        let _ = self
            .client
            .execute(
                "SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots \
                 WHERE slot_name = $1 AND NOT active",
                &[&self.slot()],
            )
            .await;
        let _ = self
            .client
            .batch_execute(&format!(
                "DROP PUBLICATION IF EXISTS {}; DROP TABLE IF EXISTS {}",
                self.publication(),
                self.table()
            ))
            .await;
    }
}
