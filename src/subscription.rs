//! Table subscriptions: a consistent snapshot followed by the live stream.
//!
//! A [`Subscription`] provisions the publication and replication slot, drains
//! the snapshot exported by a freshly created slot, then streams changes from
//! the slot's consistent point. Every row reaches the caller exactly once
//! through a single pull-based sequence.
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use pg_subscription::cancel::cancellation;
//! use pg_subscription::mapper::{JsonMapper, NameTransformation};
//! use pg_subscription::subscription::{subscribe, SubscriptionOptions};
//!
//! # async fn run() -> pg_subscription::Result<()> {
//! let connection: tokio_postgres::Config =
//!     "host=localhost user=postgres dbname=fleet".parse()?;
//! let options = SubscriptionOptions::new(
//!     connection,
//!     "trips_slot",
//!     "trips_pub",
//!     "public.trips",
//!     JsonMapper::new(NameTransformation::Identity),
//! )?;
//!
//! let (_cancel, cancel_rx) = cancellation();
//! let mut events = Box::pin(subscribe(options, cancel_rx));
//! while let Some(event) = events.next().await {
//!     let event = event?;
//!     println!("{} {:?} {}", event.kind, event.position, event.value);
//! }
//! # Ok(())
//! # }
//! ```

use futures::Stream;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cancel::CancelRx;
use crate::config::Config;
use crate::lsn::Lsn;
use crate::mapper::{DataMapper, MappingErrorPolicy};
use crate::postgres::{
    is_valid_identifier, is_valid_slot_name, ChangeKind, CreateReplicationSlotResult,
    CreateStyle, PublicationManager, PublicationOptions, ReplicationConnection,
    ReplicationSlotManager, ReplicationStream, RowChange, SnapshotReader, SnapshotRows,
    StreamSettings, TableName,
};
use crate::{Error, Result};

/// Everything needed to subscribe to one table.
pub struct SubscriptionOptions<M> {
    pub connection: tokio_postgres::Config,
    pub slot_name: String,
    pub publication: PublicationOptions,
    pub table: TableName,
    pub slot_create_style: CreateStyle,
    pub mapper: M,
    pub mapping_error_policy: MappingErrorPolicy,
    /// Deliver deletes, mapped from the row's before-image.
    pub include_deletes: bool,
    /// Resume position when the slot already exists. `None` lets the server
    /// resume from the slot's confirmed position.
    pub start_lsn: Option<Lsn>,
    pub stream_settings: StreamSettings,
}

impl<M> SubscriptionOptions<M> {
    pub fn new(
        connection: tokio_postgres::Config,
        slot_name: &str,
        publication_name: &str,
        table_name: &str,
        mapper: M,
    ) -> Result<Self> {
        let options = Self {
            connection,
            slot_name: slot_name.to_string(),
            publication: PublicationOptions::new(publication_name),
            table: TableName::parse(table_name)?,
            slot_create_style: CreateStyle::default(),
            mapper,
            mapping_error_policy: MappingErrorPolicy::default(),
            include_deletes: false,
            start_lsn: None,
            stream_settings: StreamSettings::default(),
        };
        options.validate()?;
        Ok(options)
    }

    /// Builds options from a loaded configuration file.
    pub fn from_config(config: &Config, mapper: M) -> Result<Self> {
        config.validate()?;
        let sub = &config.subscription;

        let mut options = Self::new(
            config.connection_config()?,
            &sub.slot_name,
            &sub.publication_name,
            &sub.table_name,
            mapper,
        )?
        .slot_create_style(sub.slot_create_style)
        .publication_create_style(sub.publication_create_style)
        .reconcile_publication_tables(sub.reconcile_publication_tables)
        .mapping_error_policy(sub.mapping_error_policy)
        .include_deletes(sub.include_deletes)
        .stream_settings(StreamSettings {
            status_interval: Duration::from_millis(sub.status_interval_ms),
            close_timeout: Duration::from_millis(sub.close_timeout_ms),
        });
        options.start_lsn = sub.start_lsn;

        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_slot_name(&self.slot_name) {
            return Err(Error::Config(format!(
                "invalid replication slot name '{}'",
                self.slot_name
            )));
        }
        if !is_valid_identifier(&self.publication.name) {
            return Err(Error::Config(format!(
                "invalid publication name '{}'",
                self.publication.name
            )));
        }
        Ok(())
    }

    pub fn slot_create_style(mut self, style: CreateStyle) -> Self {
        self.slot_create_style = style;
        self
    }

    pub fn publication_create_style(mut self, style: CreateStyle) -> Self {
        self.publication.create_style = style;
        self
    }

    pub fn reconcile_publication_tables(mut self, reconcile: bool) -> Self {
        self.publication.reconcile_tables = reconcile;
        self
    }

    pub fn mapping_error_policy(mut self, policy: MappingErrorPolicy) -> Self {
        self.mapping_error_policy = policy;
        self
    }

    pub fn include_deletes(mut self, include: bool) -> Self {
        self.include_deletes = include;
        self
    }

    pub fn start_lsn(mut self, lsn: Lsn) -> Self {
        self.start_lsn = Some(lsn);
        self
    }

    pub fn stream_settings(mut self, settings: StreamSettings) -> Self {
        self.stream_settings = settings;
        self
    }
}

/// One delivered row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MappedEvent<T> {
    pub kind: ChangeKind,
    /// Commit position; `None` for snapshot rows.
    pub position: Option<Lsn>,
    pub value: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Provisioning,
    SnapshotDraining,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl SubscriptionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionState::Completed | SubscriptionState::Failed | SubscriptionState::Cancelled
        )
    }
}

enum Phase {
    Idle,
    Snapshot {
        rows: SnapshotRows,
        replication: ReplicationConnection,
        start_lsn: Lsn,
    },
    Streaming(ReplicationStream),
    Finished,
}

impl Phase {
    fn state(&self) -> SubscriptionState {
        match self {
            Phase::Idle => SubscriptionState::Idle,
            Phase::Snapshot { .. } => SubscriptionState::SnapshotDraining,
            Phase::Streaming(_) => SubscriptionState::Streaming,
            Phase::Finished => SubscriptionState::Completed,
        }
    }
}

/// A pull-based, cancellable subscription to one table.
///
/// Nothing happens until the first call to [`Subscription::next`]. Each
/// phase owns its database connection and releases it when the phase ends,
/// on every exit path.
pub struct Subscription<M: DataMapper> {
    options: SubscriptionOptions<M>,
    cancel: CancelRx,
    phase: Phase,
    state: SubscriptionState,
}

impl<M: DataMapper> Subscription<M> {
    pub fn new(options: SubscriptionOptions<M>, cancel: CancelRx) -> Self {
        Self {
            options,
            cancel,
            phase: Phase::Idle,
            state: SubscriptionState::Idle,
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Position acknowledged to the server so far, once streaming.
    pub fn flushed_lsn(&self) -> Option<Lsn> {
        match &self.phase {
            Phase::Streaming(stream) => Some(stream.flushed_lsn()),
            _ => None,
        }
    }

    /// Pulls the next event.
    ///
    /// `None` ends the sequence: after cancellation, after the server ends
    /// the stream, or after an error has been returned.
    pub async fn next(&mut self) -> Option<Result<MappedEvent<M::Output>>> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Finished) {
                Phase::Finished => return None,
                Phase::Idle => {
                    self.state = SubscriptionState::Provisioning;
                    match race(&mut self.cancel, provision(&self.options)).await {
                        Some(Ok(phase)) => self.enter(phase),
                        Some(Err(e)) => return self.fail(e).await,
                        None => return self.cancelled(),
                    }
                }
                Phase::Snapshot {
                    mut rows,
                    replication,
                    start_lsn,
                } => match race(&mut self.cancel, rows.next_row()).await {
                    Some(Ok(Some(change))) => {
                        self.phase = Phase::Snapshot {
                            rows,
                            replication,
                            start_lsn,
                        };
                        match self.map_change(change) {
                            Ok(Some(event)) => return Some(Ok(event)),
                            Ok(None) => {}
                            Err(e) => return self.fail(e).await,
                        }
                    }
                    Some(Ok(None)) => {
                        info!(
                            table = %self.options.table,
                            rows = rows.rows_read(),
                            lsn = %start_lsn,
                            "Snapshot drained, switching to live stream"
                        );
                        let started = race(
                            &mut self.cancel,
                            replication.start_replication(
                                &self.options.slot_name,
                                &self.options.publication.name,
                                start_lsn,
                                self.options.stream_settings,
                            ),
                        )
                        .await;
                        match started {
                            Some(Ok(stream)) => self.enter(Phase::Streaming(stream)),
                            Some(Err(e)) => return self.fail(e).await,
                            None => return self.cancelled(),
                        }
                    }
                    Some(Err(e)) => {
                        rows.abandon();
                        replication.close();
                        return self.fail(e).await;
                    }
                    None => {
                        rows.abandon();
                        replication.close();
                        return self.cancelled();
                    }
                },
                Phase::Streaming(mut stream) => {
                    match race(&mut self.cancel, stream.next_change()).await {
                        Some(Ok(Some(change))) => {
                            self.phase = Phase::Streaming(stream);
                            match self.map_change(change) {
                                Ok(Some(event)) => return Some(Ok(event)),
                                Ok(None) => {}
                                Err(e) => return self.fail(e).await,
                            }
                        }
                        Some(Ok(None)) => {
                            stream.close().await;
                            self.state = SubscriptionState::Completed;
                            info!(slot = %self.options.slot_name, "Subscription completed");
                            return None;
                        }
                        Some(Err(e)) => {
                            stream.close().await;
                            return self.fail(e).await;
                        }
                        None => {
                            stream.close().await;
                            return self.cancelled();
                        }
                    }
                }
            }
        }
    }

    /// Turns the subscription into a [`Stream`] of events.
    pub fn into_stream(self) -> impl Stream<Item = Result<MappedEvent<M::Output>>> {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|event| (event, subscription))
        })
    }

    fn enter(&mut self, phase: Phase) {
        self.state = phase.state();
        debug!(state = ?self.state, "Subscription state changed");
        self.phase = phase;
    }

    fn map_change(&self, change: RowChange) -> Result<Option<MappedEvent<M::Output>>> {
        if change.table != self.options.table {
            debug!(table = %change.table, "Dropping change for another table");
            return Ok(None);
        }

        let values = match change.kind {
            ChangeKind::Insert | ChangeKind::Update => change.after,
            ChangeKind::Delete if self.options.include_deletes => change.before,
            ChangeKind::Delete => return Ok(None),
        };
        let Some(values) = values else {
            debug!(kind = %change.kind, "Change carries no row image");
            return Ok(None);
        };

        match self.options.mapper.map(&values) {
            Ok(value) => Ok(Some(MappedEvent {
                kind: change.kind,
                position: change.position,
                value,
            })),
            Err(e @ Error::Mapping { .. })
                if self.options.mapping_error_policy == MappingErrorPolicy::Skip =>
            {
                warn!(
                    kind = %change.kind,
                    position = ?change.position,
                    "Skipping row that could not be mapped: {}",
                    e
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn fail(&mut self, e: Error) -> Option<Result<MappedEvent<M::Output>>> {
        self.release().await;
        self.state = SubscriptionState::Failed;
        error!(slot = %self.options.slot_name, "Subscription failed: {}", e);
        Some(Err(e))
    }

    fn cancelled(&mut self) -> Option<Result<MappedEvent<M::Output>>> {
        self.state = SubscriptionState::Cancelled;
        info!(slot = %self.options.slot_name, "Subscription cancelled");
        None
    }

    async fn release(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Finished) {
            Phase::Snapshot {
                rows, replication, ..
            } => {
                rows.abandon();
                replication.close();
            }
            Phase::Streaming(stream) => stream.close().await,
            Phase::Idle | Phase::Finished => {}
        }
    }
}

/// Subscribes and returns the event stream directly.
pub fn subscribe<M: DataMapper>(
    options: SubscriptionOptions<M>,
    cancel: CancelRx,
) -> impl Stream<Item = Result<MappedEvent<M::Output>>> {
    Subscription::new(options, cancel).into_stream()
}

/// Runs `fut` unless cancellation wins first.
async fn race<F: Future>(cancel: &mut CancelRx, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = fut => Some(output),
    }
}

async fn provision<M>(options: &SubscriptionOptions<M>) -> Result<Phase> {
    options.validate()?;

    info!(
        slot = %options.slot_name,
        publication = %options.publication.name,
        table = %options.table,
        "Provisioning subscription"
    );

    let replication = ReplicationConnection::connect(&options.connection).await?;

    let slot = async {
        PublicationManager::new(replication.client())
            .setup(&options.table, &options.publication)
            .await?;
        ReplicationSlotManager::new(&replication)
            .ensure(&options.slot_name, &options.table, options.slot_create_style)
            .await
    }
    .await;

    let slot = match slot {
        Ok(slot) => slot,
        Err(e) => {
            replication.close();
            return Err(e);
        }
    };

    match slot {
        CreateReplicationSlotResult::Created {
            table,
            snapshot_name,
            consistent_point,
        } => {
            let reader = SnapshotReader::new(options.connection.clone());
            match reader.read_rows(&snapshot_name, &table).await {
                Ok(rows) => {
                    info!(
                        "Reading snapshot {} of {} ({} columns)",
                        snapshot_name,
                        table,
                        rows.columns().len()
                    );
                    Ok(Phase::Snapshot {
                        rows,
                        replication,
                        start_lsn: consistent_point,
                    })
                }
                Err(e) => {
                    replication.close();
                    Err(e)
                }
            }
        }
        CreateReplicationSlotResult::AlreadyExists => {
            let start_lsn = options.start_lsn.unwrap_or(Lsn::ZERO);
            let stream = replication
                .start_replication(
                    &options.slot_name,
                    &options.publication.name,
                    start_lsn,
                    options.stream_settings,
                )
                .await?;
            Ok(Phase::Streaming(stream))
        }
    }
}
