use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio_postgres::CopyBothDuplex;
use tracing::{debug, info, trace, warn};

use super::connection::ReplicationConnection;
use super::decoder::{DecodedMessage, PgOutputDecoder};
use super::types::RowChange;
use crate::lsn::Lsn;
use crate::{Error, Result};

/// Tuning for the live replication stream.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    /// Minimum spacing between unsolicited standby status updates.
    pub status_interval: Duration,
    /// Upper bound on a graceful close before the connection is torn down.
    pub close_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(1),
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// CopyData payloads sent by the server during streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationFrame {
    XLogData {
        wal_start: Lsn,
        wal_end: Lsn,
        server_time_micros: i64,
        data: Bytes,
    },
    KeepAlive {
        wal_end: Lsn,
        server_time_micros: i64,
        reply_requested: bool,
    },
}

impl ReplicationFrame {
    pub fn parse(mut data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::invalid_message("Empty message"));
        }

        let tag = data.get_u8();

        match tag {
            b'w' => {
                if data.remaining() < 24 {
                    return Err(Error::invalid_message("Invalid XLogData header size"));
                }

                let wal_start = Lsn(data.get_u64());
                let wal_end = Lsn(data.get_u64());
                let server_time_micros = data.get_i64();

                Ok(ReplicationFrame::XLogData {
                    wal_start,
                    wal_end,
                    server_time_micros,
                    data,
                })
            }
            b'k' => {
                if data.remaining() < 17 {
                    return Err(Error::invalid_message("Invalid keepalive message size"));
                }

                let wal_end = Lsn(data.get_u64());
                let server_time_micros = data.get_i64();
                let reply_requested = data.get_u8() != 0;

                Ok(ReplicationFrame::KeepAlive {
                    wal_end,
                    server_time_micros,
                    reply_requested,
                })
            }
            _ => Err(Error::invalid_message(format!(
                "Unknown message tag: {}",
                tag
            ))),
        }
    }
}

/// Encodes a standby status update (`r`) message.
pub fn encode_standby_status_update(
    write: Lsn,
    flush: Lsn,
    apply: Lsn,
    client_time_micros: i64,
    reply_requested: bool,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(b'r');
    buf.put_u64(write.0);
    buf.put_u64(flush.0);
    buf.put_u64(apply.0);
    buf.put_i64(client_time_micros);
    buf.put_u8(u8::from(reply_requested));
    buf.freeze()
}

/// Seconds between the Unix epoch and 2000-01-01 00:00:00 UTC.
const POSTGRES_EPOCH_OFFSET_SECS: i64 = 946_684_800;

/// Microseconds since 2000-01-01 00:00:00 UTC, the server's clock epoch.
pub fn postgres_epoch_micros() -> i64 {
    Utc::now().timestamp_micros() - POSTGRES_EPOCH_OFFSET_SECS * 1_000_000
}

/// Received and delivered positions for one stream.
///
/// `flushed` only moves to a transaction's end position once every change
/// of that transaction has been handed out, which is the case when its
/// COMMIT is decoded on a later pull.
#[derive(Debug)]
pub(crate) struct Progress {
    received: Lsn,
    flushed: Lsn,
    in_transaction: bool,
    last_sent: Option<(Instant, Lsn)>,
    interval: Duration,
}

impl Progress {
    pub(crate) fn new(start: Lsn, interval: Duration) -> Self {
        Self {
            received: start,
            flushed: start,
            in_transaction: false,
            last_sent: None,
            interval,
        }
    }

    pub(crate) fn received(&mut self, lsn: Lsn) {
        self.received = self.received.max(lsn);
    }

    pub(crate) fn begin(&mut self) {
        self.in_transaction = true;
    }

    pub(crate) fn commit(&mut self, end_lsn: Lsn) {
        self.in_transaction = false;
        self.flushed = self.flushed.max(end_lsn);
        self.received(end_lsn);
    }

    /// Keepalives between transactions confirm everything before `wal_end`.
    pub(crate) fn keepalive(&mut self, wal_end: Lsn) {
        self.received(wal_end);
        if !self.in_transaction {
            self.flushed = self.flushed.max(wal_end);
        }
    }

    pub(crate) fn flushed(&self) -> Lsn {
        self.flushed
    }

    pub(crate) fn should_send(&self, force: bool, now: Instant) -> bool {
        if force {
            return true;
        }
        match self.last_sent {
            None => !self.flushed.is_zero(),
            Some((at, flushed)) => {
                self.flushed > flushed && now.duration_since(at) >= self.interval
            }
        }
    }

    pub(crate) fn mark_sent(&mut self, now: Instant) {
        self.last_sent = Some((now, self.flushed));
    }

    pub(crate) fn status_update(&self, reply_requested: bool) -> Bytes {
        encode_standby_status_update(
            self.received,
            self.flushed,
            self.flushed,
            postgres_epoch_micros(),
            reply_requested,
        )
    }
}

/// Live change stream over a started replication slot.
pub struct ReplicationStream {
    connection: ReplicationConnection,
    duplex: Pin<Box<CopyBothDuplex<Bytes>>>,
    decoder: PgOutputDecoder,
    progress: Progress,
    settings: StreamSettings,
}

impl ReplicationStream {
    pub(crate) fn new(
        connection: ReplicationConnection,
        duplex: CopyBothDuplex<Bytes>,
        start_lsn: Lsn,
        settings: StreamSettings,
    ) -> Self {
        Self {
            connection,
            duplex: Box::pin(duplex),
            decoder: PgOutputDecoder::new(),
            progress: Progress::new(start_lsn, settings.status_interval),
            settings,
        }
    }

    /// Highest position acknowledged as delivered.
    pub fn flushed_lsn(&self) -> Lsn {
        self.progress.flushed()
    }

    /// Waits for the next row change.
    ///
    /// Returns `Ok(None)` when the server ends the stream.
    pub async fn next_change(&mut self) -> Result<Option<RowChange>> {
        loop {
            let data = match self.duplex.next().await {
                Some(Ok(data)) => data,
                Some(Err(e)) => {
                    return Err(Error::StreamInterrupted {
                        message: e.to_string(),
                    });
                }
                None => {
                    info!("Replication stream ended by the server");
                    return Ok(None);
                }
            };

            let mut reply_requested = false;

            match ReplicationFrame::parse(data)? {
                ReplicationFrame::XLogData {
                    wal_start, data, ..
                } => {
                    self.progress.received(wal_start);

                    match self.decoder.decode(&data)? {
                        Some(DecodedMessage::Begin { .. }) => self.progress.begin(),
                        Some(DecodedMessage::Commit { end_lsn, .. }) => {
                            self.progress.commit(end_lsn)
                        }
                        Some(DecodedMessage::Change(change)) => return Ok(Some(change)),
                        Some(DecodedMessage::Truncate { tables }) => {
                            warn!("TRUNCATE received for {:?}; no events emitted", tables);
                        }
                        None => {}
                    }
                }
                ReplicationFrame::KeepAlive {
                    wal_end,
                    reply_requested: reply,
                    ..
                } => {
                    trace!("Keepalive: wal_end={}, reply={}", wal_end, reply);
                    self.progress.keepalive(wal_end);
                    reply_requested = reply;
                }
            }

            self.send_status_update(reply_requested).await?;
        }
    }

    async fn send_status_update(&mut self, force: bool) -> Result<()> {
        let now = Instant::now();
        if !self.progress.should_send(force, now) {
            return Ok(());
        }

        let update = self.progress.status_update(false);
        self.duplex
            .send(update)
            .await
            .map_err(|e| Error::StreamInterrupted {
                message: e.to_string(),
            })?;
        self.progress.mark_sent(now);

        debug!(flush_lsn = %self.progress.flushed(), "Standby status update sent");
        Ok(())
    }

    /// Ends the COPY and closes the connection within the close timeout.
    ///
    /// Positions of changes that were decoded but not yet handed out are
    /// never acknowledged.
    pub async fn close(mut self) {
        match tokio::time::timeout(self.settings.close_timeout, self.duplex.close()).await {
            Ok(Ok(())) => debug!("Replication stream closed"),
            Ok(Err(e)) => debug!("Error while closing replication stream: {}", e),
            Err(_) => warn!(
                "Replication stream did not close within {:?}",
                self.settings.close_timeout
            ),
        }
        self.connection.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_xlogdata_frame() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(100);
        buf.put_u64(200);
        buf.put_i64(42);
        buf.put_slice(b"B...");

        match ReplicationFrame::parse(buf.freeze()).unwrap() {
            ReplicationFrame::XLogData {
                wal_start,
                wal_end,
                server_time_micros,
                data,
            } => {
                assert_eq!(wal_start, Lsn(100));
                assert_eq!(wal_end, Lsn(200));
                assert_eq!(server_time_micros, 42);
                assert_eq!(&data[..], b"B...");
            }
            other => panic!("Expected XLogData, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_keepalive_frame() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(0x1_0000_0000);
        buf.put_i64(7);
        buf.put_u8(1);

        assert_eq!(
            ReplicationFrame::parse(buf.freeze()).unwrap(),
            ReplicationFrame::KeepAlive {
                wal_end: Lsn(0x1_0000_0000),
                server_time_micros: 7,
                reply_requested: true,
            }
        );
    }

    #[test]
    fn test_parse_rejects_bad_frames() {
        assert!(ReplicationFrame::parse(Bytes::new()).is_err());
        assert!(ReplicationFrame::parse(Bytes::from_static(b"w\x00\x01")).is_err());
        assert!(ReplicationFrame::parse(Bytes::from_static(b"k\x00")).is_err());
        assert!(ReplicationFrame::parse(Bytes::from_static(b"z")).is_err());
    }

    #[test]
    fn test_standby_status_update_layout() {
        let msg = encode_standby_status_update(Lsn(3), Lsn(2), Lsn(1), 99, true);
        assert_eq!(msg.len(), 34);

        let mut cursor = &msg[..];
        assert_eq!(cursor.get_u8(), b'r');
        assert_eq!(cursor.get_u64(), 3);
        assert_eq!(cursor.get_u64(), 2);
        assert_eq!(cursor.get_u64(), 1);
        assert_eq!(cursor.get_i64(), 99);
        assert_eq!(cursor.get_u8(), 1);
    }

    #[test]
    fn test_postgres_epoch_is_after_2000() {
        // 2020-01-01 is 20 years past the server epoch.
        assert!(postgres_epoch_micros() > 20 * 365 * 24 * 3600 * 1_000_000);
    }

    #[test]
    fn test_progress_acknowledges_only_committed_transactions() {
        let mut progress = Progress::new(Lsn(100), Duration::from_secs(1));

        progress.begin();
        progress.received(Lsn(150));
        progress.keepalive(Lsn(300));
        // Keepalive inside an open transaction must not move the flush position.
        assert_eq!(progress.flushed(), Lsn(100));

        progress.commit(Lsn(200));
        assert_eq!(progress.flushed(), Lsn(200));

        progress.keepalive(Lsn(400));
        assert_eq!(progress.flushed(), Lsn(400));
    }

    #[test]
    fn test_progress_never_moves_backwards() {
        let mut progress = Progress::new(Lsn(500), Duration::from_secs(1));
        progress.commit(Lsn(400));
        assert_eq!(progress.flushed(), Lsn(500));
    }

    #[test]
    fn test_progress_status_update_cadence() {
        let interval = Duration::from_millis(100);
        let mut progress = Progress::new(Lsn::ZERO, interval);
        let start = Instant::now();

        assert!(!progress.should_send(false, start));
        assert!(progress.should_send(true, start));

        progress.commit(Lsn(10));
        assert!(progress.should_send(false, start));
        progress.mark_sent(start);

        progress.commit(Lsn(20));
        assert!(!progress.should_send(false, start + Duration::from_millis(10)));
        assert!(progress.should_send(false, start + interval));

        progress.mark_sent(start + interval);
        assert!(!progress.should_send(false, start + interval * 5));
    }
}
