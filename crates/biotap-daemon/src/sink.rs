use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use biotap_common::TraceRecord;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Consumer of emitted trace records. Called from the event path, so
/// implementations must not block.
pub trait RecordSink: Send + Sync {
    fn push(&self, record: TraceRecord);
}

/// Bounded channel to an async consumer. Records are dropped, and counted,
/// while the channel is full.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<TraceRecord>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TraceRecord>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx, dropped: AtomicU64::new(0) }, rx)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl RecordSink for ChannelSink {
    fn push(&self, record: TraceRecord) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!("Record channel full, {} records dropped so far", dropped);
                }
            }
            Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Write every record from `rx` to `out` as one JSON object per line until
/// all senders are gone. Returns the number of records written.
pub async fn write_json_lines<W>(mut rx: mpsc::Receiver<TraceRecord>, mut out: W) -> io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(record) = rx.recv().await {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        out.write_all(&line).await?;
        written += 1;

        // Flush once the burst is drained.
        if rx.is_empty() {
            out.flush().await?;
        }
    }
    out.flush().await?;
    debug!("Record writer finished after {} records", written);
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use biotap_common::{IoFlags, RecordQuality, WriteHint};

    fn record(sector: u64) -> TraceRecord {
        TraceRecord {
            flags: IoFlags::READ,
            sector,
            bytes: 512,
            write_hint: WriteHint::NotSet,
            timestamp_ns: 0,
            completion: None,
            quality: RecordQuality::Complete,
        }
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.push(record(1));
        sink.push(record(2));

        assert_eq!(rx.recv().await.unwrap().sector, 1);
        assert_eq!(rx.recv().await.unwrap().sector, 2);
        assert_eq!(sink.dropped(), 0);
    }

    #[tokio::test]
    async fn test_channel_sink_never_blocks_when_full() {
        let (sink, mut rx) = ChannelSink::new(2);
        for sector in 0..5 {
            sink.push(record(sector));
        }
        assert_eq!(sink.dropped(), 3);

        drop(sink);
        let mut received = Vec::new();
        while let Some(record) = rx.recv().await {
            received.push(record.sector);
        }
        assert_eq!(received, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_write_json_lines() {
        let (sink, rx) = ChannelSink::new(8);
        sink.push(record(100));
        sink.push(record(200));
        drop(sink);

        let mut out = Vec::new();
        let written = write_json_lines(rx, &mut out).await.unwrap();
        assert_eq!(written, 2);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["sector"], 100);
        assert_eq!(first["quality"], "complete");
    }
}
