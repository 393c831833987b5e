//! The per-event data path: normalize, correlate, push.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::debug;

use crate::abi::AbiProfile;
use crate::correlator::{CompletionCorrelator, CorrelatorStats};
use crate::ebpf::block_trace::RawBlockEvent;
use crate::normalizer::{normalize, Signal};
use crate::sink::RecordSink;

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    malformed: AtomicU64,
    queued: AtomicU64,
    completions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TracerStats {
    pub received: u64,
    pub malformed: u64,
    pub queued: u64,
    pub completions: u64,
    pub correlation: CorrelatorStats,
}

pub struct BlockTracer {
    profile: Arc<AbiProfile>,
    correlator: Arc<CompletionCorrelator>,
    sink: Arc<dyn RecordSink>,
    counters: Counters,
}

impl BlockTracer {
    pub fn new(
        profile: Arc<AbiProfile>,
        correlator: Arc<CompletionCorrelator>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self { profile, correlator, sink, counters: Counters::default() }
    }

    pub fn profile(&self) -> &AbiProfile {
        &self.profile
    }

    pub fn correlator(&self) -> &Arc<CompletionCorrelator> {
        &self.correlator
    }

    /// Handle one ring buffer item.
    pub fn handle_bytes(&self, data: &[u8]) {
        match RawBlockEvent::from_bytes(data) {
            Some(raw) => self.handle_raw(&raw),
            None => {
                self.counters.received.fetch_add(1, Ordering::Relaxed);
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                debug!("Dropped short ring buffer item ({} bytes)", data.len());
            }
        }
    }

    pub fn handle_raw(&self, raw: &RawBlockEvent) {
        self.handle_raw_at(raw, Instant::now())
    }

    /// Per-event failures are counted and logged here; nothing propagates.
    pub fn handle_raw_at(&self, raw: &RawBlockEvent, now: Instant) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let event = match normalize(raw, &self.profile) {
            Ok(event) => event,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                debug!("Dropped {} event for {:#x}: {}", raw.kind_name(), raw.io_key, e);
                return;
            }
        };

        match event.signal {
            Signal::Queue => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                self.correlator.on_queued(event.key, event.record, now);
                self.sink.push(event.record);
            }
            Signal::Completion(source) => {
                if let Some(record) =
                    self.correlator.on_completion_signal(event.key, source, &event.record, now)
                {
                    self.counters.completions.fetch_add(1, Ordering::Relaxed);
                    self.sink.push(record);
                }
            }
        }
    }

    pub fn stats(&self) -> TracerStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        TracerStats {
            received: load(&self.counters.received),
            malformed: load(&self.counters.malformed),
            queued: load(&self.counters.queued),
            completions: load(&self.counters.completions),
            correlation: self.correlator.stats(),
        }
    }
}
