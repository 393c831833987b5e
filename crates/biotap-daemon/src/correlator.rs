//! Deduplication of the two completion paths.
//!
//! Per in-flight I/O: `queued -> completed -> (record emitted) -> evicted`,
//! or `queued -> evicted` when no completion arrives inside the grace window.
//! The first completion signal for a key emits exactly one record; the
//! other path's signal for the same key is discarded. A completed entry is
//! kept as a tombstone until that second signal arrives (or the grace
//! window passes), so a late signal is never taken for an orphan. A second
//! signal from the path that already reported belongs to a new I/O on a
//! reused bio address.
//!
//! The table is a sharded [`DashMap`]; each transition holds only the shard
//! lock of its own key for the duration of the entry update.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use biotap_common::config::CorrelationConfig;
use biotap_common::{
    CompletionInfo, CompletionSource, CompletionStatus, IoKey, RecordQuality, TraceRecord,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
enum Slot {
    Queued { record: TraceRecord, since: Instant },
    Completed { source: CompletionSource, since: Instant },
}

#[derive(Debug, Default)]
struct Counters {
    emitted: AtomicU64,
    duplicates: AtomicU64,
    orphans: AtomicU64,
    requeued: AtomicU64,
    evicted: AtomicU64,
    expired: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CorrelatorStats {
    /// Completion records emitted.
    pub emitted: u64,
    /// Second-path signals discarded.
    pub duplicates: u64,
    /// Completions emitted without a queue event.
    pub orphans: u64,
    /// Queue events for a key that was already queued.
    pub requeued: u64,
    /// Queued entries dropped without ever completing.
    pub evicted: u64,
    /// Completed entries whose second signal never came.
    pub expired: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    pub expired: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.evicted == 0 && self.expired == 0
    }
}

#[derive(Debug)]
pub struct CompletionCorrelator {
    entries: DashMap<IoKey, Slot>,
    track_queue_events: bool,
    grace_window: Duration,
    counters: Counters,
}

impl CompletionCorrelator {
    pub fn new(config: &CorrelationConfig) -> Self {
        Self::with_grace_window(config.grace_window(), config.track_queue_events)
    }

    pub fn with_grace_window(grace_window: Duration, track_queue_events: bool) -> Self {
        Self { entries: DashMap::new(), track_queue_events, grace_window, counters: Counters::default() }
    }

    pub fn grace_window(&self) -> Duration {
        self.grace_window
    }

    /// Number of keys currently holding state.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_queued(&self, key: IoKey) -> bool {
        self.entries.get(&key).is_some_and(|slot| matches!(*slot, Slot::Queued { .. }))
    }

    /// Record admission of `key`.
    pub fn on_queued(&self, key: IoKey, record: TraceRecord, now: Instant) {
        if !self.track_queue_events {
            return;
        }

        match self.entries.entry(key) {
            Entry::Occupied(mut entry) => {
                if matches!(entry.get(), Slot::Queued { .. }) {
                    // Same bio resubmitted (e.g. remapped): keep the first admission.
                    self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                } else {
                    // Address reused by a new bio after the previous one completed.
                    entry.insert(Slot::Queued { record, since: now });
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Slot::Queued { record, since: now });
            }
        }
    }

    /// Handle one completion signal. Returns the record to emit, or `None`
    /// if the other path already completed this key.
    pub fn on_completion_signal(
        &self,
        key: IoKey,
        source: CompletionSource,
        observed: &TraceRecord,
        now: Instant,
    ) -> Option<TraceRecord> {
        let tombstone = Slot::Completed { source, since: now };
        let emitted = match self.entries.entry(key) {
            Entry::Occupied(mut entry) => {
                let current = *entry.get();
                match current {
                    Slot::Queued { record, .. } => {
                        entry.insert(tombstone);
                        Some(completed(&record, observed, source))
                    }
                    Slot::Completed { source: first, .. } if first != source => {
                        // Both paths have now reported; nothing left to wait for.
                        entry.remove();
                        self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                        debug!("Discarded {:?} completion for {}: already emitted", source, key);
                        None
                    }
                    Slot::Completed { .. } => {
                        // Same path again: the address now belongs to another bio.
                        entry.insert(tombstone);
                        self.counters.orphans.fetch_add(1, Ordering::Relaxed);
                        Some(orphan(observed, source))
                    }
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(tombstone);
                self.counters.orphans.fetch_add(1, Ordering::Relaxed);
                Some(orphan(observed, source))
            }
        };

        if emitted.is_some() {
            self.counters.emitted.fetch_add(1, Ordering::Relaxed);
        }
        emitted
    }

    /// Drop every entry older than the grace window.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let grace = self.grace_window;
        let mut report = SweepReport::default();

        self.entries.retain(|_, slot| match slot {
            Slot::Queued { since, .. } if now.saturating_duration_since(*since) >= grace => {
                report.evicted += 1;
                false
            }
            Slot::Completed { since, .. } if now.saturating_duration_since(*since) >= grace => {
                report.expired += 1;
                false
            }
            _ => true,
        });

        self.counters.evicted.fetch_add(report.evicted as u64, Ordering::Relaxed);
        self.counters.expired.fetch_add(report.expired as u64, Ordering::Relaxed);
        report
    }

    pub fn stats(&self) -> CorrelatorStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CorrelatorStats {
            emitted: load(&self.counters.emitted),
            duplicates: load(&self.counters.duplicates),
            orphans: load(&self.counters.orphans),
            requeued: load(&self.counters.requeued),
            evicted: load(&self.counters.evicted),
            expired: load(&self.counters.expired),
        }
    }
}

fn completion_info(observed: &TraceRecord, source: CompletionSource) -> CompletionInfo {
    match observed.completion {
        Some(info) => CompletionInfo { source, ..info },
        None => CompletionInfo {
            completed_bytes: observed.bytes,
            status: CompletionStatus::Ok,
            source,
            queued_at_ns: None,
        },
    }
}

fn completed(queued: &TraceRecord, observed: &TraceRecord, source: CompletionSource) -> TraceRecord {
    TraceRecord {
        timestamp_ns: observed.timestamp_ns,
        completion: Some(CompletionInfo {
            queued_at_ns: Some(queued.timestamp_ns),
            ..completion_info(observed, source)
        }),
        quality: RecordQuality::Complete,
        ..*queued
    }
}

fn orphan(observed: &TraceRecord, source: CompletionSource) -> TraceRecord {
    TraceRecord {
        completion: Some(completion_info(observed, source)),
        quality: RecordQuality::QueueEventMissing,
        ..*observed
    }
}

/// Run [`CompletionCorrelator::sweep`] every `period` until the task is
/// aborted.
pub fn spawn_sweeper(correlator: Arc<CompletionCorrelator>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let report = correlator.sweep(Instant::now());
            if !report.is_empty() {
                info!(
                    "Correlation sweep: evicted {} unmatched queue entries, expired {} completions",
                    report.evicted, report.expired
                );
            }
        }
    })
}
