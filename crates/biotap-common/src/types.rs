use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Size of one device sector in bytes.
pub const SECTOR_SIZE: u64 = 512;
pub const SECTOR_SHIFT: u32 = 9;

bitflags! {
    /// Canonical operation flags of a block I/O.
    ///
    /// A record carries every flag that applies; a write that is also a
    /// preflush and FUA carries all three. Precedence is left to consumers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct IoFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const DISCARD = 1 << 2;
        const FLUSH = 1 << 3;
        const FUA = 1 << 4;
    }
}

impl IoFlags {
    pub fn is_write(&self) -> bool {
        self.contains(Self::WRITE)
    }

    pub fn is_read(&self) -> bool {
        self.contains(Self::READ)
    }

    /// Short name list such as `write|flush|fua`.
    pub fn names(&self) -> String {
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        names.join("|").to_lowercase()
    }
}

/// Expected data lifetime attached to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteHint {
    /// No hint was set on the bio (also the only value older kernels report).
    #[default]
    NotSet,
    None,
    Short,
    Medium,
    Long,
    Extreme,
}

impl WriteHint {
    /// Decode the kernel's `enum rw_hint` value.
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::NotSet),
            1 => Some(Self::None),
            2 => Some(Self::Short),
            3 => Some(Self::Medium),
            4 => Some(Self::Long),
            5 => Some(Self::Extreme),
            _ => None,
        }
    }
}

/// Identity of one in-flight I/O as exposed by the kernel (the bio address).
///
/// Address ranges are not unique under split and merge, so records are
/// correlated on this key only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IoKey(pub u64);

impl fmt::Display for IoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Which of the two completion tracepoints reported a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSource {
    BioPath,
    RequestPath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "status", content = "errno")]
pub enum CompletionStatus {
    Ok,
    Error(i32),
}

impl CompletionStatus {
    /// Kernel completion error codes are negative errnos; some paths report
    /// them positive. Both map to the same status.
    pub fn from_errno(error: i32) -> Self {
        match error {
            0 => Self::Ok,
            e => Self::Error(e.saturating_abs()),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordQuality {
    #[default]
    Complete,
    /// The completion was observed without its queue event; exclude the
    /// record from duration metrics.
    QueueEventMissing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionInfo {
    /// Bytes actually completed; may be below the queued size.
    pub completed_bytes: u32,
    pub status: CompletionStatus,
    pub source: CompletionSource,
    /// Timestamp of the matching queue event, when one was observed.
    pub queued_at_ns: Option<u64>,
}

/// Canonical, kernel-version independent trace record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub flags: IoFlags,
    /// Starting offset in 512-byte sectors.
    pub sector: u64,
    /// Length in bytes.
    pub bytes: u32,
    pub write_hint: WriteHint,
    pub timestamp_ns: u64,
    pub completion: Option<CompletionInfo>,
    #[serde(default)]
    pub quality: RecordQuality,
}

impl TraceRecord {
    pub fn is_completion(&self) -> bool {
        self.completion.is_some()
    }

    /// Queue-to-completion time, when both ends were observed.
    pub fn latency_ns(&self) -> Option<u64> {
        let queued = self.completion?.queued_at_ns?;
        Some(self.timestamp_ns.saturating_sub(queued))
    }

    pub fn end_sector(&self) -> u64 {
        self.sector + (u64::from(self.bytes) >> SECTOR_SHIFT)
    }
}
