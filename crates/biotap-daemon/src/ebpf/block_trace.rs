//! Wire structures shared with the `block-trace` eBPF object.
//!
//! Keep in sync with `biotap-ebpf/src/block-trace.rs`.

use crate::abi::BIO_SNAPSHOT_LEN;

pub const EVENT_QUEUE: u8 = 0;
pub const EVENT_BIO_COMPLETE: u8 = 1;
pub const EVENT_RQ_COMPLETE: u8 = 2;

/// `block_rq_complete(q, rq, nr_bytes)`
pub const RQ_ARGS_QUEUE_REQUEST_BYTES: u32 = 0;
/// `block_rq_complete(rq, error, nr_bytes)`
pub const RQ_ARGS_REQUEST_ERROR_BYTES: u32 = 1;

/// `block_bio_complete(q, bio, error)`
pub const BIO_ARGS_QUEUE_BIO_ERROR: u32 = 0;
/// `block_bio_complete(q, bio)` plus arguments that differ between releases;
/// the status is read from the bio.
pub const BIO_ARGS_QUEUE_BIO: u32 = 1;

pub const EVENTS_MAP: &str = "BLOCK_EVENTS";
pub const LAYOUT_MAP: &str = "PROBE_LAYOUT";

/// One queue or completion occurrence as copied out of the kernel.
///
/// For request-path completions the eBPF side emits one event per bio that
/// the update retires in full, carrying that bio's byte count. A bio only
/// partly covered by the update gets no event until a later update ends it.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawBlockEvent {
    /// Address of the bio.
    pub io_key: u64,
    pub timestamp_ns: u64,
    /// Bytes this event accounts for (completions only).
    pub nr_bytes: u32,
    pub error: i32,
    pub kind: u8,
    pub _pad: [u8; 7],
    pub bio: [u8; BIO_SNAPSHOT_LEN],
}

impl RawBlockEvent {
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EVENT_QUEUE => "queue",
            EVENT_BIO_COMPLETE => "bio_complete",
            EVENT_RQ_COMPLETE => "rq_complete",
            _ => "unknown",
        }
    }

    /// Decode a ring buffer item. `None` when the item is too short.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < std::mem::size_of::<Self>() {
            return None;
        }
        // SAFETY: length checked above; the struct is plain old data.
        Some(unsafe { std::ptr::read_unaligned(data.as_ptr() as *const Self) })
    }
}

/// Written to `PROBE_LAYOUT[0]` before any probe is attached.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeLayout {
    pub request_bio_offset: u32,
    pub bio_next_offset: u32,
    pub bio_size_offset: u32,
    pub rq_complete_args: u32,
    pub bio_complete_args: u32,
}

// SAFETY: repr(C), no padding, every bit pattern valid.
unsafe impl aya::Pod for ProbeLayout {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_size_matches_ebpf_side() {
        assert_eq!(std::mem::size_of::<RawBlockEvent>(), 96);
        assert_eq!(std::mem::size_of::<ProbeLayout>(), 20);
    }

    #[test]
    fn test_from_bytes_rejects_short_items() {
        assert!(RawBlockEvent::from_bytes(&[0u8; 40]).is_none());

        let mut data = [0u8; 96];
        data[0] = 0x10;
        data[24] = EVENT_RQ_COMPLETE;
        let event = RawBlockEvent::from_bytes(&data).unwrap();
        assert_eq!(event.io_key, u64::from_ne_bytes([0x10, 0, 0, 0, 0, 0, 0, 0]));
        assert_eq!(event.kind_name(), "rq_complete");
    }
}
