#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::{bpf_ktime_get_ns, bpf_probe_read},
    macros::{map, raw_tracepoint},
    maps::{Array, RingBuf},
    programs::RawTracePointContext,
    EbpfContext,
};
use aya_log_ebpf::debug;

const BIO_SNAPSHOT_LEN: usize = 64;
// Bounds the request bio chain walk for the verifier.
const MAX_BIOS_PER_REQUEST: usize = 16;

const EVENT_QUEUE: u8 = 0;
const EVENT_BIO_COMPLETE: u8 = 1;
const EVENT_RQ_COMPLETE: u8 = 2;

/// `block_rq_complete(q, rq, nr_bytes)`
const RQ_ARGS_QUEUE_REQUEST_BYTES: u32 = 0;
/// `block_bio_complete(q, bio, error)`
const BIO_ARGS_QUEUE_BIO_ERROR: u32 = 0;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawBlockEvent {
    pub io_key: u64,
    pub timestamp_ns: u64,
    pub nr_bytes: u32,
    pub error: i32,
    pub kind: u8,
    pub _pad: [u8; 7],
    pub bio: [u8; BIO_SNAPSHOT_LEN],
}

/// Filled in by the loader before any program is attached.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ProbeLayout {
    pub request_bio_offset: u32,
    pub bio_next_offset: u32,
    pub bio_size_offset: u32,
    pub rq_complete_args: u32,
    pub bio_complete_args: u32,
}

#[map]
static BLOCK_EVENTS: RingBuf = RingBuf::with_byte_size(1024 * 1024, 0);

#[map]
static PROBE_LAYOUT: Array<ProbeLayout> = Array::with_max_entries(1, 0);

#[inline(always)]
fn arg(ctx: &RawTracePointContext, index: usize) -> u64 {
    unsafe { *(ctx.as_ptr() as *const u64).add(index) }
}

#[inline(always)]
fn read_at<T>(base: u64, offset: u32) -> Option<T> {
    unsafe { bpf_probe_read((base + offset as u64) as *const T).ok() }
}

#[inline(always)]
fn emit(kind: u8, bio: u64, nr_bytes: u32, error: i32) -> bool {
    let snapshot: [u8; BIO_SNAPSHOT_LEN] =
        match unsafe { bpf_probe_read(bio as *const [u8; BIO_SNAPSHOT_LEN]) } {
            Ok(snapshot) => snapshot,
            Err(_) => return false,
        };

    let event = RawBlockEvent {
        io_key: bio,
        timestamp_ns: unsafe { bpf_ktime_get_ns() },
        nr_bytes,
        error,
        kind,
        _pad: [0; 7],
        bio: snapshot,
    };

    match BLOCK_EVENTS.reserve::<RawBlockEvent>(0) {
        Some(mut buf) => {
            buf.write(event);
            buf.submit(0);
            true
        }
        None => false,
    }
}

/// `block_bio_queue(q, bio)`
#[raw_tracepoint(tracepoint = "block_bio_queue")]
pub fn block_bio_queue(ctx: RawTracePointContext) -> i32 {
    let bio = arg(&ctx, 1);
    if bio != 0 && !emit(EVENT_QUEUE, bio, 0, 0) {
        debug!(&ctx, "dropped queue event");
    }
    0
}

/// `block_bio_complete(q, bio, ...)`. The error argument is read only
/// where the layout says the signature has one; elsewhere the status is
/// taken from the bio itself.
#[raw_tracepoint(tracepoint = "block_bio_complete")]
pub fn block_bio_complete(ctx: RawTracePointContext) -> i32 {
    let layout = match PROBE_LAYOUT.get(0) {
        Some(layout) => *layout,
        None => return 0,
    };

    let bio = arg(&ctx, 1);
    let error = if layout.bio_complete_args == BIO_ARGS_QUEUE_BIO_ERROR {
        arg(&ctx, 2) as i32
    } else {
        0
    };
    if bio != 0 && !emit(EVENT_BIO_COMPLETE, bio, 0, error) {
        debug!(&ctx, "dropped bio completion");
    }
    0
}

/// One event per bio retired by this update, in chain order. A bio that
/// `nr_bytes` covers only in part is advanced by the kernel, not ended, so
/// the walk stops there; it is reported by a later update.
#[raw_tracepoint(tracepoint = "block_rq_complete")]
pub fn block_rq_complete(ctx: RawTracePointContext) -> i32 {
    let layout = match PROBE_LAYOUT.get(0) {
        Some(layout) => *layout,
        None => return 0,
    };

    let (first, second, third) = (arg(&ctx, 0), arg(&ctx, 1), arg(&ctx, 2));
    let (rq, error, mut remaining) = if layout.rq_complete_args == RQ_ARGS_QUEUE_REQUEST_BYTES {
        (second, 0, third as u32)
    } else {
        (first, second as i32, third as u32)
    };
    if rq == 0 {
        return 0;
    }

    let mut bio: u64 = match read_at(rq, layout.request_bio_offset) {
        Some(bio) => bio,
        None => return 0,
    };

    for _ in 0..MAX_BIOS_PER_REQUEST {
        if bio == 0 {
            break;
        }

        let size: u32 = match read_at(bio, layout.bio_size_offset) {
            Some(size) => size,
            None => break,
        };
        if size > remaining {
            break;
        }
        remaining -= size;

        if !emit(EVENT_RQ_COMPLETE, bio, size, error) {
            debug!(&ctx, "dropped request completion");
        }
        if remaining == 0 {
            break;
        }

        bio = read_at(bio, layout.bio_next_offset).unwrap_or(0);
    }
    0
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
