//! Raw kernel events to canonical trace records.
//!
//! Pure: no kernel calls, no blocking, no shared state. Every field is read
//! through the accessors bound to the active profile.

use biotap_common::{
    CompletionInfo, CompletionSource, CompletionStatus, Error, IoFlags, IoKey, RecordQuality,
    Result, TraceRecord, WriteHint, SECTOR_SHIFT,
};

use crate::abi::{AbiProfile, BioSnapshot};
use crate::ebpf::block_trace::{
    RawBlockEvent, EVENT_BIO_COMPLETE, EVENT_QUEUE, EVENT_RQ_COMPLETE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Queue,
    Completion(CompletionSource),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedEvent {
    pub key: IoKey,
    pub signal: Signal,
    pub record: TraceRecord,
}

fn signal_of(kind: u8) -> Result<Signal> {
    match kind {
        EVENT_QUEUE => Ok(Signal::Queue),
        EVENT_BIO_COMPLETE => Ok(Signal::Completion(CompletionSource::BioPath)),
        EVENT_RQ_COMPLETE => Ok(Signal::Completion(CompletionSource::RequestPath)),
        other => Err(Error::malformed(format!("unknown event kind {}", other))),
    }
}

pub fn normalize(raw: &RawBlockEvent, profile: &AbiProfile) -> Result<NormalizedEvent> {
    let signal = signal_of(raw.kind)?;
    if raw.io_key == 0 {
        return Err(Error::malformed("null bio address"));
    }

    let accessor = profile.bio();
    let bio = BioSnapshot(raw.bio);

    let sector = accessor.sector(&bio);
    let bytes = accessor.size(&bio);
    let flags = accessor.decode_op(accessor.op_flags(&bio), bytes)?;

    let write_hint = if profile.features().write_hint {
        let raw_hint = accessor.write_hint(&bio);
        WriteHint::from_raw(raw_hint)
            .ok_or_else(|| Error::malformed(format!("write hint {} out of range", raw_hint)))?
    } else {
        WriteHint::NotSet
    };

    if sector.checked_add(u64::from(bytes) >> SECTOR_SHIFT).is_none() {
        return Err(Error::malformed(format!("sector range overflows at {}", sector)));
    }

    let completion = match signal {
        Signal::Queue => {
            // Completed bios may have a consumed iterator; queued ones may not.
            if bytes == 0 && !flags.contains(IoFlags::FLUSH) {
                return Err(Error::malformed(format!(
                    "zero-length {} queue event",
                    flags.names()
                )));
            }
            None
        }
        Signal::Completion(source) => {
            let errno = match source {
                CompletionSource::BioPath => accessor.completion_errno(&bio, raw.error),
                CompletionSource::RequestPath => raw.error,
            };
            Some(CompletionInfo {
                completed_bytes: raw.nr_bytes,
                status: CompletionStatus::from_errno(errno),
                source,
                queued_at_ns: None,
            })
        }
    };

    Ok(NormalizedEvent {
        key: IoKey(raw.io_key),
        signal,
        record: TraceRecord {
            flags,
            sector,
            bytes,
            write_hint,
            timestamp_ns: raw.timestamp_ns,
            completion,
            quality: RecordQuality::Complete,
        },
    })
}

/// Build a raw event for `profile` from canonical parts. The inverse of
/// [`normalize`] for well-formed input; used to replay and to test.
pub fn synthesize(
    profile: &AbiProfile,
    kind: u8,
    io_key: u64,
    op_flags: u64,
    sector: u64,
    size: u32,
    write_hint: u16,
) -> RawBlockEvent {
    RawBlockEvent {
        io_key,
        timestamp_ns: 0,
        nr_bytes: 0,
        error: 0,
        kind,
        _pad: [0; 7],
        bio: profile.bio().encode(op_flags, sector, size, write_hint).0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{AbiGeneration, LegacyBio, ModernBio};

    fn modern() -> AbiProfile {
        AbiProfile::for_generation(AbiGeneration::Modern)
    }

    fn legacy() -> AbiProfile {
        AbiProfile::for_generation(AbiGeneration::Legacy)
    }

    #[test]
    fn test_queue_write() {
        let profile = modern();
        let raw = synthesize(&profile, EVENT_QUEUE, 0xffff8800_1000, ModernBio::OP_WRITE, 100, 4096, 0);

        let event = normalize(&raw, &profile).unwrap();
        assert_eq!(event.signal, Signal::Queue);
        assert_eq!(event.key, IoKey(0xffff8800_1000));
        assert_eq!(event.record.flags, IoFlags::WRITE);
        assert_eq!(event.record.sector, 100);
        assert_eq!(event.record.bytes, 4096);
        assert!(event.record.completion.is_none());
    }

    #[test]
    fn test_write_flush_fua_keeps_all_flags() {
        let profile = modern();
        let opf = ModernBio::OP_WRITE | ModernBio::REQ_PREFLUSH | ModernBio::REQ_FUA;
        let raw = synthesize(&profile, EVENT_QUEUE, 1, opf, 8, 512, 0);
        let record = normalize(&raw, &profile).unwrap().record;
        assert_eq!(record.flags, IoFlags::WRITE | IoFlags::FLUSH | IoFlags::FUA);

        let profile = legacy();
        let rw = LegacyBio::REQ_WRITE | LegacyBio::REQ_FLUSH | LegacyBio::REQ_FUA;
        let raw = synthesize(&profile, EVENT_QUEUE, 1, rw, 8, 512, 0);
        let record = normalize(&raw, &profile).unwrap().record;
        assert_eq!(record.flags, IoFlags::WRITE | IoFlags::FLUSH | IoFlags::FUA);
    }

    #[test]
    fn test_read_has_default_write_hint() {
        let profile = modern();
        let raw = synthesize(&profile, EVENT_QUEUE, 1, ModernBio::OP_READ, 0, 4096, 0);
        let record = normalize(&raw, &profile).unwrap().record;
        assert!(record.flags.is_read());
        assert_eq!(record.write_hint, WriteHint::NotSet);
    }

    #[test]
    fn test_write_hint_only_where_supported() {
        let profile = modern();
        let raw = synthesize(&profile, EVENT_QUEUE, 1, ModernBio::OP_WRITE, 0, 4096, 4);
        assert_eq!(normalize(&raw, &profile).unwrap().record.write_hint, WriteHint::Long);

        // Bytes at the modern hint offset mean nothing on the legacy layout.
        let profile = legacy();
        let mut raw = synthesize(&profile, EVENT_QUEUE, 1, LegacyBio::REQ_WRITE, 0, 4096, 0);
        raw.bio[24] = 4;
        assert_eq!(normalize(&raw, &profile).unwrap().record.write_hint, WriteHint::NotSet);
    }

    #[test]
    fn test_completion_fields() {
        let profile = modern();
        let mut raw = synthesize(&profile, EVENT_RQ_COMPLETE, 7, ModernBio::OP_READ, 64, 0, 0);
        raw.nr_bytes = 2048;
        raw.error = -5;
        raw.timestamp_ns = 99;

        let event = normalize(&raw, &profile).unwrap();
        assert_eq!(event.signal, Signal::Completion(CompletionSource::RequestPath));
        let completion = event.record.completion.unwrap();
        assert_eq!(completion.completed_bytes, 2048);
        assert_eq!(completion.status, CompletionStatus::Error(5));
        assert_eq!(event.record.timestamp_ns, 99);
    }

    #[test]
    fn test_bio_completion_status_from_bio() {
        let profile = modern();
        let mut raw = synthesize(&profile, EVENT_BIO_COMPLETE, 7, ModernBio::OP_WRITE, 64, 0, 0);
        raw.bio[26] = 10; // BLK_STS_IOERR
        let completion = normalize(&raw, &profile).unwrap().record.completion.unwrap();
        assert_eq!(completion.status, CompletionStatus::Error(5));
        assert_eq!(completion.source, CompletionSource::BioPath);
    }

    #[test]
    fn test_legacy_bio_completion_carries_tracepoint_error() {
        let profile = legacy();
        let mut raw = synthesize(&profile, EVENT_BIO_COMPLETE, 7, LegacyBio::REQ_WRITE, 64, 0, 0);
        raw.error = -5;
        let completion = normalize(&raw, &profile).unwrap().record.completion.unwrap();
        assert_eq!(completion.status, CompletionStatus::Error(5));
        assert_eq!(completion.source, CompletionSource::BioPath);
    }

    #[test]
    fn test_zone_append_is_a_write() {
        let profile = AbiProfile::for_generation(AbiGeneration::Modern);
        let raw = synthesize(&profile, EVENT_QUEUE, 1, ModernBio::OP_ZONE_APPEND, 0, 4096, 0);
        let record = normalize(&raw, &profile).unwrap().record;
        assert_eq!(record.flags, IoFlags::WRITE);
        assert_eq!(record.bytes, 4096);
    }

    #[test]
    fn test_empty_flush_is_valid() {
        let profile = modern();
        let raw = synthesize(&profile, EVENT_QUEUE, 1, ModernBio::OP_FLUSH, 0, 0, 0);
        assert_eq!(normalize(&raw, &profile).unwrap().record.flags, IoFlags::FLUSH);
    }

    #[test]
    fn test_malformed_events() {
        let profile = modern();

        let zero_write = synthesize(&profile, EVENT_QUEUE, 1, ModernBio::OP_WRITE, 0, 0, 0);
        assert!(matches!(normalize(&zero_write, &profile), Err(Error::MalformedEvent(_))));

        let bad_kind = synthesize(&profile, 9, 1, ModernBio::OP_WRITE, 0, 512, 0);
        assert!(matches!(normalize(&bad_kind, &profile), Err(Error::MalformedEvent(_))));

        let bad_hint = synthesize(&profile, EVENT_QUEUE, 1, ModernBio::OP_WRITE, 0, 512, 42);
        assert!(matches!(normalize(&bad_hint, &profile), Err(Error::MalformedEvent(_))));

        let no_key = synthesize(&profile, EVENT_QUEUE, 0, ModernBio::OP_WRITE, 0, 512, 0);
        assert!(matches!(normalize(&no_key, &profile), Err(Error::MalformedEvent(_))));

        let overflow = synthesize(&profile, EVENT_QUEUE, 1, ModernBio::OP_WRITE, u64::MAX, 4096, 0);
        assert!(matches!(normalize(&overflow, &profile), Err(Error::MalformedEvent(_))));

        let scsi = synthesize(&profile, EVENT_QUEUE, 1, 32, 0, 512, 0);
        assert!(matches!(normalize(&scsi, &profile), Err(Error::MalformedEvent(_))));
    }
}
