//! Field layouts of `struct bio` and `struct request` per ABI generation.
//!
//! The eBPF programs copy the first [`BIO_SNAPSHOT_LEN`] bytes of every bio
//! they see; all field extraction happens here against that snapshot. The
//! offsets are those of the x86_64 reference builds of each generation.

use std::fmt;

use biotap_common::{Error, IoFlags, Result};

pub const BIO_SNAPSHOT_LEN: usize = 64;

/// Raw copy of the head of a `struct bio`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BioSnapshot(pub [u8; BIO_SNAPSHOT_LEN]);

impl BioSnapshot {
    fn bytes<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.0[offset..offset + N]);
        out
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_ne_bytes(self.bytes(offset))
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_ne_bytes(self.bytes(offset))
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        u64::from_ne_bytes(self.bytes(offset))
    }
}

impl fmt::Debug for BioSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BioSnapshot(")?;
        for b in &self.0[..16] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..)")
    }
}

impl Default for BioSnapshot {
    fn default() -> Self {
        Self([0; BIO_SNAPSHOT_LEN])
    }
}

/// Accessor contract every generation implements.
pub trait BioAccessor: fmt::Debug + Send + Sync {
    /// The raw operation/flag word, widened to 64 bits.
    fn op_flags(&self, bio: &BioSnapshot) -> u64;

    fn sector(&self, bio: &BioSnapshot) -> u64;

    fn size(&self, bio: &BioSnapshot) -> u32;

    /// Raw `rw_hint`; zero where the generation has no such field.
    fn write_hint(&self, bio: &BioSnapshot) -> u16;

    /// Map the raw operation word to canonical flags.
    fn decode_op(&self, op_flags: u64, size: u32) -> Result<IoFlags>;

    /// Errno of a bio completion. `reported` is the tracepoint's error
    /// argument, zero where the tracepoint has none.
    fn completion_errno(&self, bio: &BioSnapshot, reported: i32) -> i32;

    fn bio_next_offset(&self) -> u32;

    fn bio_size_offset(&self) -> u32;

    fn request_bio_offset(&self) -> u32;

    /// Store a field set into a snapshot. Used to build synthetic events.
    fn encode(&self, op_flags: u64, sector: u64, size: u32, write_hint: u16) -> BioSnapshot;
}

/// 3.10 series: `bi_sector`/`bi_size` live in the bio, `bi_rw` carries
/// both direction and flags.
#[derive(Debug)]
pub struct LegacyBio;

impl LegacyBio {
    const SECTOR: usize = 0;
    const NEXT: usize = 8;
    const RW: usize = 32;
    const SIZE: usize = 48;
    const REQUEST_BIO: u32 = 104;

    pub const REQ_WRITE: u64 = 1 << 0;
    pub const REQ_DISCARD: u64 = 1 << 7;
    pub const REQ_SECURE: u64 = 1 << 8;
    pub const REQ_WRITE_SAME: u64 = 1 << 9;
    pub const REQ_FUA: u64 = 1 << 11;
    pub const REQ_FLUSH: u64 = 1 << 12;
}

impl BioAccessor for LegacyBio {
    fn op_flags(&self, bio: &BioSnapshot) -> u64 {
        bio.read_u64(Self::RW)
    }

    fn sector(&self, bio: &BioSnapshot) -> u64 {
        bio.read_u64(Self::SECTOR)
    }

    fn size(&self, bio: &BioSnapshot) -> u32 {
        bio.read_u32(Self::SIZE)
    }

    fn write_hint(&self, _bio: &BioSnapshot) -> u16 {
        0
    }

    fn decode_op(&self, rw: u64, size: u32) -> Result<IoFlags> {
        let mut flags = IoFlags::empty();

        if rw & (Self::REQ_DISCARD | Self::REQ_SECURE) != 0 {
            flags |= IoFlags::DISCARD;
        } else if rw & Self::REQ_FLUSH != 0 && size == 0 {
            // Empty flush: no data direction.
        } else if rw & (Self::REQ_WRITE | Self::REQ_WRITE_SAME) != 0 {
            flags |= IoFlags::WRITE;
        } else {
            flags |= IoFlags::READ;
        }

        if rw & Self::REQ_FLUSH != 0 {
            flags |= IoFlags::FLUSH;
        }
        if rw & Self::REQ_FUA != 0 {
            flags |= IoFlags::FUA;
        }
        Ok(flags)
    }

    fn completion_errno(&self, _bio: &BioSnapshot, reported: i32) -> i32 {
        reported
    }

    fn bio_next_offset(&self) -> u32 {
        Self::NEXT as u32
    }

    fn bio_size_offset(&self) -> u32 {
        Self::SIZE as u32
    }

    fn request_bio_offset(&self) -> u32 {
        Self::REQUEST_BIO
    }

    fn encode(&self, rw: u64, sector: u64, size: u32, _write_hint: u16) -> BioSnapshot {
        let mut bio = BioSnapshot::default();
        bio.0[Self::SECTOR..Self::SECTOR + 8].copy_from_slice(&sector.to_ne_bytes());
        bio.0[Self::RW..Self::RW + 8].copy_from_slice(&rw.to_ne_bytes());
        bio.0[Self::SIZE..Self::SIZE + 4].copy_from_slice(&size.to_ne_bytes());
        bio
    }
}

/// 4.14 onwards: `bi_opf` with the operation in the low bits and the
/// position in `bi_iter`.
///
/// The operation encoding is shared by the whole generation, but the field
/// offsets are not, so each layout revision is its own accessor:
///
/// | series     | `bio.bi_iter` | `request.bio` |
/// |------------|---------------|---------------|
/// | 4.14, 4.15 | 40            | 120           |
/// | 5.0        | 40            | 56            |
/// | 5.1-5.10   | 32            | 56            |
///
/// 4.14 and 4.15 open `struct request` with `queuelist` and a 32-byte
/// aligned `call_single_data_t`, and still carry `atomic_flags`. 5.0 moved
/// `q` to the front and added `mq_hctx`. 5.1 dropped the segment size
/// fields ahead of `bi_iter`. 4.16 through 4.20 reshuffled `struct request`
/// more than once and have no revision here.
#[derive(Debug, PartialEq, Eq)]
pub struct ModernBio {
    iter: usize,
    request_bio: u32,
}

impl ModernBio {
    const NEXT: usize = 0;
    const OPF: usize = 16;
    const WRITE_HINT: usize = 24;
    const STATUS: usize = 26;

    pub const V4_14: ModernBio = ModernBio { iter: 40, request_bio: 120 };
    pub const V5_0: ModernBio = ModernBio { iter: 40, request_bio: 56 };
    pub const V5_1: ModernBio = ModernBio { iter: 32, request_bio: 56 };

    pub const OP_BITS: u32 = 8;
    pub const OP_MASK: u64 = (1 << Self::OP_BITS) - 1;

    pub const OP_READ: u64 = 0;
    pub const OP_WRITE: u64 = 1;
    pub const OP_FLUSH: u64 = 2;
    pub const OP_DISCARD: u64 = 3;
    pub const OP_SECURE_ERASE: u64 = 5;
    pub const OP_WRITE_SAME: u64 = 7;
    pub const OP_WRITE_ZEROES: u64 = 9;
    pub const OP_ZONE_APPEND: u64 = 13;
    /// First of the SCSI/driver passthrough operations.
    pub const OP_PASSTHROUGH: u64 = 32;

    pub const REQ_FUA: u64 = 1 << 17;
    pub const REQ_PREFLUSH: u64 = 1 << 18;

    /// Layout revision for the series of `(major, minor)`, if one is known.
    pub fn for_series(major: u32, minor: u32) -> Option<&'static ModernBio> {
        match (major, minor) {
            (4, 14..=15) => Some(&Self::V4_14),
            (5, 0) => Some(&Self::V5_0),
            (5, 1..=10) => Some(&Self::V5_1),
            _ => None,
        }
    }

    fn iter_sector(&self) -> usize {
        self.iter
    }

    fn iter_size(&self) -> usize {
        self.iter + 8
    }
}

impl BioAccessor for ModernBio {
    fn op_flags(&self, bio: &BioSnapshot) -> u64 {
        u64::from(bio.read_u32(Self::OPF))
    }

    fn sector(&self, bio: &BioSnapshot) -> u64 {
        bio.read_u64(self.iter_sector())
    }

    fn size(&self, bio: &BioSnapshot) -> u32 {
        bio.read_u32(self.iter_size())
    }

    fn write_hint(&self, bio: &BioSnapshot) -> u16 {
        bio.read_u16(Self::WRITE_HINT)
    }

    fn decode_op(&self, opf: u64, _size: u32) -> Result<IoFlags> {
        let mut flags = match opf & Self::OP_MASK {
            Self::OP_READ => IoFlags::READ,
            Self::OP_WRITE | Self::OP_WRITE_SAME | Self::OP_WRITE_ZEROES => IoFlags::WRITE,
            Self::OP_FLUSH => IoFlags::FLUSH,
            Self::OP_DISCARD | Self::OP_SECURE_ERASE => IoFlags::DISCARD,
            op if op >= Self::OP_PASSTHROUGH => {
                return Err(Error::malformed(format!("passthrough operation code {} on a bio", op)))
            }
            // Zone management and newer data ops: odd codes carry data to the device.
            op if op & 1 == 1 => IoFlags::WRITE,
            _ => IoFlags::READ,
        };

        if opf & Self::REQ_PREFLUSH != 0 {
            flags |= IoFlags::FLUSH;
        }
        if opf & Self::REQ_FUA != 0 {
            flags |= IoFlags::FUA;
        }
        Ok(flags)
    }

    fn completion_errno(&self, bio: &BioSnapshot, reported: i32) -> i32 {
        if reported != 0 {
            return reported;
        }
        -blk_status_errno(bio.0[Self::STATUS])
    }

    fn bio_next_offset(&self) -> u32 {
        Self::NEXT as u32
    }

    fn bio_size_offset(&self) -> u32 {
        self.iter_size() as u32
    }

    fn request_bio_offset(&self) -> u32 {
        self.request_bio
    }

    fn encode(&self, opf: u64, sector: u64, size: u32, write_hint: u16) -> BioSnapshot {
        let (sector_at, size_at) = (self.iter_sector(), self.iter_size());
        let mut bio = BioSnapshot::default();
        bio.0[Self::OPF..Self::OPF + 4].copy_from_slice(&(opf as u32).to_ne_bytes());
        bio.0[Self::WRITE_HINT..Self::WRITE_HINT + 2].copy_from_slice(&write_hint.to_ne_bytes());
        bio.0[sector_at..sector_at + 8].copy_from_slice(&sector.to_ne_bytes());
        bio.0[size_at..size_at + 4].copy_from_slice(&size.to_ne_bytes());
        bio
    }
}

/// `blk_status_t` to errno, as `blk_status_to_errno` does.
fn blk_status_errno(status: u8) -> i32 {
    match status {
        0 => 0,
        1 => 95,  // NOTSUPP -> EOPNOTSUPP
        2 => 110, // TIMEOUT -> ETIMEDOUT
        3 => 28,  // NOSPC
        4 => 67,  // TRANSPORT -> ENOLINK
        5 => 121, // TARGET -> EREMOTEIO
        6 => 52,  // NEXUS -> EBADE
        7 => 61,  // MEDIUM -> ENODATA
        8 => 84,  // PROTECTION -> EILSEQ
        9 => 12,  // RESOURCE -> ENOMEM
        11 => 78, // DM_REQUEUE -> EREMCHG
        12 => 11, // AGAIN
        13 => 16, // DEV_RESOURCE -> EBUSY
        _ => 5,   // IOERR and anything unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_round_trips_fields() {
        let bio = LegacyBio.encode(LegacyBio::REQ_WRITE, 2048, 8192, 0);
        assert_eq!(LegacyBio.sector(&bio), 2048);
        assert_eq!(LegacyBio.size(&bio), 8192);
        assert_eq!(LegacyBio.op_flags(&bio), LegacyBio::REQ_WRITE);
        assert_eq!(LegacyBio.write_hint(&bio), 0);
    }

    #[test]
    fn test_modern_reads_iter_and_hint() {
        for layout in [&ModernBio::V4_14, &ModernBio::V5_0, &ModernBio::V5_1] {
            let bio = layout.encode(ModernBio::OP_WRITE, 100, 4096, 3);
            assert_eq!(layout.sector(&bio), 100);
            assert_eq!(layout.size(&bio), 4096);
            assert_eq!(layout.write_hint(&bio), 3);
        }
    }

    #[test]
    fn test_bi_iter_moved_in_5_1() {
        let bio = ModernBio::V5_1.encode(ModernBio::OP_WRITE, 100, 4096, 0);
        assert_eq!(bio.read_u64(32), 100);
        assert_eq!(bio.read_u32(40), 4096);
        // Read through the 5.0 layout, the same bytes are not the position.
        assert_ne!(ModernBio::V5_0.sector(&bio), 100);

        let bio = ModernBio::V4_14.encode(ModernBio::OP_WRITE, 100, 4096, 0);
        assert_eq!(bio.read_u64(40), 100);
        assert_eq!(bio.read_u32(48), 4096);
    }

    #[test]
    fn test_layout_revision_per_series() {
        assert_eq!(ModernBio::for_series(4, 14), Some(&ModernBio::V4_14));
        assert_eq!(ModernBio::for_series(4, 15), Some(&ModernBio::V4_14));
        assert_eq!(ModernBio::for_series(5, 0), Some(&ModernBio::V5_0));
        assert_eq!(ModernBio::for_series(5, 4), Some(&ModernBio::V5_1));
        assert_eq!(ModernBio::for_series(5, 10), Some(&ModernBio::V5_1));
        for (major, minor) in [(4, 13), (4, 16), (4, 20), (5, 11)] {
            assert_eq!(ModernBio::for_series(major, minor), None, "{}.{}", major, minor);
        }

        assert_eq!(ModernBio::V4_14.request_bio_offset(), 120);
        assert_eq!(ModernBio::V5_0.request_bio_offset(), 56);
        assert_eq!(ModernBio::V5_1.bio_size_offset(), 40);
    }

    #[test]
    fn test_legacy_decode() {
        let decode = |rw, size| LegacyBio.decode_op(rw, size).unwrap();

        assert_eq!(decode(0, 4096), IoFlags::READ);
        assert_eq!(decode(LegacyBio::REQ_WRITE, 4096), IoFlags::WRITE);
        assert_eq!(
            decode(LegacyBio::REQ_WRITE | LegacyBio::REQ_DISCARD, 1 << 20),
            IoFlags::DISCARD
        );
        assert_eq!(decode(LegacyBio::REQ_WRITE | LegacyBio::REQ_FLUSH, 0), IoFlags::FLUSH);
        assert_eq!(
            decode(LegacyBio::REQ_WRITE | LegacyBio::REQ_FLUSH | LegacyBio::REQ_FUA, 4096),
            IoFlags::WRITE | IoFlags::FLUSH | IoFlags::FUA
        );
    }

    #[test]
    fn test_modern_decode() {
        let decode = |opf, size| ModernBio::V5_1.decode_op(opf, size).unwrap();

        assert_eq!(decode(ModernBio::OP_READ, 4096), IoFlags::READ);
        assert_eq!(decode(ModernBio::OP_WRITE_ZEROES, 4096), IoFlags::WRITE);
        assert_eq!(decode(ModernBio::OP_SECURE_ERASE, 4096), IoFlags::DISCARD);
        assert_eq!(decode(ModernBio::OP_FLUSH, 0), IoFlags::FLUSH);
        assert_eq!(
            decode(ModernBio::OP_WRITE | ModernBio::REQ_PREFLUSH | ModernBio::REQ_FUA, 4096),
            IoFlags::WRITE | IoFlags::FLUSH | IoFlags::FUA
        );
    }

    #[test]
    fn test_modern_decode_falls_back_to_data_direction() {
        let decode = |opf| ModernBio::V5_1.decode_op(opf, 4096).unwrap();

        assert_eq!(decode(ModernBio::OP_ZONE_APPEND), IoFlags::WRITE);
        assert_eq!(decode(ModernBio::OP_ZONE_APPEND | ModernBio::REQ_FUA), IoFlags::WRITE | IoFlags::FUA);
        // REQ_OP_ZONE_RESET, REQ_OP_ZONE_OPEN
        assert_eq!(decode(6), IoFlags::READ);
        assert_eq!(decode(10), IoFlags::READ);
        // REQ_OP_ZONE_CLOSE
        assert_eq!(decode(11), IoFlags::WRITE);
    }

    #[test]
    fn test_completion_errno() {
        let modern = &ModernBio::V5_1;
        let mut bio = modern.encode(ModernBio::OP_WRITE, 0, 0, 0);
        assert_eq!(modern.completion_errno(&bio, 0), 0);
        bio.0[ModernBio::STATUS] = 10;
        assert_eq!(modern.completion_errno(&bio, 0), -5);
        bio.0[ModernBio::STATUS] = 3;
        assert_eq!(modern.completion_errno(&bio, 0), -28);
        assert_eq!(modern.completion_errno(&bio, -110), -110);

        let bio = LegacyBio.encode(LegacyBio::REQ_WRITE, 0, 0, 0);
        assert_eq!(LegacyBio.completion_errno(&bio, -5), -5);
    }

    #[test]
    fn test_modern_rejects_passthrough_ops() {
        // REQ_OP_SCSI_IN, REQ_OP_DRV_OUT
        assert!(ModernBio::V4_14.decode_op(32, 512).is_err());
        assert!(ModernBio::V4_14.decode_op(35, 512).is_err());
    }
}
