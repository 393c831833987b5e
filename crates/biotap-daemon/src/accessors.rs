//! Portable forms of kernel helpers whose signatures drift between releases.
//!
//! Each helper takes the resolved [`AbiProfile`] and picks the shape that
//! matches it; callers never branch on kernel versions themselves.

use std::io;
use std::path::Path;

use bitflags::bitflags;
use biotap_common::{Error, Result};
use nix::sys::stat::{self, SFlag};

use crate::abi::{AbiProfile, AccessCheckAbi, BdevLookupAbi, FaultResultAbi};

/// Highest user address plus one on x86_64 (`TASK_SIZE_MAX`).
pub const USER_ADDRESS_LIMIT: u64 = 0x7fff_ffff_f000;

/// Width of the minor number in the kernel-internal `dev_t`.
pub const MINORBITS: u32 = 20;
const MINORMASK: u32 = (1 << MINORBITS) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// The `access_ok` invocation for a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessCheck {
    Typed { kind: AccessKind, addr: u64, len: u64 },
    Untyped { addr: u64, len: u64 },
}

impl AccessCheck {
    pub fn new(profile: &AbiProfile, kind: AccessKind, addr: u64, len: u64) -> Self {
        match profile.features().access_check {
            AccessCheckAbi::Typed => Self::Typed { kind, addr, len },
            AccessCheckAbi::Untyped => Self::Untyped { addr, len },
        }
    }

    /// Range check as performed by the kernel: the whole range must lie
    /// below the user address limit without wrapping.
    pub fn passes(&self) -> bool {
        let (addr, len) = match *self {
            Self::Typed { addr, len, .. } | Self::Untyped { addr, len } => (addr, len),
        };
        addr.checked_add(len).is_some_and(|end| end <= USER_ADDRESS_LIMIT)
    }
}

pub fn access_ok(profile: &AbiProfile, kind: AccessKind, addr: u64, len: u64) -> bool {
    AccessCheck::new(profile, kind, addr, len).passes()
}

bitflags! {
    /// `VM_FAULT_*` bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmFault: u32 {
        const OOM = 0x0001;
        const SIGBUS = 0x0002;
        const MAJOR = 0x0004;
        const WRITE = 0x0008;
        const HWPOISON = 0x0010;
        const HWPOISON_LARGE = 0x0020;
        const SIGSEGV = 0x0040;
        const NOPAGE = 0x0100;
        const LOCKED = 0x0200;
        const RETRY = 0x0400;
        const FALLBACK = 0x0800;
        const DONE_COW = 0x1000;
        const NEEDDSYNC = 0x2000;
    }
}

impl VmFault {
    pub const ERROR: VmFault = VmFault::OOM
        .union(VmFault::SIGBUS)
        .union(VmFault::SIGSEGV)
        .union(VmFault::HWPOISON)
        .union(VmFault::HWPOISON_LARGE)
        .union(VmFault::FALLBACK);
}

/// A page-fault handler result, whatever its declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultResult {
    bits: VmFault,
}

impl FaultResult {
    /// Interpret `raw` as the fault result type of `profile`.
    pub fn from_raw(profile: &AbiProfile, raw: i64) -> Result<Self> {
        let bits = match profile.features().fault_result {
            FaultResultAbi::Int => i32::try_from(raw)
                .ok()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| Error::malformed(format!("fault result {} is not a valid int", raw)))?,
            FaultResultAbi::VmFault => u32::try_from(raw)
                .map_err(|_| Error::malformed(format!("fault result {:#x} exceeds vm_fault_t", raw)))?,
        };

        let bits = VmFault::from_bits(bits)
            .ok_or_else(|| Error::malformed(format!("unknown fault bits {:#x}", bits)))?;
        Ok(Self { bits })
    }

    pub fn bits(&self) -> VmFault {
        self.bits
    }

    pub fn is_error(&self) -> bool {
        self.bits.intersects(VmFault::ERROR)
    }

    pub fn is_major(&self) -> bool {
        self.bits.contains(VmFault::MAJOR)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockDevice {
    pub major: u32,
    pub minor: u32,
}

impl BlockDevice {
    /// Kernel-internal `dev_t` (`MKDEV`).
    pub fn kernel_dev(&self) -> u32 {
        (self.major << MINORBITS) | (self.minor & MINORMASK)
    }

    pub fn from_kernel_dev(dev: u32) -> Self {
        Self { major: dev >> MINORBITS, minor: dev & MINORMASK }
    }
}

/// The `lookup_bdev` invocation for a profile: the 4.15 series takes an
/// extra permission mask, always zero here.
pub fn bdev_lookup_mask(profile: &AbiProfile) -> Option<u32> {
    match profile.features().bdev_lookup {
        BdevLookupAbi::Path => None,
        BdevLookupAbi::PathWithMask => Some(0),
    }
}

/// Resolve a block device node to its device numbers.
pub fn lookup_block_device(path: impl AsRef<Path>) -> Result<BlockDevice> {
    let path = path.as_ref();
    let st = stat::stat(path).map_err(io::Error::from)?;

    if SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT != SFlag::S_IFBLK {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a block device", path.display()),
        )));
    }

    Ok(BlockDevice { major: stat::major(st.st_rdev) as u32, minor: stat::minor(st.st_rdev) as u32 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{resolve, AbiGeneration, KernelIdentity};

    fn profile(release: &str) -> AbiProfile {
        resolve(&KernelIdentity::from_parts(release, None).unwrap()).unwrap()
    }

    #[test]
    fn test_access_check_shape_follows_profile() {
        let old = profile("4.15.0-20-generic");
        assert_eq!(
            AccessCheck::new(&old, AccessKind::Write, 0x1000, 16),
            AccessCheck::Typed { kind: AccessKind::Write, addr: 0x1000, len: 16 }
        );

        let new = profile("5.4.0-42-generic");
        assert_eq!(
            AccessCheck::new(&new, AccessKind::Write, 0x1000, 16),
            AccessCheck::Untyped { addr: 0x1000, len: 16 }
        );
    }

    #[test]
    fn test_access_ok_range() {
        let profile = AbiProfile::for_generation(AbiGeneration::Modern);
        assert!(access_ok(&profile, AccessKind::Read, 0x1000, 4096));
        assert!(access_ok(&profile, AccessKind::Read, USER_ADDRESS_LIMIT - 16, 16));
        assert!(!access_ok(&profile, AccessKind::Read, USER_ADDRESS_LIMIT - 16, 17));
        assert!(!access_ok(&profile, AccessKind::Write, 0xffff_8880_0000_0000, 8));
        assert!(!access_ok(&profile, AccessKind::Write, u64::MAX, 2));
    }

    #[test]
    fn test_fault_result() {
        let legacy = profile("4.15.0-20-generic");
        let major = FaultResult::from_raw(&legacy, 0x4).unwrap();
        assert!(major.is_major());
        assert!(!major.is_error());
        assert!(FaultResult::from_raw(&legacy, -14).is_err());

        let modern = profile("5.4.0");
        let sigbus = FaultResult::from_raw(&modern, 0x2).unwrap();
        assert!(sigbus.is_error());
        assert!(FaultResult::from_raw(&modern, 1 << 33).is_err());
        assert!(FaultResult::from_raw(&modern, 0x8000).is_err());
    }

    #[test]
    fn test_bdev_lookup_mask() {
        assert_eq!(bdev_lookup_mask(&profile("4.15.0-112-generic")), Some(0));
        assert_eq!(bdev_lookup_mask(&profile("4.14.200")), None);
        assert_eq!(bdev_lookup_mask(&profile("5.10.0")), None);
    }

    #[test]
    fn test_kernel_dev_packing() {
        let sda1 = BlockDevice { major: 8, minor: 1 };
        assert_eq!(sda1.kernel_dev(), 0x0080_0001);
        assert_eq!(BlockDevice::from_kernel_dev(sda1.kernel_dev()), sda1);

        let nvme = BlockDevice { major: 259, minor: 0x12345 };
        assert_eq!(BlockDevice::from_kernel_dev(nvme.kernel_dev()), nvme);
    }

    #[test]
    fn test_lookup_rejects_non_block_files() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = lookup_block_device(file.path()).unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::InvalidInput));

        let err = lookup_block_device("/nonexistent/biotap-device").unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::NotFound));
    }
}
