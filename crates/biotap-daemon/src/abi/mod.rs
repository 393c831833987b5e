//! Kernel ABI profile resolution.
//!
//! A profile is chosen exactly once at load time from the kernel release and
//! the distribution marker. Nothing downstream looks at kernel versions
//! again: field extraction, tracepoint strategies and the portable accessor
//! variants all hang off the resolved [`AbiProfile`].

pub mod layout;
pub mod version;

use std::fmt;

use biotap_common::{Error, Result};
use tracing::info;

pub use layout::{BioAccessor, BioSnapshot, LegacyBio, ModernBio, BIO_SNAPSHOT_LEN};
pub use version::{KernelIdentity, KernelVersion, RhelRelease};

use crate::ebpf::block_trace::{
    ProbeLayout, BIO_ARGS_QUEUE_BIO, BIO_ARGS_QUEUE_BIO_ERROR, RQ_ARGS_QUEUE_REQUEST_BYTES,
    RQ_ARGS_REQUEST_ERROR_BYTES,
};
use crate::registrar::{ProbeSpec, ResolutionStrategy};

const LEGACY_FIRST: KernelVersion = KernelVersion::new(3, 10, 0);
const MODERN_FIRST: KernelVersion = KernelVersion::new(4, 14, 0);

/// Program and tracepoint names shared with the eBPF object.
pub const BLOCK_BIO_QUEUE: &str = "block_bio_queue";
pub const BLOCK_BIO_COMPLETE: &str = "block_bio_complete";
pub const BLOCK_RQ_COMPLETE: &str = "block_rq_complete";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiGeneration {
    /// 3.10 series (CentOS/RHEL 7 class).
    Legacy,
    /// 4.14, 4.15 and 5.0 through 5.10 (Ubuntu 18.04 class).
    Modern,
}

impl AbiGeneration {
    pub const ALL: [AbiGeneration; 2] = [AbiGeneration::Legacy, AbiGeneration::Modern];

    /// Field layout for `version`, or `None` if no layout of this
    /// generation is known for that series.
    pub fn bio_accessor(&self, version: KernelVersion) -> Option<&'static dyn BioAccessor> {
        match self {
            Self::Legacy if version.in_series(3, 10) => Some(&LegacyBio),
            Self::Legacy => None,
            Self::Modern => ModernBio::for_series(version.major, version.minor)
                .map(|layout| layout as &'static dyn BioAccessor),
        }
    }
}

impl fmt::Display for AbiGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => write!(f, "legacy (3.10)"),
            Self::Modern => write!(f, "modern (4.14-4.15, 5.0-5.10)"),
        }
    }
}

/// Signature of `fsnotify_add_mark` style attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsnotifyMarkAbi {
    /// `(mark, inode, mnt, allow_dups)`
    Inode,
    /// `(mark, connp, type, allow_dups)`
    ObjectList,
    /// `(mark, connp, type, allow_dups, fsid)`
    ObjectListWithFsid,
}

impl FsnotifyMarkAbi {
    pub fn argument_count(&self) -> usize {
        match self {
            Self::Inode | Self::ObjectList => 4,
            Self::ObjectListWithFsid => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessCheckAbi {
    /// `access_ok(type, addr, size)`
    Typed,
    /// `access_ok(addr, size)`
    Untyped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResultAbi {
    /// Plain `int` result.
    Int,
    /// `vm_fault_t` bit set.
    VmFault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BdevLookupAbi {
    Path,
    /// 4.15 only: `lookup_bdev(path, mask)`.
    PathWithMask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbiFeatures {
    pub write_hint: bool,
    pub fsnotify_mark: FsnotifyMarkAbi,
    pub access_check: AccessCheckAbi,
    pub fault_result: FaultResultAbi,
    pub bdev_lookup: BdevLookupAbi,
}

impl AbiFeatures {
    fn select(version: KernelVersion, rhel: Option<RhelRelease>) -> Self {
        let rhel_at_least = |major, minor| rhel.is_some_and(|r| r.at_least(major, minor));

        let fsnotify_mark = if version < KernelVersion::new(4, 18, 0) && !rhel_at_least(7, 7) {
            FsnotifyMarkAbi::Inode
        } else if version < KernelVersion::new(5, 1, 0) {
            FsnotifyMarkAbi::ObjectList
        } else {
            FsnotifyMarkAbi::ObjectListWithFsid
        };

        let access_check = if version >= KernelVersion::new(5, 0, 0) || rhel_at_least(8, 0) {
            AccessCheckAbi::Untyped
        } else {
            AccessCheckAbi::Typed
        };

        let fault_result = if version >= KernelVersion::new(4, 17, 0) {
            FaultResultAbi::VmFault
        } else {
            FaultResultAbi::Int
        };

        let bdev_lookup = if version.in_series(4, 15) {
            BdevLookupAbi::PathWithMask
        } else {
            BdevLookupAbi::Path
        };

        Self {
            write_hint: version >= KernelVersion::new(4, 13, 0),
            fsnotify_mark,
            access_check,
            fault_result,
            bdev_lookup,
        }
    }
}

/// The ABI bound to the running kernel. Immutable once resolved.
#[derive(Debug, Clone)]
pub struct AbiProfile {
    generation: AbiGeneration,
    kernel: KernelVersion,
    features: AbiFeatures,
    bio: &'static dyn BioAccessor,
}

impl AbiProfile {
    pub fn generation(&self) -> AbiGeneration {
        self.generation
    }

    pub fn kernel(&self) -> KernelVersion {
        self.kernel
    }

    pub fn features(&self) -> &AbiFeatures {
        &self.features
    }

    pub fn bio(&self) -> &'static dyn BioAccessor {
        self.bio
    }

    fn strategy(&self, tracepoint: &str) -> ResolutionStrategy {
        match (self.generation, tracepoint) {
            (AbiGeneration::Modern, BLOCK_BIO_QUEUE | BLOCK_RQ_COMPLETE) => {
                ResolutionStrategy::SymbolLookup
            }
            _ => ResolutionStrategy::Static,
        }
    }

    fn probe(&self, name: &'static str) -> ProbeSpec {
        ProbeSpec::new(name, name, self.strategy(name))
    }

    /// Both completion paths. Always registered together.
    pub fn completion_group(&self) -> Vec<ProbeSpec> {
        vec![self.probe(BLOCK_BIO_COMPLETE), self.probe(BLOCK_RQ_COMPLETE)]
    }

    pub fn queue_group(&self) -> Vec<ProbeSpec> {
        vec![self.probe(BLOCK_BIO_QUEUE)]
    }

    /// Registration order for load: completions first, so every queue event
    /// that is observed already has a live completion path.
    pub fn probe_groups(&self) -> Vec<Vec<ProbeSpec>> {
        vec![self.completion_group(), self.queue_group()]
    }

    /// Offsets and signatures the eBPF side needs to walk request bio chains.
    pub fn probe_layout(&self) -> ProbeLayout {
        let (rq_complete_args, bio_complete_args) = match self.generation {
            AbiGeneration::Legacy => (RQ_ARGS_QUEUE_REQUEST_BYTES, BIO_ARGS_QUEUE_BIO_ERROR),
            AbiGeneration::Modern => (RQ_ARGS_REQUEST_ERROR_BYTES, BIO_ARGS_QUEUE_BIO),
        };

        ProbeLayout {
            request_bio_offset: self.bio.request_bio_offset(),
            bio_next_offset: self.bio.bio_next_offset(),
            bio_size_offset: self.bio.bio_size_offset(),
            rq_complete_args,
            bio_complete_args,
        }
    }

    /// Profile for a generation regardless of host kernel; the version is
    /// the first release of the generation.
    pub fn for_generation(generation: AbiGeneration) -> Self {
        let (kernel, bio): (_, &'static dyn BioAccessor) = match generation {
            AbiGeneration::Legacy => (LEGACY_FIRST, &LegacyBio),
            AbiGeneration::Modern => (MODERN_FIRST, &ModernBio::V4_14),
        };
        Self::build(generation, kernel, None, bio)
    }

    fn build(
        generation: AbiGeneration,
        kernel: KernelVersion,
        rhel: Option<RhelRelease>,
        bio: &'static dyn BioAccessor,
    ) -> Self {
        Self { generation, kernel, features: AbiFeatures::select(kernel, rhel), bio }
    }
}

/// Select the single profile matching `identity`, or refuse.
pub fn resolve(identity: &KernelIdentity) -> Result<AbiProfile> {
    let version = identity.version;

    let generation = if version.major == 3 {
        AbiGeneration::Legacy
    } else {
        AbiGeneration::Modern
    };
    let Some(bio) = generation.bio_accessor(version) else {
        return Err(Error::UnsupportedKernel {
            release: identity.release.clone(),
            reason: format!(
                "no known bio/request layout for kernel {} (supported: 3.10, 4.14-4.15, \
                 5.0-5.10); refusing to guess field offsets",
                version
            ),
        });
    };

    let profile = AbiProfile::build(generation, version, identity.rhel, bio);
    info!(
        "Resolved ABI profile {} for kernel {} (rhel marker: {:?})",
        generation, identity.release, identity.rhel
    );
    Ok(profile)
}
