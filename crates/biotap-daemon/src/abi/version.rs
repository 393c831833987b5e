use std::fmt;
use std::fs;

use biotap_common::{Error, Result};
use tracing::debug;

const OS_RELEASE_PATH: &str = "/etc/os-release";

/// Distribution IDs that ship Red Hat kernels with backported features.
const RHEL_FAMILY: &[&str] = &["rhel", "centos", "rocky", "almalinux", "ol"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KernelVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Parse the leading `major.minor[.patch]` of a kernel release string,
    /// e.g. `4.15.0-112-generic` or `3.10.0-1062.el7.x86_64`.
    pub fn parse(release: &str) -> Option<Self> {
        let numeric = release.split(|c: char| !(c.is_ascii_digit() || c == '.')).next()?;
        let mut parts = numeric.split('.').filter(|p| !p.is_empty());

        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);

        Some(Self { major, minor, patch })
    }

    /// Same major and minor series.
    pub fn in_series(&self, major: u32, minor: u32) -> bool {
        self.major == major && self.minor == minor
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Red Hat family release marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RhelRelease {
    pub major: u32,
    pub minor: u32,
}

impl RhelRelease {
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }

    /// Extract the release from `/etc/os-release` contents.
    pub fn from_os_release(contents: &str) -> Option<Self> {
        let mut id = None;
        let mut id_like = None;
        let mut version_id = None;

        for line in contents.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "ID" => id = Some(value.to_string()),
                "ID_LIKE" => id_like = Some(value.to_string()),
                "VERSION_ID" => version_id = Some(value.to_string()),
                _ => {}
            }
        }

        let is_rhel_family = id.as_deref().is_some_and(|id| RHEL_FAMILY.contains(&id))
            || id_like.as_deref().is_some_and(|like| like.split_whitespace().any(|l| l == "rhel"));
        if !is_rhel_family {
            return None;
        }

        let version_id = version_id?;
        let mut parts = version_id.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().and_then(|m| m.parse().ok()).unwrap_or(0);
        Some(Self { major, minor })
    }
}

/// Everything the resolver is allowed to look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelIdentity {
    pub release: String,
    pub version: KernelVersion,
    pub rhel: Option<RhelRelease>,
}

impl KernelIdentity {
    /// Build an identity from a release string and optional os-release text.
    pub fn from_parts(release: &str, os_release: Option<&str>) -> Result<Self> {
        let version = KernelVersion::parse(release).ok_or_else(|| Error::UnsupportedKernel {
            release: release.to_string(),
            reason: "unparseable kernel release".to_string(),
        })?;
        let rhel = os_release.and_then(RhelRelease::from_os_release);

        Ok(Self { release: release.to_string(), version, rhel })
    }

    /// Identity of the running kernel.
    pub fn detect() -> Result<Self> {
        let uts = nix::sys::utsname::uname().map_err(std::io::Error::from)?;
        let release = uts.release().to_string_lossy().into_owned();

        let os_release = match fs::read_to_string(OS_RELEASE_PATH) {
            Ok(contents) => Some(contents),
            Err(e) => {
                debug!("Could not read {}: {}", OS_RELEASE_PATH, e);
                None
            }
        };

        Self::from_parts(&release, os_release.as_deref())
    }
}
