use std::fmt;

use thiserror::Error;

/// Boxed error returned by tracepoint hosts and other pluggable backends.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// No ABI profile matches the running kernel. Fatal at load time.
    #[error("Unsupported kernel {release}: {reason}")]
    UnsupportedKernel { release: String, reason: String },

    /// A kernel symbol required by the active profile is missing or hidden.
    #[error("Kernel symbol not found: {name} ({reason})")]
    SymbolNotFound { name: String, reason: String },

    /// A probe in a group failed to register; every earlier probe in the
    /// group has already been unregistered when this is returned.
    #[error("Failed to register probe {probe} at index {index}: {source}")]
    RegistrationFailed {
        index: usize,
        probe: String,
        #[source]
        source: BoxError,
    },

    #[error("Failed to unregister {} probe(s): {}", .failures.len(), ProbeFailures(.failures))]
    UnregistrationFailed { failures: Vec<ProbeFailure> },

    /// A single event could not be decoded. Never fatal.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEvent(reason.into())
    }

    /// Whether the error must abort module load.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedKernel { .. }
                | Self::SymbolNotFound { .. }
                | Self::RegistrationFailed { .. }
                | Self::Io(_)
        )
    }
}

/// One probe that could not be unregistered during teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeFailure {
    pub probe: String,
    pub reason: String,
}

struct ProbeFailures<'a>(&'a [ProbeFailure]);

impl fmt::Display for ProbeFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", failure.probe, failure.reason)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistration_failed_lists_every_probe() {
        let err = Error::UnregistrationFailed {
            failures: vec![
                ProbeFailure { probe: "block_rq_complete".into(), reason: "busy".into() },
                ProbeFailure { probe: "block_bio_complete".into(), reason: "gone".into() },
            ],
        };

        assert_eq!(
            err.to_string(),
            "Failed to unregister 2 probe(s): block_rq_complete: busy; block_bio_complete: gone"
        );
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_registration_failed_keeps_source() {
        let err = Error::RegistrationFailed {
            index: 1,
            probe: "block_rq_complete".into(),
            source: "attach refused".into(),
        };

        assert!(err.is_fatal());
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("attach refused"));
    }

    #[test]
    fn test_malformed_is_not_fatal() {
        assert!(!Error::malformed("short snapshot").is_fatal());
    }
}
