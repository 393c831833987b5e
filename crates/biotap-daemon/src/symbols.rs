//! One-time lookup of kernel tracepoint descriptors by symbol name.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::num::NonZeroU64;
use std::path::PathBuf;

use biotap_common::{Error, Result};
use tracing::{debug, info};

const KALLSYMS_PATH: &str = "/proc/kallsyms";

/// Prefix of the `struct tracepoint` descriptor symbol for a tracepoint.
pub const TRACEPOINT_SYMBOL_PREFIX: &str = "__tracepoint_";

/// Validated reference to a tracepoint. Only the locator builds resolved
/// handles, so holders never re-check or re-cast the address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TracepointHandle {
    tracepoint: String,
    address: Option<NonZeroU64>,
}

impl TracepointHandle {
    /// Handle for a tracepoint that is part of the linkable surface.
    pub fn fixed(tracepoint: &str) -> Self {
        Self { tracepoint: tracepoint.to_string(), address: None }
    }

    pub fn tracepoint(&self) -> &str {
        &self.tracepoint
    }

    /// Descriptor address for symbol-resolved handles.
    pub fn address(&self) -> Option<u64> {
        self.address.map(NonZeroU64::get)
    }
}

impl fmt::Display for TracepointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(addr) => write!(f, "{}@{:#x}", self.tracepoint, addr),
            None => write!(f, "{}(static)", self.tracepoint),
        }
    }
}

/// Something that can map an exported kernel symbol to an address.
pub trait SymbolSource: Send {
    /// `Ok(None)` when the symbol is absent.
    fn lookup(&mut self, symbol: &str) -> Result<Option<u64>>;
}

/// Reads `/proc/kallsyms` (or a copy of it).
#[derive(Debug, Clone)]
pub struct KallsymsSource {
    path: PathBuf,
}

impl Default for KallsymsSource {
    fn default() -> Self {
        Self { path: PathBuf::from(KALLSYMS_PATH) }
    }
}

impl KallsymsSource {
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Find `symbol` in kallsyms text (`address type name [module]`).
pub fn parse_kallsyms(contents: &str, symbol: &str) -> Option<u64> {
    contents.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let address = fields.next()?;
        let _kind = fields.next()?;
        let name = fields.next()?;
        if name != symbol {
            return None;
        }
        u64::from_str_radix(address, 16).ok()
    })
}

impl SymbolSource for KallsymsSource {
    fn lookup(&mut self, symbol: &str) -> Result<Option<u64>> {
        let contents = fs::read_to_string(&self.path)?;
        Ok(parse_kallsyms(&contents, symbol))
    }
}

/// Caches resolved handles for the lifetime of the process.
pub struct SymbolLocator {
    source: Box<dyn SymbolSource>,
    resolved: HashMap<String, TracepointHandle>,
}

impl SymbolLocator {
    pub fn new(source: impl SymbolSource + 'static) -> Self {
        Self { source: Box::new(source), resolved: HashMap::new() }
    }

    pub fn kallsyms() -> Self {
        Self::new(KallsymsSource::default())
    }

    /// Resolve the descriptor of `tracepoint`. Repeated calls return the
    /// cached handle without consulting the symbol source.
    pub fn locate(&mut self, tracepoint: &str) -> Result<TracepointHandle> {
        if let Some(handle) = self.resolved.get(tracepoint) {
            return Ok(handle.clone());
        }

        let symbol = format!("{}{}", TRACEPOINT_SYMBOL_PREFIX, tracepoint);
        debug!("Looking up kernel symbol {}", symbol);

        let address = self
            .source
            .lookup(&symbol)?
            .ok_or_else(|| Error::SymbolNotFound {
                name: symbol.clone(),
                reason: "not exported by the running kernel".to_string(),
            })?;

        // kallsyms reports zero addresses when kptr_restrict hides them.
        let address = NonZeroU64::new(address).ok_or_else(|| Error::SymbolNotFound {
            name: symbol.clone(),
            reason: "address is null (kptr_restrict?)".to_string(),
        })?;

        let handle = TracepointHandle { tracepoint: tracepoint.to_string(), address: Some(address) };
        info!("Resolved tracepoint {}", handle);
        self.resolved.insert(tracepoint.to_string(), handle.clone());
        Ok(handle)
    }

    pub fn cached(&self) -> usize {
        self.resolved.len()
    }
}
