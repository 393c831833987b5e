pub mod block_trace;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aya::maps::{Array, MapData, RingBuf};
use aya::programs::raw_trace_point::RawTracePointLinkId;
use aya::programs::RawTracePoint;
use aya::Bpf;
use aya_log::BpfLogger;
use biotap_common::BoxError;
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registrar::{ProbeSpec, TracepointHost};
use crate::symbols::TracepointHandle;
use crate::tracer::BlockTracer;
use block_trace::{ProbeLayout, EVENTS_MAP, LAYOUT_MAP};

/// Runtime override for the object location.
pub const BPF_PATH_ENV: &str = "BPF_BLOCK_TRACE_PATH";

#[derive(Error, Debug)]
pub enum EbpfError {
    #[error("No block-trace eBPF object configured (set bpf.object_path or BPF_BLOCK_TRACE_PATH)")]
    ObjectNotConfigured,

    #[error("Failed to read eBPF object {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load eBPF object: {0}")]
    Load(#[from] aya::BpfError),

    #[error("eBPF object has no program named {0}")]
    MissingProgram(String),

    #[error("eBPF object has no map named {0}")]
    MissingMap(&'static str),

    #[error("eBPF map error: {0}")]
    Map(#[from] aya::maps::MapError),

    #[error("eBPF program error: {0}")]
    Program(#[from] aya::programs::ProgramError),
}

/// Pick the object file: explicit path, then the build-time copy, then the
/// runtime environment.
pub fn object_path(configured: Option<&Path>) -> Result<PathBuf, EbpfError> {
    if let Some(path) = configured {
        return Ok(path.to_path_buf());
    }
    if let Some(path) = option_env!("BPF_BLOCK_TRACE_FILE").filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    match std::env::var(BPF_PATH_ENV) {
        Ok(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Err(EbpfError::ObjectNotConfigured),
    }
}

/// The loaded `block-trace` object, before any program is attached.
pub struct BlockTraceProgram {
    bpf: Bpf,
}

impl BlockTraceProgram {
    pub fn load(path: &Path) -> Result<Self, EbpfError> {
        info!("Loading block-trace eBPF object from {:?}", path);

        let elf_bytes = std::fs::read(path)
            .map_err(|source| EbpfError::Read { path: path.to_path_buf(), source })?;
        let mut bpf = Bpf::load(&elf_bytes)?;

        if let Err(e) = BpfLogger::init(&mut bpf) {
            warn!("Failed to initialize eBPF logger: {}", e);
        }

        info!("Loaded block-trace eBPF object ({} bytes)", elf_bytes.len());
        Ok(Self { bpf })
    }

    /// Must run before any probe is attached: the programs read it on
    /// every event.
    pub fn write_layout(&mut self, layout: ProbeLayout) -> Result<(), EbpfError> {
        let map = self.bpf.map_mut(LAYOUT_MAP).ok_or(EbpfError::MissingMap(LAYOUT_MAP))?;
        let mut array: Array<&mut MapData, ProbeLayout> = Array::try_from(map)?;
        array.set(0, layout, 0)?;
        debug!("Wrote probe layout {:?}", layout);
        Ok(())
    }

    pub fn take_events(&mut self) -> Result<RingBuf<MapData>, EbpfError> {
        let map = self.bpf.take_map(EVENTS_MAP).ok_or(EbpfError::MissingMap(EVENTS_MAP))?;
        Ok(RingBuf::try_from(map)?)
    }

    pub fn into_host(self) -> AyaTracepointHost {
        AyaTracepointHost { bpf: self.bpf, loaded: HashSet::new() }
    }
}

/// Attaches the object's raw tracepoint programs.
pub struct AyaTracepointHost {
    bpf: Bpf,
    loaded: HashSet<&'static str>,
}

impl AyaTracepointHost {
    fn program(&mut self, name: &str) -> Result<&mut RawTracePoint, EbpfError> {
        let program =
            self.bpf.program_mut(name).ok_or_else(|| EbpfError::MissingProgram(name.to_string()))?;
        Ok(program.try_into()?)
    }
}

impl TracepointHost for AyaTracepointHost {
    type Link = RawTracePointLinkId;

    fn register(
        &mut self,
        probe: &ProbeSpec,
        target: &TracepointHandle,
    ) -> Result<Self::Link, BoxError> {
        let first_load = !self.loaded.contains(probe.program());
        let program = self.program(probe.program())?;
        if first_load {
            program.load()?;
        }
        self.loaded.insert(probe.program());

        let program = self.program(probe.program())?;
        let link = program.attach(target.tracepoint())?;
        debug!("Attached raw tracepoint {} to {}", probe.program(), target);
        Ok(link)
    }

    fn unregister(&mut self, probe: &ProbeSpec, link: Self::Link) -> Result<(), BoxError> {
        let program = self.program(probe.program())?;
        program.detach(link)?;
        Ok(())
    }
}

/// Drain the ring buffer into `tracer` whenever the kernel signals data.
pub fn spawn_reader(
    events: RingBuf<MapData>,
    tracer: Arc<BlockTracer>,
) -> std::io::Result<JoinHandle<std::io::Result<()>>> {
    let mut fd = AsyncFd::new(events)?;

    Ok(tokio::spawn(async move {
        loop {
            let mut guard = fd.readable_mut().await?;
            let ring = guard.get_inner_mut();
            while let Some(item) = ring.next() {
                tracer.handle_bytes(&item);
            }
            guard.clear_ready();
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_path_wins() {
        let path = object_path(Some(Path::new("/opt/biotap/block-trace"))).unwrap();
        assert_eq!(path, PathBuf::from("/opt/biotap/block-trace"));
    }

    #[test]
    fn test_load_missing_object() {
        let err = BlockTraceProgram::load(Path::new("/nonexistent/block-trace")).err().unwrap();
        assert!(matches!(err, EbpfError::Read { .. }));
    }
}
