pub mod abi;
pub mod accessors;
pub mod config;
pub mod correlator;
pub mod daemon;
pub mod ebpf;
pub mod normalizer;
pub mod registrar;
pub mod sink;
pub mod symbols;
pub mod tracer;

pub use abi::{resolve, AbiGeneration, AbiProfile, KernelIdentity};
pub use correlator::CompletionCorrelator;
pub use registrar::{ProbeRegistrar, ProbeSpec, TracepointHost};
pub use tracer::BlockTracer;
