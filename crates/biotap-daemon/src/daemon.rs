use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::BufWriter;
use tokio::signal;
use tracing::{error, info, warn};

use crate::abi::{self, KernelIdentity};
use crate::config::DaemonConfig;
use crate::correlator::{spawn_sweeper, CompletionCorrelator};
use crate::ebpf::{self, BlockTraceProgram};
use crate::registrar::ProbeRegistrar;
use crate::sink::{write_json_lines, ChannelSink, RecordSink};
use crate::symbols::SymbolLocator;
use crate::tracer::BlockTracer;

pub async fn run() -> Result<()> {
    let config = DaemonConfig::load()?;
    run_with_config(config).await
}

pub async fn run_with_config(config: DaemonConfig) -> Result<()> {
    info!("Initializing daemon");
    config.validate().context("Invalid daemon configuration")?;

    let identity = KernelIdentity::detect().context("Failed to identify the running kernel")?;
    let profile = Arc::new(abi::resolve(&identity)?);

    let object = ebpf::object_path(config.bpf.object_path.as_deref())?;
    let mut program = BlockTraceProgram::load(&object)?;
    program.write_layout(profile.probe_layout())?;
    let events = program.take_events()?;

    let correlator = Arc::new(CompletionCorrelator::new(&config.correlation));
    let (sink, records) = ChannelSink::new(config.output.channel_capacity);
    let sink = Arc::new(sink);
    let tracer =
        Arc::new(BlockTracer::new(profile.clone(), correlator.clone(), sink.clone() as Arc<dyn RecordSink>));

    let writer = tokio::spawn(write_json_lines(records, BufWriter::new(tokio::io::stdout())));
    let reader = ebpf::spawn_reader(events, tracer.clone()).context("Failed to poll the event ring")?;
    let sweeper = spawn_sweeper(correlator.clone(), config.correlation.sweep_interval());

    let groups = profile.probe_groups();
    let mut registrar = ProbeRegistrar::new(program.into_host(), SymbolLocator::kallsyms());
    if let Err(e) = registrar.register_groups(&groups) {
        error!("Probe registration failed, nothing left attached: {}", e);
        reader.abort();
        sweeper.abort();
        return Err(e).context("Failed to register block tracepoints");
    }

    info!(
        "Tracing block I/O on kernel {} ({} probes)",
        identity.release,
        registrar.registered_count()
    );

    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");

    if let Err(e) = registrar.unregister_groups(&groups) {
        warn!("Teardown incomplete: {}", e);
    }

    reader.abort();
    sweeper.abort();
    let _ = reader.await;
    let _ = sweeper.await;

    let stats = tracer.stats();
    drop(tracer);
    drop(sink);

    match writer.await {
        Ok(Ok(written)) => info!("Wrote {} records", written),
        Ok(Err(e)) => warn!("Record writer failed: {}", e),
        Err(e) => warn!("Record writer task failed: {}", e),
    }

    info!(
        "Final counters: received {}, malformed {}, emitted {}, duplicates {}, orphans {}, evicted {}",
        stats.received,
        stats.malformed,
        stats.correlation.emitted,
        stats.correlation.duplicates,
        stats.correlation.orphans,
        stats.correlation.evicted
    );
    Ok(())
}
