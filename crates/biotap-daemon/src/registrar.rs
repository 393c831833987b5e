//! All-or-nothing registration of probe groups.
//!
//! A group is either fully attached or not attached at all. When probe `i`
//! fails, probes `0..i` are detached again in reverse order before the
//! failure is returned, so the kernel never sees a half-registered group.

use std::collections::HashMap;
use std::fmt;

use biotap_common::{BoxError, Error, ProbeFailure, Result};
use tracing::{debug, error, info, warn};

use crate::symbols::{SymbolLocator, TracepointHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionStrategy {
    /// Tracepoint is part of the stable linkable surface.
    Static,
    /// Tracepoint descriptor must be resolved by symbol lookup first.
    SymbolLookup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Unregistered,
    Registered,
}

/// One probe: the program to run and the tracepoint it hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSpec {
    program: &'static str,
    tracepoint: &'static str,
    strategy: ResolutionStrategy,
}

impl ProbeSpec {
    pub fn new(program: &'static str, tracepoint: &'static str, strategy: ResolutionStrategy) -> Self {
        Self { program, tracepoint, strategy }
    }

    pub fn program(&self) -> &'static str {
        self.program
    }

    pub fn tracepoint(&self) -> &'static str {
        self.tracepoint
    }

    pub fn strategy(&self) -> ResolutionStrategy {
        self.strategy
    }
}

impl fmt::Display for ProbeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.program, self.tracepoint)
    }
}

/// The facility that actually attaches probes to tracepoints.
pub trait TracepointHost {
    /// Token returned by a successful registration, needed to undo it.
    type Link;

    fn register(
        &mut self,
        probe: &ProbeSpec,
        target: &TracepointHandle,
    ) -> std::result::Result<Self::Link, BoxError>;

    fn unregister(&mut self, probe: &ProbeSpec, link: Self::Link)
        -> std::result::Result<(), BoxError>;
}

struct Binding<L> {
    target: TracepointHandle,
    link: L,
}

/// Owns every tracepoint binding for the lifetime of the module.
pub struct ProbeRegistrar<H: TracepointHost> {
    host: H,
    locator: SymbolLocator,
    bindings: HashMap<&'static str, Binding<H::Link>>,
}

impl<H: TracepointHost> ProbeRegistrar<H> {
    pub fn new(host: H, locator: SymbolLocator) -> Self {
        Self { host, locator, bindings: HashMap::new() }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn state(&self, program: &str) -> BindingState {
        if self.bindings.contains_key(program) {
            BindingState::Registered
        } else {
            BindingState::Unregistered
        }
    }

    pub fn registered_count(&self) -> usize {
        self.bindings.len()
    }

    fn resolve(&mut self, probe: &ProbeSpec) -> Result<TracepointHandle> {
        match probe.strategy {
            ResolutionStrategy::Static => Ok(TracepointHandle::fixed(probe.tracepoint)),
            ResolutionStrategy::SymbolLookup => self.locator.locate(probe.tracepoint),
        }
    }

    /// Register every probe in `probes`, in order, or none of them.
    pub fn register_group(&mut self, probes: &[ProbeSpec]) -> Result<()> {
        // Resolve everything up front so a missing symbol never leaves
        // anything to undo.
        let targets = probes.iter().map(|p| self.resolve(p)).collect::<Result<Vec<_>>>()?;

        let mut undo: Vec<(&ProbeSpec, H::Link)> = Vec::with_capacity(probes.len());

        for (index, (probe, target)) in probes.iter().zip(&targets).enumerate() {
            let attempt = if self.bindings.contains_key(probe.program)
                || undo.iter().any(|(done, _)| done.program == probe.program)
            {
                Err(BoxError::from(format!("probe {} is already registered", probe.program)))
            } else {
                self.host.register(probe, target)
            };

            match attempt {
                Ok(link) => {
                    debug!("Registered probe {} on {}", probe, target);
                    undo.push((probe, link));
                }
                Err(source) => {
                    error!("Failed to register probe {} (index {}): {}", probe, index, source);
                    self.unwind(undo);
                    return Err(Error::RegistrationFailed {
                        index,
                        probe: probe.program.to_string(),
                        source,
                    });
                }
            }
        }

        for ((probe, link), target) in undo.into_iter().zip(targets) {
            self.bindings.insert(probe.program, Binding { target, link });
        }

        info!(
            "Registered probe group [{}]",
            probes.iter().map(|p| p.program).collect::<Vec<_>>().join(", ")
        );
        Ok(())
    }

    fn unwind(&mut self, undo: Vec<(&ProbeSpec, H::Link)>) {
        for (probe, link) in undo.into_iter().rev() {
            match self.host.unregister(probe, link) {
                Ok(()) => debug!("Rolled back probe {}", probe),
                Err(e) => warn!("Rollback of probe {} failed: {}", probe, e),
            }
        }
    }

    /// Best-effort teardown of a group. Every registered probe is detached
    /// even if some detaches fail; the failures are reported together.
    pub fn unregister_group(&mut self, probes: &[ProbeSpec]) -> Result<()> {
        let mut failures = Vec::new();

        for probe in probes.iter().rev() {
            let Some(binding) = self.bindings.remove(probe.program) else {
                debug!("Probe {} not registered, skipping", probe);
                continue;
            };

            match self.host.unregister(probe, binding.link) {
                Ok(()) => debug!("Unregistered probe {} from {}", probe, binding.target),
                Err(e) => {
                    warn!("Failed to unregister probe {}: {}", probe, e);
                    failures.push(ProbeFailure {
                        probe: probe.program.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::UnregistrationFailed { failures })
        }
    }

    /// Register several groups as one step. If group `n` fails, groups
    /// `0..n` are unregistered again before the error is returned.
    pub fn register_groups(&mut self, groups: &[Vec<ProbeSpec>]) -> Result<()> {
        for (n, group) in groups.iter().enumerate() {
            if let Err(e) = self.register_group(group) {
                for earlier in groups[..n].iter().rev() {
                    if let Err(undo) = self.unregister_group(earlier) {
                        warn!("Rollback of earlier probe group failed: {}", undo);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Tear down several groups, last registered first.
    pub fn unregister_groups(&mut self, groups: &[Vec<ProbeSpec>]) -> Result<()> {
        let mut failures = Vec::new();
        for group in groups.iter().rev() {
            match self.unregister_group(group) {
                Ok(()) => {}
                Err(Error::UnregistrationFailed { failures: group_failures }) => {
                    failures.extend(group_failures)
                }
                Err(e) => return Err(e),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::UnregistrationFailed { failures })
        }
    }
}
