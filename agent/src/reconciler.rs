//! A single convergence pass: tear everything down, then apply what the
//! current snapshot asks for.

use std::fmt;

use tracing::{debug, info, instrument, warn};
use vipgate_kernel::{ensure_absent, ensure_present, Backend, Outcome};

use crate::{
    desired,
    ownership::InterfaceOwnership,
    plan::{Plan, Step},
    settings::Settings,
    snapshot::MappingSnapshot,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub changed: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl PassReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Changed => self.changed += 1,
            Outcome::Unchanged => self.unchanged += 1,
            Outcome::Failed => self.failed += 1,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }

    fn log(&self, pass: &str) {
        if self.is_clean() {
            info!(pass, report = %self, "pass finished");
        } else {
            warn!(pass, report = %self, "pass finished with failures, retrying next cycle");
        }
    }
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} changed, {} unchanged, {} failed",
            self.changed, self.unchanged, self.failed
        )
    }
}

pub struct Reconciler<B> {
    backend: B,
    settings: Settings,
    applied: Option<MappingSnapshot>,
}

impl<B: Backend> Reconciler<B> {
    pub fn new(backend: B, settings: Settings) -> Self {
        Self {
            backend,
            settings,
            applied: None,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The snapshot of the last apply pass, until a delete pass runs.
    pub fn applied(&self) -> Option<&MappingSnapshot> {
        self.applied.as_ref()
    }

    /// Tears down the managed objects of `snapshot` and re-applies them
    /// according to where each VIP currently lives.
    #[instrument(skip_all, fields(interface = %self.settings.interface))]
    pub fn reconcile(&mut self, snapshot: MappingSnapshot) -> anyhow::Result<PassReport> {
        let mut plan = Plan::new();
        self.tear_down_applied(&mut plan, &snapshot)?;
        plan.tear_down(&self.settings, &snapshot)?.flush_route_cache();

        let ownership = InterfaceOwnership::new(&self.backend, &self.settings.interface);
        let desired = desired::compute(&snapshot, &ownership);
        plan.apply(&self.settings, &desired)?.flush_route_cache();

        let report = self.execute(&plan);
        report.log("reconcile");

        self.applied = Some(snapshot);
        Ok(report)
    }

    /// Removes every managed object of `snapshot`, and of the last applied
    /// snapshot if it differs, along with the classifying chain.
    #[instrument(skip_all, fields(interface = %self.settings.interface))]
    pub fn delete(&mut self, snapshot: &MappingSnapshot) -> anyhow::Result<PassReport> {
        let mut plan = Plan::new();
        self.tear_down_applied(&mut plan, snapshot)?;
        plan.tear_down(&self.settings, snapshot)?
            .remove_chain(&self.settings)?
            .flush_route_cache();

        let report = self.execute(&plan);
        report.log("delete");

        self.applied = None;
        Ok(report)
    }

    /// Runs every step of `plan` in order; a failed step does not stop the
    /// ones after it.
    pub fn execute(&self, plan: &Plan) -> PassReport {
        debug!(steps = plan.len(), "executing plan");

        let mut report = PassReport::default();
        for step in plan.steps() {
            let outcome = match step {
                Step::Present(object) => ensure_present(&self.backend, object),
                Step::Absent(object) => ensure_absent(&self.backend, object),
                Step::FlushRouteCache => match self.backend.flush_route_cache() {
                    Ok(()) => Outcome::Changed,
                    Err(e) => {
                        warn!(error = %e, "failed to flush route cache");
                        Outcome::Failed
                    }
                },
            };
            report.record(outcome);
        }

        report
    }

    /// Objects applied from an older snapshot carry its workload sets and
    /// VIPs, so they are torn down by that snapshot's description.
    fn tear_down_applied(
        &self,
        plan: &mut Plan,
        snapshot: &MappingSnapshot,
    ) -> anyhow::Result<()> {
        if let Some(applied) = self.applied.as_ref().filter(|applied| *applied != snapshot) {
            debug!("mappings changed since last pass");
            plan.tear_down(&self.settings, applied)?;
        }
        Ok(())
    }
}
