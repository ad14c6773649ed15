//! Ordered kernel mutations making up a pass.

use std::fmt;

use vipgate_kernel::{Object, RuleBuilderError};

use crate::{
    desired::{self, DesiredState},
    settings::Settings,
    snapshot::MappingSnapshot,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Present(Object),
    Absent(Object),
    FlushRouteCache,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Present(object) => write!(f, "+ {object}"),
            Step::Absent(object) => write!(f, "- {object}"),
            Step::FlushRouteCache => f.write_str("flush route cache"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    steps: Vec<Step>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    fn present(&mut self, object: impl Into<Object>) {
        self.steps.push(Step::Present(object.into()));
    }

    fn absent(&mut self, object: impl Into<Object>) {
        self.steps.push(Step::Absent(object.into()));
    }

    /// Removes the workload marks and the objects of both branches of every
    /// VIP in `snapshot`, each branch in the reverse of its creation order.
    /// The classifying chain and its hook stay.
    pub fn tear_down(
        &mut self,
        settings: &Settings,
        snapshot: &MappingSnapshot,
    ) -> Result<&mut Self, RuleBuilderError> {
        for route in snapshot.workload_routes() {
            self.absent(desired::workload_mark(settings, &route)?);
        }

        let workloads = snapshot.workloads_by_vip();
        for route in snapshot.vip_routes() {
            let members = workloads
                .get(&route.vip)
                .map(Vec::as_slice)
                .unwrap_or_default();

            let primary = desired::primary_objects(settings, route.vip, route.route_id, members)?;
            let secondary = desired::secondary_objects(settings, route.vip, route.route_id)?;

            for object in primary.into_iter().rev().chain(secondary.into_iter().rev()) {
                self.absent(object);
            }
        }

        Ok(self)
    }

    /// Unhooks the classifying chain, empties it and deletes it.
    pub fn remove_chain(&mut self, settings: &Settings) -> Result<&mut Self, RuleBuilderError> {
        self.absent(desired::hook(settings)?);
        for rule in desired::bypass_rules(settings)?.into_iter().rev() {
            self.absent(rule);
        }
        self.absent(desired::chain(settings));

        Ok(self)
    }

    /// Creates the classifying chain, fills and hooks it, then adds the
    /// workload marks and the branch objects of every VIP.
    pub fn apply(
        &mut self,
        settings: &Settings,
        desired: &DesiredState,
    ) -> Result<&mut Self, RuleBuilderError> {
        self.present(desired::chain(settings));
        for rule in desired::bypass_rules(settings)? {
            self.present(rule);
        }
        self.present(desired::hook(settings)?);

        for route in &desired.marks {
            self.present(desired::workload_mark(settings, route)?);
        }

        for vip in &desired.vips {
            for object in vip.objects(settings)? {
                self.present(object);
            }
        }

        Ok(self)
    }

    pub fn flush_route_cache(&mut self) -> &mut Self {
        self.steps.push(Step::FlushRouteCache);
        self
    }
}
