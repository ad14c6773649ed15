//! Computes the kernel objects a node should hold for a mapping snapshot.
//!
//! A VIP held by this node is primary: its workloads are marked on the way
//! through and translated to the VIP. Any other VIP is secondary: marked
//! traffic skips translation and is policy-routed towards the VIP through
//! a table of its own.

use std::{collections::BTreeMap, net::Ipv4Addr};

use tracing::{debug, warn};
use vipgate_kernel::{
    Chain, DefaultRoute, MarkSelector, Object, Position, Rule, RuleBuilder, RuleBuilderError,
    Table, TableEntry, Target,
};

use crate::{
    ownership::Ownership,
    settings::Settings,
    snapshot::{MappingSnapshot, WorkloadRoute},
};

const PREROUTING: &str = "PREROUTING";
const FORWARD: &str = "FORWARD";
const POSTROUTING: &str = "POSTROUTING";

type Result<T> = std::result::Result<T, RuleBuilderError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VipState {
    pub vip: Ipv4Addr,
    pub route_id: u32,
    pub workloads: Vec<Ipv4Addr>,
    pub branch: Branch,
}

impl VipState {
    /// Objects of the VIP's branch, in creation order.
    pub fn objects(&self, settings: &Settings) -> Result<Vec<Object>> {
        match self.branch {
            Branch::Primary => primary_objects(settings, self.vip, self.route_id, &self.workloads),
            Branch::Secondary => secondary_objects(settings, self.vip, self.route_id),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    /// One mark per workload, ordered by workload.
    pub marks: Vec<WorkloadRoute>,
    /// One entry per distinct VIP that has workloads, ordered by VIP.
    pub vips: Vec<VipState>,
}

impl DesiredState {
    pub fn vip(&self, vip: Ipv4Addr) -> Option<&VipState> {
        self.vips.iter().find(|state| state.vip == vip)
    }
}

/// Builds the desired state, asking `ownership` once per distinct VIP.
///
/// A VIP whose ownership cannot be determined gets no branch objects this
/// pass; its workloads are still marked.
pub fn compute(snapshot: &MappingSnapshot, ownership: &dyn Ownership) -> DesiredState {
    let marks = snapshot.workload_routes();

    let mut grouped: BTreeMap<Ipv4Addr, (u32, Vec<Ipv4Addr>)> = BTreeMap::new();
    for mark in &marks {
        grouped
            .entry(mark.vip)
            .or_insert_with(|| (mark.route_id, vec![]))
            .1
            .push(mark.workload);
    }

    let vips = grouped
        .into_iter()
        .filter_map(|(vip, (route_id, workloads))| {
            let branch = match ownership.is_local(vip) {
                Ok(true) => Branch::Primary,
                Ok(false) => Branch::Secondary,
                Err(e) => {
                    warn!(%vip, error = %e, "failed to determine VIP ownership, skipping");
                    return None;
                }
            };
            debug!(%vip, route_id, ?branch, workloads = workloads.len(), "resolved VIP");

            Some(VipState {
                vip,
                route_id,
                workloads,
                branch,
            })
        })
        .collect();

    DesiredState { marks, vips }
}

pub fn chain(settings: &Settings) -> Chain {
    Chain::new(Table::Mangle, settings.chain.as_str())
}

/// Traffic to the pod and service subnets never leaves through a VIP.
pub fn bypass_rules(settings: &Settings) -> Result<Vec<Rule>> {
    [settings.pod_subnet, settings.service_subnet]
        .into_iter()
        .map(|subnet| {
            RuleBuilder::default()
                .table(Table::Mangle)
                .chain(settings.chain.as_str())
                .destination(subnet)
                .target(Target::Return)
                .build()
        })
        .collect()
}

pub fn hook(settings: &Settings) -> Result<Rule> {
    RuleBuilder::default()
        .table(Table::Mangle)
        .chain(PREROUTING)
        .target(Target::Jump(settings.chain.clone()))
        .build()
}

pub fn workload_mark(settings: &Settings, route: &WorkloadRoute) -> Result<Rule> {
    RuleBuilder::default()
        .table(Table::Mangle)
        .chain(settings.chain.as_str())
        .sources(vec![route.workload])
        .target(Target::SetMark(route.route_id))
        .build()
}

/// Marks workload traffic that hairpins through the node holding the VIP.
pub fn forward_mark(settings: &Settings, route_id: u32, workloads: &[Ipv4Addr]) -> Result<Rule> {
    RuleBuilder::default()
        .table(Table::Mangle)
        .chain(FORWARD)
        .sources(workloads.to_vec())
        .in_interface(settings.interface.as_str())
        .out_interface(settings.interface.as_str())
        .target(Target::SetMark(route_id))
        .build()
}

pub fn snat(settings: &Settings, vip: Ipv4Addr, route_id: u32) -> Result<Rule> {
    RuleBuilder::default()
        .table(Table::Nat)
        .chain(POSTROUTING)
        .position(Position::Insert(1))
        .out_interface(settings.interface.as_str())
        .mark(route_id)
        .target(Target::Snat(vip))
        .build()
}

/// Keeps marked traffic away from any later translation in POSTROUTING.
pub fn skip_snat(settings: &Settings, route_id: u32) -> Result<Rule> {
    RuleBuilder::default()
        .table(Table::Nat)
        .chain(POSTROUTING)
        .position(Position::Insert(1))
        .out_interface(settings.interface.as_str())
        .mark(route_id)
        .target(Target::Return)
        .build()
}

pub fn table_entry(settings: &Settings, route_id: u32) -> TableEntry {
    TableEntry::new(route_id, settings.table_name(route_id))
}

pub fn default_route(settings: &Settings, vip: Ipv4Addr, route_id: u32) -> DefaultRoute {
    DefaultRoute {
        table: route_id,
        via: vip,
        device: settings.interface.clone(),
    }
}

pub fn selector(route_id: u32) -> MarkSelector {
    MarkSelector {
        mark: route_id,
        table: route_id,
    }
}

/// Primary objects in creation order. Without workloads there is nothing
/// to mark in FORWARD and that rule is left out.
pub fn primary_objects(
    settings: &Settings,
    vip: Ipv4Addr,
    route_id: u32,
    workloads: &[Ipv4Addr],
) -> Result<Vec<Object>> {
    let mut objects = Vec::with_capacity(2);
    if !workloads.is_empty() {
        objects.push(forward_mark(settings, route_id, workloads)?.into());
    }
    objects.push(snat(settings, vip, route_id)?.into());
    Ok(objects)
}

/// Secondary objects in creation order.
pub fn secondary_objects(settings: &Settings, vip: Ipv4Addr, route_id: u32) -> Result<Vec<Object>> {
    Ok(vec![
        skip_snat(settings, route_id)?.into(),
        table_entry(settings, route_id).into(),
        default_route(settings, vip, route_id).into(),
        selector(route_id).into(),
    ])
}
