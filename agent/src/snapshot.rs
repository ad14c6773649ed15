//! The mappings a pass is computed from, read fresh from disk every cycle.

use std::{
    collections::{btree_map::Entry, BTreeMap},
    net::Ipv4Addr,
    num::NonZeroU32,
    path::Path,
};

use tracing::{debug, error, warn};
use vipgate_config::mapping;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WorkloadRoute {
    pub workload: Ipv4Addr,
    pub vip: Ipv4Addr,
    pub route_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VipRoute {
    pub vip: Ipv4Addr,
    pub route_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingSnapshot {
    workload_to_vip: BTreeMap<Ipv4Addr, Ipv4Addr>,
    vip_to_route_id: BTreeMap<Ipv4Addr, NonZeroU32>,
}

impl MappingSnapshot {
    pub fn new(
        workload_to_vip: BTreeMap<Ipv4Addr, Ipv4Addr>,
        vip_to_route_id: BTreeMap<Ipv4Addr, NonZeroU32>,
    ) -> Self {
        Self {
            workload_to_vip,
            vip_to_route_id,
        }
    }

    /// Reads both mapping directories. Unreadable directories and entries
    /// are logged and left out.
    pub fn load(workload_dir: &Path, route_id_dir: &Path) -> Self {
        let snapshot = Self::new(mapping::load(workload_dir), mapping::load(route_id_dir));
        debug!(
            workloads = snapshot.workload_to_vip.len(),
            vips = snapshot.vip_to_route_id.len(),
            "loaded mapping snapshot"
        );
        snapshot
    }

    pub fn workload_to_vip(&self) -> &BTreeMap<Ipv4Addr, Ipv4Addr> {
        &self.workload_to_vip
    }

    pub fn vip_to_route_id(&self) -> &BTreeMap<Ipv4Addr, NonZeroU32> {
        &self.vip_to_route_id
    }

    /// Every VIP with a usable route id, ordered by VIP.
    ///
    /// A route id is both a packet mark and a table id, so it can belong to
    /// one VIP only: the lowest VIP claiming it keeps it and the others are
    /// left out.
    pub fn vip_routes(&self) -> Vec<VipRoute> {
        let mut owners: BTreeMap<u32, Ipv4Addr> = BTreeMap::new();
        let mut routes = Vec::with_capacity(self.vip_to_route_id.len());

        for (&vip, route_id) in &self.vip_to_route_id {
            match owners.entry(route_id.get()) {
                Entry::Vacant(entry) => {
                    entry.insert(vip);
                    routes.push(VipRoute {
                        vip,
                        route_id: route_id.get(),
                    });
                }
                Entry::Occupied(entry) => {
                    error!(
                        %vip,
                        route_id = route_id.get(),
                        owner = %entry.get(),
                        "route id already assigned to another VIP, skipping"
                    );
                }
            }
        }

        routes
    }

    /// Every workload whose VIP has a usable route id, ordered by workload.
    pub fn workload_routes(&self) -> Vec<WorkloadRoute> {
        let route_ids: BTreeMap<Ipv4Addr, u32> = self
            .vip_routes()
            .into_iter()
            .map(|route| (route.vip, route.route_id))
            .collect();

        self.workload_to_vip
            .iter()
            .filter_map(|(&workload, &vip)| match route_ids.get(&vip) {
                Some(&route_id) => Some(WorkloadRoute {
                    workload,
                    vip,
                    route_id,
                }),
                None => {
                    warn!(%workload, %vip, "no route id for VIP, skipping workload");
                    None
                }
            })
            .collect()
    }

    /// Workloads grouped by their VIP, only for VIPs with a usable route id.
    pub fn workloads_by_vip(&self) -> BTreeMap<Ipv4Addr, Vec<Ipv4Addr>> {
        let mut grouped: BTreeMap<Ipv4Addr, Vec<Ipv4Addr>> = BTreeMap::new();
        for route in self.workload_routes() {
            grouped.entry(route.vip).or_default().push(route.workload);
        }
        grouped
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn id(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    #[test]
    fn missing_route_id_excludes_only_that_workload() {
        let snapshot = MappingSnapshot::new(
            [
                (ip("10.32.0.5"), ip("203.0.113.10")),
                (ip("10.32.0.6"), ip("203.0.113.99")),
            ]
            .into(),
            [(ip("203.0.113.10"), id(100))].into(),
        );

        assert_eq!(
            snapshot.workload_routes(),
            [WorkloadRoute {
                workload: ip("10.32.0.5"),
                vip: ip("203.0.113.10"),
                route_id: 100,
            }]
        );
    }

    #[test]
    fn duplicate_route_id_keeps_lowest_vip() {
        let snapshot = MappingSnapshot::new(
            [
                (ip("10.32.0.5"), ip("203.0.113.10")),
                (ip("10.32.0.6"), ip("203.0.113.11")),
            ]
            .into(),
            [(ip("203.0.113.11"), id(100)), (ip("203.0.113.10"), id(100))].into(),
        );

        assert_eq!(
            snapshot.vip_routes(),
            [VipRoute {
                vip: ip("203.0.113.10"),
                route_id: 100,
            }]
        );
        assert_eq!(snapshot.workload_routes().len(), 1);
        assert_eq!(snapshot.workload_routes()[0].workload, ip("10.32.0.5"));
    }

    #[test]
    fn groups_workloads_by_vip() {
        let snapshot = MappingSnapshot::new(
            [
                (ip("10.32.0.6"), ip("203.0.113.10")),
                (ip("10.32.0.5"), ip("203.0.113.10")),
                (ip("10.32.0.7"), ip("203.0.113.20")),
            ]
            .into(),
            [(ip("203.0.113.10"), id(100)), (ip("203.0.113.20"), id(200))].into(),
        );

        let grouped = snapshot.workloads_by_vip();
        assert_eq!(grouped.len(), 2);
        assert_eq!(
            grouped[&ip("203.0.113.10")],
            [ip("10.32.0.5"), ip("10.32.0.6")]
        );
    }

    #[test]
    fn load_from_directories() {
        let workloads = tempfile::tempdir().unwrap();
        let route_ids = tempfile::tempdir().unwrap();

        fs::write(workloads.path().join("10.32.0.5"), "203.0.113.10\n").unwrap();
        fs::write(workloads.path().join("not-an-ip"), "203.0.113.10").unwrap();
        fs::write(route_ids.path().join("203.0.113.10"), "100").unwrap();
        fs::write(route_ids.path().join("203.0.113.11"), "zero").unwrap();

        let snapshot = MappingSnapshot::load(workloads.path(), route_ids.path());

        assert_eq!(
            snapshot.workload_to_vip(),
            &BTreeMap::from([(ip("10.32.0.5"), ip("203.0.113.10"))])
        );
        assert_eq!(
            snapshot.vip_to_route_id(),
            &BTreeMap::from([(ip("203.0.113.10"), id(100))])
        );
    }
}
