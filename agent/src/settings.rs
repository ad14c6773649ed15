use ipnet::Ipv4Net;

pub const DEFAULT_INTERFACE: &str = "eth0";
pub const DEFAULT_POD_SUBNET: &str = "10.32.0.0/12";
pub const DEFAULT_SERVICE_SUBNET: &str = "10.96.0.0/12";
pub const DEFAULT_CHAIN: &str = "VIPGATE-EGRESS";
pub const DEFAULT_ROUTE_TABLE_PREFIX: &str = "egress_";

/// Node-level parameters every pass is computed against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Egress interface the VIPs float on.
    pub interface: String,
    pub pod_subnet: Ipv4Net,
    pub service_subnet: Ipv4Net,
    /// Classifying chain in the mangle table.
    pub chain: String,
    pub route_table_prefix: String,
}

impl Settings {
    pub fn new(interface: impl Into<String>, pod_subnet: Ipv4Net, service_subnet: Ipv4Net) -> Self {
        Self {
            interface: interface.into(),
            pod_subnet,
            service_subnet,
            chain: DEFAULT_CHAIN.to_owned(),
            route_table_prefix: DEFAULT_ROUTE_TABLE_PREFIX.to_owned(),
        }
    }

    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.chain = chain.into();
        self
    }

    pub fn route_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.route_table_prefix = prefix.into();
        self
    }

    /// Name of the policy-routing table registered for `route_id`.
    pub fn table_name(&self, route_id: u32) -> String {
        format!("{}{}", self.route_table_prefix, route_id)
    }
}
