//! Kernel objects managed by the agent, described independently of the
//! tool that creates them.

use std::{fmt, net::Ipv4Addr};

use derive_builder::Builder;
use ipnet::Ipv4Net;
use vipgate_config::registry::TableEntry;

const BUILTIN_CHAINS: [&str; 5] = ["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Filter,
    Nat,
    Mangle,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
            Table::Mangle => "mangle",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Chain {
    pub table: Table,
    pub name: String,
}

impl Chain {
    pub fn new(table: Table, name: impl Into<String>) -> Self {
        Self {
            table,
            name: name.into(),
        }
    }

    pub fn is_builtin(&self) -> bool {
        BUILTIN_CHAINS.contains(&self.name.as_str())
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.name)
    }
}

/// Where a rule goes when it is added. Ignored when matching rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Position {
    #[default]
    Append,
    Insert(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Return,
    Jump(String),
    SetMark(u32),
    Snat(Ipv4Addr),
}

impl Target {
    pub fn jump_chain(&self) -> Option<&str> {
        match self {
            Target::Jump(chain) => Some(chain.as_str()),
            _ => None,
        }
    }

    fn args(&self) -> Vec<String> {
        match self {
            Target::Return => vec!["-j".into(), "RETURN".into()],
            Target::Jump(chain) => vec!["-j".into(), chain.clone()],
            Target::SetMark(mark) => vec![
                "-j".into(),
                "MARK".into(),
                "--set-mark".into(),
                mark.to_string(),
            ],
            Target::Snat(addr) => vec![
                "-j".into(),
                "SNAT".into(),
                "--to-source".into(),
                addr.to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Builder)]
pub struct Rule {
    pub table: Table,
    #[builder(setter(into))]
    pub chain: String,
    #[builder(default)]
    pub position: Position,
    #[builder(default, setter(into))]
    pub sources: Vec<Ipv4Addr>,
    #[builder(default, setter(strip_option))]
    pub destination: Option<Ipv4Net>,
    #[builder(default, setter(into, strip_option))]
    pub in_interface: Option<String>,
    #[builder(default, setter(into, strip_option))]
    pub out_interface: Option<String>,
    #[builder(default, setter(strip_option))]
    pub mark: Option<u32>,
    pub target: Target,
}

impl Rule {
    pub fn chain(&self) -> Chain {
        Chain::new(self.table, self.chain.clone())
    }

    /// The rule specification as iptables expects it after the chain name.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if !self.sources.is_empty() {
            let sources = self
                .sources
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            args.extend(["-s".to_owned(), sources]);
        }

        if let Some(destination) = self.destination {
            args.extend(["-d".to_owned(), destination.to_string()]);
        }

        if let Some(iface) = &self.in_interface {
            args.extend(["-i".to_owned(), iface.clone()]);
        }

        if let Some(iface) = &self.out_interface {
            args.extend(["-o".to_owned(), iface.clone()]);
        }

        if let Some(mark) = self.mark {
            args.extend([
                "-m".to_owned(),
                "mark".to_owned(),
                "--mark".to_owned(),
                mark.to_string(),
            ]);
        }

        args.extend(self.target.args());
        args
    }

    /// Same table, chain and specification, regardless of position.
    pub fn matches(&self, other: &Rule) -> bool {
        self.table == other.table && self.chain == other.chain && self.args() == other.args()
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.table, self.chain, self.args().join(" "))
    }
}

/// The default route of a policy-routing table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DefaultRoute {
    pub table: u32,
    pub via: Ipv4Addr,
    pub device: String,
}

impl fmt::Display for DefaultRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "default via {} dev {} table {}",
            self.via, self.device, self.table
        )
    }
}

/// A routing-policy rule sending packets carrying `mark` to `table`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MarkSelector {
    pub mark: u32,
    pub table: u32,
}

impl fmt::Display for MarkSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fwmark {} table {}", self.mark, self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Object {
    Chain(Chain),
    Rule(Rule),
    Table(TableEntry),
    Route(DefaultRoute),
    Selector(MarkSelector),
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Object::Chain(chain) => write!(f, "chain {chain}"),
            Object::Rule(rule) => write!(f, "rule {rule}"),
            Object::Table(entry) => write!(f, "route table {entry}"),
            Object::Route(route) => write!(f, "route {route}"),
            Object::Selector(selector) => write!(f, "ip rule {selector}"),
        }
    }
}

impl From<Chain> for Object {
    fn from(chain: Chain) -> Self {
        Object::Chain(chain)
    }
}

impl From<Rule> for Object {
    fn from(rule: Rule) -> Self {
        Object::Rule(rule)
    }
}

impl From<TableEntry> for Object {
    fn from(entry: TableEntry) -> Self {
        Object::Table(entry)
    }
}

impl From<DefaultRoute> for Object {
    fn from(route: DefaultRoute) -> Self {
        Object::Route(route)
    }
}

impl From<MarkSelector> for Object {
    fn from(selector: MarkSelector) -> Self {
        Object::Selector(selector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_args() {
        let rule = RuleBuilder::default()
            .table(Table::Mangle)
            .chain("FORWARD")
            .sources(vec![Ipv4Addr::new(10, 32, 0, 5), Ipv4Addr::new(10, 32, 0, 6)])
            .in_interface("eth0")
            .out_interface("eth0")
            .target(Target::SetMark(100))
            .build()
            .unwrap();

        assert_eq!(
            rule.args(),
            [
                "-s",
                "10.32.0.5,10.32.0.6",
                "-i",
                "eth0",
                "-o",
                "eth0",
                "-j",
                "MARK",
                "--set-mark",
                "100"
            ]
        );

        let rule = RuleBuilder::default()
            .table(Table::Nat)
            .chain("POSTROUTING")
            .position(Position::Insert(1))
            .out_interface("eth0")
            .mark(100)
            .target(Target::Snat(Ipv4Addr::new(203, 0, 113, 10)))
            .build()
            .unwrap();

        assert_eq!(
            rule.to_string(),
            "nat POSTROUTING -o eth0 -m mark --mark 100 -j SNAT --to-source 203.0.113.10"
        );
    }

    #[test]
    fn rule_matches_ignores_position() {
        let mut builder = RuleBuilder::default();
        builder
            .table(Table::Nat)
            .chain("POSTROUTING")
            .mark(100)
            .target(Target::Return);

        let appended = builder.build().unwrap();
        let inserted = builder.position(Position::Insert(1)).build().unwrap();
        let other = builder.mark(101).build().unwrap();

        assert!(appended.matches(&inserted));
        assert!(!appended.matches(&other));
    }

    #[test]
    fn rule_requires_target() {
        let res = RuleBuilder::default()
            .table(Table::Mangle)
            .chain("PREROUTING")
            .build();

        assert!(res.is_err());
    }

    #[test]
    fn builtin_chains() {
        assert!(Chain::new(Table::Mangle, "PREROUTING").is_builtin());
        assert!(!Chain::new(Table::Mangle, "VIPGATE-EGRESS").is_builtin());
    }
}
