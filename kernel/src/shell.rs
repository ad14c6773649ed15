//! [`Backend`] for a live node: packet-filter state goes through the
//! `iptables` crate, routes and routing rules through the `ip` tool.

use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
    process::Command,
};

use iptables::IPTables;
use tracing::debug;
use vipgate_config::registry;

use crate::{
    backend::Backend,
    object::{DefaultRoute, MarkSelector, Object, Position, Rule},
    Error, Result,
};

const FILE_EXISTS: &str = "File exists";
const NO_SUCH_PROCESS: &str = "No such process";
const NO_SUCH_FILE: &str = "No such file or directory";
const NO_SUCH_DEVICE: &str = "does not exist";

/// The packet-filter operations the backend needs, shaped after
/// [`iptables::IPTables`]. Rules are passed as their iptables rule string.
pub trait PacketFilter: Send + Sync {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool>;

    fn new_chain(&self, table: &str, chain: &str) -> Result<()>;

    fn flush_chain(&self, table: &str, chain: &str) -> Result<()>;

    fn delete_chain(&self, table: &str, chain: &str) -> Result<()>;

    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool>;

    fn append(&self, table: &str, chain: &str, rule: &str) -> Result<()>;

    fn insert(&self, table: &str, chain: &str, rule: &str, position: i32) -> Result<()>;

    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<()>;
}

fn iptables_error(e: Box<dyn std::error::Error>) -> Error {
    Error::Iptables(e.to_string())
}

impl PacketFilter for IPTables {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool> {
        IPTables::chain_exists(self, table, chain).map_err(iptables_error)
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        IPTables::new_chain(self, table, chain).map_err(iptables_error)
    }

    fn flush_chain(&self, table: &str, chain: &str) -> Result<()> {
        IPTables::flush_chain(self, table, chain).map_err(iptables_error)
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        IPTables::delete_chain(self, table, chain).map_err(iptables_error)
    }

    fn exists(&self, table: &str, chain: &str, rule: &str) -> Result<bool> {
        IPTables::exists(self, table, chain, rule).map_err(iptables_error)
    }

    fn append(&self, table: &str, chain: &str, rule: &str) -> Result<()> {
        IPTables::append(self, table, chain, rule).map_err(iptables_error)
    }

    fn insert(&self, table: &str, chain: &str, rule: &str, position: i32) -> Result<()> {
        IPTables::insert(self, table, chain, rule, position).map_err(iptables_error)
    }

    fn delete(&self, table: &str, chain: &str, rule: &str) -> Result<()> {
        IPTables::delete(self, table, chain, rule).map_err(iptables_error)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

pub trait Runner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<Output>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl Runner for ProcessRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<Output> {
        let out = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| Error::Spawn {
                program: program.to_owned(),
                source,
            })?;

        Ok(Output {
            status: out.status.code(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

pub struct ShellBackend<F = IPTables, R = ProcessRunner> {
    filter: F,
    runner: R,
    ip: String,
    registry_dir: PathBuf,
}

impl ShellBackend {
    pub fn new(registry_dir: impl Into<PathBuf>) -> Result<Self> {
        let filter = iptables::new(false).map_err(iptables_error)?;
        Ok(Self::with_parts(filter, ProcessRunner, registry_dir))
    }
}

impl<F: PacketFilter, R: Runner> ShellBackend<F, R> {
    pub fn with_parts(filter: F, runner: R, registry_dir: impl Into<PathBuf>) -> Self {
        Self {
            filter,
            runner,
            ip: "ip".to_owned(),
            registry_dir: registry_dir.into(),
        }
    }

    pub fn ip_program(mut self, program: impl Into<String>) -> Self {
        self.ip = program.into();
        self
    }

    pub fn registry_dir(&self) -> &Path {
        &self.registry_dir
    }

    /// A rule cannot be present while its own chain or the chain it jumps
    /// to is missing, so those are checked before asking for the rule.
    fn rule_exists(&self, rule: &Rule) -> Result<bool> {
        let table = rule.table.as_str();

        if !rule.chain().is_builtin() && !self.filter.chain_exists(table, &rule.chain)? {
            return Ok(false);
        }
        if let Some(target) = rule.target.jump_chain() {
            if !self.filter.chain_exists(table, target)? {
                return Ok(false);
            }
        }

        self.filter.exists(table, &rule.chain, &rule_spec(rule))
    }

    fn run(&self, program: &str, args: &[String]) -> Result<Output> {
        debug!("running command: {} {}", program, args.join(" "));
        self.runner.run(program, args)
    }

    /// Runs the command and fails unless it succeeds or its stderr
    /// contains one of `tolerated`.
    fn run_tolerating(&self, program: &str, args: &[String], tolerated: &[&str]) -> Result<Output> {
        let output = self.run(program, args)?;

        if output.success() || tolerated.iter().any(|t| output.stderr.contains(t)) {
            Ok(output)
        } else {
            Err(command_error(program, args, &output))
        }
    }

    fn ip_args(args: &[&str]) -> Vec<String> {
        args.iter().map(|arg| (*arg).to_owned()).collect()
    }

    fn route_exists(&self, route: &DefaultRoute) -> Result<bool> {
        let table = route.table.to_string();
        let args = Self::ip_args(&[
            "-4",
            "route",
            "show",
            "table",
            table.as_str(),
            "exact",
            "default",
        ]);
        let output = self.run_tolerating(&self.ip, &args, &[])?;

        Ok(route_listed(&output.stdout, route))
    }

    fn selector_exists(&self, selector: &MarkSelector) -> Result<bool> {
        let args = Self::ip_args(&["-4", "rule", "show"]);
        let output = self.run_tolerating(&self.ip, &args, &[])?;

        let mut lookups = vec![selector.table.to_string()];
        lookups.extend(
            registry::list(&self.registry_dir)?
                .into_iter()
                .filter(|entry| entry.id == selector.table)
                .map(|entry| entry.name),
        );

        Ok(selector_listed(&output.stdout, selector.mark, &lookups))
    }

    fn route_args(op: &str, route: &DefaultRoute) -> Vec<String> {
        let via = route.via.to_string();
        let table = route.table.to_string();
        Self::ip_args(&[
            "route",
            op,
            "default",
            "via",
            via.as_str(),
            "dev",
            route.device.as_str(),
            "table",
            table.as_str(),
        ])
    }

    fn selector_args(op: &str, selector: &MarkSelector) -> Vec<String> {
        let mark = selector.mark.to_string();
        let table = selector.table.to_string();
        Self::ip_args(&["rule", op, "fwmark", mark.as_str(), "table", table.as_str()])
    }
}

impl<F: PacketFilter, R: Runner> Backend for ShellBackend<F, R> {
    fn exists(&self, object: &Object) -> Result<bool> {
        match object {
            Object::Chain(chain) => self.filter.chain_exists(chain.table.as_str(), &chain.name),
            Object::Rule(rule) => self.rule_exists(rule),
            Object::Table(entry) => {
                Ok(registry::read(&self.registry_dir, &entry.name)?.as_ref() == Some(entry))
            }
            Object::Route(route) => self.route_exists(route),
            Object::Selector(selector) => self.selector_exists(selector),
        }
    }

    fn create(&self, object: &Object) -> Result<()> {
        match object {
            Object::Chain(chain) => self.filter.new_chain(chain.table.as_str(), &chain.name)?,
            Object::Rule(rule) => {
                let (table, spec) = (rule.table.as_str(), rule_spec(rule));
                match rule.position {
                    Position::Append => self.filter.append(table, &rule.chain, &spec)?,
                    Position::Insert(n) => {
                        let position = i32::try_from(n).unwrap_or(i32::MAX);
                        self.filter.insert(table, &rule.chain, &spec, position)?
                    }
                }
            }
            Object::Table(entry) => registry::write(&self.registry_dir, entry)?,
            Object::Route(route) => {
                self.run_tolerating(&self.ip, &Self::route_args("replace", route), &[])?;
            }
            Object::Selector(selector) => {
                self.run_tolerating(&self.ip, &Self::selector_args("add", selector), &[FILE_EXISTS])?;
            }
        }

        Ok(())
    }

    fn remove(&self, object: &Object) -> Result<()> {
        match object {
            Object::Chain(chain) => {
                self.filter.flush_chain(chain.table.as_str(), &chain.name)?;
                self.filter.delete_chain(chain.table.as_str(), &chain.name)?;
            }
            Object::Rule(rule) => {
                self.filter
                    .delete(rule.table.as_str(), &rule.chain, &rule_spec(rule))?;
            }
            Object::Table(entry) => {
                registry::remove(&self.registry_dir, &entry.name)?;
            }
            Object::Route(route) => {
                self.run_tolerating(&self.ip, &Self::route_args("del", route), &[NO_SUCH_PROCESS])?;
            }
            Object::Selector(selector) => {
                self.run_tolerating(&self.ip, &Self::selector_args("del", selector), &[NO_SUCH_FILE])?;
            }
        }

        Ok(())
    }

    fn flush_route_cache(&self) -> Result<()> {
        self.run_tolerating(&self.ip, &Self::ip_args(&["route", "flush", "cache"]), &[])?;
        Ok(())
    }

    fn link_exists(&self, name: &str) -> Result<bool> {
        let args = Self::ip_args(&["link", "show", "dev", name]);
        let output = self.run(&self.ip, &args)?;

        if output.success() {
            Ok(true)
        } else if output.stderr.contains(NO_SUCH_DEVICE) {
            Ok(false)
        } else {
            Err(command_error(&self.ip, &args, &output))
        }
    }

    fn addresses(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        let args = Self::ip_args(&["-o", "-4", "addr", "show", "dev", name]);
        let output = self.run_tolerating(&self.ip, &args, &[])?;

        Ok(parse_addresses(&output.stdout))
    }
}

/// The rule as the `iptables` crate takes it: everything after the chain name.
fn rule_spec(rule: &Rule) -> String {
    rule.args().join(" ")
}

fn command_error(program: &str, args: &[String], output: &Output) -> Error {
    Error::Command {
        command: format!("{} {}", program, args.join(" ")),
        status: output
            .status
            .map_or_else(|| "signal".to_owned(), |code| code.to_string()),
        stderr: output.stderr.trim().to_owned(),
    }
}

fn has_pair(tokens: &[&str], key: &str, matches: impl Fn(&str) -> bool) -> bool {
    tokens.windows(2).any(|w| w[0] == key && matches(w[1]))
}

/// Whether `ip route show` output lists `route`.
fn route_listed(stdout: &str, route: &DefaultRoute) -> bool {
    let via = route.via.to_string();

    stdout.lines().any(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        tokens.first() == Some(&"default")
            && has_pair(&tokens, "via", |t| t == via)
            && has_pair(&tokens, "dev", |t| t == route.device)
    })
}

/// Whether `ip rule show` output holds a rule for `mark` looking up one of `lookups`.
fn selector_listed(stdout: &str, mark: u32, lookups: &[String]) -> bool {
    stdout.lines().any(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        has_pair(&tokens, "fwmark", |t| parse_mark(t) == Some(mark))
            && has_pair(&tokens, "lookup", |t| lookups.iter().any(|l| l == t))
    })
}

/// Parses `0x64` or `0x64/0xffffffff` as printed by `ip rule`.
fn parse_mark(token: &str) -> Option<u32> {
    let value = token.split('/').next()?;
    match value.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Extracts the addresses from `ip -o -4 addr show` output.
fn parse_addresses(stdout: &str) -> Vec<Ipv4Addr> {
    stdout
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            tokens
                .windows(2)
                .find(|w| w[0] == "inet")
                .and_then(|w| w[1].split('/').next())
                .and_then(|addr| addr.parse().ok())
        })
        .collect()
}
