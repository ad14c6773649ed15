//! In-memory model of the kernel state the agent manages.
//!
//! It enforces the same referential rules as the packet filter: rules need
//! their chain, jumps need their target chain, built-in chains cannot be
//! deleted and a chain that is still jumped to cannot be deleted.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::Ipv4Addr,
    sync::{Mutex, MutexGuard, PoisonError},
};

use vipgate_config::registry::TableEntry;

use crate::{
    backend::Backend,
    object::{Chain, DefaultRoute, MarkSelector, Object, Position, Rule, Table},
    Error, Result,
};

const BUILTIN: [(Table, &[&str]); 3] = [
    (Table::Filter, &["INPUT", "FORWARD", "OUTPUT"]),
    (Table::Nat, &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"]),
    (
        Table::Mangle,
        &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"],
    ),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelState {
    pub chains: BTreeMap<Chain, Vec<Rule>>,
    pub tables: BTreeMap<String, TableEntry>,
    pub routes: BTreeSet<DefaultRoute>,
    pub selectors: BTreeSet<MarkSelector>,
}

impl KernelState {
    pub fn rules(&self, table: Table, chain: &str) -> &[Rule] {
        self.chains
            .get(&Chain::new(table, chain))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn contains_rule(&self, rule: &Rule) -> bool {
        self.rules(rule.table, &rule.chain)
            .iter()
            .any(|r| r.matches(rule))
    }

    pub fn custom_chains(&self) -> impl Iterator<Item = &Chain> {
        self.chains.keys().filter(|chain| !chain.is_builtin())
    }

    fn is_jumped_to(&self, chain: &Chain) -> bool {
        self.chains
            .iter()
            .filter(|(c, _)| c.table == chain.table)
            .flat_map(|(_, rules)| rules)
            .any(|rule| rule.target.jump_chain() == Some(chain.name.as_str()))
    }
}

#[derive(Default)]
struct Inner {
    state: KernelState,
    links: BTreeMap<String, Vec<Ipv4Addr>>,
    failing: Vec<Object>,
    journal: Vec<String>,
    route_cache_flushes: usize,
}

pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let mut inner = Inner::default();

        for (table, chains) in BUILTIN {
            for name in chains {
                inner.state.chains.insert(Chain::new(table, *name), vec![]);
            }
        }

        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn with_link(self, name: &str, addrs: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        self.set_addresses(name, addrs);
        self
    }

    pub fn set_addresses(&self, name: &str, addrs: impl IntoIterator<Item = Ipv4Addr>) {
        self.lock()
            .links
            .insert(name.to_owned(), addrs.into_iter().collect());
    }

    /// Makes every later `create` or `remove` of `object` fail.
    pub fn fail_on(&self, object: Object) {
        self.lock().failing.push(object);
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    pub fn state(&self) -> KernelState {
        self.lock().state.clone()
    }

    /// Every successful mutation, in order.
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    pub fn route_cache_flushes(&self) -> usize {
        self.lock().route_cache_flushes
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Backend for MemoryBackend {
    fn exists(&self, object: &Object) -> Result<bool> {
        let inner = self.lock();
        let state = &inner.state;

        Ok(match object {
            Object::Chain(chain) => state.chains.contains_key(chain),
            Object::Rule(rule) => state.contains_rule(rule),
            Object::Table(entry) => state.tables.get(&entry.name) == Some(entry),
            Object::Route(route) => state.routes.contains(route),
            Object::Selector(selector) => state.selectors.contains(selector),
        })
    }

    fn create(&self, object: &Object) -> Result<()> {
        let mut inner = self.lock();

        if inner.failing.contains(object) {
            return Err(Error::Injected(object.to_string()));
        }

        let Inner { state, links, .. } = &mut *inner;

        match object {
            Object::Chain(chain) => {
                state.chains.entry(chain.clone()).or_default();
            }
            Object::Rule(rule) => {
                if let Some(target) = rule.target.jump_chain() {
                    let target = Chain::new(rule.table, target);
                    if !state.chains.contains_key(&target) {
                        return Err(Error::NoSuchChain(target.to_string()));
                    }
                }

                let rules = state
                    .chains
                    .get_mut(&rule.chain())
                    .ok_or_else(|| Error::NoSuchChain(rule.chain().to_string()))?;

                match rule.position {
                    Position::Append => rules.push(rule.clone()),
                    Position::Insert(n) => {
                        let index = (n.saturating_sub(1) as usize).min(rules.len());
                        rules.insert(index, rule.clone());
                    }
                }
            }
            Object::Table(entry) => {
                state.tables.insert(entry.name.clone(), entry.clone());
            }
            Object::Route(route) => {
                if !links.contains_key(&route.device) {
                    return Err(Error::NoSuchDevice(route.device.clone()));
                }
                state.routes.retain(|r| r.table != route.table);
                state.routes.insert(route.clone());
            }
            Object::Selector(selector) => {
                state.selectors.insert(*selector);
            }
        }

        inner.journal.push(format!("create {object}"));
        Ok(())
    }

    fn remove(&self, object: &Object) -> Result<()> {
        let mut inner = self.lock();

        if inner.failing.contains(object) {
            return Err(Error::Injected(object.to_string()));
        }

        let state = &mut inner.state;

        match object {
            Object::Chain(chain) => {
                if chain.is_builtin() {
                    return Err(Error::BuiltinChain(chain.to_string()));
                }
                if let Some(rules) = state.chains.get_mut(chain) {
                    rules.clear();
                }
                if state.is_jumped_to(chain) {
                    return Err(Error::ChainInUse(chain.to_string()));
                }
                state.chains.remove(chain);
            }
            Object::Rule(rule) => {
                let rules = state
                    .chains
                    .get_mut(&rule.chain())
                    .ok_or_else(|| Error::NoSuchChain(rule.chain().to_string()))?;
                if let Some(index) = rules.iter().position(|r| r.matches(rule)) {
                    rules.remove(index);
                }
            }
            Object::Table(entry) => {
                state.tables.remove(&entry.name);
            }
            Object::Route(route) => {
                state.routes.remove(route);
            }
            Object::Selector(selector) => {
                state.selectors.remove(selector);
            }
        }

        inner.journal.push(format!("remove {object}"));
        Ok(())
    }

    fn flush_route_cache(&self) -> Result<()> {
        let mut inner = self.lock();
        inner.route_cache_flushes += 1;
        inner.journal.push("flush route cache".to_owned());
        Ok(())
    }

    fn link_exists(&self, name: &str) -> Result<bool> {
        Ok(self.lock().links.contains_key(name))
    }

    fn addresses(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        self.lock()
            .links
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NoSuchDevice(name.to_owned()))
    }
}
