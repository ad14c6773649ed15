use std::io;

use thiserror::Error;

pub mod backend;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod object;
pub mod shell;

pub use backend::{ensure_absent, ensure_present, Backend, Outcome};
pub use object::{
    Chain, DefaultRoute, MarkSelector, Object, Position, Rule, RuleBuilder, RuleBuilderError, Table,
    Target,
};
pub use vipgate_config::registry::TableEntry;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("iptables: {0}")]
    Iptables(String),

    #[error("route table registry: {0}")]
    Registry(#[from] io::Error),

    #[cfg(any(test, feature = "testing"))]
    #[error("no chain/target/match by the name {0}")]
    NoSuchChain(String),

    #[cfg(any(test, feature = "testing"))]
    #[error("chain {0} is still referenced")]
    ChainInUse(String),

    #[cfg(any(test, feature = "testing"))]
    #[error("cannot delete built-in chain {0}")]
    BuiltinChain(String),

    #[cfg(any(test, feature = "testing"))]
    #[error("device {0} does not exist")]
    NoSuchDevice(String),

    #[cfg(any(test, feature = "testing"))]
    #[error("injected failure for {0}")]
    Injected(String),
}

pub type Result<T> = std::result::Result<T, Error>;
