//! Rule store abstraction over the packet filter (nftables).
//!
//! The update core only ever talks to a [`RuleStore`]; [`NftablesStore`] is
//! the production implementation that drives the `nft` binary.

mod definition;
#[cfg(test)]
pub mod mock;
mod nftables;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

pub use definition::{parse_set_listing, SetDefinition, SetElement};
pub use nftables::NftablesStore;

use crate::cmd_abstraction::{args_to_strings, CommandExecutor};

/// Name of the single chain managed in the table.
pub const CHAIN_NAME: &str = "filter-chain";

/// Hook priority of the filter chain (after conntrack defrag, before conntrack).
pub const CHAIN_PRIORITY: i32 = -190;

/// nftables table family
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum TableFamily {
    Ip,
    Ip6,
    #[default]
    Inet,
    Netdev,
}

impl TableFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableFamily::Ip => "ip",
            TableFamily::Ip6 => "ip6",
            TableFamily::Inet => "inet",
            TableFamily::Netdev => "netdev",
        }
    }

    /// Whether a table of this family can match the given address family.
    pub fn supports(&self, family: AddressFamily) -> bool {
        match self {
            TableFamily::Ip => family == AddressFamily::V4,
            TableFamily::Ip6 => family == AddressFamily::V6,
            TableFamily::Inet | TableFamily::Netdev => true,
        }
    }
}

impl fmt::Display for TableFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableFamily {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ip" => Ok(TableFamily::Ip),
            "ip6" => Ok(TableFamily::Ip6),
            "inet" => Ok(TableFamily::Inet),
            "netdev" => Ok(TableFamily::Netdev),
            other => Err(format!(
                "Invalid table family '{}'. Valid values: ip, ip6, inet, netdev",
                other
            )),
        }
    }
}

/// Address family of a filter set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub const ALL: [AddressFamily; 2] = [AddressFamily::V4, AddressFamily::V6];

    /// Name of the set holding this family's country blocks.
    pub fn set_name(&self) -> &'static str {
        match self {
            AddressFamily::V4 => "filter-v4",
            AddressFamily::V6 => "filter-v6",
        }
    }

    /// nft element type of the set.
    pub fn element_type(&self) -> &'static str {
        match self {
            AddressFamily::V4 => "ipv4_addr",
            AddressFamily::V6 => "ipv6_addr",
        }
    }

    /// Payload protocol keyword used in match expressions (`ip saddr`, `ip6 saddr`).
    pub fn keyword(&self) -> &'static str {
        match self {
            AddressFamily::V4 => "ip",
            AddressFamily::V6 => "ip6",
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => f.write_str("IPv4"),
            AddressFamily::V6 => f.write_str("IPv6"),
        }
    }
}

/// A table, identified by (family, name)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub family: TableFamily,
    pub name: String,
}

impl TableRef {
    pub fn new(family: TableFamily, name: impl Into<String>) -> Self {
        Self {
            family,
            name: name.into(),
        }
    }

    /// Reference to the filter set of `family` in this table.
    pub fn set(&self, family: AddressFamily) -> SetRef {
        SetRef {
            table: self.clone(),
            family,
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.family, self.name)
    }
}

/// A filter set inside a table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SetRef {
    pub table: TableRef,
    pub family: AddressFamily,
}

impl SetRef {
    pub fn name(&self) -> &'static str {
        self.family.set_name()
    }
}

impl fmt::Display for SetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.table, self.name())
    }
}

/// Rule verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accept => "accept",
            Verdict::Drop => "drop",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a rule is placed in the chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePosition {
    Head,
    Tail,
}

/// Hook a base chain is attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainHook {
    Prerouting,
    Ingress { device: String },
}

/// Base chain definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSpec {
    pub name: String,
    pub hook: ChainHook,
    pub priority: i32,
    pub policy: Verdict,
}

impl ChainSpec {
    /// Body of the chain declaration, e.g.
    /// `{ type filter hook prerouting priority -190; policy accept; }`
    pub fn body(&self) -> String {
        let hook = match &self.hook {
            ChainHook::Prerouting => "prerouting".to_string(),
            ChainHook::Ingress { device } => format!("ingress device \"{}\"", device),
        };
        format!(
            "{{ type filter hook {} priority {}; policy {}; }}",
            hook, self.priority, self.policy
        )
    }
}

/// A rule as listed by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEntry {
    pub handle: u64,
    /// Rule text without the verdict
    pub expr: String,
    pub verdict: Option<Verdict>,
}

/// Control surface of the packet filter.
///
/// `bulk_load` is the only operation that changes set contents; flushes and
/// restores are expressed as bulk-load scripts so each one is applied as a
/// single transaction by the store.
pub trait RuleStore: Send + Sync {
    /// Create the table if it does not exist.
    fn add_table(&self, table: &TableRef) -> Result<()>;

    /// Set or clear the dormant flag of a table.
    fn set_dormant(&self, table: &TableRef, dormant: bool) -> Result<()>;

    /// Create the chain, or update its policy if it exists.
    fn add_chain(&self, table: &TableRef, chain: &ChainSpec) -> Result<()>;

    fn chain_exists(&self, table: &TableRef, chain: &str) -> Result<bool>;

    /// List the rules of a chain in evaluation order.
    fn list_rules(&self, table: &TableRef, chain: &str) -> Result<Vec<RuleEntry>>;

    fn delete_rule(&self, table: &TableRef, chain: &str, handle: u64) -> Result<()>;

    fn insert_rule(
        &self,
        table: &TableRef,
        chain: &str,
        rule: &str,
        position: RulePosition,
    ) -> Result<()>;

    fn set_exists(&self, set: &SetRef) -> Result<bool>;

    fn list_set_elements(&self, set: &SetRef) -> Result<Vec<SetElement>>;

    /// Submit an nft script that is applied atomically.
    fn bulk_load(&self, script: &str) -> Result<()>;
}

/// Script that empties a set.
pub fn flush_set_script(set: &SetRef) -> String {
    format!(
        "flush set {} {} {}\n",
        set.table.family,
        set.table.name,
        set.name()
    )
}

/// Script that removes a set.
pub fn delete_set_script(set: &SetRef) -> String {
    format!(
        "delete set {} {} {}\n",
        set.table.family,
        set.table.name,
        set.name()
    )
}

/// Path of the nft binary, resolved once.
pub(crate) fn nft_path() -> &'static str {
    static NFT_PATH: OnceLock<&'static str> = OnceLock::new();
    NFT_PATH.get_or_init(|| {
        ["/usr/sbin/nft", "/sbin/nft", "/usr/bin/nft"]
            .into_iter()
            .find(|p| Path::new(p).exists())
            .unwrap_or("nft")
    })
}

/// Execute a command through an executor and return its stdout
pub(crate) fn exec_cmd_with_executor<E: CommandExecutor + ?Sized>(
    executor: &E,
    program: &str,
    args: &[&str],
) -> Result<String> {
    executor
        .execute(program, &args_to_strings(args))
        .with_context(|| format!("Failed to execute {}", program))?
        .into_stdout(program)
}

/// Check if running as root (effective UID == 0)
///
/// Managing nftables requires CAP_NET_ADMIN; UID 0 covers the common case of
/// running from a root timer or with sudo.
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid() has no preconditions, never fails and does not touch
    // any memory owned by Rust.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        anyhow::bail!(
            "This operation requires root privileges. Please run with sudo.\n\
             Alternatively, ensure the process has the CAP_NET_ADMIN capability."
        )
    }
    Ok(())
}
