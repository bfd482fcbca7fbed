//! Accept rules that take precedence over the country filter.
//!
//! Everything here is inserted at the head of the chain, after the country
//! filter rules were appended, so it is evaluated first.

use ipnet::IpNet;
use tracing::{debug, info, warn};

use crate::config::DefaultAction;
use crate::context::UpdateContext;
use crate::enforcer::{AddressFamily, RulePosition, TableFamily, CHAIN_NAME};
use crate::error::{chain, GeoFilterError};
use crate::validation::validate_ip_or_cidr;

/// Private and link-scoped IPv4 ranges accepted in allow mode
pub const PRIVATE_V4_RANGES: &[&str] = &[
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
];

/// IPv6 link-local range accepted in allow mode
pub const LINK_LOCAL_V6: &str = "fe80::/10";

/// Caller-supplied addresses that are always accepted, split by family
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exceptions {
    v4: Vec<IpNet>,
    v6: Vec<IpNet>,
}

impl Exceptions {
    /// Parse a comma-separated list of addresses and CIDRs.
    ///
    /// Empty entries are ignored; one malformed entry rejects the whole list.
    pub fn parse(list: &str) -> Result<Self, GeoFilterError> {
        let mut exceptions = Self::default();
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let net = validate_ip_or_cidr(entry)
                .map_err(|e| GeoFilterError::Validation(chain(&e)))?
                .trunc();
            let family = match net {
                IpNet::V4(_) => &mut exceptions.v4,
                IpNet::V6(_) => &mut exceptions.v6,
            };
            if !family.contains(&net) {
                family.push(net);
            }
        }
        Ok(exceptions)
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn get(&self, family: AddressFamily) -> &[IpNet] {
        match family {
            AddressFamily::V4 => &self.v4,
            AddressFamily::V6 => &self.v6,
        }
    }

    /// Accept rule for one family, e.g. `ip saddr { 203.0.113.5 } accept`
    pub fn rule(&self, family: AddressFamily) -> Option<String> {
        let nets = self.get(family);
        if nets.is_empty() {
            return None;
        }
        let elements: Vec<String> = nets.iter().map(element).collect();
        Some(format!(
            "{} saddr {{ {} }} accept",
            family.keyword(),
            elements.join(", ")
        ))
    }
}

/// Host prefixes are written as bare addresses.
fn element(net: &IpNet) -> String {
    if net.prefix_len() == net.max_prefix_len() {
        net.addr().to_string()
    } else {
        net.to_string()
    }
}

impl UpdateContext<'_> {
    /// Accept rules admitting local traffic in allow mode, in evaluation
    /// order. Empty in deny mode.
    pub fn allow_rules(&self) -> Vec<String> {
        if self.rules.action != DefaultAction::Allow {
            return Vec::new();
        }

        let netdev = self.table.family == TableFamily::Netdev;
        let mut rules = Vec::new();
        if netdev {
            rules.push("meta protocol != { ip, ip6 } accept".to_string());
        }
        if self.families.contains(&AddressFamily::V4) {
            rules.push(format!(
                "ip saddr {{ {} }} accept",
                PRIVATE_V4_RANGES.join(", ")
            ));
        }
        if !netdev {
            rules.push("iif \"lo\" accept".to_string());
        }
        if self.families.contains(&AddressFamily::V6) {
            rules.push(format!("ip6 saddr {} accept", LINK_LOCAL_V6));
        }
        rules
    }

    /// Insert the allow-mode accept rules at the head of the chain.
    pub fn insert_allow_rules(&self) -> Result<usize, GeoFilterError> {
        let rules = self.allow_rules();
        self.insert_at_head(&rules)?;
        if !rules.is_empty() {
            debug!(count = rules.len(), "Inserted allow rules");
        }
        Ok(rules.len())
    }

    /// Insert one accept rule per family for the exceptions, ahead of the
    /// country filter rules.
    pub fn insert_exception_rules(&self, exceptions: &Exceptions) -> Result<usize, GeoFilterError> {
        let mut rules = Vec::new();
        for family in AddressFamily::ALL {
            let Some(rule) = exceptions.rule(family) else {
                continue;
            };
            if self.families.contains(&family) {
                rules.push(rule);
            } else {
                warn!(
                    family = %family,
                    count = exceptions.get(family).len(),
                    "Skipping exceptions for a family that is not filtered"
                );
            }
        }

        self.insert_at_head(&rules)?;
        if !rules.is_empty() {
            info!("Added {} exception(s)", exceptions.len());
        }
        Ok(rules.len())
    }

    /// Insert `rules` so they end up first in the chain, in the given order.
    fn insert_at_head(&self, rules: &[String]) -> Result<(), GeoFilterError> {
        for rule in rules.iter().rev() {
            self.store
                .insert_rule(&self.table, CHAIN_NAME, rule, RulePosition::Head)
                .map_err(|e| GeoFilterError::RuleInstall(format!("{}: {}", rule, chain(&e))))?;
        }
        Ok(())
    }
}
