//! Explicit context threaded through every update operation.

use crate::config::{Config, DefaultAction};
use crate::enforcer::{
    AddressFamily, ChainHook, ChainSpec, RuleStore, TableFamily, TableRef, CHAIN_NAME,
    CHAIN_PRIORITY,
};
use crate::fetcher::BlockSource;

/// nft `log` statement options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub prefix: String,
    pub level: String,
}

/// Decorations and verdict of the country filter rules
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleOptions {
    pub action: DefaultAction,
    pub counter: bool,
    pub log: Option<LogOptions>,
}

impl RuleOptions {
    /// Country filter rule for `family`, e.g.
    /// `ip saddr @filter-v4 counter log prefix "geo: " level warn drop`
    pub fn filter_rule(&self, family: AddressFamily) -> String {
        let mut rule = format!("{} saddr @{}", family.keyword(), family.set_name());
        if self.counter {
            rule.push_str(" counter");
        }
        if let Some(log) = &self.log {
            rule.push_str(&format!(" log prefix \"{}\" level {}", log.prefix, log.level));
        }
        rule.push(' ');
        rule.push_str(self.action.verdict().as_str());
        rule
    }
}

/// Everything an update run needs: the collaborators and the target.
pub struct UpdateContext<'a> {
    pub(crate) store: &'a dyn RuleStore,
    pub(crate) source: &'a dyn BlockSource,
    pub(crate) table: TableRef,
    pub(crate) interface: Option<String>,
    pub(crate) families: Vec<AddressFamily>,
    pub(crate) rules: RuleOptions,
}

impl<'a> UpdateContext<'a> {
    /// Context filtering every family the table supports, in deny mode.
    pub fn new(store: &'a dyn RuleStore, source: &'a dyn BlockSource, table: TableRef) -> Self {
        let families = AddressFamily::ALL
            .into_iter()
            .filter(|f| table.family.supports(*f))
            .collect();
        Self {
            store,
            source,
            table,
            interface: None,
            families,
            rules: RuleOptions::default(),
        }
    }

    /// Context for a validated configuration.
    pub fn from_config(
        store: &'a dyn RuleStore,
        source: &'a dyn BlockSource,
        config: &Config,
    ) -> Self {
        Self::new(store, source, TableRef::new(config.table_family, &config.table_name))
            .with_interface(config.interface.clone())
            .with_families(config.address_families())
            .with_rules(config.rule_options())
    }

    pub fn with_interface(mut self, interface: Option<String>) -> Self {
        self.interface = interface;
        self
    }

    /// Restrict the families to update; unsupported ones are dropped.
    pub fn with_families(mut self, families: Vec<AddressFamily>) -> Self {
        self.families = families
            .into_iter()
            .filter(|f| self.table.family.supports(*f))
            .collect();
        self
    }

    pub fn with_rules(mut self, rules: RuleOptions) -> Self {
        self.rules = rules;
        self
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub fn families(&self) -> &[AddressFamily] {
        &self.families
    }

    /// The filter chain, hooked for the table family, with the policy
    /// opposite to the configured action.
    pub fn chain_spec(&self) -> ChainSpec {
        let hook = match &self.interface {
            Some(device) if self.table.family == TableFamily::Netdev => {
                ChainHook::Ingress {
                    device: device.clone(),
                }
            }
            _ => ChainHook::Prerouting,
        };
        ChainSpec {
            name: CHAIN_NAME.to_string(),
            hook,
            priority: CHAIN_PRIORITY,
            policy: self.rules.action.policy(),
        }
    }
}
