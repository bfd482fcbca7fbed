//! Configuration management for nft-geo-filter.
//!
//! Settings come from an optional YAML file, overridden by command-line
//! flags, and are checked once by [`Config::validate`] before anything
//! touches the rule store.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::context::{LogOptions, RuleOptions};
use crate::enforcer::{AddressFamily, TableFamily, Verdict};
use crate::error::{chain, GeoFilterError};
use crate::fetcher::{DEFAULT_IPV4_URL, DEFAULT_IPV6_URL};
use crate::validation::{
    validate_country_code, validate_https_url, validate_interface_name, validate_log_level,
    validate_log_prefix,
};

/// Default table name
pub const DEFAULT_TABLE_NAME: &str = "geo-filter";

/// Log prefix used when `--log` is given without `--log-prefix`
pub const DEFAULT_LOG_PREFIX: &str = "nft-geo-filter: ";

/// Log level used when `--log` is given without `--log-level`
pub const DEFAULT_LOG_LEVEL: &str = "warn";

/// What the country filter rule does with matching traffic
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAction {
    /// Only the listed countries pass
    Allow,
    /// The listed countries are dropped
    #[default]
    Deny,
}

impl DefaultAction {
    /// Verdict of the country filter rule.
    pub fn verdict(&self) -> Verdict {
        match self {
            DefaultAction::Allow => Verdict::Accept,
            DefaultAction::Deny => Verdict::Drop,
        }
    }

    /// Chain policy: whatever the filter rule does not decide.
    pub fn policy(&self) -> Verdict {
        match self {
            DefaultAction::Allow => Verdict::Drop,
            DefaultAction::Deny => Verdict::Accept,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Allow or deny the listed countries
    pub default_action: DefaultAction,

    /// nftables table family (ip, ip6, inet, netdev)
    pub table_family: TableFamily,

    pub table_name: String,

    /// Ingress device, required for the netdev family
    pub interface: Option<String>,

    /// Filter IPv4 traffic
    pub ipv4: bool,

    /// Filter IPv6 traffic
    pub ipv6: bool,

    /// Add a counter to the filter rules
    pub counter: bool,

    /// Log packets matched by the filter rules
    pub log: bool,
    pub log_prefix: Option<String>,
    pub log_level: Option<String>,

    /// Addresses or CIDRs that are always accepted
    pub exceptions: Vec<String>,

    /// ISO 3166-1 alpha-2 country codes
    pub countries: Vec<String>,

    /// Base URL of the IPv4 aggregated zone files
    pub ipv4_url: String,

    /// Base URL of the IPv6 aggregated zone files
    pub ipv6_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_action: DefaultAction::Deny,
            table_family: TableFamily::Inet,
            table_name: DEFAULT_TABLE_NAME.to_string(),
            interface: None,
            ipv4: true,
            ipv6: true,
            counter: false,
            log: false,
            log_prefix: None,
            log_level: None,
            exceptions: Vec::new(),
            countries: Vec::new(),
            ipv4_url: DEFAULT_IPV4_URL.to_string(),
            ipv6_url: DEFAULT_IPV6_URL.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from YAML file
    ///
    /// The result is not validated yet: command-line overrides are applied
    /// first, then [`Config::validate`] runs on the merged settings.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;

        Ok(config)
    }

    /// Validate configuration values
    ///
    /// Country codes are normalized to lowercase and deduplicated in place.
    pub fn validate(&mut self) -> Result<(), GeoFilterError> {
        if self.countries.is_empty() {
            return Err(GeoFilterError::Config(
                "At least one country code is required".to_string(),
            ));
        }
        let mut countries: Vec<String> = Vec::with_capacity(self.countries.len());
        for code in &self.countries {
            let code = validate_country_code(code).map_err(config_error)?;
            if !countries.contains(&code) {
                countries.push(code);
            }
        }
        self.countries = countries;

        if self.table_name.is_empty()
            || !self
                .table_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c))
        {
            return Err(GeoFilterError::Config(format!(
                "Invalid table name '{}'",
                self.table_name
            )));
        }

        match (&self.interface, self.table_family) {
            (None, TableFamily::Netdev) => {
                return Err(GeoFilterError::Config(
                    "The netdev family requires an interface (--interface)".to_string(),
                ));
            }
            (Some(_), family) if family != TableFamily::Netdev => {
                return Err(GeoFilterError::Config(format!(
                    "An interface can only be given for the netdev family, not {}",
                    family
                )));
            }
            (Some(interface), _) => validate_interface_name(interface).map_err(config_error)?,
            (None, _) => {}
        }

        if !self.log && (self.log_prefix.is_some() || self.log_level.is_some()) {
            return Err(GeoFilterError::Config(
                "--log-prefix and --log-level require --log".to_string(),
            ));
        }
        if let Some(prefix) = &self.log_prefix {
            validate_log_prefix(prefix).map_err(config_error)?;
        }
        if let Some(level) = &self.log_level {
            validate_log_level(level).map_err(config_error)?;
        }

        if self.address_families().is_empty() {
            return Err(GeoFilterError::Config(format!(
                "No address family left to filter in a {} table",
                self.table_family
            )));
        }

        validate_https_url(&self.ipv4_url).map_err(config_error)?;
        validate_https_url(&self.ipv6_url).map_err(config_error)?;

        Ok(())
    }

    /// Enabled address families that the table family can match.
    pub fn address_families(&self) -> Vec<AddressFamily> {
        AddressFamily::ALL
            .into_iter()
            .filter(|family| match family {
                AddressFamily::V4 => self.ipv4,
                AddressFamily::V6 => self.ipv6,
            })
            .filter(|family| self.table_family.supports(*family))
            .collect()
    }

    /// Decorations and verdict of the filter rules.
    pub fn rule_options(&self) -> RuleOptions {
        let log = self.log.then(|| LogOptions {
            prefix: self
                .log_prefix
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_PREFIX.to_string()),
            level: self
                .log_level
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        });
        RuleOptions {
            action: self.default_action,
            counter: self.counter,
            log,
        }
    }

    /// Exceptions as one comma-separated list.
    pub fn exception_list(&self) -> String {
        self.exceptions.join(",")
    }
}

fn config_error(err: anyhow::Error) -> GeoFilterError {
    GeoFilterError::Config(chain(&err))
}
