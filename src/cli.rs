//! CLI argument parsing with clap.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use crate::config::{Config, DefaultAction};
use crate::enforcer::TableFamily;

#[derive(Parser, Debug)]
#[command(name = "nft-geo-filter")]
#[command(
    author,
    version,
    about = "Country-based IP filtering for nftables",
    long_about = "Downloads aggregated per-country IP block lists and loads them into \
                  nftables sets, replacing the previous generation without leaving \
                  the filter chain empty. Failed downloads or loads roll the sets back."
)]
pub struct Cli {
    /// ISO 3166-1 alpha-2 country codes to filter (e.g. fr de)
    #[arg(value_name = "COUNTRY")]
    pub countries: Vec<String>,

    /// YAML config file; command-line values take precedence
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Name of the nftables table
    #[arg(short = 't', long)]
    pub table_name: Option<String>,

    /// Family of the nftables table
    #[arg(short = 'l', long, value_enum)]
    pub table_family: Option<TableFamily>,

    /// Ingress interface (netdev family only)
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Allow only the listed countries instead of denying them
    #[arg(long)]
    pub allow: bool,

    /// Do not filter IPv4 traffic
    #[arg(long)]
    pub no_ipv4: bool,

    /// Do not filter IPv6 traffic
    #[arg(long)]
    pub no_ipv6: bool,

    /// Add a counter to the filter rules
    #[arg(short, long)]
    pub counter: bool,

    /// Log packets matched by the filter rules
    #[arg(long)]
    pub log: bool,

    /// Prefix of the log messages (requires --log)
    #[arg(long)]
    pub log_prefix: Option<String>,

    /// nft log level (requires --log)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Comma-separated addresses or CIDRs that are always accepted
    #[arg(short, long, value_name = "LIST")]
    pub exceptions: Option<String>,

    /// Base URL of the IPv4 zone files
    #[arg(long, value_name = "URL")]
    pub ipv4_url: Option<String>,

    /// Base URL of the IPv6 zone files
    #[arg(long, value_name = "URL")]
    pub ipv6_url: Option<String>,

    /// Quiet mode (for cron/systemd timer)
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Settings from the config file, if any, with command-line overrides.
    pub fn to_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        self.apply_to(&mut config);
        Ok(config)
    }

    /// Override `config` with every value given on the command line.
    pub fn apply_to(&self, config: &mut Config) {
        if !self.countries.is_empty() {
            config.countries = self.countries.clone();
        }
        if let Some(name) = &self.table_name {
            config.table_name = name.clone();
        }
        if let Some(family) = self.table_family {
            config.table_family = family;
        }
        if let Some(interface) = &self.interface {
            config.interface = Some(interface.clone());
        }
        if self.allow {
            config.default_action = DefaultAction::Allow;
        }
        if self.no_ipv4 {
            config.ipv4 = false;
        }
        if self.no_ipv6 {
            config.ipv6 = false;
        }
        if self.counter {
            config.counter = true;
        }
        if self.log {
            config.log = true;
        }
        if let Some(prefix) = &self.log_prefix {
            config.log_prefix = Some(prefix.clone());
        }
        if let Some(level) = &self.log_level {
            config.log_level = Some(level.clone());
        }
        if let Some(list) = &self.exceptions {
            config.exceptions = list
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(url) = &self.ipv4_url {
            config.ipv4_url = url.clone();
        }
        if let Some(url) = &self.ipv6_url {
            config.ipv6_url = url.clone();
        }
    }
}
