//! Centralized validation functions for nft-geo-filter.
//!
//! This module provides unified validation for:
//! - IP addresses and CIDR ranges
//! - Country codes
//! - nft log decorations
//! - Network interface names
//! - Block source URLs

use anyhow::{bail, Result};
use ipnet::IpNet;
use std::net::IpAddr;

/// Log levels accepted by the nft `log` statement
pub const VALID_LOG_LEVELS: &[&str] = &[
    "emerg", "alert", "crit", "err", "warn", "notice", "info", "debug",
];

/// Maximum length of an nft log prefix
pub const MAX_LOG_PREFIX_LEN: usize = 127;

/// Maximum length of a network interface name (IFNAMSIZ - 1)
pub const MAX_INTERFACE_LEN: usize = 15;

/// Validate an IP address or CIDR string and return the parsed IpNet.
///
/// If the input is a plain IP address (without /prefix), it will be converted
/// to a /32 (IPv4) or /128 (IPv6) network.
///
/// # Examples
/// ```
/// use nft_geo_filter::validation::validate_ip_or_cidr;
/// assert!(validate_ip_or_cidr("192.168.1.1").is_ok());
/// assert!(validate_ip_or_cidr("192.168.0.0/24").is_ok());
/// assert!(validate_ip_or_cidr("invalid").is_err());
/// ```
pub fn validate_ip_or_cidr(ip_str: &str) -> Result<IpNet> {
    if ip_str.contains('/') {
        ip_str
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid CIDR: {}", ip_str))
    } else {
        let ip: IpAddr = ip_str
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid IP address: {}", ip_str))?;
        Ok(IpNet::from(ip))
    }
}

/// Validate an ISO 3166-1 alpha-2 country code and return it lowercased.
///
/// # Examples
/// ```
/// use nft_geo_filter::validation::validate_country_code;
/// assert_eq!(validate_country_code("FR").unwrap(), "fr");
/// assert!(validate_country_code("fra").is_err());
/// ```
pub fn validate_country_code(code: &str) -> Result<String> {
    let code = code.trim();
    if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        bail!(
            "Invalid country code '{}'. Use a two-letter ISO 3166-1 code like 'fr'",
            code
        );
    }
    Ok(code.to_ascii_lowercase())
}

/// Validate an nft log level.
pub fn validate_log_level(level: &str) -> Result<()> {
    if !VALID_LOG_LEVELS.contains(&level) {
        bail!(
            "Invalid log level '{}'. Valid values: {}",
            level,
            VALID_LOG_LEVELS.join(", ")
        );
    }
    Ok(())
}

/// Validate an nft log prefix.
///
/// The prefix is embedded in a quoted string in the rule, so quotes and
/// control characters are rejected.
pub fn validate_log_prefix(prefix: &str) -> Result<()> {
    if prefix.len() > MAX_LOG_PREFIX_LEN {
        bail!(
            "Log prefix is too long ({} bytes, max: {} bytes)",
            prefix.len(),
            MAX_LOG_PREFIX_LEN
        );
    }
    if prefix.chars().any(|c| c == '"' || c == '\\' || c.is_control()) {
        bail!("Log prefix contains forbidden characters: {:?}", prefix);
    }
    Ok(())
}

/// Validate a network interface name for the netdev ingress hook.
///
/// # Examples
/// ```
/// use nft_geo_filter::validation::validate_interface_name;
/// assert!(validate_interface_name("enp1s0").is_ok());
/// assert!(validate_interface_name("eth0\" drop").is_err());
/// ```
pub fn validate_interface_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_INTERFACE_LEN {
        bail!(
            "Invalid interface name '{}': must be 1 to {} bytes",
            name,
            MAX_INTERFACE_LEN
        );
    }
    if name == "." || name == ".." || name.contains('/') {
        bail!("Invalid interface name '{}'", name);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_.@:".contains(c))
    {
        bail!("Interface name contains forbidden characters: {:?}", name);
    }
    Ok(())
}

/// Validate that a block source base URL uses HTTPS.
pub fn validate_https_url(url: &str) -> Result<()> {
    if !url.starts_with("https://") {
        bail!("Block source URL must use HTTPS: {}", url);
    }
    if url.len() <= "https://".len() || url.chars().any(|c| c.is_whitespace()) {
        bail!("Invalid block source URL: {}", url);
    }
    Ok(())
}
