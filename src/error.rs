//! Error types for nft-geo-filter.
//!
//! The variants follow the failure classes of an update run: everything
//! detected before the rule store is touched (`Config`, `Validation`), the
//! per-family transaction failures that trigger a rollback (`Fetch`, `Load`),
//! and rule wiring failures that are fatal but leave sets intact
//! (`RuleInstall`).

use thiserror::Error;

use crate::enforcer::AddressFamily;

#[derive(Error, Debug)]
pub enum GeoFilterError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid exception address: {0}")]
    Validation(String),

    #[error("Failed to fetch {family} block list for '{country}': {reason}")]
    Fetch {
        country: String,
        family: AddressFamily,
        reason: String,
    },

    #[error("Failed to load set: {0}")]
    Load(String),

    #[error("Failed to install rule: {0}")]
    RuleInstall(String),

    #[error("Rule store error: {0}")]
    Store(String),
}

impl GeoFilterError {
    /// Whether a later run could succeed without any change of configuration.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Fetch { .. })
    }

    /// Whether the error was raised before the rule store was touched.
    pub fn is_pre_mutation(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Validation(_))
    }
}

/// Render an `anyhow` chain on a single line for embedding in a variant.
pub(crate) fn chain(err: &anyhow::Error) -> String {
    format!("{:#}", err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display() {
        let err = GeoFilterError::Fetch {
            country: "zz".to_string(),
            family: AddressFamily::V4,
            reason: "HTTP 404 Not Found".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("'zz'"));
        assert!(msg.contains("IPv4"));
        assert!(msg.contains("404"));
    }

    #[test]
    fn test_retryable_only_for_fetch() {
        let fetch = GeoFilterError::Fetch {
            country: "fr".to_string(),
            family: AddressFamily::V6,
            reason: "timeout".to_string(),
        };
        assert!(fetch.is_retryable());
        assert!(!GeoFilterError::Config("x".into()).is_retryable());
        assert!(!GeoFilterError::Load("x".into()).is_retryable());
    }

    #[test]
    fn test_pre_mutation_classes() {
        assert!(GeoFilterError::Config("x".into()).is_pre_mutation());
        assert!(GeoFilterError::Validation("x".into()).is_pre_mutation());
        assert!(!GeoFilterError::RuleInstall("x".into()).is_pre_mutation());
        assert!(!GeoFilterError::Store("x".into()).is_pre_mutation());
    }

    #[test]
    fn test_chain_flattens_context() {
        let err = anyhow::anyhow!("nft failed: syntax error").context("Failed to load set");
        assert_eq!(chain(&err), "Failed to load set: nft failed: syntax error");
    }
}
