//! Table, chain and rule-generation lifecycle.
//!
//! The chain is never emptied: the handles of the previous generation are
//! recorded before the update and only deleted once every new rule is in.

use tracing::{debug, info, warn};

use crate::context::UpdateContext;
use crate::enforcer::CHAIN_NAME;
use crate::error::{chain, GeoFilterError};

/// Result of deleting the previous rule generation
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RetireReport {
    pub deleted: Vec<u64>,
    /// Handles left in place after a failure, starting with the failing one
    pub remaining: Vec<u64>,
    pub error: Option<String>,
}

impl RetireReport {
    pub fn is_complete(&self) -> bool {
        self.remaining.is_empty()
    }
}

impl UpdateContext<'_> {
    /// Create the table and the filter chain if missing.
    ///
    /// An existing chain keeps its current policy: it still guards the
    /// previous rule generation until [`Self::apply_chain_policy`] runs.
    pub fn ensure_table_and_chain(&self) -> Result<(), GeoFilterError> {
        self.store.add_table(&self.table).map_err(|e| {
            GeoFilterError::RuleInstall(format!("add table {}: {}", self.table, chain(&e)))
        })?;

        let exists = self
            .store
            .chain_exists(&self.table, CHAIN_NAME)
            .map_err(|e| GeoFilterError::Store(format!("list chain {}: {}", CHAIN_NAME, chain(&e))))?;
        if exists {
            debug!(table = %self.table, "Chain exists, policy left unchanged");
            return Ok(());
        }

        self.add_chain()?;
        debug!(table = %self.table, "Table and chain created");
        Ok(())
    }

    /// Set the chain policy for the configured action.
    ///
    /// Called once the new filter and accept rules are installed.
    pub fn apply_chain_policy(&self) -> Result<(), GeoFilterError> {
        self.add_chain()?;
        debug!(table = %self.table, policy = %self.rules.action.policy(), "Chain policy applied");
        Ok(())
    }

    fn add_chain(&self) -> Result<(), GeoFilterError> {
        let spec = self.chain_spec();
        self.store.add_chain(&self.table, &spec).map_err(|e| {
            GeoFilterError::RuleInstall(format!(
                "add chain {} {} {}: {}",
                self.table,
                spec.name,
                spec.body(),
                chain(&e)
            ))
        })
    }

    /// Handles of every rule currently in the filter chain.
    pub fn capture_old_rule_handles(&self) -> Result<Vec<u64>, GeoFilterError> {
        let rules = self
            .store
            .list_rules(&self.table, CHAIN_NAME)
            .map_err(|e| GeoFilterError::Store(format!("list chain {}: {}", CHAIN_NAME, chain(&e))))?;
        let handles: Vec<u64> = rules.iter().map(|r| r.handle).collect();
        debug!(count = handles.len(), "Captured previous rule generation");
        Ok(handles)
    }

    /// Delete the previous generation of rules.
    ///
    /// Stops at the first failure and reports what is left; the new
    /// generation is already active, so nothing is rolled back.
    pub fn retire_old_rules(&self, handles: &[u64]) -> RetireReport {
        let mut report = RetireReport::default();

        for (i, &handle) in handles.iter().enumerate() {
            match self.store.delete_rule(&self.table, CHAIN_NAME, handle) {
                Ok(()) => {
                    debug!(handle, "Deleted old rule");
                    report.deleted.push(handle);
                }
                Err(e) => {
                    warn!(handle, "Failed to delete old rule: {:#}", e);
                    report.remaining = handles[i..].to_vec();
                    report.error = Some(chain(&e));
                    break;
                }
            }
        }

        if report.is_complete() && !report.deleted.is_empty() {
            info!("Retired {} old rule(s)", report.deleted.len());
        }
        report
    }
}
