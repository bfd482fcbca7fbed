//! Point-in-time captures of filter sets, used to undo a failed update.

use anyhow::{Context, Result};
use tracing::debug;

use crate::enforcer::{delete_set_script, flush_set_script, RuleStore, SetDefinition, SetElement, SetRef};

/// Contents of one set before an update started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    set: SetRef,
    existed: bool,
    elements: Vec<SetElement>,
}

impl Snapshot {
    /// Read the current elements of `set`.
    ///
    /// A set that does not exist yet gives an empty snapshot marked absent.
    pub fn capture(store: &dyn RuleStore, set: &SetRef) -> Result<Self> {
        let existed = store
            .set_exists(set)
            .with_context(|| format!("Failed to check set {}", set))?;
        let elements = if existed {
            store
                .list_set_elements(set)
                .with_context(|| format!("Failed to capture set {}", set))?
        } else {
            Vec::new()
        };

        debug!(set = %set, existed, elements = elements.len(), "Captured snapshot");
        Ok(Self {
            set: set.clone(),
            existed,
            elements,
        })
    }

    pub fn set(&self) -> &SetRef {
        &self.set
    }

    pub fn existed(&self) -> bool {
        self.existed
    }

    pub fn elements(&self) -> &[SetElement] {
        &self.elements
    }

    /// Script that puts the set back into the captured state, or `None`
    /// when the store already matches it.
    fn restore_script(&self, exists_now: bool) -> Option<String> {
        match (self.existed, exists_now) {
            (false, false) => None,
            (false, true) => Some(delete_set_script(&self.set)),
            (true, true) => {
                let mut script = flush_set_script(&self.set);
                script.push_str(&SetDefinition::new(&self.set, &self.elements).render());
                Some(script)
            }
            (true, false) => Some(SetDefinition::new(&self.set, &self.elements).render()),
        }
    }

    /// Replay the capture as a single bulk-load.
    ///
    /// Restoring is idempotent: replaying twice, or replaying an untouched
    /// set, leaves the same contents.
    pub fn restore(&self, store: &dyn RuleStore) -> Result<()> {
        let exists_now = store
            .set_exists(&self.set)
            .with_context(|| format!("Failed to check set {}", self.set))?;

        let Some(script) = self.restore_script(exists_now) else {
            debug!(set = %self.set, "Nothing to restore");
            return Ok(());
        };

        store
            .bulk_load(&script)
            .with_context(|| format!("Failed to restore set {}", self.set))?;
        debug!(set = %self.set, elements = self.elements.len(), "Restored snapshot");
        Ok(())
    }
}
