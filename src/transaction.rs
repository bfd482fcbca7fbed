//! Per-family set update transaction.
//!
//! Each family's set is snapshotted and flushed, then reloaded one country at
//! a time. Any fetch or load failure puts the snapshot back before the error
//! is returned, so traffic decisions only ever see the previous generation or
//! the complete new one.

use ipnet::IpNet;
use tracing::{debug, error, info, warn};

use crate::aggregator::{aggregate, count_ips};
use crate::context::UpdateContext;
use crate::enforcer::{
    flush_set_script, AddressFamily, RulePosition, RuleStore, SetDefinition, SetElement, TableRef,
    CHAIN_NAME,
};
use crate::error::{chain, GeoFilterError};
use crate::fetcher::{format_count, parse_zone};
use crate::snapshot::Snapshot;

/// Keeps a table dormant while a download is in flight.
///
/// The table is woken by [`DormancyGuard::release`], or by `Drop` on any
/// other exit path (early return, cancelled future, panic).
pub(crate) struct DormancyGuard<'a> {
    store: &'a dyn RuleStore,
    table: &'a TableRef,
    released: bool,
}

impl<'a> DormancyGuard<'a> {
    /// Make the table dormant.
    ///
    /// A failure is logged and the download goes ahead with the table live;
    /// the flag is still cleared afterwards.
    pub(crate) fn acquire(store: &'a dyn RuleStore, table: &'a TableRef) -> Self {
        match store.set_dormant(table, true) {
            Ok(()) => debug!(table = %table, "Table dormant"),
            Err(e) => warn!(table = %table, "Failed to make table dormant: {:#}", e),
        }
        Self {
            store,
            table,
            released: false,
        }
    }

    /// Wake the table and report whether that worked.
    pub(crate) fn release(mut self) -> anyhow::Result<()> {
        self.released = true;
        self.store.set_dormant(self.table, false)?;
        debug!(table = %self.table, "Table awake");
        Ok(())
    }
}

impl Drop for DormancyGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.store.set_dormant(self.table, false) {
            error!(table = %self.table, "Failed to wake table: {:#}", e);
        }
    }
}

/// Outcome of a successful set update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetUpdate {
    pub family: AddressFamily,
    pub countries: Vec<String>,
    /// Union of every loaded zone, aggregated
    pub blocks: Vec<IpNet>,
}

impl SetUpdate {
    pub fn ip_count(&self) -> u128 {
        count_ips(&self.blocks)
    }
}

impl UpdateContext<'_> {
    /// Replace the contents of `family`'s set with the zones of `countries`
    /// and append the country filter rule for it.
    pub async fn update_filter_set(
        &self,
        family: AddressFamily,
        countries: &[String],
    ) -> Result<SetUpdate, GeoFilterError> {
        if countries.is_empty() {
            return Err(GeoFilterError::Config(
                "At least one country code is required".to_string(),
            ));
        }

        let set = self.table.set(family);
        let snapshot =
            Snapshot::capture(self.store, &set).map_err(|e| GeoFilterError::Store(chain(&e)))?;
        if snapshot.existed() {
            self.store
                .bulk_load(&flush_set_script(&set))
                .map_err(|e| GeoFilterError::Store(format!("flush set {}: {}", set, chain(&e))))?;
            debug!(set = %set, previous = snapshot.elements().len(), "Flushed set");
        }

        let mut loaded = Vec::new();
        for country in countries {
            let guard = DormancyGuard::acquire(self.store, &self.table);
            let fetched = self.source.fetch(country, family).await;
            let woken = guard.release();

            let body = match fetched {
                Ok(body) => body,
                Err(e) => {
                    self.rollback(&snapshot);
                    return Err(GeoFilterError::Fetch {
                        country: country.clone(),
                        family,
                        reason: chain(&e),
                    });
                }
            };
            if let Err(e) = woken {
                self.rollback(&snapshot);
                return Err(GeoFilterError::Store(format!(
                    "wake table {}: {}",
                    self.table,
                    chain(&e)
                )));
            }

            let nets = match parse_zone(&body, family) {
                Ok(nets) => aggregate(&nets),
                Err(e) => {
                    self.rollback(&snapshot);
                    return Err(GeoFilterError::Load(format!(
                        "{} zone for '{}': {}",
                        family,
                        country,
                        chain(&e)
                    )));
                }
            };

            let elements: Vec<SetElement> = nets.iter().copied().map(SetElement::from).collect();
            if let Err(e) = self
                .store
                .bulk_load(&SetDefinition::new(&set, &elements).render())
            {
                self.rollback(&snapshot);
                return Err(GeoFilterError::Load(format!(
                    "{} for '{}': {}",
                    set,
                    country,
                    chain(&e)
                )));
            }

            info!(
                country = country.as_str(),
                family = %family,
                elements = nets.len(),
                "Loaded {} blocks",
                format_count(nets.len())
            );
            loaded.extend(nets);
        }

        let rule = self.rules.filter_rule(family);
        self.store
            .insert_rule(&self.table, CHAIN_NAME, &rule, RulePosition::Tail)
            .map_err(|e| GeoFilterError::RuleInstall(format!("{}: {}", rule, chain(&e))))?;
        debug!(rule = rule.as_str(), "Added filter rule");

        Ok(SetUpdate {
            family,
            countries: countries.to_vec(),
            blocks: aggregate(&loaded),
        })
    }

    /// Put a set back into its captured state; the caller returns the
    /// original error either way.
    fn rollback(&self, snapshot: &Snapshot) {
        match snapshot.restore(self.store) {
            Ok(()) => warn!(
                set = %snapshot.set(),
                elements = snapshot.elements().len(),
                "Restored previous set contents"
            ),
            Err(e) => error!(set = %snapshot.set(), "Rollback failed: {:#}", e),
        }
    }
}
