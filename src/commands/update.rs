//! Update command implementation.

use anyhow::Result;
use tracing::{info, warn};

use crate::config::Config;
use crate::context::UpdateContext;
use crate::enforcer::{check_root, NftablesStore};
use crate::error::{chain, GeoFilterError};
use crate::exceptions::Exceptions;
use crate::fetcher::{format_count, Fetcher};
use crate::lifecycle::RetireReport;
use crate::lock::LockGuard;
use crate::transaction::SetUpdate;

/// What a complete update run did
#[derive(Debug)]
pub struct UpdateSummary {
    pub sets: Vec<SetUpdate>,
    pub exception_rules: usize,
    pub allow_rules: usize,
    pub retired: RetireReport,
}

/// Run the update command
pub async fn run(mut config: Config) -> Result<()> {
    // Everything that can be rejected up front is, before the store is touched
    config.validate()?;
    let exceptions = Exceptions::parse(&config.exception_list())?;
    check_root().map_err(|e| GeoFilterError::Config(chain(&e)))?;

    let _lock = LockGuard::acquire()?;

    let store = NftablesStore::new();
    let fetcher = Fetcher::new(&config.ipv4_url, &config.ipv6_url)?;
    let ctx = UpdateContext::from_config(&store, &fetcher, &config);

    info!(
        "Updating {} ({:?} {}) for {}...",
        ctx.table(),
        config.default_action,
        ctx.families()
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join("+"),
        config.countries.join(", ")
    );

    let summary = apply(&ctx, &config.countries, &exceptions)
        .await
        .inspect_err(|e| {
            if e.is_retryable() {
                warn!("Previous rules are still in place; retry once the source is reachable");
            }
        })?;

    println!();
    for set in &summary.sets {
        println!(
            "[OK] {}: {} ranges ({} IPs)",
            set.family,
            format_count(set.blocks.len()),
            format_count(usize::try_from(set.ip_count()).unwrap_or(usize::MAX))
        );
    }
    if summary.exception_rules > 0 {
        println!("[OK] {} exception(s) accepted", exceptions.len());
    }
    if !summary.retired.is_complete() {
        println!(
            "[WARN] {} old rule(s) could not be removed: {:?}",
            summary.retired.remaining.len(),
            summary.retired.remaining
        );
    }

    Ok(())
}

/// Replace the rule generation of `ctx`'s table.
///
/// The filter chain goes straight from the old generation to the new one:
/// old handles are captured first and deleted only after every set, filter
/// rule and accept rule of the new generation is in place. The chain policy
/// of an existing chain changes at that same point. Any error stops the run
/// with the old rules and policy still installed.
pub async fn apply(
    ctx: &UpdateContext<'_>,
    countries: &[String],
    exceptions: &Exceptions,
) -> Result<UpdateSummary, GeoFilterError> {
    ctx.ensure_table_and_chain()?;
    let old_handles = ctx.capture_old_rule_handles()?;

    let mut sets = Vec::with_capacity(ctx.families().len());
    for &family in ctx.families() {
        sets.push(ctx.update_filter_set(family, countries).await?);
    }

    // Exceptions first: the allow rules are then inserted ahead of them
    let exception_rules = ctx.insert_exception_rules(exceptions)?;
    let allow_rules = ctx.insert_allow_rules()?;
    ctx.apply_chain_policy()?;

    let retired = ctx.retire_old_rules(&old_handles);
    if let Some(error) = &retired.error {
        warn!(
            remaining = ?retired.remaining,
            "Old rules left in place: {}",
            error
        );
    }

    Ok(UpdateSummary {
        sets,
        exception_rules,
        allow_rules,
        retired,
    })
}
