//! nftables rule store implementation.

use anyhow::{Context, Result};
use tracing::debug;

use super::{
    exec_cmd_with_executor, nft_path, parse_set_listing, ChainSpec, RuleEntry, RulePosition,
    RuleStore, SetElement, SetRef, TableRef, Verdict,
};
use crate::cmd_abstraction::{args_to_strings, CommandExecutor, RealCommandExecutor};

/// Rule store backed by the `nft` binary
pub struct NftablesStore<E: CommandExecutor = RealCommandExecutor> {
    executor: E,
}

impl NftablesStore<RealCommandExecutor> {
    pub fn new() -> Self {
        Self {
            executor: RealCommandExecutor::new(),
        }
    }
}

impl Default for NftablesStore<RealCommandExecutor> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: CommandExecutor> NftablesStore<E> {
    /// Create a store that runs nft through the given executor
    pub fn with_executor(executor: E) -> Self {
        Self { executor }
    }

    fn nft(&self, args: &[&str]) -> Result<String> {
        exec_cmd_with_executor(&self.executor, nft_path(), args)
    }

    /// Whether `nft list set` succeeds; a missing set exits non-zero.
    fn list_set(&self, set: &SetRef) -> Result<Option<String>> {
        let family = set.table.family.to_string();
        let args = args_to_strings(&["list", "set", &family, &set.table.name, set.name()]);
        let output = self
            .executor
            .execute(nft_path(), &args)
            .context("Failed to execute nft")?;
        Ok(output.success.then_some(output.stdout))
    }
}

impl<E: CommandExecutor> RuleStore for NftablesStore<E> {
    fn add_table(&self, table: &TableRef) -> Result<()> {
        let family = table.family.to_string();
        self.nft(&["add", "table", &family, &table.name])
            .with_context(|| format!("Failed to add table {}", table))?;
        Ok(())
    }

    fn set_dormant(&self, table: &TableRef, dormant: bool) -> Result<()> {
        let family = table.family.to_string();
        // Re-adding an existing table without flags clears them
        let result = if dormant {
            self.nft(&["add", "table", &family, &table.name, "{ flags dormant; }"])
        } else {
            self.nft(&["add", "table", &family, &table.name])
        };
        result.with_context(|| {
            format!(
                "Failed to {} table {}",
                if dormant { "suspend" } else { "wake" },
                table
            )
        })?;
        debug!(table = %table, dormant, "Table dormancy changed");
        Ok(())
    }

    fn add_chain(&self, table: &TableRef, chain: &ChainSpec) -> Result<()> {
        let family = table.family.to_string();
        let body = chain.body();
        self.nft(&["add", "chain", &family, &table.name, &chain.name, &body])
            .with_context(|| format!("Failed to add chain {} to table {}", chain.name, table))?;
        Ok(())
    }

    fn chain_exists(&self, table: &TableRef, chain: &str) -> Result<bool> {
        let family = table.family.to_string();
        let args = args_to_strings(&["list", "chain", &family, &table.name, chain]);
        let output = self
            .executor
            .execute(nft_path(), &args)
            .context("Failed to execute nft")?;
        Ok(output.success)
    }

    fn list_rules(&self, table: &TableRef, chain: &str) -> Result<Vec<RuleEntry>> {
        let family = table.family.to_string();
        let output = self
            .nft(&["-a", "list", "chain", &family, &table.name, chain])
            .with_context(|| format!("Failed to list chain {} of table {}", chain, table))?;
        parse_rule_listing(&output)
    }

    fn delete_rule(&self, table: &TableRef, chain: &str, handle: u64) -> Result<()> {
        let family = table.family.to_string();
        let handle_str = handle.to_string();
        self.nft(&[
            "delete",
            "rule",
            &family,
            &table.name,
            chain,
            "handle",
            &handle_str,
        ])
        .with_context(|| format!("Failed to delete rule with handle {}", handle))?;
        Ok(())
    }

    fn insert_rule(
        &self,
        table: &TableRef,
        chain: &str,
        rule: &str,
        position: RulePosition,
    ) -> Result<()> {
        let family = table.family.to_string();
        let verb = match position {
            RulePosition::Head => "insert",
            RulePosition::Tail => "add",
        };
        debug!("nft {} rule {} {} {} {}", verb, family, table.name, chain, rule);
        self.nft(&[verb, "rule", &family, &table.name, chain, rule])
            .with_context(|| format!("Failed to {} rule '{}'", verb, rule))?;
        Ok(())
    }

    fn set_exists(&self, set: &SetRef) -> Result<bool> {
        Ok(self.list_set(set)?.is_some())
    }

    fn list_set_elements(&self, set: &SetRef) -> Result<Vec<SetElement>> {
        match self.list_set(set)? {
            Some(output) => parse_set_listing(&output, set.family)
                .with_context(|| format!("Failed to read elements of set {}", set)),
            None => Ok(Vec::new()),
        }
    }

    fn bulk_load(&self, script: &str) -> Result<()> {
        debug!("Executing nft script:\n{}", script);
        let args = args_to_strings(&["-f", "-"]);
        self.executor
            .execute_with_stdin(nft_path(), &args, script)?
            .into_stdout("nft")?;
        Ok(())
    }
}

/// Parse `nft -a list chain` output into rule entries.
fn parse_rule_listing(output: &str) -> Result<Vec<RuleEntry>> {
    let mut rules = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        let Some((rule, handle)) = line.rsplit_once("# handle ") else {
            continue;
        };
        let rule = rule.trim();
        // Table and chain headers carry handles too
        if rule.ends_with('{') || rule.is_empty() {
            continue;
        }
        let handle: u64 = handle
            .trim()
            .parse()
            .with_context(|| format!("Invalid rule handle in line: {}", line))?;

        let (expr, verdict) = split_verdict(rule);
        rules.push(RuleEntry {
            handle,
            expr: expr.to_string(),
            verdict,
        });
    }

    Ok(rules)
}

fn split_verdict(rule: &str) -> (&str, Option<Verdict>) {
    let verdict = match rule.rsplit(' ').next() {
        Some("accept") => Verdict::Accept,
        Some("drop") => Verdict::Drop,
        _ => return (rule, None),
    };
    let expr = rule[..rule.len() - verdict.as_str().len()].trim_end();
    (expr, Some(verdict))
}
