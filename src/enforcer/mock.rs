//! In-memory rule store for tests.
//!
//! Behaves like nftables for everything the update core relies on: bulk-load
//! scripts apply atomically, interval sets auto-merge, rules get increasing
//! handles and cannot reference a missing set. Every mutation is recorded so
//! tests can check ordering properties afterwards.

use anyhow::{bail, Context, Result};
use ipnet::IpNet;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::{
    AddressFamily, ChainSpec, RuleEntry, RulePosition, RuleStore, SetElement, SetRef, TableFamily,
    TableRef, Verdict,
};
use crate::aggregator::aggregate;

/// Observable store mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Dormant(bool),
    BulkLoad,
    RuleAdded { handle: u64, position: RulePosition },
    RuleDeleted { handle: u64 },
}

#[derive(Debug, Clone, Default)]
struct Table {
    dormant: bool,
    chains: HashMap<String, Chain>,
    sets: HashMap<String, Vec<IpNet>>,
}

#[derive(Debug, Clone)]
struct Chain {
    spec: ChainSpec,
    rules: Vec<(u64, String)>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<TableRef, Table>,
    next_handle: u64,
    events: Vec<Event>,
    /// Rule count of every chain after each rule mutation
    rule_counts: Vec<usize>,
    fail_bulk_load_containing: Option<String>,
    fail_rule_containing: Option<String>,
    fail_delete: HashSet<u64>,
    fail_dormant: bool,
}

/// In-memory [`RuleStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_handle: 1,
                ..Default::default()
            }),
        }
    }

    /// Reject any bulk-load whose script contains `needle`.
    pub fn fail_bulk_load_containing(&self, needle: &str) {
        self.state.lock().unwrap().fail_bulk_load_containing = Some(needle.to_string());
    }

    /// Reject any rule insertion whose text contains `needle`.
    pub fn fail_rule_containing(&self, needle: &str) {
        self.state.lock().unwrap().fail_rule_containing = Some(needle.to_string());
    }

    /// Reject deletion of the given handle.
    pub fn fail_delete(&self, handle: u64) {
        self.state.lock().unwrap().fail_delete.insert(handle);
    }

    /// Reject attempts to make a table dormant.
    pub fn fail_dormant(&self) {
        self.state.lock().unwrap().fail_dormant = true;
    }

    /// Forget recorded events and rule counts.
    pub fn clear_events(&self) {
        let mut state = self.state.lock().unwrap();
        state.events.clear();
        state.rule_counts.clear();
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn rule_counts(&self) -> Vec<usize> {
        self.state.lock().unwrap().rule_counts.clone()
    }

    pub fn is_dormant(&self, table: &TableRef) -> bool {
        let state = self.state.lock().unwrap();
        state.tables.get(table).is_some_and(|t| t.dormant)
    }

    pub fn chain_policy(&self, table: &TableRef, chain: &str) -> Option<Verdict> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(table)
            .and_then(|t| t.chains.get(chain))
            .map(|c| c.spec.policy)
    }

    /// Rule texts of a chain in evaluation order.
    pub fn rule_texts(&self, table: &TableRef, chain: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(table)
            .and_then(|t| t.chains.get(chain))
            .map(|c| c.rules.iter().map(|(_, text)| text.clone()).collect())
            .unwrap_or_default()
    }

    /// Elements of a set, or `None` if it does not exist.
    pub fn set_contents(&self, set: &SetRef) -> Option<Vec<IpNet>> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(&set.table)
            .and_then(|t| t.sets.get(set.name()))
            .cloned()
    }
}

impl State {
    fn table_mut(&mut self, table: &TableRef) -> Result<&mut Table> {
        self.tables
            .get_mut(table)
            .with_context(|| format!("Error: No such file or directory: table {}", table))
    }

    fn record_rule_counts(&mut self) {
        let total = self
            .tables
            .values()
            .flat_map(|t| t.chains.values())
            .map(|c| c.rules.len())
            .sum();
        self.rule_counts.push(total);
    }
}

impl RuleStore for MemoryStore {
    fn add_table(&self, table: &TableRef) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        // Re-adding without flags clears them, as nft does
        state.tables.entry(table.clone()).or_default().dormant = false;
        Ok(())
    }

    fn set_dormant(&self, table: &TableRef, dormant: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.events.push(Event::Dormant(dormant));
        if dormant && state.fail_dormant {
            bail!("Error: Operation not permitted");
        }
        state.tables.entry(table.clone()).or_default().dormant = dormant;
        Ok(())
    }

    fn add_chain(&self, table: &TableRef, chain: &ChainSpec) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let table = state.table_mut(table)?;
        table
            .chains
            .entry(chain.name.clone())
            .and_modify(|c| c.spec.policy = chain.policy)
            .or_insert_with(|| Chain {
                spec: chain.clone(),
                rules: Vec::new(),
            });
        Ok(())
    }

    fn chain_exists(&self, table: &TableRef, chain: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tables
            .get(table)
            .is_some_and(|t| t.chains.contains_key(chain)))
    }

    fn list_rules(&self, table: &TableRef, chain: &str) -> Result<Vec<RuleEntry>> {
        let mut state = self.state.lock().unwrap();
        let chain = state
            .table_mut(table)?
            .chains
            .get(chain)
            .with_context(|| format!("Error: No such file or directory: chain {}", chain))?;
        Ok(chain
            .rules
            .iter()
            .map(|(handle, text)| {
                let (expr, verdict) = match text.rsplit_once(' ') {
                    Some((expr, "accept")) => (expr.to_string(), Some(Verdict::Accept)),
                    Some((expr, "drop")) => (expr.to_string(), Some(Verdict::Drop)),
                    _ => (text.clone(), None),
                };
                RuleEntry {
                    handle: *handle,
                    expr,
                    verdict,
                }
            })
            .collect())
    }

    fn delete_rule(&self, table: &TableRef, chain: &str, handle: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_delete.contains(&handle) {
            bail!("Error: Could not process rule: Device or resource busy");
        }
        let rules = &mut state
            .table_mut(table)?
            .chains
            .get_mut(chain)
            .context("Error: No such file or directory")?
            .rules;
        let before = rules.len();
        rules.retain(|(h, _)| *h != handle);
        if rules.len() == before {
            bail!("Error: Could not process rule: No such file or directory");
        }
        state.events.push(Event::RuleDeleted { handle });
        state.record_rule_counts();
        Ok(())
    }

    fn insert_rule(
        &self,
        table: &TableRef,
        chain: &str,
        rule: &str,
        position: RulePosition,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(needle) = &state.fail_rule_containing {
            if rule.contains(needle.as_str()) {
                bail!("Error: Could not process rule: {}", rule);
            }
        }
        let handle = state.next_handle;
        let table_state = state.table_mut(table)?;
        if let Some((_, set)) = rule.split_once('@') {
            let set = set.split_whitespace().next().unwrap_or_default();
            if !table_state.sets.contains_key(set) {
                bail!("Error: Could not process rule: No such file or directory: set {}", set);
            }
        }
        let rules = &mut table_state
            .chains
            .get_mut(chain)
            .context("Error: No such file or directory")?
            .rules;
        match position {
            RulePosition::Head => rules.insert(0, (handle, rule.to_string())),
            RulePosition::Tail => rules.push((handle, rule.to_string())),
        }
        state.next_handle += 1;
        state.events.push(Event::RuleAdded { handle, position });
        state.record_rule_counts();
        Ok(())
    }

    fn set_exists(&self, set: &SetRef) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tables
            .get(&set.table)
            .is_some_and(|t| t.sets.contains_key(set.name())))
    }

    fn list_set_elements(&self, set: &SetRef) -> Result<Vec<SetElement>> {
        Ok(self
            .set_contents(set)
            .unwrap_or_default()
            .into_iter()
            .map(SetElement::Net)
            .collect())
    }

    fn bulk_load(&self, script: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.events.push(Event::BulkLoad);
        if let Some(needle) = &state.fail_bulk_load_containing {
            if script.contains(needle.as_str()) {
                bail!("Error: Could not process rule: Invalid argument");
            }
        }

        // Work on a copy so a failing script leaves no trace
        let mut tables = state.tables.clone();
        apply_script(&mut tables, script)?;
        state.tables = tables;
        Ok(())
    }
}

fn parse_set_command(rest: &str) -> Result<(TableRef, String)> {
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let [family, table, set] = parts[..] else {
        bail!("Error: syntax error: {}", rest);
    };
    let family: TableFamily = family.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    Ok((TableRef::new(family, table), set.to_string()))
}

fn apply_script(tables: &mut HashMap<TableRef, Table>, script: &str) -> Result<()> {
    let mut lines = script.lines().map(str::trim).filter(|l| !l.is_empty());

    while let Some(line) = lines.next() {
        if let Some(rest) = line.strip_prefix("flush set ") {
            let (table, set) = parse_set_command(rest)?;
            tables
                .get_mut(&table)
                .and_then(|t| t.sets.get_mut(&set))
                .with_context(|| format!("Error: No such file or directory: set {}", set))?
                .clear();
        } else if let Some(rest) = line.strip_prefix("delete set ") {
            let (table, set) = parse_set_command(rest)?;
            tables
                .get_mut(&table)
                .and_then(|t| t.sets.remove(&set))
                .with_context(|| format!("Error: No such file or directory: set {}", set))?;
        } else if let Some(rest) = line.strip_prefix("table ") {
            let header = rest.strip_suffix('{').context("Error: syntax error")?;
            let (family, name) = header
                .trim()
                .split_once(' ')
                .context("Error: syntax error")?;
            let family: TableFamily = family.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            let table = tables.entry(TableRef::new(family, name.trim())).or_default();
            apply_table_block(table, &mut lines)?;
        } else {
            bail!("Error: syntax error, unexpected {}", line);
        }
    }
    Ok(())
}

fn apply_table_block<'a>(
    table: &mut Table,
    lines: &mut impl Iterator<Item = &'a str>,
) -> Result<()> {
    let set_line = lines.next().context("Error: syntax error")?;
    let set_name = set_line
        .strip_prefix("set ")
        .and_then(|s| s.strip_suffix('{'))
        .context("Error: syntax error")?
        .trim()
        .to_string();

    let mut family = None;
    let mut new_elements = Vec::new();
    let mut in_elements = false;
    let mut depth = 2;

    for line in lines.by_ref() {
        if in_elements {
            if line == "}" {
                in_elements = false;
                continue;
            }
            let element: SetElement = line
                .trim_end_matches(',')
                .parse()
                .with_context(|| format!("Error: syntax error, invalid element {}", line))?;
            new_elements.extend(element.to_nets());
            continue;
        }
        match line {
            "type ipv4_addr" => family = Some(AddressFamily::V4),
            "type ipv6_addr" => family = Some(AddressFamily::V6),
            "flags interval" | "auto-merge" => {}
            "elements = {" => in_elements = true,
            "}" => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            other => bail!("Error: syntax error, unexpected {}", other),
        }
    }

    let family = family.context("Error: set definition has no type")?;
    if new_elements
        .iter()
        .any(|n| matches!(n, IpNet::V4(_)) != (family == AddressFamily::V4))
    {
        bail!("Error: datatype mismatch in set {}", set_name);
    }

    let set = table.sets.entry(set_name).or_default();
    set.extend(new_elements);
    *set = aggregate(set);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcer::{SetDefinition, CHAIN_NAME};

    fn table() -> TableRef {
        TableRef::new(TableFamily::Inet, "geo-filter")
    }

    #[test]
    fn test_bulk_load_merges_elements() {
        let store = MemoryStore::new();
        let set = table().set(AddressFamily::V4);
        let first: Vec<SetElement> = vec!["10.0.0.0/25".parse().unwrap()];
        let second: Vec<SetElement> = vec!["10.0.0.128/25".parse().unwrap()];

        store.bulk_load(&SetDefinition::new(&set, &first).render()).unwrap();
        store.bulk_load(&SetDefinition::new(&set, &second).render()).unwrap();

        assert_eq!(
            store.set_contents(&set).unwrap(),
            vec!["10.0.0.0/24".parse::<IpNet>().unwrap()]
        );
    }

    #[test]
    fn test_bulk_load_is_atomic() {
        let store = MemoryStore::new();
        let set = table().set(AddressFamily::V4);
        let good: Vec<SetElement> = vec!["10.0.0.0/8".parse().unwrap()];
        store.bulk_load(&SetDefinition::new(&set, &good).render()).unwrap();

        let script = format!(
            "flush set inet geo-filter filter-v4\n{}",
            "table inet geo-filter {\nset filter-v4 {\ntype ipv4_addr\nelements = {\nnot-an-ip,\n}\n}\n}\n"
        );
        assert!(store.bulk_load(&script).is_err());
        assert_eq!(store.set_contents(&set).unwrap().len(), 1);
    }

    #[test]
    fn test_rule_referencing_missing_set_fails() {
        let store = MemoryStore::new();
        store.add_table(&table()).unwrap();
        store
            .add_chain(
                &table(),
                &ChainSpec {
                    name: CHAIN_NAME.to_string(),
                    hook: crate::enforcer::ChainHook::Prerouting,
                    priority: -190,
                    policy: Verdict::Accept,
                },
            )
            .unwrap();
        assert!(store
            .insert_rule(&table(), CHAIN_NAME, "ip saddr @filter-v4 drop", RulePosition::Tail)
            .is_err());
    }

    #[test]
    fn test_add_table_wakes_dormant_table() {
        let store = MemoryStore::new();
        store.set_dormant(&table(), true).unwrap();
        assert!(store.is_dormant(&table()));

        store.add_table(&table()).unwrap();
        assert!(!store.is_dormant(&table()));
    }

    #[test]
    fn test_chain_exists() {
        let store = MemoryStore::new();
        assert!(!store.chain_exists(&table(), CHAIN_NAME).unwrap());
        store.add_table(&table()).unwrap();
        assert!(!store.chain_exists(&table(), CHAIN_NAME).unwrap());
        store
            .add_chain(
                &table(),
                &ChainSpec {
                    name: CHAIN_NAME.to_string(),
                    hook: crate::enforcer::ChainHook::Prerouting,
                    priority: -190,
                    policy: Verdict::Drop,
                },
            )
            .unwrap();
        assert!(store.chain_exists(&table(), CHAIN_NAME).unwrap());
    }
}
