//! Set definition blocks and set listings.
//!
//! A definition block is the unit handed to the store's bulk-load: a table
//! block declaring one interval set and, optionally, the elements to add.

use anyhow::{bail, Context, Result};
use ipnet::{IpNet, Ipv4Subnets, Ipv6Subnets};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use super::{AddressFamily, SetRef};
use crate::validation::validate_ip_or_cidr;

/// One element of an interval set.
///
/// nft prints merged intervals that are not prefix-aligned as ranges, so a
/// listing can contain both forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SetElement {
    Net(IpNet),
    Range(IpAddr, IpAddr),
}

impl SetElement {
    pub fn family(&self) -> AddressFamily {
        let addr = match self {
            SetElement::Net(net) => net.addr(),
            SetElement::Range(start, _) => *start,
        };
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    /// Decompose into the minimal list of prefixes covering the element.
    pub fn to_nets(&self) -> Vec<IpNet> {
        match *self {
            SetElement::Net(net) => vec![net],
            SetElement::Range(IpAddr::V4(start), IpAddr::V4(end)) => {
                Ipv4Subnets::new(start, end, 0).map(IpNet::V4).collect()
            }
            SetElement::Range(IpAddr::V6(start), IpAddr::V6(end)) => {
                Ipv6Subnets::new(start, end, 0).map(IpNet::V6).collect()
            }
            // Mixed ranges are rejected by FromStr
            SetElement::Range(_, _) => Vec::new(),
        }
    }
}

impl From<IpNet> for SetElement {
    fn from(net: IpNet) -> Self {
        SetElement::Net(net)
    }
}

impl fmt::Display for SetElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetElement::Net(net) => write!(f, "{}", net),
            SetElement::Range(start, end) => write!(f, "{}-{}", start, end),
        }
    }
}

impl FromStr for SetElement {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some((start, end)) = s.split_once('-') {
            let start: IpAddr = start
                .trim()
                .parse()
                .with_context(|| format!("Invalid range start: {}", s))?;
            let end: IpAddr = end
                .trim()
                .parse()
                .with_context(|| format!("Invalid range end: {}", s))?;
            if start.is_ipv4() != end.is_ipv4() {
                bail!("Range mixes address families: {}", s);
            }
            if start > end {
                bail!("Range start is after range end: {}", s);
            }
            return Ok(SetElement::Range(start, end));
        }
        Ok(SetElement::Net(validate_ip_or_cidr(s)?.trunc()))
    }
}

/// Definition block for a filter set.
pub struct SetDefinition<'a> {
    set: &'a SetRef,
    elements: &'a [SetElement],
}

impl<'a> SetDefinition<'a> {
    pub fn new(set: &'a SetRef, elements: &'a [SetElement]) -> Self {
        Self { set, elements }
    }

    /// Header-only definition: declares the set without adding elements.
    pub fn empty(set: &'a SetRef) -> Self {
        Self { set, elements: &[] }
    }

    /// Render the block consumed by the store's bulk-load.
    ///
    /// The `elements` block is left out when there is nothing to add, since
    /// nft rejects an empty element list.
    pub fn render(&self) -> String {
        let mut script = String::with_capacity(128 + self.elements.len() * 20);

        script.push_str(&format!(
            "table {} {} {{\n",
            self.set.table.family, self.set.table.name
        ));
        script.push_str(&format!("set {} {{\n", self.set.name()));
        script.push_str(&format!("type {}\n", self.set.family.element_type()));
        script.push_str("flags interval\n");
        script.push_str("auto-merge\n");

        if !self.elements.is_empty() {
            script.push_str("elements = {\n");
            for element in self.elements {
                script.push_str(&element.to_string());
                script.push_str(",\n");
            }
            script.push_str("}\n");
        }

        script.push_str("}\n");
        script.push_str("}\n");
        script
    }
}

/// Extract the elements from `nft list set` output.
///
/// Elements of the wrong family are an error: they can only come from a set
/// that was not created by this tool.
pub fn parse_set_listing(output: &str, family: AddressFamily) -> Result<Vec<SetElement>> {
    let Some(start) = output.find("elements = {") else {
        return Ok(Vec::new());
    };
    let body = &output[start + "elements = {".len()..];
    let end = body
        .find('}')
        .context("Unterminated elements block in set listing")?;

    let mut elements = Vec::new();
    for chunk in body[..end].split(',') {
        // Elements may carry trailing annotations (counters, timeouts)
        let Some(token) = chunk.split_whitespace().next() else {
            continue;
        };
        let element: SetElement = token
            .parse()
            .with_context(|| format!("Unexpected element in set listing: {}", token))?;
        if element.family() != family {
            bail!("{} element {} found in {} set", element.family(), token, family);
        }
        elements.push(element);
    }

    Ok(elements)
}
