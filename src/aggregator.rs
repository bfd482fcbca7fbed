//! CIDR aggregation for country block lists.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

/// Aggregate a list of IPs/CIDRs into the minimal list of CIDR ranges.
///
/// Contiguous and overlapping ranges are merged, the same way an nft
/// interval set with `auto-merge` coalesces its elements.
/// For example: [192.168.0.0/25, 192.168.0.128/25] -> [192.168.0.0/24]
pub fn aggregate(nets: &[IpNet]) -> Vec<IpNet> {
    let mut v4_nets: Vec<Ipv4Net> = Vec::new();
    let mut v6_nets: Vec<Ipv6Net> = Vec::new();
    for net in nets {
        match net {
            IpNet::V4(v4) => v4_nets.push(*v4),
            IpNet::V6(v6) => v6_nets.push(*v6),
        }
    }

    Ipv4Net::aggregate(&v4_nets)
        .into_iter()
        .map(IpNet::V4)
        .chain(Ipv6Net::aggregate(&v6_nets).into_iter().map(IpNet::V6))
        .collect()
}

/// Calculate the total number of individual IPs covered by a list of CIDRs.
///
/// Uses saturating arithmetic to prevent overflow on large prefixes like /0.
pub fn count_ips(nets: &[IpNet]) -> u128 {
    nets.iter()
        .map(|net| {
            let shift = net.max_prefix_len() - net.prefix_len();
            // 1 << 128 would overflow u128
            if shift >= 128 {
                u128::MAX
            } else {
                1u128 << shift
            }
        })
        .fold(0u128, |acc, count| acc.saturating_add(count))
}
