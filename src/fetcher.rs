//! HTTP fetcher for downloading aggregated country zone files.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, info};

use crate::enforcer::AddressFamily;
use crate::validation::validate_ip_or_cidr;

const TIMEOUT_SECS: u64 = 30;
const MAX_RETRIES: u32 = 3;
const RETRY_DELAY_MS: u64 = 2000;

/// Maximum size per zone file (10 MB)
/// The largest IPv4 country zone (us) is well under 1 MB
const MAX_ZONE_SIZE: usize = 10 * 1024 * 1024;

/// Default IPv4 zone base URL
pub const DEFAULT_IPV4_URL: &str = "https://www.ipdeny.com/ipblocks/data/aggregated";

/// Default IPv6 zone base URL
pub const DEFAULT_IPV6_URL: &str = "https://www.ipdeny.com/ipv6/ipaddresses/aggregated";

/// Source of per-country CIDR lists
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Return the raw zone file for a country and address family.
    async fn fetch(&self, country: &str, family: AddressFamily) -> Result<String>;
}

/// HTTP client for fetching zone files
pub struct Fetcher {
    client: Client,
    ipv4_base: String,
    ipv6_base: String,
    max_retries: u32,
    retry_delay: Duration,
}

impl Fetcher {
    /// Create a new fetcher for the given base URLs
    pub fn new(ipv4_base: &str, ipv6_base: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .user_agent(format!("nft-geo-filter/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            ipv4_base: ipv4_base.trim_end_matches('/').to_string(),
            ipv6_base: ipv6_base.trim_end_matches('/').to_string(),
            max_retries: MAX_RETRIES,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        })
    }

    /// Override the retry policy
    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// URL of the zone file for a country
    pub fn zone_url(&self, country: &str, family: AddressFamily) -> String {
        let base = match family {
            AddressFamily::V4 => &self.ipv4_base,
            AddressFamily::V6 => &self.ipv6_base,
        };
        format!("{}/{}-aggregated.zone", base, country)
    }

    /// Delay before retry number `attempt` (1-based), doubling each time.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_delay.saturating_mul(factor)
    }

    /// Fetch content with retry logic and size validation.
    ///
    /// Client errors (4xx) are returned at once: an unknown country code will
    /// not appear by asking again.
    async fn fetch_with_retry(&self, url: &str) -> Result<String> {
        let mut last_error = None;

        for attempt in 0..self.max_retries {
            if attempt > 0 {
                let delay = self.backoff(attempt);
                debug!("Retry {} after {:?} for {}", attempt, delay, url);
                tokio::time::sleep(delay).await;
            }

            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        if let Some(content_length) = response.content_length() {
                            if content_length as usize > MAX_ZONE_SIZE {
                                bail!(
                                    "Response too large: {} bytes (max: {} bytes)",
                                    content_length,
                                    MAX_ZONE_SIZE
                                );
                            }
                        }

                        let body = response
                            .text()
                            .await
                            .context("Failed to read response body")?;

                        // Content-Length may be absent or wrong
                        if body.len() > MAX_ZONE_SIZE {
                            bail!(
                                "Downloaded content too large: {} bytes (max: {} bytes)",
                                body.len(),
                                MAX_ZONE_SIZE
                            );
                        }

                        return Ok(body);
                    }
                    if status.is_client_error() {
                        bail!("HTTP {}", describe_status(status));
                    }
                    last_error = Some(anyhow::anyhow!("HTTP {}", describe_status(status)));
                }
                Err(e) => {
                    last_error = Some(e.into());
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Unknown error")))
    }
}

#[async_trait]
impl BlockSource for Fetcher {
    async fn fetch(&self, country: &str, family: AddressFamily) -> Result<String> {
        let url = self.zone_url(country, family);
        info!("Fetching {} blocks for {}...", family, country);
        let body = self
            .fetch_with_retry(&url)
            .await
            .with_context(|| format!("GET {}", url))?;
        debug!(country, %family, bytes = body.len(), "Downloaded zone file");
        Ok(body)
    }
}

/// Status code with its canonical reason, e.g. `404 Not Found`
fn describe_status(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    }
}

/// Parse an aggregated zone file (one IP/CIDR per line).
///
/// Blank lines and `#` comments are skipped. Any other line must be an
/// address or prefix of `family`; the data is untrusted and ends up in an
/// nft script, so nothing else is let through.
pub fn parse_zone(content: &str, family: AddressFamily) -> Result<Vec<IpNet>> {
    let mut nets = Vec::new();

    for (index, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let net = validate_ip_or_cidr(trimmed)
            .with_context(|| format!("line {}", index + 1))?
            .trunc();
        let net_family = match net {
            IpNet::V4(_) => AddressFamily::V4,
            IpNet::V6(_) => AddressFamily::V6,
        };
        if net_family != family {
            bail!(
                "line {}: {} block {} in {} zone",
                index + 1,
                net_family,
                trimmed,
                family
            );
        }
        nets.push(net);
    }

    Ok(nets)
}

/// Format a count with K/M suffix
pub fn format_count(count: usize) -> String {
    if count >= 1_000_000 {
        format!("{:.1}M", count as f64 / 1_000_000.0)
    } else if count >= 1_000 {
        format!("{:.1}K", count as f64 / 1_000.0)
    } else {
        count.to_string()
    }
}



#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::enforcer::mock::MemoryStore;
    use crate::enforcer::TableRef;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// In-memory block source for testing
    ///
    /// Unknown zones answer like the real source does for an unknown
    /// country: `HTTP 404 Not Found`.
    #[derive(Default)]
    pub struct FakeSource {
        zones: HashMap<(String, AddressFamily), std::result::Result<String, String>>,
        observed: Option<(Arc<MemoryStore>, TableRef)>,
        calls: Mutex<Vec<(String, AddressFamily)>>,
        /// Table dormancy seen at the time of each fetch
        pub dormant_during_fetch: Mutex<Vec<bool>>,
    }

    impl FakeSource {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_zone(mut self, country: &str, family: AddressFamily, body: &str) -> Self {
            self.zones
                .insert((country.to_string(), family), Ok(body.to_string()));
            self
        }

        pub fn with_failure(mut self, country: &str, family: AddressFamily, reason: &str) -> Self {
            self.zones
                .insert((country.to_string(), family), Err(reason.to_string()));
            self
        }

        /// Record the dormancy of `table` in `store` on every fetch.
        pub fn observing(mut self, store: Arc<MemoryStore>, table: TableRef) -> Self {
            self.observed = Some((store, table));
            self
        }

        pub fn calls(&self) -> Vec<(String, AddressFamily)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BlockSource for FakeSource {
        async fn fetch(&self, country: &str, family: AddressFamily) -> Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push((country.to_string(), family));
            if let Some((store, table)) = &self.observed {
                self.dormant_during_fetch
                    .lock()
                    .unwrap()
                    .push(store.is_dormant(table));
            }
            match self.zones.get(&(country.to_string(), family)) {
                Some(Ok(body)) => Ok(body.clone()),
                Some(Err(reason)) => Err(anyhow::anyhow!("{}", reason)),
                None => Err(anyhow::anyhow!("HTTP 404 Not Found")),
            }
        }
    }
}
