//! # nft-geo-filter - Country-based IP filtering for nftables
//!
//! Keeps an nftables table with one interval set per address family
//! (`filter-v4`, `filter-v6`) filled with the aggregated IP blocks of a list
//! of countries, and a filter chain that accepts or drops traffic from them.
//!
//! ## Update run
//!
//! ```text
//! ensure table + chain ──> capture old rule handles
//!        │
//!        ▼
//! for each family:  snapshot ─> flush ─> per country: [dormant] fetch [awake] ─> bulk-load
//!        │             ▲                                   │ failure
//!        │             └──────────── restore ◄─────────────┘
//!        ▼
//! append filter rule ─> insert exception + allow rules at head
//!        │
//!        ▼
//! set chain policy ─> delete old handles
//! ```
//!
//! The chain is never empty once populated, a set is never left
//! half-loaded after a failure, and the table is dormant only while a zone
//! file is downloading.
//!
//! ## Example Usage
//!
//! ```no_run
//! use nft_geo_filter::config::Config;
//! use nft_geo_filter::context::UpdateContext;
//! use nft_geo_filter::enforcer::NftablesStore;
//! use nft_geo_filter::exceptions::Exceptions;
//! use nft_geo_filter::fetcher::Fetcher;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config {
//!         countries: vec!["fr".to_string(), "de".to_string()],
//!         ..Default::default()
//!     };
//!     config.validate()?;
//!
//!     let store = NftablesStore::new();
//!     let fetcher = Fetcher::new(&config.ipv4_url, &config.ipv6_url)?;
//!     let ctx = UpdateContext::from_config(&store, &fetcher, &config);
//!
//!     let exceptions = Exceptions::parse("203.0.113.5")?;
//!     nft_geo_filter::commands::update::apply(&ctx, &config.countries, &exceptions).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`aggregator`] - CIDR aggregation
//! - [`cli`] - Command-line interface definitions
//! - [`commands`] - CLI command implementations
//! - [`config`] - Configuration parsing and validation
//! - [`context`] - Collaborators and options of an update run
//! - [`enforcer`] - Rule store abstraction and the nftables implementation
//! - [`error`] - Error taxonomy
//! - [`exceptions`] - Exception and allow-mode accept rules
//! - [`fetcher`] - HTTP client for downloading zone files
//! - [`lifecycle`] - Table, chain and rule generation lifecycle
//! - [`lock`] - File locking for concurrent execution prevention
//! - [`snapshot`] - Set capture and restore
//! - [`transaction`] - Per-family set update with rollback
//! - [`validation`] - Input validation

pub mod aggregator;
pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod context;
pub mod enforcer;
pub mod error;
pub mod exceptions;
pub mod fetcher;
pub mod lifecycle;
pub mod lock;
pub mod snapshot;
pub mod transaction;
pub mod validation;

pub use cli::Cli;
pub use config::Config;
pub use error::GeoFilterError;
