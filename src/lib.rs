//! Crypto Tax Transaction Resolver Library
//!
//! Ingests half-specified transactions from heterogeneous sources and
//! emits a normalized, tax-ready transaction list with authoritative
//! historical prices in a chosen native fiat. Pricing routes over
//! time-indexed market graphs per exchange, backed by a multi-tier cache,
//! a bulk CSV archive pipeline, and throttled exchange REST clients.

pub mod cache;
pub mod config;
pub mod converter;
pub mod csv_pricing;
pub mod error;
pub mod exchange;
pub mod fiat;
pub mod graph;
pub mod resolver;
pub mod transaction;
pub mod types;

// Re-export commonly used types
pub use cache::PersistentCache;
pub use config::{load_config, load_toml_config, ResolverConfig};
pub use converter::PairConverter;
pub use error::{Result, TaxGraphError};
pub use exchange::{ExchangeClient, ExchangeFactory, Granularity, Market, MarketKind, OhlcvRow};
pub use fiat::FiatRateClient;
pub use resolver::TransactionResolver;
pub use transaction::{
    Direction, InTransaction, IntraTransaction, OutTransaction, Transaction, TransactionHeader,
    TransactionHint, TransactionType,
};
pub use types::{
    AssetPairAndTimestamp, HistoricalBar, MaybeUnknown, PriceSource, TransactionManifest,
};

/// Initialize logging for binaries embedding the resolver. Honors the
/// standard `RUST_LOG` filter syntax, defaulting to `info`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();
}
