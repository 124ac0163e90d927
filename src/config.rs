//! Configuration management
//!
//! Two loading styles: flat environment variables (with `.env` support)
//! for quick setups, and a TOML file for checked-in configurations. Both
//! produce the same `ResolverConfig`.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;

use crate::error::TaxGraphError;
use crate::graph::{Alias, ExchangeAliases, UNIVERSAL_EXCHANGE};
use crate::types::PriceSource;

/// Resolver-wide settings consumed by the pair converter and the
/// transaction resolver.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Fiat all monetary fields are normalized to.
    pub native_fiat: String,
    /// Which bar price becomes the transaction price.
    pub historical_price_type: PriceSource,
    /// Pricing exchange for unknown or locked lookups.
    pub default_exchange: Option<String>,
    /// Route every lookup through the default exchange.
    pub exchange_locked: bool,
    /// Assets with no market anywhere; priced at zero.
    pub untradeable_assets: Vec<String>,
    /// Raw alias records: `exchange,from,to,factor` joined by `;`,
    /// with `UNIVERSAL` as the any-exchange marker.
    pub aliases: Option<String>,
    /// Extra cache-key suffix to keep experimental runs separate.
    pub cache_modifier: Option<String>,
    /// Access key for the fiat rate API.
    pub fiat_access_key: Option<String>,
    /// Fiat routing priority, most preferred first.
    pub fiat_priority: Vec<String>,
    /// Fetch spot prices from the converters when sources omit them.
    pub read_spot_price_from_web: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            native_fiat: "USD".to_string(),
            historical_price_type: PriceSource::High,
            default_exchange: None,
            exchange_locked: false,
            untradeable_assets: Vec::new(),
            aliases: None,
            cache_modifier: None,
            fiat_access_key: None,
            fiat_priority: Vec::new(),
            read_spot_price_from_web: false,
        }
    }
}

/// Load configuration from environment variables (a `.env` file is read
/// first when present). Only `NATIVE_FIAT` is required.
pub fn load_config() -> Result<ResolverConfig> {
    dotenv::dotenv().ok();

    let historical_price_type = match std::env::var("HISTORICAL_PRICE_TYPE") {
        Ok(value) => PriceSource::from_str(&value)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("HISTORICAL_PRICE_TYPE is invalid")?,
        Err(_) => PriceSource::High,
    };

    Ok(ResolverConfig {
        native_fiat: std::env::var("NATIVE_FIAT").context("NATIVE_FIAT not set")?,
        historical_price_type,
        default_exchange: std::env::var("DEFAULT_EXCHANGE").ok(),
        exchange_locked: std::env::var("EXCHANGE_LOCKED")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
        untradeable_assets: std::env::var("UNTRADEABLE_ASSETS")
            .map(|v| split_list(&v))
            .unwrap_or_default(),
        aliases: std::env::var("ALIASES").ok(),
        cache_modifier: std::env::var("CACHE_MODIFIER").ok(),
        fiat_access_key: std::env::var("FIAT_ACCESS_KEY").ok(),
        fiat_priority: std::env::var("FIAT_PRIORITY")
            .map(|v| split_list(&v))
            .unwrap_or_default(),
        read_spot_price_from_web: std::env::var("READ_SPOT_PRICE_FROM_WEB")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
    })
}

// ---------------------------------------------------------------------------
// TOML file configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
struct TomlConfig {
    resolver: TomlResolverSection,
}

#[derive(Debug, Clone, Deserialize)]
struct TomlResolverSection {
    native_fiat: String,
    #[serde(default = "default_price_type")]
    historical_price_type: String,
    #[serde(default)]
    default_exchange: Option<String>,
    #[serde(default)]
    exchange_locked: bool,
    #[serde(default)]
    untradeable_assets: Vec<String>,
    #[serde(default)]
    aliases: Option<String>,
    #[serde(default)]
    cache_modifier: Option<String>,
    #[serde(default)]
    fiat_access_key: Option<String>,
    #[serde(default)]
    fiat_priority: Vec<String>,
    #[serde(default)]
    read_spot_price_from_web: bool,
}

fn default_price_type() -> String {
    "high".to_string()
}

/// Load configuration from a TOML file with a `[resolver]` section.
pub fn load_toml_config<P: AsRef<Path>>(path: P) -> Result<ResolverConfig> {
    let path = path.as_ref();
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read config file: {path:?}"))?;
    let parsed: TomlConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file: {path:?}"))?;
    let section = parsed.resolver;

    Ok(ResolverConfig {
        historical_price_type: PriceSource::from_str(&section.historical_price_type)
            .map_err(|e| anyhow::anyhow!("{e}"))
            .context("historical_price_type is invalid")?,
        native_fiat: section.native_fiat,
        default_exchange: section.default_exchange,
        exchange_locked: section.exchange_locked,
        untradeable_assets: section.untradeable_assets,
        aliases: section.aliases,
        cache_modifier: section.cache_modifier,
        fiat_access_key: section.fiat_access_key,
        fiat_priority: section.fiat_priority,
        read_spot_price_from_web: section.read_spot_price_from_web,
    })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// Parse user alias records: `exchange,from,to,factor` joined by `;`.
/// The exchange field must be a supported exchange name or `UNIVERSAL`.
pub fn parse_aliases(aliases: &str) -> std::result::Result<ExchangeAliases, TaxGraphError> {
    let mut processed: ExchangeAliases = ExchangeAliases::new();
    for record in aliases.split(';') {
        let fields: Vec<&str> = record.split(',').map(str::trim).collect();
        if fields.len() != 4 {
            return Err(TaxGraphError::value(format!(
                "malformed alias record {record:?}: expected exchange,from,to,factor"
            )));
        }
        let exchange = fields[0];
        if exchange != UNIVERSAL_EXCHANGE && !crate::exchange::KNOWN_EXCHANGES.contains(&exchange) {
            return Err(TaxGraphError::value(format!(
                "exchange {exchange} is not supported at this time; check the spelling of the exchange"
            )));
        }
        let factor: Decimal = fields[3]
            .parse()
            .map_err(|e| TaxGraphError::value(format!("bad alias factor {:?}: {e}", fields[3])))?;
        if factor <= Decimal::ZERO {
            return Err(TaxGraphError::value(format!(
                "alias factor must be positive, got {factor}"
            )));
        }
        processed
            .entry(exchange.to_string())
            .or_default()
            .insert(Alias::new(fields[1], fields[2]), factor);
    }
    Ok(processed)
}
