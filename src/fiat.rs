//! Fiat exchange-rate API client
//!
//! Daily USD-anchored rates from a currencylayer-style service: `/list`
//! enumerates supported currency codes, `/historical` returns the USD
//! quote for one currency on one date. The free tier only quotes against
//! USD; cross-fiat conversion is derived by the pair converter from the
//! USD leg and its cached reciprocal.

use chrono::NaiveDate;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::{Result, TaxGraphError};

/// Pseudo-exchange name used for fiat rate cache keys and fiat markets.
pub const FIAT_EXCHANGE: &str = "exchangerate.host";

const DEFAULT_BASE_URL: &str = "http://api.exchangerate.host";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Deserialize)]
struct ListResponse {
    success: bool,
    #[serde(default)]
    currencies: BTreeMap<String, String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoricalResponse {
    success: bool,
    #[serde(default)]
    quotes: BTreeMap<String, Decimal>,
    #[serde(default)]
    message: Option<String>,
}

/// Access-keyed client for the daily fiat rate API.
pub struct FiatRateClient {
    http: Client,
    base_url: String,
    access_key: String,
    fiat_list: Vec<String>,
}

impl FiatRateClient {
    pub fn new(access_key: impl Into<String>) -> Self {
        Self::with_base_url(access_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(access_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        FiatRateClient {
            http: Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("reqwest client"),
            base_url: base_url.into(),
            access_key: access_key.into(),
            fiat_list: Vec::new(),
        }
    }

    /// Supported fiat symbols, fetched once from `/list` and cached for
    /// the process lifetime. The service reports BTC as a currency; it is
    /// filtered out.
    pub async fn fiat_symbols(&mut self) -> Result<&[String]> {
        if self.fiat_list.is_empty() {
            self.fiat_list = self.fetch_symbols().await?;
        }
        Ok(&self.fiat_list)
    }

    pub async fn is_fiat(&mut self, asset: &str) -> Result<bool> {
        let symbols = self.fiat_symbols().await?;
        Ok(symbols.iter().any(|s| s == asset))
    }

    async fn fetch_symbols(&self) -> Result<Vec<String>> {
        let url = format!("{}/list", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("access_key", self.access_key.as_str())])
            .send()
            .await?;
        let status = response.status();
        let data: ListResponse = response.json().await.map_err(|e| {
            info!("Fetching of fiat symbols failed. The server might be down. Please try again later.");
            TaxGraphError::runtime(format!("fiat symbol list decode failed: {e}"))
        })?;
        if !data.success {
            if let Some(message) = &data.message {
                error!("Error {status}: {url}: {message}");
            }
            return Err(TaxGraphError::runtime(format!(
                "fiat symbol list request failed with status {status}"
            )));
        }
        Ok(data.currencies.into_keys().filter(|code| code != "BTC").collect())
    }

    /// The `USD -> currency` rate for one day, or `None` when the service
    /// reports no quote. Retries decode failures and timeouts up to five
    /// attempts; the caller checkpoints its caches when this gives up.
    pub async fn fetch_usd_rate(&self, date: NaiveDate, currency: &str) -> Result<Option<Decimal>> {
        let url = format!("{}/historical", self.base_url);
        let mut attempts: u32 = 0;
        loop {
            let result = self
                .http
                .get(&url)
                .query(&[
                    ("access_key", self.access_key.as_str()),
                    ("date", &date.format("%Y-%m-%d").to_string()),
                    ("currencies", currency),
                ])
                .send()
                .await;

            let decoded: std::result::Result<HistoricalResponse, reqwest::Error> = match result {
                Ok(response) => response.json().await,
                Err(e) if e.is_timeout() => Err(e),
                Err(e) => return Err(e.into()),
            };

            match decoded {
                Ok(data) => {
                    if !data.success {
                        if let Some(message) = &data.message {
                            error!("Fiat rate request for {currency} at {date} failed: {message}");
                        }
                        return Ok(None);
                    }
                    let market = format!("USD{currency}");
                    return Ok(data.quotes.get(&market).copied());
                }
                Err(e) => {
                    attempts += 1;
                    debug!("Fetching of fiat exchange rates failed. The server might be down. Retrying the connection.");
                    if attempts >= MAX_ATTEMPTS {
                        info!("Giving up after {} tries.", MAX_ATTEMPTS - 1);
                        return Err(TaxGraphError::runtime(format!(
                            "fiat rate fetch for {currency} at {date} failed after retries: {e}"
                        )));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_list_response_shape() {
        let payload = r#"{
            "success": true,
            "terms": "https://example.test/terms",
            "currencies": {
                "AED": "United Arab Emirates Dirham",
                "BTC": "Bitcoin",
                "EUR": "Euro",
                "USD": "United States Dollar"
            }
        }"#;
        let data: ListResponse = serde_json::from_str(payload).unwrap();
        assert!(data.success);
        let symbols: Vec<String> = data.currencies.into_keys().filter(|c| c != "BTC").collect();
        assert_eq!(symbols, vec!["AED", "EUR", "USD"]);
    }

    #[test]
    fn test_historical_response_shape() {
        let payload = r#"{
            "success": true,
            "historical": true,
            "date": "2020-04-04",
            "source": "USD",
            "quotes": { "USDEUR": 0.9223 }
        }"#;
        let data: HistoricalResponse = serde_json::from_str(payload).unwrap();
        assert!(data.success);
        assert_eq!(data.quotes.get("USDEUR"), Some(&dec!(0.9223)));
    }

    #[test]
    fn test_failed_response_carries_message() {
        let payload = r#"{ "success": false, "message": "invalid access key" }"#;
        let data: HistoricalResponse = serde_json::from_str(payload).unwrap();
        assert!(!data.success);
        assert!(data.quotes.is_empty());
        assert_eq!(data.message.as_deref(), Some("invalid access key"));
    }
}
