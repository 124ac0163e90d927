//! Transaction model
//!
//! Sources emit half-specified transactions: an exchange knows it sent
//! coins somewhere, another knows it received them, and neither knows the
//! full picture. The model keeps that partiality explicit: a tagged
//! `Transaction` variant per direction, a shared header, and
//! `MaybeUnknown` fields wherever a source may legitimately not know a
//! value yet.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, TaxGraphError};
use crate::types::MaybeUnknown;

/// Grouping key for matching the two halves of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssetAndUniqueId {
    pub asset: String,
    pub unique_id: String,
}

/// Transfer direction relative to the account holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
    Intra,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "in"),
            Direction::Out => write!(f, "out"),
            Direction::Intra => write!(f, "intra"),
        }
    }
}

impl FromStr for Direction {
    type Err = TaxGraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            "intra" => Ok(Direction::Intra),
            other => Err(TaxGraphError::value(format!("invalid direction {other}"))),
        }
    }
}

/// Tax classification of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Airdrop,
    Buy,
    Donate,
    Fee,
    Gift,
    Hardfork,
    Income,
    Interest,
    Mining,
    Move,
    Sell,
    Staking,
    Wages,
}

impl TransactionType {
    /// Whether this type is legal for the given direction.
    pub fn is_valid_for(&self, direction: Direction) -> bool {
        use TransactionType::*;
        match direction {
            Direction::In => matches!(
                self,
                Airdrop | Buy | Donate | Gift | Hardfork | Income | Interest | Mining | Staking | Wages
            ),
            Direction::Out => matches!(self, Donate | Fee | Gift | Sell),
            Direction::Intra => matches!(self, Move),
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionType::Airdrop => "Airdrop",
            TransactionType::Buy => "Buy",
            TransactionType::Donate => "Donate",
            TransactionType::Fee => "Fee",
            TransactionType::Gift => "Gift",
            TransactionType::Hardfork => "Hardfork",
            TransactionType::Income => "Income",
            TransactionType::Interest => "Interest",
            TransactionType::Mining => "Mining",
            TransactionType::Move => "Move",
            TransactionType::Sell => "Sell",
            TransactionType::Staking => "Staking",
            TransactionType::Wages => "Wages",
        };
        write!(f, "{name}")
    }
}

impl FromStr for TransactionType {
    type Err = TaxGraphError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "airdrop" => Ok(TransactionType::Airdrop),
            "buy" => Ok(TransactionType::Buy),
            "donate" => Ok(TransactionType::Donate),
            "fee" => Ok(TransactionType::Fee),
            "gift" => Ok(TransactionType::Gift),
            "hardfork" => Ok(TransactionType::Hardfork),
            "income" => Ok(TransactionType::Income),
            "interest" => Ok(TransactionType::Interest),
            "mining" => Ok(TransactionType::Mining),
            "move" => Ok(TransactionType::Move),
            "sell" => Ok(TransactionType::Sell),
            "staking" => Ok(TransactionType::Staking),
            "wages" => Ok(TransactionType::Wages),
            other => Err(TaxGraphError::value(format!("invalid transaction type {other}"))),
        }
    }
}

/// User-supplied override for a transaction the source got wrong or could
/// not classify, keyed by unique id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionHint {
    pub direction: Direction,
    pub transaction_type: TransactionType,
    pub notes: String,
}

/// Fields common to every transaction direction.
///
/// `unique_id` carries the on-chain hash (or an account-specific id) that
/// lets the resolver match the two halves of a transfer; some sources
/// cannot provide one, so unknown is allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionHeader {
    pub plugin: String,
    pub unique_id: MaybeUnknown<String>,
    pub raw_data: String,
    pub timestamp: DateTime<Utc>,
    pub asset: String,
    pub notes: Option<String>,
    pub is_spot_price_from_web: bool,
    /// Fiat the monetary fields are denominated in; `None` means the
    /// native fiat.
    pub fiat_ticker: Option<String>,
}

impl TransactionHeader {
    pub fn new(
        plugin: impl Into<String>,
        unique_id: MaybeUnknown<String>,
        raw_data: impl Into<String>,
        timestamp: DateTime<Utc>,
        asset: impl Into<String>,
    ) -> Self {
        let mut unique_id = unique_id;
        // Chain hashes arrive with or without the 0x prefix depending on
        // the source; strip it so both halves of a transfer match.
        if let MaybeUnknown::Known(id) = &unique_id {
            if let Some(stripped) = id.strip_prefix("0x") {
                unique_id = MaybeUnknown::Known(stripped.to_string());
            }
        }
        TransactionHeader {
            plugin: plugin.into(),
            unique_id,
            raw_data: raw_data.into(),
            timestamp,
            asset: asset.into(),
            notes: None,
            is_spot_price_from_web: false,
            fiat_ticker: None,
        }
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_fiat_ticker(mut self, fiat_ticker: impl Into<String>) -> Self {
        self.fiat_ticker = Some(fiat_ticker.into());
        self
    }
}

/// Acquisition: crypto entering the holder's account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InTransaction {
    pub header: TransactionHeader,
    pub exchange: String,
    pub holder: String,
    pub transaction_type: TransactionType,
    pub spot_price: MaybeUnknown<Decimal>,
    pub crypto_in: Decimal,
    pub crypto_fee: Option<Decimal>,
    pub fiat_in_no_fee: Option<Decimal>,
    pub fiat_in_with_fee: Option<Decimal>,
    pub fiat_fee: Option<Decimal>,
}

impl InTransaction {
    pub fn validate(&self) -> Result<()> {
        if !self.transaction_type.is_valid_for(Direction::In) {
            return Err(TaxGraphError::value(format!(
                "invalid transaction type {} for an in-transaction",
                self.transaction_type
            )));
        }
        if self.crypto_fee.is_some() && self.fiat_fee.is_some() {
            return Err(TaxGraphError::value(format!(
                "both crypto_fee and fiat_fee are defined, instead of only one: {:?} and {:?}",
                self.crypto_fee, self.fiat_fee
            )));
        }
        Ok(())
    }
}

/// Disposal: crypto leaving the holder's account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutTransaction {
    pub header: TransactionHeader,
    pub exchange: String,
    pub holder: String,
    pub transaction_type: TransactionType,
    pub spot_price: MaybeUnknown<Decimal>,
    pub crypto_out_no_fee: MaybeUnknown<Decimal>,
    pub crypto_fee: MaybeUnknown<Decimal>,
    pub crypto_out_with_fee: Option<Decimal>,
    pub fiat_out_no_fee: Option<Decimal>,
    pub fiat_fee: Option<Decimal>,
}

impl OutTransaction {
    pub fn validate(&self) -> Result<()> {
        if !self.transaction_type.is_valid_for(Direction::Out) {
            return Err(TaxGraphError::value(format!(
                "invalid transaction type {} for an out-transaction",
                self.transaction_type
            )));
        }
        Ok(())
    }
}

/// Transfer between the holder's own accounts. Either side may be unknown
/// until the matching half is resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntraTransaction {
    pub header: TransactionHeader,
    pub from_exchange: MaybeUnknown<String>,
    pub from_holder: MaybeUnknown<String>,
    pub to_exchange: MaybeUnknown<String>,
    pub to_holder: MaybeUnknown<String>,
    pub spot_price: MaybeUnknown<Decimal>,
    pub crypto_sent: MaybeUnknown<Decimal>,
    pub crypto_received: MaybeUnknown<Decimal>,
}

/// A transaction of any direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Transaction {
    In(InTransaction),
    Out(OutTransaction),
    Intra(IntraTransaction),
}

impl Transaction {
    pub fn header(&self) -> &TransactionHeader {
        match self {
            Transaction::In(t) => &t.header,
            Transaction::Out(t) => &t.header,
            Transaction::Intra(t) => &t.header,
        }
    }

    pub fn header_mut(&mut self) -> &mut TransactionHeader {
        match self {
            Transaction::In(t) => &mut t.header,
            Transaction::Out(t) => &mut t.header,
            Transaction::Intra(t) => &mut t.header,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Transaction::In(_) => Direction::In,
            Transaction::Out(_) => Direction::Out,
            Transaction::Intra(_) => Direction::Intra,
        }
    }

    pub fn asset(&self) -> &str {
        &self.header().asset
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.header().timestamp
    }

    pub fn unique_id(&self) -> &MaybeUnknown<String> {
        &self.header().unique_id
    }

    pub fn spot_price(&self) -> &MaybeUnknown<Decimal> {
        match self {
            Transaction::In(t) => &t.spot_price,
            Transaction::Out(t) => &t.spot_price,
            Transaction::Intra(t) => &t.spot_price,
        }
    }

    pub fn set_spot_price(&mut self, spot_price: MaybeUnknown<Decimal>) {
        match self {
            Transaction::In(t) => t.spot_price = spot_price,
            Transaction::Out(t) => t.spot_price = spot_price,
            Transaction::Intra(t) => t.spot_price = spot_price,
        }
    }

    /// The exchange a price lookup should be hinted with: where the
    /// transaction originated.
    pub fn originating_exchange(&self) -> String {
        match self {
            Transaction::In(t) => t.exchange.clone(),
            Transaction::Out(t) => t.exchange.clone(),
            Transaction::Intra(t) => t.from_exchange.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn header(unique_id: &str) -> TransactionHeader {
        TransactionHeader::new(
            "test-plugin",
            MaybeUnknown::Known(unique_id.to_string()),
            "raw",
            Utc.with_ymd_and_hms(2021, 3, 1, 10, 0, 0).unwrap(),
            "ETH",
        )
    }

    #[test]
    fn test_unique_id_strips_hex_prefix() {
        let h = header("0xabc123");
        assert_eq!(h.unique_id, MaybeUnknown::Known("abc123".to_string()));
        let h = header("abc123");
        assert_eq!(h.unique_id, MaybeUnknown::Known("abc123".to_string()));
    }

    #[test]
    fn test_transaction_type_direction_validity() {
        assert!(TransactionType::Buy.is_valid_for(Direction::In));
        assert!(!TransactionType::Buy.is_valid_for(Direction::Out));
        assert!(TransactionType::Sell.is_valid_for(Direction::Out));
        assert!(TransactionType::Move.is_valid_for(Direction::Intra));
        assert!(!TransactionType::Move.is_valid_for(Direction::In));
        assert!(TransactionType::Gift.is_valid_for(Direction::In));
        assert!(TransactionType::Gift.is_valid_for(Direction::Out));
    }

    #[test]
    fn test_in_transaction_rejects_double_fee() {
        let tx = InTransaction {
            header: header("id1"),
            exchange: "Coinbase".to_string(),
            holder: "alice".to_string(),
            transaction_type: TransactionType::Buy,
            spot_price: dec!(2000).into(),
            crypto_in: dec!(1.0),
            crypto_fee: Some(dec!(0.01)),
            fiat_in_no_fee: None,
            fiat_in_with_fee: None,
            fiat_fee: Some(dec!(5)),
        };
        assert!(tx.validate().is_err());
    }

    #[test]
    fn test_type_parsing_round_trip() {
        assert_eq!("buy".parse::<TransactionType>().unwrap(), TransactionType::Buy);
        assert_eq!("Staking".parse::<TransactionType>().unwrap(), TransactionType::Staking);
        assert!("teleport".parse::<TransactionType>().is_err());
        assert_eq!("intra".parse::<Direction>().unwrap(), Direction::Intra);
    }
}
