//! Transaction resolver
//!
//! An intra-account transfer shows up twice: once from the sending
//! source and once from the receiving one, each half-specified. The
//! resolver matches halves by `(asset, unique_id)`, merges them
//! field-by-field into one complete transaction, normalizes foreign fiat
//! fields to the native fiat, back-fills missing spot prices from the
//! pair converters, and applies user-provided transaction hints.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

use crate::converter::PairConverter;
use crate::error::{Result, TaxGraphError};
use crate::transaction::{
    AssetAndUniqueId, Direction, InTransaction, IntraTransaction, OutTransaction, Transaction,
    TransactionHeader, TransactionHint,
};
use crate::types::{MaybeUnknown, PriceSource};

const RESOLVER_PLUGIN: &str = "resolver";

/// Resolves a batch of half-specified transactions against a chain of
/// pair converters (tried in order for every price lookup).
pub struct TransactionResolver<'a> {
    converters: &'a mut [PairConverter],
    native_fiat: String,
    read_spot_price_from_web: bool,
    hints: HashMap<String, TransactionHint>,
}

impl<'a> TransactionResolver<'a> {
    pub fn new(converters: &'a mut [PairConverter], native_fiat: &str) -> Self {
        TransactionResolver {
            converters,
            native_fiat: native_fiat.to_string(),
            read_spot_price_from_web: false,
            hints: HashMap::new(),
        }
    }

    /// Fetch spot prices from the converters when a source reported none
    /// (or reported zero, the sub-cent fiat rounding case).
    pub fn with_spot_price_from_web(mut self, enabled: bool) -> Self {
        self.read_spot_price_from_web = enabled;
        self
    }

    pub fn with_hints(mut self, hints: HashMap<String, TransactionHint>) -> Self {
        self.hints = hints;
        self
    }

    /// Resolve the batch. Converter caches are persisted whether the
    /// batch completes or fails partway.
    pub async fn resolve(&mut self, transactions: Vec<Transaction>) -> Result<Vec<Transaction>> {
        let result = self.resolve_inner(transactions).await;
        self.save_caches();
        result
    }

    /// Like [`resolve`](Self::resolve), but a Ctrl-C saves the converter
    /// caches before the interrupt propagates.
    pub async fn resolve_guarded(&mut self, transactions: Vec<Transaction>) -> Result<Vec<Transaction>> {
        let outcome = tokio::select! {
            result = self.resolve_inner(transactions) => Some(result),
            _ = tokio::signal::ctrl_c() => None,
        };
        self.save_caches();
        match outcome {
            Some(result) => result,
            None => {
                info!("Exiting and saving to cache.");
                Err(TaxGraphError::Interrupted)
            }
        }
    }

    fn save_caches(&self) {
        for converter in self.converters.iter() {
            converter.save_historical_price_cache();
        }
    }

    async fn resolve_inner(&mut self, transactions: Vec<Transaction>) -> Result<Vec<Transaction>> {
        let mut resolved: Vec<Transaction> = Vec::new();
        let mut group_order: Vec<AssetAndUniqueId> = Vec::new();
        let mut groups: HashMap<AssetAndUniqueId, Vec<Transaction>> = HashMap::new();

        for mut transaction in transactions {
            // Foreign exchanges may report amounts in a non-native fiat.
            let fiat_ticker = transaction.header().fiat_ticker.clone();
            if let Some(fiat_ticker) = fiat_ticker {
                if fiat_ticker != self.native_fiat {
                    transaction = self.convert_fiat_fields_to_native_fiat(transaction).await?;
                }
            }

            match transaction.unique_id().clone() {
                MaybeUnknown::Unknown => {
                    // Cannot be matched to a counterpart without an id.
                    if self.read_spot_price_from_web {
                        transaction = self.update_spot_price_from_web(transaction).await?;
                    }
                    debug!("Unresolvable transaction (no unique id): {transaction:?}");
                    resolved.push(transaction);
                }
                MaybeUnknown::Known(unique_id) => {
                    let key = AssetAndUniqueId {
                        asset: transaction.asset().to_string(),
                        unique_id,
                    };
                    if !groups.contains_key(&key) {
                        group_order.push(key.clone());
                    }
                    groups.entry(key).or_default().push(transaction);
                }
            }
        }

        for key in group_order {
            let mut group = groups.remove(&key).expect("grouped above");
            match group.len() {
                1 => {
                    let mut transaction = self.apply_transaction_hint(group.pop().expect("len checked"))?;
                    if self.read_spot_price_from_web {
                        transaction = self.update_spot_price_from_web(transaction).await?;
                    }
                    debug!("Self-contained transaction: {transaction:?}");
                    resolved.push(transaction);
                }
                2 => {
                    let second = group.pop().expect("len checked");
                    let first = group.pop().expect("len checked");
                    let merged = merge_pair(first, second)?;
                    let mut transaction = Transaction::Intra(merged);
                    if self.read_spot_price_from_web {
                        transaction = self.update_spot_price_from_web(transaction).await?;
                    }
                    debug!("Resolved transaction: {transaction:?}");
                    resolved.push(transaction);
                }
                count => {
                    return Err(TaxGraphError::runtime(format!(
                        "attempting to resolve more than two transactions with the same unique id: \
                         {key:?} has {count}"
                    )));
                }
            }
        }

        Ok(resolved)
    }

    // First converter (in configuration order) that knows a rate wins;
    // a zero rate is kept only if no later converter knows better.
    async fn pair_conversion_rate(
        &mut self,
        timestamp: chrono::DateTime<chrono::Utc>,
        from_asset: &str,
        to_asset: &str,
        exchange: &str,
    ) -> Result<Option<(Decimal, &'static str, PriceSource)>> {
        let mut chosen: Option<(Decimal, &'static str, PriceSource)> = None;
        for converter in self.converters.iter_mut() {
            if let Some(rate) = converter
                .get_conversion_rate(timestamp, from_asset, to_asset, exchange)
                .await?
            {
                let details = (rate, converter.name(), converter.historical_price_type());
                chosen = Some(details);
                if !rate.is_zero() {
                    break;
                }
            }
        }
        Ok(chosen)
    }

    async fn convert_fiat_fields_to_native_fiat(&mut self, transaction: Transaction) -> Result<Transaction> {
        let from_fiat = transaction
            .header()
            .fiat_ticker
            .clone()
            .unwrap_or_else(|| self.native_fiat.clone());
        let to_fiat = self.native_fiat.clone();
        if from_fiat == to_fiat {
            return Ok(transaction);
        }

        let (rate, converter_name, _) = self
            .pair_conversion_rate(
                transaction.timestamp(),
                &from_fiat,
                &to_fiat,
                &transaction.originating_exchange(),
            )
            .await?
            .ok_or_else(|| {
                TaxGraphError::runtime(format!(
                    "conversion rate for {}:{from_fiat}->{to_fiat} not found on any pair converter",
                    transaction.timestamp()
                ))
            })?;

        let mut transaction = transaction;
        match &mut transaction {
            Transaction::In(t) => {
                scale(&mut t.spot_price, rate);
                scale_optional(&mut t.fiat_in_no_fee, rate);
                scale_optional(&mut t.fiat_in_with_fee, rate);
                scale_optional(&mut t.fiat_fee, rate);
            }
            Transaction::Out(t) => {
                scale(&mut t.spot_price, rate);
                scale_optional(&mut t.fiat_out_no_fee, rate);
                scale_optional(&mut t.fiat_fee, rate);
            }
            Transaction::Intra(t) => {
                scale(&mut t.spot_price, rate);
            }
        }

        let header = transaction.header_mut();
        header.notes = Some(format!(
            "Fiat conversion {from_fiat}->{to_fiat} using {converter_name} plugin; {}",
            header.notes.as_deref().unwrap_or("")
        ));
        header.fiat_ticker = Some(to_fiat);
        Ok(transaction)
    }

    // Exchanges report the fiat amount of a sub-cent trade as zero, which
    // makes the derived spot price zero as well; downstream tax engines
    // require spot_price > 0, so a zero is treated the same as unknown.
    async fn update_spot_price_from_web(&mut self, transaction: Transaction) -> Result<Transaction> {
        let needs_price = match transaction.spot_price() {
            MaybeUnknown::Unknown => true,
            MaybeUnknown::Known(price) => price.is_zero(),
        };
        if !needs_price {
            return Ok(transaction);
        }

        let native_fiat = self.native_fiat.clone();
        let (rate, converter_name, price_type) = self
            .pair_conversion_rate(
                transaction.timestamp(),
                transaction.asset(),
                &native_fiat,
                &transaction.originating_exchange(),
            )
            .await?
            .ok_or_else(|| {
                TaxGraphError::runtime(format!(
                    "spot price for {}:{}:{}->{native_fiat} not found on any pair converter",
                    transaction.unique_id(),
                    transaction.timestamp(),
                    transaction.asset()
                ))
            })?;

        let mut transaction = transaction;
        transaction.set_spot_price(MaybeUnknown::Known(rate));
        let header = transaction.header_mut();
        header.notes = Some(format!(
            "{price_type} spot_price read from {converter_name} plugin; {}",
            header.notes.as_deref().unwrap_or("")
        ));
        header.is_spot_price_from_web = true;
        Ok(transaction)
    }

    // Apply a user hint, possibly transmuting the direction. Impossible
    // conversions (an out-transaction into an in-transaction and vice
    // versa) are rejected.
    fn apply_transaction_hint(&self, transaction: Transaction) -> Result<Transaction> {
        let unique_id = match transaction.unique_id() {
            MaybeUnknown::Known(id) => id.clone(),
            MaybeUnknown::Unknown => return Ok(transaction),
        };
        let hint = match self.hints.get(&unique_id) {
            Some(hint) => hint.clone(),
            None => return Ok(transaction),
        };
        if !hint.transaction_type.is_valid_for(hint.direction) {
            return Err(TaxGraphError::value(format!(
                "hinted transaction type {} is invalid for direction {}",
                hint.transaction_type, hint.direction
            )));
        }
        let notes = format!(
            "{}; {}",
            hint.notes,
            transaction.header().notes.as_deref().unwrap_or("")
        );

        let result = match (hint.direction, transaction) {
            (Direction::In, Transaction::In(mut t)) => {
                t.header.raw_data = format!("in->in: {}", t.header.raw_data);
                t.header.notes = Some(notes);
                t.transaction_type = hint.transaction_type;
                t.validate()?;
                Transaction::In(t)
            }
            (Direction::In, Transaction::Out(t)) => {
                return Err(TaxGraphError::value(format!(
                    "cannot change an out-transaction to an in-transaction: {t:?}"
                )));
            }
            (Direction::In, Transaction::Intra(t)) => {
                if !t.from_holder.is_unknown() || !t.from_exchange.is_unknown() {
                    return Err(TaxGraphError::value(format!(
                        "invalid conversion intra->in: from_holder/from_exchange must be unknown: {t:?}"
                    )));
                }
                let exchange = t
                    .to_exchange
                    .known()
                    .cloned()
                    .ok_or_else(|| TaxGraphError::value("intra->in conversion requires a known to_exchange"))?;
                let holder = t
                    .to_holder
                    .known()
                    .cloned()
                    .ok_or_else(|| TaxGraphError::value("intra->in conversion requires a known to_holder"))?;
                let crypto_in = t
                    .crypto_received
                    .known()
                    .copied()
                    .ok_or_else(|| TaxGraphError::value("intra->in conversion requires a known crypto_received"))?;
                let mut header = t.header;
                header.raw_data = format!("intra->in: {}", header.raw_data);
                header.notes = Some(notes);
                let converted = InTransaction {
                    header,
                    exchange,
                    holder,
                    transaction_type: hint.transaction_type,
                    spot_price: t.spot_price,
                    crypto_in,
                    crypto_fee: None,
                    fiat_in_no_fee: None,
                    fiat_in_with_fee: None,
                    fiat_fee: None,
                };
                converted.validate()?;
                Transaction::In(converted)
            }
            (Direction::Out, Transaction::In(t)) => {
                return Err(TaxGraphError::value(format!(
                    "cannot change an in-transaction to an out-transaction: {t:?}"
                )));
            }
            (Direction::Out, Transaction::Out(mut t)) => {
                t.header.raw_data = format!("out->out: {}", t.header.raw_data);
                t.header.notes = Some(notes);
                t.transaction_type = hint.transaction_type;
                t.validate()?;
                Transaction::Out(t)
            }
            (Direction::Out, Transaction::Intra(t)) => {
                if !t.to_holder.is_unknown() || !t.to_exchange.is_unknown() {
                    return Err(TaxGraphError::value(format!(
                        "invalid conversion intra->out: to_holder/to_exchange must be unknown: {t:?}"
                    )));
                }
                let exchange = t
                    .from_exchange
                    .known()
                    .cloned()
                    .ok_or_else(|| TaxGraphError::value("intra->out conversion requires a known from_exchange"))?;
                let holder = t
                    .from_holder
                    .known()
                    .cloned()
                    .ok_or_else(|| TaxGraphError::value("intra->out conversion requires a known from_holder"))?;
                let crypto_sent = t
                    .crypto_sent
                    .known()
                    .copied()
                    .ok_or_else(|| TaxGraphError::value("intra->out conversion requires a known crypto_sent"))?;
                let (crypto_out_no_fee, crypto_fee) = match t.crypto_received.known() {
                    Some(&received) => (received, crypto_sent - received),
                    None => (crypto_sent, Decimal::ZERO),
                };
                let mut header = t.header;
                header.raw_data = format!("intra->out: {}", header.raw_data);
                header.notes = Some(notes);
                let converted = OutTransaction {
                    header,
                    exchange,
                    holder,
                    transaction_type: hint.transaction_type,
                    spot_price: t.spot_price,
                    crypto_out_no_fee: MaybeUnknown::Known(crypto_out_no_fee),
                    crypto_fee: MaybeUnknown::Known(crypto_fee),
                    crypto_out_with_fee: None,
                    fiat_out_no_fee: None,
                    fiat_fee: None,
                };
                converted.validate()?;
                Transaction::Out(converted)
            }
            (Direction::Intra, Transaction::In(t)) => {
                let mut header = t.header;
                header.raw_data = format!("in->intra: {}", header.raw_data);
                header.notes = Some(notes);
                Transaction::Intra(IntraTransaction {
                    header,
                    from_exchange: MaybeUnknown::Unknown,
                    from_holder: MaybeUnknown::Unknown,
                    to_exchange: MaybeUnknown::Known(t.exchange),
                    to_holder: MaybeUnknown::Known(t.holder),
                    spot_price: t.spot_price,
                    crypto_sent: MaybeUnknown::Unknown,
                    crypto_received: MaybeUnknown::Known(t.crypto_in),
                })
            }
            (Direction::Intra, Transaction::Out(t)) => {
                let no_fee = t.crypto_out_no_fee.known().copied();
                let fee = t.crypto_fee.known().copied();
                let (no_fee, fee) = match (no_fee, fee) {
                    (Some(no_fee), Some(fee)) => (no_fee, fee),
                    _ => {
                        return Err(TaxGraphError::value(format!(
                            "invalid conversion out->intra: crypto_out_no_fee/crypto_fee cannot be \
                             unknown: {t:?}"
                        )));
                    }
                };
                let mut header = t.header;
                header.raw_data = format!("out->intra: {}", header.raw_data);
                header.notes = Some(notes);
                Transaction::Intra(IntraTransaction {
                    header,
                    from_exchange: MaybeUnknown::Known(t.exchange),
                    from_holder: MaybeUnknown::Known(t.holder),
                    to_exchange: MaybeUnknown::Unknown,
                    to_holder: MaybeUnknown::Unknown,
                    spot_price: t.spot_price,
                    crypto_sent: MaybeUnknown::Known(no_fee + fee),
                    crypto_received: MaybeUnknown::Unknown,
                })
            }
            (Direction::Intra, Transaction::Intra(mut t)) => {
                t.header.raw_data = format!("intra->intra: {}", t.header.raw_data);
                t.header.notes = Some(notes);
                Transaction::Intra(t)
            }
        };
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Pair merging
// ---------------------------------------------------------------------------

fn scale(value: &mut MaybeUnknown<Decimal>, rate: Decimal) {
    if let MaybeUnknown::Known(amount) = value {
        *value = MaybeUnknown::Known(*amount * rate);
    }
}

fn scale_optional(value: &mut Option<Decimal>, rate: Decimal) {
    if let Some(amount) = value {
        *amount *= rate;
    }
}

fn merge_pair(first: Transaction, second: Transaction) -> Result<IntraTransaction> {
    match (first, second) {
        (Transaction::In(in_t), Transaction::Out(out_t)) => resolve_in_out(in_t, out_t),
        (Transaction::Out(out_t), Transaction::In(in_t)) => resolve_in_out(in_t, out_t),
        (Transaction::Intra(t1), Transaction::Intra(t2)) => resolve_intra_intra(t1, t2),
        (first, second) => Err(TaxGraphError::runtime(format!(
            "attempting to resolve two transactions that aren't intra/intra, in/out or out/in:\n\
             {first:?}\n{second:?}"
        ))),
    }
}

// Merge one field from the two halves: a known value beats unknown, two
// known values must agree (unless `prefer_first_on_conflict`, the
// web-price tie-break), and two unknowns stay unknown where allowed.
fn resolve_values<T: Clone + PartialEq + fmt::Debug>(
    name: &str,
    value1: &MaybeUnknown<T>,
    value2: &MaybeUnknown<T>,
    disallow_two_unknown: bool,
    prefer_first_on_conflict: bool,
) -> Result<MaybeUnknown<T>> {
    match (value1, value2) {
        (MaybeUnknown::Unknown, MaybeUnknown::Unknown) => {
            if disallow_two_unknown {
                Err(TaxGraphError::runtime(format!("{name} is unknown on both halves of the pair")))
            } else {
                Ok(MaybeUnknown::Unknown)
            }
        }
        (MaybeUnknown::Known(v), MaybeUnknown::Unknown) => Ok(MaybeUnknown::Known(v.clone())),
        (MaybeUnknown::Unknown, MaybeUnknown::Known(v)) => Ok(MaybeUnknown::Known(v.clone())),
        (MaybeUnknown::Known(v1), MaybeUnknown::Known(v2)) => {
            if v1 == v2 || prefer_first_on_conflict {
                Ok(MaybeUnknown::Known(v1.clone()))
            } else {
                Err(TaxGraphError::runtime(format!(
                    "{name} has different values on the two halves of the pair: {v1:?} != {v2:?}"
                )))
            }
        }
    }
}

// Spot-price merge with the web tie-break: a price read from the web
// loses to one reported by a source.
fn resolve_spot_price(
    spot1: &MaybeUnknown<Decimal>,
    from_web1: bool,
    spot2: &MaybeUnknown<Decimal>,
    from_web2: bool,
) -> Result<MaybeUnknown<Decimal>> {
    if from_web1 {
        resolve_values("spot_price", spot2, spot1, false, true)
    } else if from_web2 {
        resolve_values("spot_price", spot1, spot2, false, true)
    } else {
        resolve_values("spot_price", spot1, spot2, false, false)
    }
}

fn merged_notes(notes1: Option<&str>, notes2: Option<&str>) -> Option<String> {
    let mut notes = String::new();
    if let Some(n1) = notes1 {
        if !n1.is_empty() {
            notes.push_str(n1);
            notes.push_str("; ");
        }
    }
    if notes1 != notes2 {
        if let Some(n2) = notes2 {
            if !n2.is_empty() {
                notes.push_str(n2);
                notes.push_str("; ");
            }
        }
    }
    if notes.is_empty() {
        None
    } else {
        Some(notes)
    }
}

fn resolve_intra_intra(t1: IntraTransaction, t2: IntraTransaction) -> Result<IntraTransaction> {
    let timestamp = t1.header.timestamp.max(t2.header.timestamp);
    let from_exchange = resolve_values("from_exchange", &t1.from_exchange, &t2.from_exchange, true, false)?;
    let from_holder = resolve_values("from_holder", &t1.from_holder, &t2.from_holder, true, false)?;
    let to_exchange = resolve_values("to_exchange", &t1.to_exchange, &t2.to_exchange, true, false)?;
    let to_holder = resolve_values("to_holder", &t1.to_holder, &t2.to_holder, true, false)?;
    let spot_price = resolve_spot_price(
        &t1.spot_price,
        t1.header.is_spot_price_from_web,
        &t2.spot_price,
        t2.header.is_spot_price_from_web,
    )?;
    let crypto_sent = resolve_values("crypto_sent", &t1.crypto_sent, &t2.crypto_sent, true, false)?;
    let crypto_received =
        resolve_values("crypto_received", &t1.crypto_received, &t2.crypto_received, true, false)?;
    let notes = merged_notes(t1.header.notes.as_deref(), t2.header.notes.as_deref());

    let mut header = TransactionHeader::new(
        RESOLVER_PLUGIN,
        t1.header.unique_id.clone(),
        format!("{}\n{}", t1.header.raw_data, t2.header.raw_data),
        timestamp,
        t1.header.asset.clone(),
    );
    header.notes = notes;

    Ok(IntraTransaction {
        header,
        from_exchange,
        from_holder,
        to_exchange,
        to_holder,
        spot_price,
        crypto_sent,
        crypto_received,
    })
}

fn resolve_in_out(in_t: InTransaction, out_t: OutTransaction) -> Result<IntraTransaction> {
    let timestamp = in_t.header.timestamp.max(out_t.header.timestamp);
    let spot_price = resolve_spot_price(
        &out_t.spot_price,
        out_t.header.is_spot_price_from_web,
        &in_t.spot_price,
        in_t.header.is_spot_price_from_web,
    )?;

    let (no_fee, fee) = match (out_t.crypto_out_no_fee.known(), out_t.crypto_fee.known()) {
        (Some(&no_fee), Some(&fee)) => (no_fee, fee),
        _ => {
            return Err(TaxGraphError::value(format!(
                "cannot compute crypto_sent: crypto_out_no_fee/crypto_fee unknown on the out half: \
                 {out_t:?}"
            )));
        }
    };
    let crypto_sent = no_fee + fee;
    let crypto_received = in_t.crypto_in;
    let notes = merged_notes(in_t.header.notes.as_deref(), out_t.header.notes.as_deref());

    let mut header = TransactionHeader::new(
        RESOLVER_PLUGIN,
        in_t.header.unique_id.clone(),
        format!("{}\n{}", in_t.header.raw_data, out_t.header.raw_data),
        timestamp,
        in_t.header.asset.clone(),
    );
    header.notes = notes;

    Ok(IntraTransaction {
        header,
        from_exchange: MaybeUnknown::Known(out_t.exchange),
        from_holder: MaybeUnknown::Known(out_t.holder),
        to_exchange: MaybeUnknown::Known(in_t.exchange),
        to_holder: MaybeUnknown::Known(in_t.holder),
        spot_price,
        crypto_sent: MaybeUnknown::Known(crypto_sent),
        crypto_received: MaybeUnknown::Known(crypto_received),
    })
}
