//! Graph construction and the snapshot optimization pipeline
//!
//! An exchange graph is built in two passes. The unoptimized graph seeds
//! edge weights from the quote-priority table; it knows which markets
//! exist but nothing about when they opened or how liquid they are. The
//! optimization pass fetches each candidate market's full weekly history,
//! converts volumes to per-week rank weights, and materializes a pruned
//! graph snapshot per week into the exchange's AVL tree.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

use super::{
    PairConverter, ALTERNATIVE_MARKET_WEIGHT, ALT_MARKET_BY_BASE, ALT_MARKET_EXCHANGES,
    MARKET_PADDING_IN_WEEKS, QUOTE_PRIORITY, STANDARD_WEIGHT,
};
use crate::error::{Result, TaxGraphError};
use crate::exchange::{Granularity, MarketKind};
use crate::fiat::FIAT_EXCHANGE;
use crate::graph::avl_tree::AvlTree;
use crate::graph::MappedGraph;
use crate::types::{HistoricalBar, SECONDS_IN_WEEK};

/// `asset -> neighbor -> weight` for one snapshot window.
pub(crate) type OptimizationTable = HashMap<String, HashMap<String, f64>>;

/// Snapshot tables keyed by their window start.
pub(crate) type Optimizations = BTreeMap<DateTime<Utc>, OptimizationTable>;

// Sentinel weight for a market that has not opened yet at a given week;
// cloning prunes these edges.
const NOT_YET_LIVE: f64 = -1.0;

impl PairConverter {
    /// Build the snapshot tree for `exchange`. Runs once per exchange;
    /// running it again is an internal error.
    pub(crate) async fn cache_graph_snapshots(&mut self, exchange: &str) -> Result<()> {
        if self.graph_trees.contains_key(exchange) {
            return Err(TaxGraphError::value(format!(
                "graph snapshots for exchange {exchange} have already been generated; optimization \
                 can only be performed once"
            )));
        }
        let manifest = self.manifest.clone().ok_or_else(|| {
            TaxGraphError::value("no manifest provided for the pair converter; unable to optimize the graph")
        })?;

        let unoptimized = self.generate_unoptimized_graph(exchange).await?;
        let optimizations = self
            .optimize_assets_for_exchange(
                &unoptimized,
                manifest.first_transaction,
                &manifest.assets,
                exchange,
            )
            .await?;
        debug!("Optimizations created for graph: {optimizations:?}");

        let mut tree: AvlTree<DateTime<Utc>, MappedGraph> = AvlTree::new();
        let first_window = optimizations.values().next().cloned().unwrap_or_default();
        let pruned = unoptimized.prune_graph(&first_window);
        for (timestamp, optimization) in &optimizations {
            let snapshot = match tree.find_max_value_less_than(timestamp) {
                Some(previous) => previous.clone_with_optimization(optimization),
                None => pruned.clone_with_optimization(optimization),
            };
            tree.insert(*timestamp, snapshot);
            debug!("Added graph snapshot for {exchange} for timestamp: {timestamp}");
        }

        self.graph_trees.insert(exchange.to_string(), tree);
        Ok(())
    }

    // The seed graph: alias edges, the exchange's spot markets weighted by
    // quote priority, alternative markets from the hard-coded table, and
    // fiat-to-fiat edges through the fiat pseudo-exchange.
    pub(crate) async fn generate_unoptimized_graph(&mut self, exchange: &str) -> Result<MappedGraph> {
        let pricing_exchange = self.pricing_exchange_for(exchange)?;

        let client = match self.exchanges.get(exchange) {
            Some(client) => client.clone(),
            None => {
                debug!("Trying to instantiate exchange client for {pricing_exchange}");
                self.factory.create(&pricing_exchange).ok_or_else(|| {
                    TaxGraphError::value(format!("no exchange client available for {pricing_exchange}"))
                })?
            }
        };

        let mut markets: HashMap<String, Vec<String>> = HashMap::new();
        debug!("Creating graph for {pricing_exchange}");
        let mut graph = MappedGraph::new(exchange, self.user_aliases.as_ref());

        let alias_pairs: Vec<(String, String)> = graph
            .aliases()
            .map(|alias| (alias.from_asset.clone(), alias.to_asset.clone()))
            .collect();
        for (from, to) in alias_pairs {
            markets.insert(format!("{from}{to}"), vec![exchange.to_string()]);
        }

        let fetched = client.fetch_markets().await.map_err(|e| {
            TaxGraphError::runtime(format!("failed to fetch markets from {pricing_exchange}: {e}"))
        })?;
        for market in fetched {
            if market.kind != MarketKind::Spot {
                continue;
            }
            let weight = match QUOTE_PRIORITY.get(market.quote.as_str()) {
                Some(&weight) => weight,
                None => continue,
            };
            debug!("Market: {market:?}");
            markets.insert(format!("{}{}", market.base, market.quote), vec![exchange.to_string()]);
            graph.add_neighbor(&market.base, &market.quote, weight, false);
        }

        if !self.exchange_locked {
            debug!("Adding alternative markets to {exchange} graph.");
            self.add_alternative_markets(&mut graph, &mut markets);
        }
        self.add_fiat_edges_to_graph(&mut graph, &mut markets);
        debug!("Created unoptimized graph for {exchange}");

        self.exchanges.insert(exchange.to_string(), client);
        self.exchange_markets.insert(exchange.to_string(), markets);
        Ok(graph)
    }

    // Overlay markets from exchanges that carry pairs the pricing exchange
    // does not; clients are cached so hop pricing can reach them later.
    fn add_alternative_markets(&mut self, graph: &mut MappedGraph, markets: &mut HashMap<String, Vec<String>>) {
        for &(base_asset, quote_asset) in ALT_MARKET_BY_BASE.iter() {
            let alt_market = format!("{base_asset}{quote_asset}");
            let alt_exchange = match ALT_MARKET_EXCHANGES.get(alt_market.as_str()) {
                Some(&exchange) => exchange,
                None => continue,
            };
            markets.insert(alt_market.clone(), vec![alt_exchange.to_string()]);

            if !self.exchanges.contains_key(alt_exchange) {
                match self.factory.create(alt_exchange) {
                    Some(client) => {
                        debug!("Added Alternative Exchange: {alt_exchange}");
                        self.exchanges.insert(alt_exchange.to_string(), client);
                    }
                    None => {
                        warn!("No client available for alternative exchange {alt_exchange}; skipping {alt_market}");
                        continue;
                    }
                }
            }

            if !self.untradeable_assets.contains(base_asset) {
                debug!("Added {base_asset}:{quote_asset} to graph.");
                graph.add_neighbor(base_asset, quote_asset, ALTERNATIVE_MARKET_WEIGHT, false);
            }
        }
    }

    // Every fiat vertex already in the graph gets an edge to every other
    // fiat, weighted by the source fiat's priority. No fiat vertex is
    // created here: that would allow a double hop through fiat
    // (e.g. USD -> KRW -> JPY).
    fn add_fiat_edges_to_graph(&mut self, graph: &mut MappedGraph, markets: &mut HashMap<String, Vec<String>>) {
        let fiat_list = self.fiat_list.clone();
        for fiat in &fiat_list {
            let to_fiat_list: Vec<&String> = fiat_list.iter().filter(|other| *other != fiat).collect();
            if graph.contains_vertex(fiat) {
                let weight = self.fiat_priority.get(fiat).copied().unwrap_or(STANDARD_WEIGHT);
                for to_fiat in &to_fiat_list {
                    graph.add_fiat_neighbor(fiat, to_fiat, weight, true);
                }
                debug!("Added to assets for {fiat}: {to_fiat_list:?}");
            }
            for to_fiat in &to_fiat_list {
                markets.insert(format!("{fiat}{to_fiat}"), vec![FIAT_EXCHANGE.to_string()]);
            }
        }
    }

    // Fetch weekly history for every unoptimized candidate market and turn
    // it into per-week rank-weight tables.
    async fn optimize_assets_for_exchange(
        &mut self,
        unoptimized_graph: &MappedGraph,
        start_date: DateTime<Utc>,
        assets: &BTreeSet<String>,
        exchange: &str,
    ) -> Result<Optimizations> {
        // Weekly candles can start on any weekday depending on the
        // exchange; pull a week early to make sure a full week is covered.
        let week_start_date = week_pull_start(start_date);

        // Candidates: the manifest's assets plus everything reachable from
        // them. Fiat assets are already optimized and stay out of the
        // fetch set.
        let mut optimization_candidates: HashSet<String> = HashSet::new();
        for asset in assets {
            if !unoptimized_graph.contains_vertex(asset) {
                // Some assets might not be available on this exchange.
                continue;
            }
            optimization_candidates.insert(asset.clone());
            let children = unoptimized_graph.get_all_children_of_vertex(asset);
            debug!("For vertex - {asset}, found all the children - {children:?}");
            optimization_candidates.extend(children);
        }

        debug!("Checking if any of the following candidates are optimized - {optimization_candidates:?}");
        let mut unoptimized_assets: Vec<String> = optimization_candidates
            .iter()
            .filter(|candidate| !unoptimized_graph.is_optimized(candidate))
            .cloned()
            .collect();
        unoptimized_assets.sort();
        debug!("Found unoptimized assets {unoptimized_assets:?}");

        let mut child_bars: HashMap<String, HashMap<String, Vec<HistoricalBar>>> = HashMap::new();
        let mut market_starts: HashMap<String, HashMap<String, DateTime<Utc>>> = HashMap::new();
        let mut optimizations: Optimizations = BTreeMap::new();
        optimizations.insert(week_start_date, OptimizationTable::new());

        // Alternative market correction: untradeable assets keep an empty
        // entry so the first window knows about them.
        for asset in &self.untradeable_assets {
            optimizations
                .get_mut(&week_start_date)
                .expect("first window present")
                .insert(asset.clone(), HashMap::new());
        }

        for child_name in &unoptimized_assets {
            child_bars.entry(child_name.clone()).or_default();
            market_starts.entry(child_name.clone()).or_default();

            for (neighbor, _) in unoptimized_graph.neighbors(child_name) {
                if !optimization_candidates.contains(&neighbor) {
                    continue;
                }
                let market_exchange = match self.exchange_markets[exchange]
                    .get(&format!("{child_name}{neighbor}"))
                {
                    Some(exchanges) => exchanges[0].clone(),
                    None => {
                        warn!("No market recorded for {child_name}{neighbor}; treating as unavailable.");
                        market_starts
                            .get_mut(child_name)
                            .expect("entry created above")
                            .insert(neighbor.clone(), far_future());
                        continue;
                    }
                };

                let bar_check = self
                    .find_historical_bars(child_name, &neighbor, week_start_date, &market_exchange, true, Granularity::OneWeek)
                    .await?;

                match bar_check {
                    Some(bars) if !bars.is_empty() => {
                        // Pad the first weeks so assets airdropped before
                        // their market opened still resolve; the timestamp
                        // mismatch warns the user at pricing time.
                        let mut padded = bars[0].clone();
                        padded.timestamp -= chrono::Duration::weeks(MARKET_PADDING_IN_WEEKS);
                        let mut all_bars = vec![padded];
                        all_bars.extend(bars);

                        let timestamp_diff = (all_bars[0].timestamp - start_date).num_seconds();
                        let market_start = if timestamp_diff > SECONDS_IN_WEEK as i64 {
                            all_bars[0].timestamp
                        } else {
                            week_start_date - chrono::Duration::weeks(1)
                        };
                        market_starts
                            .get_mut(child_name)
                            .expect("entry created above")
                            .insert(neighbor.clone(), market_start);
                        child_bars
                            .get_mut(child_name)
                            .expect("entry created above")
                            .insert(neighbor.clone(), all_bars);
                    }
                    _ => {
                        // Bogus market: the exchange is misreporting it or
                        // it has no data since the first transaction. A
                        // far-future start date deletes it from every
                        // snapshot.
                        market_starts
                            .get_mut(child_name)
                            .expect("entry created above")
                            .insert(neighbor.clone(), far_future());
                    }
                }
            }
        }

        // Checkpoint the bundles that were just fetched.
        self.save_historical_price_cache();

        // Per-timestamp volume tables, with the not-yet-live sentinel for
        // weeks before the market start.
        for (crypto_asset, neighbor_bars) in &child_bars {
            for (neighbor_asset, bars) in neighbor_bars {
                let market_start = market_starts[crypto_asset]
                    .get(neighbor_asset)
                    .copied()
                    .unwrap_or(start_date);
                for bar in bars {
                    let entry = optimizations
                        .entry(bar.timestamp)
                        .or_default()
                        .entry(crypto_asset.clone())
                        .or_default();
                    if bar.timestamp < market_start {
                        debug!("Optimization for {crypto_asset} to {neighbor_asset} at {} is -1.0", bar.timestamp);
                        entry.insert(neighbor_asset.clone(), NOT_YET_LIVE);
                    } else {
                        let volume = bar.volume.to_f64().unwrap_or(0.0);
                        debug!("Optimization for {crypto_asset} to {neighbor_asset} at {} is {volume}", bar.timestamp);
                        entry.insert(neighbor_asset.clone(), volume);
                    }
                }
            }
        }

        // Carry assets forward so later snapshots contain every edge known
        // from prior weeks.
        let mut composite: Optimizations = BTreeMap::new();
        let mut carried: Option<OptimizationTable> = None;
        for (timestamp, table) in &optimizations {
            let merged = match carried {
                None => table.clone(),
                Some(mut previous) => {
                    for (asset, neighbors) in table {
                        previous.insert(asset.clone(), neighbors.clone());
                    }
                    previous
                }
            };
            composite.insert(*timestamp, merged.clone());
            carried = Some(merged);
        }

        // Replace volumes with rank weights: each asset's neighbors sorted
        // by descending volume get weights 1.0, 2.0, ... Sentinels stay
        // negative. Identical successive snapshots collapse.
        let mut previous_assets: Option<OptimizationTable> = None;
        let mut timestamps_to_delete: Vec<DateTime<Utc>> = Vec::new();
        for (timestamp, snapshot_assets) in composite.iter_mut() {
            for neighbors in snapshot_assets.values_mut() {
                let mut ranked: Vec<(String, f64)> = neighbors.iter().map(|(k, &v)| (k.clone(), v)).collect();
                ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
                let mut weight = 1.0;
                for (neighbor_name, volume) in ranked {
                    if volume != NOT_YET_LIVE {
                        neighbors.insert(neighbor_name, weight);
                        weight += 1.0;
                    } else {
                        neighbors.insert(neighbor_name, NOT_YET_LIVE);
                    }
                }
            }
            if previous_assets.as_ref() == Some(&*snapshot_assets) {
                timestamps_to_delete.push(*timestamp);
            }
            previous_assets = Some(snapshot_assets.clone());
        }
        for timestamp in timestamps_to_delete {
            composite.remove(&timestamp);
        }

        Ok(composite)
    }
}

// The most recent day-before-Monday at or before `date`: weekly pulls
// start a day early so the first full exchange week is always covered.
fn week_pull_start(date: DateTime<Utc>) -> DateTime<Utc> {
    let days_behind = (i64::from(chrono::Datelike::weekday(&date).num_days_from_monday()) + 1) % 7;
    date - chrono::Duration::days(days_behind)
}

fn far_future() -> DateTime<Utc> {
    Utc::now() + chrono::Duration::days(36_500)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_week_pull_start() {
        // 2020-01-06 is a Monday; the pull starts the day before.
        let monday = Utc.with_ymd_and_hms(2020, 1, 6, 0, 0, 0).unwrap();
        assert_eq!(week_pull_start(monday), monday - chrono::Duration::days(1));
        // A Sunday is its own pull start.
        let sunday = Utc.with_ymd_and_hms(2020, 1, 5, 9, 30, 0).unwrap();
        assert_eq!(week_pull_start(sunday), sunday);
        // Time of day is preserved.
        let thursday = Utc.with_ymd_and_hms(2020, 1, 9, 12, 0, 0).unwrap();
        assert_eq!(week_pull_start(thursday), Utc.with_ymd_and_hms(2020, 1, 5, 12, 0, 0).unwrap());
    }
}
