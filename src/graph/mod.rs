//! Mapped graph of tradable markets
//!
//! Directed weighted graph with fast name lookup. Each vertex is an asset;
//! each edge is a market (or a fiat/alias pseudo-market) whose weight is an
//! abstract routing cost. Vertices live in an arena indexed by position and
//! edges reference neighbors by index, so the graph owns everything and
//! Dijkstra runs on plain indices.

pub mod avl_tree;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use crate::types::HistoricalBar;

/// Alias table key applicable to every exchange.
pub const UNIVERSAL_EXCHANGE: &str = "UNIVERSAL";

/// A symbol rename with a fixed numeric conversion factor
/// (e.g. 1 XBT = 1 BTC, 1 MBTC = 0.001 BTC).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Alias {
    pub from_asset: String,
    pub to_asset: String,
}

impl Alias {
    pub fn new(from_asset: impl Into<String>, to_asset: impl Into<String>) -> Self {
        Alias {
            from_asset: from_asset.into(),
            to_asset: to_asset.into(),
        }
    }
}

/// `(from, to) -> conversion factor`
pub type AliasTable = HashMap<Alias, Decimal>;

/// Alias tables keyed by exchange name, with [`UNIVERSAL_EXCHANGE`] as the
/// wildcard bucket.
pub type ExchangeAliases = HashMap<String, AliasTable>;

// Base aliases applied to every exchange graph.
static UNIVERSAL_ALIASES: Lazy<AliasTable> = Lazy::new(|| {
    HashMap::from([
        (Alias::new("LUNA", "LUNC"), Decimal::ONE),
        (Alias::new("XBT", "BTC"), Decimal::ONE),
    ])
});

// Exchange-specific renames layered on top of the universal table.
static EXCHANGE_SPECIFIC_ALIASES: Lazy<ExchangeAliases> = Lazy::new(|| {
    HashMap::from([
        (
            "Coinbase".to_string(),
            HashMap::from([(Alias::new("ETH2", "ETH"), Decimal::ONE)]),
        ),
        (
            "Coinbase Pro".to_string(),
            HashMap::from([(Alias::new("ETH2", "ETH"), Decimal::ONE)]),
        ),
        (
            "Pionex".to_string(),
            HashMap::from([
                (Alias::new("MBTC", "BTC"), Decimal::new(1, 3)),
                (Alias::new("METH", "ETH"), Decimal::new(1, 3)),
            ]),
        ),
    ])
});

#[derive(Debug, Clone)]
struct Vertex {
    name: String,
    // (neighbor index, edge weight), in insertion order
    neighbors: Vec<(usize, f64)>,
}

/// Named-vertex directed weighted graph with an alias table, a fiat-vertex
/// subset, and a per-vertex "optimized" marker (weights derived from real
/// volume data rather than seed heuristics).
#[derive(Debug, Clone)]
pub struct MappedGraph {
    exchange: String,
    vertexes: Vec<Vertex>,
    name_to_index: HashMap<String, usize>,
    optimized_assets: HashSet<String>,
    fiat_assets: HashSet<String>,
    aliases: AliasTable,
}

impl MappedGraph {
    /// Build an empty graph for `exchange`, installing the universal alias
    /// table, the exchange-specific table, and any user-configured aliases
    /// (universal bucket first, then the exchange bucket).
    pub fn new(exchange: &str, user_aliases: Option<&ExchangeAliases>) -> Self {
        let mut aliases = UNIVERSAL_ALIASES.clone();
        if let Some(table) = EXCHANGE_SPECIFIC_ALIASES.get(exchange) {
            aliases.extend(table.iter().map(|(a, f)| (a.clone(), *f)));
        }
        if let Some(user) = user_aliases {
            if let Some(table) = user.get(UNIVERSAL_EXCHANGE) {
                aliases.extend(table.iter().map(|(a, f)| (a.clone(), *f)));
            }
            if let Some(table) = user.get(exchange) {
                aliases.extend(table.iter().map(|(a, f)| (a.clone(), *f)));
            }
        }
        Self::with_state(exchange, HashSet::new(), HashSet::new(), aliases)
    }

    // Clone/prune constructor: state is carried over, alias edges are
    // re-installed so they exist even before any market edge does.
    fn with_state(
        exchange: &str,
        optimized_assets: HashSet<String>,
        fiat_assets: HashSet<String>,
        aliases: AliasTable,
    ) -> Self {
        let mut graph = MappedGraph {
            exchange: exchange.to_string(),
            vertexes: Vec::new(),
            name_to_index: HashMap::new(),
            optimized_assets,
            fiat_assets,
            aliases,
        };
        // Aliases are virtually the same asset: zero weight, automatically
        // optimized.
        let alias_pairs: Vec<Alias> = graph.aliases.keys().cloned().collect();
        for alias in alias_pairs {
            graph.add_neighbor(&alias.from_asset, &alias.to_asset, 0.0, true);
        }
        graph
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn aliases(&self) -> impl Iterator<Item = &Alias> {
        self.aliases.keys()
    }

    pub fn contains_vertex(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name)
    }

    pub fn vertex_names(&self) -> impl Iterator<Item = &str> {
        self.vertexes.iter().map(|v| v.name.as_str())
    }

    pub fn vertex_count(&self) -> usize {
        self.vertexes.len()
    }

    /// Idempotent vertex creation; returns the vertex index.
    pub fn get_or_set_vertex(&mut self, name: &str) -> usize {
        if let Some(&index) = self.name_to_index.get(name) {
            return index;
        }
        let index = self.vertexes.len();
        self.vertexes.push(Vertex {
            name: name.to_string(),
            neighbors: Vec::new(),
        });
        self.name_to_index.insert(name.to_string(), index);
        index
    }

    pub fn add_vertex_if_missing(&mut self, name: &str) {
        self.get_or_set_vertex(name);
    }

    /// Upsert the edge `from -> to`. Re-adding an existing edge does not
    /// overwrite its weight. `optimized` records the source vertex in the
    /// optimized set, which prevents redundant REST lookups later.
    pub fn add_neighbor(&mut self, from: &str, to: &str, weight: f64, optimized: bool) {
        let from_index = self.get_or_set_vertex(from);
        let to_index = self.get_or_set_vertex(to);
        let vertex = &mut self.vertexes[from_index];
        if !vertex.neighbors.iter().any(|&(n, _)| n == to_index) {
            vertex.neighbors.push((to_index, weight));
        }
        if optimized {
            self.optimized_assets.insert(from.to_string());
        }
    }

    /// Same as [`add_neighbor`](Self::add_neighbor) but also records `from`
    /// as a fiat asset.
    pub fn add_fiat_neighbor(&mut self, from: &str, to: &str, weight: f64, optimized: bool) {
        self.fiat_assets.insert(from.to_string());
        self.add_neighbor(from, to, weight, optimized);
    }

    /// Outgoing edges of `name` as `(neighbor name, weight)`.
    pub fn neighbors(&self, name: &str) -> Vec<(String, f64)> {
        match self.name_to_index.get(name) {
            Some(&index) => self.vertexes[index]
                .neighbors
                .iter()
                .map(|&(n, w)| (self.vertexes[n].name.clone(), w))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn edge_weight(&self, from: &str, to: &str) -> Option<f64> {
        let from_index = *self.name_to_index.get(from)?;
        let to_index = *self.name_to_index.get(to)?;
        self.vertexes[from_index]
            .neighbors
            .iter()
            .find(|&&(n, _)| n == to_index)
            .map(|&(_, w)| w)
    }

    pub fn is_alias(&self, from: &str, to: &str) -> bool {
        self.aliases.contains_key(&Alias::new(from, to))
    }

    /// Constant-price bar for an alias pair, or `None` when the pair is not
    /// aliased.
    pub fn get_alias_bar(&self, from: &str, to: &str, timestamp: DateTime<Utc>) -> Option<HistoricalBar> {
        let factor = self.aliases.get(&Alias::new(from, to))?;
        Some(HistoricalBar::constant(
            timestamp,
            *factor,
            Duration::from_secs(60),
            Decimal::ONE,
        ))
    }

    pub fn is_optimized(&self, asset: &str) -> bool {
        self.optimized_assets.contains(asset)
    }

    pub fn optimized_assets(&self) -> &HashSet<String> {
        &self.optimized_assets
    }

    pub fn is_fiat(&self, asset: &str) -> bool {
        self.fiat_assets.contains(asset)
    }

    /// Cycle-safe transitive closure of the outgoing edges of `name`.
    pub fn get_all_children_of_vertex(&self, name: &str) -> HashSet<String> {
        let mut children = HashSet::new();
        let start = match self.name_to_index.get(name) {
            Some(&index) => index,
            None => return children,
        };
        let mut visited = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            for &(neighbor, _) in &self.vertexes[current].neighbors {
                children.insert(self.vertexes[neighbor].name.clone());
                if visited.insert(neighbor) {
                    queue.push_back(neighbor);
                }
            }
        }
        children
    }

    /// Shortest path from `source` to `target` by additive edge weight,
    /// returned in forward order. `None` when either vertex is missing or
    /// no path exists.
    pub fn dijkstra(&self, source: &str, target: &str) -> Option<Vec<String>> {
        let source_index = *self.name_to_index.get(source)?;
        let target_index = *self.name_to_index.get(target)?;

        let mut dist = vec![f64::INFINITY; self.vertexes.len()];
        let mut prev: Vec<Option<usize>> = vec![None; self.vertexes.len()];
        let mut visited = vec![false; self.vertexes.len()];
        dist[source_index] = 0.0;

        let mut heap = std::collections::BinaryHeap::new();
        heap.push(HeapEntry {
            cost: 0.0,
            index: source_index,
        });

        while let Some(HeapEntry { cost, index }) = heap.pop() {
            if visited[index] {
                continue;
            }
            visited[index] = true;
            if index == target_index {
                break;
            }
            for &(neighbor, weight) in &self.vertexes[index].neighbors {
                let next_cost = cost + weight;
                if next_cost < dist[neighbor] {
                    dist[neighbor] = next_cost;
                    prev[neighbor] = Some(index);
                    heap.push(HeapEntry {
                        cost: next_cost,
                        index: neighbor,
                    });
                }
            }
        }

        if !visited[target_index] {
            return None;
        }
        let mut path = vec![target_index];
        let mut current = target_index;
        while let Some(previous) = prev[current] {
            path.push(previous);
            current = previous;
        }
        path.reverse();
        Some(path.into_iter().map(|i| self.vertexes[i].name.clone()).collect())
    }

    /// Produce a new graph with weights overridden from `optimization`
    /// (`asset -> neighbor -> weight`).
    ///
    /// For an edge whose source appears in the table, the new weight is the
    /// table value when present, else the original, and the source is
    /// marked optimized. Edges with a negative weight encode "market not
    /// yet live" and are dropped, unless the target is a fiat vertex, which
    /// is retained as a fiat neighbor. Table entries for edges that did not
    /// exist are added as new optimized edges.
    pub fn clone_with_optimization(&self, optimization: &HashMap<String, HashMap<String, f64>>) -> MappedGraph {
        let mut remaining: HashMap<String, HashMap<String, f64>> = optimization.clone();
        let mut cloned = MappedGraph::with_state(
            &self.exchange,
            self.optimized_assets.clone(),
            self.fiat_assets.clone(),
            self.aliases.clone(),
        );

        for vertex in &self.vertexes {
            if vertex.neighbors.is_empty() && !self.fiat_assets.contains(&vertex.name) {
                cloned.add_vertex_if_missing(&vertex.name);
                continue;
            }
            for &(neighbor_index, original_weight) in &vertex.neighbors {
                let neighbor_name = &self.vertexes[neighbor_index].name;
                let mut optimized = false;
                let weight = match remaining.get_mut(&vertex.name) {
                    Some(overrides) => {
                        optimized = true;
                        overrides.remove(neighbor_name).unwrap_or(original_weight)
                    }
                    None => original_weight,
                };

                if weight >= 0.0 {
                    cloned.add_neighbor(&vertex.name, neighbor_name, weight, optimized);
                } else if self.fiat_assets.contains(neighbor_name) {
                    tracing::debug!("Keeping fiat neighbor {} -> {} while cloning", vertex.name, neighbor_name);
                    cloned.add_fiat_neighbor(&vertex.name, neighbor_name, weight, optimized);
                } else {
                    cloned.add_vertex_if_missing(&vertex.name);
                }
            }
        }

        // Markets that opened during this window: edges in the table with
        // no counterpart in the source graph.
        for (asset, neighbor_weights) in &remaining {
            if !self.name_to_index.contains_key(asset) {
                continue;
            }
            for (neighbor_name, &weight) in neighbor_weights {
                cloned.add_neighbor(asset, neighbor_name, weight, true);
                tracing::debug!("Added {} -> {} while cloning", asset, neighbor_name);
            }
        }

        cloned
    }

    /// Keep only the edges present in the first optimization window (plus
    /// fiat-to-fiat edges). Markets appear over time, so the earliest
    /// snapshot must not route through pairs that did not exist yet.
    pub fn prune_graph(&self, optimization: &HashMap<String, HashMap<String, f64>>) -> MappedGraph {
        let mut pruned = MappedGraph::with_state(
            &self.exchange,
            self.optimized_assets.clone(),
            HashSet::new(),
            self.aliases.clone(),
        );

        for vertex in &self.vertexes {
            for &(neighbor_index, _) in &vertex.neighbors {
                let neighbor_name = &self.vertexes[neighbor_index].name;
                let in_window = optimization
                    .get(&vertex.name)
                    .is_some_and(|neighbors| neighbors.contains_key(neighbor_name));
                let fiat_pair =
                    self.fiat_assets.contains(&vertex.name) && self.fiat_assets.contains(neighbor_name);
                if in_window || fiat_pair {
                    pruned.add_neighbor(&vertex.name, neighbor_name, 0.0, false);
                } else {
                    pruned.add_vertex_if_missing(&vertex.name);
                }
            }
        }

        pruned
    }
}

// Min-heap entry ordered by cost; f64 weights never go NaN here so
// total_cmp gives the ordering BinaryHeap needs.
struct HeapEntry {
    cost: f64,
    index: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost && self.index == other.index
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the cheapest first.
        other.cost.total_cmp(&self.cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn simple_graph() -> MappedGraph {
        let mut graph = MappedGraph::new("Kraken", None);
        graph.add_neighbor("BTC", "USDT", 2.0, false);
        graph.add_neighbor("BTC", "USD", 1.0, false);
        graph.add_neighbor("USDT", "USD", 1.0, false);
        graph
    }

    #[test]
    fn test_universal_alias_installed() {
        let graph = MappedGraph::new("Kraken", None);
        assert!(graph.is_alias("XBT", "BTC"));
        assert!(!graph.is_alias("BTC", "XBT"));
        let ts = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let bar = graph.get_alias_bar("XBT", "BTC", ts).unwrap();
        assert_eq!(bar.open, Decimal::ONE);
        assert_eq!(bar.high, Decimal::ONE);
        assert_eq!(bar.volume, Decimal::ONE);
        assert!(graph.get_alias_bar("BTC", "ETH", ts).is_none());
    }

    #[test]
    fn test_exchange_specific_alias_factor() {
        let graph = MappedGraph::new("Pionex", None);
        let ts = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let bar = graph.get_alias_bar("MBTC", "BTC", ts).unwrap();
        assert_eq!(bar.close, dec!(0.001));
        // Alias sources are optimized from the start.
        assert!(graph.is_optimized("MBTC"));
    }

    #[test]
    fn test_user_aliases_overlay() {
        let mut user: ExchangeAliases = HashMap::new();
        user.entry(UNIVERSAL_EXCHANGE.to_string())
            .or_default()
            .insert(Alias::new("WBTC", "BTC"), Decimal::ONE);
        user.entry("Kraken".to_string())
            .or_default()
            .insert(Alias::new("XDG", "DOGE"), Decimal::ONE);
        let graph = MappedGraph::new("Kraken", Some(&user));
        assert!(graph.is_alias("WBTC", "BTC"));
        assert!(graph.is_alias("XDG", "DOGE"));
        let other = MappedGraph::new("Binance.com", Some(&user));
        assert!(other.is_alias("WBTC", "BTC"));
        assert!(!other.is_alias("XDG", "DOGE"));
    }

    #[test]
    fn test_re_adding_edge_keeps_first_weight() {
        let mut graph = simple_graph();
        graph.add_neighbor("BTC", "USD", 50.0, false);
        assert_eq!(graph.edge_weight("BTC", "USD"), Some(1.0));
    }

    #[test]
    fn test_children_closure_is_cycle_safe() {
        let mut graph = MappedGraph::new("Kraken", None);
        graph.add_neighbor("A", "B", 1.0, false);
        graph.add_neighbor("B", "C", 1.0, false);
        graph.add_neighbor("C", "A", 1.0, false);
        let children = graph.get_all_children_of_vertex("A");
        assert_eq!(
            children,
            HashSet::from(["A".to_string(), "B".to_string(), "C".to_string()])
        );
    }

    #[test]
    fn test_dijkstra_prefers_cheaper_route() {
        let graph = simple_graph();
        // Direct BTC->USD costs 1.0; BTC->USDT->USD costs 3.0.
        let path = graph.dijkstra("BTC", "USD").unwrap();
        assert_eq!(path, vec!["BTC".to_string(), "USD".to_string()]);
    }

    #[test]
    fn test_dijkstra_multi_hop_when_no_direct_edge() {
        let mut graph = MappedGraph::new("Kraken", None);
        graph.add_neighbor("BTC", "USDT", 7.0, false);
        graph.add_neighbor("USDT", "USD", 1.0, false);
        let path = graph.dijkstra("BTC", "USD").unwrap();
        assert_eq!(
            path,
            vec!["BTC".to_string(), "USDT".to_string(), "USD".to_string()]
        );
    }

    #[test]
    fn test_dijkstra_no_path_is_none() {
        let mut graph = MappedGraph::new("Kraken", None);
        graph.add_neighbor("BTC", "USDT", 1.0, false);
        graph.add_vertex_if_missing("EUR");
        assert!(graph.dijkstra("BTC", "EUR").is_none());
        assert!(graph.dijkstra("BTC", "MISSING").is_none());
    }

    #[test]
    fn test_clone_with_optimization_weights_and_marking() {
        let mut graph = simple_graph();
        graph.add_fiat_neighbor("USD", "EUR", 1.0, true);

        let optimization = HashMap::from([(
            "BTC".to_string(),
            HashMap::from([("USDT".to_string(), 1.0), ("USD".to_string(), 2.0)]),
        )]);
        let cloned = graph.clone_with_optimization(&optimization);

        assert_eq!(cloned.edge_weight("BTC", "USDT"), Some(1.0));
        assert_eq!(cloned.edge_weight("BTC", "USD"), Some(2.0));
        // Edge not referenced by the table keeps its original weight.
        assert_eq!(cloned.edge_weight("USDT", "USD"), Some(1.0));
        // The clone's optimized set is the original's plus every table key.
        assert!(cloned.is_optimized("BTC"));
        assert!(cloned.is_optimized("USD"));
    }

    #[test]
    fn test_clone_drops_negative_edges_unless_fiat_target() {
        let mut graph = MappedGraph::new("Kraken", None);
        graph.add_neighbor("NEW", "USDT", 5.0, false);
        graph.add_neighbor("NEW", "USD", 5.0, false);
        graph.add_fiat_neighbor("USD", "EUR", 1.0, true);
        graph.add_fiat_neighbor("EUR", "USD", 2.0, true);

        let optimization = HashMap::from([(
            "NEW".to_string(),
            HashMap::from([("USDT".to_string(), -1.0), ("USD".to_string(), -1.0)]),
        )]);
        let cloned = graph.clone_with_optimization(&optimization);

        // Not-yet-live market edge is gone, but the vertex survives.
        assert_eq!(cloned.edge_weight("NEW", "USDT"), None);
        assert!(cloned.contains_vertex("NEW"));
        // Fiat-destination edges are preserved as fiat neighbors.
        assert_eq!(cloned.edge_weight("NEW", "USD"), Some(-1.0));
        assert!(cloned.is_fiat("NEW"));
    }

    #[test]
    fn test_clone_adds_new_market_edges() {
        let graph = simple_graph();
        let optimization = HashMap::from([(
            "USDT".to_string(),
            HashMap::from([("EUR".to_string(), 1.0)]),
        )]);
        let cloned = graph.clone_with_optimization(&optimization);
        assert_eq!(cloned.edge_weight("USDT", "EUR"), Some(1.0));
        assert!(cloned.is_optimized("USDT"));
    }

    #[test]
    fn test_prune_keeps_window_edges_and_fiat_pairs() {
        let mut graph = simple_graph();
        graph.add_fiat_neighbor("USD", "EUR", 1.0, true);
        graph.add_fiat_neighbor("EUR", "USD", 2.0, true);

        let first_window = HashMap::from([(
            "BTC".to_string(),
            HashMap::from([("USD".to_string(), 1.0)]),
        )]);
        let pruned = graph.prune_graph(&first_window);

        assert!(pruned.edge_weight("BTC", "USD").is_some());
        assert_eq!(pruned.edge_weight("BTC", "USDT"), None);
        // Fiat-to-fiat edges always survive the prune.
        assert!(pruned.edge_weight("USD", "EUR").is_some());
        assert!(pruned.edge_weight("EUR", "USD").is_some());
        // Vertices that lost all edges stay as isolated vertices.
        assert!(pruned.contains_vertex("USDT"));
    }
}
