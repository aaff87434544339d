use crate::error::AppError;
use crate::market::types::AssetRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingCategory {
    All,
    Trending,
    Gainers,
    Losers,
    Volume,
}

impl RankingCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Trending => "trending",
            Self::Gainers => "gainers",
            Self::Losers => "losers",
            Self::Volume => "volume",
        }
    }

    pub fn parse_str(raw: &str) -> Result<Self, AppError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "trending" => Ok(Self::Trending),
            "gainers" => Ok(Self::Gainers),
            "losers" => Ok(Self::Losers),
            "volume" => Ok(Self::Volume),
            other => Err(AppError::InvalidArgument(format!(
                "unknown ranking category '{other}'"
            ))),
        }
    }
}

/// When a captured order may be replaced without an explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelockPolicy {
    /// Only `LockedOrderBook::reset` clears a lock.
    Manual,
    /// A lock whose projection has become empty is recaptured.
    WhenDrained,
}

impl RelockPolicy {
    pub fn parse_str(raw: &str) -> Result<Self, AppError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "when_drained" => Ok(Self::WhenDrained),
            other => Err(AppError::InvalidArgument(format!(
                "unknown relock policy '{other}'"
            ))),
        }
    }
}

fn sorted_by<F>(records: &[AssetRecord], limit: usize, compare: F) -> Vec<AssetRecord>
where
    F: Fn(&AssetRecord, &AssetRecord) -> std::cmp::Ordering,
{
    let mut ranked = records.to_vec();
    // `sort_by` is stable, ties keep input order.
    ranked.sort_by(compare);
    ranked.truncate(limit);
    ranked
}

pub fn top_gainers(records: &[AssetRecord], limit: usize) -> Vec<AssetRecord> {
    sorted_by(records, limit, |a, b| {
        b.change_24h_percent.total_cmp(&a.change_24h_percent)
    })
}

pub fn top_losers(records: &[AssetRecord], limit: usize) -> Vec<AssetRecord> {
    sorted_by(records, limit, |a, b| {
        a.change_24h_percent.total_cmp(&b.change_24h_percent)
    })
}

pub fn top_volume(records: &[AssetRecord], limit: usize) -> Vec<AssetRecord> {
    sorted_by(records, limit, |a, b| b.volume_24h.total_cmp(&a.volume_24h))
}

pub fn trending_score(record: &AssetRecord) -> f64 {
    record.volume_24h * (1.0 + record.change_24h_percent / 100.0)
}

pub fn trending(records: &[AssetRecord], limit: usize) -> Vec<AssetRecord> {
    let rising: Vec<AssetRecord> = records
        .iter()
        .filter(|record| record.change_24h_percent > 0.0)
        .cloned()
        .collect();
    sorted_by(&rising, limit, |a, b| {
        trending_score(b).total_cmp(&trending_score(a))
    })
}

/// Case-insensitive match on symbol and display name. Exact symbol hits come
/// first; a blank query returns the input unchanged.
pub fn search(records: &[AssetRecord], query: &str) -> Vec<AssetRecord> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return records.to_vec();
    }

    let mut exact = Vec::new();
    let mut partial = Vec::new();
    for record in records {
        let symbol = record.symbol.to_lowercase();
        if symbol == needle {
            exact.push(record.clone());
        } else if symbol.contains(&needle) || record.name.to_lowercase().contains(&needle) {
            partial.push(record.clone());
        }
    }
    exact.extend(partial);
    exact
}

pub fn rank(category: RankingCategory, records: &[AssetRecord], limit: usize) -> Vec<AssetRecord> {
    match category {
        RankingCategory::All => records.iter().take(limit).cloned().collect(),
        RankingCategory::Trending => trending(records, limit),
        RankingCategory::Gainers => top_gainers(records, limit),
        RankingCategory::Losers => top_losers(records, limit),
        RankingCategory::Volume => top_volume(records, limit),
    }
}

/// Current records in the captured symbol order; vanished symbols are
/// skipped without disturbing the rest.
pub fn project_locked(order: &[String], current: &[AssetRecord]) -> Vec<AssetRecord> {
    let by_symbol: HashMap<&str, &AssetRecord> = current
        .iter()
        .map(|record| (record.symbol.as_str(), record))
        .collect();
    order
        .iter()
        .filter_map(|symbol| by_symbol.get(symbol.as_str()).map(|record| (*record).clone()))
        .collect()
}

/// Captured symbol orders, one per category and requested limit.
#[derive(Debug)]
pub struct LockedOrderBook {
    policy: RelockPolicy,
    locks: HashMap<(RankingCategory, usize), Vec<String>>,
}

impl LockedOrderBook {
    pub fn new(policy: RelockPolicy) -> Self {
        Self {
            policy,
            locks: HashMap::new(),
        }
    }

    pub fn policy(&self) -> RelockPolicy {
        self.policy
    }

    pub fn is_locked(&self, category: RankingCategory, limit: usize) -> bool {
        self.locks.contains_key(&(category, limit))
    }

    pub fn captured(&self, category: RankingCategory, limit: usize) -> Option<&[String]> {
        self.locks.get(&(category, limit)).map(Vec::as_slice)
    }

    /// Captures `ranked` on first non-empty use, then keeps projecting
    /// `current` into that order. A different `limit` is a separate lock.
    pub fn resolve(
        &mut self,
        category: RankingCategory,
        limit: usize,
        ranked: Vec<AssetRecord>,
        current: &[AssetRecord],
    ) -> Vec<AssetRecord> {
        let key = (category, limit);
        if let Some(order) = self.locks.get(&key) {
            let projected = project_locked(order, current);
            if !projected.is_empty() || self.policy == RelockPolicy::Manual {
                return projected;
            }
            self.locks.remove(&key);
        }

        if !ranked.is_empty() {
            self.locks.insert(
                key,
                ranked.iter().map(|record| record.symbol.clone()).collect(),
            );
        }
        ranked
    }

    /// Load boundary: every category recaptures on next use.
    pub fn reset(&mut self) {
        self.locks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::testing::record;

    fn symbols(records: &[AssetRecord]) -> Vec<&str> {
        records.iter().map(|record| record.symbol.as_str()).collect()
    }

    fn sample() -> Vec<AssetRecord> {
        vec![
            record("BTC", 100.0, 2.0, 900.0),
            record("ETH", 50.0, -1.0, 800.0),
            record("SOL", 20.0, 5.0, 100.0),
            record("ADA", 1.0, -4.0, 300.0),
        ]
    }

    #[test]
    fn gainers_and_losers_mirror_without_ties() {
        let records = sample();
        let gainers = top_gainers(&records, 10);
        let mut losers = top_losers(&records, 10);
        losers.reverse();

        assert_eq!(symbols(&gainers), vec!["SOL", "BTC", "ETH", "ADA"]);
        assert_eq!(symbols(&gainers), symbols(&losers));
    }

    #[test]
    fn ties_keep_input_order_across_calls() {
        let records = vec![
            record("AAA", 1.0, 3.0, 1.0),
            record("BBB", 1.0, 3.0, 1.0),
            record("CCC", 1.0, 1.0, 1.0),
        ];

        for _ in 0..3 {
            assert_eq!(symbols(&top_gainers(&records, 3)), vec!["AAA", "BBB", "CCC"]);
            assert_eq!(symbols(&top_losers(&records, 3)), vec!["CCC", "AAA", "BBB"]);
        }
    }

    #[test]
    fn volume_ranking_truncates() {
        assert_eq!(symbols(&top_volume(&sample(), 2)), vec!["BTC", "ETH"]);
        assert!(top_volume(&sample(), 0).is_empty());
    }

    #[test]
    fn trending_keeps_rising_assets_by_score() {
        let records = vec![
            record("LOW", 1.0, 50.0, 100.0),
            record("HIGH", 1.0, 1.0, 1_000.0),
            record("FALL", 1.0, -2.0, 5_000.0),
            record("FLAT", 1.0, 0.0, 5_000.0),
        ];

        let ranked = trending(&records, 10);

        assert_eq!(symbols(&ranked), vec!["HIGH", "LOW"]);
        assert!((trending_score(&ranked[0]) - 1_010.0).abs() < 1e-9);
    }

    #[test]
    fn search_puts_exact_symbol_first_and_keeps_group_order() {
        let records = vec![
            record("SOLO", 1.0, 0.0, 1.0),
            record("ETH", 1.0, 0.0, 1.0),
            record("SOL", 1.0, 0.0, 1.0),
            record("XSOL", 1.0, 0.0, 1.0),
        ];

        assert_eq!(symbols(&search(&records, " sol ")), vec!["SOL", "SOLO", "XSOL"]);
        assert_eq!(symbols(&search(&records, "ether")), vec!["ETH"]);
        assert_eq!(symbols(&search(&records, "   ")), symbols(&records));
        assert!(search(&records, "zzz").is_empty());
    }

    #[test]
    fn locked_order_survives_value_changes_and_drops_vanished() {
        let mut book = LockedOrderBook::new(RelockPolicy::Manual);
        let records = sample();
        let first = book.resolve(
            RankingCategory::Gainers,
            3,
            top_gainers(&records, 3),
            &records,
        );
        assert_eq!(symbols(&first), vec!["SOL", "BTC", "ETH"]);

        let mutated = vec![
            record("BTC", 120.0, 40.0, 1.0),
            record("ETH", 70.0, 30.0, 2.0),
            record("SOL", 10.0, -50.0, 3.0),
            record("ADA", 5.0, 90.0, 4.0),
        ];
        let projected = book.resolve(
            RankingCategory::Gainers,
            3,
            top_gainers(&mutated, 3),
            &mutated,
        );
        assert_eq!(symbols(&projected), vec!["SOL", "BTC", "ETH"]);
        assert_eq!(projected[0].change_24h_percent, -50.0);

        let without_btc: Vec<AssetRecord> = mutated
            .into_iter()
            .filter(|record| record.symbol != "BTC")
            .collect();
        let projected = book.resolve(
            RankingCategory::Gainers,
            3,
            top_gainers(&without_btc, 3),
            &without_btc,
        );
        assert_eq!(symbols(&projected), vec!["SOL", "ETH"]);
    }

    #[test]
    fn each_limit_keeps_its_own_lock() {
        let mut book = LockedOrderBook::new(RelockPolicy::Manual);
        let records = sample();

        let short = book.resolve(RankingCategory::Gainers, 2, top_gainers(&records, 2), &records);
        let long = book.resolve(RankingCategory::Gainers, 3, top_gainers(&records, 3), &records);

        assert_eq!(symbols(&short), vec!["SOL", "BTC"]);
        assert_eq!(symbols(&long), vec!["SOL", "BTC", "ETH"]);
        assert!(book.is_locked(RankingCategory::Gainers, 2));
        assert!(book.is_locked(RankingCategory::Gainers, 3));
        assert!(!book.is_locked(RankingCategory::Gainers, 10));
    }

    #[test]
    fn empty_ranking_is_not_captured() {
        let mut book = LockedOrderBook::new(RelockPolicy::Manual);

        let result = book.resolve(RankingCategory::Trending, 5, Vec::new(), &[]);
        assert!(result.is_empty());
        assert!(!book.is_locked(RankingCategory::Trending, 5));

        let records = sample();
        book.resolve(RankingCategory::Trending, 5, trending(&records, 5), &records);
        assert_eq!(
            book.captured(RankingCategory::Trending, 5),
            Some(&["BTC".to_string(), "SOL".to_string()][..])
        );
    }

    #[test]
    fn manual_policy_keeps_drained_lock_until_reset() {
        let mut book = LockedOrderBook::new(RelockPolicy::Manual);
        let records = sample();
        book.resolve(RankingCategory::Volume, 2, top_volume(&records, 2), &records);

        let fresh = vec![record("DOGE", 0.1, 1.0, 10.0)];
        let drained = book.resolve(RankingCategory::Volume, 2, top_volume(&fresh, 2), &fresh);
        assert!(drained.is_empty());

        book.reset();
        let relocked = book.resolve(RankingCategory::Volume, 2, top_volume(&fresh, 2), &fresh);
        assert_eq!(symbols(&relocked), vec!["DOGE"]);
    }

    #[test]
    fn when_drained_policy_recaptures() {
        let mut book = LockedOrderBook::new(RelockPolicy::WhenDrained);
        let records = sample();
        book.resolve(RankingCategory::Volume, 2, top_volume(&records, 2), &records);

        let fresh = vec![record("DOGE", 0.1, 1.0, 10.0)];
        let relocked = book.resolve(RankingCategory::Volume, 2, top_volume(&fresh, 2), &fresh);

        assert_eq!(symbols(&relocked), vec!["DOGE"]);
        assert_eq!(
            book.captured(RankingCategory::Volume, 2),
            Some(&["DOGE".to_string()][..])
        );
    }

    #[test]
    fn parses_categories_and_policies() {
        assert_eq!(RankingCategory::parse_str("Gainers").unwrap(), RankingCategory::Gainers);
        assert!(RankingCategory::parse_str("movers").is_err());
        assert_eq!(RelockPolicy::parse_str("when_drained").unwrap(), RelockPolicy::WhenDrained);
        assert!(RelockPolicy::parse_str("sometimes").is_err());
    }
}
