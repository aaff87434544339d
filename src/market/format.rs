use crate::market::types::{AssetRecord, DirectionState, PriceDirection};
use serde::Serialize;

fn decimals_for(magnitude: f64) -> usize {
    if magnitude < 0.000_01 {
        8
    } else if magnitude < 0.000_1 {
        6
    } else if magnitude < 0.01 {
        5
    } else if magnitude < 1.0 {
        4
    } else if magnitude < 100.0 {
        3
    } else {
        2
    }
}

/// Finer precision for sub-unit prices, two decimals from 100 up.
pub fn format_price(price: f64) -> String {
    format!("{:.*}", decimals_for(price), price)
}

pub fn format_change(change: f64) -> String {
    format!("{:.*}", decimals_for(change.abs()), change)
}

pub fn format_volume(volume: f64) -> String {
    if volume >= 1e9 {
        format!("${:.3}B", volume / 1e9)
    } else if volume >= 1e6 {
        format!("${:.3}M", volume / 1e6)
    } else if volume >= 1e3 {
        format!("${:.3}K", volume / 1e3)
    } else if volume < 1.0 {
        format!("${volume:.4}")
    } else {
        format!("${volume:.2}")
    }
}

pub fn format_percent(percent: f64) -> String {
    if percent >= 0.0 {
        format!("+{percent:.2}%")
    } else {
        format!("{percent:.2}%")
    }
}

/// Record plus direction and display strings, ready to render.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRow {
    #[serde(flatten)]
    pub record: AssetRecord,
    pub direction: PriceDirection,
    pub intensity: f64,
    pub price_display: String,
    pub change_display: String,
    pub percent_display: String,
    pub volume_display: String,
}

impl AssetRow {
    pub fn new(record: AssetRecord, direction: DirectionState) -> Self {
        Self {
            price_display: format_price(record.price),
            change_display: format_change(record.change_24h),
            percent_display: format_percent(record.change_24h_percent),
            volume_display: format_volume(record.volume_24h),
            direction: direction.direction,
            intensity: direction.intensity,
            record,
        }
    }
}

const MARKET_CAP_SAMPLE: usize = 20;
const MARKET_CAP_VOLUME_MULTIPLIER: f64 = 1_000.0;
const BTC_SUPPLY_ESTIMATE: f64 = 19_000_000.0;

/// Headline market figures.
///
/// `total_market_cap` and `btc_dominance` are placeholders: capitalisation is
/// derived from traded volume, not circulating supply, and must not be read
/// as a real market-cap figure.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MarketStats {
    pub total_market_cap: f64,
    pub total_volume_24h: f64,
    pub btc_dominance: f64,
    pub market_change_24h: f64,
    pub active_coins: usize,
}

impl MarketStats {
    pub fn compute(records: &[AssetRecord]) -> Self {
        if records.is_empty() {
            return Self::default();
        }

        let total_volume_24h: f64 = records.iter().map(|record| record.volume_24h).sum();
        let total_market_cap: f64 = records
            .iter()
            .take(MARKET_CAP_SAMPLE)
            .map(|record| record.volume_24h)
            .sum::<f64>()
            * MARKET_CAP_VOLUME_MULTIPLIER;
        let btc_dominance = match records.iter().find(|record| record.symbol == "BTC") {
            Some(btc) if total_market_cap > 0.0 => {
                btc.price * BTC_SUPPLY_ESTIMATE / total_market_cap * 100.0
            }
            _ => 0.0,
        };
        let market_change_24h = records
            .iter()
            .map(|record| record.change_24h_percent)
            .sum::<f64>()
            / records.len() as f64;

        Self {
            total_market_cap,
            total_volume_24h,
            btc_dominance,
            market_change_24h,
            active_coins: records.len(),
        }
    }
}
