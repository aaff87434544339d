pub mod binance;
pub mod config;
pub mod endpoints;
pub mod format;
pub mod observers;
pub mod pipeline;
pub mod publish;
pub mod ranking;
pub mod snapshot;
pub mod store;
pub mod stream;
pub mod types;

#[cfg(test)]
pub mod testing;

pub const TICKER_EVENT: &str = "24hrTicker";
pub const MINI_TICKER_EVENT: &str = "24hrMiniTicker";
