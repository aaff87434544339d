pub mod app_info;
pub mod health;
pub mod market_query;
pub mod market_stream;
