pub mod market_api;

pub use market_api::{endpoint_prefix, MarketApi, TtlClass};
