pub mod cache;
pub mod math;
pub mod relay;

pub use cache::RateCache;
pub use relay::{HttpRateRelay, RateRelay};
