//! Market-data layer: the tiered bar cache, gap detection and backfill, the
//! durable bar store and the upstream REST client.

pub mod cache;
pub mod gaps;
pub mod store;
pub mod upstream;

pub use cache::{BarCache, CacheConfig, GetBarsOptions};
pub use gaps::{detect_gaps, Gap};
pub use store::BarStore;
pub use upstream::DataApiClient;
