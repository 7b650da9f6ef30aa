pub mod broker;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluator;
pub mod hours;
pub mod repo;
pub mod types;

pub use broker::BrokerAdapter;
pub use config::{BrokerKind, Config};
pub use data::MarketDataSource;
pub use error::{Error, Result};
pub use evaluator::{EvalRequest, EvalVerdict, EvaluatorClient, Recommendation};
pub use repo::StrategyStore;
pub use types::*;
