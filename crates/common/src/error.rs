use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // ── Compilation ──────────────────────────────────────────────────────
    #[error("schema error at {path}: {reason}")]
    Schema { path: String, reason: String },

    #[error("parse error in '{location}': {message}")]
    Parse { location: String, message: String },

    #[error("unknown identifier '{symbol}' in {location}")]
    Name { symbol: String, location: String },

    #[error("feature dependency cycle: {0}")]
    Cycle(String),

    // ── Runtime (contained) ──────────────────────────────────────────────
    #[error("feature '{feature}' failed to compute: {message}")]
    FeatureCompute { feature: String, message: String },

    #[error("predicate evaluation failed: {0}")]
    Predicate(String),

    // ── Broker ───────────────────────────────────────────────────────────
    #[error("transient broker error: {0}")]
    BrokerTransient(String),

    #[error("broker rejected request: {0}")]
    BrokerPermanent(String),

    #[error("cancellation failed for {failed} of {total} orders")]
    CancellationFailure { failed: usize, total: usize },

    #[error("reconciliation mismatch on {symbol}: {detail}")]
    ReconciliationMismatch { symbol: String, detail: String },

    // ── Infrastructure ───────────────────────────────────────────────────
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    /// Whether the operation queue should retry this error with backoff.
    /// Constraint violations and compile errors never retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::BrokerTransient(_) | Error::Http(_))
    }

    /// Compile-stage errors mark the strategy record FAILED without ever
    /// creating an engine.
    pub fn is_compile_error(&self) -> bool {
        matches!(
            self,
            Error::Schema { .. } | Error::Parse { .. } | Error::Name { .. } | Error::Cycle(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
