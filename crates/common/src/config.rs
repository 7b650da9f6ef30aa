use crate::ExecutionEnv;

/// Which broker implementation the process talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    /// In-memory simulated broker. No order ever leaves the process.
    Sim,
    /// HMAC-signed REST gateway.
    Gateway,
}

impl std::fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerKind::Sim => write!(f, "sim"),
            BrokerKind::Gateway => write!(f, "gateway"),
        }
    }
}

/// All configuration loaded from environment variables at startup.
/// Missing required variables cause an immediate panic with a clear message.
#[derive(Debug, Clone)]
pub struct Config {
    // Broker
    pub broker: BrokerKind,
    pub gateway_base_url: String,
    pub gateway_api_key: String,
    pub gateway_api_secret: String,
    pub account_id: String,

    // Market data upstream
    pub data_base_url: String,
    pub data_api_key: String,

    // Evaluator/advisor service; absent = evaluation pass disabled
    pub evaluator_url: Option<String>,

    // Orchestration
    pub user_id: String,
    pub poll_interval_secs: u64,
    pub evaluation_interval_secs: u64,
    pub max_concurrent_strategies: usize,

    // Safety flags and order constraints
    pub allow_live_orders: bool,
    pub allow_cancel_entries: bool,
    pub max_order_qty: Option<f64>,
    pub max_notional_per_symbol: Option<f64>,
    pub max_orders_per_symbol: Option<usize>,
    pub daily_loss_limit: Option<f64>,
    pub enable_dynamic_sizing: bool,

    // Database
    pub database_url: String,
}

impl Config {
    /// Load all configuration from environment variables.
    /// Loads `.env` if present. Panics on any missing required variable.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        let broker = match required_env("BROKER").to_lowercase().as_str() {
            "sim" => BrokerKind::Sim,
            "gateway" => BrokerKind::Gateway,
            other => panic!("ERROR: BROKER must be 'sim' or 'gateway', got: '{other}'"),
        };

        // Gateway credentials are only required when the gateway broker is
        // selected; the sim broker runs without them.
        let (gateway_base_url, gateway_api_key, gateway_api_secret) = match broker {
            BrokerKind::Gateway => (
                required_env("GATEWAY_BASE_URL"),
                required_env("GATEWAY_API_KEY"),
                required_env("GATEWAY_API_SECRET"),
            ),
            BrokerKind::Sim => (
                optional_env("GATEWAY_BASE_URL").unwrap_or_default(),
                String::new(),
                String::new(),
            ),
        };

        Config {
            broker,
            gateway_base_url,
            gateway_api_key,
            gateway_api_secret,
            account_id: optional_env("ACCOUNT_ID").unwrap_or_else(|| "default".to_string()),
            data_base_url: required_env("DATA_BASE_URL"),
            data_api_key: required_env("DATA_API_KEY"),
            evaluator_url: optional_env("EVALUATOR_URL"),
            user_id: required_env("USER_ID"),
            poll_interval_secs: parsed_env("POLL_INTERVAL_SECS", 30),
            evaluation_interval_secs: parsed_env("EVALUATION_INTERVAL_SECS", 900),
            max_concurrent_strategies: parsed_env("MAX_CONCURRENT_STRATEGIES", 16),
            allow_live_orders: parsed_env("ALLOW_LIVE_ORDERS", false),
            allow_cancel_entries: parsed_env("ALLOW_CANCEL_ENTRIES", true),
            max_order_qty: optional_env("MAX_ORDER_QTY").and_then(|v| v.parse().ok()),
            max_notional_per_symbol: optional_env("MAX_NOTIONAL_PER_SYMBOL")
                .and_then(|v| v.parse().ok()),
            max_orders_per_symbol: optional_env("MAX_ORDERS_PER_SYMBOL")
                .and_then(|v| v.parse().ok()),
            daily_loss_limit: optional_env("DAILY_LOSS_LIMIT").and_then(|v| v.parse().ok()),
            enable_dynamic_sizing: parsed_env("ENABLE_DYNAMIC_SIZING", false),
            database_url: required_env("DATABASE_URL"),
        }
    }

    /// The broker-environment block threaded through every adapter call.
    pub fn execution_env(&self) -> ExecutionEnv {
        ExecutionEnv {
            account_id: self.account_id.clone(),
            allow_live_orders: self.allow_live_orders,
            allow_cancel_entries: self.allow_cancel_entries,
            max_order_qty: self.max_order_qty,
            max_notional_per_symbol: self.max_notional_per_symbol,
            max_orders_per_symbol: self.max_orders_per_symbol,
            daily_loss_limit: self.daily_loss_limit,
            enable_dynamic_sizing: self.enable_dynamic_sizing,
            sizing_factor: 0.75,
        }
    }
}

fn required_env(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| {
        panic!("Required environment variable '{key}' is not set. Check your .env file.")
    })
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    optional_env(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
