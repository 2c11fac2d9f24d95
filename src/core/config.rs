use crate::core::types::{OperationType, Priority};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

const DEFAULT_REST_URL: &str = "https://api.kraken.com";
const DEFAULT_WS_URL: &str = "wss://ws-auth.kraken.com/v2";

/// Account class of the credentials, selects the rate-budget preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountTier {
    Starter,
    Intermediate,
    Pro,
}

impl AccountTier {
    /// `(max_counter, decay_rate per second)`
    pub fn budget(self) -> (f64, f64) {
        match self {
            Self::Starter => (60.0, 1.0),
            Self::Intermediate => (125.0, 2.34),
            Self::Pro => (180.0, 3.75),
        }
    }
}

impl std::str::FromStr for AccountTier {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "starter" => Ok(Self::Starter),
            "intermediate" => Ok(Self::Intermediate),
            "pro" => Ok(Self::Pro),
            other => Err(ConfigError::InvalidConfiguration(format!(
                "Unknown account tier '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub api_key: Secret<String>,
    pub secret_key: Secret<String>,
    pub rest_url: String,
    pub ws_url: String,
    pub tier: AccountTier,
}

// Custom Serialize implementation - never expose secrets in serialization
impl Serialize for ExchangeConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ExchangeConfig", 5)?;
        state.serialize_field("api_key", "[REDACTED]")?;
        state.serialize_field("secret_key", "[REDACTED]")?;
        state.serialize_field("rest_url", &self.rest_url)?;
        state.serialize_field("ws_url", &self.ws_url)?;
        state.serialize_field("tier", &self.tier)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for ExchangeConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct ExchangeConfigHelper {
            api_key: String,
            secret_key: String,
            rest_url: Option<String>,
            ws_url: Option<String>,
            tier: Option<AccountTier>,
        }

        let helper = ExchangeConfigHelper::deserialize(deserializer)?;
        Ok(Self {
            api_key: Secret::new(helper.api_key),
            secret_key: Secret::new(helper.secret_key),
            rest_url: helper
                .rest_url
                .unwrap_or_else(|| DEFAULT_REST_URL.to_string()),
            ws_url: helper.ws_url.unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
            tier: helper.tier.unwrap_or(AccountTier::Starter),
        })
    }
}

impl ExchangeConfig {
    /// Create a new configuration with API credentials
    #[must_use]
    pub fn new(api_key: String, secret_key: String) -> Self {
        Self {
            api_key: Secret::new(api_key),
            secret_key: Secret::new(secret_key),
            rest_url: DEFAULT_REST_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            tier: AccountTier::Starter,
        }
    }

    /// Create configuration from environment variables
    ///
    /// Expected environment variables:
    /// - `{PREFIX}_API_KEY`
    /// - `{PREFIX}_SECRET_KEY`
    /// - `{PREFIX}_REST_URL` (optional)
    /// - `{PREFIX}_WS_URL` (optional)
    /// - `{PREFIX}_TIER` (optional, `starter` | `intermediate` | `pro`)
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let prefix = prefix.to_uppercase();
        let api_key_var = format!("{}_API_KEY", prefix);
        let secret_key_var = format!("{}_SECRET_KEY", prefix);

        let api_key = env::var(&api_key_var)
            .map_err(|_| ConfigError::MissingEnvironmentVariable(api_key_var))?;
        let secret_key = env::var(&secret_key_var)
            .map_err(|_| ConfigError::MissingEnvironmentVariable(secret_key_var))?;

        let mut config = Self::new(api_key, secret_key);
        if let Ok(rest_url) = env::var(format!("{}_REST_URL", prefix)) {
            config.rest_url = rest_url;
        }
        if let Ok(ws_url) = env::var(format!("{}_WS_URL", prefix)) {
            config.ws_url = ws_url;
        }
        if let Ok(tier) = env::var(format!("{}_TIER", prefix)) {
            config.tier = tier.parse()?;
        }

        Ok(config)
    }

    /// Create configuration from a `.env` file (if present) and the environment
    ///
    /// **Security Warning**: Never commit .env files to version control!
    #[cfg(feature = "env-file")]
    pub fn from_env_file(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_env_file_with_path(prefix, ".env")
    }

    #[cfg(feature = "env-file")]
    pub fn from_env_file_with_path(prefix: &str, env_file_path: &str) -> Result<Self, ConfigError> {
        match dotenv::from_path(env_file_path) {
            Ok(_) => {}
            Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {
                // No file, fall back to the process environment
            }
            Err(e) => {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "Failed to load .env file '{}': {}",
                    env_file_path, e
                )));
            }
        }

        Self::from_env(prefix)
    }

    #[must_use]
    pub fn has_credentials(&self) -> bool {
        !self.api_key.expose_secret().is_empty() && !self.secret_key.expose_secret().is_empty()
    }

    #[must_use]
    pub fn rest_url(mut self, rest_url: String) -> Self {
        self.rest_url = rest_url;
        self
    }

    #[must_use]
    pub fn ws_url(mut self, ws_url: String) -> Self {
        self.ws_url = ws_url;
        self
    }

    #[must_use]
    pub const fn tier(mut self, tier: AccountTier) -> Self {
        self.tier = tier;
        self
    }

    /// Get API key (use carefully - exposes secret)
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    /// Get secret key (use carefully - exposes secret)
    pub fn secret_key(&self) -> &str {
        self.secret_key.expose_secret()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvironmentVariable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NonceConfig {
    /// Added to wall-clock microseconds when a counter falls behind
    pub safety_buffer_us: i64,
    /// Seed offset between connections registered one after another
    pub registration_stagger_us: i64,
    /// How far ahead of wall-clock `reset()` pushes a counter
    pub reset_jump_us: i64,
    pub idle_ttl_secs: u64,
    /// Idle connections are swept every this many `next()` calls
    pub eviction_interval: u64,
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            safety_buffer_us: 1_500,
            registration_stagger_us: 1_000,
            reset_jump_us: 60_000_000,
            idle_ttl_secs: 3_600,
            eviction_interval: 1_000,
        }
    }
}

impl NonceConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

/// Budget cost and default priority of one operation type
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperationCost {
    pub cost: f64,
    pub priority: Priority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub tier: AccountTier,
    /// Overrides the tier preset when set
    pub max_counter: Option<f64>,
    pub decay_rate: Option<f64>,
    /// Fraction of the budget HIGH/CRITICAL may still dip into when over budget
    pub reserve_ratio: f64,
    /// Usage fraction above which the router leans on the stream
    pub prefer_streaming_usage: f64,
    pub throttle_event_threshold: usize,
    pub throttle_window_secs: u64,
    pub costs: HashMap<OperationType, OperationCost>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tier: AccountTier::Starter,
            max_counter: None,
            decay_rate: None,
            reserve_ratio: 0.9,
            prefer_streaming_usage: 0.5,
            throttle_event_threshold: 3,
            throttle_window_secs: 60,
            costs: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn for_tier(tier: AccountTier) -> Self {
        Self {
            tier,
            ..Self::default()
        }
    }

    pub fn max_counter(&self) -> f64 {
        self.max_counter.unwrap_or_else(|| self.tier.budget().0)
    }

    pub fn decay_rate(&self) -> f64 {
        self.decay_rate.unwrap_or_else(|| self.tier.budget().1)
    }

    /// Cost table lookup, falling back to the built-in defaults
    pub fn cost_of(&self, operation: OperationType) -> OperationCost {
        if let Some(cost) = self.costs.get(&operation) {
            return *cost;
        }

        let (cost, priority) = match operation {
            OperationType::AddOrder | OperationType::AddOrderBatch => (1.0, Priority::High),
            OperationType::CancelOrder | OperationType::CancelAll => (0.5, Priority::High),
            OperationType::Balance | OperationType::TradeBalance => (1.0, Priority::Medium),
            OperationType::OpenOrders
            | OperationType::OpenPositions
            | OperationType::QueryOrders => (1.0, Priority::Medium),
            OperationType::Ticker | OperationType::OrderBook | OperationType::SystemStatus => {
                (0.5, Priority::Low)
            }
            OperationType::TradesHistory
            | OperationType::Ledgers
            | OperationType::ClosedOrders
            | OperationType::Ohlc => (2.0, Priority::Low),
            _ => (1.0, Priority::Medium),
        };
        OperationCost { cost, priority }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    /// Rolling window for non-consecutive failures
    pub failure_window_secs: u64,
    pub recovery_timeout_ms: u64,
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window_secs: 60,
            recovery_timeout_ms: 30_000,
            success_threshold: 2,
        }
    }
}

impl BreakerConfig {
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub staleness_window_secs: u64,
    pub min_stream_success_rate: f64,
    pub success_window: usize,
    pub ewma_alpha: f64,
    /// A transport wins a hybrid decision when its EWMA is at most this share of the other
    pub latency_advantage_ratio: f64,
    pub cache_ttl_ms: u64,
    pub cache_capacity: usize,
    pub critical_timeout_secs: u64,
    pub high_timeout_secs: u64,
    pub medium_timeout_secs: u64,
    pub low_timeout_secs: u64,
    pub emergency_attempts: usize,
    pub emergency_backoff_ms: u64,
    /// Minimum gap between trial calls to a connected stream whose success rate is too low
    pub stream_trial_interval_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            staleness_window_secs: 60,
            min_stream_success_rate: 0.8,
            success_window: 50,
            ewma_alpha: 0.1,
            latency_advantage_ratio: 0.7,
            cache_ttl_ms: 3_000,
            cache_capacity: 1_024,
            critical_timeout_secs: 30,
            high_timeout_secs: 30,
            medium_timeout_secs: 20,
            low_timeout_secs: 15,
            emergency_attempts: 3,
            emergency_backoff_ms: 50,
            stream_trial_interval_ms: 5_000,
        }
    }
}

impl RouterConfig {
    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_window_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn stream_trial_interval(&self) -> Duration {
        Duration::from_millis(self.stream_trial_interval_ms)
    }

    pub fn call_timeout(&self, priority: Priority) -> Duration {
        let secs = match priority {
            Priority::Critical => self.critical_timeout_secs,
            Priority::High => self.high_timeout_secs,
            Priority::Medium => self.medium_timeout_secs,
            Priority::Low => self.low_timeout_secs,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub recovery_interval_ms: u64,
    pub max_recovery_attempts: u32,
    pub recovery_timeout_ms: u64,
    /// Pause between probe rounds inside one recovery attempt
    pub probe_interval_ms: u64,
    pub max_pending: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            recovery_interval_ms: 5_000,
            max_recovery_attempts: 5,
            recovery_timeout_ms: 60_000,
            probe_interval_ms: 250,
            max_pending: 1_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub balance_tolerance: f64,
    pub price_tolerance: f64,
    pub volume_tolerance: f64,
    pub orderbook_depth: usize,
    pub sweep_interval_secs: u64,
    pub critical_sweep_interval_secs: u64,
    pub pairs: Vec<String>,
    pub critical_pairs: Vec<String>,
    pub history_size: usize,
    pub systemic_threshold: u32,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            balance_tolerance: 1e-5,
            price_tolerance: 0.001,
            volume_tolerance: 0.01,
            orderbook_depth: 5,
            sweep_interval_secs: 60,
            critical_sweep_interval_secs: 10,
            pairs: Vec::new(),
            critical_pairs: Vec::new(),
            history_size: 100,
            systemic_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub queue_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 15,
            batch_timeout_ms: 250,
            queue_capacity: 256,
        }
    }
}

impl BatchConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

/// Every tunable of the resilience layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub nonce: NonceConfig,
    pub rate_limit: RateLimitConfig,
    pub breaker: BreakerConfig,
    pub router: RouterConfig,
    pub orchestrator: OrchestratorConfig,
    pub validator: ValidatorConfig,
    pub batch: BatchConfig,
}

impl ResilienceConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::InvalidConfiguration(msg.to_string()));

        if self.rate_limit.max_counter() <= 0.0 || self.rate_limit.decay_rate() <= 0.0 {
            return invalid("rate budget and decay rate must be positive");
        }
        if !(0.0..=1.0).contains(&self.rate_limit.reserve_ratio) {
            return invalid("reserve_ratio must be within [0, 1]");
        }
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return invalid("breaker thresholds must be at least 1");
        }
        if self.router.ewma_alpha <= 0.0 || self.router.ewma_alpha > 1.0 {
            return invalid("ewma_alpha must be within (0, 1]");
        }
        if self.nonce.safety_buffer_us <= 0 || self.nonce.reset_jump_us <= 0 {
            return invalid("nonce buffers must be positive");
        }
        if self.validator.orderbook_depth == 0 || self.validator.orderbook_depth > 5 {
            return invalid("orderbook_depth must be between 1 and 5");
        }
        if self.batch.batch_size == 0 {
            return invalid("batch_size must be at least 1");
        }
        Ok(())
    }
}
