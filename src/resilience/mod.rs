pub mod batch;
pub mod cache;
pub mod circuit_breaker;
pub mod core;
pub mod latency;
pub mod nonce;
pub mod orchestrator;
pub mod rate_limit;
pub mod router;
#[cfg(test)]
pub(crate) mod testing;
pub mod validator;

pub use batch::{OrderBatcher, OrderExecutor};
pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
pub use self::core::{ConnectivityCore, ConnectivityCoreBuilder, CoreStatistics, ServiceStatus};
pub use nonce::{NonceSequencer, NonceStats};
pub use orchestrator::{FallbackOrchestrator, PendingOperation, RecoveryReport};
pub use rate_limit::{Admission, RateLimitGovernor, RateUsage};
pub use router::{RouterStats, TransportRouter};
pub use validator::{DataConsistencyValidator, ValidationResult};
