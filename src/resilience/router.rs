//! Chooses a transport per operation and recovers from transport failures.

use crate::core::config::RouterConfig;
use crate::core::errors::{ConnectivityError, FailureKind};
use crate::core::traits::Transport;
use crate::core::types::{OperationRequest, OperationType, Priority, RouteClass, TransportKind};
use crate::resilience::cache::TtlCache;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::resilience::latency::{LatencyTracker, TransportMetricsSnapshot};
use crate::resilience::nonce::NonceSequencer;
use crate::resilience::rate_limit::RateLimitGovernor;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub rest_calls: u64,
    pub stream_calls: u64,
    pub fallback_count: u64,
    pub nonce_retries: u64,
    pub emergency_calls: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub rest: TransportMetricsSnapshot,
    pub stream: TransportMetricsSnapshot,
}

#[derive(Debug, Default)]
struct RouterCounters {
    rest_calls: AtomicU64,
    stream_calls: AtomicU64,
    fallback_count: AtomicU64,
    nonce_retries: AtomicU64,
    emergency_calls: AtomicU64,
}

pub struct TransportRouter {
    rest: Arc<dyn Transport>,
    stream: Arc<dyn Transport>,
    rest_breaker: Arc<CircuitBreaker>,
    stream_breaker: Arc<CircuitBreaker>,
    governor: Arc<RateLimitGovernor>,
    nonces: Arc<NonceSequencer>,
    latency: LatencyTracker,
    cache: TtlCache,
    config: RouterConfig,
    counters: RouterCounters,
    /// Last stream failure or trial; spaces out trials while the success rate is low
    stream_trial: Mutex<Instant>,
}

impl TransportRouter {
    pub fn new(
        rest: Arc<dyn Transport>,
        stream: Arc<dyn Transport>,
        rest_breaker: Arc<CircuitBreaker>,
        stream_breaker: Arc<CircuitBreaker>,
        governor: Arc<RateLimitGovernor>,
        nonces: Arc<NonceSequencer>,
        config: RouterConfig,
    ) -> Self {
        Self {
            rest,
            stream,
            rest_breaker,
            stream_breaker,
            governor,
            nonces,
            latency: LatencyTracker::new(config.ewma_alpha, config.success_window),
            cache: TtlCache::new(config.cache_ttl(), config.cache_capacity),
            config,
            counters: RouterCounters::default(),
            stream_trial: Mutex::new(Instant::now()),
        }
    }

    pub fn transport(&self, kind: TransportKind) -> &Arc<dyn Transport> {
        match kind {
            TransportKind::Rest => &self.rest,
            TransportKind::Stream => &self.stream,
        }
    }

    pub fn breaker(&self, kind: TransportKind) -> &Arc<CircuitBreaker> {
        match kind {
            TransportKind::Rest => &self.rest_breaker,
            TransportKind::Stream => &self.stream_breaker,
        }
    }

    pub fn latency(&self) -> &LatencyTracker {
        &self.latency
    }

    /// Route `operation`, serving snapshot reads from the short-lived cache
    #[instrument(skip_all, fields(operation = %operation, priority = %priority))]
    pub async fn execute(
        &self,
        operation: OperationType,
        params: Value,
        priority: Priority,
    ) -> Result<Value, ConnectivityError> {
        let request = OperationRequest::new(operation, params, priority);
        if operation.is_cacheable() {
            let key = request.cache_key();
            let (value, hit) = self
                .cache
                .get_or_fetch(&key, || self.dispatch(&request))
                .await?;
            if hit {
                debug!("Served from cache");
            }
            return Ok(value);
        }
        self.dispatch(&request).await
    }

    /// Critical-path execution while every breaker is open: skip breaker
    /// gating and the cache, retry with short jittered backoff.
    #[instrument(skip_all, fields(operation = %operation))]
    pub async fn execute_emergency(
        &self,
        operation: OperationType,
        params: Value,
        priority: Priority,
    ) -> Result<Value, ConnectivityError> {
        self.counters.emergency_calls.fetch_add(1, Ordering::Relaxed);
        let request = OperationRequest::new(operation, params, priority);
        let primary = self.emergency_target(operation);
        warn!(transport = %primary, "Emergency mode: bypassing circuit breakers");

        let strategy = ExponentialBackoff::from_millis(2)
            .factor((self.config.emergency_backoff_ms / 2).max(1))
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(self.config.emergency_attempts.saturating_sub(1));
        let request_ref = &request;
        let result = RetryIf::spawn(
            strategy,
            move || self.attempt_unguarded(primary, request_ref),
            |err: &ConnectivityError| err.failure_kind().is_some() && !err.is_terminal(),
        )
        .await;

        match result {
            Err(err) if err.allows_fallback() && self.fallback_permitted(operation, primary) => {
                let alternate = primary.alternate();
                self.counters.fallback_count.fetch_add(1, Ordering::Relaxed);
                self.attempt_unguarded(alternate, &request)
                    .await
                    .map_err(|e| ConnectivityError::exhausted(operation, alternate, e))
            }
            Err(err) if err.is_terminal() || err.failure_kind().is_none() => Err(err),
            Err(err) => Err(ConnectivityError::exhausted(operation, primary, err)),
            Ok(value) => Ok(value),
        }
    }

    /// Whether the stream is fit to serve reads and orders
    pub fn stream_healthy(&self) -> bool {
        self.stream_reachable()
            && self.latency.success_rate(TransportKind::Stream) >= self.config.min_stream_success_rate
    }

    /// Breaker closed, socket connected and messages fresh
    fn stream_reachable(&self) -> bool {
        if self.stream_breaker.state() != CircuitState::Closed {
            return false;
        }
        let health = self.stream.health();
        health.connected
            && health
                .last_message_age
                .map_or(false, |age| age < self.config.staleness_window())
    }

    /// Claim a trial call on a reachable stream whose success rate is below the
    /// minimum. At most one per `stream_trial_interval` since the last failure.
    fn claim_stream_trial(&self) -> bool {
        if !self.stream_reachable() {
            return false;
        }
        let mut last = self.stream_trial.lock();
        if last.elapsed() < self.config.stream_trial_interval() {
            return false;
        }
        *last = Instant::now();
        debug!("Trial call on low success-rate stream");
        true
    }

    /// Transport the route class selects for `operation` right now
    pub fn choose(&self, operation: OperationType) -> TransportKind {
        match operation.route_class() {
            RouteClass::RestOnly => TransportKind::Rest,
            RouteClass::StreamOnly => TransportKind::Stream,
            RouteClass::StreamPreferred => {
                if self.stream_healthy() || self.claim_stream_trial() {
                    TransportKind::Stream
                } else {
                    TransportKind::Rest
                }
            }
            RouteClass::Hybrid => {
                if !self.stream_healthy() {
                    return if self.claim_stream_trial() {
                        TransportKind::Stream
                    } else {
                        TransportKind::Rest
                    };
                }
                if self.governor.should_prefer_streaming() {
                    return TransportKind::Stream;
                }
                let ratio = self.config.latency_advantage_ratio;
                match (
                    self.latency.ewma_ms(TransportKind::Rest),
                    self.latency.ewma_ms(TransportKind::Stream),
                ) {
                    (Some(rest), Some(stream)) if rest <= ratio * stream => TransportKind::Rest,
                    _ => TransportKind::Stream,
                }
            }
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            rest_calls: self.counters.rest_calls.load(Ordering::Relaxed),
            stream_calls: self.counters.stream_calls.load(Ordering::Relaxed),
            fallback_count: self.counters.fallback_count.load(Ordering::Relaxed),
            nonce_retries: self.counters.nonce_retries.load(Ordering::Relaxed),
            emergency_calls: self.counters.emergency_calls.load(Ordering::Relaxed),
            cache_hits: self.cache.hits(),
            cache_misses: self.cache.misses(),
            rest: self.latency.snapshot(TransportKind::Rest),
            stream: self.latency.snapshot(TransportKind::Stream),
        }
    }

    fn fallback_permitted(&self, operation: OperationType, from: TransportKind) -> bool {
        match operation.route_class() {
            RouteClass::StreamPreferred | RouteClass::Hybrid => true,
            // REST-only operations never move to the stream
            RouteClass::RestOnly => from == TransportKind::Stream,
            RouteClass::StreamOnly => false,
        }
    }

    fn emergency_target(&self, operation: OperationType) -> TransportKind {
        match operation.route_class() {
            RouteClass::RestOnly => TransportKind::Rest,
            RouteClass::StreamOnly => TransportKind::Stream,
            RouteClass::StreamPreferred | RouteClass::Hybrid => {
                if self.stream.health().connected {
                    TransportKind::Stream
                } else {
                    TransportKind::Rest
                }
            }
        }
    }

    async fn dispatch(&self, request: &OperationRequest) -> Result<Value, ConnectivityError> {
        let operation = request.operation;
        let primary = self.choose(operation);

        match self.attempt(primary, request).await {
            Ok(value) => Ok(value),
            Err(err) if err.allows_fallback() && self.fallback_permitted(operation, primary) => {
                let alternate = primary.alternate();
                self.counters.fallback_count.fetch_add(1, Ordering::Relaxed);
                warn!(
                    operation = %operation,
                    from = %primary,
                    to = %alternate,
                    error = %err,
                    "Falling back to alternate transport"
                );
                self.attempt(alternate, request)
                    .await
                    .map_err(|e| Self::surface(operation, alternate, e))
            }
            Err(err) => Err(Self::surface(operation, primary, err)),
        }
    }

    /// Terminal and business errors pass through; exhausted recovery is wrapped
    fn surface(
        operation: OperationType,
        transport: TransportKind,
        err: ConnectivityError,
    ) -> ConnectivityError {
        if err.is_terminal() || err.failure_kind().is_none() {
            err
        } else {
            ConnectivityError::exhausted(operation, transport, err)
        }
    }

    async fn attempt(
        &self,
        kind: TransportKind,
        request: &OperationRequest,
    ) -> Result<Value, ConnectivityError> {
        let breaker = self.breaker(kind);
        if !breaker.can_execute() {
            return Err(ConnectivityError::unavailable(kind, "circuit open"));
        }

        if kind == TransportKind::Rest {
            let cost = self.governor.cost_of(request.operation);
            let max_wait = self.config.call_timeout(request.priority);
            if !self
                .governor
                .acquire_within(cost, request.priority, max_wait)
                .await
            {
                breaker.release_trial();
                return Err(ConnectivityError::RateLimitExceeded(format!(
                    "local budget exhausted for {}",
                    request.operation
                )));
            }
        }

        self.call_with_nonce_retry(kind, request).await
    }

    async fn attempt_unguarded(
        &self,
        kind: TransportKind,
        request: &OperationRequest,
    ) -> Result<Value, ConnectivityError> {
        if kind == TransportKind::Rest {
            let cost = self.governor.cost_of(request.operation);
            let max_wait = self.config.call_timeout(request.priority);
            if !self
                .governor
                .acquire_within(cost, request.priority, max_wait)
                .await
            {
                return Err(ConnectivityError::RateLimitExceeded(format!(
                    "local budget exhausted for {}",
                    request.operation
                )));
            }
        }
        self.call_with_nonce_retry(kind, request).await
    }

    async fn call_with_nonce_retry(
        &self,
        kind: TransportKind,
        request: &OperationRequest,
    ) -> Result<Value, ConnectivityError> {
        match self.call(kind, request, false).await {
            Err(ConnectivityError::NonceConflict {
                connection_id,
                expected_minimum,
                ..
            }) => {
                self.counters.nonce_retries.fetch_add(1, Ordering::Relaxed);
                info!(
                    transport = %kind,
                    connection = %connection_id,
                    ?expected_minimum,
                    "Nonce conflict, resetting sequence and retrying once"
                );
                self.nonces.reset_past(&connection_id, expected_minimum);
                self.call(kind, request, true).await
            }
            other => other,
        }
    }

    async fn call(
        &self,
        kind: TransportKind,
        request: &OperationRequest,
        is_retry: bool,
    ) -> Result<Value, ConnectivityError> {
        let transport = self.transport(kind);
        match kind {
            TransportKind::Rest => self.counters.rest_calls.fetch_add(1, Ordering::Relaxed),
            TransportKind::Stream => self.counters.stream_calls.fetch_add(1, Ordering::Relaxed),
        };

        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.config.call_timeout(request.priority),
            transport.send(request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ConnectivityError::Timeout {
                transport: kind,
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        };
        let failure = result.as_ref().err().and_then(ConnectivityError::failure_kind);
        self.record_outcome(kind, failure, started.elapsed(), is_retry);
        result
    }

    /// Feed a recovery probe's outcome to the breaker and the latency window
    pub fn record_probe(
        &self,
        kind: TransportKind,
        result: &Result<(), ConnectivityError>,
        elapsed: Duration,
    ) {
        let failure = result
            .as_ref()
            .err()
            .map(|e| e.failure_kind().unwrap_or(FailureKind::Network));
        self.record_outcome(kind, failure, elapsed, false);
    }

    fn record_outcome(
        &self,
        kind: TransportKind,
        failure: Option<FailureKind>,
        elapsed: Duration,
        is_retry: bool,
    ) {
        let breaker = self.breaker(kind);

        match failure {
            None => {
                let was_closed = breaker.state() == CircuitState::Closed;
                let below_minimum = kind == TransportKind::Stream
                    && self.latency.success_rate(kind) < self.config.min_stream_success_rate;
                breaker.record_success();
                self.latency.record(kind, elapsed, true);

                // A passed trial or a freshly closed breaker starts a clean window
                let reclosed = !was_closed && breaker.state() == CircuitState::Closed;
                if below_minimum || reclosed {
                    self.latency.reseed(kind);
                    info!(transport = %kind, "Success rate window reseeded");
                }
            }
            Some(kind_of_failure) => {
                if kind == TransportKind::Stream {
                    *self.stream_trial.lock() = Instant::now();
                }
                if kind_of_failure == FailureKind::RateLimited {
                    self.governor.record_throttle();
                }
                // A second conflict after a reset is a real fault
                let counted = if is_retry && kind_of_failure == FailureKind::NonceConflict {
                    FailureKind::Network
                } else {
                    kind_of_failure
                };
                breaker.record_failure(counted);
                self.latency.record(kind, elapsed, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ResilienceConfig;
    use crate::resilience::testing::router_fixture;
    use serde_json::json;

    fn no_cache() -> ResilienceConfig {
        let mut config = ResilienceConfig::default();
        config.router.cache_ttl_ms = 0;
        config
    }

    #[test]
    fn test_route_classes() {
        let f = router_fixture(&no_cache());
        assert_eq!(f.router.choose(OperationType::Ohlc), TransportKind::Rest);
        assert_eq!(f.router.choose(OperationType::Subscribe), TransportKind::Stream);
        assert_eq!(f.router.choose(OperationType::AddOrder), TransportKind::Stream);

        f.stream.connected.store(false, Ordering::SeqCst);
        assert!(!f.router.stream_healthy());
        assert_eq!(f.router.choose(OperationType::AddOrder), TransportKind::Rest);
        assert_eq!(f.router.choose(OperationType::OpenOrders), TransportKind::Rest);
    }

    #[test]
    fn test_hybrid_prefers_markedly_faster_rest() {
        let f = router_fixture(&no_cache());
        let latency = f.router.latency();
        latency.record(TransportKind::Rest, Duration::from_millis(10), true);
        latency.record(TransportKind::Stream, Duration::from_millis(100), true);
        assert_eq!(f.router.choose(OperationType::OpenPositions), TransportKind::Rest);

        // Within the advantage ratio the stream keeps the work
        let g = router_fixture(&no_cache());
        g.router
            .latency()
            .record(TransportKind::Rest, Duration::from_millis(90), true);
        g.router
            .latency()
            .record(TransportKind::Stream, Duration::from_millis(100), true);
        assert_eq!(g.router.choose(OperationType::OpenPositions), TransportKind::Stream);
    }

    #[tokio::test]
    async fn test_single_fallback_to_rest() {
        let f = router_fixture(&no_cache());
        f.stream.fail(true);

        let value = f
            .router
            .execute(OperationType::CancelOrder, json!({"txid": "O1"}), Priority::High)
            .await
            .unwrap();
        assert_eq!(value["transport"], "rest");
        assert_eq!(f.stream.calls(), 1);
        assert_eq!(f.rest.calls(), 1);
        assert_eq!(f.router.stats().fallback_count, 1);
    }

    #[tokio::test]
    async fn test_subscribe_never_falls_back() {
        let f = router_fixture(&no_cache());
        f.stream.fail(true);

        let err = f
            .router
            .execute(OperationType::Subscribe, json!({"topic": "ticker"}), Priority::Low)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectivityError::Exhausted {
                transport: TransportKind::Stream,
                ..
            }
        ));
        assert_eq!(f.rest.calls(), 0);
        assert_eq!(f.router.stats().fallback_count, 0);
    }

    #[tokio::test]
    async fn test_rest_only_failure_is_exhausted_without_stream_attempt() {
        let f = router_fixture(&no_cache());
        f.rest.fail(true);

        let err = f
            .router
            .execute(OperationType::Ledgers, json!({}), Priority::Low)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectivityError::Exhausted { .. }));
        assert_eq!(f.stream.calls(), 0);
        assert_eq!(f.router.breaker(TransportKind::Rest).snapshot().failure_count, 1);
    }

    #[tokio::test]
    async fn test_snapshot_reads_hit_cache() {
        let f = router_fixture(&ResilienceConfig::default());
        for _ in 0..3 {
            f.router
                .execute(OperationType::Ticker, json!({"pair": "BTC/USD"}), Priority::Low)
                .await
                .unwrap();
        }
        assert_eq!(f.stream.calls(), 1);
        let stats = f.router.stats();
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(stats.cache_misses, 1);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_transport() {
        let f = router_fixture(&no_cache());
        let breaker = f.router.breaker(TransportKind::Stream);
        for _ in 0..3 {
            breaker.record_failure(FailureKind::Network);
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let value = f
            .router
            .execute(OperationType::Balance, Value::Null, Priority::Medium)
            .await
            .unwrap();
        assert_eq!(value["transport"], "rest");
        assert_eq!(f.stream.calls(), 0);
    }

    #[tokio::test]
    async fn test_stream_regains_traffic_after_one_failure() {
        let mut config = no_cache();
        config.router.stream_trial_interval_ms = 20;
        let f = router_fixture(&config);
        f.stream.fail(true);

        let value = f
            .router
            .execute(OperationType::Balance, Value::Null, Priority::Medium)
            .await
            .unwrap();
        assert_eq!(value["transport"], "rest");
        assert_eq!(f.router.breaker(TransportKind::Stream).state(), CircuitState::Closed);
        assert!(!f.router.stream_healthy());

        f.stream.fail(false);
        // Trials are spaced from the last failure
        assert_eq!(f.router.choose(OperationType::Balance), TransportKind::Rest);

        tokio::time::sleep(Duration::from_millis(30)).await;
        for _ in 0..6 {
            let value = f
                .router
                .execute(OperationType::Balance, Value::Null, Priority::Medium)
                .await
                .unwrap();
            assert_eq!(value["transport"], "stream");
        }
        assert!(f.router.stream_healthy());
        assert_eq!(f.stream.calls(), 7);
        assert_eq!(f.rest.calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_trial_waits_for_next_interval() {
        let mut config = no_cache();
        config.router.stream_trial_interval_ms = 20;
        let f = router_fixture(&config);
        f.stream.fail(true);

        let _ = f
            .router
            .execute(OperationType::Balance, Value::Null, Priority::Medium)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Trial fails over to REST, then the stream is left alone again
        for _ in 0..2 {
            let value = f
                .router
                .execute(OperationType::Balance, Value::Null, Priority::Medium)
                .await
                .unwrap();
            assert_eq!(value["transport"], "rest");
        }
        assert_eq!(f.stream.calls(), 2);
        assert_eq!(f.rest.calls(), 3);
        assert_eq!(f.router.breaker(TransportKind::Stream).snapshot().failure_count, 2);
    }

    #[test]
    fn test_stale_stream_routes_to_rest() {
        let f = router_fixture(&no_cache());
        f.stream.set_message_age(Duration::from_secs(59));
        assert!(f.router.stream_healthy());
        assert_eq!(f.router.choose(OperationType::Balance), TransportKind::Stream);

        f.stream.set_message_age(Duration::from_secs(60));
        assert!(!f.router.stream_healthy());
        assert_eq!(f.router.choose(OperationType::Balance), TransportKind::Rest);
        assert_eq!(f.router.choose(OperationType::OpenOrders), TransportKind::Rest);
    }

    #[test]
    fn test_success_rate_gate_at_eighty_percent() {
        let f = router_fixture(&no_cache());
        let latency = f.router.latency();
        for _ in 0..4 {
            latency.record(TransportKind::Stream, Duration::from_millis(1), true);
        }
        latency.record(TransportKind::Stream, Duration::ZERO, false);
        assert!(f.router.stream_healthy());

        latency.record(TransportKind::Stream, Duration::ZERO, false);
        assert!(!f.router.stream_healthy());
        assert_eq!(f.router.choose(OperationType::AddOrder), TransportKind::Rest);
    }
}
