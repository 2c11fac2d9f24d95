//! Lifecycle owner of the resilience layer.
//!
//! `ConnectivityCore` builds every component once, shares them by `Arc`, and
//! owns the background tasks (recovery loop, breaker watcher, validation
//! sweeps, order batch flushing). `init()` starts them, `shutdown()` stops
//! them together.

use crate::core::config::{ExchangeConfig, ResilienceConfig};
use crate::core::errors::ConnectivityError;
use crate::core::kernel::{
    EnvelopeCodec, HmacSha512Signer, RestClientBuilder, RestClientConfig, TungsteniteWs, WsConfig,
};
use crate::core::traits::{BalanceSource, OrderSink, RiskGate, Transport};
use crate::core::types::{
    BalanceSnapshot, OperationRequest, OperationType, OrderRequest, Priority, PushEvent,
    PushTopic, ServiceLevel, TickerSnapshot, TransportKind,
};
use crate::resilience::batch::{OrderBatcher, OrderExecutor};
use crate::resilience::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
use crate::resilience::nonce::{NonceSequencer, NonceStats};
use crate::resilience::orchestrator::{FallbackOrchestrator, OrchestratorStats, RecoveryReport};
use crate::resilience::rate_limit::{Admission, GovernorStats, RateLimitGovernor, RateUsage};
use crate::resilience::router::{RouterStats, TransportRouter};
use crate::resilience::validator::{DataConsistencyValidator, ValidationResult, ValidatorStats};
use crate::transports::rest::RestTransport;
use crate::transports::stream::StreamTransport;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

const EXCHANGE_NAME: &str = "kraken";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const FORWARD_BUFFER: usize = 64;

/// Point-in-time health summary
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub level: ServiceLevel,
    pub override_level: Option<ServiceLevel>,
    pub rest_state: CircuitState,
    pub stream_state: CircuitState,
    pub rest_connected: bool,
    pub stream_connected: bool,
    pub stream_healthy: bool,
    pub pending_operations: usize,
    pub is_recovering: bool,
    pub rate_usage: RateUsage,
}

/// Everything the components count, in one serialisable value
#[derive(Debug, Clone, Serialize)]
pub struct CoreStatistics {
    pub service_level: ServiceLevel,
    pub router: RouterStats,
    pub governor: GovernorStats,
    pub rate_usage: RateUsage,
    pub breakers: Vec<BreakerSnapshot>,
    pub nonces: NonceStats,
    pub validator: ValidatorStats,
    pub orchestrator: OrchestratorStats,
}

pub struct ConnectivityCoreBuilder {
    config: ResilienceConfig,
    nonces: Arc<NonceSequencer>,
    rest: Option<Arc<dyn Transport>>,
    stream: Option<Arc<dyn Transport>>,
    risk_gate: Option<Arc<dyn RiskGate>>,
}

impl ConnectivityCoreBuilder {
    pub fn new(config: ResilienceConfig) -> Self {
        let nonces = Arc::new(NonceSequencer::new(config.nonce.clone()));
        Self {
            config,
            nonces,
            rest: None,
            stream: None,
            risk_gate: None,
        }
    }

    /// The sequencer the core will use; transports must share it
    pub fn nonce_sequencer(&self) -> Arc<NonceSequencer> {
        Arc::clone(&self.nonces)
    }

    #[must_use]
    pub fn with_rest_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.rest = Some(transport);
        self
    }

    #[must_use]
    pub fn with_stream_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.stream = Some(transport);
        self
    }

    #[must_use]
    pub fn with_risk_gate(mut self, gate: Arc<dyn RiskGate>) -> Self {
        self.risk_gate = Some(gate);
        self
    }

    pub fn build(self) -> Result<Arc<ConnectivityCore>, ConnectivityError> {
        self.config.validate()?;

        let missing = |kind: TransportKind| {
            ConnectivityError::unavailable(kind, "transport not configured")
        };
        let rest = self.rest.ok_or_else(|| missing(TransportKind::Rest))?;
        let stream = self.stream.ok_or_else(|| missing(TransportKind::Stream))?;

        let config = self.config;
        let governor = Arc::new(RateLimitGovernor::new(config.rate_limit.clone()));
        let rest_breaker = Arc::new(CircuitBreaker::new(
            TransportKind::Rest,
            config.breaker.clone(),
        ));
        let stream_breaker = Arc::new(CircuitBreaker::new(
            TransportKind::Stream,
            config.breaker.clone(),
        ));
        let router = Arc::new(TransportRouter::new(
            rest,
            stream,
            rest_breaker,
            stream_breaker,
            Arc::clone(&governor),
            Arc::clone(&self.nonces),
            config.router.clone(),
        ));
        let orchestrator = Arc::new(FallbackOrchestrator::new(
            router,
            config.orchestrator.clone(),
        ));
        let validator = Arc::new(DataConsistencyValidator::new(config.validator.clone()));
        let batcher = Arc::new(OrderBatcher::new(config.batch.clone()));
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(ConnectivityCore {
            config,
            nonces: self.nonces,
            governor,
            orchestrator,
            validator,
            batcher,
            risk_gate: self.risk_gate,
            shutdown,
            tasks: Mutex::new(JoinSet::new()),
            started: AtomicBool::new(false),
        }))
    }
}

pub struct ConnectivityCore {
    config: ResilienceConfig,
    nonces: Arc<NonceSequencer>,
    governor: Arc<RateLimitGovernor>,
    orchestrator: Arc<FallbackOrchestrator>,
    validator: Arc<DataConsistencyValidator>,
    batcher: Arc<OrderBatcher>,
    risk_gate: Option<Arc<dyn RiskGate>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
    started: AtomicBool,
}

impl ConnectivityCore {
    pub fn builder(config: ResilienceConfig) -> ConnectivityCoreBuilder {
        ConnectivityCoreBuilder::new(config)
    }

    /// Build a core wired to the exchange's real REST and WebSocket endpoints
    pub fn connect(
        exchange: &ExchangeConfig,
        config: ResilienceConfig,
    ) -> Result<Arc<Self>, ConnectivityError> {
        let builder = ConnectivityCoreBuilder::new(config);
        let nonces = builder.nonce_sequencer();

        let signer = Arc::new(HmacSha512Signer::new(
            exchange.api_key().to_string(),
            exchange.secret_key(),
        )?);
        let rest_config = RestClientConfig::new(exchange.rest_url.clone(), EXCHANGE_NAME.to_string())
            .with_timeout(30);
        let rest = RestClientBuilder::new(rest_config)
            .with_signer(signer)
            .build()?;

        let ws_config = WsConfig::default();
        let ws = TungsteniteWs::new(
            exchange.ws_url.clone(),
            EXCHANGE_NAME.to_string(),
            EnvelopeCodec::new(),
        )
        .with_config(ws_config.clone());

        builder
            .with_rest_transport(Arc::new(RestTransport::new(rest, Arc::clone(&nonces))))
            .with_stream_transport(Arc::new(StreamTransport::new(ws, nonces, ws_config)))
            .build()
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<FallbackOrchestrator> {
        &self.orchestrator
    }

    pub fn router(&self) -> &Arc<TransportRouter> {
        self.orchestrator.router()
    }

    pub fn validator(&self) -> &Arc<DataConsistencyValidator> {
        &self.validator
    }

    pub fn governor(&self) -> &Arc<RateLimitGovernor> {
        &self.governor
    }

    pub fn nonces(&self) -> &Arc<NonceSequencer> {
        &self.nonces
    }

    /// Start both transports and the background tasks.
    ///
    /// A transport that fails to start is recorded on its breaker; the core
    /// still comes up at the level the remaining transport supports. Only
    /// authentication failures abort initialisation.
    #[instrument(skip_all)]
    pub async fn init(self: &Arc<Self>) -> Result<(), ConnectivityError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        for kind in [TransportKind::Rest, TransportKind::Stream] {
            let transport = self.router().transport(kind);
            match transport.start().await {
                Ok(()) => info!(transport = %kind, "Transport started"),
                Err(e) => {
                    warn!(transport = %kind, error = %e, "Transport failed to start");
                    if let Some(failure) = e.failure_kind() {
                        self.router().breaker(kind).record_failure(failure);
                    }
                    if e.is_terminal() {
                        return Err(e);
                    }
                }
            }
        }
        let level = self.orchestrator.refresh_level();
        info!(%level, "Connectivity core initialised");

        let mut tasks = self.tasks.lock();
        tasks.spawn(Arc::clone(self).recovery_loop(self.shutdown.subscribe()));
        tasks.spawn(Arc::clone(self).breaker_watch(self.shutdown.subscribe()));
        tasks.spawn(Arc::clone(self).validation_loop(
            self.shutdown.subscribe(),
            self.config.validator.pairs.clone(),
            true,
            Duration::from_secs(self.config.validator.sweep_interval_secs.max(1)),
        ));
        if !self.config.validator.critical_pairs.is_empty() {
            tasks.spawn(Arc::clone(self).validation_loop(
                self.shutdown.subscribe(),
                self.config.validator.critical_pairs.clone(),
                false,
                Duration::from_secs(self.config.validator.critical_sweep_interval_secs.max(1)),
            ));
        }
        {
            let batcher = Arc::clone(&self.batcher);
            let executor: Arc<dyn OrderExecutor> = Arc::clone(&self.orchestrator) as _;
            let shutdown = self.shutdown.subscribe();
            tasks.spawn(async move { batcher.run(executor, shutdown).await });
        }
        Ok(())
    }

    /// Signal every background task, wait briefly, then abort stragglers
    #[instrument(skip_all)]
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let mut tasks = std::mem::take(&mut *self.tasks.lock());

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    if !e.is_cancelled() {
                        warn!(error = %e, "Background task failed");
                    }
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("Background tasks did not stop in time, aborting");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        for kind in [TransportKind::Stream, TransportKind::Rest] {
            self.router().transport(kind).stop().await;
        }
        info!("Connectivity core stopped");
    }

    async fn recovery_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.orchestrator.recovery_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }

            let degraded = self.orchestrator.derived_level() != ServiceLevel::FullService;
            if !degraded && self.orchestrator.pending_count() == 0 {
                continue;
            }
            let timeout = self.config.orchestrator.recovery_timeout();
            match tokio::time::timeout(timeout, self.orchestrator.attempt_recovery()).await {
                Ok(RecoveryReport::Completed {
                    level,
                    replayed,
                    remaining,
                }) => debug!(%level, replayed, remaining, "Recovery pass finished"),
                Ok(RecoveryReport::AlreadyRunning) => {}
                Err(_) => warn!(timeout_ms = timeout.as_millis() as u64, "Recovery pass timed out"),
            }
        }
    }

    /// Republish the service level whenever either breaker changes state
    async fn breaker_watch(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut rest = self.router().breaker(TransportKind::Rest).subscribe();
        let mut stream = self.router().breaker(TransportKind::Stream).subscribe();
        loop {
            let changed = tokio::select! {
                _ = shutdown.changed() => break,
                changed = rest.changed() => changed,
                changed = stream.changed() => changed,
            };
            if changed.is_err() {
                break;
            }
            self.orchestrator.refresh_level();
        }
    }

    async fn validation_loop(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        pairs: Vec<String>,
        include_balance: bool,
        period: Duration,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }
            let results = self.validate_now(&pairs, include_balance).await;
            let invalid = results.iter().filter(|r| !r.is_valid).count();
            debug!(checked = results.len(), invalid, "Validation sweep finished");
        }
    }

    /// Compare REST and stream snapshots of balances (optionally), tickers
    /// and books for `pairs`. REST snapshots are refreshed at LOW priority
    /// when the rate budget allows it; otherwise the last fetched ones are used.
    pub async fn validate_now(
        &self,
        pairs: &[String],
        include_balance: bool,
    ) -> Vec<ValidationResult> {
        let rest = Arc::clone(self.router().transport(TransportKind::Rest));
        let stream = Arc::clone(self.router().transport(TransportKind::Stream));
        let mut results = Vec::new();

        if include_balance {
            self.refresh_rest_snapshot(rest.as_ref(), OperationType::Balance, Value::Null)
                .await;
            results.push(self.validator.validate_balance(
                rest.balance_snapshot().as_ref(),
                stream.balance_snapshot().as_ref(),
            ));
        }

        let depth = self.config.validator.orderbook_depth;
        for pair in pairs {
            self.refresh_rest_snapshot(rest.as_ref(), OperationType::Ticker, json!({ "pair": pair }))
                .await;
            results.push(self.validator.validate_price(
                pair,
                rest.ticker_snapshot(pair).as_ref(),
                stream.ticker_snapshot(pair).as_ref(),
            ));

            self.refresh_rest_snapshot(
                rest.as_ref(),
                OperationType::OrderBook,
                json!({ "pair": pair, "count": depth }),
            )
            .await;
            results.push(self.validator.validate_orderbook(
                pair,
                rest.orderbook_snapshot(pair).as_ref(),
                stream.orderbook_snapshot(pair).as_ref(),
                depth,
            ));
        }
        results
    }

    async fn refresh_rest_snapshot(
        &self,
        rest: &dyn Transport,
        operation: OperationType,
        params: Value,
    ) {
        let breaker = self.router().breaker(TransportKind::Rest);
        if breaker.state() != CircuitState::Closed {
            return;
        }
        let cost = self.governor.cost_of(operation);
        if !matches!(self.governor.try_acquire(cost, Priority::Low), Admission::Granted) {
            debug!(%operation, "Skipping REST refresh, rate budget exhausted");
            return;
        }
        let request = OperationRequest::new(operation, params, Priority::Low);
        if let Err(e) = rest.send(&request).await {
            debug!(%operation, error = %e, "REST refresh for validation failed");
        }
    }

    /// Route one operation through the orchestrator
    pub async fn execute(
        &self,
        operation: OperationType,
        params: Value,
        priority: Priority,
    ) -> Result<Value, ConnectivityError> {
        self.orchestrator.execute(operation, params, priority).await
    }

    /// `execute` with the operation's default priority from the cost table
    pub async fn request(
        &self,
        operation: OperationType,
        params: Value,
    ) -> Result<Value, ConnectivityError> {
        let priority = self.config.rate_limit.cost_of(operation).priority;
        self.execute(operation, params, priority).await
    }

    /// Queue an order for batched submission
    pub async fn submit_order(&self, order: OrderRequest) -> Result<Value, ConnectivityError> {
        self.check_risk(&order)?;
        self.batcher.submit(order).await
    }

    fn check_risk(&self, order: &OrderRequest) -> Result<(), ConnectivityError> {
        let Some(gate) = &self.risk_gate else {
            return Ok(());
        };
        gate.check_order(order)
            .map_err(|reason| {
                warn!(pair = %order.pair, reason = %reason, "Order vetoed by risk gate");
                ConnectivityError::OperationRejected {
                    operation: OperationType::AddOrder,
                    reason,
                }
            })
    }

    pub async fn subscribe_balance(
        &self,
    ) -> Result<mpsc::Receiver<BalanceSnapshot>, ConnectivityError> {
        let events = self.subscribe(PushTopic::Balances).await?;
        Ok(self.forward(events, |event| match event {
            PushEvent::Balance(snapshot) => Some(snapshot),
            _ => None,
        }))
    }

    pub async fn subscribe_ticker(
        &self,
        symbols: Vec<String>,
    ) -> Result<mpsc::Receiver<TickerSnapshot>, ConnectivityError> {
        let events = self.subscribe(PushTopic::Ticker(symbols)).await?;
        Ok(self.forward(events, |event| match event {
            PushEvent::Ticker(ticker) => Some(ticker),
            _ => None,
        }))
    }

    async fn subscribe(
        &self,
        topic: PushTopic,
    ) -> Result<mpsc::Receiver<PushEvent>, ConnectivityError> {
        self.router()
            .transport(TransportKind::Stream)
            .subscribe(topic)
            .await
    }

    fn forward<T: Send + 'static>(
        &self,
        mut events: mpsc::Receiver<PushEvent>,
        pick: fn(PushEvent) -> Option<T>,
    ) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(FORWARD_BUFFER);
        let mut shutdown = self.shutdown.subscribe();
        self.tasks.lock().spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => event,
                };
                let Some(event) = event else {
                    break;
                };
                let Some(item) = pick(event) else {
                    continue;
                };
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    pub fn service_status(&self) -> ServiceStatus {
        let router = self.router();
        ServiceStatus {
            level: self.orchestrator.service_level(),
            override_level: self.orchestrator.override_level(),
            rest_state: router.breaker(TransportKind::Rest).state(),
            stream_state: router.breaker(TransportKind::Stream).state(),
            rest_connected: router.transport(TransportKind::Rest).health().connected,
            stream_connected: router.transport(TransportKind::Stream).health().connected,
            stream_healthy: router.stream_healthy(),
            pending_operations: self.orchestrator.pending_count(),
            is_recovering: self.orchestrator.is_recovering(),
            rate_usage: self.governor.usage(),
        }
    }

    pub fn statistics(&self) -> CoreStatistics {
        let router = self.router();
        CoreStatistics {
            service_level: self.orchestrator.service_level(),
            router: router.stats(),
            governor: self.governor.stats(),
            rate_usage: self.governor.usage(),
            breakers: vec![
                router.breaker(TransportKind::Rest).snapshot(),
                router.breaker(TransportKind::Stream).snapshot(),
            ],
            nonces: self.nonces.stats(),
            validator: self.validator.stats(),
            orchestrator: self.orchestrator.stats(),
        }
    }
}

#[async_trait]
impl BalanceSource for ConnectivityCore {
    async fn balances(&self) -> Result<BalanceSnapshot, ConnectivityError> {
        let value = self
            .execute(OperationType::Balance, Value::Null, Priority::Medium)
            .await?;
        BalanceSnapshot::from_value(&value)
            .ok_or_else(|| ConnectivityError::Protocol("balance payload is not an object".into()))
    }
}

#[async_trait]
impl OrderSink for ConnectivityCore {
    async fn place_order(&self, order: OrderRequest) -> Result<Value, ConnectivityError> {
        self.check_risk(&order)?;
        self.execute(OperationType::AddOrder, order.to_params(), Priority::High)
            .await
    }

    async fn cancel_order(&self, order_id: &str) -> Result<Value, ConnectivityError> {
        self.execute(
            OperationType::CancelOrder,
            json!({ "txid": order_id }),
            Priority::Critical,
        )
        .await
    }

    async fn cancel_all(&self) -> Result<Value, ConnectivityError> {
        self.execute(OperationType::CancelAll, Value::Null, Priority::Critical)
            .await
    }
}
