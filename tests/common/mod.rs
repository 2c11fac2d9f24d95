#![allow(dead_code)]

use async_trait::async_trait;
use lotuslink::core::config::ResilienceConfig;
use lotuslink::core::errors::{ConnectivityError, FailureKind};
use lotuslink::core::traits::{RiskGate, Transport};
use lotuslink::core::types::{
    OperationRequest, OperationType, OrderRequest, TransportHealth, TransportKind,
};
use lotuslink::{ConnectivityCore, ConnectivityCoreBuilder};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Transport double with scripted replies and a call log
pub struct MockTransport {
    kind: TransportKind,
    connection_id: String,
    connected: AtomicBool,
    failing: AtomicBool,
    probe_ok: AtomicBool,
    probes: AtomicUsize,
    probe_delay_ms: AtomicU64,
    message_age_ms: AtomicU64,
    script: Mutex<VecDeque<Result<Value, ConnectivityError>>>,
    calls: Mutex<Vec<OperationRequest>>,
}

impl MockTransport {
    pub fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            connection_id: format!("{}:mock", kind),
            connected: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            probe_ok: AtomicBool::new(true),
            probes: AtomicUsize::new(0),
            probe_delay_ms: AtomicU64::new(0),
            message_age_ms: AtomicU64::new(0),
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Queue a reply for the next `send`; unscripted sends use the default
    pub fn push_result(&self, result: Result<Value, ConnectivityError>) {
        self.script.lock().push_back(result);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_probe_ok(&self, ok: bool) {
        self.probe_ok.store(ok, Ordering::SeqCst);
    }

    /// Make `probe` take this long before answering
    pub fn set_probe_delay(&self, delay: Duration) {
        self.probe_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Age reported for the last inbound message while connected
    pub fn set_message_age(&self, age: Duration) {
        self.message_age_ms
            .store(age.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn operations(&self) -> Vec<OperationType> {
        self.calls.lock().iter().map(|r| r.operation).collect()
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }

    async fn send(&self, request: &OperationRequest) -> Result<Value, ConnectivityError> {
        self.calls.lock().push(request.clone());
        if let Some(result) = self.script.lock().pop_front() {
            return result;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConnectivityError::unavailable(self.kind, "socket closed"));
        }
        Ok(json!({
            "transport": self.kind.as_str(),
            "operation": request.operation.as_str(),
            "ZUSD": "1000.00",
        }))
    }

    fn health(&self) -> TransportHealth {
        let connected = self.connected.load(Ordering::SeqCst);
        TransportHealth {
            connected,
            last_message_age: connected
                .then(|| Duration::from_millis(self.message_age_ms.load(Ordering::SeqCst))),
        }
    }

    async fn probe(&self) -> Result<(), ConnectivityError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let delay = self.probe_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.probe_ok.load(Ordering::SeqCst) {
            self.failing.store(false, Ordering::SeqCst);
            Ok(())
        } else {
            Err(ConnectivityError::unavailable(self.kind, "probe failed"))
        }
    }
}

/// Deterministic config: no cache, fast emergency backoff, stream health by
/// breaker state and freshness only
pub fn test_config() -> ResilienceConfig {
    let mut config = default_gates_config();
    config.router.min_stream_success_rate = 0.0;
    config
}

/// No cache and fast backoff, but the default stream success-rate gate
pub fn default_gates_config() -> ResilienceConfig {
    let mut config = ResilienceConfig::default();
    config.router.cache_ttl_ms = 0;
    config.router.emergency_backoff_ms = 2;
    config.orchestrator.probe_interval_ms = 1;
    config
}

pub struct Harness {
    pub core: Arc<ConnectivityCore>,
    pub rest: Arc<MockTransport>,
    pub stream: Arc<MockTransport>,
}

pub fn harness(config: ResilienceConfig) -> Harness {
    harness_with_gate(config, None)
}

pub fn harness_with_gate(config: ResilienceConfig, gate: Option<Arc<dyn RiskGate>>) -> Harness {
    let rest = MockTransport::new(TransportKind::Rest);
    let stream = MockTransport::new(TransportKind::Stream);
    let mut builder = ConnectivityCoreBuilder::new(config)
        .with_rest_transport(rest.clone())
        .with_stream_transport(stream.clone());
    if let Some(gate) = gate {
        builder = builder.with_risk_gate(gate);
    }
    let core = builder.build().expect("core builds");
    Harness { core, rest, stream }
}

/// Open a breaker the way live traffic would
pub fn trip(core: &ConnectivityCore, kind: TransportKind) {
    let breaker = core.router().breaker(kind);
    for _ in 0..core.config().breaker.failure_threshold {
        breaker.record_failure(FailureKind::Network);
    }
}

pub struct PairBlocklist(pub Vec<String>);

impl RiskGate for PairBlocklist {
    fn check_order(&self, order: &OrderRequest) -> Result<(), String> {
        if self.0.contains(&order.pair) {
            Err(format!("{} is blocked", order.pair))
        } else {
            Ok(())
        }
    }
}
