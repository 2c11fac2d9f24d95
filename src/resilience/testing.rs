//! In-crate transport double for router and orchestrator unit tests.

use crate::core::config::ResilienceConfig;
use crate::core::errors::ConnectivityError;
use crate::core::traits::Transport;
use crate::core::types::{OperationRequest, TransportHealth, TransportKind};
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::nonce::NonceSequencer;
use crate::resilience::rate_limit::RateLimitGovernor;
use crate::resilience::router::TransportRouter;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct StubTransport {
    kind: TransportKind,
    pub connected: AtomicBool,
    pub failing: AtomicBool,
    pub calls: AtomicUsize,
    message_age_ms: AtomicU64,
}

impl StubTransport {
    pub fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            connected: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            message_age_ms: AtomicU64::new(0),
        })
    }

    pub fn set_message_age(&self, age: Duration) {
        self.message_age_ms
            .store(age.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for StubTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn connection_id(&self) -> String {
        format!("{}:stub", self.kind)
    }

    async fn send(&self, request: &OperationRequest) -> Result<Value, ConnectivityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConnectivityError::unavailable(self.kind, "stub down"));
        }
        Ok(json!({
            "transport": self.kind.as_str(),
            "operation": request.operation.as_str(),
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
        if self.failing.load(Ordering::SeqCst) {
            Err(ConnectivityError::unavailable(self.kind, "stub probe failed"))
        } else {
            Ok(())
        }
    }
}

pub(crate) struct RouterFixture {
    pub router: Arc<TransportRouter>,
    pub rest: Arc<StubTransport>,
    pub stream: Arc<StubTransport>,
}

pub(crate) fn router_fixture(config: &ResilienceConfig) -> RouterFixture {
    let rest = StubTransport::new(TransportKind::Rest);
    let stream = StubTransport::new(TransportKind::Stream);
    let router = Arc::new(TransportRouter::new(
        rest.clone(),
        stream.clone(),
        Arc::new(CircuitBreaker::new(TransportKind::Rest, config.breaker.clone())),
        Arc::new(CircuitBreaker::new(TransportKind::Stream, config.breaker.clone())),
        Arc::new(RateLimitGovernor::new(config.rate_limit.clone())),
        Arc::new(NonceSequencer::new(config.nonce.clone())),
        config.router.clone(),
    ));
    RouterFixture {
        router,
        rest,
        stream,
    }
}
