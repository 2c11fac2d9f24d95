use crate::core::{
    errors::ConnectivityError,
    types::{
        BalanceSnapshot, OperationRequest, OrderBookSnapshot, OrderRequest, PushEvent, PushTopic,
        TickerSnapshot, TransportHealth, TransportKind,
    },
};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Capability interface shared by the request channel and the streaming channel
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which channel this backend implements
    fn kind(&self) -> TransportKind;

    /// Identity used for nonce sequencing on this transport
    fn connection_id(&self) -> String;

    /// Execute one operation and return the exchange's result payload
    async fn send(&self, request: &OperationRequest) -> Result<Value, ConnectivityError>;

    /// Current liveness, cheap and non-blocking
    fn health(&self) -> TransportHealth;

    /// Lightweight round-trip used by the recovery loop
    async fn probe(&self) -> Result<(), ConnectivityError>;

    /// Start background I/O (connection, reader task)
    async fn start(&self) -> Result<(), ConnectivityError> {
        Ok(())
    }

    /// Stop background I/O
    async fn stop(&self) {}

    /// Last balance seen on this transport, used by validation sweeps
    fn balance_snapshot(&self) -> Option<BalanceSnapshot> {
        None
    }

    fn ticker_snapshot(&self, _pair: &str) -> Option<TickerSnapshot> {
        None
    }

    fn orderbook_snapshot(&self, _pair: &str) -> Option<OrderBookSnapshot> {
        None
    }

    /// Register for pushed updates
    async fn subscribe(
        &self,
        topic: PushTopic,
    ) -> Result<mpsc::Receiver<PushEvent>, ConnectivityError> {
        Err(ConnectivityError::unavailable(
            self.kind(),
            format!("push topic '{}' not supported", topic.channel()),
        ))
    }
}

/// Source of account balances for the strategy layer
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn balances(&self) -> Result<BalanceSnapshot, ConnectivityError>;
}

/// Order entry for the strategy layer
#[async_trait]
pub trait OrderSink: Send + Sync {
    async fn place_order(&self, order: OrderRequest) -> Result<Value, ConnectivityError>;

    async fn cancel_order(&self, order_id: &str) -> Result<Value, ConnectivityError>;

    async fn cancel_all(&self) -> Result<Value, ConnectivityError>;
}

/// Pre-trade check consulted before every order placement
pub trait RiskGate: Send + Sync {
    /// `Err(reason)` vetoes the order
    fn check_order(&self, order: &OrderRequest) -> Result<(), String>;
}
