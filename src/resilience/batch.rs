//! Coalesces order placements into batch submissions.
//!
//! Orders queue on a bounded channel; a flush happens when `batch_size`
//! orders are waiting or `batch_timeout` has passed since the first one.
//! Orders for different pairs are never mixed in one batch.

use crate::core::config::BatchConfig;
use crate::core::errors::ConnectivityError;
use crate::core::types::{OperationType, OrderRequest, Priority};
use crate::resilience::orchestrator::FallbackOrchestrator;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Where flushed batches are sent
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn execute(
        &self,
        operation: OperationType,
        params: Value,
        priority: Priority,
    ) -> Result<Value, ConnectivityError>;
}

#[async_trait]
impl OrderExecutor for FallbackOrchestrator {
    async fn execute(
        &self,
        operation: OperationType,
        params: Value,
        priority: Priority,
    ) -> Result<Value, ConnectivityError> {
        FallbackOrchestrator::execute(self, operation, params, priority).await
    }
}

struct BatchItem {
    order: OrderRequest,
    reply: oneshot::Sender<Result<Value, ConnectivityError>>,
}

pub struct OrderBatcher {
    tx: mpsc::Sender<BatchItem>,
    rx: Mutex<Option<mpsc::Receiver<BatchItem>>>,
    config: BatchConfig,
}

impl OrderBatcher {
    pub fn new(config: BatchConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            config,
        }
    }

    /// Queue one order and wait for its share of the batch result
    pub async fn submit(&self, order: OrderRequest) -> Result<Value, ConnectivityError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(BatchItem { order, reply })
            .await
            .map_err(|_| ConnectivityError::OperationRejected {
                operation: OperationType::AddOrder,
                reason: "order batcher is not running".to_string(),
            })?;

        response
            .await
            .map_err(|_| ConnectivityError::OperationRejected {
                operation: OperationType::AddOrder,
                reason: "order batcher stopped before flushing".to_string(),
            })?
    }

    /// Flush loop; runs until `shutdown` flips to `true`
    pub async fn run(&self, executor: Arc<dyn OrderExecutor>, mut shutdown: watch::Receiver<bool>) {
        let Some(mut rx) = self.rx.lock().take() else {
            warn!("Order batcher already running");
            return;
        };

        loop {
            let first = tokio::select! {
                _ = shutdown.changed() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let mut batch = vec![first];
            let deadline = tokio::time::sleep(self.config.batch_timeout());
            tokio::pin!(deadline);
            while batch.len() < self.config.batch_size {
                tokio::select! {
                    () = &mut deadline => break,
                    item = rx.recv() => match item {
                        Some(item) => batch.push(item),
                        None => break,
                    },
                }
            }

            Self::flush(executor.as_ref(), batch).await;
        }

        rx.close();
        while let Some(item) = rx.recv().await {
            let _ = item.reply.send(Err(ConnectivityError::OperationRejected {
                operation: OperationType::AddOrder,
                reason: "shutting down".to_string(),
            }));
        }
    }

    async fn flush(executor: &dyn OrderExecutor, batch: Vec<BatchItem>) {
        let mut by_pair: BTreeMap<String, Vec<BatchItem>> = BTreeMap::new();
        for item in batch {
            by_pair.entry(item.order.pair.clone()).or_default().push(item);
        }

        for (pair, mut items) in by_pair {
            if items.len() == 1 {
                if let Some(item) = items.pop() {
                    let result = executor
                        .execute(OperationType::AddOrder, item.order.to_params(), Priority::High)
                        .await;
                    let _ = item.reply.send(result);
                }
                continue;
            }

            debug!(pair = %pair, size = items.len(), "Flushing order batch");
            let orders: Vec<Value> = items
                .iter()
                .map(|item| {
                    let mut params = item.order.to_params();
                    if let Some(map) = params.as_object_mut() {
                        map.remove("pair");
                    }
                    params
                })
                .collect();
            let params = json!({ "pair": pair, "orders": orders });

            match executor
                .execute(OperationType::AddOrderBatch, params, Priority::High)
                .await
            {
                Ok(result) => {
                    let per_order = result
                        .get("orders")
                        .and_then(Value::as_array)
                        .filter(|entries| entries.len() == items.len())
                        .cloned();
                    for (index, item) in items.into_iter().enumerate() {
                        let share = per_order
                            .as_ref()
                            .and_then(|entries| entries.get(index).cloned())
                            .unwrap_or_else(|| result.clone());
                        let _ = item.reply.send(Ok(share));
                    }
                }
                Err(err) => {
                    warn!(pair = %pair, error = %err, "Order batch failed");
                    for item in items {
                        let _ = item.reply.send(Err(err.duplicate()));
                    }
                }
            }
        }
    }
}
