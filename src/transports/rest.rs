use crate::core::errors::ConnectivityError;
use crate::core::kernel::rest::RestClient;
use crate::core::traits::Transport;
use crate::core::types::{
    decimal_from_value, BalanceSnapshot, BookLevel, OperationRequest, OperationType,
    OrderBookSnapshot, TickerSnapshot, TransportHealth, TransportKind,
};
use crate::resilience::nonce::NonceSequencer;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{instrument, warn};

/// `(private, path)` for each operation served over REST
fn endpoint(operation: OperationType) -> Option<(bool, &'static str)> {
    let route = match operation {
        OperationType::Balance => (true, "/0/private/Balance"),
        OperationType::TradeBalance => (true, "/0/private/TradeBalance"),
        OperationType::Ticker => (false, "/0/public/Ticker"),
        OperationType::OrderBook => (false, "/0/public/Depth"),
        OperationType::OpenOrders => (true, "/0/private/OpenOrders"),
        OperationType::ClosedOrders => (true, "/0/private/ClosedOrders"),
        OperationType::QueryOrders => (true, "/0/private/QueryOrders"),
        OperationType::OpenPositions => (true, "/0/private/OpenPositions"),
        OperationType::Executions | OperationType::TradesHistory => {
            (true, "/0/private/TradesHistory")
        }
        OperationType::AddOrder => (true, "/0/private/AddOrder"),
        OperationType::AddOrderBatch => (true, "/0/private/AddOrderBatch"),
        OperationType::CancelOrder => (true, "/0/private/CancelOrder"),
        OperationType::CancelAll => (true, "/0/private/CancelAll"),
        OperationType::Ledgers => (true, "/0/private/Ledgers"),
        OperationType::Ohlc => (false, "/0/public/OHLC"),
        OperationType::TradeVolume => (true, "/0/private/TradeVolume"),
        OperationType::DepositMethods => (true, "/0/private/DepositMethods"),
        OperationType::DepositAddresses => (true, "/0/private/DepositAddresses"),
        OperationType::Withdraw => (true, "/0/private/Withdraw"),
        OperationType::WithdrawStatus => (true, "/0/private/WithdrawStatus"),
        OperationType::SystemStatus => (false, "/0/public/SystemStatus"),
        OperationType::Subscribe | OperationType::Unsubscribe => return None,
    };
    Some(route)
}

/// Flatten request params into form/query pairs; nested values are sent as JSON
fn form_fields(params: &Value) -> Vec<(String, String)> {
    let Some(map) = params.as_object() else {
        return Vec::new();
    };
    map.iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| {
            let encoded = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => other.to_string(),
            };
            (key.clone(), encoded)
        })
        .collect()
}

fn parse_ticker(pair: &str, entry: &Value) -> Option<TickerSnapshot> {
    let first = |field: &str| entry.get(field).and_then(|v| v.get(0)).and_then(decimal_from_value);
    Some(TickerSnapshot {
        pair: pair.to_string(),
        last: first("c")?,
        bid: first("b")?,
        ask: first("a")?,
        timestamp: chrono::Utc::now().timestamp_millis(),
    })
}

fn parse_levels(levels: Option<&Value>) -> Vec<BookLevel> {
    levels
        .and_then(Value::as_array)
        .map(|levels| {
            levels
                .iter()
                .filter_map(|level| {
                    Some(BookLevel {
                        price: decimal_from_value(level.get(0)?)?,
                        volume: decimal_from_value(level.get(1)?)?,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Request/response channel over the exchange's HTTP API
pub struct RestTransport<R: RestClient> {
    client: R,
    nonces: Arc<NonceSequencer>,
    connection_id: String,
    last_success: Mutex<Option<Instant>>,
    balance: RwLock<Option<BalanceSnapshot>>,
    tickers: RwLock<HashMap<String, TickerSnapshot>>,
    books: RwLock<HashMap<String, OrderBookSnapshot>>,
}

impl<R: RestClient> RestTransport<R> {
    pub fn new(client: R, nonces: Arc<NonceSequencer>) -> Self {
        Self::with_connection_id(client, nonces, "rest:primary")
    }

    pub fn with_connection_id(
        client: R,
        nonces: Arc<NonceSequencer>,
        connection_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            nonces,
            connection_id: connection_id.into(),
            last_success: Mutex::new(None),
            balance: RwLock::new(None),
            tickers: RwLock::new(HashMap::new()),
            books: RwLock::new(HashMap::new()),
        }
    }

    /// Unwrap the `{error: [...], result: ...}` envelope
    fn unwrap_envelope(&self, body: Value, nonce: Option<i64>) -> Result<Value, ConnectivityError> {
        let first_error = body
            .get("error")
            .and_then(Value::as_array)
            .and_then(|errors| errors.first())
            .and_then(Value::as_str);

        if let Some(message) = first_error {
            let err = ConnectivityError::from_exchange_message(
                message,
                TransportKind::Rest,
                &self.connection_id,
            );
            return Err(match err {
                ConnectivityError::NonceConflict {
                    connection_id,
                    expected_minimum,
                    ..
                } => ConnectivityError::NonceConflict {
                    connection_id,
                    provided: nonce,
                    expected_minimum,
                },
                other => other,
            });
        }

        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    fn remember(&self, request: &OperationRequest, result: &Value) {
        match request.operation {
            OperationType::Balance => {
                if let Some(snapshot) = BalanceSnapshot::from_value(result) {
                    *self.balance.write() = Some(snapshot);
                }
            }
            OperationType::Ticker => {
                let Some(map) = result.as_object() else {
                    return;
                };
                let requested = request.param_str("pair");
                let mut tickers = self.tickers.write();
                for (key, entry) in map {
                    // Single-pair answers are stored under the name the caller used
                    let pair = match requested {
                        Some(pair) if map.len() == 1 => pair,
                        _ => key.as_str(),
                    };
                    if let Some(ticker) = parse_ticker(pair, entry) {
                        tickers.insert(pair.to_string(), ticker);
                    }
                }
            }
            OperationType::OrderBook => {
                let Some((key, entry)) = result.as_object().and_then(|map| map.iter().next()) else {
                    return;
                };
                let pair = request.param_str("pair").unwrap_or(key).to_string();
                let book = OrderBookSnapshot {
                    pair: pair.clone(),
                    bids: parse_levels(entry.get("bids")),
                    asks: parse_levels(entry.get("asks")),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                };
                self.books.write().insert(pair, book);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl<R: RestClient> Transport for RestTransport<R> {
    fn kind(&self) -> TransportKind {
        TransportKind::Rest
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }

    #[instrument(skip(self, request), fields(operation = %request.operation))]
    async fn send(&self, request: &OperationRequest) -> Result<Value, ConnectivityError> {
        let (private, path) = endpoint(request.operation).ok_or_else(|| {
            ConnectivityError::unavailable(
                TransportKind::Rest,
                format!("{} is not served over REST", request.operation),
            )
        })?;
        let fields = form_fields(&request.params);

        let (body, nonce) = if private {
            let nonce = self.nonces.next(&self.connection_id);
            (self.client.signed_post(path, &fields, nonce).await?, Some(nonce))
        } else {
            let query: Vec<(&str, &str)> = fields
                .iter()
                .map(|(key, value)| (key.as_str(), value.as_str()))
                .collect();
            (self.client.get(path, &query).await?, None)
        };

        let result = self.unwrap_envelope(body, nonce)?;
        *self.last_success.lock() = Some(Instant::now());
        self.remember(request, &result);
        Ok(result)
    }

    fn health(&self) -> TransportHealth {
        TransportHealth {
            connected: true,
            last_message_age: self.last_success.lock().map(|at| at.elapsed()),
        }
    }

    async fn probe(&self) -> Result<(), ConnectivityError> {
        let body = self.client.get("/0/public/SystemStatus", &[]).await?;
        let result = self.unwrap_envelope(body, None)?;
        match result.get("status").and_then(Value::as_str) {
            Some("online") | None => {
                *self.last_success.lock() = Some(Instant::now());
                Ok(())
            }
            Some(status) => {
                warn!(status, "Exchange reports degraded system status");
                Err(ConnectivityError::unavailable(
                    TransportKind::Rest,
                    format!("system status is {}", status),
                ))
            }
        }
    }

    fn balance_snapshot(&self) -> Option<BalanceSnapshot> {
        self.balance.read().clone()
    }

    fn ticker_snapshot(&self, pair: &str) -> Option<TickerSnapshot> {
        self.tickers.read().get(pair).cloned()
    }

    fn orderbook_snapshot(&self, pair: &str) -> Option<OrderBookSnapshot> {
        self.books.read().get(pair).cloned()
    }
}
