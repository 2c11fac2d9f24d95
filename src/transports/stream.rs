//! Streaming channel: one long-lived WebSocket session owned by a driver task.
//!
//! Requests are correlated by `req_id`. Pushed balances, tickers, books and
//! executions are cached for snapshot reads and fanned out to subscribers.

use crate::core::errors::ConnectivityError;
use crate::core::kernel::codec::{EnvelopeCodec, StreamMessage};
use crate::core::kernel::ws::{WsConfig, WsSession};
use crate::core::traits::Transport;
use crate::core::types::{
    decimal_from_value, BalanceSnapshot, BookLevel, OperationRequest, OperationType,
    OrderBookSnapshot, PushEvent, PushTopic, TickerSnapshot, TransportHealth, TransportKind,
};
use crate::resilience::nonce::NonceSequencer;
use async_trait::async_trait;
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use nonzero_ext::nonzero;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

const COMMAND_BUFFER: usize = 256;
const SUBSCRIBER_BUFFER: usize = 64;
const EXECUTION_HISTORY: usize = 100;

type Reply = oneshot::Sender<Result<Value, ConnectivityError>>;

enum Command {
    Send {
        method: String,
        params: Value,
        req_id: u64,
    },
    Reconnect(oneshot::Sender<Result<(), ConnectivityError>>),
    Close,
}

struct Subscriber {
    topic: PushTopic,
    tx: mpsc::Sender<PushEvent>,
}

/// State shared between the transport handle and its driver task
struct StreamShared {
    connection_id: String,
    connected: AtomicBool,
    last_message_at: Mutex<Option<Instant>>,
    pending: Mutex<HashMap<u64, Reply>>,
    next_req_id: AtomicU64,
    balance: RwLock<Option<BalanceSnapshot>>,
    tickers: RwLock<HashMap<String, TickerSnapshot>>,
    books: RwLock<HashMap<String, OrderBookSnapshot>>,
    executions: RwLock<VecDeque<Value>>,
    subscribers: Mutex<Vec<Subscriber>>,
    topics: Mutex<Vec<PushTopic>>,
}

/// Removes an abandoned request from the pending map
struct PendingGuard<'a> {
    shared: &'a StreamShared,
    req_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().remove(&self.req_id);
    }
}

fn subscribe_params(topic: &PushTopic) -> Value {
    let symbols = topic.symbols();
    if symbols.is_empty() {
        json!({ "channel": topic.channel() })
    } else {
        json!({ "channel": topic.channel(), "symbol": symbols })
    }
}

fn parse_book_levels(levels: Option<&Value>) -> Vec<BookLevel> {
    levels
        .and_then(Value::as_array)
        .map(|levels| {
            levels
                .iter()
                .filter_map(|level| {
                    Some(BookLevel {
                        price: decimal_from_value(level.get("price")?)?,
                        volume: decimal_from_value(level.get("qty")?)?,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Apply level updates; zero volume removes a level
fn merge_levels(book: &mut Vec<BookLevel>, updates: Vec<BookLevel>, descending: bool) {
    for update in updates {
        book.retain(|level| level.price != update.price);
        if !update.volume.is_zero() {
            book.push(update);
        }
    }
    if descending {
        book.sort_by(|a, b| b.price.cmp(&a.price));
    } else {
        book.sort_by(|a, b| a.price.cmp(&b.price));
    }
}

impl StreamShared {
    fn fail_request(&self, req_id: u64, error: ConnectivityError) {
        if let Some(reply) = self.pending.lock().remove(&req_id) {
            let _ = reply.send(Err(error));
        }
    }

    fn fail_all(&self, reason: &str) {
        let drained: Vec<Reply> = self.pending.lock().drain().map(|(_, reply)| reply).collect();
        for reply in drained {
            let _ = reply.send(Err(ConnectivityError::unavailable(TransportKind::Stream, reason)));
        }
    }

    fn handle(&self, message: StreamMessage) {
        *self.last_message_at.lock() = Some(Instant::now());
        match message {
            StreamMessage::Heartbeat => {}
            StreamMessage::Response {
                req_id,
                success,
                result,
                error,
                method,
            } => {
                let Some(req_id) = req_id else {
                    debug!(method = %method, "Response without req_id");
                    return;
                };
                let Some(reply) = self.pending.lock().remove(&req_id) else {
                    return;
                };
                let outcome = match (success, error) {
                    (true, _) => Ok(result),
                    (false, Some(info)) => Err(info.into_error(&self.connection_id)),
                    (false, None) => Err(ConnectivityError::Protocol(format!(
                        "{} failed without error details",
                        method
                    ))),
                };
                let _ = reply.send(outcome);
            }
            StreamMessage::Error { req_id, info } => {
                let error = info.into_error(&self.connection_id);
                match req_id {
                    Some(req_id) => self.fail_request(req_id, error),
                    None => warn!(error = %error, "Unsolicited stream error"),
                }
            }
            StreamMessage::Push { channel, kind, data } => self.handle_push(&channel, &kind, &data),
        }
    }

    fn handle_push(&self, channel: &str, kind: &str, data: &Value) {
        let entries = data.as_array().cloned().unwrap_or_default();
        let snapshot = kind == "snapshot";
        match channel {
            "balances" => {
                let mut guard = self.balance.write();
                let mut balances = match (&*guard, snapshot) {
                    (Some(current), false) => current.balances.clone(),
                    _ => Default::default(),
                };
                for entry in &entries {
                    let asset = entry.get("asset").and_then(Value::as_str);
                    let amount = entry.get("balance").and_then(decimal_from_value);
                    if let (Some(asset), Some(amount)) = (asset, amount) {
                        balances.insert(asset.to_string(), amount);
                    }
                }
                let next = BalanceSnapshot::new(balances);
                *guard = Some(next.clone());
                drop(guard);
                self.publish(PushEvent::Balance(next));
            }
            "ticker" => {
                for entry in &entries {
                    let field = |name: &str| entry.get(name).and_then(decimal_from_value);
                    let (Some(pair), Some(last), Some(bid), Some(ask)) = (
                        entry.get("symbol").and_then(Value::as_str),
                        field("last"),
                        field("bid"),
                        field("ask"),
                    ) else {
                        continue;
                    };
                    let ticker = TickerSnapshot {
                        pair: pair.to_string(),
                        last,
                        bid,
                        ask,
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    };
                    self.tickers.write().insert(pair.to_string(), ticker.clone());
                    self.publish(PushEvent::Ticker(ticker));
                }
            }
            "book" => {
                for entry in &entries {
                    let Some(pair) = entry.get("symbol").and_then(Value::as_str) else {
                        continue;
                    };
                    let bids = parse_book_levels(entry.get("bids"));
                    let asks = parse_book_levels(entry.get("asks"));
                    let mut books = self.books.write();
                    let book = books.entry(pair.to_string()).or_insert_with(|| OrderBookSnapshot {
                        pair: pair.to_string(),
                        bids: Vec::new(),
                        asks: Vec::new(),
                        timestamp: 0,
                    });
                    if snapshot {
                        book.bids.clear();
                        book.asks.clear();
                    }
                    merge_levels(&mut book.bids, bids, true);
                    merge_levels(&mut book.asks, asks, false);
                    book.timestamp = chrono::Utc::now().timestamp_millis();
                    let published = book.clone();
                    drop(books);
                    self.publish(PushEvent::Book(published));
                }
            }
            "executions" => {
                let mut executions = self.executions.write();
                for entry in &entries {
                    executions.push_back(entry.clone());
                    while executions.len() > EXECUTION_HISTORY {
                        executions.pop_front();
                    }
                }
                drop(executions);
                for entry in entries {
                    self.publish(PushEvent::Execution(entry));
                }
            }
            other => debug!(channel = other, "Ignoring push on unknown channel"),
        }
    }

    fn publish(&self, event: PushEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| {
            if !event.matches(&subscriber.topic) {
                return !subscriber.tx.is_closed();
            }
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(channel = subscriber.topic.channel(), "Subscriber lagging, dropping update");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// Streaming transport over any [`WsSession`] speaking the envelope codec
pub struct StreamTransport<S: WsSession<EnvelopeCodec> + 'static> {
    shared: Arc<StreamShared>,
    nonces: Arc<NonceSequencer>,
    config: WsConfig,
    session: Mutex<Option<S>>,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl<S: WsSession<EnvelopeCodec> + 'static> StreamTransport<S> {
    pub fn new(session: S, nonces: Arc<NonceSequencer>, config: WsConfig) -> Self {
        Self::with_connection_id(session, nonces, config, "ws:primary")
    }

    pub fn with_connection_id(
        session: S,
        nonces: Arc<NonceSequencer>,
        config: WsConfig,
        connection_id: impl Into<String>,
    ) -> Self {
        Self {
            shared: Arc::new(StreamShared {
                connection_id: connection_id.into(),
                connected: AtomicBool::new(false),
                last_message_at: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_req_id: AtomicU64::new(1),
                balance: RwLock::new(None),
                tickers: RwLock::new(HashMap::new()),
                books: RwLock::new(HashMap::new()),
                executions: RwLock::new(VecDeque::new()),
                subscribers: Mutex::new(Vec::new()),
                topics: Mutex::new(Vec::new()),
            }),
            nonces,
            config,
            session: Mutex::new(Some(session)),
            commands: Mutex::new(None),
            driver: Mutex::new(None),
        }
    }

    fn command_sender(&self) -> Result<mpsc::Sender<Command>, ConnectivityError> {
        self.commands
            .lock()
            .clone()
            .ok_or_else(|| ConnectivityError::unavailable(TransportKind::Stream, "stream not started"))
    }

    /// Send one request envelope and wait for the correlated response
    async fn request(&self, method: &str, params: Value) -> Result<Value, ConnectivityError> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(ConnectivityError::unavailable(
                TransportKind::Stream,
                "stream disconnected",
            ));
        }
        let commands = self.command_sender()?;
        let req_id = self.shared.next_req_id.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();
        self.shared.pending.lock().insert(req_id, reply);
        let _guard = PendingGuard {
            shared: &self.shared,
            req_id,
        };

        commands
            .send(Command::Send {
                method: method.to_string(),
                params,
                req_id,
            })
            .await
            .map_err(|_| ConnectivityError::unavailable(TransportKind::Stream, "stream driver stopped"))?;

        response.await.map_err(|_| {
            ConnectivityError::unavailable(TransportKind::Stream, "request dropped by stream driver")
        })?
    }

    fn with_nonce(&self, params: &Value) -> Value {
        let mut params = if params.is_object() {
            params.clone()
        } else {
            json!({})
        };
        params["nonce"] = json!(self.nonces.next(&self.shared.connection_id));
        params
    }

    fn method_for(operation: OperationType) -> &'static str {
        match operation {
            OperationType::AddOrderBatch => "batch_add",
            other => other.as_str(),
        }
    }

    async fn reconnect(&self) -> Result<(), ConnectivityError> {
        let commands = self.command_sender()?;
        let (reply, result) = oneshot::channel();
        commands
            .send(Command::Reconnect(reply))
            .await
            .map_err(|_| ConnectivityError::unavailable(TransportKind::Stream, "stream driver stopped"))?;
        result.await.map_err(|_| {
            ConnectivityError::unavailable(TransportKind::Stream, "stream driver stopped")
        })?
    }
}

async fn drive<S: WsSession<EnvelopeCodec>>(
    mut session: S,
    mut commands: mpsc::Receiver<Command>,
    shared: Arc<StreamShared>,
    config: WsConfig,
) {
    let frames = NonZeroU32::new(config.max_frames_per_second).unwrap_or(nonzero!(50u32));
    let limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock> =
        RateLimiter::direct(Quota::per_second(frames));
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval());
    heartbeat.tick().await;

    loop {
        if !session.is_connected() {
            if shared.connected.swap(false, Ordering::AcqRel) {
                warn!(connection = %shared.connection_id, "Stream disconnected");
            }
            shared.fail_all("stream disconnected");

            match commands.recv().await {
                None | Some(Command::Close) => break,
                Some(Command::Send { req_id, .. }) => shared.fail_request(
                    req_id,
                    ConnectivityError::unavailable(TransportKind::Stream, "stream disconnected"),
                ),
                Some(Command::Reconnect(reply)) => {
                    let result = session.connect().await;
                    if result.is_ok() {
                        shared.connected.store(true, Ordering::Release);
                        *shared.last_message_at.lock() = Some(Instant::now());
                        info!(connection = %shared.connection_id, "Stream connected");
                        let topics = shared.topics.lock().clone();
                        for topic in topics {
                            let req_id = shared.next_req_id.fetch_add(1, Ordering::Relaxed);
                            limiter.until_ready().await;
                            if let Err(e) = session
                                .send_request("subscribe", &subscribe_params(&topic), req_id)
                                .await
                            {
                                warn!(channel = topic.channel(), error = %e, "Resubscribe failed");
                            }
                        }
                    }
                    let _ = reply.send(result);
                }
            }
            continue;
        }

        tokio::select! {
            command = commands.recv() => match command {
                None | Some(Command::Close) => {
                    let _ = session.close().await;
                    break;
                }
                Some(Command::Reconnect(reply)) => {
                    let _ = reply.send(Ok(()));
                }
                Some(Command::Send { method, params, req_id }) => {
                    limiter.until_ready().await;
                    if let Err(e) = session.send_request(&method, &params, req_id).await {
                        shared.fail_request(req_id, e);
                    }
                }
            },
            incoming = session.next_message() => match incoming {
                Some(Ok(message)) => shared.handle(message),
                Some(Err(e)) => warn!(error = %e, "Stream receive error"),
                None => debug!("Stream closed by peer"),
            },
            _ = heartbeat.tick() => {
                let req_id = shared.next_req_id.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = session.send_request("ping", &Value::Null, req_id).await {
                    warn!(error = %e, "Heartbeat failed");
                }
            }
        }
    }

    shared.connected.store(false, Ordering::Release);
    shared.fail_all("stream stopped");
    debug!(connection = %shared.connection_id, "Stream driver exited");
}

#[async_trait]
impl<S: WsSession<EnvelopeCodec> + 'static> Transport for StreamTransport<S> {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn connection_id(&self) -> String {
        self.shared.connection_id.clone()
    }

    #[instrument(skip(self, request), fields(operation = %request.operation))]
    async fn send(&self, request: &OperationRequest) -> Result<Value, ConnectivityError> {
        match request.operation {
            OperationType::Balance => self
                .balance_snapshot()
                .map(|snapshot| snapshot.to_value())
                .ok_or_else(|| {
                    ConnectivityError::unavailable(TransportKind::Stream, "no balance snapshot yet")
                }),
            OperationType::Ticker => {
                let pair = request.param_str("pair").unwrap_or_default();
                let ticker = self.ticker_snapshot(pair).ok_or_else(|| {
                    ConnectivityError::unavailable(
                        TransportKind::Stream,
                        format!("no ticker snapshot for {}", pair),
                    )
                })?;
                Ok(serde_json::to_value(ticker)?)
            }
            OperationType::Executions => {
                Ok(Value::Array(self.shared.executions.read().iter().cloned().collect()))
            }
            OperationType::Subscribe => {
                let params = request.params.clone();
                self.request("subscribe", params).await
            }
            operation if operation.is_order_action() => {
                let params = self.with_nonce(&request.params);
                self.request(Self::method_for(operation), params).await
            }
            operation => self.request(Self::method_for(operation), request.params.clone()).await,
        }
    }

    fn health(&self) -> TransportHealth {
        TransportHealth {
            connected: self.shared.connected.load(Ordering::Acquire),
            last_message_age: self.shared.last_message_at.lock().map(|at| at.elapsed()),
        }
    }

    async fn probe(&self) -> Result<(), ConnectivityError> {
        if !self.shared.connected.load(Ordering::Acquire) {
            self.reconnect().await?;
            // A fresh session starts a new nonce epoch
            self.nonces.reset(&self.shared.connection_id);
        }
        self.request("ping", Value::Null).await.map(|_| ())
    }

    async fn start(&self) -> Result<(), ConnectivityError> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        *self.commands.lock() = Some(tx);
        let handle = tokio::spawn(drive(
            session,
            rx,
            Arc::clone(&self.shared),
            self.config.clone(),
        ));
        *self.driver.lock() = Some(handle);
        self.reconnect().await
    }

    async fn stop(&self) {
        let commands = self.commands.lock().take();
        if let Some(commands) = commands {
            let _ = commands.send(Command::Close).await;
        }
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                warn!(error = %e, "Stream driver task failed");
            }
        }
    }

    fn balance_snapshot(&self) -> Option<BalanceSnapshot> {
        self.shared.balance.read().clone()
    }

    fn ticker_snapshot(&self, pair: &str) -> Option<TickerSnapshot> {
        self.shared.tickers.read().get(pair).cloned()
    }

    fn orderbook_snapshot(&self, pair: &str) -> Option<OrderBookSnapshot> {
        self.shared.books.read().get(pair).cloned()
    }

    async fn subscribe(
        &self,
        topic: PushTopic,
    ) -> Result<mpsc::Receiver<PushEvent>, ConnectivityError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.shared.subscribers.lock().push(Subscriber {
            topic: topic.clone(),
            tx,
        });

        let newly_requested = {
            let mut topics = self.shared.topics.lock();
            if topics.contains(&topic) {
                false
            } else {
                topics.push(topic.clone());
                true
            }
        };
        if newly_requested && self.shared.connected.load(Ordering::Acquire) {
            self.request("subscribe", subscribe_params(&topic)).await?;
        }
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message;

    /// In-memory session: frames queued by the test, requests answered inline
    struct ScriptedSession {
        connected: bool,
        inbound: mpsc::UnboundedReceiver<StreamMessage>,
        outbound: mpsc::UnboundedSender<(String, Value, u64)>,
        echo: mpsc::UnboundedSender<StreamMessage>,
    }

    #[async_trait]
    impl WsSession<EnvelopeCodec> for ScriptedSession {
        async fn connect(&mut self) -> Result<(), ConnectivityError> {
            self.connected = true;
            Ok(())
        }

        async fn send_raw(&mut self, _msg: Message) -> Result<(), ConnectivityError> {
            Ok(())
        }

        async fn next_raw(&mut self) -> Option<Result<Message, ConnectivityError>> {
            None
        }

        async fn close(&mut self) -> Result<(), ConnectivityError> {
            self.connected = false;
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        async fn send_request(
            &mut self,
            method: &str,
            params: &Value,
            req_id: u64,
        ) -> Result<(), ConnectivityError> {
            let _ = self.outbound.send((method.to_string(), params.clone(), req_id));
            let reply = if method == "add_order" && params["pair"] == "FAIL/USD" {
                StreamMessage::Response {
                    method: method.to_string(),
                    req_id: Some(req_id),
                    success: false,
                    result: Value::Null,
                    error: Some(crate::core::kernel::codec::StreamErrorInfo {
                        code: None,
                        message: "EGeneral:Invalid nonce".to_string(),
                        nonce_info: None,
                    }),
                }
            } else {
                StreamMessage::Response {
                    method: method.to_string(),
                    req_id: Some(req_id),
                    success: true,
                    result: json!({ "echo": method }),
                    error: None,
                }
            };
            let _ = self.echo.send(reply);
            Ok(())
        }

        async fn next_message(&mut self) -> Option<Result<StreamMessage, ConnectivityError>> {
            self.inbound.recv().await.map(Ok)
        }
    }

    fn scripted() -> (
        StreamTransport<ScriptedSession>,
        mpsc::UnboundedSender<StreamMessage>,
        mpsc::UnboundedReceiver<(String, Value, u64)>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let session = ScriptedSession {
            connected: false,
            inbound: inbound_rx,
            outbound: outbound_tx,
            echo: inbound_tx.clone(),
        };
        let transport = StreamTransport::new(
            session,
            Arc::new(NonceSequencer::default()),
            WsConfig::default(),
        );
        (transport, inbound_tx, outbound_rx)
    }

    #[tokio::test]
    async fn test_request_response_correlation() {
        let (transport, _inbound, mut outbound) = scripted();
        transport.start().await.unwrap();
        assert!(transport.health().connected);

        let request = OperationRequest::new(
            OperationType::AddOrder,
            json!({"pair": "BTC/USD"}),
            crate::core::types::Priority::High,
        );
        let result = transport.send(&request).await.unwrap();
        assert_eq!(result["echo"], "add_order");

        let (method, params, _) = outbound.recv().await.unwrap();
        assert_eq!(method, "add_order");
        assert!(params["nonce"].as_i64().is_some());
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_failed_response_maps_to_nonce_conflict() {
        let (transport, _inbound, _outbound) = scripted();
        transport.start().await.unwrap();
        let request = OperationRequest::new(
            OperationType::AddOrder,
            json!({"pair": "FAIL/USD"}),
            crate::core::types::Priority::High,
        );
        let err = transport.send(&request).await.unwrap_err();
        assert!(matches!(err, ConnectivityError::NonceConflict { .. }));
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_pushes_update_snapshots_and_subscribers() {
        let (transport, inbound, _outbound) = scripted();
        transport.start().await.unwrap();
        let mut tickers = transport
            .subscribe(PushTopic::Ticker(vec!["BTC/USD".to_string()]))
            .await
            .unwrap();

        inbound
            .send(StreamMessage::Push {
                channel: "ticker".to_string(),
                kind: "update".to_string(),
                data: json!([{"symbol": "BTC/USD", "last": 50000.5, "bid": 50000.0, "ask": 50001.0}]),
            })
            .unwrap();
        inbound
            .send(StreamMessage::Push {
                channel: "balances".to_string(),
                kind: "snapshot".to_string(),
                data: json!([{"asset": "USD", "balance": 1000.25}]),
            })
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), tickers.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, PushEvent::Ticker(ref t) if t.pair == "BTC/USD"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let balance = transport
            .send(&OperationRequest::new(
                OperationType::Balance,
                Value::Null,
                crate::core::types::Priority::Medium,
            ))
            .await
            .unwrap();
        assert_eq!(balance["USD"], "1000.25");
        transport.stop().await;
    }

    #[tokio::test]
    async fn test_send_before_start_is_unavailable() {
        let (transport, _inbound, _outbound) = scripted();
        let request = OperationRequest::new(
            OperationType::CancelAll,
            Value::Null,
            crate::core::types::Priority::Critical,
        );
        let err = transport.send(&request).await.unwrap_err();
        assert!(err.allows_fallback());
    }

    #[test]
    fn test_book_merge_removes_zero_levels() {
        let level = |price: &str, volume: &str| BookLevel {
            price: price.parse().unwrap(),
            volume: volume.parse().unwrap(),
        };
        let mut bids = vec![level("100", "1"), level("99", "2")];
        merge_levels(&mut bids, vec![level("99", "0"), level("101", "1")], true);
        assert_eq!(bids.len(), 2);
        assert_eq!(bids[0].price, "101".parse().unwrap());
    }
}
