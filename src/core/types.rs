use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// The two channels to the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Rest,
    Stream,
}

impl TransportKind {
    pub fn alternate(self) -> Self {
        match self {
            Self::Rest => Self::Stream,
            Self::Stream => Self::Rest,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rest => "rest",
            Self::Stream => "stream",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation priority, ordered `Low < Medium < High < Critical`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

/// How the router is allowed to place an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// Only the request channel serves it
    RestOnly,
    /// Stream first when healthy, REST otherwise
    StreamPreferred,
    /// Decided by rate pressure and latency
    Hybrid,
    /// Stream only, never falls back
    StreamOnly,
}

/// Endpoint groups used by the service-level allow-lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointCategory {
    Critical,
    DegradedRead,
    Standard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Balance,
    TradeBalance,
    Ticker,
    OrderBook,
    OpenOrders,
    ClosedOrders,
    QueryOrders,
    OpenPositions,
    Executions,
    AddOrder,
    AddOrderBatch,
    CancelOrder,
    CancelAll,
    TradesHistory,
    Ledgers,
    Ohlc,
    TradeVolume,
    DepositMethods,
    DepositAddresses,
    Withdraw,
    WithdrawStatus,
    SystemStatus,
    Subscribe,
    Unsubscribe,
}

impl OperationType {
    pub fn route_class(self) -> RouteClass {
        match self {
            Self::Balance
            | Self::Ticker
            | Self::AddOrder
            | Self::AddOrderBatch
            | Self::CancelOrder
            | Self::CancelAll
            | Self::QueryOrders
            | Self::Executions => RouteClass::StreamPreferred,
            Self::OpenOrders | Self::OpenPositions => RouteClass::Hybrid,
            Self::Subscribe | Self::Unsubscribe => RouteClass::StreamOnly,
            Self::TradeBalance
            | Self::OrderBook
            | Self::ClosedOrders
            | Self::TradesHistory
            | Self::Ledgers
            | Self::Ohlc
            | Self::TradeVolume
            | Self::DepositMethods
            | Self::DepositAddresses
            | Self::Withdraw
            | Self::WithdrawStatus
            | Self::SystemStatus => RouteClass::RestOnly,
        }
    }

    pub fn category(self) -> EndpointCategory {
        match self {
            Self::Balance
            | Self::TradeBalance
            | Self::OpenOrders
            | Self::CancelOrder
            | Self::CancelAll
            | Self::SystemStatus => EndpointCategory::Critical,
            Self::Ticker | Self::ClosedOrders => EndpointCategory::DegradedRead,
            _ => EndpointCategory::Standard,
        }
    }

    /// Snapshot reads that may be served from the router cache
    pub fn is_cacheable(self) -> bool {
        matches!(self, Self::Balance | Self::TradeBalance | Self::Ticker)
    }

    pub fn is_order_action(self) -> bool {
        matches!(
            self,
            Self::AddOrder | Self::AddOrderBatch | Self::CancelOrder | Self::CancelAll
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Balance => "balance",
            Self::TradeBalance => "trade_balance",
            Self::Ticker => "ticker",
            Self::OrderBook => "order_book",
            Self::OpenOrders => "open_orders",
            Self::ClosedOrders => "closed_orders",
            Self::QueryOrders => "query_orders",
            Self::OpenPositions => "open_positions",
            Self::Executions => "executions",
            Self::AddOrder => "add_order",
            Self::AddOrderBatch => "add_order_batch",
            Self::CancelOrder => "cancel_order",
            Self::CancelAll => "cancel_all",
            Self::TradesHistory => "trades_history",
            Self::Ledgers => "ledgers",
            Self::Ohlc => "ohlc",
            Self::TradeVolume => "trade_volume",
            Self::DepositMethods => "deposit_methods",
            Self::DepositAddresses => "deposit_addresses",
            Self::Withdraw => "withdraw",
            Self::WithdrawStatus => "withdraw_status",
            Self::SystemStatus => "system_status",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate health classification gating which operations are permitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceLevel {
    FullService,
    DegradedService,
    EmergencyOnly,
    ServiceOutage,
}

impl ServiceLevel {
    pub fn allows(self, category: EndpointCategory) -> bool {
        match (self, category) {
            (_, EndpointCategory::Critical) | (Self::FullService, _) => true,
            (Self::DegradedService, EndpointCategory::DegradedRead) => true,
            _ => false,
        }
    }

    /// Higher is healthier
    pub fn rank(self) -> u8 {
        match self {
            Self::ServiceOutage => 0,
            Self::EmergencyOnly => 1,
            Self::DegradedService => 2,
            Self::FullService => 3,
        }
    }
}

impl fmt::Display for ServiceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FullService => "FULL_SERVICE",
            Self::DegradedService => "DEGRADED_SERVICE",
            Self::EmergencyOnly => "EMERGENCY_ONLY",
            Self::ServiceOutage => "SERVICE_OUTAGE",
        };
        f.write_str(name)
    }
}

/// A single operation handed to a transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub operation: OperationType,
    pub params: Value,
    pub priority: Priority,
}

impl OperationRequest {
    pub fn new(operation: OperationType, params: Value, priority: Priority) -> Self {
        Self {
            operation,
            params,
            priority,
        }
    }

    /// String parameter lookup (`pair`, `txid`, ...)
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// Cache key: operation plus canonical parameters
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.operation, self.params)
    }
}

/// Liveness information reported by a transport
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportHealth {
    pub connected: bool,
    pub last_message_age: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub balances: BTreeMap<String, Decimal>,
    pub timestamp: i64,
}

impl BalanceSnapshot {
    pub fn new(balances: BTreeMap<String, Decimal>) -> Self {
        Self {
            balances,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Parse an `{asset: amount}` object; unparseable amounts are skipped
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        let balances = map
            .iter()
            .filter_map(|(asset, amount)| decimal_from_value(amount).map(|d| (asset.clone(), d)))
            .collect();
        Some(Self::new(balances))
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.balances
                .iter()
                .map(|(asset, amount)| (asset.clone(), Value::String(amount.to_string())))
                .collect(),
        )
    }
}

/// Decimal from a JSON string or number
pub fn decimal_from_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(raw) => raw
            .parse()
            .ok()
            .or_else(|| Decimal::from_scientific(raw).ok()),
        Value::Number(number) => {
            let raw = number.to_string();
            raw.parse()
                .ok()
                .or_else(|| Decimal::from_scientific(&raw).ok())
        }
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub pair: String,
    pub last: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub pair: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub timestamp: i64,
}

/// Topics a push-capable transport can fan out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushTopic {
    Balances,
    Ticker(Vec<String>),
    Book(Vec<String>),
    Executions,
}

impl PushTopic {
    pub fn channel(&self) -> &'static str {
        match self {
            Self::Balances => "balances",
            Self::Ticker(_) => "ticker",
            Self::Book(_) => "book",
            Self::Executions => "executions",
        }
    }

    pub fn symbols(&self) -> &[String] {
        match self {
            Self::Ticker(symbols) | Self::Book(symbols) => symbols,
            Self::Balances | Self::Executions => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PushEvent {
    Balance(BalanceSnapshot),
    Ticker(TickerSnapshot),
    Book(OrderBookSnapshot),
    Execution(Value),
}

impl PushEvent {
    pub fn matches(&self, topic: &PushTopic) -> bool {
        match (self, topic) {
            (Self::Balance(_), PushTopic::Balances) | (Self::Execution(_), PushTopic::Executions) => {
                true
            }
            (Self::Ticker(ticker), PushTopic::Ticker(symbols)) => {
                symbols.is_empty() || symbols.contains(&ticker.pair)
            }
            (Self::Book(book), PushTopic::Book(symbols)) => {
                symbols.is_empty() || symbols.contains(&book.pair)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderType {
    Market,
    Limit,
    StopLoss,
    TakeProfit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub pair: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    #[serde(with = "rust_decimal::serde::str")]
    pub volume: Decimal,
    #[serde(with = "rust_decimal::serde::str_option")]
    pub price: Option<Decimal>,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    pub fn to_params(&self) -> Value {
        let mut params = json!({
            "pair": self.pair,
            "type": self.side,
            "ordertype": self.order_type,
            "volume": self.volume.to_string(),
        });
        if let Some(price) = self.price {
            params["price"] = Value::String(price.to_string());
        }
        if let Some(client_id) = &self.client_order_id {
            params["cl_ord_id"] = Value::String(client_id.clone());
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        let mut priorities = vec![
            Priority::Low,
            Priority::Critical,
            Priority::Medium,
            Priority::High,
        ];
        priorities.sort_by(|a, b| b.cmp(a));
        assert_eq!(
            priorities,
            vec![
                Priority::Critical,
                Priority::High,
                Priority::Medium,
                Priority::Low
            ]
        );
    }

    #[test]
    fn test_service_level_allow_lists() {
        use EndpointCategory::*;
        assert!(ServiceLevel::FullService.allows(Standard));
        assert!(ServiceLevel::DegradedService.allows(DegradedRead));
        assert!(!ServiceLevel::DegradedService.allows(Standard));
        assert!(!ServiceLevel::EmergencyOnly.allows(DegradedRead));
        assert!(ServiceLevel::ServiceOutage.allows(Critical));
        assert!(!ServiceLevel::ServiceOutage.allows(DegradedRead));
    }

    #[test]
    fn test_operation_classes() {
        assert_eq!(OperationType::Ohlc.route_class(), RouteClass::RestOnly);
        assert_eq!(
            OperationType::Balance.route_class(),
            RouteClass::StreamPreferred
        );
        assert_eq!(OperationType::OpenOrders.route_class(), RouteClass::Hybrid);
        assert_eq!(
            OperationType::CancelAll.category(),
            EndpointCategory::Critical
        );
        assert_eq!(
            OperationType::AddOrder.category(),
            EndpointCategory::Standard
        );
    }

    #[test]
    fn test_balance_snapshot_from_value() {
        let snapshot =
            BalanceSnapshot::from_value(&json!({"ZUSD": "100.50", "XXBT": 0.25, "BAD": true}))
                .unwrap();
        assert_eq!(snapshot.balances.len(), 2);
        assert_eq!(snapshot.balances["ZUSD"], "100.50".parse::<Decimal>().unwrap());
        assert_eq!(snapshot.to_value()["XXBT"], "0.25");
    }

    #[test]
    fn test_push_event_topic_matching() {
        let ticker = PushEvent::Ticker(TickerSnapshot {
            pair: "BTC/USD".to_string(),
            last: Decimal::ONE,
            bid: Decimal::ONE,
            ask: Decimal::ONE,
            timestamp: 0,
        });
        assert!(ticker.matches(&PushTopic::Ticker(vec!["BTC/USD".to_string()])));
        assert!(!ticker.matches(&PushTopic::Ticker(vec!["ETH/USD".to_string()])));
        assert!(!ticker.matches(&PushTopic::Balances));
    }

    #[test]
    fn test_order_params() {
        let order = OrderRequest {
            pair: "XBTUSD".to_string(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            volume: Decimal::new(125, 3),
            price: Some(Decimal::new(30000, 0)),
            client_order_id: None,
        };
        let params = order.to_params();
        assert_eq!(params["type"], "buy");
        assert_eq!(params["ordertype"], "limit");
        assert_eq!(params["volume"], "0.125");
        assert_eq!(params["price"], "30000");
    }
}
