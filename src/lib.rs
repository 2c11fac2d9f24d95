pub mod core;
pub mod resilience;
pub mod transports;

pub use self::core::{
    config::{ExchangeConfig, ResilienceConfig},
    errors::ConnectivityError,
    traits::{BalanceSource, OrderSink, RiskGate, Transport},
    types::*,
};
pub use resilience::{ConnectivityCore, ConnectivityCoreBuilder};
