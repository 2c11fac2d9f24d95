//! Cross-checks snapshots observed on the two transports.
//!
//! Validation is observational: results are logged and kept in a bounded
//! history, nothing is blocked on them. A counterpart that is missing makes
//! the comparison unverified (valid with 0.5 confidence).

use crate::core::config::ValidatorConfig;
use crate::core::errors::ConnectivityError;
use crate::core::types::{BalanceSnapshot, BookLevel, OrderBookSnapshot, TickerSnapshot};
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::{debug, warn};

const UNVERIFIED_CONFIDENCE: f64 = 0.5;
const MISSING_ITEM_PENALTY: f64 = 0.9;
const MAX_BOOK_DEPTH: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub subject: String,
    pub is_valid: bool,
    pub confidence: f64,
    pub discrepancies: Vec<String>,
    pub timestamp: i64,
}

impl ValidationResult {
    fn unverified(subject: String) -> Self {
        Self {
            subject,
            is_valid: true,
            confidence: UNVERIFIED_CONFIDENCE,
            discrepancies: Vec::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemicIssue {
    pub key: String,
    pub occurrences: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidatorStats {
    pub total: u64,
    pub valid: u64,
    pub success_rate: f64,
    pub average_confidence: f64,
    pub systemic_issues: Vec<SystemicIssue>,
}

/// A history entry and the discrepancy keys it contributed to `frequency`
#[derive(Debug)]
struct Recorded {
    result: ValidationResult,
    keys: Vec<String>,
}

#[derive(Debug, Default)]
struct ValidatorState {
    history: VecDeque<Recorded>,
    /// Discrepancy counts over the results still held in `history`
    frequency: HashMap<String, u32>,
    total: u64,
    valid: u64,
}

/// Collects discrepancy messages plus the stable key each one is counted under
#[derive(Default)]
struct Findings {
    messages: Vec<String>,
    keys: Vec<String>,
    confidence: f64,
}

impl Findings {
    fn new() -> Self {
        Self {
            confidence: 1.0,
            ..Self::default()
        }
    }

    fn push(&mut self, key: String, message: String) {
        self.keys.push(key);
        self.messages.push(message);
    }
}

pub struct DataConsistencyValidator {
    config: ValidatorConfig,
    state: Mutex<ValidatorState>,
}

fn relative_difference(a: Decimal, b: Decimal) -> f64 {
    let scale = a.abs().max(b.abs());
    if scale.is_zero() {
        return 0.0;
    }
    ((a - b).abs() / scale).to_f64().unwrap_or(f64::MAX)
}

impl DataConsistencyValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ValidatorState::default()),
        }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub fn validate_balance(
        &self,
        rest: Option<&BalanceSnapshot>,
        stream: Option<&BalanceSnapshot>,
    ) -> ValidationResult {
        let subject = "balance".to_string();
        let (Some(rest), Some(stream)) = (rest, stream) else {
            return self.record(ValidationResult::unverified(subject), Vec::new());
        };

        let mut findings = Findings::new();
        let assets: BTreeSet<&String> = rest.balances.keys().chain(stream.balances.keys()).collect();
        for asset in assets {
            match (rest.balances.get(asset), stream.balances.get(asset)) {
                (Some(a), Some(b)) => {
                    let diff = relative_difference(*a, *b);
                    if diff > self.config.balance_tolerance {
                        findings.push(
                            format!("balance:{}", asset),
                            format!(
                                "balance mismatch for {}: rest={} stream={} (relative diff {:.2e})",
                                asset, a, b, diff
                            ),
                        );
                    }
                }
                _ => findings.confidence *= MISSING_ITEM_PENALTY,
            }
        }

        self.finish(subject, findings)
    }

    pub fn validate_price(
        &self,
        pair: &str,
        rest: Option<&TickerSnapshot>,
        stream: Option<&TickerSnapshot>,
    ) -> ValidationResult {
        let subject = format!("price:{}", pair);
        let (Some(rest), Some(stream)) = (rest, stream) else {
            return self.record(ValidationResult::unverified(subject), Vec::new());
        };

        let mut findings = Findings::new();
        for (field, a, b) in [
            ("last", rest.last, stream.last),
            ("bid", rest.bid, stream.bid),
            ("ask", rest.ask, stream.ask),
        ] {
            let diff = relative_difference(a, b);
            if diff > self.config.price_tolerance {
                findings.push(
                    format!("price:{}:{}", pair, field),
                    format!(
                        "{} price mismatch for {}: rest={} stream={} (relative diff {:.4})",
                        field, pair, a, b, diff
                    ),
                );
            }
        }

        self.finish(subject, findings)
    }

    /// Compare the top `depth` levels (at most 5) of both sides
    pub fn validate_orderbook(
        &self,
        pair: &str,
        rest: Option<&OrderBookSnapshot>,
        stream: Option<&OrderBookSnapshot>,
        depth: usize,
    ) -> ValidationResult {
        let subject = format!("orderbook:{}", pair);
        let (Some(rest), Some(stream)) = (rest, stream) else {
            return self.record(ValidationResult::unverified(subject), Vec::new());
        };

        let depth = depth.min(MAX_BOOK_DEPTH).min(self.config.orderbook_depth);
        let mut findings = Findings::new();
        self.compare_levels(pair, "bid", &rest.bids, &stream.bids, depth, &mut findings);
        self.compare_levels(pair, "ask", &rest.asks, &stream.asks, depth, &mut findings);

        self.finish(subject, findings)
    }

    fn compare_levels(
        &self,
        pair: &str,
        side: &str,
        rest: &[BookLevel],
        stream: &[BookLevel],
        depth: usize,
        findings: &mut Findings,
    ) {
        for level in 0..depth {
            match (rest.get(level), stream.get(level)) {
                (Some(a), Some(b)) => {
                    let price_diff = relative_difference(a.price, b.price);
                    if price_diff > self.config.price_tolerance {
                        findings.push(
                            format!("orderbook:{}:{}:{}:price", pair, side, level),
                            format!(
                                "{} {} level {} price mismatch: rest={} stream={}",
                                pair, side, level, a.price, b.price
                            ),
                        );
                    }
                    let volume_diff = relative_difference(a.volume, b.volume);
                    if volume_diff > self.config.volume_tolerance {
                        findings.push(
                            format!("orderbook:{}:{}:{}:volume", pair, side, level),
                            format!(
                                "{} {} level {} volume mismatch: rest={} stream={}",
                                pair, side, level, a.volume, b.volume
                            ),
                        );
                    }
                }
                (None, None) => break,
                _ => findings.confidence *= MISSING_ITEM_PENALTY,
            }
        }
    }

    fn finish(&self, subject: String, findings: Findings) -> ValidationResult {
        let result = ValidationResult {
            subject,
            is_valid: findings.messages.is_empty(),
            confidence: findings.confidence,
            discrepancies: findings.messages,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.record(result, findings.keys)
    }

    fn record(&self, result: ValidationResult, keys: Vec<String>) -> ValidationResult {
        let mut state = self.state.lock();
        state.total += 1;
        if result.is_valid {
            state.valid += 1;
            debug!(subject = %result.subject, confidence = result.confidence, "Validation passed");
        } else {
            let error = ConnectivityError::ValidationDiscrepancy(result.discrepancies.join("; "));
            warn!(subject = %result.subject, %error, "Cross-transport discrepancy");
        }

        let threshold = self.config.systemic_threshold.max(1);
        for key in &keys {
            let count = state.frequency.entry(key.clone()).or_insert(0);
            *count += 1;
            if *count % threshold == 0 {
                warn!(key = %key, occurrences = *count, "Systemic discrepancy");
            }
        }

        state.history.push_back(Recorded {
            result: result.clone(),
            keys,
        });
        while state.history.len() > self.config.history_size.max(1) {
            let Some(evicted) = state.history.pop_front() else {
                break;
            };
            for key in evicted.keys {
                if let Some(count) = state.frequency.get_mut(&key) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        state.frequency.remove(&key);
                    }
                }
            }
        }
        result
    }

    /// Most recent results, oldest first
    pub fn history(&self) -> Vec<ValidationResult> {
        self.state
            .lock()
            .history
            .iter()
            .map(|entry| entry.result.clone())
            .collect()
    }

    pub fn stats(&self) -> ValidatorStats {
        let state = self.state.lock();
        let average_confidence = if state.history.is_empty() {
            1.0
        } else {
            state.history.iter().map(|r| r.result.confidence).sum::<f64>() / state.history.len() as f64
        };
        let threshold = self.config.systemic_threshold.max(1);
        let mut systemic_issues: Vec<SystemicIssue> = state
            .frequency
            .iter()
            .filter(|(_, count)| **count >= threshold)
            .map(|(key, count)| SystemicIssue {
                key: key.clone(),
                occurrences: *count,
            })
            .collect();
        systemic_issues.sort_by(|a, b| b.occurrences.cmp(&a.occurrences).then(a.key.cmp(&b.key)));

        ValidatorStats {
            total: state.total,
            valid: state.valid,
            success_rate: if state.total == 0 {
                1.0
            } else {
                state.valid as f64 / state.total as f64
            },
            average_confidence,
            systemic_issues,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn dec(raw: &str) -> Decimal {
        raw.parse().unwrap()
    }

    fn balances(entries: &[(&str, Decimal)]) -> BalanceSnapshot {
        BalanceSnapshot::new(
            entries
                .iter()
                .map(|(asset, amount)| (asset.to_string(), *amount))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    fn ticker(last: Decimal) -> TickerSnapshot {
        TickerSnapshot {
            pair: "BTC/USD".to_string(),
            last,
            bid: last,
            ask: last,
            timestamp: 0,
        }
    }

    #[test]
    fn test_one_discrepancy_per_mismatched_asset() {
        let validator = DataConsistencyValidator::new(ValidatorConfig::default());
        let rest = balances(&[("USD", dec("100")), ("XBT", dec("1.5")), ("ETH", dec("3"))]);
        let stream = balances(&[("USD", dec("101")), ("XBT", dec("1.6")), ("ETH", dec("3"))]);

        let result = validator.validate_balance(Some(&rest), Some(&stream));
        assert!(!result.is_valid);
        assert_eq!(result.discrepancies.len(), 2);
        assert!((result.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_asset_lowers_confidence() {
        let validator = DataConsistencyValidator::new(ValidatorConfig::default());
        let rest = balances(&[("USD", dec("100")), ("XBT", dec("1"))]);
        let stream = balances(&[("USD", dec("100"))]);

        let result = validator.validate_balance(Some(&rest), Some(&stream));
        assert!(result.is_valid);
        assert!((result.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_missing_counterpart_is_unverified() {
        let validator = DataConsistencyValidator::new(ValidatorConfig::default());
        let stream = balances(&[("USD", dec("100"))]);
        let result = validator.validate_balance(None, Some(&stream));
        assert!(result.is_valid);
        assert!((result.confidence - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_price_tolerance() {
        let validator = DataConsistencyValidator::new(ValidatorConfig::default());
        let within = validator.validate_price(
            "BTC/USD",
            Some(&ticker(dec("50000"))),
            Some(&ticker(dec("50020"))),
        );
        assert!(within.is_valid);

        let outside = validator.validate_price(
            "BTC/USD",
            Some(&ticker(dec("50000"))),
            Some(&ticker(dec("50100"))),
        );
        assert!(!outside.is_valid);
        assert_eq!(outside.discrepancies.len(), 3);
    }

    #[test]
    fn test_orderbook_depth_and_volume() {
        let validator = DataConsistencyValidator::new(ValidatorConfig::default());
        let level = |price: Decimal, volume: Decimal| BookLevel { price, volume };
        let rest = OrderBookSnapshot {
            pair: "BTC/USD".to_string(),
            bids: vec![level(dec("100"), dec("1")), level(dec("99"), dec("2"))],
            asks: vec![level(dec("101"), dec("1"))],
            timestamp: 0,
        };
        let mut stream = rest.clone();
        stream.bids[1].volume = dec("3");
        stream.asks.push(level(dec("102"), dec("1")));

        let result = validator.validate_orderbook("BTC/USD", Some(&rest), Some(&stream), 10);
        assert_eq!(result.discrepancies.len(), 1);
        assert!((result.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_systemic_issue_tracking() {
        let validator = DataConsistencyValidator::new(ValidatorConfig::default());
        let rest = balances(&[("USD", dec("100"))]);
        let stream = balances(&[("USD", dec("90"))]);
        for _ in 0..3 {
            validator.validate_balance(Some(&rest), Some(&stream));
        }
        validator.validate_balance(Some(&rest), Some(&rest));

        let stats = validator.stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.valid, 1);
        assert_eq!(stats.systemic_issues.len(), 1);
        assert_eq!(stats.systemic_issues[0].key, "balance:USD");
        assert_eq!(validator.history().len(), 4);
    }

    #[test]
    fn test_discrepancy_counts_age_out_with_history() {
        let config = ValidatorConfig {
            history_size: 3,
            systemic_threshold: 2,
            ..ValidatorConfig::default()
        };
        let validator = DataConsistencyValidator::new(config);
        let rest = balances(&[("USD", dec("100"))]);
        let stream = balances(&[("USD", dec("90"))]);

        for _ in 0..5 {
            validator.validate_balance(Some(&rest), Some(&stream));
        }
        let issues = validator.stats().systemic_issues;
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].occurrences, 3);

        for _ in 0..3 {
            validator.validate_balance(Some(&rest), Some(&rest));
        }
        let stats = validator.stats();
        assert!(stats.systemic_issues.is_empty());
        assert_eq!(stats.total, 8);
        assert_eq!(validator.state.lock().frequency.len(), 0);
    }
}
