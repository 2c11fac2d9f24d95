mod common;

use common::{default_gates_config, harness, test_config, trip};
use lotuslink::core::errors::ConnectivityError;
use lotuslink::core::types::{OperationType, Priority, ServiceLevel, TransportKind};
use lotuslink::resilience::{CircuitState, PendingOperation, RecoveryReport};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_healthy_stream_serves_balance_checks() {
    let h = harness(test_config());

    for _ in 0..5 {
        let balance = h
            .core
            .execute(OperationType::Balance, Value::Null, Priority::Medium)
            .await
            .unwrap();
        assert_eq!(balance["transport"], "stream");
    }

    assert_eq!(h.stream.call_count(), 5);
    assert_eq!(h.rest.call_count(), 0);
    let stats = h.core.statistics();
    assert_eq!(stats.router.stream_calls, 5);
    assert_eq!(stats.router.fallback_count, 0);
    assert_eq!(stats.service_level, ServiceLevel::FullService);
}

#[tokio::test]
async fn test_stream_failures_degrade_to_rest() {
    let h = harness(test_config());
    h.stream.set_failing(true);

    for _ in 0..3 {
        let balance = h
            .core
            .execute(OperationType::Balance, Value::Null, Priority::Medium)
            .await
            .unwrap();
        assert_eq!(balance["transport"], "rest");
    }

    let stream_breaker = h.core.router().breaker(TransportKind::Stream);
    assert_eq!(stream_breaker.state(), CircuitState::Open);
    assert_eq!(h.core.service_status().level, ServiceLevel::DegradedService);
    assert_eq!(h.core.statistics().router.fallback_count, 3);

    // Open stream: the next read goes straight to REST
    let balance = h
        .core
        .execute(OperationType::Balance, Value::Null, Priority::Medium)
        .await
        .unwrap();
    assert_eq!(balance["transport"], "rest");
    assert_eq!(h.stream.call_count(), 3);
    assert_eq!(h.rest.call_count(), 4);

    // Degraded service still serves tickers but defers standard work
    let ticker = h
        .core
        .execute(OperationType::Ticker, json!({"pair": "BTC/USD"}), Priority::Low)
        .await;
    assert!(ticker.is_ok());
    let ohlc = h
        .core
        .execute(OperationType::Ohlc, json!({"pair": "BTC/USD"}), Priority::Low)
        .await;
    assert!(matches!(
        ohlc,
        Err(ConnectivityError::OperationDeferred {
            level: ServiceLevel::DegradedService,
            ..
        })
    ));
}

#[tokio::test]
async fn test_outage_runs_critical_in_emergency_mode() {
    let h = harness(test_config());
    h.stream.set_connected(false);
    trip(&h.core, TransportKind::Rest);
    trip(&h.core, TransportKind::Stream);
    assert_eq!(h.core.service_status().level, ServiceLevel::ServiceOutage);

    let cancelled = h
        .core
        .execute(OperationType::CancelAll, Value::Null, Priority::Critical)
        .await
        .unwrap();
    assert_eq!(cancelled["transport"], "rest");
    assert_eq!(h.core.statistics().router.emergency_calls, 1);

    let rest_calls = h.rest.call_count();
    let ticker = h
        .core
        .execute(OperationType::Ticker, json!({"pair": "BTC/USD"}), Priority::Low)
        .await;
    assert!(matches!(
        ticker,
        Err(ConnectivityError::OperationDeferred {
            operation: OperationType::Ticker,
            level: ServiceLevel::ServiceOutage,
            ..
        })
    ));
    assert_eq!(h.rest.call_count(), rest_calls);
    assert_eq!(h.stream.call_count(), 0);
    assert_eq!(h.core.orchestrator().pending_count(), 1);
}

#[tokio::test]
async fn test_emergency_retries_before_giving_up() {
    let h = harness(test_config());
    h.stream.set_connected(false);
    h.stream.set_failing(true);
    h.rest.set_failing(true);
    trip(&h.core, TransportKind::Rest);
    trip(&h.core, TransportKind::Stream);

    let err = h
        .core
        .execute(OperationType::CancelAll, Value::Null, Priority::Critical)
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectivityError::Exhausted { .. }));
    // Configured attempts on REST, then one try on the stream
    let attempts = h.core.config().router.emergency_attempts;
    assert_eq!(h.rest.call_count(), attempts);
    assert_eq!(h.stream.call_count(), 1);
}

#[tokio::test]
async fn test_recovery_replays_in_priority_order() {
    let mut config = test_config();
    config.breaker.recovery_timeout_ms = 10;
    config.breaker.success_threshold = 1;
    let h = harness(config);

    trip(&h.core, TransportKind::Rest);
    trip(&h.core, TransportKind::Stream);

    let submissions = [
        (OperationType::Ticker, Priority::Low),
        (OperationType::AddOrder, Priority::Critical),
        (OperationType::OpenPositions, Priority::Medium),
        (OperationType::AddOrder, Priority::High),
    ];
    for (operation, priority) in submissions {
        let result = h.core.execute(operation, json!({}), priority).await;
        assert!(matches!(
            result,
            Err(ConnectivityError::OperationDeferred { .. })
        ));
    }

    let queued: Vec<Priority> = h
        .core
        .orchestrator()
        .pending_operations()
        .iter()
        .map(|op| op.priority)
        .collect();
    assert_eq!(
        queued,
        vec![
            Priority::Critical,
            Priority::High,
            Priority::Medium,
            Priority::Low
        ]
    );

    let replayed = Arc::new(Mutex::new(Vec::new()));
    {
        let replayed = Arc::clone(&replayed);
        h.core
            .orchestrator()
            .add_replay_observer(Arc::new(
                move |op: &PendingOperation, result: &Result<Value, ConnectivityError>| {
                    assert!(result.is_ok());
                    replayed.lock().push(op.priority);
                },
            ));
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = h.core.orchestrator().attempt_recovery().await;
    assert_eq!(
        report,
        RecoveryReport::Completed {
            level: ServiceLevel::FullService,
            replayed: 4,
            remaining: 0,
        }
    );
    assert_eq!(
        *replayed.lock(),
        vec![
            Priority::Critical,
            Priority::High,
            Priority::Medium,
            Priority::Low
        ]
    );
    assert_eq!(h.rest.probes(), 1);
    assert_eq!(h.stream.probes(), 1);
}

#[tokio::test]
async fn test_failed_probe_keeps_operations_queued() {
    let mut config = test_config();
    config.breaker.recovery_timeout_ms = 5;
    config.orchestrator.max_recovery_attempts = 2;
    let h = harness(config);
    h.rest.set_probe_ok(false);
    h.stream.set_probe_ok(false);
    trip(&h.core, TransportKind::Rest);
    trip(&h.core, TransportKind::Stream);

    let _ = h
        .core
        .execute(OperationType::Ohlc, json!({}), Priority::Low)
        .await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    match h.core.orchestrator().attempt_recovery().await {
        RecoveryReport::Completed {
            level,
            replayed,
            remaining,
        } => {
            assert_eq!(level, ServiceLevel::ServiceOutage);
            assert_eq!(replayed, 0);
            assert_eq!(remaining, 1);
        }
        other => panic!("unexpected report: {other:?}"),
    }
    assert!(!h.core.orchestrator().is_recovering());
}

#[tokio::test]
async fn test_single_stream_failure_does_not_strand_the_stream() {
    let mut config = default_gates_config();
    config.router.stream_trial_interval_ms = 20;
    let h = harness(config);
    h.stream.push_result(Err(ConnectivityError::unavailable(
        TransportKind::Stream,
        "socket closed",
    )));

    let balance = h
        .core
        .execute(OperationType::Balance, Value::Null, Priority::Medium)
        .await
        .unwrap();
    assert_eq!(balance["transport"], "rest");
    assert!(!h.core.service_status().stream_healthy);

    tokio::time::sleep(Duration::from_millis(30)).await;
    for _ in 0..5 {
        let balance = h
            .core
            .execute(OperationType::Balance, Value::Null, Priority::Medium)
            .await
            .unwrap();
        assert_eq!(balance["transport"], "stream");
    }

    let status = h.core.service_status();
    assert!(status.stream_healthy);
    assert_eq!(status.level, ServiceLevel::FullService);
    assert_eq!(h.stream.call_count(), 6);
    assert_eq!(h.rest.call_count(), 1);
}

#[tokio::test]
async fn test_stale_stream_sends_balance_to_rest() {
    let h = harness(default_gates_config());
    h.stream.set_message_age(Duration::from_secs(61));

    let balance = h
        .core
        .execute(OperationType::Balance, Value::Null, Priority::Medium)
        .await
        .unwrap();
    assert_eq!(balance["transport"], "rest");
    assert_eq!(h.stream.call_count(), 0);
    assert!(!h.core.service_status().stream_healthy);
}

#[tokio::test]
async fn test_concurrent_recovery_runs_once() {
    let mut config = test_config();
    config.breaker.recovery_timeout_ms = 10;
    config.breaker.success_threshold = 1;
    let h = harness(config);
    h.rest.set_probe_delay(Duration::from_millis(50));
    h.stream.set_probe_delay(Duration::from_millis(50));
    trip(&h.core, TransportKind::Rest);
    trip(&h.core, TransportKind::Stream);

    let deferred = h
        .core
        .execute(OperationType::Ohlc, json!({"pair": "BTC/USD"}), Priority::Low)
        .await;
    assert!(matches!(
        deferred,
        Err(ConnectivityError::OperationDeferred { .. })
    ));

    let replayed = Arc::new(Mutex::new(0usize));
    {
        let replayed = Arc::clone(&replayed);
        h.core
            .orchestrator()
            .add_replay_observer(Arc::new(
                move |_: &PendingOperation, _: &Result<Value, ConnectivityError>| {
                    *replayed.lock() += 1;
                },
            ));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let orchestrator = h.core.orchestrator();
    let (first, second) = tokio::join!(
        orchestrator.attempt_recovery(),
        orchestrator.attempt_recovery()
    );
    let reports = [first, second];
    assert_eq!(
        reports
            .iter()
            .filter(|r| **r == RecoveryReport::AlreadyRunning)
            .count(),
        1
    );
    assert!(reports.contains(&RecoveryReport::Completed {
        level: ServiceLevel::FullService,
        replayed: 1,
        remaining: 0,
    }));
    assert_eq!(*replayed.lock(), 1);
    assert_eq!(h.rest.operations(), vec![OperationType::Ohlc]);
    assert_eq!(h.rest.probes(), 1);
    assert_eq!(h.stream.probes(), 1);
    assert!(!orchestrator.is_recovering());
}

