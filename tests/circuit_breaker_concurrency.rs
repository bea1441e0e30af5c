use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use vantage::breaker::{BreakerConfig, BreakerRegistry, CircuitState};
use vantage::error::SourceError;

fn quick_registry(threshold: u32, reset_ms: u64) -> Arc<BreakerRegistry> {
    Arc::new(BreakerRegistry::new(BreakerConfig {
        failure_threshold: threshold,
        reset_timeout: Duration::from_millis(reset_ms),
        monitoring_period: Duration::from_secs(120),
        expected_error_rate: 0.5,
    }))
}

#[tokio::test]
async fn test_concurrent_failures_open_circuit_once() {
    let registry = quick_registry(5, 60_000);
    let mut events = registry.subscribe();

    let mut handles = vec![];

    // Spawn 20 concurrent failing calls against the same resource
    for _ in 0..20 {
        let registry_clone = Arc::clone(&registry);
        let handle = tokio::spawn(async move {
            let breaker = registry_clone.breaker("shared-api");
            breaker
                .call::<(), _, _>(|| async { Err(SourceError::api_error(500, "boom")) })
                .await
        });
        handles.push(handle);
    }

    let results = futures::future::join_all(handles).await;
    for result in results {
        assert!(result.is_ok(), "Task panicked: {:?}", result.err());
        assert!(result.expect("joined").is_err(), "Call should have failed");
    }

    assert_eq!(registry.breaker("shared-api").state(), CircuitState::Open);

    // Exactly one CLOSED -> OPEN transition was published
    let mut opened = 0;
    while let Ok(event) = events.try_recv() {
        if event.from == CircuitState::Closed && event.to == CircuitState::Open {
            opened += 1;
        }
    }
    assert_eq!(opened, 1, "Expected exactly 1 open transition, saw {}", opened);
}

#[tokio::test]
async fn test_half_open_admits_exactly_one_probe_under_contention() {
    let registry = quick_registry(1, 20);
    let breaker = registry.breaker("recovering-api");

    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(30)).await;

    let admitted = Arc::new(AtomicU32::new(0));
    let mut handles = vec![];

    // The probe slot stays claimed until the outcome is recorded, so no
    // matter how these tasks interleave, only one may pass
    for _ in 0..10 {
        let registry_clone = Arc::clone(&registry);
        let admitted_clone = Arc::clone(&admitted);
        let handle = tokio::spawn(async move {
            let breaker = registry_clone.breaker("recovering-api");
            if breaker.allow().is_ok() {
                admitted_clone.fetch_add(1, Ordering::SeqCst);
            }
        });
        handles.push(handle);
    }

    let results = futures::future::join_all(handles).await;
    for result in results {
        assert!(result.is_ok(), "Task panicked: {:?}", result.err());
    }

    assert_eq!(
        admitted.load(Ordering::SeqCst),
        1,
        "Exactly one trial call may pass in HALF_OPEN"
    );
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    // The probe's outcome settles the state
    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_concurrent_resources_stay_isolated() {
    let registry = quick_registry(3, 60_000);

    let mut handles = vec![];
    for i in 0..8 {
        let registry_clone = Arc::clone(&registry);
        let handle = tokio::spawn(async move {
            // Even-numbered tasks hammer the failing resource, odd ones succeed
            if i % 2 == 0 {
                let breaker = registry_clone.breaker("failing-api");
                let _ = breaker
                    .call::<(), _, _>(|| async { Err(SourceError::api_error(500, "boom")) })
                    .await;
            } else {
                let breaker = registry_clone.breaker("healthy-api");
                let result = breaker.call(|| async { Ok(42) }).await;
                assert_eq!(result.expect("healthy call passes"), 42);
            }
        });
        handles.push(handle);
    }

    let results = futures::future::join_all(handles).await;
    for result in results {
        assert!(result.is_ok(), "Task panicked: {:?}", result.err());
    }

    assert_eq!(registry.breaker("failing-api").state(), CircuitState::Open);
    assert_eq!(registry.breaker("healthy-api").state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_registry_hands_out_same_instance_concurrently() {
    let registry = quick_registry(5, 60_000);

    let mut handles = vec![];
    for _ in 0..10 {
        let registry_clone = Arc::clone(&registry);
        handles.push(tokio::spawn(async move {
            registry_clone.breaker("singleton-api")
        }));
    }

    let breakers: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.expect("task joined"))
        .collect();

    for breaker in &breakers[1..] {
        assert!(Arc::ptr_eq(&breakers[0], breaker));
    }
}

#[tokio::test]
async fn test_manual_reset_under_concurrent_load() {
    let registry = quick_registry(1, 60_000);
    let breaker = registry.breaker("operator-api");

    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Open);

    let mut handles = vec![];
    for _ in 0..5 {
        let registry_clone = Arc::clone(&registry);
        handles.push(tokio::spawn(async move {
            registry_clone.breaker("operator-api").reset();
        }));
    }

    let results = futures::future::join_all(handles).await;
    for result in results {
        assert!(result.is_ok(), "Task panicked: {:?}", result.err());
    }

    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.failures(), 0);
    assert!(breaker.allow().is_ok());
}
