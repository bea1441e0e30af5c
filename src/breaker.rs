//! Per-resource circuit breakers
//!
//! Isolates failing sources and services so one bad upstream cannot drag the
//! whole pipeline down. Each named resource gets its own breaker with three
//! states:
//!
//! - **Closed**: normal operation, calls pass through.
//! - **Open**: the resource is failing, calls are rejected immediately.
//! - **HalfOpen**: one trial call probes for recovery.
//!
//! Breakers are created lazily by [`BreakerRegistry`] and live in memory;
//! state resets on process restart.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::SourceError;

/// Circuit breaker state
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Breaker tuning for one resource
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,

    /// Time to wait in OPEN before admitting a trial call
    pub reset_timeout: Duration,

    /// Rolling window for the error-rate trip condition
    pub monitoring_period: Duration,

    /// Failure ratio above which the circuit opens within the window
    pub expected_error_rate: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(120),
            expected_error_rate: 0.5,
        }
    }
}

/// State transition notification emitted by the registry's event channel
#[derive(Debug, Clone)]
pub struct BreakerEvent {
    pub resource: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    requests: u32,
    window_started_at: Instant,
    last_failure_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            requests: 0,
            window_started_at: Instant::now(),
            last_failure_at: None,
            next_attempt_at: None,
            probe_in_flight: false,
        }
    }

    fn zero_counters(&mut self) {
        self.failures = 0;
        self.successes = 0;
        self.requests = 0;
        self.window_started_at = Instant::now();
    }
}

/// Counter snapshot for a single breaker
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub resource: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub requests: u32,
}

/// Circuit breaker for one named resource
///
/// All state transitions happen under the breaker's own lock; keys are
/// independent, so there is no cross-resource contention.
pub struct CircuitBreaker {
    resource: String,
    config: BreakerConfig,
    inner: Mutex<CircuitInner>,
    events: broadcast::Sender<BreakerEvent>,
}

impl CircuitBreaker {
    fn new(resource: String, config: BreakerConfig, events: broadcast::Sender<BreakerEvent>) -> Self {
        Self {
            resource,
            config,
            inner: Mutex::new(CircuitInner::new()),
            events,
        }
    }

    /// Lock the circuit state, recovering from poison if necessary.
    ///
    /// The worst case after recovery is a slightly stale counter, which is
    /// preferable to panicking inside the data path.
    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("Circuit breaker mutex for '{}' was poisoned, recovering", self.resource);
            poisoned.into_inner()
        })
    }

    fn emit(&self, from: CircuitState, to: CircuitState) {
        let _ = self.events.send(BreakerEvent {
            resource: self.resource.clone(),
            from,
            to,
        });
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Check whether a call may proceed.
    ///
    /// In OPEN, rejects with [`SourceError::CircuitOpen`] until the reset
    /// timeout elapses, at which point the next caller transitions the
    /// breaker to HALF_OPEN and claims the single trial slot. Callers that
    /// pass must report the outcome via [`record_success`](Self::record_success)
    /// or [`record_failure`](Self::record_failure).
    pub fn allow(&self) -> Result<(), SourceError> {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(SourceError::CircuitOpen {
                        resource: self.resource.clone(),
                        retry_in_ms: 0,
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
            CircuitState::Open => {
                let now = Instant::now();
                match inner.next_attempt_at {
                    Some(at) if now >= at => {
                        info!(
                            "Circuit breaker '{}': OPEN -> HALF_OPEN, admitting trial call",
                            self.resource
                        );
                        inner.state = CircuitState::HalfOpen;
                        inner.probe_in_flight = true;
                        drop(inner);
                        self.emit(CircuitState::Open, CircuitState::HalfOpen);
                        Ok(())
                    }
                    at => {
                        let retry_in_ms = at
                            .map(|at| at.saturating_duration_since(now).as_millis() as u64)
                            .unwrap_or(0);
                        Err(SourceError::CircuitOpen {
                            resource: self.resource.clone(),
                            retry_in_ms,
                        })
                    }
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.lock();
        self.roll_window(&mut inner);
        inner.requests += 1;
        inner.successes += 1;

        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
            }
            CircuitState::HalfOpen => {
                info!(
                    "Circuit breaker '{}': trial call succeeded, HALF_OPEN -> CLOSED",
                    self.resource
                );
                inner.state = CircuitState::Closed;
                inner.probe_in_flight = false;
                inner.next_attempt_at = None;
                inner.zero_counters();
                drop(inner);
                self.emit(CircuitState::HalfOpen, CircuitState::Closed);
            }
            CircuitState::Open => {
                debug!(
                    "Circuit breaker '{}': unexpected success while OPEN",
                    self.resource
                );
            }
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let mut inner = self.lock();
        self.roll_window(&mut inner);
        inner.requests += 1;
        inner.failures += 1;
        inner.last_failure_at = Some(Instant::now());

        match inner.state {
            CircuitState::Closed => {
                let error_rate = inner.failures as f64 / inner.requests as f64;
                // The rate trip only fires once the window holds a meaningful
                // sample, otherwise a single failure would open the circuit.
                let rate_tripped = inner.requests >= self.config.failure_threshold
                    && error_rate > self.config.expected_error_rate;

                if inner.failures >= self.config.failure_threshold || rate_tripped {
                    warn!(
                        "Circuit breaker '{}': CLOSED -> OPEN ({} failures, {:.0}% error rate)",
                        self.resource,
                        inner.failures,
                        error_rate * 100.0
                    );
                    inner.state = CircuitState::Open;
                    inner.next_attempt_at = Some(Instant::now() + self.config.reset_timeout);
                    inner.probe_in_flight = false;
                    drop(inner);
                    self.emit(CircuitState::Closed, CircuitState::Open);
                } else {
                    debug!(
                        "Circuit breaker '{}': failure {}/{}",
                        self.resource, inner.failures, self.config.failure_threshold
                    );
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    "Circuit breaker '{}': trial call failed, HALF_OPEN -> OPEN",
                    self.resource
                );
                inner.state = CircuitState::Open;
                inner.next_attempt_at = Some(Instant::now() + self.config.reset_timeout);
                inner.probe_in_flight = false;
                drop(inner);
                self.emit(CircuitState::HalfOpen, CircuitState::Open);
            }
            CircuitState::Open => {
                debug!(
                    "Circuit breaker '{}': additional failure while OPEN",
                    self.resource
                );
            }
        }
    }

    /// Wrap an operation with the breaker.
    ///
    /// Fails fast with [`SourceError::CircuitOpen`] when the circuit is open,
    /// otherwise executes the operation and records its outcome.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, SourceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        self.allow()?;
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(e)
            }
        }
    }

    /// Force the breaker back to CLOSED and zero all counters
    pub fn reset(&self) {
        let mut inner = self.lock();
        let from = inner.state;
        inner.state = CircuitState::Closed;
        inner.probe_in_flight = false;
        inner.next_attempt_at = None;
        inner.last_failure_at = None;
        inner.zero_counters();
        drop(inner);

        info!("Circuit breaker '{}': manually reset to CLOSED", self.resource);
        if from != CircuitState::Closed {
            self.emit(from, CircuitState::Closed);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failures(&self) -> u32 {
        self.lock().failures
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let inner = self.lock();
        BreakerMetrics {
            resource: self.resource.clone(),
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            requests: inner.requests,
        }
    }

    /// Expire the monitoring window so old failures stop counting against
    /// the error-rate condition.
    fn roll_window(&self, inner: &mut CircuitInner) {
        if inner.window_started_at.elapsed() > self.config.monitoring_period {
            inner.failures = 0;
            inner.successes = 0;
            inner.requests = 0;
            inner.window_started_at = Instant::now();
        }
    }
}

/// Lazy per-resource breaker registry
///
/// Constructed once at process start and shared by reference; components
/// receive it via injection rather than through a global. State changes are
/// published on a broadcast channel for observers (dashboards, alerting).
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    events: broadcast::Sender<BreakerEvent>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            breakers: Mutex::new(HashMap::new()),
            defaults,
            overrides: HashMap::new(),
            events,
        }
    }

    /// Registry with per-resource config overrides
    pub fn with_overrides(defaults: BreakerConfig, overrides: HashMap<String, BreakerConfig>) -> Self {
        let mut registry = Self::new(defaults);
        registry.overrides = overrides;
        registry
    }

    fn lock_breakers(&self) -> MutexGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.lock().unwrap_or_else(|poisoned| {
            warn!("Breaker registry mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Get or lazily create the breaker for a resource
    pub fn breaker(&self, resource: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.lock_breakers();
        breakers
            .entry(resource.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(resource)
                    .cloned()
                    .unwrap_or_else(|| self.defaults.clone());
                debug!("Creating circuit breaker for '{}'", resource);
                Arc::new(CircuitBreaker::new(
                    resource.to_string(),
                    config,
                    self.events.clone(),
                ))
            })
            .clone()
    }

    /// Subscribe to breaker state-change events
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    /// Reset every breaker to CLOSED
    pub fn reset_all(&self) {
        let breakers = self.lock_breakers();
        for breaker in breakers.values() {
            breaker.reset();
        }
        info!("All circuit breakers reset");
    }

    /// Counter snapshots for every tracked resource
    pub fn metrics(&self) -> Vec<BreakerMetrics> {
        let breakers = self.lock_breakers();
        breakers.values().map(|b| b.metrics()).collect()
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config(threshold: u32, reset_ms: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_millis(reset_ms),
            monitoring_period: Duration::from_secs(120),
            expected_error_rate: 0.5,
        }
    }

    fn breaker_with(config: BreakerConfig) -> CircuitBreaker {
        let (events, _) = broadcast::channel(16);
        CircuitBreaker::new("test-resource".to_string(), config, events)
    }

    #[test]
    fn test_starts_closed() {
        let breaker = breaker_with(BreakerConfig::default());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.allow().is_ok());
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = breaker_with(quick_config(3, 60_000));

        for _ in 0..2 {
            assert!(breaker.allow().is_ok());
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        assert!(breaker.allow().is_ok());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // Fourth call is rejected without reaching the operation
        match breaker.allow() {
            Err(SourceError::CircuitOpen { resource, .. }) => {
                assert_eq!(resource, "test-resource");
            }
            other => panic!("expected CircuitOpen, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = breaker_with(quick_config(3, 60_000));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.failures(), 2);

        breaker.record_success();
        assert_eq!(breaker.failures(), 0);
    }

    #[test]
    fn test_half_open_after_reset_timeout() {
        let breaker = breaker_with(quick_config(1, 20));

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(30));

        assert!(breaker.allow().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_success_closes_and_zeroes() {
        let breaker = breaker_with(quick_config(1, 20));

        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.allow().is_ok());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failures(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = breaker_with(quick_config(1, 20));

        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert!(breaker.allow().is_ok());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let breaker = breaker_with(quick_config(1, 10));

        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        // First caller claims the trial slot, second is rejected
        assert!(breaker.allow().is_ok());
        assert!(breaker.allow().is_err());
    }

    #[test]
    fn test_error_rate_trip() {
        let breaker = breaker_with(BreakerConfig {
            failure_threshold: 5,
            expected_error_rate: 0.5,
            ..BreakerConfig::default()
        });

        // 3 failures out of 5 requests = 60% error rate, above the 50% limit,
        // but consecutive-failure count stays below the threshold.
        breaker.record_success();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_manual_reset() {
        let breaker = breaker_with(quick_config(1, 60_000));

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failures(), 0);
        assert!(breaker.allow().is_ok());
    }

    #[tokio::test]
    async fn test_call_records_outcomes() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let breaker = breaker_with(quick_config(2, 60_000));

        let ok: Result<u32, SourceError> = breaker.call(|| async { Ok(7) }).await;
        assert_eq!(ok.expect("call succeeds"), 7);

        for _ in 0..2 {
            let _ = breaker
                .call::<(), _, _>(|| async { Err(SourceError::api_error(500, "boom")) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Operation must not run while the circuit is open
        let invoked = AtomicU32::new(0);
        let result = breaker
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(0u32)
            })
            .await;
        assert!(matches!(result, Err(SourceError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_registry_isolation_and_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert("fragile-api".to_string(), quick_config(1, 60_000));
        let registry = BreakerRegistry::with_overrides(BreakerConfig::default(), overrides);

        let fragile = registry.breaker("fragile-api");
        let sturdy = registry.breaker("sturdy-api");

        fragile.record_failure();
        assert_eq!(fragile.state(), CircuitState::Open);
        assert_eq!(sturdy.state(), CircuitState::Closed);

        // Same name resolves to the same instance
        assert_eq!(registry.breaker("fragile-api").state(), CircuitState::Open);
    }

    #[test]
    fn test_registry_emits_events() {
        let registry = BreakerRegistry::new(quick_config(1, 60_000));
        let mut events = registry.subscribe();

        registry.breaker("noisy-api").record_failure();

        let event = events.try_recv().expect("transition event published");
        assert_eq!(event.resource, "noisy-api");
        assert_eq!(event.from, CircuitState::Closed);
        assert_eq!(event.to, CircuitState::Open);
    }
}
