//! Windowed request budgets for shared external resources
//! Callers block until the window grants a slot; waits are bounded by the
//! caller's own timeout, not by the limiter.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Request budget for one external resource (model or service name)
#[derive(Debug, Clone)]
pub struct ResourceBudget {
    pub resource_id: String,
    pub requests_per_window: u32,
    pub window: Duration,
    pub used: u32,
    pub window_reset_at: Instant,
}

impl ResourceBudget {
    fn new(resource_id: String, requests_per_window: u32, window: Duration) -> Self {
        Self {
            resource_id,
            requests_per_window,
            window,
            used: 0,
            window_reset_at: Instant::now() + window,
        }
    }

    /// Roll the window forward if it has expired
    fn roll(&mut self, now: Instant) {
        if now >= self.window_reset_at {
            self.used = 0;
            self.window_reset_at = now + self.window;
        }
    }
}

/// Per-resource rate limiter
///
/// Resources without a configured budget pass through unthrottled. Budget
/// state is keyed by resource id; keys are independent, so one saturated
/// resource never delays calls against another.
pub struct RateLimiter {
    budgets: Mutex<HashMap<String, ResourceBudget>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            budgets: Mutex::new(HashMap::new()),
        }
    }

    /// Install or replace the budget for a resource
    pub async fn configure(&self, resource: &str, requests_per_window: u32, window: Duration) {
        let mut budgets = self.budgets.lock().await;
        budgets.insert(
            resource.to_string(),
            ResourceBudget::new(resource.to_string(), requests_per_window, window),
        );
    }

    /// Block until the resource grants a slot
    ///
    /// Consumes one request from the current window, sleeping across window
    /// boundaries as needed. Callers bound the wait with their own timeout.
    pub async fn acquire(&self, resource: &str) {
        loop {
            let wait = {
                let mut budgets = self.budgets.lock().await;
                let budget = match budgets.get_mut(resource) {
                    Some(budget) => budget,
                    None => return,
                };

                let now = Instant::now();
                budget.roll(now);

                if budget.used < budget.requests_per_window {
                    budget.used += 1;
                    return;
                }

                budget.window_reset_at - now
            };

            debug!(
                "Rate limit reached for '{}', waiting {:?} for window reset",
                resource, wait
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Consume a slot only if one is immediately available
    pub async fn try_acquire(&self, resource: &str) -> bool {
        let mut budgets = self.budgets.lock().await;
        let budget = match budgets.get_mut(resource) {
            Some(budget) => budget,
            None => return true,
        };

        let now = Instant::now();
        budget.roll(now);

        if budget.used < budget.requests_per_window {
            budget.used += 1;
            true
        } else {
            false
        }
    }

    /// Snapshot the current budget for a resource
    pub async fn budget(&self, resource: &str) -> Option<ResourceBudget> {
        let budgets = self.budgets.lock().await;
        budgets.get(resource).cloned()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_resource_passes_through() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        limiter.acquire("anything").await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_third_call_blocks_until_window_boundary() {
        let limiter = RateLimiter::new();
        limiter
            .configure("model-a", 2, Duration::from_millis(200))
            .await;

        let start = Instant::now();
        limiter.acquire("model-a").await;
        limiter.acquire("model-a").await;
        assert!(start.elapsed() < Duration::from_millis(100));

        // Third call must wait for the window to reset
        limiter.acquire("model-a").await;
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_fresh_window_grants_immediately() {
        let limiter = RateLimiter::new();
        limiter
            .configure("model-a", 2, Duration::from_millis(100))
            .await;

        limiter.acquire("model-a").await;
        limiter.acquire("model-a").await;
        tokio::time::sleep(Duration::from_millis(120)).await;

        let start = Instant::now();
        limiter.acquire("model-a").await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_try_acquire_does_not_block() {
        let limiter = RateLimiter::new();
        limiter
            .configure("model-a", 1, Duration::from_secs(60))
            .await;

        assert!(limiter.try_acquire("model-a").await);
        assert!(!limiter.try_acquire("model-a").await);

        let budget = limiter.budget("model-a").await.expect("budget exists");
        assert_eq!(budget.used, 1);
    }

    #[tokio::test]
    async fn test_independent_resources() {
        let limiter = RateLimiter::new();
        limiter
            .configure("model-a", 1, Duration::from_secs(60))
            .await;
        limiter
            .configure("model-b", 1, Duration::from_secs(60))
            .await;

        assert!(limiter.try_acquire("model-a").await);
        // Saturating model-a leaves model-b untouched
        assert!(limiter.try_acquire("model-b").await);
    }
}
