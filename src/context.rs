//! Engine context
//!
//! Explicit wiring of the shared components: breakers, rate limiter,
//! validator, and audit sink are constructed once at process start and
//! passed by reference into the collector and orchestrator. No globals.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::audit::{AuditSink, TracingAuditSink};
use crate::breaker::BreakerRegistry;
use crate::collector::ResilientDataCollector;
use crate::config::{Config, EngineManifest};
use crate::limiter::RateLimiter;
use crate::modules::{ModuleConfig, ModuleRegistry};
use crate::orchestrator::ModuleOrchestrator;
use crate::quality::DataQualityValidator;

/// Shared engine state, built once and injected everywhere
pub struct EngineContext {
    pub config: Config,
    pub breakers: Arc<BreakerRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub validator: Arc<DataQualityValidator>,
    pub audit: Arc<dyn AuditSink>,
}

impl EngineContext {
    pub fn new(config: Config) -> Self {
        Self::with_audit(config, Arc::new(TracingAuditSink::new()))
    }

    pub fn with_audit(config: Config, audit: Arc<dyn AuditSink>) -> Self {
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.to_breaker_config()));
        Self {
            config,
            breakers,
            limiter: Arc::new(RateLimiter::new()),
            validator: Arc::new(DataQualityValidator::new()),
            audit,
        }
    }

    /// Build a context with manifest-supplied breaker overrides and
    /// rate-limit budgets applied
    pub async fn from_manifest(
        config: Config,
        manifest: &EngineManifest,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let defaults = config.breaker.to_breaker_config();
        let overrides = manifest.breaker_configs(&defaults);
        let breakers = Arc::new(BreakerRegistry::with_overrides(defaults, overrides));

        let limiter = Arc::new(RateLimiter::new());
        for (resource, spec) in &manifest.rate_limits {
            limiter
                .configure(
                    resource,
                    spec.requests_per_window,
                    Duration::from_millis(spec.window_ms),
                )
                .await;
        }

        info!(
            "Engine context ready: {} breaker override(s), {} rate budget(s)",
            manifest.breaker_overrides.len(),
            manifest.rate_limits.len()
        );

        Self {
            config,
            breakers,
            limiter,
            validator: Arc::new(DataQualityValidator::new()),
            audit,
        }
    }

    /// Collector wired to this context's breakers and validator
    pub fn collector(&self) -> ResilientDataCollector {
        ResilientDataCollector::new(self.breakers.clone(), self.validator.clone())
            .with_retry_attempts(self.config.collector.retry_attempts)
    }

    /// Orchestrator wired to this context's limiter and audit sink
    pub fn orchestrator(
        &self,
        registry: Arc<ModuleRegistry>,
        configs: Vec<ModuleConfig>,
    ) -> ModuleOrchestrator {
        ModuleOrchestrator::new(registry, configs, self.limiter.clone(), self.audit.clone())
            .with_backoff(Duration::from_millis(self.config.orchestrator.backoff_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manifest_budgets_are_installed() {
        let manifest: EngineManifest = serde_json::from_str(
            r#"{"rate_limits": {"model-a": {"requests_per_window": 2, "window_ms": 60000}}}"#,
        )
        .expect("valid manifest");

        let context = EngineContext::from_manifest(
            Config::default(),
            &manifest,
            Arc::new(TracingAuditSink::new()),
        )
        .await;

        let budget = context.limiter.budget("model-a").await.expect("budget");
        assert_eq!(budget.requests_per_window, 2);
    }

    #[test]
    fn test_fresh_contexts_are_isolated() {
        let a = EngineContext::new(Config::default());
        let b = EngineContext::new(Config::default());

        a.breakers.breaker("shared-name").record_failure();
        assert_eq!(b.breakers.breaker("shared-name").failures(), 0);
    }
}
