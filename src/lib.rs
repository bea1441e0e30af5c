// Vantage - Resilient AI-Analysis Orchestration Engine
// Coordinates unreliable analysis modules and data sources into one coherent
// result per request, tolerating partial failure at every layer.

#![deny(clippy::unwrap_used)]

pub mod audit;
pub mod breaker;
pub mod collector;
pub mod config;
pub mod context;
pub mod error;
pub mod limiter;
pub mod modules;
pub mod orchestrator;
pub mod quality;

// Re-export commonly used items
pub use audit::{AttemptKind, AuditSink, ExecutionRecord, MemoryAuditSink, TracingAuditSink};
pub use breaker::{BreakerConfig, BreakerRegistry, CircuitBreaker, CircuitState};
pub use collector::{
    CollectionResult, CollectionStrategy, ResilientDataCollector, SourceClient, SourceResult,
    TimeoutStrategy,
};
pub use config::{Config, EngineManifest};
pub use context::EngineContext;
pub use error::{CallResult, OrchestrationError, SourceError};
pub use limiter::RateLimiter;
pub use modules::{AnalysisModule, ModuleConfig, ModuleInput, ModuleOutput, ModuleRegistry};
pub use orchestrator::{
    ModuleOrchestrator, OrchestrationRequest, OrchestrationResult, PriorityClass,
};
pub use quality::{DataQualityValidator, FieldKind, FieldRule, QualityMetrics};
