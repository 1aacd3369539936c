//! Core types for the routing kernel.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (TraceId, AdapterId, etc.)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for transport, policy, and resilience

mod config;
mod errors;
mod ids;

pub use config::{
    Config, DispatchConfig, IpcConfig, ObservabilityConfig, PolicyConfig, ResilienceConfig,
    ServerConfig,
};
pub use errors::{Error, ErrorCode, Result};
pub use ids::{AdapterId, CorrelationId, SubscriptionId, TraceId};
