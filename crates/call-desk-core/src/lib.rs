//! Core types for the call desk agent client.
//!
//! This crate provides the fundamental building blocks:
//! - `AgentStatus`, `CallState`, `ConnectionState` - shared state enums
//! - `InsightStore` - Broadcast + snapshot store for live-call insights
//! - `CallerInfo` - Caller context attached to a call
//! - `DeskConfig` - Configuration loading and validation
//! - `MetricsStorage` trait for persisting agent metrics

pub mod config;
pub mod context;
pub mod insight_store;
pub mod insights;
pub mod status;
pub mod traits;

pub use config::{ConfigError, DeskConfig};
pub use context::{CallerInfo, SessionKey};
pub use insight_store::InsightStore;
pub use insights::{InsightUpdate, LiveInsights};
pub use status::{AgentStatus, CallState, ConnectionState, TimerCategory};
pub use traits::{MetricsStorage, PersistedMetrics, StorageError};
