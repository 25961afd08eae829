//! Call session orchestration and storage for the call desk agent client.
//!
//! Provides:
//! - `CallSessionCoordinator` - Sequence connection and state around calls
//! - Metrics storage implementations (memory, JSON file)
//! - AI side-channel client (feature: ai-service)

#[cfg(feature = "ai-service")]
pub mod ai_service;
pub mod coordinator;
pub mod storage;

pub use coordinator::{CallSessionCoordinator, SessionError};
