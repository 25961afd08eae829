//! Agent status machine.
//!
//! Provides:
//! - `AgentStatusMachine` - status, call state and metrics behind named transitions
//! - After-call-work and do-not-disturb countdowns whose expiry is
//!   re-checked against the current status before it is applied

pub mod machine;
mod timer;

pub use machine::{AgentSnapshot, AgentStatusMachine, CallSummary, StatusEvent};
pub use timer::TimerSnapshot;
