//! Agent, call and connection state enums.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Operator availability, independent of any specific call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentStatus {
    /// Ready to take calls.
    Available,
    /// Handling a call.
    OnCall,
    /// On a break.
    Break,
    /// Signed out.
    Offline,
    /// Post-call wrap-up.
    AfterCallWork,
    /// Timed opt-out from new calls.
    DoNotDisturb,
}

impl AgentStatus {
    /// All statuses, in display order.
    pub const ALL: [Self; 6] = [
        Self::Available,
        Self::OnCall,
        Self::Break,
        Self::Offline,
        Self::AfterCallWork,
        Self::DoNotDisturb,
    ];

    /// Wire/display name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::OnCall => "on-call",
            Self::Break => "break",
            Self::Offline => "offline",
            Self::AfterCallWork => "after-call-work",
            Self::DoNotDisturb => "do-not-disturb",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle stage of the call currently associated with the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// No call.
    #[default]
    Idle,
    /// A call has been offered.
    Incoming,
    /// The offered call is ringing at the agent.
    Ringing,
    /// Call in progress.
    Active,
    /// Transient: published once on hang-up, then folds to `Idle`.
    Ended,
}

impl CallState {
    /// True while a call is offered but not yet answered.
    #[must_use]
    pub const fn is_offered(self) -> bool {
        matches!(self, Self::Incoming | Self::Ringing)
    }
}

/// State of the live backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts exhausted. Terminal until the next explicit connect.
    Error,
}

/// Category a countdown timer is bound to.
///
/// At most one timer per category is alive at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimerCategory {
    AfterCallWork,
    DoNotDisturb,
    AutoAccept,
    ReconnectBackoff,
    Heartbeat,
}

impl fmt::Display for TimerCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AfterCallWork => "after-call-work",
            Self::DoNotDisturb => "do-not-disturb",
            Self::AutoAccept => "auto-accept",
            Self::ReconnectBackoff => "reconnect-backoff",
            Self::Heartbeat => "heartbeat",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&AgentStatus::AfterCallWork).unwrap();
        assert_eq!(json, "\"after-call-work\"");

        for status in AgentStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json.trim_matches('"'), status.as_str());
        }
    }

    #[test]
    fn test_offered_call_states() {
        assert!(CallState::Incoming.is_offered());
        assert!(CallState::Ringing.is_offered());
        assert!(!CallState::Active.is_offered());
        assert!(!CallState::Idle.is_offered());
    }
}
