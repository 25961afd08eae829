//! Caller and call-session context.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Information about the party on the other end of a call.
///
/// Apps can attach arbitrary metadata (queue name, IVR selections, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerInfo {
    /// Backend identifier of the caller.
    pub caller_id: String,

    /// Display name.
    #[serde(default)]
    pub name: String,

    /// Phone number, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,

    /// Arbitrary metadata for app-specific needs.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl CallerInfo {
    /// Create caller info with an id and display name.
    #[must_use]
    pub fn new(caller_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            name: name.into(),
            phone: None,
            metadata: HashMap::new(),
        }
    }

    /// Attach a phone number.
    #[must_use]
    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Set a metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }
}

/// Key of one live backend session: which agent is talking about which caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    pub agent_id: String,
    pub caller_id: String,
}

impl SessionKey {
    #[must_use]
    pub fn new(agent_id: impl Into<String>, caller_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            caller_id: caller_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_info_camel_case() {
        let mut info = CallerInfo::new("c-1", "Jane Doe").with_phone("+15550100");
        info.set_metadata("queue", Value::from("billing"));

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["callerId"], "c-1");
        assert_eq!(json["phone"], "+15550100");
        assert_eq!(info.get_metadata("queue"), Some(&Value::from("billing")));
    }
}
