//! Caller identity passed into every orchestration call.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

/// Identity and permissions of whoever issued a request.
///
/// Authentication happens outside this crate; the orchestrator only uses
/// the context to stamp ownership and scope visibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerContext {
    pub caller_id: String,
    #[serde(default)]
    pub role: Role,
}

impl CallerContext {
    pub fn user(caller_id: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            role: Role::User,
        }
    }

    pub fn admin(caller_id: impl Into<String>) -> Self {
        Self {
            caller_id: caller_id.into(),
            role: Role::Admin,
        }
    }

    /// The context used for work the orchestrator does on its own behalf.
    pub fn system() -> Self {
        Self::admin("system")
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Returns true if this caller may see and act on a record owned by `owner`.
    pub fn can_access(&self, owner: &str) -> bool {
        self.is_admin() || self.caller_id == owner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_rules() {
        let alice = CallerContext::user("alice");
        assert!(alice.can_access("alice"));
        assert!(!alice.can_access("bob"));
        assert!(CallerContext::admin("root").can_access("bob"));
        assert!(CallerContext::system().can_access("anyone"));
    }
}
