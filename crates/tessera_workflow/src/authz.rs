//! Authorization collaborator.
//!
//! The workflow only asks "may this user do this in this project?". A denial
//! is a [`crate::WorkflowError::Forbidden`], never a state change.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::RwLock;

use tessera_protocol::{ProjectId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Edit,
    Submit,
    Approve,
    Reject,
    Withdraw,
    Revalidate,
    RetryMerge,
    AttachRules,
}

impl Action {
    pub const ALL: [Action; 8] = [
        Action::Edit,
        Action::Submit,
        Action::Approve,
        Action::Reject,
        Action::Withdraw,
        Action::Revalidate,
        Action::RetryMerge,
        Action::AttachRules,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Edit => "edit",
            Action::Submit => "submit",
            Action::Approve => "approve",
            Action::Reject => "reject",
            Action::Withdraw => "withdraw",
            Action::Revalidate => "revalidate",
            Action::RetryMerge => "retry_merge",
            Action::AttachRules => "attach_rules",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn can_perform(&self, user: &UserId, project: &ProjectId, action: Action) -> bool;
}

/// Grants everything. For single-user deployments and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn can_perform(&self, _user: &UserId, _project: &ProjectId, _action: Action) -> bool {
        true
    }
}

/// Explicit grants per `(user, project, action)`. Everything else is denied.
#[derive(Debug, Default)]
pub struct StaticPolicy {
    grants: RwLock<HashSet<(UserId, ProjectId, Action)>>,
}

impl StaticPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, user: UserId, project: ProjectId, action: Action) {
        if let Ok(mut grants) = self.grants.write() {
            grants.insert((user, project, action));
        }
    }

    pub fn grant_all(&self, user: &UserId, project: &ProjectId) {
        for action in Action::ALL {
            self.grant(user.clone(), project.clone(), action);
        }
    }

    pub fn revoke(&self, user: &UserId, project: &ProjectId, action: Action) {
        if let Ok(mut grants) = self.grants.write() {
            grants.remove(&(user.clone(), project.clone(), action));
        }
    }

    pub fn with_grant(self, user: &str, project: &str, action: Action) -> Self {
        self.grant(UserId::new(user), ProjectId::new(project), action);
        self
    }
}

#[async_trait]
impl Authorizer for StaticPolicy {
    async fn can_perform(&self, user: &UserId, project: &ProjectId, action: Action) -> bool {
        self.grants
            .read()
            .map(|grants| grants.contains(&(user.clone(), project.clone(), action)))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_policy_denies_by_default() {
        let policy = StaticPolicy::new().with_grant("alice", "proj", Action::Approve);
        let alice = UserId::new("alice");
        let project = ProjectId::new("proj");

        assert!(policy.can_perform(&alice, &project, Action::Approve).await);
        assert!(!policy.can_perform(&alice, &project, Action::Reject).await);
        assert!(
            !policy
                .can_perform(&alice, &ProjectId::new("other"), Action::Approve)
                .await
        );

        policy.revoke(&alice, &project, Action::Approve);
        assert!(!policy.can_perform(&alice, &project, Action::Approve).await);
    }

    #[tokio::test]
    async fn test_grant_all() {
        let policy = StaticPolicy::new();
        let bob = UserId::new("bob");
        let project = ProjectId::new("proj");
        policy.grant_all(&bob, &project);
        for action in Action::ALL {
            assert!(policy.can_perform(&bob, &project, action).await);
        }
    }
}
