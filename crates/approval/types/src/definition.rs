//! Workflow definitions: named, versioned, ordered approval steps
//!
//! Definitions are immutable once stored. An edit produces a new
//! [`ApprovalWorkflow`] with the same id and `version + 1`; instances keep
//! referencing the version they were started with.

use crate::{ApprovalError, ApprovalResult, WorkflowId};
use chrono::{DateTime, Utc};
use rbac_types::{RoleName, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Largest accepted step escalation timeout, the range of a `TimeDelta`
pub const MAX_ESCALATION_TIMEOUT_SECS: u64 = (i64::MAX / 1000) as u64;

// ── Workflow Step ────────────────────────────────────────────────────

/// One sequential approval step
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// 1-based position in the workflow
    pub order: u32,
    pub name: String,
    /// Users who may act regardless of role
    #[serde(default)]
    pub approver_users: BTreeSet<UserId>,
    /// Any active holder of one of these roles may act
    #[serde(default)]
    pub approver_roles: BTreeSet<RoleName>,
    /// Seconds after opening before the step is due for escalation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_timeout_secs: Option<u64>,
}

impl WorkflowStep {
    pub fn new(order: u32, name: impl Into<String>) -> Self {
        Self {
            order,
            name: name.into(),
            approver_users: BTreeSet::new(),
            approver_roles: BTreeSet::new(),
            escalation_timeout_secs: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<UserId>) -> Self {
        self.approver_users.insert(user.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<RoleName>) -> Self {
        self.approver_roles.insert(role.into());
        self
    }

    pub fn with_escalation_timeout(mut self, secs: u64) -> Self {
        self.escalation_timeout_secs = Some(secs);
        self
    }

    pub fn has_approvers(&self) -> bool {
        !self.approver_users.is_empty() || !self.approver_roles.is_empty()
    }
}

// ── Workflow Draft ───────────────────────────────────────────────────

/// Caller-supplied content of a workflow version, before an id and
/// version number are assigned
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
    /// Opaque predicate data for callers choosing a workflow
    #[serde(default)]
    pub trigger_conditions: serde_json::Value,
    /// Higher wins when several workflows apply
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl WorkflowDraft {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps: Vec::new(),
            trigger_conditions: serde_json::Value::Null,
            priority: 0,
            is_active: true,
        }
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Check the draft and return its steps sorted by order
    pub fn validate(&self) -> ApprovalResult<Vec<WorkflowStep>> {
        if self.name.trim().is_empty() {
            return Err(invalid("workflow name must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(invalid("workflow must have at least one step"));
        }

        let mut steps = self.steps.clone();
        steps.sort_by_key(|s| s.order);
        for (index, step) in steps.iter().enumerate() {
            let expected = index as u32 + 1;
            if step.order != expected {
                return Err(invalid(format!(
                    "step orders must be 1..={} without gaps or duplicates (found {} at position {})",
                    steps.len(),
                    step.order,
                    expected
                )));
            }
            if !step.has_approvers() {
                return Err(invalid(format!(
                    "step {} ('{}') names no approver users or roles",
                    step.order, step.name
                )));
            }
            match step.escalation_timeout_secs {
                Some(0) => {
                    return Err(invalid(format!(
                        "step {} escalation timeout must be positive",
                        step.order
                    )));
                }
                Some(secs) if secs > MAX_ESCALATION_TIMEOUT_SECS => {
                    return Err(invalid(format!(
                        "step {} escalation timeout {} exceeds {} seconds",
                        step.order, secs, MAX_ESCALATION_TIMEOUT_SECS
                    )));
                }
                _ => {}
            }
        }
        Ok(steps)
    }
}

fn invalid(message: impl Into<String>) -> ApprovalError {
    ApprovalError::InvalidDefinition(message.into())
}

// ── Approval Workflow ────────────────────────────────────────────────

/// One immutable version of a workflow definition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalWorkflow {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Starts at 1, incremented on every edit
    pub version: u32,
    /// Sorted by `order`, orders are exactly `1..=n`
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub trigger_conditions: serde_json::Value,
    pub priority: i32,
    pub is_active: bool,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    /// When this version was written
    pub updated_at: DateTime<Utc>,
}

impl ApprovalWorkflow {
    /// Build version 1 from a validated draft
    pub fn create(
        id: WorkflowId,
        draft: WorkflowDraft,
        created_by: UserId,
        now: DateTime<Utc>,
    ) -> ApprovalResult<Self> {
        let steps = draft.validate()?;
        Ok(Self {
            id,
            name: draft.name,
            description: draft.description,
            version: 1,
            steps,
            trigger_conditions: draft.trigger_conditions,
            priority: draft.priority,
            is_active: draft.is_active,
            created_by,
            created_at: now,
            updated_at: now,
        })
    }

    /// Build the next version from an edited draft
    pub fn next_version(&self, draft: WorkflowDraft, now: DateTime<Utc>) -> ApprovalResult<Self> {
        let steps = draft.validate()?;
        Ok(Self {
            id: self.id.clone(),
            name: draft.name,
            description: draft.description,
            version: self.version + 1,
            steps,
            trigger_conditions: draft.trigger_conditions,
            priority: draft.priority,
            is_active: draft.is_active,
            created_by: self.created_by.clone(),
            created_at: self.created_at,
            updated_at: now,
        })
    }

    pub fn step(&self, order: u32) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.order == order)
    }

    pub fn step_count(&self) -> u32 {
        self.steps.len() as u32
    }

    pub fn is_last_step(&self, order: u32) -> bool {
        order == self.step_count()
    }

    /// Draft carrying this version's content, for edits
    pub fn to_draft(&self) -> WorkflowDraft {
        WorkflowDraft {
            name: self.name.clone(),
            description: self.description.clone(),
            steps: self.steps.clone(),
            trigger_conditions: self.trigger_conditions.clone(),
            priority: self.priority,
            is_active: self.is_active,
        }
    }
}
