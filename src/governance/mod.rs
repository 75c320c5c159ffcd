//! Draft governance: the lifecycle of proposed changes to the baseline
//! document that steers the agents.
//!
//! Exactly one draft may be in flight at a time, every state change is
//! recorded in an append-only event history, and nothing reaches the baseline
//! without a named human approver.

mod validation;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

pub use validation::{run_checks, ValidationCheck, ValidationReport};

use crate::config::ValidationConfig;
use crate::error::{GafferError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftState {
    Draft,
    Validating,
    Validated,
    CreatingTasks,
    ReadyForMerge,
    Merged,
    Failed,
}

impl DraftState {
    pub fn allowed_transitions(&self) -> &'static [DraftState] {
        use DraftState::*;
        match self {
            Draft => &[Validating],
            Validating => &[Validated, Failed],
            Validated => &[CreatingTasks],
            CreatingTasks => &[ReadyForMerge],
            ReadyForMerge => &[Merged],
            Merged | Failed => &[],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }
}

impl std::fmt::Display for DraftState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Validating => "validating",
            Self::Validated => "validated",
            Self::CreatingTasks => "creating_tasks",
            Self::ReadyForMerge => "ready_for_merge",
            Self::Merged => "merged",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// One entry in a draft's append-only history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftEvent {
    pub action: String,
    pub state: DraftState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub id: String,
    pub title: String,
    pub content: String,
    pub state: DraftState,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
    pub merged_by: Option<String>,
    pub validation: Option<ValidationReport>,
    pub task_ids: Vec<String>,
    pub history: Vec<DraftEvent>,
}

impl Draft {
    fn new(title: &str, content: &str, author: &str) -> Self {
        let now = Utc::now();
        let mut draft = Self {
            id: format!("draft_{}", Uuid::new_v4()),
            title: title.to_string(),
            content: content.to_string(),
            state: DraftState::Draft,
            author: author.to_string(),
            created_at: now,
            updated_at: now,
            merged_at: None,
            merged_by: None,
            validation: None,
            task_ids: Vec::new(),
            history: Vec::new(),
        };
        draft.record("created");
        draft
    }

    fn record(&mut self, action: &str) {
        self.history.push(DraftEvent {
            action: action.to_string(),
            state: self.state,
            timestamp: Utc::now(),
        });
        self.updated_at = Utc::now();
    }

    fn transition(&mut self, next: DraftState, action: &str) -> Result<()> {
        let allowed = self.state.allowed_transitions();
        if !allowed.contains(&next) {
            return Err(GafferError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
                allowed: allowed
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        }
        self.state = next;
        self.record(action);
        Ok(())
    }
}

/// Filters for [`DraftGovernor::list`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DraftFilter {
    pub state: Option<DraftState>,
    pub created_after: Option<DateTime<Utc>>,
}

pub struct DraftGovernor {
    config: ValidationConfig,
    drafts: Mutex<HashMap<String, Draft>>,
    baseline: Mutex<Option<String>>,
}

impl DraftGovernor {
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            config,
            drafts: Mutex::new(HashMap::new()),
            baseline: Mutex::new(None),
        }
    }

    pub fn with_baseline(self, baseline: impl Into<String>) -> Self {
        *self.baseline.lock() = Some(baseline.into());
        self
    }

    pub fn baseline(&self) -> Option<String> {
        self.baseline.lock().clone()
    }

    /// Create a new draft. Fails while any other draft is still in flight.
    pub fn create_draft(&self, title: &str, content: &str, author: &str) -> Result<Draft> {
        let mut drafts = self.drafts.lock();
        if let Some(active) = drafts.values().find(|d| !d.state.is_terminal()) {
            warn!(active = %active.id, "draft creation rejected, another draft is in flight");
            return Err(GafferError::ActiveDraftExists {
                id: active.id.clone(),
                state: active.state.to_string(),
            });
        }

        let draft = Draft::new(title, content, author);
        info!(draft = %draft.id, author, "draft created");
        drafts.insert(draft.id.clone(), draft.clone());
        Ok(draft)
    }

    /// Replace the content of a draft that has not entered validation yet.
    pub fn update_draft(&self, id: &str, content: &str) -> Result<Draft> {
        let mut drafts = self.drafts.lock();
        let draft = drafts
            .get_mut(id)
            .ok_or_else(|| GafferError::DraftNotFound(id.to_string()))?;
        if draft.state != DraftState::Draft {
            return Err(GafferError::DraftFrozen {
                id: draft.id.clone(),
                state: draft.state.to_string(),
            });
        }
        draft.content = content.to_string();
        draft.record("updated");
        Ok(draft.clone())
    }

    /// Run the validation battery and settle the draft as validated or failed.
    pub fn validate_draft(&self, id: &str) -> Result<Draft> {
        let baseline = self.baseline.lock().clone();
        let mut drafts = self.drafts.lock();
        let draft = drafts
            .get_mut(id)
            .ok_or_else(|| GafferError::DraftNotFound(id.to_string()))?;

        draft.transition(DraftState::Validating, "validation started")?;
        let report = run_checks(&draft.content, baseline.as_deref(), &self.config);

        if report.passed {
            draft.transition(DraftState::Validated, "validation passed")?;
        } else {
            let failed: Vec<&str> = report
                .checks
                .iter()
                .filter(|c| !c.passed)
                .map(|c| c.name.as_str())
                .collect();
            warn!(draft = %draft.id, checks = ?failed, "validation failed");
            draft.transition(DraftState::Failed, "validation failed")?;
        }
        draft.validation = Some(report);
        Ok(draft.clone())
    }

    /// Derive implementation task ids from a validated draft and mark it
    /// ready for merge.
    pub fn create_tasks(&self, id: &str, count: usize) -> Result<Draft> {
        let mut drafts = self.drafts.lock();
        let draft = drafts
            .get_mut(id)
            .ok_or_else(|| GafferError::DraftNotFound(id.to_string()))?;

        draft.transition(DraftState::CreatingTasks, "task creation started")?;
        draft.task_ids = (0..count.max(1))
            .map(|_| format!("task_{}", Uuid::new_v4()))
            .collect();
        draft.transition(DraftState::ReadyForMerge, "tasks created")?;
        info!(draft = %draft.id, tasks = draft.task_ids.len(), "draft ready for merge");
        Ok(draft.clone())
    }

    /// Merge a ready draft into the baseline. `approver` is the human signing
    /// off; an empty name is refused.
    pub fn merge_draft(&self, id: &str, approver: &str) -> Result<Draft> {
        let approver = approver.trim();
        if approver.is_empty() {
            return Err(GafferError::ApproverRequired);
        }

        let mut drafts = self.drafts.lock();
        let draft = drafts
            .get_mut(id)
            .ok_or_else(|| GafferError::DraftNotFound(id.to_string()))?;

        draft.transition(DraftState::Merged, &format!("merged by {}", approver))?;
        draft.merged_at = Some(Utc::now());
        draft.merged_by = Some(approver.to_string());
        *self.baseline.lock() = Some(draft.content.clone());
        info!(draft = %draft.id, approver, "draft merged into baseline");
        Ok(draft.clone())
    }

    pub fn get(&self, id: &str) -> Result<Draft> {
        self.drafts
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| GafferError::DraftNotFound(id.to_string()))
    }

    /// Drafts matching `filter`, newest first.
    pub fn list(&self, filter: &DraftFilter) -> Vec<Draft> {
        let drafts = self.drafts.lock();
        let mut matched: Vec<Draft> = drafts
            .values()
            .filter(|d| filter.state.map_or(true, |s| d.state == s))
            .filter(|d| filter.created_after.map_or(true, |t| d.created_at > t))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matched
    }

    pub fn history(&self, id: &str) -> Result<Vec<DraftEvent>> {
        Ok(self.get(id)?.history)
    }
}
