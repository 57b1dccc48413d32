//! Board entities: projects, columns, tasks and comments.
//!
//! Identifiers are plain integers assigned by the store. Columns and tasks
//! carry a 1-based `order` that the ordering engine keeps dense within
//! their container (project for columns, column for tasks).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::SystemTime;

pub type ProjectId = i64;
pub type ColumnId = i64;
pub type TaskId = i64;
pub type CommentId = i64;
pub type UserId = i64;

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub description: String,
    /// Users allowed to see and edit the board
    pub members: BTreeSet<UserId>,
}

impl Project {
    pub fn is_member(&self, user: UserId) -> bool {
        self.members.contains(&user)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub id: ColumnId,
    pub project: ProjectId,
    pub name: String,
    pub order: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project: ProjectId,
    pub column: ColumnId,
    pub title: String,
    pub description: String,
    pub order: i64,
    pub created_at: u64,
    /// Deadline, seconds since epoch
    pub due_date: Option<u64>,
    pub is_complete: bool,
    pub assigned_to: Option<UserId>,
    pub labels: Vec<String>,
    pub estimated_minutes: Option<u32>,
    pub spent_minutes: u32,
}

impl Task {
    /// Take `column` and `order` from `other`, keep everything else.
    pub fn merge_position(&mut self, other: &Task) {
        self.column = other.column;
        self.order = other.order;
    }

    /// Take every editable field from `other` except `column` and `order`.
    pub fn merge_details(&mut self, other: &Task) {
        self.title.clone_from(&other.title);
        self.description.clone_from(&other.description);
        self.due_date = other.due_date;
        self.is_complete = other.is_complete;
        self.assigned_to = other.assigned_to;
        self.labels.clone_from(&other.labels);
        self.estimated_minutes = other.estimated_minutes;
        self.spent_minutes = other.spent_minutes;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub project: ProjectId,
    pub task: TaskId,
    pub author: UserId,
    pub text: String,
    pub created_at: u64,
}

/// Insert payload for a project; the store assigns the id.
#[derive(Debug, Clone, Default)]
pub struct NewProject {
    pub name: String,
    pub description: String,
    pub members: BTreeSet<UserId>,
}

impl NewProject {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_member(mut self, user: UserId) -> Self {
        self.members.insert(user);
        self
    }
}

#[derive(Debug, Clone)]
pub struct NewColumn {
    pub project: ProjectId,
    pub name: String,
    pub order: i64,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub project: ProjectId,
    pub column: ColumnId,
    pub title: String,
    pub description: String,
    pub order: i64,
}

#[derive(Debug, Clone)]
pub struct NewComment {
    pub project: ProjectId,
    pub task: TaskId,
    pub author: UserId,
    pub text: String,
}

/// Partial update of a task's descriptive fields.
///
/// `None` leaves the field untouched. Ordering, column, assignee and
/// deadline have dedicated operations because they publish their own events.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub is_complete: Option<bool>,
    pub labels: Option<Vec<String>>,
    pub estimated_minutes: Option<Option<u32>>,
    pub spent_minutes: Option<u32>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.is_complete.is_none()
            && self.labels.is_none()
            && self.estimated_minutes.is_none()
            && self.spent_minutes.is_none()
    }

    pub fn apply(self, task: &mut Task) {
        if let Some(title) = self.title {
            task.title = title;
        }
        if let Some(description) = self.description {
            task.description = description;
        }
        if let Some(done) = self.is_complete {
            task.is_complete = done;
        }
        if let Some(labels) = self.labels {
            task.labels = labels;
        }
        if let Some(estimate) = self.estimated_minutes {
            task.estimated_minutes = estimate;
        }
        if let Some(spent) = self.spent_minutes {
            task.spent_minutes = spent;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub description: Option<String>,
}
