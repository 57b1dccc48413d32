//! JSON wire protocol between board clients and the server.
//!
//! Every frame is a JSON object tagged by `action`:
//! ```text
//! client → server   {"action": "move_task", "task_id": 4, "new_order": 2}
//! server → group    {"action": "task_moved", "task": {..}, "columns": [..]}
//! ```
//!
//! Inbound actions the server does not recognise are echoed to the group
//! unchanged, so clients can use the socket as a plain relay for their own
//! message kinds.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::model::{Column, ColumnId, Comment, CommentId, Project, ProjectId, Task, TaskId};

/// Close code sent when the addressed project does not exist.
/// Clients should not retry against the same id.
pub const CLOSE_PROJECT_NOT_FOUND: u16 = 4001;

fn first_position() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveTask {
    pub task_id: TaskId,
    /// Destination column; `None` keeps the task in its column
    #[serde(default)]
    pub new_column: Option<ColumnId>,
    #[serde(default = "first_position")]
    pub new_order: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveColumn {
    pub column_id: ColumnId,
    #[serde(default = "first_position")]
    pub new_order: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddColumn {
    pub column_name: String,
    #[serde(default)]
    pub order: i64,
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientAction {
    MoveTask(MoveTask),
    MoveColumn(MoveColumn),
    AddColumn(AddColumn),
    /// Anything else, kept verbatim for the echo
    Passthrough(Map<String, Value>),
}

impl ClientAction {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        match serde_json::from_str::<Value>(text)? {
            Value::Object(content) => Self::from_object(content),
            _ => Err(ProtocolError::NotAnObject),
        }
    }

    /// Interpret an already-parsed JSON object.
    ///
    /// Missing numeric fields take their defaults; a known action whose
    /// identifier is missing or mistyped is an `InvalidPayload` error.
    pub fn from_object(content: Map<String, Value>) -> Result<Self, ProtocolError> {
        let action = content
            .get("action")
            .and_then(Value::as_str)
            .map(str::to_owned);
        match action.as_deref() {
            Some("move_task") => typed(content, "move_task", ClientAction::MoveTask),
            Some("move_column") => typed(content, "move_column", ClientAction::MoveColumn),
            Some("add_column") => typed(content, "add_column", ClientAction::AddColumn),
            _ => Ok(ClientAction::Passthrough(content)),
        }
    }

    /// The `action` discriminator, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            ClientAction::MoveTask(_) => Some("move_task"),
            ClientAction::MoveColumn(_) => Some("move_column"),
            ClientAction::AddColumn(_) => Some("add_column"),
            ClientAction::Passthrough(content) => content.get("action").and_then(Value::as_str),
        }
    }

    /// Encode as a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let content = match self {
            ClientAction::MoveTask(payload) => tagged(payload, "move_task")?,
            ClientAction::MoveColumn(payload) => tagged(payload, "move_column")?,
            ClientAction::AddColumn(payload) => tagged(payload, "add_column")?,
            ClientAction::Passthrough(content) => content.clone(),
        };
        Ok(serde_json::to_string(&content)?)
    }
}

fn typed<T: DeserializeOwned>(
    content: Map<String, Value>,
    action: &'static str,
    wrap: fn(T) -> ClientAction,
) -> Result<ClientAction, ProtocolError> {
    serde_json::from_value(Value::Object(content))
        .map(wrap)
        .map_err(|e| ProtocolError::InvalidPayload {
            action,
            reason: e.to_string(),
        })
}

fn tagged<T: Serialize>(payload: &T, action: &str) -> Result<Map<String, Value>, ProtocolError> {
    let mut content = match serde_json::to_value(payload)? {
        Value::Object(content) => content,
        _ => return Err(ProtocolError::NotAnObject),
    };
    content.insert("action".into(), Value::String(action.into()));
    Ok(content)
}

/// Nested representation of a column with its tasks in board order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnView {
    pub id: ColumnId,
    pub project: ProjectId,
    pub name: String,
    pub order: i64,
    pub tasks: Vec<Task>,
}

impl ColumnView {
    pub fn new(column: Column, tasks: Vec<Task>) -> Self {
        Self {
            id: column.id,
            project: column.project,
            name: column.name,
            order: column.order,
            tasks,
        }
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id).collect()
    }
}

/// State change fanned out to every member of a project group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BoardEvent {
    /// Source column first, destination second when the task changed column
    TaskMoved { task: Task, columns: Vec<ColumnView> },
    TaskCreated { task: Task },
    TaskUpdated { task: Task },
    TaskDeleted { task_id: TaskId, column: ColumnView },
    /// Every column of the project in its new order
    ColumnMoved { columns: Vec<ColumnView> },
    ColumnAdded { column: ColumnView },
    CommentCreated { comment: Comment },
    CommentUpdated { comment: Comment },
    CommentDeleted { comment_id: CommentId, task_id: TaskId },
    ProjectUpdated { project: Project },
    UserAssigned { task: Task },
    TaskUnassigned { task: Task },
    DeadlineUpdated { task: Task },
}

impl BoardEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BoardEvent::TaskMoved { .. } => "task_moved",
            BoardEvent::TaskCreated { .. } => "task_created",
            BoardEvent::TaskUpdated { .. } => "task_updated",
            BoardEvent::TaskDeleted { .. } => "task_deleted",
            BoardEvent::ColumnMoved { .. } => "column_moved",
            BoardEvent::ColumnAdded { .. } => "column_added",
            BoardEvent::CommentCreated { .. } => "comment_created",
            BoardEvent::CommentUpdated { .. } => "comment_updated",
            BoardEvent::CommentDeleted { .. } => "comment_deleted",
            BoardEvent::ProjectUpdated { .. } => "project_updated",
            BoardEvent::UserAssigned { .. } => "user_assigned",
            BoardEvent::TaskUnassigned { .. } => "task_unassigned",
            BoardEvent::DeadlineUpdated { .. } => "deadline_updated",
        }
    }
}

/// Anything the server pushes to a group.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(BoardEvent),
    /// Unrecognised client content, republished as-is
    Echo(Map<String, Value>),
}

impl Outbound {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let text = match self {
            Outbound::Event(event) => serde_json::to_string(event)?,
            Outbound::Echo(content) => serde_json::to_string(content)?,
        };
        Ok(text)
    }

    /// Decode a server frame. Objects that are not a well-formed board
    /// event come back as `Echo`.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let content = match serde_json::from_str::<Value>(text)? {
            Value::Object(content) => content,
            _ => return Err(ProtocolError::NotAnObject),
        };
        match serde_json::from_value::<BoardEvent>(Value::Object(content.clone())) {
            Ok(event) => Ok(Outbound::Event(event)),
            Err(_) => Ok(Outbound::Echo(content)),
        }
    }

    pub fn action(&self) -> Option<&str> {
        match self {
            Outbound::Event(event) => Some(event.name()),
            Outbound::Echo(content) => content.get("action").and_then(Value::as_str),
        }
    }

    pub fn into_event(self) -> Option<BoardEvent> {
        match self {
            Outbound::Event(event) => Some(event),
            Outbound::Echo(_) => None,
        }
    }
}

impl From<BoardEvent> for Outbound {
    fn from(event: BoardEvent) -> Self {
        Outbound::Event(event)
    }
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("invalid {action} payload: {reason}")]
    InvalidPayload {
        action: &'static str,
        reason: String,
    },
}
