//! Board persistence.
//!
//! The collaboration core only needs a handful of scoped reads and writes,
//! expressed by [`BoardStore`]. Two backends:
//! - [`MemoryStore`] — ordered maps behind a tokio `RwLock`
//! - [`RocksStore`]  — RocksDB, one column family per entity kind

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{
    Column, ColumnId, Comment, CommentId, NewColumn, NewComment, NewProject, NewTask, Project,
    ProjectId, Task, TaskId,
};

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// The storage collaborator.
///
/// Lookups that take a `ProjectId` are scoped: an entity that exists but
/// belongs to another project is reported as absent. Listing methods return
/// entities in no particular order; callers sort with
/// [`crate::ordering::sort_siblings`].
#[async_trait]
pub trait BoardStore: Send + Sync {
    async fn project(&self, id: ProjectId) -> Result<Option<Project>, StoreError>;

    async fn project_exists(&self, id: ProjectId) -> Result<bool, StoreError> {
        Ok(self.project(id).await?.is_some())
    }

    async fn insert_project(&self, new: NewProject) -> Result<Project, StoreError>;

    async fn save_project(&self, project: &Project) -> Result<(), StoreError>;

    async fn column(
        &self,
        project: ProjectId,
        id: ColumnId,
    ) -> Result<Option<Column>, StoreError>;

    async fn columns(&self, project: ProjectId) -> Result<Vec<Column>, StoreError>;

    async fn insert_column(&self, new: NewColumn) -> Result<Column, StoreError>;

    /// Write several columns atomically.
    async fn save_columns(&self, columns: &[Column]) -> Result<(), StoreError>;

    async fn task(&self, project: ProjectId, id: TaskId) -> Result<Option<Task>, StoreError>;

    async fn tasks(&self, project: ProjectId, column: ColumnId) -> Result<Vec<Task>, StoreError>;

    /// Every task of a project, across its columns.
    async fn project_tasks(&self, project: ProjectId) -> Result<Vec<Task>, StoreError>;

    async fn insert_task(&self, new: NewTask) -> Result<Task, StoreError>;

    /// Write `column` and `order` of several tasks atomically.
    ///
    /// Only those two fields are taken from the arguments. Tasks deleted
    /// since they were read stay deleted.
    async fn save_positions(&self, tasks: &[Task]) -> Result<(), StoreError>;

    /// Write every field of a task except `column` and `order`, which keep
    /// their stored values. Returns the stored row, or `None` when the task
    /// no longer exists.
    async fn update_task(&self, task: &Task) -> Result<Option<Task>, StoreError>;

    /// Remove a task and its comments; returns the removed task.
    async fn delete_task(&self, project: ProjectId, id: TaskId)
        -> Result<Option<Task>, StoreError>;

    async fn comment(
        &self,
        project: ProjectId,
        id: CommentId,
    ) -> Result<Option<Comment>, StoreError>;

    async fn comments(&self, project: ProjectId, task: TaskId)
        -> Result<Vec<Comment>, StoreError>;

    async fn insert_comment(&self, new: NewComment) -> Result<Comment, StoreError>;

    async fn save_comment(&self, comment: &Comment) -> Result<(), StoreError>;

    async fn delete_comment(
        &self,
        project: ProjectId,
        id: CommentId,
    ) -> Result<Option<Comment>, StoreError>;
}
