//! In-memory board store.
//!
//! Used by the server when no storage path is configured and by tests.
//! All tables sit behind one tokio `RwLock`, so a multi-entity save is
//! atomic with respect to readers.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::{BoardStore, StoreError};
use crate::model::{
    unix_now, Column, ColumnId, Comment, CommentId, NewColumn, NewComment, NewProject, NewTask,
    Project, ProjectId, Task, TaskId,
};

#[derive(Debug, Default)]
struct Tables {
    projects: BTreeMap<ProjectId, Project>,
    columns: BTreeMap<ColumnId, Column>,
    tasks: BTreeMap<TaskId, Task>,
    comments: BTreeMap<CommentId, Comment>,
    last_project: i64,
    last_column: i64,
    last_task: i64,
    last_comment: i64,
}

fn next_id(last: &mut i64) -> i64 {
    *last += 1;
    *last
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tasks across all projects.
    pub async fn task_count(&self) -> usize {
        self.tables.read().await.tasks.len()
    }
}

#[async_trait]
impl BoardStore for MemoryStore {
    async fn project(&self, id: ProjectId) -> Result<Option<Project>, StoreError> {
        Ok(self.tables.read().await.projects.get(&id).cloned())
    }

    async fn insert_project(&self, new: NewProject) -> Result<Project, StoreError> {
        let mut tables = self.tables.write().await;
        let project = Project {
            id: next_id(&mut tables.last_project),
            name: new.name,
            description: new.description,
            members: new.members,
        };
        tables.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn save_project(&self, project: &Project) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.projects.insert(project.id, project.clone());
        Ok(())
    }

    async fn column(
        &self,
        project: ProjectId,
        id: ColumnId,
    ) -> Result<Option<Column>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .columns
            .get(&id)
            .filter(|c| c.project == project)
            .cloned())
    }

    async fn columns(&self, project: ProjectId) -> Result<Vec<Column>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .columns
            .values()
            .filter(|c| c.project == project)
            .cloned()
            .collect())
    }

    async fn insert_column(&self, new: NewColumn) -> Result<Column, StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.projects.contains_key(&new.project) {
            return Err(StoreError::NotFound {
                kind: "project",
                id: new.project,
            });
        }
        let column = Column {
            id: next_id(&mut tables.last_column),
            project: new.project,
            name: new.name,
            order: new.order,
        };
        tables.columns.insert(column.id, column.clone());
        Ok(column)
    }

    async fn save_columns(&self, columns: &[Column]) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        for column in columns {
            tables.columns.insert(column.id, column.clone());
        }
        Ok(())
    }

    async fn task(&self, project: ProjectId, id: TaskId) -> Result<Option<Task>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .tasks
            .get(&id)
            .filter(|t| t.project == project)
            .cloned())
    }

    async fn tasks(&self, project: ProjectId, column: ColumnId) -> Result<Vec<Task>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .tasks
            .values()
            .filter(|t| t.project == project && t.column == column)
            .cloned()
            .collect())
    }

    async fn project_tasks(&self, project: ProjectId) -> Result<Vec<Task>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .tasks
            .values()
            .filter(|t| t.project == project)
            .cloned()
            .collect())
    }

    async fn insert_task(&self, new: NewTask) -> Result<Task, StoreError> {
        let mut tables = self.tables.write().await;
        let task = Task {
            id: next_id(&mut tables.last_task),
            project: new.project,
            column: new.column,
            title: new.title,
            description: new.description,
            order: new.order,
            created_at: unix_now(),
            due_date: None,
            is_complete: false,
            assigned_to: None,
            labels: Vec::new(),
            estimated_minutes: None,
            spent_minutes: 0,
        };
        tables.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn save_positions(&self, tasks: &[Task]) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        for task in tasks {
            if let Some(stored) = tables.tasks.get_mut(&task.id) {
                stored.merge_position(task);
            }
        }
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<Option<Task>, StoreError> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .tasks
            .get_mut(&task.id)
            .filter(|stored| stored.project == task.project)
            .map(|stored| {
                stored.merge_details(task);
                stored.clone()
            }))
    }

    async fn delete_task(
        &self,
        project: ProjectId,
        id: TaskId,
    ) -> Result<Option<Task>, StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.tasks.get(&id).is_some_and(|t| t.project == project) {
            return Ok(None);
        }
        let removed = tables.tasks.remove(&id);
        tables.comments.retain(|_, c| c.task != id);
        Ok(removed)
    }

    async fn comment(
        &self,
        project: ProjectId,
        id: CommentId,
    ) -> Result<Option<Comment>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .comments
            .get(&id)
            .filter(|c| c.project == project)
            .cloned())
    }

    async fn comments(
        &self,
        project: ProjectId,
        task: TaskId,
    ) -> Result<Vec<Comment>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .comments
            .values()
            .filter(|c| c.project == project && c.task == task)
            .cloned()
            .collect())
    }

    async fn insert_comment(&self, new: NewComment) -> Result<Comment, StoreError> {
        let mut tables = self.tables.write().await;
        let comment = Comment {
            id: next_id(&mut tables.last_comment),
            project: new.project,
            task: new.task,
            author: new.author,
            text: new.text,
            created_at: unix_now(),
        };
        tables.comments.insert(comment.id, comment.clone());
        Ok(comment)
    }

    async fn save_comment(&self, comment: &Comment) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        tables.comments.insert(comment.id, comment.clone());
        Ok(())
    }

    async fn delete_comment(
        &self,
        project: ProjectId,
        id: CommentId,
    ) -> Result<Option<Comment>, StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.comments.get(&id).is_some_and(|c| c.project == project) {
            return Ok(None);
        }
        Ok(tables.comments.remove(&id))
    }
}
