//! Board mutations and the events they publish.
//!
//! Every write to a project goes through [`BoardService`]: it loads the
//! affected siblings from the store, runs the ordering engine, writes back
//! only what changed and publishes one event to the project's group. Both
//! the connection handler (client actions) and server-side callers use it.
//!
//! Renumbering is read-then-write. With `serialize_moves` enabled, every
//! write to one project runs under a per-project mutex and re-reads what
//! it changes inside it; other projects are unaffected.
//!
//! The ordering path only ever stores `column` and `order`
//! ([`BoardStore::save_positions`]); every other task writer only stores
//! the remaining fields ([`BoardStore::update_task`]). A stale row from
//! one path therefore never undoes the other, lock or no lock.

use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::broadcast::ProjectChannel;
use crate::membership::GroupKey;
use crate::model::{
    Column, ColumnId, Comment, CommentId, NewColumn, NewComment, NewProject, NewTask,
    Project, ProjectId, ProjectPatch, Task, TaskId, TaskPatch, UserId,
};
use crate::ordering::{self, Ordered, Renumbered};
use crate::protocol::{AddColumn, BoardEvent, ColumnView, MoveColumn, MoveTask, ProtocolError};
use crate::storage::{BoardStore, StoreError};

/// Errors raised by board operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("project {0} not found")]
    ProjectNotFound(ProjectId),
    #[error("column {column} not found in project {project}")]
    ColumnNotFound { project: ProjectId, column: ColumnId },
    #[error("task {task} not found in project {project}")]
    TaskNotFound { project: ProjectId, task: TaskId },
    #[error("comment {comment} not found in project {project}")]
    CommentNotFound {
        project: ProjectId,
        comment: CommentId,
    },
    #[error("user {user} is not a member of project {project}")]
    NotAMember { project: ProjectId, user: UserId },
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ServiceError {
    /// The addressed entity does not exist in the project.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ServiceError::ProjectNotFound(_)
                | ServiceError::ColumnNotFound { .. }
                | ServiceError::TaskNotFound { .. }
                | ServiceError::CommentNotFound { .. }
                | ServiceError::Store(StoreError::NotFound { .. })
        )
    }
}

type MoveLocks = DashMap<ProjectId, Arc<Mutex<()>>>;

/// Applies board mutations to the store and publishes their events.
pub struct BoardService {
    store: Arc<dyn BoardStore>,
    channel: Arc<ProjectChannel>,
    move_locks: Option<MoveLocks>,
}

impl BoardService {
    pub fn new(store: Arc<dyn BoardStore>, channel: Arc<ProjectChannel>) -> Self {
        Self {
            store,
            channel,
            move_locks: Some(MoveLocks::new()),
        }
    }

    /// Let writes to one project interleave.
    ///
    /// No task is lost, duplicated or brought back after a delete, but two
    /// concurrent moves into one column may leave a repeated or skipped
    /// `order` there until the next move in that column renumbers it.
    pub fn without_move_lock(mut self) -> Self {
        self.move_locks = None;
        self
    }

    pub fn serializes_moves(&self) -> bool {
        self.move_locks.is_some()
    }

    pub fn store(&self) -> &Arc<dyn BoardStore> {
        &self.store
    }

    pub fn channel(&self) -> &Arc<ProjectChannel> {
        &self.channel
    }

    async fn lock_project(&self, project: ProjectId) -> Option<OwnedMutexGuard<()>> {
        let locks = self.move_locks.as_ref()?;
        let lock = Arc::clone(&locks.entry(project).or_default());
        Some(lock.lock_owned().await)
    }

    fn publish(&self, project: ProjectId, event: BoardEvent) -> Result<(), ServiceError> {
        self.channel.publish(GroupKey::project(project), event)?;
        Ok(())
    }

    // ── Lookups ──────────────────────────────────────────────

    pub async fn project_exists(&self, project: ProjectId) -> Result<bool, ServiceError> {
        Ok(self.store.project_exists(project).await?)
    }

    async fn require_project(&self, id: ProjectId) -> Result<Project, ServiceError> {
        self.store
            .project(id)
            .await?
            .ok_or(ServiceError::ProjectNotFound(id))
    }

    async fn require_column(
        &self,
        project: ProjectId,
        column: ColumnId,
    ) -> Result<Column, ServiceError> {
        self.store
            .column(project, column)
            .await?
            .ok_or(ServiceError::ColumnNotFound { project, column })
    }

    async fn require_task(&self, project: ProjectId, task: TaskId) -> Result<Task, ServiceError> {
        self.store
            .task(project, task)
            .await?
            .ok_or(ServiceError::TaskNotFound { project, task })
    }

    async fn require_comment(
        &self,
        project: ProjectId,
        comment: CommentId,
    ) -> Result<Comment, ServiceError> {
        self.store
            .comment(project, comment)
            .await?
            .ok_or(ServiceError::CommentNotFound { project, comment })
    }

    async fn sorted_tasks(
        &self,
        project: ProjectId,
        column: ColumnId,
    ) -> Result<Vec<Task>, ServiceError> {
        let mut tasks = self.store.tasks(project, column).await?;
        ordering::sort_siblings(&mut tasks);
        Ok(tasks)
    }

    async fn column_view(&self, column: Column) -> Result<ColumnView, ServiceError> {
        let tasks = self.sorted_tasks(column.project, column.id).await?;
        Ok(ColumnView::new(column, tasks))
    }

    /// Columns of a project in board order, each with its tasks.
    pub async fn board(&self, project: ProjectId) -> Result<Vec<ColumnView>, ServiceError> {
        self.require_project(project).await?;
        let mut columns = self.store.columns(project).await?;
        ordering::sort_siblings(&mut columns);
        let mut views = Vec::with_capacity(columns.len());
        for column in columns {
            views.push(self.column_view(column).await?);
        }
        Ok(views)
    }

    // ── Ordering ─────────────────────────────────────────────

    /// Move a column to a new 1-based position and publish the whole
    /// reordered column list.
    pub async fn move_column(
        &self,
        project: ProjectId,
        request: MoveColumn,
    ) -> Result<Vec<ColumnView>, ServiceError> {
        let _guard = self.lock_project(project).await;
        let column = self.require_column(project, request.column_id).await?;
        let siblings = self.store.columns(project).await?;

        let result = ordering::reorder(column, siblings, request.new_order);
        if !result.is_unchanged() {
            self.store.save_columns(&changed(&result, None)).await?;
        }

        let mut views = Vec::with_capacity(result.items.len());
        for column in result.into_items() {
            views.push(self.column_view(column).await?);
        }
        log::debug!(
            "Column {} of project {project} moved to {}",
            request.column_id,
            request.new_order
        );
        self.publish(project, BoardEvent::ColumnMoved { columns: views.clone() })?;
        Ok(views)
    }

    /// Move a task within its column or into another column of the same
    /// project. The event lists the source column first, then the
    /// destination when it differs.
    pub async fn move_task(&self, project: ProjectId, request: MoveTask) -> Result<Task, ServiceError> {
        let _guard = self.lock_project(project).await;
        let mut task = self.require_task(project, request.task_id).await?;
        let source_id = task.column;
        let target_id = request.new_column.unwrap_or(source_id);
        let source = self.require_column(project, source_id).await?;

        let (moved, columns) = if target_id == source_id {
            let siblings = self.store.tasks(project, source_id).await?;
            let result = ordering::reorder(task, siblings, request.new_order);
            if !result.is_unchanged() {
                self.store.save_positions(&changed(&result, None)).await?;
            }
            let moved = result
                .get(request.task_id)
                .cloned()
                .ok_or(ServiceError::TaskNotFound {
                    project,
                    task: request.task_id,
                })?;
            (moved, vec![ColumnView::new(source, result.into_items())])
        } else {
            let target = self.require_column(project, target_id).await?;

            let mut remaining = self.store.tasks(project, source_id).await?;
            remaining.retain(|t| t.id != task.id);
            let closed = ordering::compact(remaining);

            task.column = target_id;
            let siblings = self.store.tasks(project, target_id).await?;
            let opened = ordering::reorder(task, siblings, request.new_order);

            // The moved task changed column even if its rank did not
            let mut writes = changed(&closed, None);
            writes.extend(changed(&opened, Some(request.task_id)));
            self.store.save_positions(&writes).await?;

            let moved = opened
                .get(request.task_id)
                .cloned()
                .ok_or(ServiceError::TaskNotFound {
                    project,
                    task: request.task_id,
                })?;
            (
                moved,
                vec![
                    ColumnView::new(source, closed.into_items()),
                    ColumnView::new(target, opened.into_items()),
                ],
            )
        };

        log::debug!(
            "Task {} of project {project} moved to column {} position {}",
            moved.id,
            moved.column,
            moved.order
        );
        self.publish(
            project,
            BoardEvent::TaskMoved {
                task: moved.clone(),
                columns,
            },
        )?;
        Ok(moved)
    }

    /// Create a column with the requested order as given.
    ///
    /// Existing columns are not renumbered; the next move in the project
    /// compacts the list again.
    pub async fn add_column(
        &self,
        project: ProjectId,
        request: AddColumn,
    ) -> Result<Column, ServiceError> {
        let _guard = self.lock_project(project).await;
        self.require_project(project).await?;
        let column = self
            .store
            .insert_column(NewColumn {
                project,
                name: request.column_name,
                order: request.order,
            })
            .await?;
        log::debug!("Column {} added to project {project}", column.id);
        self.publish(
            project,
            BoardEvent::ColumnAdded {
                column: ColumnView::new(column.clone(), Vec::new()),
            },
        )?;
        Ok(column)
    }

    // ── Projects ─────────────────────────────────────────────

    /// Create a project. Nobody can be subscribed yet, so nothing is published.
    pub async fn create_project(&self, new: NewProject) -> Result<Project, ServiceError> {
        let project = self.store.insert_project(new).await?;
        log::info!("Created project {} ({})", project.id, project.name);
        Ok(project)
    }

    pub async fn update_project(
        &self,
        project: ProjectId,
        patch: ProjectPatch,
    ) -> Result<Project, ServiceError> {
        let _guard = self.lock_project(project).await;
        let mut current = self.require_project(project).await?;
        if let Some(name) = patch.name {
            current.name = name;
        }
        if let Some(description) = patch.description {
            current.description = description;
        }
        self.save_and_publish_project(current).await
    }

    pub async fn add_member(
        &self,
        project: ProjectId,
        user: UserId,
    ) -> Result<Project, ServiceError> {
        let _guard = self.lock_project(project).await;
        let mut current = self.require_project(project).await?;
        if !current.members.insert(user) {
            return Ok(current);
        }
        self.save_and_publish_project(current).await
    }

    /// Remove a member and unassign them from every task of the project.
    pub async fn remove_member(
        &self,
        project: ProjectId,
        user: UserId,
    ) -> Result<Project, ServiceError> {
        let _guard = self.lock_project(project).await;
        let mut current = self.require_project(project).await?;
        if !current.members.remove(&user) {
            return Ok(current);
        }
        let project = self.save_and_publish_project(current).await?;

        let mut assigned = self.store.project_tasks(project.id).await?;
        assigned.retain(|task| task.assigned_to == Some(user));
        assigned.sort_by_key(|task| task.id);
        for mut task in assigned {
            task.assigned_to = None;
            if let Some(task) = self.store.update_task(&task).await? {
                self.publish(project.id, BoardEvent::TaskUnassigned { task })?;
            }
        }
        Ok(project)
    }

    async fn save_and_publish_project(&self, project: Project) -> Result<Project, ServiceError> {
        self.store.save_project(&project).await?;
        self.publish(
            project.id,
            BoardEvent::ProjectUpdated {
                project: project.clone(),
            },
        )?;
        Ok(project)
    }

    // ── Tasks ────────────────────────────────────────────────

    /// Append a new task at the end of a column.
    pub async fn create_task(
        &self,
        project: ProjectId,
        column: ColumnId,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Task, ServiceError> {
        let _guard = self.lock_project(project).await;
        self.require_column(project, column).await?;
        let count = self.store.tasks(project, column).await?.len();
        let task = self
            .store
            .insert_task(NewTask {
                project,
                column,
                title: title.into(),
                description: description.into(),
                order: count as i64 + 1,
            })
            .await?;
        log::debug!("Task {} created in column {column}", task.id);
        self.publish(project, BoardEvent::TaskCreated { task: task.clone() })?;
        Ok(task)
    }

    pub async fn update_task(
        &self,
        project: ProjectId,
        task: TaskId,
        patch: TaskPatch,
    ) -> Result<Task, ServiceError> {
        let _guard = self.lock_project(project).await;
        let mut current = self.require_task(project, task).await?;
        if patch.is_empty() {
            return Ok(current);
        }
        patch.apply(&mut current);
        let stored = self.store_details(&current).await?;
        self.publish(
            project,
            BoardEvent::TaskUpdated {
                task: stored.clone(),
            },
        )?;
        Ok(stored)
    }

    /// Delete a task with its comments and close the gap it leaves.
    pub async fn delete_task(
        &self,
        project: ProjectId,
        task: TaskId,
    ) -> Result<ColumnView, ServiceError> {
        let _guard = self.lock_project(project).await;
        let removed = self
            .store
            .delete_task(project, task)
            .await?
            .ok_or(ServiceError::TaskNotFound { project, task })?;
        let column = self.require_column(project, removed.column).await?;

        let result = ordering::compact(self.store.tasks(project, removed.column).await?);
        if !result.is_unchanged() {
            self.store.save_positions(&changed(&result, None)).await?;
        }
        let view = ColumnView::new(column, result.into_items());

        log::debug!("Task {task} deleted from column {}", view.id);
        self.publish(
            project,
            BoardEvent::TaskDeleted {
                task_id: task,
                column: view.clone(),
            },
        )?;
        Ok(view)
    }

    /// Assign a task to a project member.
    pub async fn assign_user(
        &self,
        project: ProjectId,
        task: TaskId,
        user: UserId,
    ) -> Result<Task, ServiceError> {
        let _guard = self.lock_project(project).await;
        let board = self.require_project(project).await?;
        if !board.is_member(user) {
            return Err(ServiceError::NotAMember { project, user });
        }
        let mut current = self.require_task(project, task).await?;
        current.assigned_to = Some(user);
        let stored = self.store_details(&current).await?;
        self.publish(
            project,
            BoardEvent::UserAssigned {
                task: stored.clone(),
            },
        )?;
        Ok(stored)
    }

    pub async fn unassign_user(&self, project: ProjectId, task: TaskId) -> Result<Task, ServiceError> {
        let _guard = self.lock_project(project).await;
        let mut current = self.require_task(project, task).await?;
        current.assigned_to = None;
        let stored = self.store_details(&current).await?;
        self.publish(
            project,
            BoardEvent::TaskUnassigned {
                task: stored.clone(),
            },
        )?;
        Ok(stored)
    }

    /// Set or clear a task's deadline (seconds since epoch).
    pub async fn set_deadline(
        &self,
        project: ProjectId,
        task: TaskId,
        due: Option<u64>,
    ) -> Result<Task, ServiceError> {
        let _guard = self.lock_project(project).await;
        let mut current = self.require_task(project, task).await?;
        current.due_date = due;
        let stored = self.store_details(&current).await?;
        self.publish(
            project,
            BoardEvent::DeadlineUpdated {
                task: stored.clone(),
            },
        )?;
        Ok(stored)
    }

    /// Write the non-positional fields of `task`, which may have been
    /// deleted since it was read.
    async fn store_details(&self, task: &Task) -> Result<Task, ServiceError> {
        self.store
            .update_task(task)
            .await?
            .ok_or(ServiceError::TaskNotFound {
                project: task.project,
                task: task.id,
            })
    }

    // ── Comments ─────────────────────────────────────────────

    pub async fn add_comment(
        &self,
        project: ProjectId,
        task: TaskId,
        author: UserId,
        text: impl Into<String>,
    ) -> Result<Comment, ServiceError> {
        self.require_task(project, task).await?;
        let comment = self
            .store
            .insert_comment(NewComment {
                project,
                task,
                author,
                text: text.into(),
            })
            .await?;
        self.publish(
            project,
            BoardEvent::CommentCreated {
                comment: comment.clone(),
            },
        )?;
        Ok(comment)
    }

    pub async fn update_comment(
        &self,
        project: ProjectId,
        comment: CommentId,
        text: impl Into<String>,
    ) -> Result<Comment, ServiceError> {
        let mut current = self.require_comment(project, comment).await?;
        current.text = text.into();
        self.store.save_comment(&current).await?;
        self.publish(
            project,
            BoardEvent::CommentUpdated {
                comment: current.clone(),
            },
        )?;
        Ok(current)
    }

    pub async fn delete_comment(
        &self,
        project: ProjectId,
        comment: CommentId,
    ) -> Result<Comment, ServiceError> {
        let removed = self
            .store
            .delete_comment(project, comment)
            .await?
            .ok_or(ServiceError::CommentNotFound { project, comment })?;
        self.publish(
            project,
            BoardEvent::CommentDeleted {
                comment_id: removed.id,
                task_id: removed.task,
            },
        )?;
        Ok(removed)
    }
}

/// Entities to write back after a renumbering pass, plus `always` when given.
fn changed<T: Ordered + Clone>(result: &Renumbered<T>, always: Option<i64>) -> Vec<T> {
    let forced = always
        .filter(|key| !result.was_changed(*key))
        .and_then(|key| result.get(key));
    result.changed_items().chain(forced).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MembershipRegistry;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::{mpsc, Notify};
    use tokio::time::{sleep, Duration};
    use uuid::Uuid;

    struct Fixture {
        service: BoardService,
        project: Project,
        todo: Column,
        done: Column,
    }

    async fn fixture() -> Fixture {
        fixture_on(Arc::new(MemoryStore::new()), true).await
    }

    async fn fixture_on(store: Arc<dyn BoardStore>, serialize: bool) -> Fixture {
        let channel = Arc::new(ProjectChannel::new(Arc::new(MembershipRegistry::new())));
        let mut service = BoardService::new(store, channel);
        if !serialize {
            service = service.without_move_lock();
        }
        let project = service
            .create_project(NewProject::new("Board").with_member(1))
            .await
            .unwrap();
        let todo = service
            .add_column(
                project.id,
                AddColumn {
                    column_name: "To do".into(),
                    order: 1,
                },
            )
            .await
            .unwrap();
        let done = service
            .add_column(
                project.id,
                AddColumn {
                    column_name: "Done".into(),
                    order: 2,
                },
            )
            .await
            .unwrap();
        Fixture {
            service,
            project,
            todo,
            done,
        }
    }

    fn subscribe(service: &BoardService, project: ProjectId) -> mpsc::Receiver<Arc<str>> {
        let (tx, rx) = mpsc::channel(64);
        service
            .channel()
            .registry()
            .join(GroupKey::project(project), Uuid::new_v4(), tx);
        rx
    }

    fn next_event(rx: &mut mpsc::Receiver<Arc<str>>) -> BoardEvent {
        let frame = rx.try_recv().expect("an event was published");
        serde_json::from_str(&frame).unwrap()
    }

    async fn tasks(f: &Fixture, column: ColumnId, titles: &[&str]) -> Vec<Task> {
        let mut created = Vec::new();
        for title in titles {
            created.push(
                f.service
                    .create_task(f.project.id, column, *title, "")
                    .await
                    .unwrap(),
            );
        }
        created
    }

    fn orders(view: &ColumnView) -> Vec<(TaskId, i64)> {
        view.tasks.iter().map(|t| (t.id, t.order)).collect()
    }

    async fn assert_dense(service: &BoardService, project: ProjectId) {
        for view in service.board(project).await.unwrap() {
            let mut ranks: Vec<i64> = view.tasks.iter().map(|t| t.order).collect();
            ranks.sort_unstable();
            let expected: Vec<i64> = (1..=ranks.len() as i64).collect();
            assert_eq!(ranks, expected, "column {}", view.id);
        }
    }

    fn rename(title: &str) -> TaskPatch {
        TaskPatch {
            title: Some(title.into()),
            ..TaskPatch::default()
        }
    }

    /// Memory store whose next task lookup, once armed, parks after
    /// reading until released.
    #[derive(Default)]
    struct GatedStore {
        inner: MemoryStore,
        armed: AtomicBool,
        parked: Notify,
        release: Notify,
    }

    impl GatedStore {
        fn arm(&self) {
            self.armed.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl BoardStore for GatedStore {
        async fn project(&self, id: ProjectId) -> Result<Option<Project>, StoreError> {
            self.inner.project(id).await
        }

        async fn insert_project(&self, new: NewProject) -> Result<Project, StoreError> {
            self.inner.insert_project(new).await
        }

        async fn save_project(&self, project: &Project) -> Result<(), StoreError> {
            self.inner.save_project(project).await
        }

        async fn column(
            &self,
            project: ProjectId,
            id: ColumnId,
        ) -> Result<Option<Column>, StoreError> {
            self.inner.column(project, id).await
        }

        async fn columns(&self, project: ProjectId) -> Result<Vec<Column>, StoreError> {
            self.inner.columns(project).await
        }

        async fn insert_column(&self, new: NewColumn) -> Result<Column, StoreError> {
            self.inner.insert_column(new).await
        }

        async fn save_columns(&self, columns: &[Column]) -> Result<(), StoreError> {
            self.inner.save_columns(columns).await
        }

        async fn task(&self, project: ProjectId, id: TaskId) -> Result<Option<Task>, StoreError> {
            let found = self.inner.task(project, id).await?;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.parked.notify_one();
                self.release.notified().await;
            }
            Ok(found)
        }

        async fn tasks(
            &self,
            project: ProjectId,
            column: ColumnId,
        ) -> Result<Vec<Task>, StoreError> {
            self.inner.tasks(project, column).await
        }

        async fn project_tasks(&self, project: ProjectId) -> Result<Vec<Task>, StoreError> {
            self.inner.project_tasks(project).await
        }

        async fn insert_task(&self, new: NewTask) -> Result<Task, StoreError> {
            self.inner.insert_task(new).await
        }

        async fn save_positions(&self, tasks: &[Task]) -> Result<(), StoreError> {
            self.inner.save_positions(tasks).await
        }

        async fn update_task(&self, task: &Task) -> Result<Option<Task>, StoreError> {
            self.inner.update_task(task).await
        }

        async fn delete_task(
            &self,
            project: ProjectId,
            id: TaskId,
        ) -> Result<Option<Task>, StoreError> {
            self.inner.delete_task(project, id).await
        }

        async fn comment(
            &self,
            project: ProjectId,
            id: CommentId,
        ) -> Result<Option<Comment>, StoreError> {
            self.inner.comment(project, id).await
        }

        async fn comments(
            &self,
            project: ProjectId,
            task: TaskId,
        ) -> Result<Vec<Comment>, StoreError> {
            self.inner.comments(project, task).await
        }

        async fn insert_comment(&self, new: NewComment) -> Result<Comment, StoreError> {
            self.inner.insert_comment(new).await
        }

        async fn save_comment(&self, comment: &Comment) -> Result<(), StoreError> {
            self.inner.save_comment(comment).await
        }

        async fn delete_comment(
            &self,
            project: ProjectId,
            id: CommentId,
        ) -> Result<Option<Comment>, StoreError> {
            self.inner.delete_comment(project, id).await
        }
    }

    /// Start `update_task` on `task` and wait until it has read the row.
    async fn parked_rename(
        store: &GatedStore,
        service: &Arc<BoardService>,
        project: ProjectId,
        task: TaskId,
    ) -> tokio::task::JoinHandle<Result<Task, ServiceError>> {
        store.arm();
        let service = Arc::clone(service);
        let handle =
            tokio::spawn(async move { service.update_task(project, task, rename("renamed")).await });
        store.parked.notified().await;
        handle
    }

    #[tokio::test]
    async fn test_create_task_appends() {
        let f = fixture().await;
        let created = tasks(&f, f.todo.id, &["a", "b", "c"]).await;
        assert_eq!(
            created.iter().map(|t| t.order).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn test_move_column_to_front() {
        let f = fixture().await;
        let third = f
            .service
            .add_column(
                f.project.id,
                AddColumn {
                    column_name: "Review".into(),
                    order: 3,
                },
            )
            .await
            .unwrap();
        let mut rx = subscribe(&f.service, f.project.id);

        let views = f
            .service
            .move_column(
                f.project.id,
                MoveColumn {
                    column_id: third.id,
                    new_order: 1,
                },
            )
            .await
            .unwrap();

        let layout: Vec<_> = views.iter().map(|v| (v.id, v.order)).collect();
        assert_eq!(layout, vec![(third.id, 1), (f.todo.id, 2), (f.done.id, 3)]);
        match next_event(&mut rx) {
            BoardEvent::ColumnMoved { columns } => assert_eq!(columns, views),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_move_task_within_column() {
        let f = fixture().await;
        let t = tasks(&f, f.todo.id, &["t1", "t2", "t3", "t4"]).await;
        let mut rx = subscribe(&f.service, f.project.id);

        let moved = f
            .service
            .move_task(
                f.project.id,
                MoveTask {
                    task_id: t[3].id,
                    new_column: None,
                    new_order: 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(moved.order, 2);

        match next_event(&mut rx) {
            BoardEvent::TaskMoved { task, columns } => {
                assert_eq!(task.id, t[3].id);
                assert_eq!(columns.len(), 1);
                assert_eq!(
                    orders(&columns[0]),
                    vec![(t[0].id, 1), (t[3].id, 2), (t[1].id, 3), (t[2].id, 4)]
                );
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_move_task_across_columns() {
        let f = fixture().await;
        let todo = tasks(&f, f.todo.id, &["a", "b", "c"]).await;
        let done = tasks(&f, f.done.id, &["x", "y"]).await;
        let mut rx = subscribe(&f.service, f.project.id);

        let moved = f
            .service
            .move_task(
                f.project.id,
                MoveTask {
                    task_id: todo[0].id,
                    new_column: Some(f.done.id),
                    new_order: 99,
                },
            )
            .await
            .unwrap();
        assert_eq!(moved.column, f.done.id);
        assert_eq!(moved.order, 3);

        match next_event(&mut rx) {
            BoardEvent::TaskMoved { columns, .. } => {
                assert_eq!(columns[0].id, f.todo.id);
                assert_eq!(orders(&columns[0]), vec![(todo[1].id, 1), (todo[2].id, 2)]);
                assert_eq!(columns[1].id, f.done.id);
                assert_eq!(
                    orders(&columns[1]),
                    vec![(done[0].id, 1), (done[1].id, 2), (todo[0].id, 3)]
                );
            }
            other => panic!("unexpected event {other:?}"),
        }

        let stored = f.service.store().task(f.project.id, todo[0].id).await.unwrap();
        assert_eq!(stored.map(|t| (t.column, t.order)), Some((f.done.id, 3)));
    }

    #[tokio::test]
    async fn test_move_task_to_current_slot_still_publishes() {
        let f = fixture().await;
        let t = tasks(&f, f.todo.id, &["a", "b"]).await;
        let mut rx = subscribe(&f.service, f.project.id);

        let moved = f
            .service
            .move_task(
                f.project.id,
                MoveTask {
                    task_id: t[1].id,
                    new_column: None,
                    new_order: 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(moved, t[1]);
        assert!(matches!(next_event(&mut rx), BoardEvent::TaskMoved { .. }));
    }

    #[tokio::test]
    async fn test_move_unknown_task_is_not_found() {
        let f = fixture().await;
        let err = f
            .service
            .move_task(
                f.project.id,
                MoveTask {
                    task_id: 404,
                    new_column: None,
                    new_order: 1,
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_move_task_into_foreign_column_is_not_found() {
        let f = fixture().await;
        let other = f
            .service
            .create_project(NewProject::new("Other"))
            .await
            .unwrap();
        let foreign = f
            .service
            .add_column(
                other.id,
                AddColumn {
                    column_name: "Elsewhere".into(),
                    order: 1,
                },
            )
            .await
            .unwrap();
        let t = tasks(&f, f.todo.id, &["a"]).await;

        let err = f
            .service
            .move_task(
                f.project.id,
                MoveTask {
                    task_id: t[0].id,
                    new_column: Some(foreign.id),
                    new_order: 1,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ColumnNotFound { .. }));
    }

    #[tokio::test]
    async fn test_add_column_keeps_requested_order() {
        let f = fixture().await;
        let mut rx = subscribe(&f.service, f.project.id);
        let column = f
            .service
            .add_column(
                f.project.id,
                AddColumn {
                    column_name: "Backlog".into(),
                    order: 0,
                },
            )
            .await
            .unwrap();
        assert_eq!(column.order, 0);
        match next_event(&mut rx) {
            BoardEvent::ColumnAdded { column: view } => {
                assert_eq!(view.name, "Backlog");
                assert!(view.tasks.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }

        let board = f.service.board(f.project.id).await.unwrap();
        assert_eq!(board[0].id, column.id);
    }

    #[tokio::test]
    async fn test_add_column_to_missing_project() {
        let f = fixture().await;
        let err = f
            .service
            .add_column(
                99999,
                AddColumn {
                    column_name: "Ghost".into(),
                    order: 0,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::ProjectNotFound(99999)));
    }

    #[tokio::test]
    async fn test_delete_task_compacts_column() {
        let f = fixture().await;
        let t = tasks(&f, f.todo.id, &["a", "b", "c"]).await;
        let mut rx = subscribe(&f.service, f.project.id);

        let view = f.service.delete_task(f.project.id, t[0].id).await.unwrap();
        assert_eq!(orders(&view), vec![(t[1].id, 1), (t[2].id, 2)]);
        match next_event(&mut rx) {
            BoardEvent::TaskDeleted { task_id, column } => {
                assert_eq!(task_id, t[0].id);
                assert_eq!(column, view);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_assign_requires_membership() {
        let f = fixture().await;
        let t = tasks(&f, f.todo.id, &["a"]).await;

        let err = f
            .service
            .assign_user(f.project.id, t[0].id, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotAMember { user: 2, .. }));

        let mut rx = subscribe(&f.service, f.project.id);
        let task = f.service.assign_user(f.project.id, t[0].id, 1).await.unwrap();
        assert_eq!(task.assigned_to, Some(1));
        assert!(matches!(next_event(&mut rx), BoardEvent::UserAssigned { .. }));

        let task = f.service.unassign_user(f.project.id, t[0].id).await.unwrap();
        assert_eq!(task.assigned_to, None);
        assert!(matches!(next_event(&mut rx), BoardEvent::TaskUnassigned { .. }));
    }

    #[tokio::test]
    async fn test_remove_member_unassigns_tasks() {
        let f = fixture().await;
        let t = tasks(&f, f.todo.id, &["a"]).await;
        f.service.assign_user(f.project.id, t[0].id, 1).await.unwrap();
        let mut rx = subscribe(&f.service, f.project.id);

        let project = f.service.remove_member(f.project.id, 1).await.unwrap();
        assert!(!project.is_member(1));
        assert!(matches!(next_event(&mut rx), BoardEvent::ProjectUpdated { .. }));
        assert!(matches!(next_event(&mut rx), BoardEvent::TaskUnassigned { .. }));
    }

    #[tokio::test]
    async fn test_deadline_and_update_events() {
        let f = fixture().await;
        let t = tasks(&f, f.todo.id, &["a"]).await;
        let mut rx = subscribe(&f.service, f.project.id);

        let task = f
            .service
            .set_deadline(f.project.id, t[0].id, Some(1_700_000_000))
            .await
            .unwrap();
        assert_eq!(task.due_date, Some(1_700_000_000));
        assert!(matches!(next_event(&mut rx), BoardEvent::DeadlineUpdated { .. }));

        let patch = TaskPatch {
            is_complete: Some(true),
            spent_minutes: Some(30),
            ..TaskPatch::default()
        };
        let task = f.service.update_task(f.project.id, t[0].id, patch).await.unwrap();
        assert!(task.is_complete);
        assert_eq!(task.spent_minutes, 30);
        assert!(matches!(next_event(&mut rx), BoardEvent::TaskUpdated { .. }));

        // Empty patch is a no-op
        f.service
            .update_task(f.project.id, t[0].id, TaskPatch::default())
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_comment_lifecycle() {
        let f = fixture().await;
        let t = tasks(&f, f.todo.id, &["a"]).await;
        let mut rx = subscribe(&f.service, f.project.id);

        let comment = f
            .service
            .add_comment(f.project.id, t[0].id, 1, "first")
            .await
            .unwrap();
        assert!(matches!(next_event(&mut rx), BoardEvent::CommentCreated { .. }));

        let edited = f
            .service
            .update_comment(f.project.id, comment.id, "edited")
            .await
            .unwrap();
        assert_eq!(edited.text, "edited");
        assert!(matches!(next_event(&mut rx), BoardEvent::CommentUpdated { .. }));

        f.service
            .delete_comment(f.project.id, comment.id)
            .await
            .unwrap();
        match next_event(&mut rx) {
            BoardEvent::CommentDeleted { comment_id, task_id } => {
                assert_eq!(comment_id, comment.id);
                assert_eq!(task_id, t[0].id);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_update_project_publishes() {
        let f = fixture().await;
        let mut rx = subscribe(&f.service, f.project.id);
        let project = f
            .service
            .update_project(
                f.project.id,
                ProjectPatch {
                    name: Some("Renamed".into()),
                    description: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(project.name, "Renamed");
        match next_event(&mut rx) {
            BoardEvent::ProjectUpdated { project } => assert_eq!(project.name, "Renamed"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_moves_stay_dense() {
        let f = fixture().await;
        let t = tasks(&f, f.todo.id, &["a", "b", "c", "d", "e", "f"]).await;
        let service = Arc::new(f.service);

        let mut handles = Vec::new();
        for (i, task) in t.iter().enumerate() {
            let service = Arc::clone(&service);
            let project = f.project.id;
            let task_id = task.id;
            handles.push(tokio::spawn(async move {
                service
                    .move_task(
                        project,
                        MoveTask {
                            task_id,
                            new_column: None,
                            new_order: (6 - i) as i64,
                        },
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let board = service.board(f.project.id).await.unwrap();
        let mut ranks: Vec<i64> = board[0].tasks.iter().map(|t| t.order).collect();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_move_waits_for_task_edit_in_progress() {
        let store = Arc::new(GatedStore::default());
        let f = fixture_on(store.clone(), true).await;
        let t = tasks(&f, f.todo.id, &["a", "b"]).await;
        let (project, todo, done) = (f.project.id, f.todo.id, f.done.id);
        let service = Arc::new(f.service);

        let edit = parked_rename(&store, &service, project, t[0].id).await;
        let mover = tokio::spawn({
            let service = Arc::clone(&service);
            let task_id = t[0].id;
            async move {
                service
                    .move_task(
                        project,
                        MoveTask {
                            task_id,
                            new_column: Some(done),
                            new_order: 1,
                        },
                    )
                    .await
            }
        });
        sleep(Duration::from_millis(20)).await;
        assert!(!mover.is_finished());
        store.release.notify_one();

        let edited = edit.await.unwrap().unwrap();
        assert_eq!(edited.column, todo);
        let moved = mover.await.unwrap().unwrap();
        assert_eq!((moved.column, moved.order), (done, 1));
        assert_eq!(moved.title, "renamed");

        let board = service.board(project).await.unwrap();
        assert_eq!(orders(&board[0]), vec![(t[1].id, 1)]);
        assert_eq!(orders(&board[1]), vec![(t[0].id, 1)]);
        assert_dense(&service, project).await;
    }

    #[tokio::test]
    async fn test_task_edit_keeps_concurrent_move_without_lock() {
        let store = Arc::new(GatedStore::default());
        let f = fixture_on(store.clone(), false).await;
        let t = tasks(&f, f.todo.id, &["a", "b"]).await;
        let (project, done) = (f.project.id, f.done.id);
        let service = Arc::new(f.service);

        let edit = parked_rename(&store, &service, project, t[0].id).await;
        service
            .move_task(
                project,
                MoveTask {
                    task_id: t[0].id,
                    new_column: Some(done),
                    new_order: 1,
                },
            )
            .await
            .unwrap();
        store.release.notify_one();

        // The edit lands on the moved row instead of restoring the old slot
        let edited = edit.await.unwrap().unwrap();
        assert_eq!(edited.title, "renamed");
        assert_eq!((edited.column, edited.order), (done, 1));

        let board = service.board(project).await.unwrap();
        assert_eq!(orders(&board[0]), vec![(t[1].id, 1)]);
        assert_eq!(orders(&board[1]), vec![(t[0].id, 1)]);
        assert_dense(&service, project).await;
    }

    #[tokio::test]
    async fn test_task_edit_does_not_restore_deleted_task() {
        let store = Arc::new(GatedStore::default());
        let f = fixture_on(store.clone(), false).await;
        let t = tasks(&f, f.todo.id, &["a", "b"]).await;
        let project = f.project.id;
        let service = Arc::new(f.service);

        let edit = parked_rename(&store, &service, project, t[0].id).await;
        service.delete_task(project, t[0].id).await.unwrap();
        store.release.notify_one();

        let err = edit.await.unwrap().unwrap_err();
        assert!(err.is_not_found());
        assert!(store.task(project, t[0].id).await.unwrap().is_none());

        let board = service.board(project).await.unwrap();
        assert_eq!(orders(&board[0]), vec![(t[1].id, 1)]);
    }

    #[tokio::test]
    async fn test_remove_member_waits_for_running_move() {
        let store = Arc::new(GatedStore::default());
        let f = fixture_on(store.clone(), true).await;
        let t = tasks(&f, f.todo.id, &["a", "b"]).await;
        let (project, done) = (f.project.id, f.done.id);
        let service = Arc::new(f.service);
        service.assign_user(project, t[0].id, 1).await.unwrap();

        store.arm();
        let mover = tokio::spawn({
            let service = Arc::clone(&service);
            let task_id = t[0].id;
            async move {
                service
                    .move_task(
                        project,
                        MoveTask {
                            task_id,
                            new_column: Some(done),
                            new_order: 1,
                        },
                    )
                    .await
            }
        });
        store.parked.notified().await;
        let removal = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.remove_member(project, 1).await }
        });
        sleep(Duration::from_millis(20)).await;
        assert!(!removal.is_finished());
        store.release.notify_one();

        mover.await.unwrap().unwrap();
        removal.await.unwrap().unwrap();

        let task = store.task(project, t[0].id).await.unwrap().unwrap();
        assert_eq!(task.assigned_to, None);
        assert_eq!((task.column, task.order), (done, 1));
        assert_dense(&service, project).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_optimistic_writes_keep_every_task_once() {
        let f = fixture_on(Arc::new(MemoryStore::new()), false).await;
        assert!(!f.service.serializes_moves());
        let t = tasks(&f, f.todo.id, &["a", "b", "c", "d", "e", "f", "g", "h"]).await;
        let project = f.project.id;
        let targets = [f.todo.id, f.done.id];
        let service = Arc::new(f.service);

        let mut handles = Vec::new();
        for (i, task) in t.iter().enumerate() {
            let service = Arc::clone(&service);
            let task_id = task.id;
            let target = targets[i % 2];
            handles.push(tokio::spawn(async move {
                service
                    .move_task(
                        project,
                        MoveTask {
                            task_id,
                            new_column: Some(target),
                            new_order: (i % 3) as i64 + 1,
                        },
                    )
                    .await?;
                service
                    .update_task(project, task_id, rename(&format!("task-{task_id}")))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Ranks may repeat or skip after interleaved moves, but every task
        // sits in exactly one column and keeps its edit.
        let board = service.board(project).await.unwrap();
        let mut seen: Vec<TaskId> = board
            .iter()
            .flat_map(|view| view.tasks.iter().map(|task| task.id))
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, t.iter().map(|task| task.id).collect::<Vec<_>>());
        for view in &board {
            for task in &view.tasks {
                assert_eq!(task.title, format!("task-{}", task.id));
            }
        }

        // One more move per column renumbers it
        for view in &board {
            if let Some(first) = view.tasks.first() {
                service
                    .move_task(
                        project,
                        MoveTask {
                            task_id: first.id,
                            new_column: None,
                            new_order: 1,
                        },
                    )
                    .await
                    .unwrap();
            }
        }
        assert_dense(&service, project).await;
    }
}
