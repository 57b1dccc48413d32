//! RocksDB-backed board store.
//!
//! Column families:
//! - `projects` — key `project_id`
//! - `columns`  — key `project_id ‖ column_id`
//! - `tasks`    — key `project_id ‖ task_id`
//! - `comments` — key `project_id ‖ comment_id`
//!
//! Ids are 8-byte big-endian so keys sort numerically. Prefixing every
//! board entity with its project makes scoped lookups point reads and
//! per-project listings prefix scans. Values are bincode-encoded.
//!
//! Multi-entity writes (a renumbered sibling list) go through one
//! `WriteBatch`, so readers never observe a half-renumbered list. Task
//! writes that merge onto the stored row hold `task_writes` between the
//! read and the write.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;

use super::{BoardStore, StoreError};
use crate::model::{
    unix_now, Column, ColumnId, Comment, CommentId, NewColumn, NewComment, NewProject, NewTask,
    Project, ProjectId, Task, TaskId,
};

const CF_PROJECTS: &str = "projects";
const CF_COLUMNS: &str = "columns";
const CF_TASKS: &str = "tasks";
const CF_COMMENTS: &str = "comments";

const COLUMN_FAMILIES: &[&str] = &[CF_PROJECTS, CF_COLUMNS, CF_TASKS, CF_COMMENTS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("taskboard_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Last assigned id per entity kind, recovered on open.
struct IdCounters {
    project: AtomicI64,
    column: AtomicI64,
    task: AtomicI64,
    comment: AtomicI64,
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    ids: IdCounters,
    task_writes: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let ids = IdCounters {
            project: AtomicI64::new(Self::recover_last_id(&db, CF_PROJECTS, 0)?),
            column: AtomicI64::new(Self::recover_last_id(&db, CF_COLUMNS, 8)?),
            task: AtomicI64::new(Self::recover_last_id(&db, CF_TASKS, 8)?),
            comment: AtomicI64::new(Self::recover_last_id(&db, CF_COMMENTS, 8)?),
        };

        log::info!("Opened board store at {}", config.path.display());
        Ok(Self {
            db,
            config,
            ids,
            task_writes: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_PROJECTS => {
                // Small and read on every connect
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_TASKS | CF_COLUMNS => {
                // Bursts of small writes on every move
                opts.set_max_write_buffer_number(4);
            }
            _ => {
                opts.set_max_write_buffer_number(2);
            }
        }

        opts
    }

    /// Highest id present in a column family. The id is the 8 bytes at
    /// `offset` within each key.
    fn recover_last_id(
        db: &DBWithThreadMode<SingleThreaded>,
        cf_name: &str,
        offset: usize,
    ) -> Result<i64, StoreError> {
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{cf_name}' not found")))?;

        if offset == 0 {
            // Keys are the ids themselves; the last key is the largest.
            return match db.iterator_cf(cf, IteratorMode::End).next() {
                Some(item) => {
                    let (key, _) = item?;
                    Ok(read_id(&key, 0).unwrap_or(0))
                }
                None => Ok(0),
            };
        }

        let mut last = 0;
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Some(id) = read_id(&key, offset) {
                last = last.max(id);
            }
        }
        Ok(last)
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(&self, cf_name: &str, key: &[u8], value: &T) -> Result<(), StoreError> {
        let cf = self.cf(cf_name)?;
        self.db
            .put_cf_opt(cf, key, encode(value)?, &self.write_options())?;
        Ok(())
    }

    /// Decode every value whose key starts with `project`.
    fn scan_project<T: DeserializeOwned>(
        &self,
        cf_name: &str,
        project: ProjectId,
    ) -> Result<Vec<(Vec<u8>, T)>, StoreError> {
        let cf = self.cf(cf_name)?;
        let prefix = project.to_be_bytes();
        let mut found = Vec::new();

        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() < 16 || key[..8] != prefix {
                break;
            }
            found.push((key.to_vec(), decode(&value)?));
        }

        Ok(found)
    }
}

#[async_trait]
impl BoardStore for RocksStore {
    async fn project(&self, id: ProjectId) -> Result<Option<Project>, StoreError> {
        self.get(CF_PROJECTS, &id.to_be_bytes())
    }

    async fn project_exists(&self, id: ProjectId) -> Result<bool, StoreError> {
        let cf = self.cf(CF_PROJECTS)?;
        Ok(self.db.get_pinned_cf(cf, id.to_be_bytes())?.is_some())
    }

    async fn insert_project(&self, new: NewProject) -> Result<Project, StoreError> {
        let project = Project {
            id: self.ids.project.fetch_add(1, Ordering::SeqCst) + 1,
            name: new.name,
            description: new.description,
            members: new.members,
        };
        self.put(CF_PROJECTS, &project.id.to_be_bytes(), &project)?;
        Ok(project)
    }

    async fn save_project(&self, project: &Project) -> Result<(), StoreError> {
        self.put(CF_PROJECTS, &project.id.to_be_bytes(), project)
    }

    async fn column(
        &self,
        project: ProjectId,
        id: ColumnId,
    ) -> Result<Option<Column>, StoreError> {
        self.get(CF_COLUMNS, &scoped_key(project, id))
    }

    async fn columns(&self, project: ProjectId) -> Result<Vec<Column>, StoreError> {
        Ok(self
            .scan_project(CF_COLUMNS, project)?
            .into_iter()
            .map(|(_, column)| column)
            .collect())
    }

    async fn insert_column(&self, new: NewColumn) -> Result<Column, StoreError> {
        if !self.project_exists(new.project).await? {
            return Err(StoreError::NotFound {
                kind: "project",
                id: new.project,
            });
        }
        let column = Column {
            id: self.ids.column.fetch_add(1, Ordering::SeqCst) + 1,
            project: new.project,
            name: new.name,
            order: new.order,
        };
        self.put(CF_COLUMNS, &scoped_key(column.project, column.id), &column)?;
        Ok(column)
    }

    async fn save_columns(&self, columns: &[Column]) -> Result<(), StoreError> {
        let cf = self.cf(CF_COLUMNS)?;
        let mut batch = WriteBatch::default();
        for column in columns {
            batch.put_cf(cf, scoped_key(column.project, column.id), encode(column)?);
        }
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    async fn task(&self, project: ProjectId, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.get(CF_TASKS, &scoped_key(project, id))
    }

    async fn tasks(&self, project: ProjectId, column: ColumnId) -> Result<Vec<Task>, StoreError> {
        let mut tasks = self.project_tasks(project).await?;
        tasks.retain(|task| task.column == column);
        Ok(tasks)
    }

    async fn project_tasks(&self, project: ProjectId) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .scan_project::<Task>(CF_TASKS, project)?
            .into_iter()
            .map(|(_, task)| task)
            .collect())
    }

    async fn insert_task(&self, new: NewTask) -> Result<Task, StoreError> {
        let task = Task {
            id: self.ids.task.fetch_add(1, Ordering::SeqCst) + 1,
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
        self.put(CF_TASKS, &scoped_key(task.project, task.id), &task)?;
        Ok(task)
    }

    async fn save_positions(&self, tasks: &[Task]) -> Result<(), StoreError> {
        let _writes = self.task_writes.lock().await;
        let cf = self.cf(CF_TASKS)?;
        let mut batch = WriteBatch::default();
        for task in tasks {
            let key = scoped_key(task.project, task.id);
            if let Some(mut stored) = self.get::<Task>(CF_TASKS, &key)? {
                stored.merge_position(task);
                batch.put_cf(cf, key, encode(&stored)?);
            }
        }
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<Option<Task>, StoreError> {
        let _writes = self.task_writes.lock().await;
        let key = scoped_key(task.project, task.id);
        let Some(mut stored) = self.get::<Task>(CF_TASKS, &key)? else {
            return Ok(None);
        };
        stored.merge_details(task);
        self.put(CF_TASKS, &key, &stored)?;
        Ok(Some(stored))
    }

    async fn delete_task(
        &self,
        project: ProjectId,
        id: TaskId,
    ) -> Result<Option<Task>, StoreError> {
        let _writes = self.task_writes.lock().await;
        let key = scoped_key(project, id);
        let task: Task = match self.get(CF_TASKS, &key)? {
            Some(task) => task,
            None => return Ok(None),
        };

        let cf_tasks = self.cf(CF_TASKS)?;
        let cf_comments = self.cf(CF_COMMENTS)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_tasks, key);
        for (comment_key, comment) in self.scan_project::<Comment>(CF_COMMENTS, project)? {
            if comment.task == id {
                batch.delete_cf(cf_comments, comment_key);
            }
        }
        self.db.write_opt(batch, &self.write_options())?;

        Ok(Some(task))
    }

    async fn comment(
        &self,
        project: ProjectId,
        id: CommentId,
    ) -> Result<Option<Comment>, StoreError> {
        self.get(CF_COMMENTS, &scoped_key(project, id))
    }

    async fn comments(
        &self,
        project: ProjectId,
        task: TaskId,
    ) -> Result<Vec<Comment>, StoreError> {
        Ok(self
            .scan_project::<Comment>(CF_COMMENTS, project)?
            .into_iter()
            .map(|(_, comment)| comment)
            .filter(|comment| comment.task == task)
            .collect())
    }

    async fn insert_comment(&self, new: NewComment) -> Result<Comment, StoreError> {
        let comment = Comment {
            id: self.ids.comment.fetch_add(1, Ordering::SeqCst) + 1,
            project: new.project,
            task: new.task,
            author: new.author,
            text: new.text,
            created_at: unix_now(),
        };
        self.put(CF_COMMENTS, &scoped_key(comment.project, comment.id), &comment)?;
        Ok(comment)
    }

    async fn save_comment(&self, comment: &Comment) -> Result<(), StoreError> {
        self.put(CF_COMMENTS, &scoped_key(comment.project, comment.id), comment)
    }

    async fn delete_comment(
        &self,
        project: ProjectId,
        id: CommentId,
    ) -> Result<Option<Comment>, StoreError> {
        let key = scoped_key(project, id);
        let comment: Option<Comment> = self.get(CF_COMMENTS, &key)?;
        if comment.is_some() {
            let cf = self.cf(CF_COMMENTS)?;
            self.db.delete_cf_opt(cf, key, &self.write_options())?;
        }
        Ok(comment)
    }
}

/// `project ‖ id`, both big-endian.
fn scoped_key(project: ProjectId, id: i64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&project.to_be_bytes());
    key[8..].copy_from_slice(&id.to_be_bytes());
    key
}

fn read_id(key: &[u8], offset: usize) -> Option<i64> {
    let bytes: [u8; 8] = key.get(offset..offset + 8)?.try_into().ok()?;
    Some(i64::from_be_bytes(bytes))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
