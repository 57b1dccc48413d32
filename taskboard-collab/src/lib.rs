//! # taskboard-collab — Real-time collaboration core for a Kanban board
//!
//! Keeps every open view of a project in sync: clients send moves over a
//! WebSocket, the server renumbers, persists and fans the result out to
//! everyone watching the same project.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────┐
//! │ BoardClient │ ◄────────────────► │ BoardServer      │
//! │ (per user)  │     JSON frames    │ ConnectionHandler│
//! └─────────────┘                    └────────┬─────────┘
//!                                             │
//!                                    ┌────────┴────────┐
//!                                    │ BoardService    │──► BoardStore
//!                                    │ (ordering)      │    (memory / RocksDB)
//!                                    └────────┬────────┘
//!                                             │
//!                                    ┌────────┴────────┐
//!                                    │ ProjectChannel  │
//!                                    │ (fan-out)       │
//!                                    └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`ordering`] — Dense 1..N renumbering of columns and tasks
//! - [`membership`] — Which connections belong to which project group
//! - [`broadcast`] — Per-project fan-out with bounded member queues
//! - [`protocol`] — JSON actions and events
//! - [`service`] — Board mutations and the events they publish
//! - [`handler`] — Per-connection state machine and dispatch
//! - [`server`] — WebSocket server
//! - [`client`] — WebSocket client
//! - [`storage`] — Persistence (in-memory and RocksDB)

pub mod model;
pub mod ordering;
pub mod protocol;
pub mod membership;
pub mod broadcast;
pub mod storage;
pub mod service;
pub mod handler;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use model::{
    Column, ColumnId, Comment, CommentId, NewColumn, NewComment, NewProject, NewTask, Project,
    ProjectId, ProjectPatch, Task, TaskId, TaskPatch, UserId,
};
pub use ordering::{Ordered, Renumbered};
pub use protocol::{
    AddColumn, BoardEvent, ClientAction, ColumnView, MoveColumn, MoveTask, Outbound,
    ProtocolError, CLOSE_PROJECT_NOT_FOUND,
};
pub use membership::{ConnectionId, GroupKey, Membership, MembershipRegistry};
pub use broadcast::{ChannelStats, ProjectChannel};
pub use storage::{BoardStore, MemoryStore, RocksStore, StoreConfig, StoreError};
pub use service::{BoardService, ServiceError};
pub use handler::{ActionOutcome, ConnectionHandler, ConnectionPhase, DropReason};
pub use server::{BoardServer, ServerConfig, ServerError, ServerStats};
pub use client::{BoardClient, ClientError};
