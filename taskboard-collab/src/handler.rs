//! Per-connection lifecycle and action dispatch.
//!
//! ```text
//! Connecting ──project exists──► Joined ──disconnect──► Closed
//!      │                          │  ▲
//!      └──project missing──► Closed  └──client action
//! ```
//!
//! The handler owns no socket. The server feeds it text frames and gives
//! it the outbound queue on `open`, which keeps the state machine testable
//! without a network.

use std::sync::Arc;
use uuid::Uuid;

use crate::membership::{ConnectionId, GroupKey, Membership, Outbox};
use crate::model::ProjectId;
use crate::protocol::{ClientAction, Outbound};
use crate::service::{BoardService, ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Joined,
    Closed,
}

impl ConnectionPhase {
    pub fn can_advance_to(self, next: ConnectionPhase) -> bool {
        use ConnectionPhase::*;
        matches!(
            (self, next),
            (Connecting, Joined) | (Connecting, Closed) | (Joined, Joined) | (Joined, Closed)
        )
    }
}

/// Why an inbound frame produced no broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotJoined,
    Malformed,
    NotFound,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Published,
    Dropped(DropReason),
}

/// State of one WebSocket connection to a project board.
pub struct ConnectionHandler {
    id: ConnectionId,
    project: ProjectId,
    phase: ConnectionPhase,
    service: Arc<BoardService>,
    membership: Option<Membership>,
}

impl ConnectionHandler {
    pub fn new(project: ProjectId, service: Arc<BoardService>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project,
            phase: ConnectionPhase::Connecting,
            service,
            membership: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn project(&self) -> ProjectId {
        self.project
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn group(&self) -> GroupKey {
        GroupKey::project(self.project)
    }

    fn advance(&mut self, next: ConnectionPhase) {
        debug_assert!(self.phase.can_advance_to(next));
        self.phase = next;
    }

    /// Check that the project exists and join its group.
    ///
    /// Returns `Closed` when the project is missing; the caller then closes
    /// the socket with the not-found code. Calling again after the first
    /// decision returns the current phase unchanged.
    pub async fn open(&mut self, outbox: Outbox) -> Result<ConnectionPhase, ServiceError> {
        if self.phase != ConnectionPhase::Connecting {
            return Ok(self.phase);
        }
        if self.service.project_exists(self.project).await? {
            let registry = self.service.channel().registry();
            self.membership = Some(registry.join_scoped(self.group(), self.id, outbox));
            self.advance(ConnectionPhase::Joined);
            log::info!("Connection {} joined {}", self.id, self.group());
        } else {
            self.advance(ConnectionPhase::Closed);
            log::info!(
                "Connection {} refused: project {} not found",
                self.id,
                self.project
            );
        }
        Ok(self.phase)
    }

    /// Decode and dispatch one text frame.
    pub async fn handle_text(&mut self, text: &str) -> ActionOutcome {
        if self.phase != ConnectionPhase::Joined {
            return ActionOutcome::Dropped(DropReason::NotJoined);
        }
        match ClientAction::decode(text) {
            Ok(action) => self.dispatch(action).await,
            Err(e) => {
                log::warn!("Dropping frame from {}: {e}", self.id);
                ActionOutcome::Dropped(DropReason::Malformed)
            }
        }
    }

    /// Apply a decoded action; unknown actions are echoed to the group.
    pub async fn dispatch(&mut self, action: ClientAction) -> ActionOutcome {
        if self.phase != ConnectionPhase::Joined {
            return ActionOutcome::Dropped(DropReason::NotJoined);
        }
        let name = action.name().unwrap_or("<none>").to_owned();
        let result = match action {
            ClientAction::MoveTask(request) => self
                .service
                .move_task(self.project, request)
                .await
                .map(drop),
            ClientAction::MoveColumn(request) => self
                .service
                .move_column(self.project, request)
                .await
                .map(drop),
            ClientAction::AddColumn(request) => self
                .service
                .add_column(self.project, request)
                .await
                .map(drop),
            ClientAction::Passthrough(content) => self
                .service
                .channel()
                .publish(self.group(), Outbound::Echo(content))
                .map(drop)
                .map_err(ServiceError::from),
        };

        match result {
            Ok(()) => {
                self.advance(ConnectionPhase::Joined);
                ActionOutcome::Published
            }
            Err(e) if e.is_not_found() => {
                log::debug!("Dropping {name} from {}: {e}", self.id);
                ActionOutcome::Dropped(DropReason::NotFound)
            }
            Err(e) => {
                log::warn!("Failed to apply {name} from {}: {e}", self.id);
                ActionOutcome::Dropped(DropReason::Failed)
            }
        }
    }

    /// Leave the group. Safe to call more than once.
    pub fn close(&mut self) {
        if self.phase == ConnectionPhase::Closed {
            return;
        }
        self.membership.take();
        self.advance(ConnectionPhase::Closed);
    }
}
