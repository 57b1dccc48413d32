//! WebSocket client for a project board.
//!
//! Connects to `/ws/projects/{id}/`, sends actions and yields the frames
//! the server fans out to the project group. Used by tools and tests.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::model::ProjectId;
use crate::protocol::{ClientAction, Outbound, ProtocolError};

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("connection closed by server (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },
}

impl ClientError {
    /// Close code the server sent, if the connection ended with one.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            ClientError::Closed { code, .. } => *code,
            _ => None,
        }
    }
}

/// URL of a project's socket under `base` (e.g. `ws://127.0.0.1:9090`).
pub fn project_url(base: &str, project: ProjectId) -> String {
    format!("{}/ws/projects/{project}/", base.trim_end_matches('/'))
}

/// WebSocket client for one project board.
pub struct BoardClient {
    project: ProjectId,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl BoardClient {
    /// Open a connection to a project's board.
    ///
    /// Succeeds as soon as the upgrade completes; a missing project shows
    /// up as a [`ClientError::Closed`] with code 4001 on the first read.
    pub async fn connect(base: &str, project: ProjectId) -> Result<Self, ClientError> {
        let url = project_url(base, project);
        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        log::debug!("Connected to {url}");
        Ok(Self { project, stream })
    }

    pub fn project(&self) -> ProjectId {
        self.project
    }

    pub async fn send_action(&mut self, action: &ClientAction) -> Result<(), ClientError> {
        let text = action.encode()?;
        self.stream.send(Message::text(text)).await?;
        Ok(())
    }

    /// Send an arbitrary JSON value as a text frame.
    pub async fn send_raw(&mut self, value: &Value) -> Result<(), ClientError> {
        self.stream.send(Message::text(value.to_string())).await?;
        Ok(())
    }

    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), ClientError> {
        self.stream.send(Message::text(text.into())).await?;
        Ok(())
    }

    /// Wait for the next server frame.
    ///
    /// Control frames are handled transparently. A close from the server
    /// becomes [`ClientError::Closed`].
    pub async fn next_event(&mut self) -> Result<Outbound, ClientError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Outbound::decode(text.as_str())?),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                        None => (None, String::new()),
                    };
                    return Err(ClientError::Closed { code, reason });
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(ClientError::Closed {
                        code: None,
                        reason: String::new(),
                    })
                }
            }
        }
    }

    /// Close the connection normally.
    pub async fn close(mut self) -> Result<(), ClientError> {
        let frame = tokio_tungstenite::tungstenite::protocol::CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        match self.stream.close(Some(frame)).await {
            Ok(()) | Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
