//! Server-pushed event contract.
//!
//! Events arrive on the wire as `{ "type": ..., "directory": ...,
//! "properties": ... }`. The payload is a closed tagged union matched
//! exhaustively by the engine; unrecognized types deserialize to
//! [`EventPayload::Unknown`] and are handled as a logged no-op rather
//! than an error.

use serde::{Deserialize, Serialize};

use crate::entity::{FileDiff, Message, Part, PermissionRequest, Project, Session, SessionStatus, Todo};

/// One event from the server stream.
///
/// `directory` names the scope the event belongs to; events without a
/// directory are routed to the global scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Closed set of event payloads the engine interprets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "properties")]
pub enum EventPayload {
    // --- session lifecycle ---
    /// Session created or changed. An archived session is removed from
    /// the mirror instead of upserted.
    #[serde(rename = "session.updated")]
    SessionUpdated { info: Session },
    #[serde(rename = "session.diff")]
    SessionDiff {
        #[serde(rename = "sessionID")]
        session_id: String,
        diff: Vec<FileDiff>,
    },
    #[serde(rename = "session.status")]
    SessionStatusChanged {
        #[serde(rename = "sessionID")]
        session_id: String,
        #[serde(default)]
        status: Option<SessionStatus>,
    },
    #[serde(rename = "todo.updated")]
    TodoUpdated {
        #[serde(rename = "sessionID")]
        session_id: String,
        todos: Vec<Todo>,
    },

    // --- message / part streaming ---
    #[serde(rename = "message.updated")]
    MessageUpdated { info: Message },
    #[serde(rename = "message.removed")]
    MessageRemoved {
        #[serde(rename = "sessionID")]
        session_id: String,
        #[serde(rename = "messageID")]
        message_id: String,
    },
    #[serde(rename = "message.part.updated")]
    PartUpdated { part: Part },
    #[serde(rename = "message.part.removed")]
    PartRemoved {
        #[serde(rename = "messageID")]
        message_id: String,
        #[serde(rename = "partID")]
        part_id: String,
    },

    // --- permissions ---
    #[serde(rename = "permission.asked")]
    PermissionAsked {
        #[serde(flatten)]
        request: PermissionRequest,
    },
    #[serde(rename = "permission.replied")]
    PermissionReplied {
        #[serde(rename = "sessionID")]
        session_id: String,
        #[serde(rename = "requestID")]
        request_id: String,
    },

    // --- vcs / diagnostics ---
    #[serde(rename = "vcs.branch.updated")]
    VcsBranchUpdated { branch: String },
    /// Diagnostic status changed server-side; the scope refetches the
    /// full status list rather than patching incrementally.
    #[serde(rename = "lsp.updated")]
    LspUpdated {},

    // --- disposal signals ---
    #[serde(rename = "server.instance.disposed")]
    InstanceDisposed {},
    #[serde(rename = "global.disposed")]
    GlobalDisposed {},
    #[serde(rename = "project.updated")]
    ProjectUpdated {
        #[serde(flatten)]
        project: Project,
    },

    /// Anything the engine does not recognize. Logged and dropped.
    #[serde(other)]
    Unknown,
}

impl EventPayload {
    /// Wire tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::SessionUpdated { .. } => "session.updated",
            EventPayload::SessionDiff { .. } => "session.diff",
            EventPayload::SessionStatusChanged { .. } => "session.status",
            EventPayload::TodoUpdated { .. } => "todo.updated",
            EventPayload::MessageUpdated { .. } => "message.updated",
            EventPayload::MessageRemoved { .. } => "message.removed",
            EventPayload::PartUpdated { .. } => "message.part.updated",
            EventPayload::PartRemoved { .. } => "message.part.removed",
            EventPayload::PermissionAsked { .. } => "permission.asked",
            EventPayload::PermissionReplied { .. } => "permission.replied",
            EventPayload::VcsBranchUpdated { .. } => "vcs.branch.updated",
            EventPayload::LspUpdated {} => "lsp.updated",
            EventPayload::InstanceDisposed {} => "server.instance.disposed",
            EventPayload::GlobalDisposed {} => "global.disposed",
            EventPayload::ProjectUpdated { .. } => "project.updated",
            EventPayload::Unknown => "unknown",
        }
    }
}

impl ServerEvent {
    /// Parses one event from a raw stream payload.
    pub fn parse(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

/// Liveness probe response body.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct HealthResponse {
    #[serde(default)]
    pub healthy: bool,
}
