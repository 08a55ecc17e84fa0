use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CanvasId, DrawingData, RoomUser, TimestampMs, UserId, UserInfo};

/// One JSON frame from client to server. The `type` tag carries the
/// kebab-case event name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientCommand {
    JoinCanvas {
        canvas_id: CanvasId,
    },
    LeaveCanvas,
    Drawing {
        canvas_id: CanvasId,
        drawing: DrawingData,
    },
    CursorMove {
        canvas_id: CanvasId,
        x: f32,
        y: f32,
    },
    SaveCanvas {
        canvas_id: CanvasId,
        canvas_data: String,
        thumbnail: Option<String>,
    },
}

/// One JSON frame from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    CanvasJoined {
        canvas_id: CanvasId,
        users: Vec<RoomUser>,
    },
    UserJoined {
        user: RoomUser,
    },
    UserLeft {
        user: UserInfo,
    },
    Drawing {
        user_id: UserId,
        username: String,
        drawing: DrawingData,
        timestamp: TimestampMs,
    },
    CursorMove {
        user_id: UserId,
        username: String,
        x: f32,
        y: f32,
        timestamp: TimestampMs,
    },
    CanvasSaved {
        saved_by: UserInfo,
        timestamp: TimestampMs,
    },
    Error {
        message: String,
    },
}

/// Everything that can go wrong while handling one connection's event.
/// Surfaced to the originating connection only, as an `error` frame; never
/// fatal to the connection or the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SessionError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("canvas not found")]
    NotFound,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("storage error: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_uses_kebab_case_wire_tags() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type":"join-canvas","canvas_id":"c1"}"#).expect("parses");
        assert!(matches!(cmd, ClientCommand::JoinCanvas { canvas_id } if canvas_id == "c1"));

        let event = ServerEvent::CanvasSaved {
            saved_by: UserInfo {
                id: "u1".into(),
                username: "ann".into(),
                avatar: None,
            },
            timestamp: 123,
        };
        let json = serde_json::to_string(&event).expect("serializes");
        assert!(json.contains(r#""type":"canvas-saved""#));
    }

    #[test]
    fn it_defaults_save_flag_to_false() {
        let cmd: ClientCommand = serde_json::from_str(
            r#"{"type":"drawing","canvas_id":"c1","drawing":{"tool":"brush","payload":{"points":[]}}}"#,
        )
        .expect("parses");
        match cmd {
            ClientCommand::Drawing { drawing, .. } => assert!(!drawing.save),
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
