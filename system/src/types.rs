use serde::{Deserialize, Serialize};

pub type ConnectionId = u64;
pub type CanvasId = String;
pub type UserId = String;

/// Wall-clock milliseconds, as carried on broadcast events.
pub type TimestampMs = i64;

/// Access level an identity holds on a canvas, derived from ownership and
/// collaborator records. Resolved once at join time and cached for the
/// lifetime of the occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Owner,
    Edit,
    View,
    None,
}

impl Permission {
    pub fn can_edit(self) -> bool {
        matches!(self, Permission::Owner | Permission::Edit)
    }

    pub fn is_none(self) -> bool {
        matches!(self, Permission::None)
    }
}

/// Public identity fields of a user, as broadcast to other occupants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: UserId,
    pub username: String,
    pub avatar: Option<String>,
}

/// An occupant as listed in the `canvas-joined` roster and the
/// `user-joined` broadcast: public identity plus the permission resolved
/// at join time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomUser {
    pub user: UserInfo,
    pub permission: Permission,
}

/// Opaque drawing payload with its tool tag. `save` marks the sub-event
/// that is appended to the canvas history in addition to being broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawingData {
    pub tool: String,
    #[serde(default)]
    pub save: bool,
    pub payload: serde_json::Value,
}
