use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;

use system::{CanvasId, Permission, SessionError, TimestampMs, UserId};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("canvas not found")]
    NotFound,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed canvas document: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl From<StoreError> for SessionError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound => SessionError::NotFound,
            other => SessionError::Io(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collaborator {
    pub user_id: UserId,
    pub permission: Permission,
}

/// One append-only history record, written when a `save`-flagged drawing
/// arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawingEvent {
    pub user_id: UserId,
    pub tool: String,
    pub payload: serde_json::Value,
    pub timestamp: TimestampMs,
}

/// The persistent canvas document. The session layer never owns it; it
/// reads the permission fields at join time and writes history/snapshot
/// through the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Canvas {
    pub id: CanvasId,
    pub title: String,
    pub owner_id: UserId,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub collaborators: Vec<Collaborator>,
    pub data: Option<String>,
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub history: Vec<DrawingEvent>,
    #[serde(default)]
    pub updated_at: TimestampMs,
}

impl Canvas {
    /// Permission held through ownership or an explicit collaborator grant.
    /// Public visibility is not a grant; join downgrades `None` to `View`
    /// for public canvases.
    pub fn effective_permission(&self, user_id: &str) -> Permission {
        if self.owner_id == user_id {
            return Permission::Owner;
        }
        self.collaborators
            .iter()
            .find(|c| c.user_id == user_id)
            .map(|c| c.permission)
            .unwrap_or(Permission::None)
    }

    pub fn can_edit(&self, user_id: &str) -> bool {
        self.effective_permission(user_id).can_edit()
    }
}

#[async_trait]
pub trait CanvasStore: Send + Sync {
    async fn find_by_id(&self, canvas_id: &str) -> Result<Option<Canvas>, StoreError>;

    /// Appends one history record. Independent of the broadcast that
    /// already went out; a failure here is reported to the sender only.
    async fn persist_drawing_event(
        &self,
        canvas_id: &str,
        event: DrawingEvent,
    ) -> Result<(), StoreError>;

    /// Overwrites the raster snapshot, and the thumbnail when one is given.
    /// Last write wins; no optimistic-concurrency check at this layer.
    /// Returns the persisted timestamp.
    async fn persist_snapshot(
        &self,
        canvas_id: &str,
        data: String,
        thumbnail: Option<String>,
    ) -> Result<TimestampMs, StoreError>;
}

/// One JSON document per canvas under a data directory.
pub struct FileCanvasStore {
    base_dir: PathBuf,
}

impl FileCanvasStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Canvas ids are externally issued; anything that could escape the
    /// data directory resolves to no document at all.
    fn canvas_path(&self, canvas_id: &str) -> Option<PathBuf> {
        let well_formed = !canvas_id.is_empty()
            && canvas_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if well_formed {
            Some(self.base_dir.join(format!("{}.json", canvas_id)))
        } else {
            None
        }
    }

    async fn read_canvas(&self, canvas_id: &str) -> Result<Option<Canvas>, StoreError> {
        let path = match self.canvas_path(canvas_id) {
            Some(path) => path,
            None => return Ok(None),
        };
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn write_canvas(&self, canvas: &Canvas) -> Result<(), StoreError> {
        let path = self.canvas_path(&canvas.id).ok_or(StoreError::NotFound)?;
        let bytes = serde_json::to_vec_pretty(canvas)?;
        fs::write(&path, bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl CanvasStore for FileCanvasStore {
    async fn find_by_id(&self, canvas_id: &str) -> Result<Option<Canvas>, StoreError> {
        self.read_canvas(canvas_id).await
    }

    async fn persist_drawing_event(
        &self,
        canvas_id: &str,
        event: DrawingEvent,
    ) -> Result<(), StoreError> {
        let mut canvas = self
            .read_canvas(canvas_id)
            .await?
            .ok_or(StoreError::NotFound)?;
        canvas.updated_at = event.timestamp;
        canvas.history.push(event);
        self.write_canvas(&canvas).await
    }

    async fn persist_snapshot(
        &self,
        canvas_id: &str,
        data: String,
        thumbnail: Option<String>,
    ) -> Result<TimestampMs, StoreError> {
        let mut canvas = self
            .read_canvas(canvas_id)
            .await?
            .ok_or(StoreError::NotFound)?;
        canvas.data = Some(data);
        if thumbnail.is_some() {
            canvas.thumbnail = thumbnail;
        }
        canvas.updated_at = chrono::Utc::now().timestamp_millis();
        self.write_canvas(&canvas).await?;
        Ok(canvas.updated_at)
    }
}

/// In-memory store, used by tests.
pub struct MemoryCanvasStore {
    canvases: Mutex<HashMap<CanvasId, Canvas>>,
}

impl MemoryCanvasStore {
    pub fn new() -> Self {
        Self {
            canvases: Mutex::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, canvas: Canvas) {
        self.canvases.lock().await.insert(canvas.id.clone(), canvas);
    }

    pub async fn get(&self, canvas_id: &str) -> Option<Canvas> {
        self.canvases.lock().await.get(canvas_id).cloned()
    }
}

#[async_trait]
impl CanvasStore for MemoryCanvasStore {
    async fn find_by_id(&self, canvas_id: &str) -> Result<Option<Canvas>, StoreError> {
        Ok(self.canvases.lock().await.get(canvas_id).cloned())
    }

    async fn persist_drawing_event(
        &self,
        canvas_id: &str,
        event: DrawingEvent,
    ) -> Result<(), StoreError> {
        let mut canvases = self.canvases.lock().await;
        let canvas = canvases.get_mut(canvas_id).ok_or(StoreError::NotFound)?;
        canvas.updated_at = event.timestamp;
        canvas.history.push(event);
        Ok(())
    }

    async fn persist_snapshot(
        &self,
        canvas_id: &str,
        data: String,
        thumbnail: Option<String>,
    ) -> Result<TimestampMs, StoreError> {
        let mut canvases = self.canvases.lock().await;
        let canvas = canvases.get_mut(canvas_id).ok_or(StoreError::NotFound)?;
        canvas.data = Some(data);
        if thumbnail.is_some() {
            canvas.thumbnail = thumbnail;
        }
        canvas.updated_at = chrono::Utc::now().timestamp_millis();
        Ok(canvas.updated_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canvas(owner: &str) -> Canvas {
        Canvas {
            id: "c1".into(),
            title: "untitled".into(),
            owner_id: owner.into(),
            is_public: false,
            collaborators: vec![Collaborator {
                user_id: "editor".into(),
                permission: Permission::Edit,
            }],
            data: None,
            thumbnail: None,
            history: Vec::new(),
            updated_at: 0,
        }
    }

    #[test]
    fn it_resolves_effective_permission() {
        let canvas = canvas("owner");
        assert_eq!(canvas.effective_permission("owner"), Permission::Owner);
        assert_eq!(canvas.effective_permission("editor"), Permission::Edit);
        assert_eq!(canvas.effective_permission("stranger"), Permission::None);
        assert!(canvas.can_edit("editor"));
        assert!(!canvas.can_edit("stranger"));
    }

    #[tokio::test]
    async fn it_persists_snapshot_and_history_to_disk() {
        let dir = std::env::temp_dir().join(format!("canvas-store-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.expect("temp dir");
        let store = FileCanvasStore::new(dir.clone());

        store.write_canvas(&canvas("owner")).await.expect("write");
        let loaded = store.find_by_id("c1").await.expect("read").expect("exists");
        assert_eq!(loaded.owner_id, "owner");

        store
            .persist_drawing_event(
                "c1",
                DrawingEvent {
                    user_id: "editor".into(),
                    tool: "brush".into(),
                    payload: serde_json::json!({"points": [1, 2]}),
                    timestamp: 42,
                },
            )
            .await
            .expect("append");
        let timestamp = store
            .persist_snapshot("c1", "base64-data".into(), Some("thumb".into()))
            .await
            .expect("snapshot");

        let loaded = store.find_by_id("c1").await.expect("read").expect("exists");
        assert_eq!(loaded.history.len(), 1);
        assert_eq!(loaded.data.as_deref(), Some("base64-data"));
        assert_eq!(loaded.updated_at, timestamp);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn it_refuses_ids_that_escape_the_data_directory() {
        let store = FileCanvasStore::new("/nonexistent");
        assert!(store
            .find_by_id("../etc/passwd")
            .await
            .expect("treated as missing")
            .is_none());
        assert!(store.find_by_id("").await.expect("missing").is_none());
    }
}
