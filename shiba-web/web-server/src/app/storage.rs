use std::{collections::HashMap, io, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use common::{api_bindings::ChatMessagePayload, config::StorageConfig};
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{fs, sync::RwLock};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("the room {0} was not found")]
    RoomNotFound(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Rooms, memberships and chat history as seen by the streaming core.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn members(&self, room_id: &str) -> Result<Vec<String>, StorageError>;

    /// The member currently allowed to start the room's stream
    async fn remote_holder(&self, room_id: &str) -> Result<Option<String>, StorageError>;

    async fn user_rooms(&self, user_id: &str) -> Result<Vec<String>, StorageError>;

    async fn store_message(
        &self,
        sender: &str,
        room_id: &str,
        message: &ChatMessagePayload,
    ) -> Result<(), StorageError>;
}

pub async fn create_storage(
    config: StorageConfig,
) -> Result<Arc<dyn Storage + Send + Sync>, StorageError> {
    match config {
        StorageConfig::Json { path } => Ok(Arc::new(JsonStorage::load(path.into()).await?)),
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct JsonData {
    #[serde(default)]
    rooms: HashMap<String, JsonRoom>,
    #[serde(default)]
    messages: Vec<JsonMessage>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct JsonRoom {
    #[serde(default)]
    members: Vec<String>,
    #[serde(default)]
    remote_holder: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JsonMessage {
    room_id: String,
    sender: String,
    #[serde(flatten)]
    message: ChatMessagePayload,
}

pub struct JsonStorage {
    path: PathBuf,
    data: RwLock<JsonData>,
}

impl JsonStorage {
    pub async fn load(path: PathBuf) -> Result<Self, StorageError> {
        let data = match fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!("[Storage]: {path:?} doesn't exist, starting empty");
                JsonData::default()
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    async fn write(&self, data: &JsonData) -> Result<(), StorageError> {
        let text = serde_json::to_string_pretty(data)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.path, text).await?;

        Ok(())
    }
}

#[async_trait]
impl Storage for JsonStorage {
    async fn members(&self, room_id: &str) -> Result<Vec<String>, StorageError> {
        let data = self.data.read().await;

        data.rooms
            .get(room_id)
            .map(|room| room.members.clone())
            .ok_or_else(|| StorageError::RoomNotFound(room_id.to_string()))
    }

    async fn remote_holder(&self, room_id: &str) -> Result<Option<String>, StorageError> {
        let data = self.data.read().await;

        data.rooms
            .get(room_id)
            .map(|room| room.remote_holder.clone())
            .ok_or_else(|| StorageError::RoomNotFound(room_id.to_string()))
    }

    async fn user_rooms(&self, user_id: &str) -> Result<Vec<String>, StorageError> {
        let data = self.data.read().await;

        let mut rooms = data
            .rooms
            .iter()
            .filter(|(_, room)| room.members.iter().any(|member| member == user_id))
            .map(|(room_id, _)| room_id.clone())
            .collect::<Vec<_>>();
        rooms.sort();

        Ok(rooms)
    }

    async fn store_message(
        &self,
        sender: &str,
        room_id: &str,
        message: &ChatMessagePayload,
    ) -> Result<(), StorageError> {
        let mut data = self.data.write().await;

        if !data.rooms.contains_key(room_id) {
            return Err(StorageError::RoomNotFound(room_id.to_string()));
        }

        data.messages.push(JsonMessage {
            room_id: room_id.to_string(),
            sender: sender.to_string(),
            message: message.clone(),
        });

        self.write(&data).await
    }
}

#[cfg(test)]
mod tests {
    use std::env::temp_dir;

    use uuid::Uuid;

    use super::*;

    async fn storage_with_rooms() -> (JsonStorage, PathBuf) {
        let path = temp_dir().join(format!("shiba-storage-{}.json", Uuid::new_v4()));
        fs::write(
            &path,
            r#"{
                "rooms": {
                    "r1": { "members": ["u1", "u2"], "remote_holder": "u1" },
                    "r2": { "members": ["u2"] }
                }
            }"#,
        )
        .await
        .expect("write fixture");

        (JsonStorage::load(path.clone()).await.expect("load"), path)
    }

    #[tokio::test]
    async fn test_rooms_and_members() {
        let (storage, path) = storage_with_rooms().await;

        assert_eq!(storage.members("r1").await.expect("members"), ["u1", "u2"]);
        assert_eq!(
            storage.remote_holder("r1").await.expect("holder").as_deref(),
            Some("u1")
        );
        assert_eq!(storage.remote_holder("r2").await.expect("holder"), None);
        assert_eq!(storage.user_rooms("u2").await.expect("rooms"), ["r1", "r2"]);
        assert!(matches!(
            storage.members("r9").await,
            Err(StorageError::RoomNotFound(_))
        ));

        let _ = fs::remove_file(path).await;
    }

    #[tokio::test]
    async fn test_store_message_persists() {
        let (storage, path) = storage_with_rooms().await;

        let message = ChatMessagePayload {
            id: "m1".to_string(),
            sender_name: "Alice".to_string(),
            content: "hi".to_string(),
            created_at: "2024-01-01T00:00:00Z".to_string(),
        };
        storage
            .store_message("u1", "r1", &message)
            .await
            .expect("store");
        assert!(storage.store_message("u1", "r9", &message).await.is_err());

        let reloaded = JsonStorage::load(path.clone()).await.expect("reload");
        let data = reloaded.data.read().await;
        assert_eq!(data.messages.len(), 1);
        assert_eq!(data.messages[0].room_id, "r1");
        assert_eq!(data.messages[0].message, message);
        drop(data);

        let _ = fs::remove_file(path).await;
    }

    #[tokio::test]
    async fn test_missing_file_starts_empty() {
        let path = temp_dir().join(format!("shiba-missing-{}.json", Uuid::new_v4()));
        let storage = JsonStorage::load(path).await.expect("load");

        assert!(storage.user_rooms("u1").await.expect("rooms").is_empty());
    }
}
