use std::collections::HashMap;

use log::{debug, info};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("a stream is already starting or running in room {0}")]
    DuplicateSession(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Bring-up is still running
    Pending,
    Streaming,
}

/// The stream of one room
#[derive(Debug, Clone)]
pub struct StreamSession {
    /// Distinguishes a session from a later one in the same room
    pub id: Uuid,
    pub room_id: String,
    /// Stops capture, pipeline and forwarders
    pub cancel: CancellationToken,
    pub state: SessionState,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, StreamSession>>,
}

impl SessionRegistry {
    /// Creates a pending session, unless the room already has one.
    pub async fn get_or_create(&self, room_id: &str) -> Result<StreamSession, SessionError> {
        let mut sessions = self.sessions.lock().await;

        if let Some(existing) = sessions.get(room_id) {
            debug!(
                "[Stream]: room {room_id} already has session {} in state {:?}",
                existing.id, existing.state
            );
            return Err(SessionError::DuplicateSession(room_id.to_string()));
        }

        let session = StreamSession {
            id: Uuid::new_v4(),
            room_id: room_id.to_string(),
            cancel: CancellationToken::new(),
            state: SessionState::Pending,
        };
        sessions.insert(room_id.to_string(), session.clone());

        info!("[Stream]: created session {} for room {room_id}", session.id);

        Ok(session)
    }

    pub async fn get(&self, room_id: &str) -> Option<StreamSession> {
        self.sessions.lock().await.get(room_id).cloned()
    }

    pub async fn is_streaming(&self, room_id: &str) -> bool {
        self.sessions
            .lock()
            .await
            .get(room_id)
            .is_some_and(|session| session.state == SessionState::Streaming)
    }

    /// Returns false if the session was replaced or removed in the meantime
    pub async fn mark_streaming(&self, room_id: &str, id: Uuid) -> bool {
        let mut sessions = self.sessions.lock().await;

        match sessions.get_mut(room_id) {
            Some(session) if session.id == id => {
                session.state = SessionState::Streaming;
                true
            }
            _ => false,
        }
    }

    pub async fn cancel(&self, room_id: &str) -> bool {
        let sessions = self.sessions.lock().await;

        match sessions.get(room_id) {
            Some(session) => {
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn delete(&self, room_id: &str) -> Option<StreamSession> {
        self.sessions.lock().await.remove(room_id)
    }

    /// Cancels and removes the room's session. Stopping a room without a session does nothing.
    pub async fn stop(&self, room_id: &str) -> Option<StreamSession> {
        let session = self.sessions.lock().await.remove(room_id)?;
        session.cancel.cancel();

        info!("[Stream]: stopped session {} of room {room_id}", session.id);

        Some(session)
    }

    /// Removes the room's session only if it is still the one with `id`.
    pub async fn remove_if_current(&self, room_id: &str, id: Uuid) -> Option<StreamSession> {
        let mut sessions = self.sessions.lock().await;

        if sessions.get(room_id).is_some_and(|session| session.id == id) {
            sessions.remove(room_id)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_has_one_winner() {
        let registry = Arc::new(SessionRegistry::default());

        let attempts = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_create("r1").await })
            })
            .collect::<Vec<_>>();

        let mut created = 0;
        let mut duplicates = 0;
        for attempt in attempts {
            match attempt.await.expect("task panicked") {
                Ok(_) => created += 1,
                Err(SessionError::DuplicateSession(room)) => {
                    assert_eq!(room, "r1");
                    duplicates += 1;
                }
            }
        }

        assert_eq!(created, 1);
        assert_eq!(duplicates, 15);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let registry = SessionRegistry::default();
        let session = registry.get_or_create("r1").await.expect("create");

        let stopped = registry.stop("r1").await.expect("first stop");
        assert_eq!(stopped.id, session.id);
        assert!(session.cancel.is_cancelled());
        assert!(registry.get("r1").await.is_none());

        assert!(registry.stop("r1").await.is_none());
        assert!(registry.get("r1").await.is_none());
    }

    #[tokio::test]
    async fn test_mark_streaming_and_stale_removal() {
        let registry = SessionRegistry::default();
        let first = registry.get_or_create("r1").await.expect("create");

        assert!(!registry.is_streaming("r1").await);
        assert!(registry.mark_streaming("r1", first.id).await);
        assert!(registry.is_streaming("r1").await);

        registry.stop("r1").await;
        let second = registry.get_or_create("r1").await.expect("recreate");

        // The first session's supervisor can't touch the second one
        assert!(!registry.mark_streaming("r1", first.id).await);
        assert!(registry.remove_if_current("r1", first.id).await.is_none());
        assert!(registry.get("r1").await.is_some());

        assert!(registry.cancel("r1").await);
        assert!(second.cancel.is_cancelled());
        assert!(registry.remove_if_current("r1", second.id).await.is_some());
        assert!(registry.delete("r1").await.is_none());
    }
}
