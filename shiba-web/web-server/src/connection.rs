use std::{
    collections::{HashMap, VecDeque},
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use async_trait::async_trait;
use log::{debug, warn};
use streamer::peer::StreamPeer;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("the socket is closed")]
pub struct SocketClosed;

/// Outbound half of a client socket
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, text: String) -> Result<(), SocketClosed>;
}

#[async_trait]
impl MessageSink for actix_ws::Session {
    async fn deliver(&self, text: String) -> Result<(), SocketClosed> {
        let mut session = self.clone();
        session.text(text).await.map_err(|_| SocketClosed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboxPhase {
    /// The offer wasn't delivered yet
    Holding,
    Live,
    Complete,
}

/// Orders locally gathered candidates behind the offer they belong to.
///
/// Before the offer is out every candidate is held. Afterwards candidates go out directly,
/// except that once one send failed or something is still held, new candidates queue behind
/// it until gathering completes and the queue is flushed once, in order. Candidates after
/// completion are never queued.
#[derive(Debug)]
pub struct CandidateOutbox {
    phase: OutboxPhase,
    pending: VecDeque<String>,
    gathering_done: bool,
}

impl CandidateOutbox {
    pub fn new() -> Self {
        Self {
            phase: OutboxPhase::Holding,
            pending: VecDeque::new(),
            gathering_done: false,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub async fn push(&mut self, text: String, sink: &dyn MessageSink) -> Result<(), SocketClosed> {
        match self.phase {
            OutboxPhase::Holding => {
                self.pending.push_back(text);
                Ok(())
            }
            OutboxPhase::Live => {
                if !self.pending.is_empty() {
                    self.pending.push_back(text);
                } else if let Err(SocketClosed) = sink.deliver(text.clone()).await {
                    debug!("[Stream]: holding candidate until gathering completes");
                    self.pending.push_back(text);
                }
                Ok(())
            }
            OutboxPhase::Complete => sink.deliver(text).await,
        }
    }

    /// Called once the offer reached the client
    pub async fn release(&mut self, sink: &dyn MessageSink) -> Result<(), SocketClosed> {
        if self.phase != OutboxPhase::Holding {
            return Ok(());
        }

        self.phase = OutboxPhase::Live;
        if self.gathering_done {
            return self.complete(sink).await;
        }

        Ok(())
    }

    pub async fn complete(&mut self, sink: &dyn MessageSink) -> Result<(), SocketClosed> {
        match self.phase {
            OutboxPhase::Holding => {
                self.gathering_done = true;
                Ok(())
            }
            OutboxPhase::Complete => Ok(()),
            OutboxPhase::Live => {
                self.phase = OutboxPhase::Complete;

                while let Some(text) = self.pending.pop_front() {
                    if let Err(err) = sink.deliver(text).await {
                        warn!(
                            "[Stream]: dropping {} held candidates, the socket is gone",
                            self.pending.len() + 1
                        );
                        self.pending.clear();
                        return Err(err);
                    }
                }

                Ok(())
            }
        }
    }
}

impl Default for CandidateOutbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the server knows about one open client socket
#[derive(Clone)]
pub struct ConnectionEntry {
    pub user_id: String,
    /// Rooms this socket is subscribed to
    pub rooms: Vec<String>,
    pub peer: Arc<dyn StreamPeer>,
    pub sender: Arc<dyn MessageSink>,
    /// Cancelled to make the socket loop close the socket
    pub closed: CancellationToken,
    pub outbox: Arc<Mutex<CandidateOutbox>>,
}

impl ConnectionEntry {
    pub fn new(
        user_id: String,
        rooms: Vec<String>,
        peer: Arc<dyn StreamPeer>,
        sender: Arc<dyn MessageSink>,
    ) -> Self {
        Self {
            user_id,
            rooms,
            peer,
            sender,
            closed: CancellationToken::new(),
            outbox: Default::default(),
        }
    }

    pub fn is_subscribed(&self, room_id: &str) -> bool {
        self.rooms.iter().any(|room| room == room_id)
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
}

/// The locked registry, held for whole traversals
pub struct Connections<'a> {
    entries: MutexGuard<'a, HashMap<ConnectionId, ConnectionEntry>>,
}

impl Connections<'_> {
    pub fn get(&self, id: &ConnectionId) -> Option<&ConnectionEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &ConnectionId) -> Option<&mut ConnectionEntry> {
        self.entries.get_mut(id)
    }

    pub fn insert(&mut self, id: ConnectionId, entry: ConnectionEntry) {
        self.entries.insert(id, entry);
    }

    pub fn remove(&mut self, id: &ConnectionId) -> Option<ConnectionEntry> {
        self.entries.remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn in_room<'s>(
        &'s self,
        room_id: &'s str,
    ) -> impl Iterator<Item = (&'s ConnectionId, &'s ConnectionEntry)> + 's {
        self.entries
            .iter()
            .filter(move |(_, entry)| entry.is_subscribed(room_id))
    }

    /// Connections subscribed to the room whose user is one of `members`
    pub fn member_ids(&self, room_id: &str, members: &[String]) -> Vec<ConnectionId> {
        self.in_room(room_id)
            .filter(|(_, entry)| members.contains(&entry.user_id))
            .map(|(id, _)| *id)
            .collect()
    }
}

impl ConnectionRegistry {
    pub async fn lock(&self) -> Connections<'_> {
        Connections {
            entries: self.entries.lock().await,
        }
    }

    pub async fn put(&self, id: ConnectionId, entry: ConnectionEntry) {
        self.lock().await.insert(id, entry);
    }

    pub async fn get(&self, id: &ConnectionId) -> Option<ConnectionEntry> {
        self.lock().await.get(id).cloned()
    }

    pub async fn delete(&self, id: &ConnectionId) -> Option<ConnectionEntry> {
        self.lock().await.remove(id)
    }

    pub async fn list_by_room_membership(&self, room_id: &str) -> Vec<ConnectionId> {
        self.lock()
            .await
            .in_room(room_id)
            .map(|(id, _)| *id)
            .collect()
    }
}
