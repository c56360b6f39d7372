use std::sync::{Arc, Weak};

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use common::{api_bindings::ErrorResponse, config::Config};
use log::{debug, error, info, warn};
use streamer::{
    bringup::{Bringup, BringupError, Milestone},
    capture::{CaptureEnvironment, CaptureManager},
    forward::spawn_forwarder,
    peer::{PeerError, PeerFactory, StreamPeer, WebRtcPeerFactory},
    pipeline::{GstPipelineBuilder, PipelineBuilder, SinkKind, StreamSinks},
};
use thiserror::Error;
use tokio::{spawn, sync::mpsc::Receiver};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    app::{
        auth::{AuthError, AuthenticatedUser, JwtVerifier},
        storage::{Storage, StorageError, create_storage},
    },
    connection::{ConnectionEntry, ConnectionId, ConnectionRegistry, MessageSink},
    fanout::fan_out,
    relay::{Relay, create_relay},
    room::{SessionError, SessionRegistry},
};

pub mod auth;
pub mod storage;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("the app got destroyed")]
    AppDestroyed,
    #[error("the stream start was interrupted")]
    Interrupted,
    // -- Unauthorized
    #[error("the action is not allowed because the user is not authorized: {0}")]
    Unauthorized(AuthError),
    // -- Bad Request
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("only the room's remote holder may start its stream")]
    NotRemoteHolder,
    #[error("{0}")]
    Session(#[from] SessionError),
    #[error("failed to start the stream: {0}")]
    Bringup(#[from] BringupError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("peer connection error: {0}")]
    Peer(#[from] PeerError),
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::AppDestroyed => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Interrupted => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            Self::NotRemoteHolder => StatusCode::BAD_REQUEST,
            Self::Session(_) => StatusCode::BAD_REQUEST,
            Self::Bringup(_) => StatusCode::BAD_REQUEST,
            Self::Storage(_) => StatusCode::BAD_REQUEST,
            Self::Peer(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
        })
    }
}

#[derive(Clone)]
pub struct AppRef {
    inner: Weak<AppInner>,
}

impl AppRef {
    pub fn access(&self) -> Result<App, AppError> {
        Weak::upgrade(&self.inner)
            .map(|inner| App { inner })
            .ok_or(AppError::AppDestroyed)
    }
}

struct AppInner {
    config: Config,
    storage: Arc<dyn Storage + Send + Sync>,
    relay: Arc<dyn Relay>,
    peers: Arc<dyn PeerFactory>,
    bringup: Bringup,
    verifier: JwtVerifier,
    connections: ConnectionRegistry,
    sessions: SessionRegistry,
}

/// The collaborators an [App] is assembled from
pub struct AppParts {
    pub config: Config,
    pub storage: Arc<dyn Storage + Send + Sync>,
    pub relay: Arc<dyn Relay>,
    pub peers: Arc<dyn PeerFactory>,
    pub capture: Arc<dyn CaptureEnvironment>,
    pub pipelines: Arc<dyn PipelineBuilder>,
    pub verifier: JwtVerifier,
}

#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

impl App {
    pub async fn new(config: Config) -> Result<Self, anyhow::Error> {
        let parts = AppParts {
            storage: create_storage(config.data_storage.clone()).await?,
            relay: create_relay(&config.relay).await?,
            peers: Arc::new(WebRtcPeerFactory::new(&config.webrtc)?),
            capture: Arc::new(CaptureManager::new(config.capture.clone())),
            pipelines: Arc::new(GstPipelineBuilder::new(config.pipeline.clone())),
            verifier: JwtVerifier::new(&config.auth)?,
            config,
        };

        Ok(Self::from_parts(parts))
    }

    pub fn from_parts(parts: AppParts) -> Self {
        let bringup = Bringup::new(
            parts.capture,
            parts.pipelines,
            parts.config.capture.geometry,
            parts.config.bringup_timeout,
        );

        Self {
            inner: Arc::new(AppInner {
                config: parts.config,
                storage: parts.storage,
                relay: parts.relay,
                peers: parts.peers,
                bringup,
                verifier: parts.verifier,
                connections: Default::default(),
                sessions: Default::default(),
            }),
        }
    }

    pub fn new_ref(&self) -> AppRef {
        AppRef {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage + Send + Sync> {
        &self.inner.storage
    }

    pub fn relay(&self) -> &Arc<dyn Relay> {
        &self.inner.relay
    }

    pub fn peers(&self) -> &Arc<dyn PeerFactory> {
        &self.inner.peers
    }

    pub fn verifier(&self) -> &JwtVerifier {
        &self.inner.verifier
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.inner.connections
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    /// Registers a freshly opened socket.
    /// The returned token fires when the server wants the socket closed.
    pub async fn open_connection(
        &self,
        user_id: String,
        rooms: Vec<String>,
        peer: Arc<dyn StreamPeer>,
        sender: Arc<dyn MessageSink>,
    ) -> (ConnectionId, CancellationToken) {
        let id = ConnectionId::new();
        let entry = ConnectionEntry::new(user_id, rooms, peer, sender);
        let closed = entry.closed.clone();

        info!(
            "[Signal]: connection {id} of {} opened with rooms {:?}",
            entry.user_id, entry.rooms
        );
        self.inner.connections.put(id, entry).await;

        (id, closed)
    }

    /// Removes the connection, closes its peer and asks its socket loop to close the socket.
    pub async fn drop_connection(&self, id: ConnectionId) {
        let Some(entry) = self.inner.connections.delete(&id).await else {
            return;
        };

        entry.closed.cancel();
        if let Err(err) = entry.peer.close().await {
            warn!(
                "[Signal]: failed to close peer of {} ({id}): {err}",
                entry.user_id
            );
        }

        info!("[Signal]: connection {id} of {} dropped", entry.user_id);
    }

    /// Removes the connection and closes its peer, the socket itself stays open.
    pub async fn disconnect_peer(&self, id: ConnectionId) -> bool {
        let Some(entry) = self.inner.connections.delete(&id).await else {
            return false;
        };

        if let Err(err) = entry.peer.close().await {
            warn!(
                "[Signal]: failed to close peer of {} ({id}): {err}",
                entry.user_id
            );
        }

        info!("[Signal]: {} disconnected their peer ({id})", entry.user_id);
        true
    }

    /// Brings up the room's stream and offers it to every connected member.
    ///
    /// Returns once the pipeline is playing and every member got an offer.
    pub async fn start_stream(
        &self,
        user: &AuthenticatedUser,
        room_id: &str,
    ) -> Result<(), AppError> {
        let holder = self.inner.storage.remote_holder(room_id).await?;
        if holder.as_deref() != Some(user.user_id.as_str()) {
            return Err(AppError::NotRemoteHolder);
        }
        let members = self.inner.storage.members(room_id).await?;

        let session = self.inner.sessions.get_or_create(room_id).await?;
        info!(
            "[Stream]: {} starts the stream of room {room_id}",
            user.user_id
        );

        let mut handle = self
            .inner
            .bringup
            .start(format!("room {room_id}"), session.cancel.clone());

        let sinks = match wait_for_pipeline(&mut handle.milestones).await {
            Ok(sinks) => sinks,
            Err(err) => {
                error!("[Stream]: bring-up of room {room_id} failed: {err}");

                self.inner
                    .sessions
                    .remove_if_current(room_id, session.id)
                    .await;
                session.cancel.cancel();

                return Err(err.into());
            }
        };

        if !self
            .inner
            .sessions
            .mark_streaming(room_id, session.id)
            .await
        {
            // Stopped while the pipeline came up
            session.cancel.cancel();
            return Err(BringupError::Cancelled.into());
        }

        let peers = Arc::new(fan_out(self, room_id, &members).await);
        info!(
            "[Stream]: room {room_id} is streaming to {} peers",
            peers.len()
        );

        let StreamSinks { video, audio } = sinks;
        spawn_forwarder(
            SinkKind::Video,
            video,
            peers.clone(),
            session.cancel.clone(),
        );
        spawn_forwarder(SinkKind::Audio, audio, peers, session.cancel.clone());

        let app = self.new_ref();
        let room_id = room_id.to_string();
        let session_id = session.id;
        spawn(async move {
            match handle.task.await {
                Ok(Ok(())) => debug!("[Stream]: session {session_id} of room {room_id} ended"),
                Ok(Err(err)) => {
                    warn!("[Stream]: session {session_id} of room {room_id} failed: {err}");

                    if let Ok(app) = app.access() {
                        app.end_session(&room_id, session_id).await;
                    }
                }
                Err(err) => error!("[Stream]: bring-up task of room {room_id} panicked: {err}"),
            }
        });

        Ok(())
    }

    /// Stops the room's stream and closes the peers of its members. Returns false if nothing was running.
    pub async fn stop_stream(&self, room_id: &str) -> bool {
        if self.inner.sessions.stop(room_id).await.is_none() {
            debug!("[Stream]: room {room_id} has no stream to stop");
            return false;
        }

        self.close_room_peers(room_id).await;
        true
    }

    /// Ends a failed session, unless it was already replaced by a newer one.
    pub async fn end_session(&self, room_id: &str, session_id: Uuid) {
        let Some(session) = self
            .inner
            .sessions
            .remove_if_current(room_id, session_id)
            .await
        else {
            return;
        };

        session.cancel.cancel();
        self.close_room_peers(room_id).await;
    }

    async fn close_room_peers(&self, room_id: &str) {
        let connections = self.inner.connections.lock().await;

        for (id, entry) in connections.in_room(room_id) {
            if let Err(err) = entry.peer.close().await {
                warn!(
                    "[Stream]: failed to close peer of {} ({id}) in room {room_id}: {err}",
                    entry.user_id
                );
            }
        }
    }
}

async fn wait_for_pipeline(
    milestones: &mut Receiver<Result<Milestone, BringupError>>,
) -> Result<StreamSinks, BringupError> {
    while let Some(milestone) = milestones.recv().await {
        match milestone? {
            Milestone::DisplayReady => debug!("[Stream]: display is ready"),
            Milestone::BrowserReady => debug!("[Stream]: browser is ready"),
            Milestone::PipelineReady(sinks) => return Ok(sinks),
        }
    }

    Err(BringupError::Aborted)
}
