//! Fakes for the collaborators of [App], used by the unit tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use jsonwebtoken::{EncodingKey, Header, encode};
use common::{
    api_bindings::{ChatMessagePayload, RtcIceCandidate, RtcSessionDescription},
    config::{AuthConfig, Config, Geometry},
};
use streamer::{
    capture::{CaptureEnvironment, CaptureError, CaptureEvent},
    peer::{CandidateEvent, CandidateHandler, PeerError, PeerFactory, StreamPeer},
    pipeline::{
        MediaPipeline, MediaSample, PipelineBuilder, PipelineError, PipelineState, SampleSink,
        SinkKind,
    },
};
use tokio::{
    spawn,
    sync::{mpsc, oneshot},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

use crate::{
    app::{
        App, AppParts,
        auth::{Claims, JwtVerifier},
        storage::{Storage, StorageError},
    },
    connection::{ConnectionId, MessageSink, SocketClosed},
    relay::LocalRelay,
};

pub async fn wait_until(limit: Duration, condition: impl Fn() -> bool) {
    timeout(limit, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}

// -- Storage

/// r1: u1 (holder) and u2, r2: u2 and u3 (holder)
pub struct FakeStorage {
    rooms: HashMap<String, (Vec<String>, Option<String>)>,
    stored: Mutex<Vec<(String, String, ChatMessagePayload)>>,
    failing: AtomicBool,
}

impl Default for FakeStorage {
    fn default() -> Self {
        let room = |members: &[&str], holder: &str| {
            (
                members.iter().map(|member| member.to_string()).collect(),
                Some(holder.to_string()),
            )
        };

        Self {
            rooms: HashMap::from([
                ("r1".to_string(), room(&["u1", "u2"], "u1")),
                ("r2".to_string(), room(&["u2", "u3"], "u3")),
            ]),
            stored: Default::default(),
            failing: Default::default(),
        }
    }
}

impl FakeStorage {
    pub fn stored(&self) -> Vec<(String, String, ChatMessagePayload)> {
        self.stored.lock().expect("stored").clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn room(&self, room_id: &str) -> Result<&(Vec<String>, Option<String>), StorageError> {
        self.rooms
            .get(room_id)
            .ok_or_else(|| StorageError::RoomNotFound(room_id.to_string()))
    }
}

#[async_trait]
impl Storage for FakeStorage {
    async fn members(&self, room_id: &str) -> Result<Vec<String>, StorageError> {
        Ok(self.room(room_id)?.0.clone())
    }

    async fn remote_holder(&self, room_id: &str) -> Result<Option<String>, StorageError> {
        Ok(self.room(room_id)?.1.clone())
    }

    async fn user_rooms(&self, user_id: &str) -> Result<Vec<String>, StorageError> {
        let mut rooms = self
            .rooms
            .iter()
            .filter(|(_, (members, _))| members.iter().any(|member| member == user_id))
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
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::RoomNotFound(room_id.to_string()));
        }

        self.stored.lock().expect("stored").push((
            sender.to_string(),
            room_id.to_string(),
            message.clone(),
        ));
        Ok(())
    }
}

// -- Capture

#[derive(Default)]
pub struct FakeCapture {
    launches: AtomicUsize,
    torn_down: Arc<AtomicUsize>,
}

impl FakeCapture {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn torn_down(&self) -> usize {
        self.torn_down.load(Ordering::SeqCst)
    }
}

impl CaptureEnvironment for FakeCapture {
    fn start(
        &self,
        cancel: CancellationToken,
        _geometry: Geometry,
    ) -> Result<mpsc::Receiver<CaptureEvent>, CaptureError> {
        self.launches.fetch_add(1, Ordering::SeqCst);

        let (sender, receiver) = mpsc::channel(5);
        let torn_down = self.torn_down.clone();

        spawn(async move {
            for event in [
                CaptureEvent::DisplayReady { display: 99 },
                CaptureEvent::BrowserReady,
            ] {
                if sender.send(event).await.is_err() {
                    break;
                }
            }

            cancel.cancelled().await;
            torn_down.fetch_add(1, Ordering::SeqCst);
        });

        Ok(receiver)
    }
}

// -- Pipeline

struct EndedSink;

impl SampleSink for EndedSink {
    fn pull(&mut self) -> Option<MediaSample> {
        None
    }
}

#[derive(Default)]
pub struct FakePipelineBuilder {
    fail_build: bool,
    error_triggers: Arc<Mutex<Vec<oneshot::Sender<PipelineError>>>>,
}

impl FakePipelineBuilder {
    /// Reports a runtime error from the most recently started pipeline
    pub fn fail_running(&self, message: &str) {
        let trigger = self
            .error_triggers
            .lock()
            .expect("triggers")
            .pop()
            .expect("a pipeline is running");

        trigger
            .send(PipelineError::Runtime {
                element: "ximagesrc0".to_string(),
                message: message.to_string(),
            })
            .expect("bring-up is watching");
    }
}

impl PipelineBuilder for FakePipelineBuilder {
    fn build(
        &self,
        _display: u32,
        _geometry: Geometry,
    ) -> Result<Box<dyn MediaPipeline>, PipelineError> {
        if self.fail_build {
            return Err(PipelineError::Build("no element \"x264enc\"".to_string()));
        }

        Ok(Box::new(FakePipeline {
            error_triggers: self.error_triggers.clone(),
        }))
    }
}

struct FakePipeline {
    error_triggers: Arc<Mutex<Vec<oneshot::Sender<PipelineError>>>>,
}

impl MediaPipeline for FakePipeline {
    fn set_state(&self, _state: PipelineState) -> Result<(), PipelineError> {
        Ok(())
    }

    fn sink(&self, _kind: SinkKind) -> Result<Box<dyn SampleSink>, PipelineError> {
        Ok(Box::new(EndedSink))
    }

    fn watch_errors(&self, _cancel: CancellationToken) -> oneshot::Receiver<PipelineError> {
        let (sender, receiver) = oneshot::channel();
        self.error_triggers.lock().expect("triggers").push(sender);
        receiver
    }
}

// -- Peers

pub fn candidate(line: &str) -> RtcIceCandidate {
    RtcIceCandidate {
        candidate: line.to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

/// Gathers two candidates and completes while the offer is created
pub struct FakePeer {
    user_id: String,
    fail_offer: bool,
    closed: AtomicBool,
    offers: AtomicUsize,
    handler: Mutex<Option<CandidateHandler>>,
    answers: Mutex<Vec<RtcSessionDescription>>,
    remote_candidates: Mutex<Vec<RtcIceCandidate>>,
}

impl FakePeer {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            fail_offer: false,
            closed: Default::default(),
            offers: Default::default(),
            handler: Default::default(),
            answers: Default::default(),
            remote_candidates: Default::default(),
        }
    }

    pub fn offers(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn answers(&self) -> Vec<RtcSessionDescription> {
        self.answers.lock().expect("answers").clone()
    }

    pub fn remote_candidates(&self) -> Vec<RtcIceCandidate> {
        self.remote_candidates.lock().expect("candidates").clone()
    }

    pub async fn emit_candidate(&self, line: &str) {
        self.emit(CandidateEvent::Candidate(candidate(line))).await;
    }

    async fn emit(&self, event: CandidateEvent) {
        let handler = self.handler.lock().expect("handler").clone();

        if let Some(handler) = handler {
            handler(event).await;
        }
    }
}

#[async_trait]
impl StreamPeer for FakePeer {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn on_candidate(&self, handler: CandidateHandler) {
        *self.handler.lock().expect("handler") = Some(handler);
    }

    async fn create_offer(&self) -> Result<String, PeerError> {
        if self.is_closed() || self.fail_offer {
            return Err(PeerError::Closed);
        }

        let count = self.offers.fetch_add(1, Ordering::SeqCst) + 1;

        self.emit_candidate("candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host")
            .await;
        self.emit_candidate("candidate:2 1 udp 1686052607 203.0.113.7 50000 typ srflx")
            .await;
        self.emit(CandidateEvent::GatheringComplete).await;

        Ok(format!("v=0 offer {count} for {}", self.user_id))
    }

    async fn apply_answer(&self, answer: RtcSessionDescription) -> Result<(), PeerError> {
        self.answers.lock().expect("answers").push(answer);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: RtcIceCandidate) -> Result<(), PeerError> {
        self.remote_candidates
            .lock()
            .expect("candidates")
            .push(candidate);
        Ok(())
    }

    async fn write_sample(&self, _kind: SinkKind, _sample: &MediaSample) -> Result<(), PeerError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    created: Mutex<Vec<Arc<FakePeer>>>,
    failing_offers: Mutex<HashSet<String>>,
}

impl FakePeerFactory {
    pub fn fail_offers_for(&self, user_id: &str) {
        self.failing_offers
            .lock()
            .expect("failing offers")
            .insert(user_id.to_string());
    }

    /// The `index`th peer created for the user
    pub fn peer(&self, user_id: &str, index: usize) -> Arc<FakePeer> {
        self.created
            .lock()
            .expect("created")
            .iter()
            .filter(|peer| peer.user_id == user_id)
            .nth(index)
            .cloned()
            .expect("peer was created")
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(&self, user_id: &str) -> Result<Arc<dyn StreamPeer>, PeerError> {
        let fail_offer = self
            .failing_offers
            .lock()
            .expect("failing offers")
            .contains(user_id);

        let peer = Arc::new(FakePeer {
            fail_offer,
            ..FakePeer::new(user_id)
        });
        self.created.lock().expect("created").push(peer.clone());

        Ok(peer)
    }
}

// -- Sockets

#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("sent").clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn deliver(&self, text: String) -> Result<(), SocketClosed> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SocketClosed);
        }

        self.sent.lock().expect("sent").push(text);
        Ok(())
    }
}

// -- App

const TEST_SECRET: &[u8] = b"test-secret";

pub struct TestApp {
    pub app: App,
    pub storage: Arc<FakeStorage>,
    pub relay: Arc<LocalRelay>,
    pub peers: Arc<FakePeerFactory>,
    pub capture: Arc<FakeCapture>,
    pub pipelines: Arc<FakePipelineBuilder>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_pipelines(FakePipelineBuilder::default())
    }

    pub fn with_failing_pipeline() -> Self {
        Self::with_pipelines(FakePipelineBuilder {
            fail_build: true,
            ..Default::default()
        })
    }

    fn with_pipelines(pipelines: FakePipelineBuilder) -> Self {
        let storage = Arc::new(FakeStorage::default());
        let relay = Arc::new(LocalRelay::new());
        let peers = Arc::new(FakePeerFactory::default());
        let capture = Arc::new(FakeCapture::default());
        let pipelines = Arc::new(pipelines);

        let config = Config {
            bringup_timeout: Duration::from_secs(5),
            ..Default::default()
        };

        let app = App::from_parts(AppParts {
            config,
            storage: storage.clone(),
            relay: relay.clone(),
            peers: peers.clone(),
            capture: capture.clone(),
            pipelines: pipelines.clone(),
            verifier: JwtVerifier::with_secret(&AuthConfig::default(), TEST_SECRET),
        });

        Self {
            app,
            storage,
            relay,
            peers,
            capture,
            pipelines,
        }
    }

    /// A token the app's verifier accepts for the user
    pub fn token(&self, user_id: &str) -> String {
        let config = AuthConfig::default();
        let expires = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time")
            .as_secs()
            + 3600;

        encode(
            &Header::default(),
            &Claims {
                sub: user_id.to_string(),
                iss: config.issuer,
                aud: config.audience,
                exp: expires,
            },
            &EncodingKey::from_secret(TEST_SECRET),
        )
        .expect("encode")
    }

    /// Opens a connection the way the chat socket does, with the user's rooms subscribed
    pub async fn connect(&self, user_id: &str) -> (ConnectionId, Arc<RecordingSink>) {
        let rooms = self.storage.user_rooms(user_id).await.expect("rooms");
        let peer = self.peers.create(user_id).await.expect("peer");
        let sink = Arc::new(RecordingSink::default());

        let (id, _closed) = self
            .app
            .open_connection(user_id.to_string(), rooms, peer, sink.clone())
            .await;

        (id, sink)
    }
}
