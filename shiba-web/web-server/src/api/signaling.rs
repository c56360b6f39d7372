//! Dispatch of the envelopes a client sends over its chat socket.

use common::{
    api_bindings::{ChatMessagePayload, RtcIceCandidate, RtcSessionDescription},
    signaling::{Envelope, Route, StreamVerb, Subject, SubjectError},
};
use futures::{FutureExt, future::BoxFuture};
use log::{debug, info};
use serde_json::Value;
use streamer::peer::PeerError;
use thiserror::Error;

use crate::{
    app::{App, storage::StorageError},
    connection::ConnectionId,
    relay::RelayError,
};

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("malformed envelope: {0}")]
    Envelope(serde_json::Error),
    #[error("envelope claims to be from \"{0}\"")]
    SenderMismatch(String),
    #[error("{0}")]
    Subject(#[from] SubjectError),
    #[error("not subscribed to room {0}")]
    NotSubscribed(String),
    #[error("subject addresses another user \"{0}\"")]
    UserMismatch(String),
    #[error("undecodable payload: {0}")]
    Payload(serde_json::Error),
    #[error("connection {0} has no peer anymore")]
    UnknownConnection(ConnectionId),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("peer connection error: {0}")]
    Peer(#[from] PeerError),
}

/// The socket a message arrived on
pub struct SignalContext<'a> {
    pub app: &'a App,
    pub connection_id: ConnectionId,
    pub user_id: &'a str,
    /// Rooms the socket is subscribed to
    pub rooms: &'a [String],
}

pub struct Incoming<'a> {
    pub subject: Subject,
    pub payload: Value,
    /// The frame as received, relayed verbatim
    pub raw: &'a str,
}

type Handler =
    for<'a> fn(&'a SignalContext<'a>, Incoming<'a>) -> BoxFuture<'a, Result<(), SignalError>>;

static ROUTES: [(Route, Handler); 6] = [
    (Route::Chat, chat),
    (Route::WebRtc, webrtc),
    (Route::Stream(StreamVerb::Answer), answer),
    (Route::Stream(StreamVerb::Ice), ice),
    (Route::Stream(StreamVerb::Disconnected), disconnected),
    (Route::Stream(StreamVerb::StopStream), stop_stream),
];

/// Validates one text frame and runs the handler of its subject.
pub async fn dispatch(ctx: &SignalContext<'_>, text: &str) -> Result<(), SignalError> {
    let envelope = serde_json::from_str::<Envelope>(text).map_err(SignalError::Envelope)?;

    if envelope.sender != ctx.user_id {
        return Err(SignalError::SenderMismatch(envelope.sender));
    }

    let subject = envelope.subject.parse::<Subject>()?;
    if !ctx.rooms.contains(&subject.room_id) {
        return Err(SignalError::NotSubscribed(subject.room_id));
    }
    if let Some(user_id) = subject
        .user_id
        .as_ref()
        .filter(|user_id| *user_id != ctx.user_id)
    {
        return Err(SignalError::UserMismatch(user_id.clone()));
    }

    let route = subject.route()?;
    let Some((_, handler)) = ROUTES.iter().find(|(candidate, _)| *candidate == route) else {
        debug!(
            "[Signal]: ignoring {subject} from {}, nothing handles it",
            ctx.user_id
        );
        return Ok(());
    };

    handler(
        ctx,
        Incoming {
            subject,
            payload: envelope.payload,
            raw: text,
        },
    )
    .await
}

fn decode<T>(payload: Value) -> Result<T, SignalError>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_value(payload).map_err(SignalError::Payload)
}

fn chat<'a>(
    ctx: &'a SignalContext<'a>,
    message: Incoming<'a>,
) -> BoxFuture<'a, Result<(), SignalError>> {
    async move {
        let payload = decode::<ChatMessagePayload>(message.payload)?;
        let room_id = &message.subject.room_id;

        ctx.app
            .storage()
            .store_message(ctx.user_id, room_id, &payload)
            .await?;

        if let Some(topic) = message.subject.relay_topic() {
            ctx.app
                .relay()
                .publish(&topic, message.raw.to_string())
                .await?;
        }

        debug!("[Signal]: {} wrote to room {room_id}", ctx.user_id);
        Ok(())
    }
    .boxed()
}

fn webrtc<'a>(
    ctx: &'a SignalContext<'a>,
    message: Incoming<'a>,
) -> BoxFuture<'a, Result<(), SignalError>> {
    async move {
        if let Some(topic) = message.subject.relay_topic() {
            ctx.app
                .relay()
                .publish(&topic, message.raw.to_string())
                .await?;
        }
        Ok(())
    }
    .boxed()
}

fn answer<'a>(
    ctx: &'a SignalContext<'a>,
    message: Incoming<'a>,
) -> BoxFuture<'a, Result<(), SignalError>> {
    async move {
        let description = decode::<RtcSessionDescription>(message.payload)?;

        let connections = ctx.app.connections().lock().await;
        let entry = connections
            .get(&ctx.connection_id)
            .ok_or(SignalError::UnknownConnection(ctx.connection_id))?;

        entry.peer.apply_answer(description).await?;

        info!(
            "[Signal]: applied answer of {} in room {}",
            ctx.user_id, message.subject.room_id
        );
        Ok(())
    }
    .boxed()
}

fn ice<'a>(
    ctx: &'a SignalContext<'a>,
    message: Incoming<'a>,
) -> BoxFuture<'a, Result<(), SignalError>> {
    async move {
        let candidate = decode::<RtcIceCandidate>(message.payload)?;

        let connections = ctx.app.connections().lock().await;
        let entry = connections
            .get(&ctx.connection_id)
            .ok_or(SignalError::UnknownConnection(ctx.connection_id))?;

        entry.peer.add_remote_candidate(candidate).await?;
        Ok(())
    }
    .boxed()
}

fn disconnected<'a>(
    ctx: &'a SignalContext<'a>,
    message: Incoming<'a>,
) -> BoxFuture<'a, Result<(), SignalError>> {
    async move {
        info!(
            "[Signal]: {} left the stream of room {}",
            ctx.user_id, message.subject.room_id
        );

        if !ctx.app.disconnect_peer(ctx.connection_id).await {
            debug!("[Signal]: connection {} was already gone", ctx.connection_id);
        }
        Ok(())
    }
    .boxed()
}

fn stop_stream<'a>(
    ctx: &'a SignalContext<'a>,
    message: Incoming<'a>,
) -> BoxFuture<'a, Result<(), SignalError>> {
    async move {
        let room_id = &message.subject.room_id;
        info!("[Signal]: {} stops the stream of room {room_id}", ctx.user_id);

        ctx.app.stop_stream(room_id).await;
        Ok(())
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use common::api_bindings::RtcSdpType;
    use futures::{StreamExt, stream::BoxStream};
    use serde_json::json;
    use tokio::time::timeout;
    use streamer::peer::StreamPeer;

    use super::*;
    use crate::{
        app::auth::AuthenticatedUser,
        relay::Relay,
        test_support::{TestApp, wait_until},
    };

    fn rooms(rooms: &[&str]) -> Vec<String> {
        rooms.iter().map(|room| room.to_string()).collect()
    }

    fn frame(sender: &str, subject: &str, payload: Value) -> String {
        json!({ "sender": sender, "subject": subject, "payload": payload }).to_string()
    }

    fn chat_payload() -> Value {
        json!({
            "id": "m1",
            "sender_name": "Alice",
            "content": "hello",
            "created_at": "2024-05-01T12:00:00Z",
        })
    }

    async fn next(stream: &mut BoxStream<'static, String>) -> Option<String> {
        timeout(Duration::from_millis(200), stream.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_chat_is_stored_then_relayed() {
        let test = TestApp::new();
        let (id, _) = test.connect("u1").await;
        let mut published = test.relay.subscribe("chatrooms.r1").await.expect("subscribe");

        let rooms = rooms(&["r1"]);
        let ctx = SignalContext {
            app: &test.app,
            connection_id: id,
            user_id: "u1",
            rooms: &rooms,
        };

        let text = frame("u1", "chat.r1", chat_payload());
        dispatch(&ctx, &text).await.expect("dispatch");

        let stored = test.storage.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].0, "u1");
        assert_eq!(stored[0].1, "r1");
        assert_eq!(stored[0].2.content, "hello");

        assert_eq!(next(&mut published).await, Some(text));
        assert_eq!(next(&mut published).await, None);
    }

    #[tokio::test]
    async fn test_failed_store_is_not_relayed() {
        let test = TestApp::new();
        let (id, _) = test.connect("u1").await;
        let mut published = test.relay.subscribe("chatrooms.r1").await.expect("subscribe");
        test.storage.set_failing(true);

        let rooms = rooms(&["r1"]);
        let ctx = SignalContext {
            app: &test.app,
            connection_id: id,
            user_id: "u1",
            rooms: &rooms,
        };

        let result = dispatch(&ctx, &frame("u1", "chat.r1", chat_payload())).await;
        assert!(matches!(result, Err(SignalError::Storage(_))));
        assert_eq!(next(&mut published).await, None);
    }

    #[tokio::test]
    async fn test_webrtc_is_relayed_verbatim() {
        let test = TestApp::new();
        let (id, _) = test.connect("u1").await;
        let mut published = test.relay.subscribe("webrtc.*.r1").await.expect("subscribe");

        let rooms = rooms(&["r1"]);
        let ctx = SignalContext {
            app: &test.app,
            connection_id: id,
            user_id: "u1",
            rooms: &rooms,
        };

        let text = frame("u1", "webrtc.offer.r1", json!({ "sdp": "v=0" }));
        dispatch(&ctx, &text).await.expect("dispatch");

        assert_eq!(next(&mut published).await, Some(text));
        assert!(test.storage.stored().is_empty());
    }

    #[tokio::test]
    async fn test_answer_and_candidate_reach_the_peer() {
        let test = TestApp::new();
        let (id, _) = test.connect("u1").await;

        let rooms = rooms(&["r1"]);
        let ctx = SignalContext {
            app: &test.app,
            connection_id: id,
            user_id: "u1",
            rooms: &rooms,
        };

        let answer = frame(
            "u1",
            "stream.answer.r1.u1",
            json!({ "type": "answer", "sdp": "v=0 answer" }),
        );
        dispatch(&ctx, &answer).await.expect("answer");

        // The user segment is optional
        let candidate = frame(
            "u1",
            "stream.ice.r1",
            json!({
                "candidate": "candidate:1 1 udp 1 10.0.0.1 40000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
            }),
        );
        dispatch(&ctx, &candidate).await.expect("candidate");

        let peer = test.peers.peer("u1", 0);
        assert_eq!(
            peer.answers(),
            vec![RtcSessionDescription {
                ty: RtcSdpType::Answer,
                sdp: "v=0 answer".to_string(),
            }]
        );
        assert_eq!(peer.remote_candidates().len(), 1);
        assert_eq!(
            peer.remote_candidates()[0].candidate,
            "candidate:1 1 udp 1 10.0.0.1 40000 typ host"
        );
    }

    #[tokio::test]
    async fn test_undecodable_answer_is_rejected() {
        let test = TestApp::new();
        let (id, _) = test.connect("u1").await;

        let rooms = rooms(&["r1"]);
        let ctx = SignalContext {
            app: &test.app,
            connection_id: id,
            user_id: "u1",
            rooms: &rooms,
        };

        let result = dispatch(&ctx, &frame("u1", "stream.answer.r1.u1", json!("v=0"))).await;
        assert!(matches!(result, Err(SignalError::Payload(_))));
        assert!(test.peers.peer("u1", 0).answers().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_envelopes() {
        let test = TestApp::new();
        let (id, _) = test.connect("u1").await;

        let rooms = rooms(&["r1"]);
        let ctx = SignalContext {
            app: &test.app,
            connection_id: id,
            user_id: "u1",
            rooms: &rooms,
        };

        assert!(matches!(
            dispatch(&ctx, "{not json").await,
            Err(SignalError::Envelope(_))
        ));
        assert!(matches!(
            dispatch(&ctx, &frame("u2", "chat.r1", chat_payload())).await,
            Err(SignalError::SenderMismatch(sender)) if sender == "u2"
        ));
        assert!(matches!(
            dispatch(&ctx, &frame("u1", "chat.r2", chat_payload())).await,
            Err(SignalError::NotSubscribed(room)) if room == "r2"
        ));
        assert!(matches!(
            dispatch(&ctx, &frame("u1", "stream.answer.r1.u2", json!({}))).await,
            Err(SignalError::UserMismatch(user)) if user == "u2"
        ));
        assert!(matches!(
            dispatch(&ctx, &frame("u1", "stream.dance.r1", json!({}))).await,
            Err(SignalError::Subject(SubjectError::UnknownVerb(_)))
        ));
        assert!(matches!(
            dispatch(&ctx, &frame("u1", "presence.r1", json!({}))).await,
            Err(SignalError::Subject(SubjectError::UnknownNamespace(_)))
        ));

        // Offers only ever travel from the server to clients
        dispatch(&ctx, &frame("u1", "stream.offer.r1.u1", json!("v=0")))
            .await
            .expect("ignored");

        assert!(test.storage.stored().is_empty());
    }

    #[tokio::test]
    async fn test_disconnected_keeps_the_socket() {
        let test = TestApp::new();
        let (id, _) = test.connect("u1").await;
        let closed = test
            .app
            .connections()
            .get(&id)
            .await
            .expect("entry")
            .closed;

        let rooms = rooms(&["r1"]);
        let ctx = SignalContext {
            app: &test.app,
            connection_id: id,
            user_id: "u1",
            rooms: &rooms,
        };

        dispatch(&ctx, &frame("u1", "stream.disconnected.r1.u1", Value::Null))
            .await
            .expect("disconnect");

        assert!(test.app.connections().get(&id).await.is_none());
        assert!(test.peers.peer("u1", 0).is_closed());
        assert!(!closed.is_cancelled());

        // Later answers have nothing to apply to
        let answer = frame(
            "u1",
            "stream.answer.r1.u1",
            json!({ "type": "answer", "sdp": "v=0" }),
        );
        assert!(matches!(
            dispatch(&ctx, &answer).await,
            Err(SignalError::UnknownConnection(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_stream_message() {
        let test = TestApp::new();
        let (u1, _) = test.connect("u1").await;
        let (u2, _) = test.connect("u2").await;

        test.app
            .start_stream(
                &AuthenticatedUser {
                    user_id: "u1".to_string(),
                },
                "r1",
            )
            .await
            .expect("start stream");

        let rooms = rooms(&["r1"]);
        let ctx = SignalContext {
            app: &test.app,
            connection_id: u1,
            user_id: "u1",
            rooms: &rooms,
        };

        let stop = frame("u1", "stream.stop-stream.r1.u1", Value::Null);
        dispatch(&ctx, &stop).await.expect("stop");

        assert!(test.app.sessions().get("r1").await.is_none());
        for id in [u1, u2] {
            let entry = test.app.connections().get(&id).await.expect("entry");
            assert!(entry.peer.is_closed());
        }
        wait_until(Duration::from_secs(5), || test.capture.torn_down() == 1).await;

        dispatch(&ctx, &stop).await.expect("second stop");
        assert!(test.app.sessions().get("r1").await.is_none());
        assert_eq!(test.capture.launches(), 1);
    }
}
