use std::sync::Arc;

use actix_web::{
    Error, HttpRequest, HttpResponse, get, rt as actix_rt,
    web::{Data, Payload, Query},
};
use actix_ws::{Message, MessageStream, Session};
use common::{
    api_bindings::ChatSocketQuery,
    signaling::{chat_topic, webrtc_pattern},
};
use futures::{StreamExt, stream::BoxStream};
use log::{debug, info, warn};
use streamer::peer::StreamPeer;
use tokio::{select, spawn};
use tokio_util::sync::CancellationToken;

use crate::{
    api::signaling::{SignalContext, dispatch},
    app::{App, AppError, AppRef, auth::AuthenticatedUser},
    connection::{ConnectionId, MessageSink},
};

/// The chat socket: room chat, client to client negotiation and stream signaling
#[get("/chat")]
pub async fn chat_socket(
    web_app: Data<App>,
    user: AuthenticatedUser,
    Query(query): Query<ChatSocketQuery>,
    request: HttpRequest,
    payload: Payload,
) -> Result<HttpResponse, Error> {
    let rooms = web_app
        .storage()
        .user_rooms(&user.user_id)
        .await
        .map_err(AppError::from)?;
    let peer = web_app
        .peers()
        .create(&user.user_id)
        .await
        .map_err(AppError::from)?;

    let (response, session, stream) = actix_ws::handle(&request, payload)?;

    if let Some(cid) = &query.cid {
        debug!("[Signal]: {} opens the socket from room {cid}", user.user_id);
    }

    let app = web_app.get_ref().clone();
    actix_rt::spawn(async move {
        handle_socket(app, user.user_id, rooms, peer, session, stream).await;
    });

    Ok(response)
}

async fn handle_socket(
    app: App,
    user_id: String,
    rooms: Vec<String>,
    peer: Arc<dyn StreamPeer>,
    mut session: Session,
    mut stream: MessageStream,
) {
    let sender: Arc<dyn MessageSink> = Arc::new(session.clone());
    let (connection_id, closed) = app
        .open_connection(user_id.clone(), rooms.clone(), peer, sender.clone())
        .await;

    for room_id in &rooms {
        for pattern in [chat_topic(room_id), webrtc_pattern(room_id)] {
            match app.relay().subscribe(&pattern).await {
                Ok(messages) => {
                    spawn(forward_relay(
                        app.new_ref(),
                        connection_id,
                        messages,
                        sender.clone(),
                        closed.clone(),
                    ));
                }
                Err(err) => {
                    warn!("[Relay]: failed to subscribe {connection_id} to {pattern}: {err}");
                }
            }
        }
    }

    let ctx = SignalContext {
        app: &app,
        connection_id,
        user_id: &user_id,
        rooms: &rooms,
    };

    loop {
        let message = select! {
            _ = closed.cancelled() => {
                debug!("[Signal]: closing socket of {user_id} ({connection_id})");
                break;
            }
            message = stream.recv() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                if let Err(err) = dispatch(&ctx, &text).await {
                    warn!("[Signal]: dropped message of {user_id} ({connection_id}): {err}");
                }
            }
            Some(Ok(Message::Ping(bytes))) => {
                if session.pong(&bytes).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Binary(_))) => {
                warn!("[Signal]: {user_id} sent a binary frame, closing the socket");
                break;
            }
            Some(Ok(Message::Close(reason))) => {
                debug!("[Signal]: {user_id} closed the socket: {reason:?}");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                warn!("[Signal]: protocol error on socket of {user_id}: {err}");
                break;
            }
            None => break,
        }
    }

    // Also ends the relay forwarders
    closed.cancel();
    app.drop_connection(connection_id).await;
    let _ = session.close(None).await;

    info!("[Signal]: socket of {user_id} ({connection_id}) closed");
}

/// Writes every relayed message to the socket. A failed write drops the connection.
async fn forward_relay(
    app: AppRef,
    connection_id: ConnectionId,
    mut messages: BoxStream<'static, String>,
    sender: Arc<dyn MessageSink>,
    closed: CancellationToken,
) {
    loop {
        let message = select! {
            _ = closed.cancelled() => break,
            message = messages.next() => message,
        };
        let Some(message) = message else {
            break;
        };

        if sender.deliver(message).await.is_err() {
            warn!("[Relay]: failed to deliver to {connection_id}, dropping the connection");

            if let Ok(app) = app.access() {
                app.drop_connection(connection_id).await;
            }
            closed.cancel();
            break;
        }
    }
}
