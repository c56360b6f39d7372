//! Offering a freshly started stream to every connected member of the room.

use std::sync::Arc;

use common::{
    serialize_json,
    signaling::{Envelope, SERVER_SENDER, StreamVerb, Subject},
};
use futures::FutureExt;
use log::{debug, info, warn};
use streamer::{
    forward::ActivePeer,
    peer::{CandidateEvent, CandidateHandler},
};
use tokio::{spawn, sync::Mutex};

use crate::{
    app::{App, AppRef},
    connection::{CandidateOutbox, ConnectionEntry, ConnectionId, SocketClosed},
};

/// Negotiates with every connection of `members` subscribed to the room and returns the
/// peers that got an offer.
///
/// The registry stays locked for the whole traversal. A peer that fails to negotiate is
/// left out, a connection whose socket fails is removed.
pub async fn fan_out(app: &App, room_id: &str, members: &[String]) -> Vec<ActivePeer> {
    let mut connections = app.connections().lock().await;

    let mut active = Vec::new();
    let mut failed = Vec::new();

    for id in connections.member_ids(room_id, members) {
        let Some(entry) = connections.get_mut(&id) else {
            continue;
        };

        if entry.peer.is_closed() {
            match app.peers().create(&entry.user_id).await {
                Ok(peer) => {
                    debug!(
                        "[Stream]: replaced closed peer of {} ({id})",
                        entry.user_id
                    );
                    entry.peer = peer;
                }
                Err(err) => {
                    warn!(
                        "[Stream]: failed to recreate peer of {} in room {room_id}: {err}",
                        entry.user_id
                    );
                    continue;
                }
            }
        }

        // Every negotiation starts with an empty outbox
        entry.outbox = Arc::new(Mutex::new(CandidateOutbox::new()));
        entry
            .peer
            .on_candidate(candidate_handler(app.new_ref(), id, room_id, entry));

        match offer(room_id, entry).await {
            Ok(true) => active.push(ActivePeer {
                label: format!("{room_id}/{}", entry.user_id),
                peer: entry.peer.clone(),
            }),
            Ok(false) => {}
            Err(SocketClosed) => {
                warn!(
                    "[Stream]: socket of {} ({id}) failed while offering room {room_id}",
                    entry.user_id
                );
                failed.push(id);
            }
        }
    }

    for id in failed {
        if let Some(entry) = connections.remove(&id) {
            entry.closed.cancel();

            if let Err(err) = entry.peer.close().await {
                warn!("[Stream]: failed to close peer of {}: {err}", entry.user_id);
            }
        }
    }

    active
}

/// Returns false if the peer couldn't create an offer
async fn offer(room_id: &str, entry: &ConnectionEntry) -> Result<bool, SocketClosed> {
    let sdp = match entry.peer.create_offer().await {
        Ok(sdp) => sdp,
        Err(err) => {
            warn!(
                "[Stream]: failed to create offer for {} in room {room_id}: {err}",
                entry.user_id
            );
            return Ok(false);
        }
    };

    let subject = Subject::stream(StreamVerb::Offer, room_id, &entry.user_id);
    let Some(text) = serialize_json(&Envelope::new(SERVER_SENDER, &subject, sdp)) else {
        return Ok(false);
    };

    entry.sender.deliver(text).await?;
    info!("[Stream]: sent {subject}");

    entry.outbox.lock().await.release(entry.sender.as_ref()).await?;

    Ok(true)
}

fn candidate_handler(
    app: AppRef,
    id: ConnectionId,
    room_id: &str,
    entry: &ConnectionEntry,
) -> CandidateHandler {
    let subject = Subject::stream(StreamVerb::Ice, room_id, &entry.user_id);
    let outbox = entry.outbox.clone();
    let sender = entry.sender.clone();

    Arc::new(move |event: CandidateEvent| {
        let app = app.clone();
        let subject = subject.clone();
        let outbox = outbox.clone();
        let sender = sender.clone();

        async move {
            let mut outbox = outbox.lock().await;

            let result = match event {
                CandidateEvent::Candidate(candidate) => {
                    match serialize_json(&Envelope::new(SERVER_SENDER, &subject, candidate)) {
                        Some(text) => outbox.push(text, sender.as_ref()).await,
                        None => Ok(()),
                    }
                }
                CandidateEvent::GatheringComplete => {
                    debug!("[Stream]: gathering complete for {subject}");
                    outbox.complete(sender.as_ref()).await
                }
            };
            drop(outbox);

            if result.is_err() {
                warn!("[Stream]: failed to deliver candidates for {subject}, dropping {id}");

                // The registry may be locked by the fan-out that triggered this
                spawn(async move {
                    if let Ok(app) = app.access() {
                        app.drop_connection(id).await;
                    }
                });
            }
        }
        .boxed()
    })
}
