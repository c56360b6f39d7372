use std::sync::Arc;

use log::{debug, info, warn};
use tokio::{
    runtime::Handle,
    task::{JoinHandle, spawn_blocking},
};
use tokio_util::sync::CancellationToken;

use crate::{
    peer::StreamPeer,
    pipeline::{SampleSink, SinkKind},
};

/// A viewer whose peer receives the stream
#[derive(Clone)]
pub struct ActivePeer {
    pub label: String,
    pub peer: Arc<dyn StreamPeer>,
}

/// Pulls samples from `sink` and writes each of them to every peer.
///
/// Ends when the sink reports the end of the stream or `cancel` fires. A peer that fails to
/// accept a sample doesn't affect the others.
pub fn spawn_forwarder(
    kind: SinkKind,
    mut sink: Box<dyn SampleSink>,
    peers: Arc<Vec<ActivePeer>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let runtime = Handle::current();

    spawn_blocking(move || {
        let mut forwarded = 0usize;

        while !cancel.is_cancelled() {
            let Some(sample) = sink.pull() else {
                debug!("[Stream]: {kind} sink reached the end of the stream");
                break;
            };

            runtime.block_on(async {
                for active in peers.iter() {
                    if let Err(err) = active.peer.write_sample(kind, &sample).await {
                        warn!(
                            "[Stream]: failed to write {kind} sample to {}: {err}",
                            active.label
                        );
                    }
                }
            });

            forwarded += 1;
        }

        info!(
            "[Stream]: {kind} forwarder stopped after {forwarded} samples to {} peers",
            peers.len()
        );
    })
}
