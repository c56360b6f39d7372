use std::sync::Arc;

use async_trait::async_trait;
use common::{
    api_bindings::{RtcIceCandidate, RtcSdpType, RtcSessionDescription},
    config::{WebRtcConfig, WebRtcNat1To1IceCandidateType, WebRtcNetworkType},
};
use futures::future::BoxFuture;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::spawn;
use webrtc::{
    api::{
        API, APIBuilder,
        interceptor_registry::register_default_interceptors,
        media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MediaEngine},
        setting_engine::SettingEngine,
    },
    ice::{
        network_type::NetworkType,
        udp_network::{EphemeralUDP, UDPNetwork},
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_candidate_type::RTCIceCandidateType,
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    media::Sample,
    peer_connection::{
        RTCPeerConnection, configuration::RTCConfiguration,
        peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription,
    },
    rtp_transceiver::{
        RTCRtpTransceiverInit, rtp_codec::RTCRtpCodecCapability, rtp_sender::RTCRtpSender,
        rtp_transceiver_direction::RTCRtpTransceiverDirection,
    },
    track::track_local::{TrackLocal, track_local_static_sample::TrackLocalStaticSample},
};

use crate::pipeline::{MediaSample, SinkKind};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("expected an answer but received an {0:?}")]
    UnexpectedDescription(RtcSdpType),
    #[error("the peer connection is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateEvent {
    Candidate(RtcIceCandidate),
    GatheringComplete,
}

pub type CandidateHandler = Arc<dyn Fn(CandidateEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// The server side of one viewer's media connection.
#[async_trait]
pub trait StreamPeer: Send + Sync {
    fn is_closed(&self) -> bool;

    /// Replaces the handler receiving locally gathered candidates.
    fn on_candidate(&self, handler: CandidateHandler);

    /// Creates an offer and applies it as the local description, which starts gathering.
    async fn create_offer(&self) -> Result<String, PeerError>;

    async fn apply_answer(&self, answer: RtcSessionDescription) -> Result<(), PeerError>;

    async fn add_remote_candidate(&self, candidate: RtcIceCandidate) -> Result<(), PeerError>;

    async fn write_sample(&self, kind: SinkKind, sample: &MediaSample) -> Result<(), PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, user_id: &str) -> Result<Arc<dyn StreamPeer>, PeerError>;
}

// -- WebRTC

pub struct WebRtcPeerFactory {
    api: API,
    rtc_config: RTCConfiguration,
}

impl WebRtcPeerFactory {
    pub fn new(config: &WebRtcConfig) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        if let Some(port_range) = &config.port_range {
            match EphemeralUDP::new(port_range.min, port_range.max) {
                Ok(udp_network) => {
                    setting_engine.set_udp_network(UDPNetwork::Ephemeral(udp_network));
                }
                Err(err) => {
                    warn!("[Peer]: invalid port range in config: {err:?}");
                }
            }
        }
        if let Some(mapping) = &config.nat_1to1 {
            let candidate_type = match mapping.ice_candidate_type {
                WebRtcNat1To1IceCandidateType::Host => RTCIceCandidateType::Host,
                WebRtcNat1To1IceCandidateType::Srflx => RTCIceCandidateType::Srflx,
            };
            setting_engine.set_nat_1to1_ips(mapping.ips.clone(), candidate_type);
        }
        setting_engine.set_network_types(
            config
                .network_types
                .iter()
                .copied()
                .map(network_type)
                .collect(),
        );
        setting_engine.set_include_loopback_candidate(config.include_loopback_candidates);

        let network_types: Vec<String> = config
            .network_types
            .iter()
            .map(|ty| ty.to_string())
            .collect();
        info!("[Peer]: gathering candidates on {}", network_types.join(", "));
        for server in &config.ice_servers {
            debug!("[Peer]: using ice server {server}");
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        Ok(Self { api, rtc_config })
    }
}

fn network_type(ty: WebRtcNetworkType) -> NetworkType {
    match ty {
        WebRtcNetworkType::Udp4 => NetworkType::Udp4,
        WebRtcNetworkType::Udp6 => NetworkType::Udp6,
        WebRtcNetworkType::Tcp4 => NetworkType::Tcp4,
        WebRtcNetworkType::Tcp6 => NetworkType::Tcp6,
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(&self, user_id: &str) -> Result<Arc<dyn StreamPeer>, PeerError> {
        let connection = Arc::new(self.api.new_peer_connection(self.rtc_config.clone()).await?);

        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            "video".to_string(),
            format!("shiba-{user_id}"),
        ));
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_string(),
            format!("shiba-{user_id}"),
        ));

        for track in [
            Arc::clone(&video) as Arc<dyn TrackLocal + Send + Sync>,
            Arc::clone(&audio) as Arc<dyn TrackLocal + Send + Sync>,
        ] {
            // Viewers never send media back
            let transceiver = connection
                .add_transceiver_from_track(
                    track,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Sendonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
            drain_rtcp(transceiver.sender().await);
        }

        let user_id = user_id.to_string();
        connection.on_peer_connection_state_change(Box::new({
            let user_id = user_id.clone();
            move |state| {
                debug!("[Peer]: {user_id}: connection state changed to {state}");
                Box::pin(async {})
            }
        }));

        info!("[Peer]: created peer connection for {user_id}");

        Ok(Arc::new(WebRtcPeer {
            user_id,
            connection,
            video,
            audio,
        }))
    }
}

/// Interceptors only run while RTCP is being read
fn drain_rtcp(sender: Arc<RTCRtpSender>) {
    spawn(async move {
        let mut buffer = vec![0u8; 1500];
        while sender.read(&mut buffer).await.is_ok() {}
    });
}

pub struct WebRtcPeer {
    user_id: String,
    connection: Arc<RTCPeerConnection>,
    video: Arc<TrackLocalStaticSample>,
    audio: Arc<TrackLocalStaticSample>,
}

#[async_trait]
impl StreamPeer for WebRtcPeer {
    fn is_closed(&self) -> bool {
        self.connection.connection_state() == RTCPeerConnectionState::Closed
    }

    fn on_candidate(&self, handler: CandidateHandler) {
        let user_id = self.user_id.clone();

        self.connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let handler = handler.clone();
                let user_id = user_id.clone();

                Box::pin(async move {
                    // No candidate marks the end of gathering
                    let Some(candidate) = candidate else {
                        handler(CandidateEvent::GatheringComplete).await;
                        return;
                    };

                    match candidate.to_json() {
                        Ok(init) => {
                            handler(CandidateEvent::Candidate(RtcIceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }))
                            .await;
                        }
                        Err(err) => {
                            warn!("[Peer]: {user_id}: failed to serialize local candidate: {err}");
                        }
                    }
                })
            }));
    }

    async fn create_offer(&self) -> Result<String, PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }

        let offer = self.connection.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.connection.set_local_description(offer).await?;

        Ok(sdp)
    }

    async fn apply_answer(&self, answer: RtcSessionDescription) -> Result<(), PeerError> {
        if answer.ty != RtcSdpType::Answer {
            return Err(PeerError::UnexpectedDescription(answer.ty));
        }

        let description = RTCSessionDescription::answer(answer.sdp)?;
        self.connection.set_remote_description(description).await?;

        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: RtcIceCandidate) -> Result<(), PeerError> {
        self.connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;

        Ok(())
    }

    async fn write_sample(&self, kind: SinkKind, sample: &MediaSample) -> Result<(), PeerError> {
        let track = match kind {
            SinkKind::Video => &self.video,
            SinkKind::Audio => &self.audio,
        };

        track
            .write_sample(&Sample {
                data: sample.data.clone(),
                duration: sample.duration,
                ..Default::default()
            })
            .await?;

        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        if self.is_closed() {
            return Ok(());
        }

        info!("[Peer]: closing peer connection for {}", self.user_id);
        self.connection.close().await?;

        Ok(())
    }
}
