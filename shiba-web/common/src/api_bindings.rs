use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use ts_rs::TS;

const EXPORT_PATH: &str = "../../web-server/web/api_bindings.ts";

// -- Http

#[derive(Serialize, Deserialize, Debug, TS, Clone)]
#[ts(export, export_to = EXPORT_PATH)]
pub struct StartStreamQuery {
    pub cid: String,
}

#[derive(Serialize, Deserialize, Debug, TS, Clone, PartialEq, Eq)]
#[ts(export, export_to = EXPORT_PATH)]
pub struct StartStreamResponse {
    pub status: String,
}

impl StartStreamResponse {
    pub fn started() -> Self {
        Self {
            status: "started".to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, TS, Clone)]
#[ts(export, export_to = EXPORT_PATH)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize, Deserialize, Debug, TS, Clone, Default)]
#[ts(export, export_to = EXPORT_PATH)]
pub struct ChatSocketQuery {
    /// The room the client currently shows, only used for logging
    pub cid: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, TS, Clone)]
#[ts(export, export_to = EXPORT_PATH)]
pub struct HealthResponse {
    pub status: String,
}

// -- Chat

#[derive(Serialize, Deserialize, Debug, TS, Clone, PartialEq, Eq)]
#[ts(export, export_to = EXPORT_PATH)]
pub struct ChatMessagePayload {
    pub id: String,
    pub sender_name: String,
    pub content: String,
    pub created_at: String,
}

// -- WebRTC

#[derive(Serialize, Deserialize, Debug, TS, Clone, Copy, PartialEq, Eq)]
#[ts(export, export_to = EXPORT_PATH)]
#[serde(rename_all = "lowercase")]
pub enum RtcSdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Serialize, Deserialize, Debug, Clone, TS, PartialEq, Eq)]
#[ts(export, export_to = EXPORT_PATH)]
pub struct RtcSessionDescription {
    #[serde(rename = "type")]
    pub ty: RtcSdpType,
    pub sdp: String,
}

/// Same shape as the browsers `RTCIceCandidateInit`
#[derive(Serialize, Deserialize, Debug, Clone, TS, PartialEq, Eq)]
#[ts(export, export_to = EXPORT_PATH)]
#[serde(rename_all = "camelCase")]
pub struct RtcIceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, TS, Clone, Default)]
#[ts(export, export_to = EXPORT_PATH)]
pub struct RtcIceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl Display for RtcIceServer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "urls=[{}], username=\"{}\", credential=\"{}\"",
            self.urls.join(", "),
            self.username,
            self.credential,
        )
    }
}
