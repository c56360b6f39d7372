//! The socket envelope and its subject grammar.
//!
//! Every frame on the chat socket is one JSON [Envelope]. The subject has the shape
//! `<namespace>.<verb>.<roomId>[.<userId>]` and is parsed exactly once into a [Subject]
//! before anything is dispatched.

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Sender id used for envelopes produced by the server itself
pub const SERVER_SENDER: &str = "server";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope<P = Value> {
    pub sender: String,
    pub subject: String,
    pub payload: P,
}

impl<P> Envelope<P> {
    pub fn new(sender: impl Into<String>, subject: &Subject, payload: P) -> Self {
        Self {
            sender: sender.into(),
            subject: subject.to_string(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Chat,
    WebRtc,
    Stream,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::WebRtc => "webrtc",
            Self::Stream => "stream",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamVerb {
    Offer,
    Answer,
    Ice,
    Disconnected,
    StopStream,
}

impl StreamVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Ice => "ice",
            Self::Disconnected => "disconnected",
            Self::StopStream => "stop-stream",
        }
    }
}

impl FromStr for StreamVerb {
    type Err = SubjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offer" => Ok(Self::Offer),
            "answer" => Ok(Self::Answer),
            "ice" => Ok(Self::Ice),
            "disconnected" => Ok(Self::Disconnected),
            "stop-stream" => Ok(Self::StopStream),
            other => Err(SubjectError::UnknownVerb(other.to_string())),
        }
    }
}

/// Key of the dispatch table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Chat,
    /// Client to client negotiation, the verb is opaque to the server
    WebRtc,
    Stream(StreamVerb),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubjectError {
    #[error("unknown subject namespace \"{0}\"")]
    UnknownNamespace(String),
    #[error("subject \"{subject}\" has {found} segments, expected {expected}")]
    SegmentCount {
        subject: String,
        found: usize,
        expected: &'static str,
    },
    #[error("subject \"{0}\" contains an empty segment")]
    EmptySegment(String),
    #[error("unknown stream verb \"{0}\"")]
    UnknownVerb(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub namespace: Namespace,
    /// Absent for chat subjects
    pub verb: Option<String>,
    pub room_id: String,
    pub user_id: Option<String>,
}

impl Subject {
    pub fn chat(room_id: impl Into<String>) -> Self {
        Self {
            namespace: Namespace::Chat,
            verb: None,
            room_id: room_id.into(),
            user_id: None,
        }
    }

    pub fn stream(verb: StreamVerb, room_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            namespace: Namespace::Stream,
            verb: Some(verb.as_str().to_string()),
            room_id: room_id.into(),
            user_id: Some(user_id.into()),
        }
    }

    pub fn route(&self) -> Result<Route, SubjectError> {
        match self.namespace {
            Namespace::Chat => Ok(Route::Chat),
            Namespace::WebRtc => Ok(Route::WebRtc),
            Namespace::Stream => {
                let verb = self.verb.as_deref().unwrap_or_default();
                Ok(Route::Stream(verb.parse()?))
            }
        }
    }

    /// Pub/sub topic this subject is relayed to, if the namespace is relayed at all
    pub fn relay_topic(&self) -> Option<String> {
        match (self.namespace, &self.verb) {
            (Namespace::Chat, _) => Some(chat_topic(&self.room_id)),
            (Namespace::WebRtc, Some(verb)) => Some(webrtc_topic(verb, &self.room_id)),
            _ => None,
        }
    }
}

impl FromStr for Subject {
    type Err = SubjectError;

    fn from_str(subject: &str) -> Result<Self, Self::Err> {
        let segments = subject.split('.').collect::<Vec<_>>();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(SubjectError::EmptySegment(subject.to_string()));
        }

        let segment_error = |expected| SubjectError::SegmentCount {
            subject: subject.to_string(),
            found: segments.len(),
            expected,
        };

        match segments[0] {
            "chat" => match segments.as_slice() {
                [_, room_id] => Ok(Self::chat(*room_id)),
                _ => Err(segment_error("2")),
            },
            "webrtc" => match segments.as_slice() {
                [_, verb, room_id] => Ok(Self {
                    namespace: Namespace::WebRtc,
                    verb: Some(verb.to_string()),
                    room_id: room_id.to_string(),
                    user_id: None,
                }),
                _ => Err(segment_error("3")),
            },
            "stream" => {
                let (verb, room_id, user_id) = match segments.as_slice() {
                    [_, verb, room_id] => (*verb, *room_id, None),
                    [_, verb, room_id, user_id] => (*verb, *room_id, Some(user_id.to_string())),
                    _ => return Err(segment_error("3 or 4")),
                };
                let verb = verb.parse::<StreamVerb>()?;

                Ok(Self {
                    namespace: Namespace::Stream,
                    verb: Some(verb.as_str().to_string()),
                    room_id: room_id.to_string(),
                    user_id,
                })
            }
            other => Err(SubjectError::UnknownNamespace(other.to_string())),
        }
    }
}

impl Display for Subject {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.namespace.as_str())?;
        if let Some(verb) = &self.verb {
            write!(f, ".{verb}")?;
        }
        write!(f, ".{}", self.room_id)?;
        if let Some(user_id) = &self.user_id {
            write!(f, ".{user_id}")?;
        }
        Ok(())
    }
}

// -- Pub/Sub topics

pub fn chat_topic(room_id: &str) -> String {
    format!("chatrooms.{room_id}")
}

pub fn webrtc_topic(verb: &str, room_id: &str) -> String {
    format!("webrtc.{verb}.{room_id}")
}

/// Subscription pattern matching every [webrtc_topic] of a room
pub fn webrtc_pattern(room_id: &str) -> String {
    format!("webrtc.*.{room_id}")
}
