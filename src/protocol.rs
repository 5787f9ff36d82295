//! Media-stream wire format.
//!
//! Every text frame is a JSON object keyed by `event`. Audio travels in
//! `media` events as base64 µ-law:
//!
//! ```text
//! {"event":"media","media":{"payload":"<base64>"}}
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::CallError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaPayload {
    pub payload: String,
}

/// One wire message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaEnvelope {
    pub event: String,
    #[serde(rename = "streamSid", default, skip_serializing_if = "Option::is_none")]
    pub stream_sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mark: Option<MarkPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

impl MediaEnvelope {
    /// Wrap one compressed frame for sending.
    pub fn media(ulaw: &[u8], stream_sid: Option<String>) -> Self {
        Self {
            event: "media".to_string(),
            stream_sid,
            media: Some(MediaPayload {
                payload: STANDARD.encode(ulaw),
            }),
            mark: None,
        }
    }

    pub fn to_json(&self) -> String {
        // Plain strings and options only, serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decoded audio bytes of a `media` event.
    pub fn audio(&self) -> Result<Vec<u8>, CallError> {
        let media = self
            .media
            .as_ref()
            .ok_or_else(|| CallError::MalformedFrame("media event without payload".into()))?;
        STANDARD
            .decode(media.payload.trim())
            .map_err(|e| CallError::MalformedFrame(format!("bad base64 payload: {}", e)))
    }
}

/// What an inbound text frame turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// µ-law audio, from an envelope or a bare base64 body
    Media(Vec<u8>),
    /// Stream announced; outbound media should carry this id
    Start { stream_sid: Option<String> },
    /// Remote side ended the stream
    Stop,
    /// Drop any audio still queued for playback
    Clear,
    Mark(String),
    Connected,
    /// Any other event name, ignored
    Other(String),
}

/// Parse one inbound text frame.
///
/// Text that is not an envelope is tried as a bare base64 audio body before
/// being rejected.
pub fn parse_inbound(text: &str) -> Result<Inbound, CallError> {
    let envelope = match serde_json::from_str::<MediaEnvelope>(text) {
        Ok(envelope) => envelope,
        Err(json_err) => return parse_bare_payload(text, &json_err),
    };

    let inbound = match envelope.event.as_str() {
        "media" => Inbound::Media(envelope.audio()?),
        "start" => Inbound::Start {
            stream_sid: envelope.stream_sid,
        },
        "stop" => Inbound::Stop,
        "clear" => Inbound::Clear,
        "mark" => Inbound::Mark(envelope.mark.map(|m| m.name).unwrap_or_default()),
        "connected" => Inbound::Connected,
        other => Inbound::Other(other.to_string()),
    };
    Ok(inbound)
}

fn parse_bare_payload(text: &str, json_err: &serde_json::Error) -> Result<Inbound, CallError> {
    let body = text.trim();
    if body.is_empty() {
        return Err(CallError::MalformedFrame("empty text frame".into()));
    }
    STANDARD
        .decode(body)
        .map(Inbound::Media)
        .map_err(|_| CallError::MalformedFrame(format!("neither envelope nor base64: {}", json_err)))
}
