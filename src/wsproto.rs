use anyhow::Result;
use base64::Engine;
use serde::{Deserialize, Serialize};

pub const WS_MAX_MESSAGE_BYTES: usize = 8 * 1024 * 1024;

pub const DEFAULT_ROOM: &str = "public";
pub const DEFAULT_NAME: &str = "Anonymous";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
}

/// Negotiation payload carried inside a `signal` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer {
        sdp: String,
        #[serde(default, with = "salt_bytes", skip_serializing_if = "Option::is_none")]
        salt: Option<Vec<u8>>,
    },
    Answer {
        sdp: String,
        #[serde(default, with = "salt_bytes", skip_serializing_if = "Option::is_none")]
        salt: Option<Vec<u8>>,
    },
    Ice {
        candidate: String,
    },
}

/// Text messages exchanged with the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    Hello {
        id: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        room: Option<String>,
    },
    /// The payload stays opaque so the server can forward it untouched.
    Signal {
        #[serde(default)]
        to: String,
        from: String,
        payload: serde_json::Value,
    },
    TransferOffer {
        #[serde(default)]
        to: String,
        from: String,
        #[serde(default)]
        files: Vec<FileMeta>,
        #[serde(rename = "senderName", default)]
        sender_name: Option<String>,
        #[serde(default, with = "salt_bytes", skip_serializing_if = "Option::is_none")]
        salt: Option<Vec<u8>>,
    },
    TransferResponse {
        #[serde(default)]
        to: String,
        from: String,
        accepted: bool,
    },
    RelayChunk {
        #[serde(default)]
        to: String,
        from: String,
        #[serde(rename = "fileMeta", default, skip_serializing_if = "Option::is_none")]
        file_meta: Option<FileMeta>,
        #[serde(default)]
        done: bool,
    },
    Peers {
        peers: Vec<PeerInfo>,
    },
}

impl SignalPayload {
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

impl SignalMessage {
    pub fn signal(to: &str, from: &str, payload: &SignalPayload) -> Result<Self> {
        Ok(SignalMessage::Signal {
            to: to.to_string(),
            from: from.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Hello { .. } => "hello",
            SignalMessage::Signal { .. } => "signal",
            SignalMessage::TransferOffer { .. } => "transfer-offer",
            SignalMessage::TransferResponse { .. } => "transfer-response",
            SignalMessage::RelayChunk { .. } => "relay-chunk",
            SignalMessage::Peers { .. } => "peers",
        }
    }

    /// Destination peer id for messages routed by id.
    pub fn destination(&self) -> Option<&str> {
        match self {
            SignalMessage::Signal { to, .. }
            | SignalMessage::TransferOffer { to, .. }
            | SignalMessage::TransferResponse { to, .. }
            | SignalMessage::RelayChunk { to, .. } => Some(to.as_str()),
            SignalMessage::Hello { .. } | SignalMessage::Peers { .. } => None,
        }
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Text messages on an open direct channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChannelMessage {
    Handshake { session: String, from: String },
    FileMeta { meta: FileMeta },
    Eof,
}

impl ChannelMessage {
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

pub fn decode_text(raw: &str) -> Result<SignalMessage> {
    Ok(serde_json::from_str(raw)?)
}

pub fn decode_channel_text(raw: &str) -> Result<ChannelMessage> {
    Ok(serde_json::from_str(raw)?)
}

/// Salt goes out as a JSON array of byte values and is accepted either as
/// such an array or as a base64 string.
mod salt_bytes {
    use super::*;

    pub fn serialize<S>(
        value: &Option<Vec<u8>>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        value.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<u8>>, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let opt = Option::<serde_json::Value>::deserialize(deserializer)?;
        match opt {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(s)) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(s.as_bytes())
                    .map_err(serde::de::Error::custom)?;
                Ok(Some(bytes))
            }
            Some(serde_json::Value::Array(arr)) => {
                let mut out = Vec::with_capacity(arr.len());
                for v in arr {
                    let n = v
                        .as_u64()
                        .filter(|n| *n <= u8::MAX as u64)
                        .ok_or_else(|| serde::de::Error::custom("expected byte"))?;
                    out.push(n as u8);
                }
                Ok(Some(out))
            }
            _ => Err(serde::de::Error::custom(
                "expected base64 string or array for salt",
            )),
        }
    }
}
