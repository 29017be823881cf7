use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

/// Subprotocol every client must negotiate during the handshake
pub const CHAT_SUBPROTOCOL: &str = "chat";

/// Frame type a payload is sent in. Relayed chat bodies keep the type
/// they arrived in; everything else is text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameKind {
    #[default]
    Text,
    Binary,
}

/// Server -> Client payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// A chat line or membership notice
    Message(String),
    /// Full roster replacement
    Nicks(Vec<String>),
}

impl Payload {
    /// Wrap an inbound chat body verbatim
    pub fn message(text: impl Into<String>) -> Self {
        Payload::Message(text.into())
    }

    pub fn roster(nicknames: Vec<String>) -> Self {
        Payload::Nicks(nicknames)
    }

    pub fn joined(nickname: &str) -> Self {
        Payload::Message(format!("{} joined", nickname))
    }

    pub fn left(nickname: &str) -> Self {
        Payload::Message(format!("{} has left the chat", nickname))
    }

    /// Encode once into a text frame that can be cloned cheaply per recipient
    pub fn to_frame(&self) -> Result<Message, serde_json::Error> {
        self.to_frame_as(FrameKind::Text)
    }

    pub fn to_frame_as(&self, kind: FrameKind) -> Result<Message, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        Ok(match kind {
            FrameKind::Text => Message::text(json),
            FrameKind::Binary => Message::binary(json.into_bytes()),
        })
    }
}
