use serde::{Deserialize, Serialize};

/// Raw stateless payload as delivered by the transport
#[derive(Debug, Clone, Copy)]
pub enum StatelessPayload<'a> {
    Text(&'a str),
    Bytes(&'a [u8]),
}

impl<'a> From<&'a str> for StatelessPayload<'a> {
    fn from(text: &'a str) -> Self {
        StatelessPayload::Text(text)
    }
}

impl<'a> From<&'a [u8]> for StatelessPayload<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        StatelessPayload::Bytes(bytes)
    }
}

/// Out-of-band command exchanged beside the CRDT deltas.
///
/// Serialized as `{"type": "SAVE" | "DELETE" | "DELETED", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ControlMessage {
    /// Client asks the server to persist the current state
    Save {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    /// Client asks the server to delete the document and evict every session
    Delete,
    /// Server tells every session the document is gone
    Deleted,
}

impl ControlMessage {
    pub fn save() -> Self {
        ControlMessage::Save { title: None }
    }

    pub fn save_with_title(title: impl Into<String>) -> Self {
        ControlMessage::Save {
            title: Some(title.into()),
        }
    }

    /// Parse a stateless payload.
    ///
    /// Invalid UTF-8, invalid JSON and unknown or missing `type` all yield
    /// `None`; the caller treats that as a no-op.
    pub fn parse<'a>(payload: impl Into<StatelessPayload<'a>>) -> Option<Self> {
        let text = match payload.into() {
            StatelessPayload::Text(text) => text,
            StatelessPayload::Bytes(bytes) => std::str::from_utf8(bytes).ok()?,
        };
        serde_json::from_str(text).ok()
    }

    /// Wire form of this message
    pub fn to_json(&self) -> String {
        // Serializing a plain tagged enum of strings cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }

    /// Commands a client may send; `DELETED` only travels server to client
    pub fn is_client_command(&self) -> bool {
        !matches!(self, ControlMessage::Deleted)
    }
}
