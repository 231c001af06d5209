//! Binary frames exchanged over the relay transport.
//!
//! Wire format:
//! ```text
//! ┌─────────┬──────────────────────────┐
//! │ tag u8  │ payload                  │
//! └─────────┴──────────────────────────┘
//! ```
//! Control messages never use these frames; they travel as text so they
//! stay out of the document history.

use thiserror::Error;

use crate::presence::{AwarenessUpdate, ClientId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameTag {
    /// State vector; the receiver answers with a `SyncStep2`
    SyncStep1 = 0,
    /// Update holding everything the step 1 sender was missing
    SyncStep2 = 1,
    /// Incremental update delta
    Update = 2,
    /// JSON awareness update
    Awareness = 3,
    /// Relay-assigned client id, big-endian u64
    Hello = 4,
}

impl TryFrom<u8> for FrameTag {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameTag::SyncStep1),
            1 => Ok(FrameTag::SyncStep2),
            2 => Ok(FrameTag::Update),
            3 => Ok(FrameTag::Awareness),
            4 => Ok(FrameTag::Hello),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    SyncStep1(Vec<u8>),
    SyncStep2(Vec<u8>),
    Update(Vec<u8>),
    Awareness(AwarenessUpdate),
    Hello(ClientId),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Empty frame")]
    Empty,

    #[error("Unknown frame tag: {0}")]
    UnknownTag(u8),

    #[error("Malformed hello frame ({0} payload bytes)")]
    MalformedHello(usize),

    #[error("Malformed awareness payload: {0}")]
    Awareness(#[from] serde_json::Error),
}

impl Frame {
    pub fn tag(&self) -> FrameTag {
        match self {
            Frame::SyncStep1(_) => FrameTag::SyncStep1,
            Frame::SyncStep2(_) => FrameTag::SyncStep2,
            Frame::Update(_) => FrameTag::Update,
            Frame::Awareness(_) => FrameTag::Awareness,
            Frame::Hello(_) => FrameTag::Hello,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = vec![self.tag() as u8];
        match self {
            Frame::SyncStep1(payload) | Frame::SyncStep2(payload) | Frame::Update(payload) => {
                out.extend_from_slice(payload);
            }
            Frame::Awareness(update) => {
                serde_json::to_writer(&mut out, update)?;
            }
            Frame::Hello(client_id) => {
                out.extend_from_slice(&client_id.to_be_bytes());
            }
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, payload) = bytes.split_first().ok_or(ProtocolError::Empty)?;
        let frame = match FrameTag::try_from(tag)? {
            FrameTag::SyncStep1 => Frame::SyncStep1(payload.to_vec()),
            FrameTag::SyncStep2 => Frame::SyncStep2(payload.to_vec()),
            FrameTag::Update => Frame::Update(payload.to_vec()),
            FrameTag::Awareness => Frame::Awareness(serde_json::from_slice(payload)?),
            FrameTag::Hello => {
                let id: [u8; 8] = payload
                    .try_into()
                    .map_err(|_| ProtocolError::MalformedHello(payload.len()))?;
                Frame::Hello(u64::from_be_bytes(id))
            }
        };
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::AwarenessEntry;
    use serde_json::json;

    #[test]
    fn test_update_frame_layout() {
        let encoded = Frame::Update(vec![9, 8, 7]).encode().unwrap();
        assert_eq!(encoded, vec![2, 9, 8, 7]);
        assert_eq!(Frame::decode(&encoded).unwrap(), Frame::Update(vec![9, 8, 7]));
    }

    #[test]
    fn test_awareness_frame_carries_json() {
        let update = AwarenessUpdate::single(AwarenessEntry {
            client_id: 3,
            clock: 1,
            state: Some(json!({"user": {"name": "a", "color": "b"}})),
        });
        let encoded = Frame::Awareness(update.clone()).encode().unwrap();
        assert_eq!(encoded[0], FrameTag::Awareness as u8);
        let text = std::str::from_utf8(&encoded[1..]).unwrap();
        assert!(text.contains("\"clientId\":3"));
        assert_eq!(Frame::decode(&encoded).unwrap(), Frame::Awareness(update));
    }

    #[test]
    fn test_hello_frame() {
        let encoded = Frame::Hello(42).encode().unwrap();
        assert_eq!(encoded.len(), 9);
        assert_eq!(Frame::decode(&encoded).unwrap(), Frame::Hello(42));
        assert!(matches!(
            Frame::decode(&[4, 1, 2]),
            Err(ProtocolError::MalformedHello(2))
        ));
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(Frame::decode(&[]), Err(ProtocolError::Empty)));
        assert!(matches!(
            Frame::decode(&[200, 1]),
            Err(ProtocolError::UnknownTag(200))
        ));
        assert!(matches!(
            Frame::decode(&[3, b'{']),
            Err(ProtocolError::Awareness(_))
        ));
    }
}
