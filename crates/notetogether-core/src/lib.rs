pub mod control;
pub mod document;
pub mod payload;
pub mod presence;
pub mod protocol;
pub mod snapshot;

pub use control::{ControlMessage, StatelessPayload};
pub use document::{DocumentError, SharedDocument, CONTENT_FIELD, META_FIELD, TITLE_FIELD};
pub use presence::{
    AwarenessChange, AwarenessEntry, AwarenessSet, AwarenessUpdate, ClientId, Pointer,
    PointerKind, PointerThrottle, PresenceState, PresenceUser, RemotePeer,
    DEFAULT_POINTER_THROTTLE,
};
pub use payload::{check_state_vector_v1, check_update_v1, PayloadError};
pub use protocol::{Frame, FrameTag, ProtocolError};
pub use snapshot::{normalize_snapshot, SnapshotEncoding, SnapshotError};
