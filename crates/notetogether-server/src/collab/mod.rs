pub mod bridge;
pub mod document;
pub mod relay;
mod websocket;

pub use bridge::{ControlOutcome, PersistenceBridge};
pub use document::{DocumentHandle, DocumentRegistry, RelayEvent};
pub use relay::{Relay, Session, SessionEvent, SessionStatus};
pub use websocket::router;
