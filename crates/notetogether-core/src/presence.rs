//! Ephemeral presence (awareness) shared between the sessions of a document.
//!
//! Each participant owns one entry in the awareness set, keyed by its
//! relay-assigned client id and versioned by a per-client clock. Entries
//! are never persisted; the relay drops an entry when its session leaves.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Relay-assigned participant id
pub type ClientId = u64;

/// Recommended minimum interval between pointer broadcasts
pub const DEFAULT_POINTER_THROTTLE: Duration = Duration::from_millis(40);

/// Input device behind a pointer position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerKind {
    Mouse,
    Touch,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pointer {
    pub x: f64,
    pub y: f64,
    #[serde(rename = "type")]
    pub kind: PointerKind,
}

/// The `user` field of a presence state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub name: String,
    pub color: String,
    /// Text position of the caret, `None` when unfocused
    #[serde(default)]
    pub cursor: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer: Option<Pointer>,
}

/// Typed view of one participant's awareness state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub user: PresenceUser,
}

impl PresenceState {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            user: PresenceUser {
                name: name.into(),
                color: color.into(),
                cursor: None,
                pointer: None,
            },
        }
    }

    /// Fresh identity with a random short name and pastel color
    pub fn random(existing_names: &[String], existing_colors: &[String]) -> Self {
        Self::new(
            random_user_name(existing_names),
            random_color(existing_colors),
        )
    }

    pub fn with_cursor(mut self, cursor: Option<u32>) -> Self {
        self.user.cursor = cursor;
        self
    }

    pub fn with_pointer(mut self, pointer: Option<Pointer>) -> Self {
        self.user.pointer = pointer;
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// One versioned entry on the wire; `state: None` removes the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    pub clock: u64,
    pub state: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn single(entry: AwarenessEntry) -> Self {
        Self {
            entries: vec![entry],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What changed after an update was applied
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// A peer other than the local participant
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePeer {
    pub client_id: ClientId,
    pub state: Value,
}

impl RemotePeer {
    pub fn presence(&self) -> Option<PresenceState> {
        PresenceState::from_value(&self.state)
    }
}

type ChangeObserver = Box<dyn Fn(&AwarenessChange) + Send + Sync>;

/// The shared awareness map as seen from one participant.
///
/// The relay keeps one with a local id that no session uses, so the same
/// type serves both sides of the connection.
pub struct AwarenessSet {
    local_client_id: ClientId,
    states: HashMap<ClientId, Value>,
    clocks: HashMap<ClientId, u64>,
    observers: Vec<ChangeObserver>,
}

impl AwarenessSet {
    pub fn new(local_client_id: ClientId) -> Self {
        Self {
            local_client_id,
            states: HashMap::new(),
            clocks: HashMap::new(),
            observers: Vec::new(),
        }
    }

    pub fn local_client_id(&self) -> ClientId {
        self.local_client_id
    }

    /// Register a change-notification callback
    pub fn on_change<F>(&mut self, observer: F)
    where
        F: Fn(&AwarenessChange) + Send + Sync + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    /// Set or clear the local participant's state
    pub fn set_local_state(&mut self, state: Option<Value>) -> AwarenessEntry {
        self.set_state(self.local_client_id, state)
    }

    pub fn local_state(&self) -> Option<&Value> {
        self.states.get(&self.local_client_id)
    }

    /// Set or clear the state of `client_id`, bumping its clock
    pub fn set_state(&mut self, client_id: ClientId, state: Option<Value>) -> AwarenessEntry {
        let clock = self.clocks.get(&client_id).map_or(0, |c| c + 1);
        self.clocks.insert(client_id, clock);

        let mut change = AwarenessChange::default();
        match &state {
            Some(value) => {
                if self.states.insert(client_id, value.clone()).is_some() {
                    change.updated.push(client_id);
                } else {
                    change.added.push(client_id);
                }
            }
            None => {
                if self.states.remove(&client_id).is_some() {
                    change.removed.push(client_id);
                }
            }
        }
        self.notify(&change);

        AwarenessEntry {
            client_id,
            clock,
            state,
        }
    }

    /// Merge entries received from the relay.
    ///
    /// An entry wins when its clock is newer than the one on record, or when
    /// it removes a client at the same clock. Entries for the local client
    /// are ignored; only this participant decides its own state.
    pub fn apply_update(&mut self, update: &AwarenessUpdate) -> AwarenessChange {
        let mut change = AwarenessChange::default();

        for entry in &update.entries {
            if entry.client_id == self.local_client_id {
                continue;
            }
            let known = self.clocks.get(&entry.client_id).copied();
            let newer = known.map_or(true, |clock| entry.clock > clock);
            let same_clock_removal = known == Some(entry.clock)
                && entry.state.is_none()
                && self.states.contains_key(&entry.client_id);
            if !newer && !same_clock_removal {
                continue;
            }

            self.clocks.insert(entry.client_id, entry.clock);
            match &entry.state {
                Some(value) => match self.states.insert(entry.client_id, value.clone()) {
                    Some(previous) if previous == *value => {}
                    Some(_) => change.updated.push(entry.client_id),
                    None => change.added.push(entry.client_id),
                },
                None => {
                    if self.states.remove(&entry.client_id).is_some() {
                        change.removed.push(entry.client_id);
                    }
                }
            }
        }

        self.notify(&change);
        change
    }

    /// Drop a departed client; returns the removal entry to broadcast
    pub fn remove(&mut self, client_id: ClientId) -> Option<AwarenessEntry> {
        self.states.remove(&client_id)?;
        let clock = self.clocks.get(&client_id).map_or(0, |c| c + 1);
        self.clocks.insert(client_id, clock);

        self.notify(&AwarenessChange {
            removed: vec![client_id],
            ..AwarenessChange::default()
        });

        Some(AwarenessEntry {
            client_id,
            clock,
            state: None,
        })
    }

    /// Every known state, the local one included
    pub fn states(&self) -> &HashMap<ClientId, Value> {
        &self.states
    }

    /// Every known state except the local participant's, ordered by id
    pub fn remote_peers(&self) -> Vec<RemotePeer> {
        let mut peers: Vec<RemotePeer> = self
            .states
            .iter()
            .filter(|(client_id, _)| **client_id != self.local_client_id)
            .map(|(client_id, state)| RemotePeer {
                client_id: *client_id,
                state: state.clone(),
            })
            .collect();
        peers.sort_by_key(|peer| peer.client_id);
        peers
    }

    /// Full set as a single update, used to bring a newcomer up to date
    pub fn encode_all(&self) -> AwarenessUpdate {
        let mut entries: Vec<AwarenessEntry> = self
            .states
            .iter()
            .map(|(client_id, state)| AwarenessEntry {
                client_id: *client_id,
                clock: self.clocks.get(client_id).copied().unwrap_or(0),
                state: Some(state.clone()),
            })
            .collect();
        entries.sort_by_key(|entry| entry.client_id);
        AwarenessUpdate { entries }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn notify(&self, change: &AwarenessChange) {
        if change.is_empty() {
            return;
        }
        for observer in &self.observers {
            observer(change);
        }
    }
}

impl std::fmt::Debug for AwarenessSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwarenessSet")
            .field("local_client_id", &self.local_client_id)
            .field("states", &self.states)
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Sender-side rate limiter for pointer updates
#[derive(Debug, Clone)]
pub struct PointerThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
}

impl PointerThrottle {
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_POINTER_THROTTLE)
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
        }
    }

    /// Whether a pointer update may go out now; records the send if so
    pub fn should_send(&mut self) -> bool {
        self.should_send_at(Instant::now())
    }

    pub fn should_send_at(&mut self, now: Instant) -> bool {
        match self.last_sent {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }

    /// Allow the next update through regardless of timing
    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}

impl Default for PointerThrottle {
    fn default() -> Self {
        Self::new()
    }
}

/// Random light color formatted as `rgb(r, g, b)`
pub fn random_pastel_color() -> String {
    let mut rng = rand::thread_rng();
    let r: u8 = rng.gen_range(127..=254);
    let g: u8 = rng.gen_range(127..=254);
    let b: u8 = rng.gen_range(127..=254);
    format!("rgb({}, {}, {})", r, g, b)
}

/// Pastel color not already taken by another participant
pub fn random_color(existing: &[String]) -> String {
    loop {
        let color = random_pastel_color();
        if !existing.contains(&color) {
            return color;
        }
    }
}

/// Five hex digit display name not already taken
pub fn random_user_name(existing: &[String]) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let name = format!("{:05x}", rng.gen_range(0..0x10_0000u32));
        if !existing.contains(&name) {
            return name;
        }
    }
}
