//! Relay integration tests: several in-process sessions attached to the same
//! documents, backed by in-memory and instrumented storages.

use async_trait::async_trait;
use futures::future::join_all;
use notetogether_core::{
    AwarenessSet, ControlMessage, PresenceState, SharedDocument, StatelessPayload,
};
use notetogether_server::collab::{
    ControlOutcome, DocumentRegistry, PersistenceBridge, Relay, Session, SessionEvent,
    SessionStatus,
};
use notetogether_server::db::models::{DocumentRow, DocumentSnapshot, DocumentSummary};
use notetogether_server::error::AppError;
use notetogether_server::storage::{DocumentStorage, MemoryStorage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

/// Memory storage that counts loads and makes them slow enough to overlap
struct CountingStorage {
    inner: MemoryStorage,
    selects: AtomicUsize,
    upserts: AtomicUsize,
    load_delay: Duration,
}

impl CountingStorage {
    fn new(load_delay: Duration) -> Self {
        Self {
            inner: MemoryStorage::new(),
            selects: AtomicUsize::new(0),
            upserts: AtomicUsize::new(0),
            load_delay,
        }
    }
}

#[async_trait]
impl DocumentStorage for CountingStorage {
    async fn select(&self, id: Uuid) -> Result<Option<DocumentRow>, AppError> {
        self.selects.fetch_add(1, Ordering::SeqCst);
        sleep(self.load_delay).await;
        self.inner.select(id).await
    }

    async fn upsert(&self, snapshot: &DocumentSnapshot) -> Result<(), AppError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.inner.upsert(snapshot).await
    }

    async fn delete(&self, id: Uuid) -> Result<(), AppError> {
        self.inner.delete(id).await
    }

    async fn create(&self, id: Uuid) -> Result<DocumentRow, AppError> {
        self.inner.create(id).await
    }

    async fn titles(&self, ids: &[Uuid]) -> Result<Vec<DocumentSummary>, AppError> {
        self.inner.titles(ids).await
    }
}

/// Storage whose backend is down
struct UnavailableStorage;

#[async_trait]
impl DocumentStorage for UnavailableStorage {
    async fn select(&self, _id: Uuid) -> Result<Option<DocumentRow>, AppError> {
        Err(AppError::Unavailable("connection refused".into()))
    }

    async fn upsert(&self, _snapshot: &DocumentSnapshot) -> Result<(), AppError> {
        Err(AppError::Unavailable("connection refused".into()))
    }

    async fn delete(&self, _id: Uuid) -> Result<(), AppError> {
        Err(AppError::Unavailable("connection refused".into()))
    }

    async fn create(&self, _id: Uuid) -> Result<DocumentRow, AppError> {
        Err(AppError::Unavailable("connection refused".into()))
    }

    async fn titles(&self, _ids: &[Uuid]) -> Result<Vec<DocumentSummary>, AppError> {
        Err(AppError::Unavailable("connection refused".into()))
    }
}

async fn next(session: &mut Session) -> SessionEvent {
    timeout(Duration::from_secs(2), session.next_event())
        .await
        .expect("timed out waiting for relay event")
        .expect("session closed")
}

async fn assert_quiet(session: &mut Session) {
    let event = timeout(Duration::from_millis(100), session.next_event()).await;
    assert!(event.is_err(), "unexpected event: {:?}", event);
}

/// Update whose delete set claims ~2^32 ranges in eleven bytes
const FORGED_UPDATE: [u8; 11] = [0, 86, 78, 164, 145, 146, 142, 73, 213, 8, 178];

fn is_deleted_notice(event: &SessionEvent) -> bool {
    matches!(
        event,
        SessionEvent::Stateless(payload)
            if ControlMessage::parse(&**payload) == Some(ControlMessage::Deleted)
    )
}

/// Local edit on a client replica, returned as the delta to send
fn edit(client: &SharedDocument, text: &str) -> Vec<u8> {
    let before = client.state_vector();
    client.append_paragraph(text);
    client.encode_diff(&before).unwrap()
}

#[tokio::test]
async fn test_concurrent_connects_load_once() {
    let storage = Arc::new(CountingStorage::new(Duration::from_millis(50)));
    let id = Uuid::new_v4();

    let source = SharedDocument::with_client_id(99);
    source.set_title("Shared");
    source.append_paragraph("stored paragraph");
    let mut row = DocumentRow::empty(id);
    row.binary_state = Some(source.encode_state());
    storage.inner.insert_row(row).await;

    let relay = Relay::with_storage(storage.clone());
    let sessions = join_all((0..8).map(|_| {
        let relay = relay.clone();
        async move { relay.connect(id).await }
    }))
    .await;

    assert_eq!(storage.selects.load(Ordering::SeqCst), 1);
    for mut session in sessions {
        assert_eq!(session.status(), SessionStatus::Connected);
        let client = SharedDocument::new();
        client.apply_update(&session.initial_state().await).unwrap();
        assert_eq!(client.title(), "Shared");
        assert_eq!(client.content(), source.content());
        assert_eq!(session.status(), SessionStatus::Synced);
        session.disconnect().await;
    }
}

#[tokio::test]
async fn test_spawned_connects_load_once() {
    let storage = Arc::new(CountingStorage::new(Duration::from_millis(20)));
    let relay = Relay::with_storage(storage.clone());
    let id = Uuid::new_v4();

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let relay = relay.clone();
            tokio::spawn(async move { relay.connect(id).await })
        })
        .collect();
    let mut sessions = Vec::new();
    for task in tasks {
        sessions.push(task.await.unwrap());
    }

    assert_eq!(storage.selects.load(Ordering::SeqCst), 1);
    assert_eq!(relay.registry().count().await, 1);
    for session in sessions {
        session.disconnect().await;
    }
}

#[tokio::test]
async fn test_eviction_then_reconnect_loads_again() {
    let storage = Arc::new(CountingStorage::new(Duration::ZERO));
    let relay = Relay::with_storage(storage.clone());
    let id = Uuid::new_v4();

    relay.connect(id).await.disconnect().await;
    assert_eq!(relay.registry().count().await, 0);

    relay.connect(id).await.disconnect().await;
    assert_eq!(storage.selects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_updates_relay_to_other_sessions_only() {
    let relay = Relay::with_storage(Arc::new(MemoryStorage::new()));
    let id = Uuid::new_v4();
    let mut alice = relay.connect(id).await;
    let mut bob = relay.connect(id).await;

    let alice_doc = SharedDocument::with_client_id(1);
    alice.apply_update(&edit(&alice_doc, "hello from alice")).await.unwrap();

    let bob_doc = SharedDocument::with_client_id(2);
    match next(&mut bob).await {
        SessionEvent::Update(update) => bob_doc.apply_update(&update).unwrap(),
        other => panic!("expected update, got {:?}", other),
    }
    assert_eq!(bob_doc.content(), alice_doc.content());
    assert_quiet(&mut alice).await;

    alice.disconnect().await;
    bob.disconnect().await;
}

#[tokio::test]
async fn test_malformed_update_is_rejected_and_not_relayed() {
    let relay = Relay::with_storage(Arc::new(MemoryStorage::new()));
    let id = Uuid::new_v4();
    let alice = relay.connect(id).await;
    let mut bob = relay.connect(id).await;

    assert!(alice.apply_update(&[0xFF, 0xFF, 0xFF]).await.is_err());
    assert_quiet(&mut bob).await;

    alice.disconnect().await;
    bob.disconnect().await;
}

#[tokio::test]
async fn test_save_round_trip() {
    let storage = Arc::new(MemoryStorage::new());
    let id = Uuid::new_v4();

    let relay = Relay::with_storage(storage.clone());
    let session = relay.connect(id).await;
    let client = SharedDocument::with_client_id(5);
    let before = client.state_vector();
    client.set_title("Quarterly plan");
    client.append_paragraph("ship the relay");
    session
        .apply_update(&client.encode_diff(&before).unwrap())
        .await
        .unwrap();

    let outcome = session.send_command(&ControlMessage::save()).await.unwrap();
    assert!(
        matches!(outcome, ControlOutcome::Saved { ref title, .. } if title == "Quarterly plan")
    );
    session.disconnect().await;

    let row = storage.select(id).await.unwrap().expect("row saved");
    assert_eq!(row.title, "Quarterly plan");

    // A fresh relay over the same storage sees the saved content
    let fresh = Relay::with_storage(storage.clone());
    let mut reopened = fresh.connect(id).await;
    let restored = SharedDocument::new();
    restored
        .apply_update(&reopened.initial_state().await)
        .unwrap();
    assert_eq!(restored.title(), client.title());
    assert_eq!(restored.content(), client.content());
    reopened.disconnect().await;
}

#[tokio::test]
async fn test_save_prefers_document_title_over_message() {
    let storage = Arc::new(MemoryStorage::new());
    let relay = Relay::with_storage(storage.clone());
    let id = Uuid::new_v4();
    let session = relay.connect(id).await;

    let client = SharedDocument::with_client_id(8);
    let before = client.state_vector();
    client.set_title("Edited together");
    session
        .apply_update(&client.encode_diff(&before).unwrap())
        .await
        .unwrap();

    session
        .send_command(&ControlMessage::save_with_title("Stale local title"))
        .await
        .unwrap();
    assert_eq!(
        storage.select(id).await.unwrap().unwrap().title,
        "Edited together"
    );
    session.disconnect().await;
}

#[tokio::test]
async fn test_delete_terminates_all_sessions() {
    let storage = Arc::new(MemoryStorage::new());
    let id = Uuid::new_v4();
    storage.create(id).await.unwrap();

    let relay = Relay::with_storage(storage.clone());
    let mut sessions = vec![
        relay.connect(id).await,
        relay.connect(id).await,
        relay.connect(id).await,
    ];

    let outcome = sessions[1]
        .send_command(&ControlMessage::Delete)
        .await
        .unwrap();
    assert_eq!(outcome, ControlOutcome::Deleted);

    for session in sessions.iter_mut() {
        match next(session).await {
            SessionEvent::Stateless(payload) => {
                assert_eq!(ControlMessage::parse(&*payload), Some(ControlMessage::Deleted));
            }
            other => panic!("expected DELETED, got {:?}", other),
        }
        assert!(matches!(next(session).await, SessionEvent::Terminated));
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert!(session.next_event().await.is_none());
        assert!(session.apply_update(&SharedDocument::new().encode_state()).await.is_err());
    }

    assert!(storage.select(id).await.unwrap().is_none());
    assert!(relay.registry().get(id).await.is_none());
    for session in sessions {
        session.disconnect().await;
    }

    // The id can be opened again as a brand new, empty document
    let mut reopened = relay.connect(id).await;
    let doc = SharedDocument::new();
    doc.apply_update(&reopened.initial_state().await).unwrap();
    assert!(doc.is_empty());
    reopened.disconnect().await;
}

#[tokio::test]
async fn test_malformed_control_message_is_noop() {
    let storage = Arc::new(CountingStorage::new(Duration::ZERO));
    let id = Uuid::new_v4();
    storage.inner.create(id).await.unwrap();
    let relay = Relay::with_storage(storage.clone());
    let session = relay.connect(id).await;
    let mut peer = relay.connect(id).await;

    for payload in ["not json", r#"{"type":"UNKNOWN"}"#, r#"{"type":"DELETED"}"#] {
        let outcome = session
            .send_stateless(StatelessPayload::Text(payload))
            .await
            .unwrap();
        assert_eq!(outcome, ControlOutcome::Ignored);
    }
    let outcome = session
        .send_stateless(StatelessPayload::Bytes(&[0xC3, 0x28]))
        .await
        .unwrap();
    assert_eq!(outcome, ControlOutcome::Ignored);

    assert_eq!(storage.upserts.load(Ordering::SeqCst), 0);
    let row = storage.select(id).await.unwrap().unwrap();
    assert!(row.binary_state.is_none());
    assert_quiet(&mut peer).await;
    assert_eq!(session.status(), SessionStatus::Connected);

    session.disconnect().await;
    peer.disconnect().await;
}

#[tokio::test]
async fn test_unavailable_storage_never_breaks_sessions() {
    let relay = Relay::with_storage(Arc::new(UnavailableStorage));
    let id = Uuid::new_v4();
    let mut alice = relay.connect(id).await;
    let mut bob = relay.connect(id).await;

    // Load failure means a new, empty document
    let doc = SharedDocument::new();
    doc.apply_update(&alice.initial_state().await).unwrap();
    assert!(doc.is_empty());

    let client = SharedDocument::with_client_id(3);
    alice.apply_update(&edit(&client, "kept in memory")).await.unwrap();
    assert!(matches!(next(&mut bob).await, SessionEvent::Update(_)));

    let save = alice.send_command(&ControlMessage::save()).await;
    assert!(matches!(save, Err(AppError::Unavailable(_))));
    let delete = alice.send_command(&ControlMessage::Delete).await;
    assert!(matches!(delete, Err(AppError::Unavailable(_))));

    // Model and sessions are untouched
    let state = bob.initial_state().await;
    let restored = SharedDocument::new();
    restored.apply_update(&state).unwrap();
    assert!(restored.content().contains("kept in memory"));
    alice.apply_update(&edit(&client, "still editing")).await.unwrap();
    assert!(matches!(next(&mut bob).await, SessionEvent::Update(_)));

    alice.disconnect().await;
    bob.disconnect().await;
}

#[tokio::test]
async fn test_awareness_relay_and_exclusion() {
    let relay = Relay::with_storage(Arc::new(MemoryStorage::new()));
    let id = Uuid::new_v4();
    let alice = relay.connect(id).await;
    let mut bob = relay.connect(id).await;

    let mut bob_view = AwarenessSet::new(bob.client_id());
    bob_view.set_local_state(Some(PresenceState::new("bob", "rgb(140, 200, 220)").to_value()));
    bob.set_awareness(bob_view.local_state().cloned()).await.unwrap();

    alice
        .set_awareness(Some(
            PresenceState::new("alice", "rgb(220, 160, 180)")
                .with_cursor(Some(4))
                .to_value(),
        ))
        .await
        .unwrap();

    match next(&mut bob).await {
        SessionEvent::Awareness(update) => {
            bob_view.apply_update(&update);
        }
        other => panic!("expected awareness, got {:?}", other),
    }
    // The relay snapshot echoes bob's own entry; it must stay out of his peers
    bob_view.apply_update(&bob.awareness_snapshot().await);

    assert_eq!(bob_view.states().len(), 2);
    let peers = bob_view.remote_peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].client_id, alice.client_id());
    let presence = peers[0].presence().unwrap();
    assert_eq!(presence.user.name, "alice");
    assert_eq!(presence.user.cursor, Some(4));

    // Departure removes alice's entry everywhere
    let alice_id = alice.client_id();
    alice.disconnect().await;
    match next(&mut bob).await {
        SessionEvent::Awareness(update) => {
            let change = bob_view.apply_update(&update);
            assert_eq!(change.removed, vec![alice_id]);
        }
        other => panic!("expected awareness removal, got {:?}", other),
    }
    assert!(bob_view.remote_peers().is_empty());
    let snapshot = bob.awareness_snapshot().await;
    assert_eq!(snapshot.entries.len(), 1);
    assert_eq!(snapshot.entries[0].client_id, bob.client_id());

    bob.disconnect().await;
}

#[tokio::test]
async fn test_documents_are_isolated() {
    let relay = Relay::with_storage(Arc::new(MemoryStorage::new()));
    let alice = relay.connect(Uuid::new_v4()).await;
    let mut other = relay.connect(Uuid::new_v4()).await;

    let client = SharedDocument::with_client_id(1);
    alice.apply_update(&edit(&client, "private")).await.unwrap();
    assert_quiet(&mut other).await;
    assert_eq!(relay.registry().count().await, 2);

    alice.disconnect().await;
    other.disconnect().await;
}

#[tokio::test]
async fn test_sync_step1_returns_missing_changes() {
    let relay = Relay::with_storage(Arc::new(MemoryStorage::new()));
    let id = Uuid::new_v4();
    let writer = relay.connect(id).await;
    let mut reader = relay.connect(id).await;

    let client = SharedDocument::with_client_id(1);
    writer.apply_update(&edit(&client, "one")).await.unwrap();
    writer.apply_update(&edit(&client, "two")).await.unwrap();

    let replica = SharedDocument::with_client_id(2);
    let diff = reader.sync_step1(&replica.state_vector()).await.unwrap();
    replica.apply_update(&diff).unwrap();
    assert_eq!(replica.content(), client.content());
    assert_eq!(reader.status(), SessionStatus::Synced);
    assert!(reader.sync_step1(&[0xFF, 0xFF, 0xFF]).await.is_err());

    writer.disconnect().await;
    reader.disconnect().await;
}

#[tokio::test]
async fn test_forged_update_is_rejected_and_session_survives() {
    let relay = Relay::with_storage(Arc::new(MemoryStorage::new()));
    let id = Uuid::new_v4();
    let mut alice = relay.connect(id).await;
    let mut bob = relay.connect(id).await;

    assert!(matches!(
        alice.apply_update(&FORGED_UPDATE).await,
        Err(AppError::Document(_))
    ));
    // state vector claiming ~2^32 entries
    assert!(alice
        .sync_step1(&[0xff, 0xff, 0xff, 0xff, 0x0f, 1, 1])
        .await
        .is_err());
    assert_quiet(&mut bob).await;

    let client = SharedDocument::with_client_id(1);
    alice
        .apply_update(&edit(&client, "after the bad frame"))
        .await
        .unwrap();
    assert!(matches!(next(&mut bob).await, SessionEvent::Update(_)));

    alice.disconnect().await;
    bob.disconnect().await;
}

#[tokio::test]
async fn test_forged_stored_row_loads_empty() {
    let storage = Arc::new(MemoryStorage::new());
    let id = Uuid::new_v4();
    let mut row = DocumentRow::empty(id);
    row.binary_state = Some(FORGED_UPDATE.to_vec());
    storage.insert_row(row).await;

    let relay = Relay::with_storage(storage);
    let mut session = relay.connect(id).await;
    let doc = SharedDocument::new();
    doc.apply_update(&session.initial_state().await).unwrap();
    assert!(doc.is_empty());
    session.disconnect().await;
}

#[tokio::test]
async fn test_lagging_session_still_learns_of_delete() {
    let storage = Arc::new(MemoryStorage::new());
    let id = Uuid::new_v4();
    storage.create(id).await.unwrap();
    let relay = Relay::new(
        Arc::new(DocumentRegistry::new(2, true)),
        Arc::new(PersistenceBridge::new(storage.clone())),
    );

    let deleter = relay.connect(id).await;
    let mut slow = relay.connect(id).await;
    let alice = relay.connect(id).await;
    let bob = relay.connect(id).await;
    alice
        .set_awareness(Some(PresenceState::new("alice", "rgb(220, 160, 180)").to_value()))
        .await
        .unwrap();
    bob.set_awareness(Some(PresenceState::new("bob", "rgb(140, 200, 220)").to_value()))
        .await
        .unwrap();

    // Departures after the delete push DELETED and the shutdown out of the
    // two-slot buffer before `slow` reads anything
    deleter.send_command(&ControlMessage::Delete).await.unwrap();
    alice.disconnect().await;
    bob.disconnect().await;

    let mut events = Vec::new();
    loop {
        let event = next(&mut slow).await;
        let done = matches!(event, SessionEvent::Terminated);
        events.push(event);
        if done {
            break;
        }
    }
    assert_eq!(events.iter().filter(|e| is_deleted_notice(e)).count(), 1);
    assert_eq!(slow.status(), SessionStatus::Disconnected);
    assert!(slow.next_event().await.is_none());

    deleter.disconnect().await;
    slow.disconnect().await;
}

#[tokio::test]
async fn test_session_notices_deletion_it_never_received() {
    let relay = Relay::with_storage(Arc::new(MemoryStorage::new()));
    let id = Uuid::new_v4();
    let mut session = relay.connect(id).await;

    // Shut down without a DELETED broadcast, as if the notice was missed
    let handle = relay.registry().get(id).await.unwrap();
    handle.shut_down();

    assert!(is_deleted_notice(&next(&mut session).await));
    assert!(matches!(next(&mut session).await, SessionEvent::Terminated));
    assert!(session.next_event().await.is_none());
    session.disconnect().await;
}
