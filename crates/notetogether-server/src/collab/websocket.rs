use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use notetogether_core::{AwarenessUpdate, Frame, StatelessPayload};
use serde_json::Value;
use uuid::Uuid;

use crate::collab::relay::{Session, SessionEvent};
use crate::AppState;

/// WebSocket handler for collaboration
async fn ws_handler(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, document_id))
}

type Sender = SplitSink<WebSocket, Message>;

async fn send_frame(sender: &mut Sender, frame: Frame) -> bool {
    let bytes = match frame.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!("Failed to encode frame: {}", e);
            return true;
        }
    };
    sender.send(Message::Binary(bytes.into())).await.is_ok()
}

async fn handle_socket(socket: WebSocket, state: AppState, document_id: Uuid) {
    let (mut sender, mut receiver) = socket.split();

    // Attach to the document; waits for the initial load
    let mut session = state.relay.connect(document_id).await;
    let client_id = session.client_id();

    // Greet the client, then send the relay state and current presence
    let state_vector = session.state_vector().await;
    let initial_state = session.initial_state().await;
    let awareness = session.awareness_snapshot().await;
    let mut greeting = vec![
        Frame::Hello(client_id),
        Frame::SyncStep1(state_vector),
        Frame::SyncStep2(initial_state),
    ];
    if !awareness.is_empty() {
        greeting.push(Frame::Awareness(awareness));
    }
    for frame in greeting {
        if !send_frame(&mut sender, frame).await {
            tracing::error!("Failed to send initial state to client {}", client_id);
            session.disconnect().await;
            return;
        }
    }

    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let Some(Ok(msg)) = incoming else { break };
                if !handle_message(&mut session, &mut sender, msg).await {
                    break;
                }
            }
            event = session.next_event() => {
                let Some(event) = event else { break };
                if !forward_event(&mut sender, event).await {
                    break;
                }
            }
        }
    }

    session.disconnect().await;
    tracing::debug!("WebSocket connection closed for document {}", document_id);
}

/// Returns false when the connection should close
async fn handle_message(session: &mut Session, sender: &mut Sender, msg: Message) -> bool {
    match msg {
        Message::Binary(data) => match Frame::decode(&data) {
            Ok(Frame::SyncStep1(state_vector)) => match session.sync_step1(&state_vector).await {
                Ok(diff) => send_frame(sender, Frame::SyncStep2(diff)).await,
                Err(e) => {
                    tracing::warn!("Rejected state vector from {}: {}", session.client_id(), e);
                    true
                }
            },
            Ok(Frame::SyncStep2(update)) | Ok(Frame::Update(update)) => {
                if let Err(e) = session.apply_update(&update).await {
                    tracing::error!("Failed to apply update: {}", e);
                }
                true
            }
            Ok(Frame::Awareness(update)) => {
                let Some(state) = claimed_awareness(update) else {
                    return true;
                };
                if let Err(e) = session.set_awareness(state).await {
                    tracing::warn!("Dropped awareness from {}: {}", session.client_id(), e);
                }
                true
            }
            Ok(Frame::Hello(_)) => true,
            Err(e) => {
                tracing::debug!("Ignoring undecodable frame: {}", e);
                true
            }
        },
        Message::Text(text) => {
            if let Err(e) = session
                .send_stateless(StatelessPayload::Text(text.as_str()))
                .await
            {
                tracing::warn!("Control message from {} failed: {}", session.client_id(), e);
            }
            true
        }
        Message::Close(_) => false,
        _ => true,
    }
}

/// The presence state a client claims for itself, if the update carries any.
///
/// A client only speaks for itself: ids and clocks in the frame are ignored
/// and the relay assigns its own. `Some(None)` clears the client's presence.
fn claimed_awareness(update: AwarenessUpdate) -> Option<Option<Value>> {
    update.entries.into_iter().last().map(|entry| entry.state)
}

/// Returns false when the connection should close
async fn forward_event(sender: &mut Sender, event: SessionEvent) -> bool {
    match event {
        SessionEvent::Update(update) => send_frame(sender, Frame::Update(update.to_vec())).await,
        SessionEvent::Resync(state) => send_frame(sender, Frame::SyncStep2(state)).await,
        SessionEvent::Awareness(update) => {
            send_frame(sender, Frame::Awareness((*update).clone())).await
        }
        SessionEvent::Stateless(payload) => sender
            .send(Message::Text(payload.to_string().into()))
            .await
            .is_ok(),
        // DELETED was already delivered as a stateless event
        SessionEvent::Terminated => {
            let _ = sender.send(Message::Close(None)).await;
            false
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws/{document_id}", get(ws_handler))
}
