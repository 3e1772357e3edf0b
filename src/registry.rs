use crate::types::{ClientEvent, ClientId};
use axum::response::sse::Event;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One frame bound for a push connection. Heartbeats are SSE comment lines;
/// everything else is a JSON-encoded [`ClientEvent`] data record.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Event(ClientEvent),
    Heartbeat,
}

impl OutboundFrame {
    pub fn into_sse(self) -> Event {
        match self {
            OutboundFrame::Heartbeat => Event::default().comment(""),
            OutboundFrame::Event(event) => match serde_json::to_string(&event) {
                Ok(json) => Event::default().data(json),
                Err(e) => {
                    tracing::error!("Failed to serialize client event: {}", e);
                    Event::default().comment("")
                }
            },
        }
    }
}

pub type OutboundSender = mpsc::Sender<OutboundFrame>;

struct Session {
    tx: OutboundSender,
    heartbeat: Option<JoinHandle<()>>,
}

/// In-memory map of live push sessions, keyed by [`ClientId`]. This is the
/// only cross-session shared state; every mutation goes through the mutex.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<ClientId, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the outbound channel of a freshly opened push connection and
    /// issues its ClientId.
    pub fn register(&self, tx: OutboundSender) -> ClientId {
        let client_id = ClientId::new();
        self.sessions
            .lock()
            .expect("session registry lock")
            .insert(
                client_id.clone(),
                Session {
                    tx,
                    heartbeat: None,
                },
            );
        client_id
    }

    /// Arms the session's heartbeat task so that `unregister` can cancel it.
    /// If the session already closed in the meantime, the task is aborted
    /// right away.
    pub fn attach_heartbeat(&self, client_id: &ClientId, handle: JoinHandle<()>) {
        let mut sessions = self.sessions.lock().expect("session registry lock");
        match sessions.get_mut(client_id) {
            Some(session) => session.heartbeat = Some(handle),
            None => handle.abort(),
        }
    }

    /// Looks up the outbound channel of a live session. `None` means the peer
    /// is gone; callers treat that as a no-op send, never as a failure.
    pub fn sender(&self, client_id: &ClientId) -> Option<OutboundSender> {
        self.sessions
            .lock()
            .expect("session registry lock")
            .get(client_id)
            .map(|session| session.tx.clone())
    }

    /// Removes the session and cancels its heartbeat. Idempotent; returns
    /// whether the session was still present.
    pub fn unregister(&self, client_id: &ClientId) -> bool {
        let session = self
            .sessions
            .lock()
            .expect("session registry lock")
            .remove(client_id);
        match session {
            Some(session) => {
                if let Some(heartbeat) = session.heartbeat {
                    heartbeat.abort();
                }
                tracing::info!(
                    "[⚙️ ] Client {} unregistered, {} sessions remain",
                    client_id.short(),
                    self.len()
                );
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .expect("session registry lock")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes one event onto the session's writer. A missing session or a
    /// closed channel is a no-op: the event is dropped with a warning and the
    /// caller's turn continues.
    pub async fn send_to_client(&self, client_id: &ClientId, event: ClientEvent) {
        let tx = match self.sender(client_id) {
            Some(tx) => tx,
            None => {
                tracing::warn!(
                    "[⚙️  -> 🖥️ ] Client {} not registered; dropping {}",
                    client_id.short(),
                    event.kind()
                );
                return;
            }
        };

        let kind = event.kind();
        if tx.send(OutboundFrame::Event(event)).await.is_err() {
            tracing::warn!(
                "[⚙️  -> 🖥️ ] Client {} went away mid-send ({}); tearing session down",
                client_id.short(),
                kind
            );
            self.unregister(client_id);
        }
    }
}
