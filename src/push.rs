//! Push session lifecycle: Opening (channel registered, handshake queued) →
//! Open (heartbeat armed, relay writes flow) → Closing (unregistered, heartbeat
//! cancelled) → Closed (transport released). There is no transition back to
//! Open; a reconnecting browser gets a fresh session and a fresh ClientId.

use crate::auth::AuthedUser;
use crate::registry::{OutboundFrame, OutboundSender, SessionRegistry};
use crate::types::{ClientEvent, ClientId, HeliographError, Result};
use crate::AppState;
use axum::extract::State;
use axum::response::sse::Sse;
use axum::response::IntoResponse;
use futures_util::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Outbound frames buffered per session before the transport writer drains
/// them. Buffering is bounded across chunks; a chunk itself is never split.
const OUTBOUND_BUFFER: usize = 256;

/// GET /chat/stream: opens the push connection.
///
/// The `connected` handshake is queued before the heartbeat is armed and
/// before the response stream is handed to the runtime, so it is always the
/// first record on the wire.
pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    user: AuthedUser,
) -> Result<impl IntoResponse> {
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    let client_id = state.registry.register(tx.clone());

    tracing::info!(
        "[🖥️  -> ⚙️ ] Client {} connected (user {}), {} open sessions",
        client_id.short(),
        user.user_id,
        state.registry.len()
    );

    let handshake = ClientEvent::connected(client_id.clone());
    if tx.send(OutboundFrame::Event(handshake)).await.is_err() {
        state.registry.unregister(&client_id);
        return Err(HeliographError::Internal(
            "push channel closed before handshake".to_string(),
            tracing_error::SpanTrace::capture(),
        )
        .into());
    }

    let heartbeat = tokio::spawn(heartbeat_loop(
        state.registry.clone(),
        client_id.clone(),
        tx,
        Duration::from_secs(state.args.heartbeat_interval_secs),
    ));
    state.registry.attach_heartbeat(&client_id, heartbeat);

    let guard = SessionGuard {
        registry: state.registry.clone(),
        client_id,
    };
    let stream = ReceiverStream::new(rx).map(move |frame| {
        let _held = &guard;
        Ok::<_, Infallible>(frame.into_sse())
    });

    Ok(Sse::new(stream))
}

/// Writes a no-op keepalive comment every interval. A failed write means the
/// peer is gone: the session is torn down so that a concurrent lookup
/// afterwards returns nothing.
async fn heartbeat_loop(
    registry: Arc<SessionRegistry>,
    client_id: ClientId,
    tx: OutboundSender,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; the handshake already went out.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if tx.send(OutboundFrame::Heartbeat).await.is_err() {
            tracing::info!(
                "[⚙️  -> 🖥️ ] Heartbeat to {} failed; peer gone",
                client_id.short()
            );
            registry.unregister(&client_id);
            break;
        }
        tracing::trace!("[⚙️  -> 🖥️ ] Heartbeat sent to {}", client_id.short());
    }
}

/// Unregisters the session when the HTTP task drops the response stream
/// (peer-initiated disconnect). Safe to run after an earlier teardown;
/// `unregister` is idempotent.
struct SessionGuard {
    registry: Arc<SessionRegistry>,
    client_id: ClientId,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.registry.unregister(&self.client_id) {
            tracing::info!(
                "[🖥️  -> ⚙️ ] Client {} disconnected, {} sessions remain",
                self.client_id.short(),
                self.registry.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_INTERVAL: Duration = Duration::from_secs(20);

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_frames_flow_while_peer_is_alive() {
        let registry = Arc::new(SessionRegistry::new());
        let (tx, mut rx) = mpsc::channel(8);
        let id = registry.register(tx.clone());
        let handle = tokio::spawn(heartbeat_loop(
            registry.clone(),
            id.clone(),
            tx,
            TEST_INTERVAL,
        ));
        registry.attach_heartbeat(&id, handle);

        tokio::time::sleep(TEST_INTERVAL + Duration::from_secs(1)).await;
        match rx.recv().await {
            Some(OutboundFrame::Heartbeat) => {}
            other => panic!("expected heartbeat frame, got {:?}", other),
        }
        assert!(registry.sender(&id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_failure_unregisters_session() {
        let registry = Arc::new(SessionRegistry::new());
        let (tx, rx) = mpsc::channel(8);
        let id = registry.register(tx.clone());
        let handle = tokio::spawn(heartbeat_loop(
            registry.clone(),
            id.clone(),
            tx,
            TEST_INTERVAL,
        ));
        registry.attach_heartbeat(&id, handle);

        drop(rx);
        tokio::time::sleep(TEST_INTERVAL + Duration::from_secs(1)).await;

        assert!(registry.sender(&id).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_guard_drop_unregisters() {
        let registry = Arc::new(SessionRegistry::new());
        let (tx, _rx) = mpsc::channel(8);
        let id = registry.register(tx);

        let guard = SessionGuard {
            registry: registry.clone(),
            client_id: id.clone(),
        };
        drop(guard);

        assert!(registry.sender(&id).is_none());
    }
}
