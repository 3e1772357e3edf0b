use crate::auth::AuthedUser;
use crate::db;
use crate::logging::RelayMetric;
use crate::registry::SessionRegistry;
use crate::types::{ChatTurn, ClientEvent, ClientId, HeliographError, Result, UpstreamDelta, UserId};
use crate::upstream::{self, DeltaStream};
use crate::AppState;
use axum::extract::State;
use axum::Json;
use bytes::Bytes;
use futures_util::Stream;
use serde::Deserialize;
use std::sync::Arc;
use tracing::Instrument;

/// --- REASONING GATE ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThinkingPhase {
    NotStarted,
    Open,
    Closed,
}

/// Translates upstream deltas into the client-visible event sequence.
///
/// Within one turn: `ai_thinking_process_start` is emitted exactly once, on
/// the first reasoning delta; `ai_thinking_process_end` exactly once, forced
/// before the first `ai_message_chunk` if the provider interleaves answer
/// deltas while reasoning is open, and forced at stream end if reasoning never
/// closed on its own. Reasoning deltas arriving after the gate closed are
/// dropped rather than re-opening it.
pub struct TurnFramer {
    phase: ThinkingPhase,
}

impl TurnFramer {
    pub fn new() -> Self {
        Self {
            phase: ThinkingPhase::NotStarted,
        }
    }

    pub fn frame(&mut self, delta: &UpstreamDelta) -> Vec<ClientEvent> {
        match delta {
            UpstreamDelta::ReasoningChunk(text) => match self.phase {
                ThinkingPhase::NotStarted => {
                    self.phase = ThinkingPhase::Open;
                    vec![
                        ClientEvent::thinking_process_start(),
                        ClientEvent::thinking_process_chunk(text.clone()),
                    ]
                }
                ThinkingPhase::Open => {
                    vec![ClientEvent::thinking_process_chunk(text.clone())]
                }
                ThinkingPhase::Closed => {
                    tracing::debug!(
                        "[⚙️ ] Dropping late reasoning delta ({} chars) after process end",
                        text.len()
                    );
                    Vec::new()
                }
            },
            UpstreamDelta::AnswerChunk(text) => {
                let mut events = Vec::with_capacity(2);
                if self.phase == ThinkingPhase::Open {
                    events.push(ClientEvent::thinking_process_end());
                }
                self.phase = ThinkingPhase::Closed;
                events.push(ClientEvent::message_chunk(text.clone()));
                events
            }
        }
    }

    /// Forces the process-end transition if the stream ended while reasoning
    /// was still open.
    pub fn finish(&mut self) -> Vec<ClientEvent> {
        if self.phase == ThinkingPhase::Open {
            self.phase = ThinkingPhase::Closed;
            vec![ClientEvent::thinking_process_end()]
        } else {
            Vec::new()
        }
    }
}

impl Default for TurnFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// --- ORCHESTRATION ---

/// Consumes the delta stream for one turn, emitting framed events to the
/// target session and closing the gate at end of stream. Sends to a session
/// that closed mid-turn degrade to no-ops while the upstream stream is still
/// drained.
pub async fn forward_deltas<S>(
    registry: &SessionRegistry,
    client_id: &ClientId,
    deltas: &mut DeltaStream<S>,
    turn: &mut ChatTurn,
) where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    let mut framer = TurnFramer::new();
    let mut metric = RelayMetric::new();

    while let Some(delta) = deltas.next_delta().await {
        metric.record(&delta);
        turn.absorb(&delta);
        for event in framer.frame(&delta) {
            registry.send_to_client(client_id, event).await;
        }
    }

    for event in framer.finish() {
        registry.send_to_client(client_id, event).await;
    }

    metric.log_summary(client_id);
}

/// One full turn: echo, thinking flag, upstream stream, framed relay, final
/// thinking flag, best-effort persistence. Never returns an error to the HTTP
/// caller; every failure is scoped to this turn.
pub async fn relay(state: Arc<AppState>, user_id: UserId, client_id: ClientId, text: String) {
    let registry = &state.registry;
    let mut turn = ChatTurn::new(user_id, client_id.clone(), text);

    registry
        .send_to_client(&client_id, ClientEvent::user_message(turn.user_text.clone()))
        .await;

    if let Err(e) = db::save_message(
        &state.db,
        user_id,
        "user",
        &turn.user_text,
        None,
        &client_id,
    )
    .await
    {
        tracing::error!("Failed to persist user message: {}", e);
    }

    registry
        .send_to_client(&client_id, ClientEvent::ai_thinking(true))
        .await;

    let response =
        match upstream::open_stream(&state.client, &state.provider, &turn.user_text).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("[☁️  -> ⚙️ ] Upstream request failed: {}", e);
                registry
                    .send_to_client(&client_id, ClientEvent::system(format!("AI service error: {}", e)))
                    .await;
                registry
                    .send_to_client(&client_id, ClientEvent::ai_thinking(false))
                    .await;
                return;
            }
        };

    let mut deltas = upstream::deltas_from_response(response);
    forward_deltas(registry, &client_id, &mut deltas, &mut turn).await;

    registry
        .send_to_client(&client_id, ClientEvent::ai_thinking(false))
        .await;

    if !turn.answer.is_empty() {
        let thinking = if turn.reasoning.is_empty() {
            None
        } else {
            Some(turn.reasoning.as_str())
        };
        if let Err(e) = db::save_message(
            &state.db,
            user_id,
            "assistant",
            &turn.answer,
            thinking,
            &client_id,
        )
        .await
        {
            tracing::error!("Failed to persist assistant message: {}", e);
        }
    }
}

/// --- MESSAGE SUBMIT ENDPOINT ---

#[derive(Deserialize, Debug)]
pub struct ChatMessageBody {
    pub message: Option<String>,
    #[serde(rename = "clientId")]
    pub client_id: Option<String>,
}

/// POST /chat/message: accepts the turn and schedules the relay. The relay
/// runs asynchronously; its output appears on the caller's push connection.
pub async fn chat_message(
    State(state): State<Arc<AppState>>,
    user: AuthedUser,
    Json(body): Json<ChatMessageBody>,
) -> Result<Json<serde_json::Value>> {
    let message = match body.message {
        Some(m) if !m.is_empty() => m,
        _ => {
            return Err(HeliographError::InvalidRequest(
                "message and clientId are required".to_string(),
            )
            .into())
        }
    };
    let client_id = match body.client_id {
        Some(c) if !c.is_empty() => ClientId::from(c),
        _ => {
            return Err(HeliographError::InvalidRequest(
                "message and clientId are required".to_string(),
            )
            .into())
        }
    };

    tracing::info!(
        "[🖥️  -> ⚙️ ] Message from user {} (client {}): {} chars",
        user.user_id,
        client_id.short(),
        message.len()
    );

    let span = tracing::info_span!(
        "relay",
        cid = %client_id.short(),
        uid = %user.user_id
    );
    tokio::spawn(relay(state.clone(), user.user_id, client_id, message).instrument(span));

    Ok(Json(serde_json::json!({ "success": true })))
}
