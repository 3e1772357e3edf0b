use axum::http::StatusCode;
use axum::{routing::post, Router};
use clap::Parser;
use heliograph::auth::AuthConfig;
use heliograph::registry::{OutboundFrame, SessionRegistry};
use heliograph::relay::relay;
use heliograph::types::{ClientEvent, ClientId, UserId};
use heliograph::upstream::ProviderConfig;
use heliograph::{AppState, Args};
use std::sync::Arc;
use tokio::sync::mpsc;

const SSE_BODY: &str = "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"a\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"b\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n\
data: [DONE]\n\n";

async fn mock_provider(status: StatusCode, body: &'static str) -> String {
    let app = Router::new().route("/v1/chat", post(move || async move { (status, body) }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/v1/chat", addr)
}

async fn test_state(api_url: String) -> (tempfile::TempDir, Arc<AppState>) {
    let dir = tempfile::tempdir().unwrap();
    let db = heliograph::db::init_db(dir.path().join("test.db"))
        .await
        .unwrap();
    let state = Arc::new(AppState {
        client: reqwest::Client::new(),
        provider: ProviderConfig {
            api_url,
            api_key: "test-key".to_string(),
            model: "test-model".to_string(),
        },
        auth: AuthConfig::new("test-secret", 3600),
        db,
        registry: Arc::new(SessionRegistry::new()),
        args: Arc::new(Args::parse_from(["heliograph"])),
    });
    (dir, state)
}

fn drain_events(rx: &mut mpsc::Receiver<OutboundFrame>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let OutboundFrame::Event(event) = frame {
            events.push(event);
        }
    }
    events
}

#[tokio::test]
async fn test_relay_emits_the_full_turn_sequence_in_order() {
    let url = mock_provider(StatusCode::OK, SSE_BODY).await;
    let (_dir, state) = test_state(url).await;
    let user = heliograph::db::create_user(&state.db, "alice", "hash", None)
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel(64);
    let client_id = state.registry.register(tx);

    relay(state.clone(), UserId(user.id), client_id, "hello".to_string()).await;

    let events = drain_events(&mut rx);
    let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            "user_message",
            "ai_thinking",
            "ai_thinking_process_start",
            "ai_thinking_process_chunk",
            "ai_thinking_process_chunk",
            "ai_thinking_process_end",
            "ai_message_chunk",
            "ai_thinking",
        ]
    );

    assert!(matches!(
        &events[0],
        ClientEvent::UserMessage { content, .. } if content == "hello"
    ));
    assert!(matches!(
        &events[1],
        ClientEvent::AiThinking { content: true, .. }
    ));
    assert!(matches!(
        &events[3],
        ClientEvent::AiThinkingProcessChunk { content, .. } if content == "a"
    ));
    assert!(matches!(
        &events[4],
        ClientEvent::AiThinkingProcessChunk { content, .. } if content == "b"
    ));
    assert!(matches!(
        &events[6],
        ClientEvent::AiMessageChunk { content, .. } if content == "x"
    ));
    assert!(matches!(
        &events[7],
        ClientEvent::AiThinking { content: false, .. }
    ));
}

#[tokio::test]
async fn test_relay_never_writes_to_another_clients_session() {
    let url = mock_provider(StatusCode::OK, SSE_BODY).await;
    let (_dir, state) = test_state(url).await;
    let user = heliograph::db::create_user(&state.db, "alice", "hash", None)
        .await
        .unwrap();

    let (tx_a, mut rx_a) = mpsc::channel(64);
    let id_a = state.registry.register(tx_a);
    let (tx_b, mut rx_b) = mpsc::channel(64);
    let _id_b = state.registry.register(tx_b);

    relay(state.clone(), UserId(user.id), id_a, "hello".to_string()).await;

    assert!(!drain_events(&mut rx_a).is_empty());
    assert!(drain_events(&mut rx_b).is_empty());
}

#[tokio::test]
async fn test_upstream_failure_surfaces_system_event_and_stops() {
    let url = mock_provider(StatusCode::INTERNAL_SERVER_ERROR, "boom").await;
    let (_dir, state) = test_state(url).await;
    let user = heliograph::db::create_user(&state.db, "alice", "hash", None)
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel(64);
    let client_id = state.registry.register(tx);

    relay(state.clone(), UserId(user.id), client_id, "hello".to_string()).await;

    let events = drain_events(&mut rx);
    let kinds: Vec<_> = events.iter().map(|e| e.kind()).collect();
    assert_eq!(
        kinds,
        vec!["user_message", "ai_thinking", "system", "ai_thinking"]
    );
    assert!(matches!(
        &events[2],
        ClientEvent::System { content, .. } if !content.is_empty()
    ));
    assert!(matches!(
        &events[3],
        ClientEvent::AiThinking { content: false, .. }
    ));
}

#[tokio::test]
async fn test_relay_to_unknown_client_completes_and_persists() {
    let url = mock_provider(StatusCode::OK, SSE_BODY).await;
    let (_dir, state) = test_state(url).await;
    let user = heliograph::db::create_user(&state.db, "alice", "hash", None)
        .await
        .unwrap();

    // No session registered under this id: every send is a no-op, but the
    // turn still runs to completion and the transcript is still written.
    relay(
        state.clone(),
        UserId(user.id),
        ClientId::new(),
        "hello".to_string(),
    )
    .await;

    let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
        "SELECT role, content, thinking_process FROM messages WHERE user_id = ? ORDER BY id",
    )
    .bind(user.id)
    .fetch_all(&state.db)
    .await
    .unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].0, "user");
    assert_eq!(rows[0].1, "hello");
    assert_eq!(rows[1].0, "assistant");
    assert_eq!(rows[1].1, "x");
    assert_eq!(rows[1].2.as_deref(), Some("ab"));
}
