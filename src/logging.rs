use crate::types::{ClientId, UpstreamDelta};
use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use std::panic;
use tracing::error;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const TURN_ID_HEADER: &str = "x-relay-turn-id";

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Stamps every request with a turn id and wraps it in a request span.
pub async fn turn_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let turn_id = Uuid::new_v4().to_string();
    if let Ok(val) = turn_id.parse() {
        req.headers_mut().insert(TURN_ID_HEADER, val);
    }

    let span = info_span!("request", turn_id = %turn_id);
    next.run(req).instrument(span).await
}

/// Per-relay counters, logged once at stream end.
#[derive(Default)]
pub struct RelayMetric {
    pub deltas: usize,
    pub reasoning_chunks: usize,
    pub answer_chunks: usize,
    pub reasoning_chars: usize,
    pub answer_chars: usize,
}

impl RelayMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, delta: &UpstreamDelta) {
        self.deltas += 1;
        match delta {
            UpstreamDelta::ReasoningChunk(text) => {
                self.reasoning_chunks += 1;
                self.reasoning_chars += text.len();
            }
            UpstreamDelta::AnswerChunk(text) => {
                self.answer_chunks += 1;
                self.answer_chars += text.len();
            }
        }
    }

    pub fn log_summary(&self, client_id: &ClientId) {
        tracing::info!(
            "[STREAM END] Client: {} | Deltas: {} | Reasoning: {} chunks, {} chars | Answer: {} chunks, {} chars",
            client_id.short(),
            self.deltas,
            self.reasoning_chunks,
            self.reasoning_chars,
            self.answer_chunks,
            self.answer_chars
        );
    }
}
