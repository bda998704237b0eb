//! Server-sent-events body for streaming chat routes.
//!
//! Frames on the wire:
//!
//! ```text
//! data: {"token":"A"}
//! data: {"done":true}
//! data: {"error":{"code":"STREAM_ERROR","message":"...","trace_id":"..."}}
//! ```
//!
//! The body owns the [`StreamSession`]. When the client goes away hyper
//! drops the body, which drops the session and cancels the relay.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::{Stream, StreamExt};
use luki_core::lifecycle::RequestGuard;
use luki_core::relay::{RelayFrame, StreamSession};
use serde_json::json;

/// Wrap a relay session as an SSE response.
///
/// `guard` keeps the request counted as active until the stream ends, so
/// shutdown drains open streams too.
pub fn sse_response(session: StreamSession, guard: Option<RequestGuard>) -> Response {
    let events = TrackedSession {
        session,
        _guard: guard,
    }
    .map(|frame| Event::default().json_data(frame_json(&frame)));

    Sse::new(events).into_response()
}

fn frame_json(frame: &RelayFrame) -> serde_json::Value {
    match frame {
        RelayFrame::Token(token) => json!({ "token": token }),
        RelayFrame::Done => json!({ "done": true }),
        RelayFrame::Error(envelope) => json!(envelope),
    }
}

struct TrackedSession {
    session: StreamSession,
    _guard: Option<RequestGuard>,
}

impl Stream for TrackedSession {
    type Item = RelayFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.session).poll_next(cx)
    }
}
