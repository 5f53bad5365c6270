// SPDX-License-Identifier: MIT
// gateway/sse.rs — GET /_inspector/events
//
// Streams lifecycle events as Server-Sent Events. A client reconnecting
// with `Last-Event-ID` first replays what the ring buffer still holds,
// then continues live. Keep-alive comments flow every 15 seconds so
// intermediaries don't idle the connection out.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_util::stream::{self, StreamExt};
use tokio_stream::wrappers::ReceiverStream;

use crate::events::EventEnvelope;
use crate::InspectorContext;

fn frame(envelope: &EventEnvelope) -> SseEvent {
    SseEvent::default()
        .id(envelope.event_id.to_string())
        .event("message")
        .data(serde_json::to_string(envelope).unwrap_or_default())
}

pub async fn events(
    State(ctx): State<Arc<InspectorContext>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    let subscription = ctx.events.subscribe(last_event_id);

    // First bytes on the wire: the reconnect-delay hint.
    let preamble = stream::iter(vec![Ok::<SseEvent, Infallible>(
        SseEvent::default().retry(Duration::from_millis(2000)),
    )]);

    let replay = stream::iter(
        subscription
            .replay
            .into_iter()
            .map(|envelope| Ok(frame(&envelope)))
            .collect::<Vec<_>>(),
    );

    let live = ReceiverStream::new(subscription.rx).map(|envelope| Ok(frame(&envelope)));

    // One trailing comment when the bus closes, so clients see a clean end.
    let farewell = stream::iter(vec![Ok::<SseEvent, Infallible>(
        SseEvent::default().comment(""),
    )]);

    Sse::new(preamble.chain(replay).chain(live).chain(farewell))
        .keep_alive(KeepAlive::new().interval(ctx.config.sse_keepalive))
}
