//! Per-task SSE stream.
//!
//! Honors `Last-Event-ID`: missed events are replayed from the bounded
//! history first, then the live feed follows. Replay registration and the
//! history snapshot happen atomically on the bus, so clients see each id
//! exactly once, in order.

use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::Stream;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::events::Event;

use super::SharedState;

/// Poll interval for the terminal/idle check while the live queue is
/// quiet.
const IDLE_POLL: Duration = Duration::from_secs(1);

pub async fn stream_task(
    State(state): State<SharedState>,
    UrlPath(task_id): UrlPath<String>,
    headers: HeaderMap,
) -> Result<
    Sse<impl Stream<Item = Result<SseEvent, Infallible>>>,
    (StatusCode, Json<serde_json::Value>),
> {
    let known = state.registry.get(&task_id).is_some() || state.bus.is_registered(&task_id);
    if !known {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": "unknown task"})),
        ));
    }

    let last_id = headers
        .get("Last-Event-ID")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    debug!(%task_id, ?last_id, "SSE subscriber connected");

    let (replay, mut live) = state.bus.subscribe_with_history(&task_id, last_id);
    let settings = state.settings();
    let idle_timeout = settings.sse_idle_timeout;
    let heartbeat = settings.sse_heartbeat_interval;

    let stream_state = state.clone();
    let stream = async_stream::stream! {
        for event in replay {
            yield Ok(to_frame(&event));
        }

        let mut idle_since = Instant::now();
        loop {
            match tokio::time::timeout(IDLE_POLL, live.recv()).await {
                Ok(Some(event)) => {
                    idle_since = Instant::now();
                    yield Ok(to_frame(&event));
                }
                Ok(None) => {
                    debug!(%task_id, "event channel closed, ending stream");
                    break;
                }
                Err(_elapsed) => {
                    let terminal = stream_state
                        .registry
                        .get(&task_id)
                        .map(|t| t.status.is_terminal())
                        // An unknown (evicted) task is terminal by definition.
                        .unwrap_or(true);
                    if terminal && idle_since.elapsed() >= idle_timeout {
                        debug!(%task_id, "terminal task idle, closing stream");
                        break;
                    }
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(heartbeat).text("heartbeat")))
}

/// `id: <n>` / `event: <type>` / `data: <json>` frame.
fn to_frame(event: &Event) -> SseEvent {
    let data = serde_json::to_string(&event.payload).unwrap_or_else(|e| {
        warn!(error = %e, "event payload unserializable");
        "{}".to_string()
    });
    SseEvent::default()
        .id(event.id.to_string())
        .event(event.kind.as_str())
        .data(data)
}
