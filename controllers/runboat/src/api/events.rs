//! Server-sent build events.
//!
//! A subscriber first receives a full snapshot of the (filtered) index,
//! then one event per index delta. A subscriber that falls behind its
//! buffer is dropped; on reconnect it gets a fresh snapshot, so nothing
//! is ever lost for good.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::api::builds::{BuildView, ListQuery};
use crate::api::error::{ApiError, ApiResult};
use crate::api::AppState;
use crate::events::{BuildChange, BuildEventKind};
use crate::index::BuildFilter;

#[derive(Debug, Serialize)]
struct EventPayload {
    event: BuildEventKind,
    build: BuildView,
}

pub async fn build_events(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    if !state.index.ready() {
        return Err(ApiError::Unavailable);
    }
    let filter = query.to_filter()?;

    // Subscribe before snapshotting so no delta falls into the gap.
    let rx = state.index.subscribe();
    let snapshot: Vec<Event> = state
        .index
        .list(&filter)
        .iter()
        .map(|build| {
            sse_event(
                &BuildChange {
                    kind: BuildEventKind::Upd,
                    build: build.clone(),
                },
                &state,
            )
        })
        .collect();

    let live = live_events(rx, filter, state.clone());
    let stream = stream::iter(snapshot)
        .chain(live)
        .map(Ok::<Event, Infallible>);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn live_events(
    rx: broadcast::Receiver<BuildChange>,
    filter: BuildFilter,
    state: AppState,
) -> impl Stream<Item = Event> {
    stream::unfold(rx, move |mut rx| {
        let filter = filter.clone();
        let state = state.clone();
        async move {
            loop {
                match rx.recv().await {
                    Ok(change) if filter.matches(&change.build) => {
                        return Some((sse_event(&change, &state), rx));
                    }
                    Ok(_) => {}
                    // This subscriber lagged behind its buffer: end the
                    // stream, the client reconnects for a snapshot.
                    Err(broadcast::error::RecvError::Lagged(_)) => return None,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }
    })
}

fn sse_event(change: &BuildChange, state: &AppState) -> Event {
    let payload = EventPayload {
        event: change.kind,
        build: BuildView::from_build(&change.build, &state.settings),
    };
    match serde_json::to_string(&payload) {
        Ok(data) => Event::default().data(data),
        Err(_) => Event::default().comment("unserializable build event"),
    }
}
