use crate::{Error, Result};
use async_stream::stream;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::Stream;
use log::*;
use service::AppState;
use sse::distributor::Subscription;
use std::convert::Infallible;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// SSE comment sent when no event has been written for a while, so proxies
/// and browsers keep the connection open.
pub(crate) const KEEP_ALIVE_FRAME: &[u8] = b": keep-alive\n\n";

/// Long-lived vehicle stream. Every client shares the single upstream session,
/// which the first request starts.
pub(crate) async fn stream_vehicles(State(app_state): State<AppState>) -> Result<Response> {
    let target = app_state.config.upstream_target().ok_or_else(|| {
        warn!("Refusing stream client: no upstream API key configured");
        Error::UpstreamNotConfigured
    })?;

    let controller = &app_state.stream_controller;
    controller.ensure_started(target);
    if controller.stats().stopped {
        return Err(Error::StreamStopped);
    }

    let subscription = controller.subscribe();
    info!("Client {} connected to vehicle stream", subscription.id());

    let headers = [
        (CONTENT_TYPE, "text/event-stream"),
        (CACHE_CONTROL, "no-cache"),
        (CONNECTION, "keep-alive"),
    ];
    let body = Body::from_stream(relay(
        subscription,
        app_state.config.keep_alive_interval(),
    ));

    Ok((headers, body).into_response())
}

/// Writes queued frames to the client as they arrive, with a keep-alive
/// comment after every `keep_alive` of silence. Ends when the queue is closed.
/// Dropping the stream (client gone) drops the subscription, which
/// unregisters it.
pub(crate) fn relay(
    mut subscription: Subscription,
    keep_alive: Duration,
) -> impl Stream<Item = core::result::Result<Bytes, Infallible>> {
    stream! {
        let mut ticker = interval_at(Instant::now() + keep_alive, keep_alive);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let frame = tokio::select! {
                frame = subscription.recv() => {
                    ticker.reset();
                    frame
                }
                _ = ticker.tick() => Some(Bytes::from_static(KEEP_ALIVE_FRAME)),
            };

            match frame {
                Some(frame) => yield Ok(frame),
                None => break,
            }
        }

        debug!("Vehicle stream closed for client {}", subscription.id());
    }
}
