use anyhow::Result;
use futures_util::stream::StreamExt;
use log::*;
use reqwest::header::ACCEPT;
use sse::frame::{self, DEFAULT_MAX_LINE_BYTES};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: String,
    pub data: String,
    pub received_at: Instant,
}

/// One downstream client of `/stream/vehicles`. Keep-alive comments are
/// skipped by the parser; only events reach `wait_for_event`.
pub struct Connection {
    pub label: String,
    pub connected_at: Instant,
    /// Events handed out by `wait_for_event`, skipped ones included.
    pub events_received: usize,
    pub first_event_at: Option<Instant>,
    event_rx: mpsc::UnboundedReceiver<Event>,
    _handle: tokio::task::JoinHandle<()>,
}

impl Connection {
    pub async fn establish(client: &reqwest::Client, base_url: &str, label: String) -> Result<Self> {
        let connected_at = Instant::now();
        let url = format!("{}/stream/vehicles", base_url);
        let response = client
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        if !response.status().is_success() {
            anyhow::bail!("{} returned {}", url, response.status());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| sse::Error::Stream(Box::new(e))))
            .boxed();

        let task_label = label.clone();
        let handle = tokio::spawn(async move {
            let events = frame::events(bytes, DEFAULT_MAX_LINE_BYTES);
            futures_util::pin_mut!(events);

            loop {
                match events.next().await {
                    Some(Ok(event)) => {
                        let event = Event {
                            event_type: event.event_type().to_owned(),
                            data: event.data().to_owned(),
                            received_at: Instant::now(),
                        };

                        if tx.send(event).is_err() {
                            debug!("Stream receiver dropped for {}", task_label);
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Stream error for {}: {}", task_label, e);
                        break;
                    }
                    None => {
                        debug!("Stream ended for {}", task_label);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            label,
            connected_at,
            events_received: 0,
            first_event_at: None,
            event_rx: rx,
            _handle: handle,
        })
    }

    /// Waits for the next event, or the next one of `event_type` when given.
    pub async fn wait_for_event(
        &mut self,
        event_type: Option<&str>,
        timeout: Duration,
    ) -> Result<Event> {
        let deadline = Instant::now() + timeout;
        let wanted = event_type.unwrap_or("any");

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                anyhow::bail!("Timeout waiting for event: {}", wanted);
            }

            match tokio::time::timeout(remaining, self.event_rx.recv()).await {
                Ok(Some(event)) => {
                    self.events_received += 1;
                    self.first_event_at.get_or_insert(event.received_at);
                    match event_type {
                        Some(event_type) if event.event_type != event_type => continue,
                        _ => return Ok(event),
                    }
                }
                Ok(None) => anyhow::bail!("Stream connection closed"),
                Err(_) => anyhow::bail!("Timeout waiting for event: {}", wanted),
            }
        }
    }

    /// Time from connecting until the first event arrived.
    pub fn first_event_latency(&self) -> Option<Duration> {
        self.first_event_at
            .map(|at| at.saturating_duration_since(self.connected_at))
    }
}
