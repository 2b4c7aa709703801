//! Live event stream distribution engine.
//!
//! This crate relays one upstream Server-Sent Events feed (the transit
//! provider's vehicle stream) to any number of downstream subscribers.
//!
//! # Architecture
//!
//! - **Single upstream session**: however many clients subscribe, exactly one
//!   connection to the provider is open at a time.
//! - **Fixed-delay reconnect**: connect failures, non-200 responses, framing
//!   errors and clean end of stream all lead to the same retry after a fixed
//!   delay.
//! - **Best-effort fan-out**: each subscriber owns a bounded queue. A full
//!   queue loses the payload for that subscriber only; the upstream reader
//!   never waits on a client.
//! - **Ephemeral**: nothing is persisted or replayed. A client that connects
//!   late sees events from that point on.
//!
//! # Event Flow
//!
//! 1. An HTTP handler calls `ensure_started` and `subscribe` on the controller
//! 2. The controller's loop opens the upstream connection (`upstream`)
//! 3. Bytes are parsed into events (`frame`), one parser per session
//! 4. Each event is re-framed (`message`) and offered to every queue (`distributor`)
//! 5. The handler writes payloads to its client until the queue closes
//!
//! # Example
//!
//! ```rust,ignore
//! use sse::controller::{ControllerConfig, StreamController};
//! use sse::upstream::{Credentials, HttpUpstream, HttpUpstreamConfig, UpstreamTarget};
//!
//! let upstream = HttpUpstream::new(&HttpUpstreamConfig::default())?;
//! let controller = StreamController::new(Arc::new(upstream), ControllerConfig::default());
//!
//! controller.ensure_started(UpstreamTarget::new(url, Credentials::api_key(key)));
//! let mut subscription = controller.subscribe();
//! while let Some(payload) = subscription.recv().await {
//!     // write `payload` to the client as-is
//! }
//! ```
//!
//! # Modules
//!
//! - `controller`: lifecycle and reconnect loop owning the upstream session
//! - `distributor`: subscriber registry and non-blocking broadcast
//! - `error`: error taxonomy for upstream and framing failures
//! - `frame`: incremental SSE parser
//! - `message`: parsed event and its downstream framing
//! - `upstream`: HTTP connector to the provider

pub mod controller;
pub mod distributor;
pub mod error;
pub mod frame;
pub mod message;
pub mod upstream;

pub use controller::StreamController;
pub use error::Error;
