//! SSE HTTP handler for the web layer.
//!
//! This module only adapts subscriber queues to HTTP response bodies. The
//! upstream session, parser and fan-out live in the `sse` crate.

pub(crate) mod handler;
