// Testing Tools Library
//
// This crate provides testing utilities for the transit stream relay.
// Currently includes:
// - stream-probe: opens downstream connections against a running relay and
//   checks what each one receives

pub mod output;
pub mod scenarios;
pub mod stream_client;
