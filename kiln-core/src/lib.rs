//! Kiln Core - Shared protocol types
//!
//! This crate contains the types shared between the Kiln runner and the
//! web API it reports to: process lifecycle states, the failure-reason
//! taxonomy, lifecycle event payloads, and the process-registry wire
//! payloads.
//!
//! All runner-specific functionality (spawning, port probing, health
//! checking, shutdown) lives in the `kiln-runner` crate.

mod protocol;

pub use protocol::*;
