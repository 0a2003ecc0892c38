//! Kiln Runner - dev-server process lifecycle management
//!
//! The runner owns one dev-server process per active Kiln project:
//! spawning, port negotiation, health checking, failure diagnosis,
//! best-effort remediation of misconfigured project scripts, and a
//! shutdown protocol that escalates from SIGTERM to SIGKILL without
//! leaking processes or ports.
//!
//! The rest of the platform (chat UI, agent, event relay, tunnel
//! service, web API) are external collaborators; only their narrow
//! contracts appear here: the process-registry HTTP calls, the
//! `TunnelCloser` capability, and the event channel carrying
//! `log`/`exit`/`error` payloads.

pub mod config;
pub mod defaults;
mod failure;
mod health;
mod ports;
mod registry;
mod remediate;
mod shutdown;
mod supervisor;

pub use failure::{FailureDiagnosis, classify};
pub use health::{HealthCheckError, HealthCheckOutcome, verify};
pub use ports::{find_available_port, is_port_in_use, kill_listeners, wait_for_release};
pub use registry::RegistryClient;
pub use remediate::fix_port_in_project_config;
pub use shutdown::{StopOptions, TunnelCloser, pid_alive};
pub use supervisor::{ProcessRecord, ProcessSupervisor, StartError, StartOptions};
