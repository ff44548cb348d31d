//! warden-daemon - Domain control plane runtime
//!
//! Wires the `warden-core` components into a running process: the
//! balancing loop that owns per-domain memory state, the shared daemon
//! state handle, and the collaborator context constructed once at
//! startup.
//!
//! This crate requires a multi-threaded tokio runtime: registry
//! persistence runs through `spawn_blocking`.
//!
//! # Modules
//!
//! - [`balancer`]: the balancing loop task and the admission service the
//!   lifecycle controller talks to
//! - [`context`]: collaborator wiring, including the fail-closed offline
//!   mode
//! - [`state`]: thread-safe shared daemon state

pub mod balancer;
pub mod context;
pub mod state;
