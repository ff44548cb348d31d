//! warden-core - Domain control plane library
//!
//! This library implements the control plane of a security-oriented
//! virtualization platform that runs each user-facing application inside
//! its own isolated virtual machine ("domain"). It provides the three
//! pieces that must stay correct under concurrency, partial failure, and
//! adversarial input:
//!
//! - [`registry`]: the authoritative catalog of domains, their identities,
//!   relationships, and role pointers, backed by a locked on-disk snapshot
//! - [`lifecycle`]: the per-domain state machine driving creation, start,
//!   suspend/resume, shutdown, and teardown
//! - [`memory`]: guest telemetry sanitization and the dynamic host-memory
//!   balancing algorithm, including the admission-control primitive
//!
//! Storage backends, the hypervisor control interface, the per-domain
//! configuration store, and the command/display daemons are external
//! collaborators; their seams are the traits in [`collaborators`]. The
//! runtime that wires everything together (balancer loop, daemon state,
//! process entry point) lives in the `warden-daemon` crate.

pub mod collaborators;
pub mod config;
pub mod lifecycle;
pub mod memory;
pub mod registry;
