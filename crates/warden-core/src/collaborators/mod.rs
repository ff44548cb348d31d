//! Seams to the external subsystems the control plane drives.
//!
//! Storage backends, the hypervisor control interface, the per-domain
//! configuration store, and the guest-facing service daemons are thin
//! adapters over external systems; the control plane only depends on the
//! trait shapes here. Production adapters live with their deployments,
//! test doubles live with the tests, and every failure is surfaced as a
//! [`CollaboratorError`] naming the subsystem so callers can tell "your
//! request was invalid" apart from "an external system failed".

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::{DomainId, DomainName};

/// Which external subsystem an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    /// Virtual-disk storage backend.
    Storage,
    /// Hypervisor control interface.
    Hypervisor,
    /// Per-domain transient configuration store.
    ConfigStore,
    /// Remote-command-execution daemon.
    CommandDaemon,
    /// Display-isolation daemon.
    DisplayDaemon,
    /// The memory balancing service.
    Balancer,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Storage => "storage",
            Self::Hypervisor => "hypervisor",
            Self::ConfigStore => "config-store",
            Self::CommandDaemon => "command-daemon",
            Self::DisplayDaemon => "display-daemon",
            Self::Balancer => "balancer",
        };
        f.write_str(s)
    }
}

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, Error)]
#[error("{subsystem} failure: {message}")]
pub struct CollaboratorError {
    /// The failing subsystem.
    pub subsystem: Subsystem,
    /// What the collaborator reported.
    pub message: String,
}

impl CollaboratorError {
    /// Build an error for the given subsystem.
    #[must_use]
    pub fn new(subsystem: Subsystem, message: impl Into<String>) -> Self {
        Self {
            subsystem,
            message: message.into(),
        }
    }

    /// Storage backend failure.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(Subsystem::Storage, message)
    }

    /// Hypervisor failure.
    #[must_use]
    pub fn hypervisor(message: impl Into<String>) -> Self {
        Self::new(Subsystem::Hypervisor, message)
    }

    /// Config store failure.
    #[must_use]
    pub fn config_store(message: impl Into<String>) -> Self {
        Self::new(Subsystem::ConfigStore, message)
    }

    /// Balancer service failure.
    #[must_use]
    pub fn balancer(message: impl Into<String>) -> Self {
        Self::new(Subsystem::Balancer, message)
    }
}

/// Opaque handle to a hypervisor-level domain object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmHandle(pub u64);

impl fmt::Display for VmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm:{}", self.0)
    }
}

/// State of a hypervisor-level domain object as the hypervisor reports
/// it. The controller maps this (plus daemon readiness) to the
/// observable power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypervisorDomainState {
    /// Executing normally.
    Running,
    /// Paused by the control plane.
    Paused,
    /// Guest shutdown in progress.
    ShuttingDown,
    /// Suspended to memory.
    Suspended,
    /// Terminal teardown in progress.
    Dying,
    /// The guest crashed.
    Crashed,
    /// No domain object exists for the handle.
    Absent,
}

/// Everything the hypervisor needs to instantiate a domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainLaunchConfig {
    /// The domain's registry id.
    pub id: DomainId,
    /// The domain's name.
    pub name: DomainName,
    /// Initial memory allocation, bytes.
    pub memory_target: u64,
    /// Static memory ceiling, bytes.
    pub memory_ceiling: u64,
    /// Number of virtual CPUs.
    pub vcpu_count: u32,
}

/// Hypervisor control interface.
///
/// `define` through `destroy` mirror the hypervisor's own lifecycle
/// verbs; the memory calls exist for the balancing loop, which steers
/// allocations through balloon targets.
#[async_trait]
pub trait HypervisorControl: Send + Sync {
    /// Create the hypervisor-level domain object, not yet running.
    async fn define(&self, config: &DomainLaunchConfig) -> Result<VmHandle, CollaboratorError>;

    /// Discard a domain object previously returned by [`Self::define`].
    async fn undefine(&self, handle: VmHandle) -> Result<(), CollaboratorError>;

    /// Begin execution with all vCPUs paused.
    async fn start_paused(&self, handle: VmHandle) -> Result<(), CollaboratorError>;

    /// Unpause a paused domain, or wake a suspended one.
    async fn resume(&self, handle: VmHandle) -> Result<(), CollaboratorError>;

    /// Pause all vCPUs.
    async fn pause(&self, handle: VmHandle) -> Result<(), CollaboratorError>;

    /// Suspend the domain to memory.
    async fn suspend(&self, handle: VmHandle) -> Result<(), CollaboratorError>;

    /// Signal the guest to begin a graceful shutdown. Non-blocking; the
    /// domain transitions through `ShuttingDown` on its own.
    async fn request_shutdown(&self, handle: VmHandle) -> Result<(), CollaboratorError>;

    /// Forcefully destroy the domain object.
    async fn destroy(&self, handle: VmHandle) -> Result<(), CollaboratorError>;

    /// Current hypervisor-level state for the handle.
    async fn query_state(&self, handle: VmHandle)
        -> Result<HypervisorDomainState, CollaboratorError>;

    /// Exclusively bind a host device to the domain.
    async fn bind_device(&self, handle: VmHandle, device: &str)
        -> Result<(), CollaboratorError>;

    /// Detach a previously bound host device.
    async fn detach_device(
        &self,
        handle: VmHandle,
        device: &str,
    ) -> Result<(), CollaboratorError>;

    /// Free host memory, bytes.
    async fn free_host_memory(&self) -> Result<u64, CollaboratorError>;

    /// Current memory allocation of a domain, bytes.
    async fn domain_memory(&self, handle: VmHandle) -> Result<u64, CollaboratorError>;

    /// Set a domain's balloon target, bytes.
    async fn set_memory_target(
        &self,
        handle: VmHandle,
        bytes: u64,
    ) -> Result<(), CollaboratorError>;
}

/// Virtual-disk storage backend.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Check that the domain's disk images exist and are consistent.
    async fn verify_images(&self, id: DomainId) -> Result<(), CollaboratorError>;

    /// Reset transient/volatile disk state for a fresh boot.
    async fn prepare_for_startup(&self, id: DomainId) -> Result<(), CollaboratorError>;

    /// Create the domain's on-disk footprint, deriving the root disk
    /// from `source_template` when given.
    async fn create_on_disk(
        &self,
        id: DomainId,
        source_template: Option<DomainId>,
    ) -> Result<(), CollaboratorError>;

    /// Copy all disk files from an existing domain.
    async fn clone_disk_files(&self, id: DomainId, src: DomainId)
        -> Result<(), CollaboratorError>;

    /// Grow a named volume to `new_size` bytes.
    async fn resize(
        &self,
        id: DomainId,
        volume: &str,
        new_size: u64,
    ) -> Result<(), CollaboratorError>;

    /// Delete the domain's on-disk footprint.
    async fn remove_from_disk(&self, id: DomainId) -> Result<(), CollaboratorError>;

    /// Whether the domain's root disk is older than its template's.
    async fn is_outdated(&self, id: DomainId) -> Result<bool, CollaboratorError>;
}

/// Per-domain transient configuration store.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Publish one key for the domain to read at boot.
    async fn publish(
        &self,
        id: DomainId,
        key: &str,
        value: &str,
    ) -> Result<(), CollaboratorError>;
}

/// A guest-facing service daemon (remote command execution, display
/// isolation). Started per domain and polled for readiness.
#[async_trait]
pub trait ServiceDaemon: Send + Sync {
    /// Launch the daemon for the domain.
    async fn start(&self, id: DomainId) -> Result<(), CollaboratorError>;

    /// Whether the daemon is up and serving the domain.
    async fn is_ready(&self, id: DomainId) -> Result<bool, CollaboratorError>;
}
