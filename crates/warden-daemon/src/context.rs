//! Collaborator wiring.
//!
//! All process-wide collaborator handles are constructed exactly once,
//! at startup, and passed to the components that need them; nothing in
//! the control plane reaches for global state. Connection lifecycle is
//! owned by the entry point.
//!
//! The only wiring built in here is the offline mode: every collaborator
//! call fails closed with a typed error. Deployments link in real
//! adapters (a libvirt-style hypervisor driver, an LVM or file storage
//! backend) and build a context from those.

use std::sync::Arc;

use async_trait::async_trait;

use warden_core::collaborators::{
    CollaboratorError, ConfigStore, DomainLaunchConfig, HypervisorControl,
    HypervisorDomainState, ServiceDaemon, StorageBackend, Subsystem, VmHandle,
};
use warden_core::lifecycle::Collaborators;
use warden_core::memory::AdmissionControl;
use warden_core::registry::DomainId;

/// The collaborator handles the daemon was started with.
#[derive(Clone)]
pub struct WardenContext {
    /// Virtual-disk storage backend.
    pub storage: Arc<dyn StorageBackend>,
    /// Hypervisor control interface.
    pub hypervisor: Arc<dyn HypervisorControl>,
    /// Per-domain configuration store.
    pub config_store: Arc<dyn ConfigStore>,
    /// Remote-command-execution daemon.
    pub command_daemon: Arc<dyn ServiceDaemon>,
    /// Display-isolation daemon.
    pub display_daemon: Arc<dyn ServiceDaemon>,
}

impl WardenContext {
    /// A context whose collaborators all fail closed. Used when no
    /// hypervisor connection is available: registry inspection and
    /// mutation keep working, anything touching a live domain reports a
    /// collaborator failure instead of guessing.
    #[must_use]
    pub fn offline() -> Self {
        Self {
            storage: Arc::new(Offline(Subsystem::Storage)),
            hypervisor: Arc::new(Offline(Subsystem::Hypervisor)),
            config_store: Arc::new(Offline(Subsystem::ConfigStore)),
            command_daemon: Arc::new(Offline(Subsystem::CommandDaemon)),
            display_daemon: Arc::new(Offline(Subsystem::DisplayDaemon)),
        }
    }

    /// Bundle these collaborators with an admission service for the
    /// lifecycle controller.
    #[must_use]
    pub fn collaborators(&self, admission: Arc<dyn AdmissionControl>) -> Collaborators {
        Collaborators {
            storage: Arc::clone(&self.storage),
            hypervisor: Arc::clone(&self.hypervisor),
            config_store: Arc::clone(&self.config_store),
            command_daemon: Arc::clone(&self.command_daemon),
            display_daemon: Arc::clone(&self.display_daemon),
            admission,
        }
    }
}

/// Fail-closed collaborator standing in for an unavailable subsystem.
struct Offline(Subsystem);

impl Offline {
    fn err(&self) -> CollaboratorError {
        CollaboratorError::new(self.0, "operations disabled in offline mode")
    }
}

#[async_trait]
impl StorageBackend for Offline {
    async fn verify_images(&self, _id: DomainId) -> Result<(), CollaboratorError> {
        Err(self.err())
    }

    async fn prepare_for_startup(&self, _id: DomainId) -> Result<(), CollaboratorError> {
        Err(self.err())
    }

    async fn create_on_disk(
        &self,
        _id: DomainId,
        _source_template: Option<DomainId>,
    ) -> Result<(), CollaboratorError> {
        Err(self.err())
    }

    async fn clone_disk_files(
        &self,
        _id: DomainId,
        _src: DomainId,
    ) -> Result<(), CollaboratorError> {
        Err(self.err())
    }

    async fn resize(
        &self,
        _id: DomainId,
        _volume: &str,
        _new_size: u64,
    ) -> Result<(), CollaboratorError> {
        Err(self.err())
    }

    async fn remove_from_disk(&self, _id: DomainId) -> Result<(), CollaboratorError> {
        Err(self.err())
    }

    async fn is_outdated(&self, _id: DomainId) -> Result<bool, CollaboratorError> {
        Err(self.err())
    }
}

#[async_trait]
impl HypervisorControl for Offline {
    async fn define(&self, _config: &DomainLaunchConfig) -> Result<VmHandle, CollaboratorError> {
        Err(self.err())
    }

    async fn undefine(&self, _handle: VmHandle) -> Result<(), CollaboratorError> {
        Err(self.err())
    }

    async fn start_paused(&self, _handle: VmHandle) -> Result<(), CollaboratorError> {
        Err(self.err())
    }

    async fn resume(&self, _handle: VmHandle) -> Result<(), CollaboratorError> {
        Err(self.err())
    }

    async fn pause(&self, _handle: VmHandle) -> Result<(), CollaboratorError> {
        Err(self.err())
    }

    async fn suspend(&self, _handle: VmHandle) -> Result<(), CollaboratorError> {
        Err(self.err())
    }

    async fn request_shutdown(&self, _handle: VmHandle) -> Result<(), CollaboratorError> {
        Err(self.err())
    }

    async fn destroy(&self, _handle: VmHandle) -> Result<(), CollaboratorError> {
        Err(self.err())
    }

    async fn query_state(
        &self,
        _handle: VmHandle,
    ) -> Result<HypervisorDomainState, CollaboratorError> {
        Err(self.err())
    }

    async fn bind_device(
        &self,
        _handle: VmHandle,
        _device: &str,
    ) -> Result<(), CollaboratorError> {
        Err(self.err())
    }

    async fn detach_device(
        &self,
        _handle: VmHandle,
        _device: &str,
    ) -> Result<(), CollaboratorError> {
        Err(self.err())
    }

    async fn free_host_memory(&self) -> Result<u64, CollaboratorError> {
        Err(self.err())
    }

    async fn domain_memory(&self, _handle: VmHandle) -> Result<u64, CollaboratorError> {
        Err(self.err())
    }

    async fn set_memory_target(
        &self,
        _handle: VmHandle,
        _bytes: u64,
    ) -> Result<(), CollaboratorError> {
        Err(self.err())
    }
}

#[async_trait]
impl ConfigStore for Offline {
    async fn publish(
        &self,
        _id: DomainId,
        _key: &str,
        _value: &str,
    ) -> Result<(), CollaboratorError> {
        Err(self.err())
    }
}

#[async_trait]
impl ServiceDaemon for Offline {
    async fn start(&self, _id: DomainId) -> Result<(), CollaboratorError> {
        Err(self.err())
    }

    async fn is_ready(&self, _id: DomainId) -> Result<bool, CollaboratorError> {
        Err(self.err())
    }
}
