//! The per-domain lifecycle state machine.
//!
//! [`LifecycleController`] drives domains through start, shutdown,
//! suspend/resume, pause, teardown, and on-disk creation/removal. It
//! consumes the registry for dependency ordering, the balancer (through
//! [`AdmissionControl`]) for memory admission, and the collaborator
//! traits for everything that touches the outside world.
//!
//! # Concurrency
//!
//! Each domain has one transition mutex, held for the whole duration of
//! a multi-step operation: a single domain never processes two
//! concurrent transitions, while unrelated domains proceed in parallel.
//! State observation (`current_state`) deliberately bypasses the
//! transition mutex so callers can poll a domain mid-transition.
//!
//! # Failure semantics
//!
//! `start` is atomic from the caller's perspective: any step failure
//! (storage, admission, hypervisor, daemon readiness timeout) tears down
//! whatever was partially created and leaves the domain `Halted`.
//! Teardown operations surface collaborator failures without inventing a
//! rollback; forcing teardown state is itself the recovery action.

pub mod error;
pub mod poll;
pub mod state;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::collaborators::{
    ConfigStore, DomainLaunchConfig, HypervisorControl, HypervisorDomainState, ServiceDaemon,
    StorageBackend, VmHandle,
};
use crate::memory::AdmissionControl;
use crate::registry::store::{RegistryStore, StoreError};
use crate::registry::{DomainId, DomainKind, DomainName, DomainRecord, DomainRegistry, DomainSpec, Role};

pub use error::LifecycleError;
pub use poll::{PollBudget, PollError};
pub use state::PowerState;

/// Overhead of per-domain hypervisor structures, added to the memory
/// target when requesting admission. Rounded up a little so the request
/// never comes in just short.
pub const MEM_OVERHEAD_BASE: u64 = (3 + 1) * 1024 * 1024;

/// Additional overhead per virtual CPU.
pub const MEM_OVERHEAD_PER_VCPU: u64 = 3 * 1024 * 1024 / 2;

const fn default_readiness_budget() -> PollBudget {
    PollBudget::new(60, Duration::from_secs(1))
}

const fn default_suspend_budget() -> PollBudget {
    PollBudget::new(15, Duration::from_millis(200))
}

const fn default_teardown_budget() -> PollBudget {
    PollBudget::new(60, Duration::from_millis(500))
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Controller tunables.
///
/// The plain `timezone` field stays ahead of the nested budget tables
/// so the struct serializes to TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleSettings {
    /// Timezone published to every domain's configuration store.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Budget for waiting on service-daemon readiness during `start`.
    #[serde(default = "default_readiness_budget")]
    pub readiness: PollBudget,

    /// Budget for waiting on suspend confirmation.
    #[serde(default = "default_suspend_budget")]
    pub suspend: PollBudget,

    /// Budget for waiting on a dependent to halt during tree teardown.
    #[serde(default = "default_teardown_budget")]
    pub teardown: PollBudget,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            readiness: default_readiness_budget(),
            suspend: default_suspend_budget(),
            teardown: default_teardown_budget(),
            timezone: default_timezone(),
        }
    }
}

/// The external subsystems a controller drives.
#[derive(Clone)]
pub struct Collaborators {
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
    /// Memory admission service (the balancing loop).
    pub admission: Arc<dyn AdmissionControl>,
}

/// Per-domain runtime bookkeeping.
///
/// `transition` serializes multi-step operations; `handle` is readable
/// without it so observers are never blocked behind a transition.
#[derive(Debug)]
struct DomainRuntime {
    transition: tokio::sync::Mutex<()>,
    handle: RwLock<Option<VmHandle>>,
}

impl DomainRuntime {
    fn new() -> Self {
        Self {
            transition: tokio::sync::Mutex::new(()),
            handle: RwLock::new(None),
        }
    }

    fn handle(&self) -> Option<VmHandle> {
        *self.handle.read().expect("domain runtime lock poisoned")
    }

    fn set_handle(&self, handle: Option<VmHandle>) {
        *self.handle.write().expect("domain runtime lock poisoned") = handle;
    }
}

/// The per-domain lifecycle state machine.
pub struct LifecycleController {
    registry: Arc<tokio::sync::RwLock<DomainRegistry>>,
    store: Option<RegistryStore>,
    collaborators: Collaborators,
    settings: LifecycleSettings,
    runtimes: Mutex<HashMap<DomainId, Arc<DomainRuntime>>>,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl LifecycleController {
    /// Create a controller without snapshot persistence (tests, dry
    /// runs).
    #[must_use]
    pub fn new(
        registry: Arc<tokio::sync::RwLock<DomainRegistry>>,
        collaborators: Collaborators,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            registry,
            store: None,
            collaborators,
            settings,
            runtimes: Mutex::new(HashMap::new()),
        }
    }

    /// Create a controller that persists the registry snapshot after
    /// every mutation of persisted fields.
    #[must_use]
    pub fn with_store(
        registry: Arc<tokio::sync::RwLock<DomainRegistry>>,
        store: RegistryStore,
        collaborators: Collaborators,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            registry,
            store: Some(store),
            collaborators,
            settings,
            runtimes: Mutex::new(HashMap::new()),
        }
    }

    /// The registry this controller operates on.
    #[must_use]
    pub fn registry(&self) -> Arc<tokio::sync::RwLock<DomainRegistry>> {
        Arc::clone(&self.registry)
    }

    fn runtime(&self, id: DomainId) -> Arc<DomainRuntime> {
        let mut runtimes = self.runtimes.lock().expect("runtime map lock poisoned");
        Arc::clone(runtimes.entry(id).or_insert_with(|| Arc::new(DomainRuntime::new())))
    }

    /// Define a new domain: insert the record (filling unset template
    /// and provider references from the registry's role defaults) and
    /// create its on-disk footprint. Storage failure rolls the record
    /// back out.
    ///
    /// # Errors
    ///
    /// Registry validation errors, or `Collaborator` when storage
    /// creation fails.
    pub async fn define_domain(&self, mut spec: DomainSpec) -> Result<DomainId, LifecycleError> {
        {
            let registry = self.registry.read().await;
            if spec.template.is_none() && spec.kind.uses_template() {
                spec.template = registry.role(Role::DefaultTemplate);
            }
            if spec.network_provider.is_none() {
                spec.network_provider = match spec.kind {
                    DomainKind::NetworkProvider => {
                        registry.role(Role::DefaultFirewallNetworkProvider)
                    }
                    DomainKind::Application
                    | DomainKind::Disposable
                    | DomainKind::Standalone
                    | DomainKind::Template => registry.role(Role::DefaultNetworkProvider),
                    DomainKind::Administrative => None,
                };
            }
        }
        let template = spec.template;
        let id = self.registry.write().await.add(spec)?;

        if let Err(err) = self.collaborators.storage.create_on_disk(id, template).await {
            // Nothing can reference a brand-new record, so removal only
            // fails if the registry itself is gone.
            if let Err(remove_err) = self.registry.write().await.remove(id) {
                warn!(%id, error = %remove_err, "failed to roll back record after storage failure");
            }
            return Err(err.into());
        }
        self.persist().await?;
        info!(%id, "domain defined");
        Ok(id)
    }

    /// Clone an existing halted domain under a new name, copying its
    /// record and disk files.
    ///
    /// # Errors
    ///
    /// `InvalidState` when the source is not halted, registry validation
    /// errors for the new record, `Collaborator` when the disk copy
    /// fails.
    pub async fn clone_domain(
        &self,
        src: DomainId,
        new_name: DomainName,
    ) -> Result<DomainId, LifecycleError> {
        let source = { self.registry.read().await.get(src)?.clone() };
        let state = self.observe_loose(src).await?;
        if !state.can_start() {
            return Err(LifecycleError::InvalidState {
                id: src,
                operation: "clone",
                state,
            });
        }
        let spec = DomainSpec {
            name: new_name,
            kind: source.kind,
            id: None,
            template: source.template,
            network_provider: source.network_provider,
            memory_target: source.memory_target,
            memory_ceiling: source.memory_ceiling,
            vcpu_count: source.vcpu_count,
            exclusive_devices: source.exclusive_devices.clone(),
            suppress_display_daemon: source.suppress_display_daemon,
        };
        let id = self.registry.write().await.add(spec)?;
        if let Err(err) = self.collaborators.storage.clone_disk_files(id, src).await {
            if let Err(remove_err) = self.registry.write().await.remove(id) {
                warn!(%id, error = %remove_err, "failed to roll back record after clone failure");
            }
            return Err(err.into());
        }
        self.persist().await?;
        info!(%id, %src, "domain cloned");
        Ok(id)
    }

    /// Remove a halted domain: drop the record (refused while other
    /// records reference it) and delete its on-disk footprint.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless halted, registry errors (`StillReferenced`,
    /// `NotFound`, ...), `Collaborator` when disk removal fails (the
    /// record is already gone at that point).
    pub async fn remove_domain(&self, id: DomainId) -> Result<(), LifecycleError> {
        let runtime = self.runtime(id);
        let _transition = runtime.transition.lock().await;

        let state = self.observe_loose(id).await?;
        if !state.can_start() {
            return Err(LifecycleError::InvalidState {
                id,
                operation: "remove",
                state,
            });
        }
        self.registry.write().await.remove(id)?;
        self.runtimes
            .lock()
            .expect("runtime map lock poisoned")
            .remove(&id);
        self.persist().await?;
        self.collaborators.storage.remove_from_disk(id).await?;
        info!(%id, "domain removed");
        Ok(())
    }

    /// Rename a halted domain.
    ///
    /// # Errors
    ///
    /// `InvalidState` while the domain is running in any form, plus
    /// registry identity errors.
    pub async fn rename(&self, id: DomainId, new_name: DomainName) -> Result<(), LifecycleError> {
        let runtime = self.runtime(id);
        let _transition = runtime.transition.lock().await;

        let state = self.observe_loose(id).await?;
        if !state.can_start() {
            return Err(LifecycleError::InvalidState {
                id,
                operation: "rename",
                state,
            });
        }
        self.registry.write().await.rename(id, new_name)?;
        self.persist().await?;
        Ok(())
    }

    /// Point a domain at a new network provider. For a running domain
    /// the new provider must itself be running, and the boot
    /// configuration is republished so the guest can re-attach.
    ///
    /// # Errors
    ///
    /// Registry validation errors, `InvalidState` when attaching a
    /// running domain to a stopped provider.
    pub async fn set_network_provider(
        &self,
        id: DomainId,
        provider: Option<DomainId>,
    ) -> Result<(), LifecycleError> {
        let runtime = self.runtime(id);
        let _transition = runtime.transition.lock().await;

        let state = self.observe_loose(id).await?;
        if state.is_running() {
            if let Some(provider) = provider {
                let provider_state = self.observe_loose(provider).await?;
                if provider_state != PowerState::Running {
                    return Err(LifecycleError::InvalidState {
                        id: provider,
                        operation: "attach dependent to",
                        state: provider_state,
                    });
                }
            }
        }
        self.registry.write().await.set_network_provider(id, provider)?;
        self.persist().await?;
        if state.is_running() {
            let record = { self.registry.read().await.get(id)?.clone() };
            self.publish_boot_config(&record).await?;
        }
        Ok(())
    }

    /// Start a domain.
    ///
    /// Runs the full boot sequence: image verification, recursive
    /// provider start, volatile-state preparation, memory admission,
    /// hypervisor object creation (paused), exclusive device binding,
    /// configuration publication, unpause, and service-daemon readiness
    /// polling. Any failure rolls back to `Halted`.
    ///
    /// # Errors
    ///
    /// - `InvalidState` unless the domain is halted
    /// - `InsufficientMemory` when admission is denied
    /// - `Collaborator` / `Timeout` on any step failure (after rollback)
    pub async fn start(&self, id: DomainId) -> Result<(), LifecycleError> {
        let runtime = self.runtime(id);
        let _transition = runtime.transition.lock().await;

        let record = { self.registry.read().await.get(id)?.clone() };
        let state = self.observe(id, &record, &runtime).await?;
        if !state.can_start() {
            return Err(LifecycleError::InvalidState {
                id,
                operation: "start",
                state,
            });
        }
        info!(%id, name = %record.name, "starting domain");

        self.collaborators.storage.verify_images(id).await?;

        // Providers start root-first: a provider must be fully running
        // before its dependent publishes network configuration. The
        // administrative domain is always up and is never started here.
        if let Some(provider) = record.network_provider {
            if !provider.is_admin() {
                let provider_state = self.observe_loose(provider).await?;
                if !provider_state.is_running() {
                    debug!(%id, %provider, "starting network provider first");
                    self.start_boxed(provider).await?;
                }
            }
        }

        self.collaborators.storage.prepare_for_startup(id).await?;

        let requested = record.memory_target
            + MEM_OVERHEAD_BASE
            + u64::from(record.vcpu_count) * MEM_OVERHEAD_PER_VCPU;
        let granted = self.collaborators.admission.request_memory(requested).await?;
        if !granted {
            return Err(LifecycleError::InsufficientMemory { id, requested });
        }

        let launch = DomainLaunchConfig {
            id,
            name: record.name.clone(),
            memory_target: record.memory_target,
            memory_ceiling: record.memory_ceiling,
            vcpu_count: record.vcpu_count,
        };
        let handle = self.collaborators.hypervisor.define(&launch).await?;
        runtime.set_handle(Some(handle));

        match self.boot(id, &record, handle).await {
            Ok(()) => {
                info!(%id, name = %record.name, "domain running");
                Ok(())
            }
            Err(err) => {
                warn!(%id, error = %err, "start failed, rolling back");
                self.rollback_start(id, &runtime, handle).await;
                Err(err)
            }
        }
    }

    /// Everything after the hypervisor object exists; a failure here is
    /// rolled back by the caller.
    async fn boot(
        &self,
        id: DomainId,
        record: &DomainRecord,
        handle: VmHandle,
    ) -> Result<(), LifecycleError> {
        let hypervisor = &self.collaborators.hypervisor;
        hypervisor.start_paused(handle).await?;

        for device in &record.exclusive_devices {
            hypervisor.bind_device(handle, device).await?;
        }

        self.publish_boot_config(record).await?;

        hypervisor.resume(handle).await?;
        // Observable state is now Transient until both daemons are up.

        self.collaborators
            .admission
            .domain_started(id, handle, record.memory_target, record.memory_ceiling)
            .await?;

        self.collaborators.command_daemon.start(id).await?;
        let command_daemon = Arc::clone(&self.collaborators.command_daemon);
        self.settings
            .readiness
            .wait_until("command daemon readiness", move || {
                let daemon = Arc::clone(&command_daemon);
                async move { daemon.is_ready(id).await }
            })
            .await?;

        if !record.suppress_display_daemon {
            self.collaborators.display_daemon.start(id).await?;
            let display_daemon = Arc::clone(&self.collaborators.display_daemon);
            self.settings
                .readiness
                .wait_until("display daemon readiness", move || {
                    let daemon = Arc::clone(&display_daemon);
                    async move { daemon.is_ready(id).await }
                })
                .await?;
        }
        Ok(())
    }

    /// Forceful teardown of a partially started domain. Errors are
    /// logged, not surfaced: the caller is already reporting the
    /// original failure.
    async fn rollback_start(&self, id: DomainId, runtime: &DomainRuntime, handle: VmHandle) {
        let hypervisor = &self.collaborators.hypervisor;
        if let Err(err) = hypervisor.destroy(handle).await {
            warn!(%id, error = %err, "rollback: destroy failed");
        }
        if let Err(err) = hypervisor.undefine(handle).await {
            warn!(%id, error = %err, "rollback: undefine failed");
        }
        runtime.set_handle(None);
        if let Err(err) = self.collaborators.admission.domain_stopped(id).await {
            debug!(%id, error = %err, "rollback: balancer notification failed");
        }
    }

    fn start_boxed(
        &self,
        id: DomainId,
    ) -> Pin<Box<dyn Future<Output = Result<(), LifecycleError>> + Send + '_>> {
        Box::pin(self.start(id))
    }

    /// Signal a graceful guest shutdown. Non-blocking: the caller polls
    /// [`Self::current_state`] and may escalate to [`Self::kill`] on its
    /// own timeout.
    ///
    /// # Errors
    ///
    /// - `InvalidState` unless the domain is `Running`/`Transient`/
    ///   `Halting`
    /// - `StillReferenced` while running dependents exist (use
    ///   [`Self::shutdown_tree`] to take the whole set down)
    /// - `Collaborator` if the hypervisor rejects the signal
    pub async fn shutdown(&self, id: DomainId) -> Result<(), LifecycleError> {
        let runtime = self.runtime(id);
        let _transition = runtime.transition.lock().await;
        self.shutdown_locked(id, &runtime, true).await
    }

    async fn shutdown_locked(
        &self,
        id: DomainId,
        runtime: &DomainRuntime,
        enforce_dependents: bool,
    ) -> Result<(), LifecycleError> {
        let record = { self.registry.read().await.get(id)?.clone() };
        let state = self.observe(id, &record, runtime).await?;
        if !state.is_running() {
            return Err(LifecycleError::InvalidState {
                id,
                operation: "shutdown",
                state,
            });
        }
        if enforce_dependents {
            self.ensure_no_running_dependents(id).await?;
        }
        let Some(handle) = runtime.handle() else {
            return Err(LifecycleError::NotRunning { id });
        };

        // Graceful device detach is best effort: a device that cannot be
        // detached cleanly will be torn down with the domain anyway.
        for device in &record.exclusive_devices {
            if let Err(err) = self.collaborators.hypervisor.detach_device(handle, device).await {
                warn!(%id, device, error = %err, "graceful device detach failed, continuing");
            }
        }

        self.collaborators.hypervisor.request_shutdown(handle).await?;
        info!(%id, name = %record.name, "guest shutdown signaled");
        Ok(())
    }

    /// Forcefully destroy a domain's hypervisor object.
    ///
    /// # Errors
    ///
    /// - `NotRunning` when no hypervisor object exists
    /// - `StillReferenced` while running dependents exist
    /// - `Collaborator` if destruction fails; the domain is left in
    ///   whatever state the hypervisor reports
    pub async fn kill(&self, id: DomainId) -> Result<(), LifecycleError> {
        let runtime = self.runtime(id);
        let _transition = runtime.transition.lock().await;
        self.kill_locked(id, &runtime, true).await
    }

    async fn kill_locked(
        &self,
        id: DomainId,
        runtime: &DomainRuntime,
        enforce_dependents: bool,
    ) -> Result<(), LifecycleError> {
        let state = self.observe_loose(id).await?;
        if matches!(state, PowerState::Halted | PowerState::Undefined) {
            return Err(LifecycleError::NotRunning { id });
        }
        if enforce_dependents {
            self.ensure_no_running_dependents(id).await?;
        }
        let Some(handle) = runtime.handle() else {
            return Err(LifecycleError::NotRunning { id });
        };
        self.collaborators.hypervisor.destroy(handle).await?;
        if let Err(err) = self.collaborators.hypervisor.undefine(handle).await {
            warn!(%id, error = %err, "undefine after destroy failed");
        }
        runtime.set_handle(None);
        if let Err(err) = self.collaborators.admission.domain_stopped(id).await {
            debug!(%id, error = %err, "balancer notification failed");
        }
        info!(%id, "domain killed");
        Ok(())
    }

    /// Shut down a provider and its entire dependent closure,
    /// leaf-first. Each running dependent is signaled and then awaited
    /// (bounded) until halted before its own provider is touched.
    ///
    /// # Errors
    ///
    /// `Timeout` when a dependent does not halt within the teardown
    /// budget, plus any error [`Self::shutdown`] can produce.
    pub async fn shutdown_tree(&self, id: DomainId) -> Result<(), LifecycleError> {
        let closure = { self.registry.read().await.network_closure_of(id)? };
        // The closure is breadth-first from the root; reversed, leaves
        // come down before anything they depend on.
        for &dependent in closure.iter().rev() {
            let state = self.observe_loose(dependent).await?;
            if state.is_running() {
                let runtime = self.runtime(dependent);
                let _transition = runtime.transition.lock().await;
                self.shutdown_locked(dependent, &runtime, false).await?;
            }
            self.wait_halted(dependent).await?;
        }
        let runtime = self.runtime(id);
        let _transition = runtime.transition.lock().await;
        self.shutdown_locked(id, &runtime, false).await
    }

    /// Suspend a domain to memory.
    ///
    /// # Errors
    ///
    /// - `InvalidState` unless `Running`/`Paused`
    /// - `NotImplemented` when exclusive host devices are attached:
    ///   their state cannot be preserved across suspend
    /// - `Timeout` when the hypervisor does not confirm within budget
    pub async fn suspend(&self, id: DomainId) -> Result<(), LifecycleError> {
        let runtime = self.runtime(id);
        let _transition = runtime.transition.lock().await;

        let record = { self.registry.read().await.get(id)?.clone() };
        let state = self.observe(id, &record, &runtime).await?;
        if !matches!(state, PowerState::Running | PowerState::Paused) {
            return Err(LifecycleError::InvalidState {
                id,
                operation: "suspend",
                state,
            });
        }
        if !record.exclusive_devices.is_empty() {
            return Err(LifecycleError::NotImplemented {
                reason: format!(
                    "domain {} has exclusively bound host devices; their state cannot be preserved across suspend",
                    record.name
                ),
            });
        }
        let Some(handle) = runtime.handle() else {
            return Err(LifecycleError::NotRunning { id });
        };
        self.collaborators.hypervisor.suspend(handle).await?;

        let hypervisor = Arc::clone(&self.collaborators.hypervisor);
        self.settings
            .suspend
            .wait_until("suspend confirmation", move || {
                let hypervisor = Arc::clone(&hypervisor);
                async move {
                    Ok(hypervisor.query_state(handle).await?
                        == HypervisorDomainState::Suspended)
                }
            })
            .await?;
        info!(%id, "domain suspended");
        Ok(())
    }

    /// Wake a suspended domain.
    ///
    /// # Errors
    ///
    /// `InvalidState` when the hypervisor's suspend marker does not
    /// match (defense against acting on stale state), `NotRunning` when
    /// no hypervisor object exists.
    pub async fn resume(&self, id: DomainId) -> Result<(), LifecycleError> {
        let runtime = self.runtime(id);
        let _transition = runtime.transition.lock().await;

        let Some(handle) = runtime.handle() else {
            return Err(LifecycleError::NotRunning { id });
        };
        let hv_state = self.collaborators.hypervisor.query_state(handle).await?;
        if hv_state != HypervisorDomainState::Suspended {
            return Err(LifecycleError::InvalidState {
                id,
                operation: "resume",
                state: PowerState::from_hypervisor(hv_state, false),
            });
        }
        self.collaborators.hypervisor.resume(handle).await?;
        info!(%id, "domain resumed");
        Ok(())
    }

    /// Pause all of a running domain's vCPUs.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless `Running`.
    pub async fn pause(&self, id: DomainId) -> Result<(), LifecycleError> {
        let runtime = self.runtime(id);
        let _transition = runtime.transition.lock().await;

        let record = { self.registry.read().await.get(id)?.clone() };
        let state = self.observe(id, &record, &runtime).await?;
        if state != PowerState::Running {
            return Err(LifecycleError::InvalidState {
                id,
                operation: "pause",
                state,
            });
        }
        let Some(handle) = runtime.handle() else {
            return Err(LifecycleError::NotRunning { id });
        };
        self.collaborators.hypervisor.pause(handle).await?;
        Ok(())
    }

    /// Unpause a paused domain.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless `Paused`.
    pub async fn unpause(&self, id: DomainId) -> Result<(), LifecycleError> {
        let runtime = self.runtime(id);
        let _transition = runtime.transition.lock().await;

        let record = { self.registry.read().await.get(id)?.clone() };
        let state = self.observe(id, &record, &runtime).await?;
        if state != PowerState::Paused {
            return Err(LifecycleError::InvalidState {
                id,
                operation: "unpause",
                state,
            });
        }
        let Some(handle) = runtime.handle() else {
            return Err(LifecycleError::NotRunning { id });
        };
        self.collaborators.hypervisor.resume(handle).await?;
        Ok(())
    }

    /// The domain's observable state right now. Never blocks behind a
    /// transition in progress.
    ///
    /// # Errors
    ///
    /// `Registry(NotFound)` for an unknown domain, `Collaborator` when
    /// the hypervisor query fails.
    pub async fn current_state(&self, id: DomainId) -> Result<PowerState, LifecycleError> {
        let record = { self.registry.read().await.get(id)?.clone() };
        let runtime = self.runtime(id);
        self.observe(id, &record, &runtime).await
    }

    /// Observe state including daemon readiness (distinguishes
    /// `Running` from `Transient`).
    async fn observe(
        &self,
        id: DomainId,
        record: &DomainRecord,
        runtime: &DomainRuntime,
    ) -> Result<PowerState, LifecycleError> {
        let Some(handle) = runtime.handle() else {
            return Ok(PowerState::Undefined);
        };
        let hv_state = self.collaborators.hypervisor.query_state(handle).await?;
        if hv_state == HypervisorDomainState::Absent {
            // The object disappeared underneath us (completed shutdown,
            // external destroy). Drop the stale handle and stop
            // balancing the domain.
            debug!(%id, "hypervisor object gone, clearing handle");
            runtime.set_handle(None);
            if let Err(err) = self.collaborators.admission.domain_stopped(id).await {
                debug!(%id, error = %err, "balancer notification failed");
            }
            return Ok(PowerState::Halted);
        }
        let fully_ready = if hv_state == HypervisorDomainState::Running {
            self.daemons_ready(id, record).await
        } else {
            false
        };
        Ok(PowerState::from_hypervisor(hv_state, fully_ready))
    }

    /// Observe state without the daemon-readiness distinction: callers
    /// that only care whether the domain is up at all (dependent checks,
    /// teardown waits) do not need record data.
    async fn observe_loose(&self, id: DomainId) -> Result<PowerState, LifecycleError> {
        // Ensure the id is known before reporting a state for it.
        {
            let registry = self.registry.read().await;
            registry.get(id)?;
        }
        let runtime = self.runtime(id);
        let Some(handle) = runtime.handle() else {
            return Ok(PowerState::Undefined);
        };
        let hv_state = self.collaborators.hypervisor.query_state(handle).await?;
        if hv_state == HypervisorDomainState::Absent {
            runtime.set_handle(None);
            if let Err(err) = self.collaborators.admission.domain_stopped(id).await {
                debug!(%id, error = %err, "balancer notification failed");
            }
            return Ok(PowerState::Halted);
        }
        Ok(PowerState::from_hypervisor(hv_state, false))
    }

    async fn daemons_ready(&self, id: DomainId, record: &DomainRecord) -> bool {
        let command_ready = self
            .collaborators
            .command_daemon
            .is_ready(id)
            .await
            .unwrap_or(false);
        if !command_ready {
            return false;
        }
        if record.suppress_display_daemon {
            return true;
        }
        self.collaborators
            .display_daemon
            .is_ready(id)
            .await
            .unwrap_or(false)
    }

    async fn ensure_no_running_dependents(&self, id: DomainId) -> Result<(), LifecycleError> {
        let closure = { self.registry.read().await.network_closure_of(id)? };
        let mut running = Vec::new();
        for dependent in closure {
            let state = self.observe_loose(dependent).await?;
            if matches!(state, PowerState::Running | PowerState::Transient) {
                running.push(dependent);
            }
        }
        if running.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::StillReferenced { id, dependents: running })
        }
    }

    async fn wait_halted(&self, id: DomainId) -> Result<(), LifecycleError> {
        for attempt in 0..self.settings.teardown.attempts {
            let state = self.observe_loose(id).await?;
            if matches!(state, PowerState::Halted | PowerState::Undefined) {
                return Ok(());
            }
            if attempt + 1 < self.settings.teardown.attempts {
                tokio::time::sleep(self.settings.teardown.interval).await;
            }
        }
        Err(LifecycleError::Timeout {
            what: "dependent teardown",
            waited: self.settings.teardown.total_wait(),
        })
    }

    async fn publish_boot_config(&self, record: &DomainRecord) -> Result<(), LifecycleError> {
        let provider_name = match record.network_provider {
            Some(provider) => self.registry.read().await.get(provider)?.name.to_string(),
            None => "none".to_string(),
        };
        let config_store = &self.collaborators.config_store;
        let id = record.id;
        config_store.publish(id, "name", record.name.as_str()).await?;
        config_store.publish(id, "network/provider", &provider_name).await?;
        config_store.publish(id, "timezone", &self.settings.timezone).await?;
        config_store
            .publish(
                id,
                "features/display",
                if record.suppress_display_daemon { "0" } else { "1" },
            )
            .await?;
        Ok(())
    }

    /// Write the registry snapshot under the store's exclusive lock.
    /// No-op for controllers constructed without a store.
    async fn persist(&self) -> Result<(), LifecycleError> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        let snapshot = { self.registry.read().await.snapshot() };
        let result = tokio::task::spawn_blocking(move || {
            let lock = store.lock_exclusive()?;
            store.save_snapshot(&snapshot, &lock)
        })
        .await
        .map_err(|join_err| {
            StoreError::Io(std::io::Error::other(format!(
                "persist task failed: {join_err}"
            )))
        })?;
        result?;
        Ok(())
    }
}
