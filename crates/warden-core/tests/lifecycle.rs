//! Lifecycle controller integration tests against mock collaborators.
//!
//! The mocks share an ordered event log so tests can assert sequencing
//! (provider before dependent, reclaim before grant) and support
//! per-step failure injection so every rollback path is exercised.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use warden_core::collaborators::{
    CollaboratorError, ConfigStore, DomainLaunchConfig, HypervisorControl,
    HypervisorDomainState, ServiceDaemon, StorageBackend, VmHandle,
};
use warden_core::lifecycle::{
    Collaborators, LifecycleController, LifecycleError, LifecycleSettings, PollBudget, PowerState,
};
use warden_core::memory::AdmissionControl;
use warden_core::registry::store::RegistryStore;
use warden_core::registry::{
    DomainId, DomainKind, DomainName, DomainRegistry, DomainSpec,
};

type EventLog = Arc<Mutex<Vec<String>>>;

fn log(events: &EventLog, entry: impl Into<String>) {
    events.lock().unwrap().push(entry.into());
}

#[derive(Default)]
struct MockStorage {
    events: EventLog,
    failing: Mutex<HashSet<&'static str>>,
}

impl MockStorage {
    fn fail_on(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    fn check(&self, op: &'static str) -> Result<(), CollaboratorError> {
        if self.failing.lock().unwrap().contains(op) {
            Err(CollaboratorError::storage(format!("injected {op} failure")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageBackend for MockStorage {
    async fn verify_images(&self, id: DomainId) -> Result<(), CollaboratorError> {
        log(&self.events, format!("storage.verify:{id}"));
        self.check("verify_images")
    }

    async fn prepare_for_startup(&self, id: DomainId) -> Result<(), CollaboratorError> {
        log(&self.events, format!("storage.prepare:{id}"));
        self.check("prepare_for_startup")
    }

    async fn create_on_disk(
        &self,
        id: DomainId,
        source_template: Option<DomainId>,
    ) -> Result<(), CollaboratorError> {
        let template = source_template.map_or_else(|| "none".to_string(), |t| t.to_string());
        log(&self.events, format!("storage.create:{id}:{template}"));
        self.check("create_on_disk")
    }

    async fn clone_disk_files(
        &self,
        id: DomainId,
        src: DomainId,
    ) -> Result<(), CollaboratorError> {
        log(&self.events, format!("storage.clone:{id}:{src}"));
        self.check("clone_disk_files")
    }

    async fn resize(
        &self,
        _id: DomainId,
        _volume: &str,
        _new_size: u64,
    ) -> Result<(), CollaboratorError> {
        self.check("resize")
    }

    async fn remove_from_disk(&self, id: DomainId) -> Result<(), CollaboratorError> {
        log(&self.events, format!("storage.remove:{id}"));
        self.check("remove_from_disk")
    }

    async fn is_outdated(&self, _id: DomainId) -> Result<bool, CollaboratorError> {
        Ok(false)
    }
}

#[derive(Default)]
struct HvInner {
    next_handle: u64,
    domains: HashMap<VmHandle, HypervisorDomainState>,
    handle_ids: HashMap<VmHandle, DomainId>,
}

struct MockHypervisor {
    events: EventLog,
    inner: Mutex<HvInner>,
    failing: Mutex<HashSet<&'static str>>,
    /// Whether a shutdown signal completes immediately (object gone).
    graceful_completes: AtomicBool,
}

impl MockHypervisor {
    fn new(events: EventLog) -> Self {
        Self {
            events,
            inner: Mutex::new(HvInner::default()),
            failing: Mutex::new(HashSet::new()),
            graceful_completes: AtomicBool::new(true),
        }
    }

    fn fail_on(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    fn check(&self, op: &'static str) -> Result<(), CollaboratorError> {
        if self.failing.lock().unwrap().contains(op) {
            Err(CollaboratorError::hypervisor(format!(
                "injected {op} failure"
            )))
        } else {
            Ok(())
        }
    }

    fn live_objects(&self) -> usize {
        self.inner.lock().unwrap().domains.len()
    }

    fn id_of(&self, handle: VmHandle) -> String {
        self.inner
            .lock()
            .unwrap()
            .handle_ids
            .get(&handle)
            .map_or_else(|| handle.to_string(), ToString::to_string)
    }
}

#[async_trait]
impl HypervisorControl for MockHypervisor {
    async fn define(&self, config: &DomainLaunchConfig) -> Result<VmHandle, CollaboratorError> {
        log(&self.events, format!("hv.define:{}", config.id));
        self.check("define")?;
        let mut inner = self.inner.lock().unwrap();
        inner.next_handle += 1;
        let handle = VmHandle(inner.next_handle);
        inner.domains.insert(handle, HypervisorDomainState::Paused);
        inner.handle_ids.insert(handle, config.id);
        Ok(handle)
    }

    async fn undefine(&self, handle: VmHandle) -> Result<(), CollaboratorError> {
        log(&self.events, format!("hv.undefine:{}", self.id_of(handle)));
        self.check("undefine")?;
        self.inner.lock().unwrap().domains.remove(&handle);
        Ok(())
    }

    async fn start_paused(&self, handle: VmHandle) -> Result<(), CollaboratorError> {
        log(
            &self.events,
            format!("hv.start_paused:{}", self.id_of(handle)),
        );
        self.check("start_paused")
    }

    async fn resume(&self, handle: VmHandle) -> Result<(), CollaboratorError> {
        log(&self.events, format!("hv.resume:{}", self.id_of(handle)));
        self.check("resume")?;
        self.inner
            .lock()
            .unwrap()
            .domains
            .insert(handle, HypervisorDomainState::Running);
        Ok(())
    }

    async fn pause(&self, handle: VmHandle) -> Result<(), CollaboratorError> {
        self.check("pause")?;
        self.inner
            .lock()
            .unwrap()
            .domains
            .insert(handle, HypervisorDomainState::Paused);
        Ok(())
    }

    async fn suspend(&self, handle: VmHandle) -> Result<(), CollaboratorError> {
        self.check("suspend")?;
        self.inner
            .lock()
            .unwrap()
            .domains
            .insert(handle, HypervisorDomainState::Suspended);
        Ok(())
    }

    async fn request_shutdown(&self, handle: VmHandle) -> Result<(), CollaboratorError> {
        log(&self.events, format!("hv.shutdown:{}", self.id_of(handle)));
        self.check("request_shutdown")?;
        let mut inner = self.inner.lock().unwrap();
        if self.graceful_completes.load(Ordering::SeqCst) {
            inner.domains.remove(&handle);
        } else {
            inner
                .domains
                .insert(handle, HypervisorDomainState::ShuttingDown);
        }
        Ok(())
    }

    async fn destroy(&self, handle: VmHandle) -> Result<(), CollaboratorError> {
        log(&self.events, format!("hv.destroy:{}", self.id_of(handle)));
        self.check("destroy")?;
        self.inner.lock().unwrap().domains.remove(&handle);
        Ok(())
    }

    async fn query_state(
        &self,
        handle: VmHandle,
    ) -> Result<HypervisorDomainState, CollaboratorError> {
        self.check("query_state")?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .domains
            .get(&handle)
            .copied()
            .unwrap_or(HypervisorDomainState::Absent))
    }

    async fn bind_device(
        &self,
        handle: VmHandle,
        device: &str,
    ) -> Result<(), CollaboratorError> {
        log(
            &self.events,
            format!("hv.bind:{}:{device}", self.id_of(handle)),
        );
        self.check("bind_device")
    }

    async fn detach_device(
        &self,
        handle: VmHandle,
        device: &str,
    ) -> Result<(), CollaboratorError> {
        log(
            &self.events,
            format!("hv.detach:{}:{device}", self.id_of(handle)),
        );
        self.check("detach_device")
    }

    async fn free_host_memory(&self) -> Result<u64, CollaboratorError> {
        Ok(u64::MAX / 2)
    }

    async fn domain_memory(&self, _handle: VmHandle) -> Result<u64, CollaboratorError> {
        Ok(0)
    }

    async fn set_memory_target(
        &self,
        _handle: VmHandle,
        _bytes: u64,
    ) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

#[derive(Default)]
struct MockConfigStore {
    events: EventLog,
    published: Mutex<Vec<(DomainId, String, String)>>,
    fail: AtomicBool,
}

#[async_trait]
impl ConfigStore for MockConfigStore {
    async fn publish(
        &self,
        id: DomainId,
        key: &str,
        value: &str,
    ) -> Result<(), CollaboratorError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError::config_store("injected publish failure"));
        }
        log(&self.events, format!("config.publish:{id}:{key}"));
        self.published
            .lock()
            .unwrap()
            .push((id, key.to_string(), value.to_string()));
        Ok(())
    }
}

struct MockDaemon {
    events: EventLog,
    label: &'static str,
    fail_start: AtomicBool,
    /// Number of readiness probes that answer `false` before `true`.
    not_ready_probes: AtomicU32,
    started: Mutex<HashSet<DomainId>>,
}

impl MockDaemon {
    fn new(events: EventLog, label: &'static str) -> Self {
        Self {
            events,
            label,
            fail_start: AtomicBool::new(false),
            not_ready_probes: AtomicU32::new(0),
            started: Mutex::new(HashSet::new()),
        }
    }

    fn never_ready(&self) {
        self.not_ready_probes.store(u32::MAX, Ordering::SeqCst);
    }
}

#[async_trait]
impl ServiceDaemon for MockDaemon {
    async fn start(&self, id: DomainId) -> Result<(), CollaboratorError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(CollaboratorError::new(
                warden_core::collaborators::Subsystem::CommandDaemon,
                "injected daemon start failure",
            ));
        }
        log(&self.events, format!("{}.start:{id}", self.label));
        self.started.lock().unwrap().insert(id);
        Ok(())
    }

    async fn is_ready(&self, id: DomainId) -> Result<bool, CollaboratorError> {
        if !self.started.lock().unwrap().contains(&id) {
            return Ok(false);
        }
        let remaining = self.not_ready_probes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.not_ready_probes
                .store(remaining.saturating_sub(1), Ordering::SeqCst);
            return Ok(false);
        }
        Ok(true)
    }
}

struct MockAdmission {
    events: EventLog,
    grant: AtomicBool,
    started: Mutex<Vec<DomainId>>,
    stopped: Mutex<Vec<DomainId>>,
}

impl MockAdmission {
    fn new(events: EventLog) -> Self {
        Self {
            events,
            grant: AtomicBool::new(true),
            started: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AdmissionControl for MockAdmission {
    async fn request_memory(&self, bytes: u64) -> Result<bool, CollaboratorError> {
        log(&self.events, format!("admission.request:{bytes}"));
        Ok(self.grant.load(Ordering::SeqCst))
    }

    async fn domain_started(
        &self,
        id: DomainId,
        _handle: VmHandle,
        _memory_actual: u64,
        _memory_maximum: u64,
    ) -> Result<(), CollaboratorError> {
        self.started.lock().unwrap().push(id);
        Ok(())
    }

    async fn domain_stopped(&self, id: DomainId) -> Result<(), CollaboratorError> {
        self.stopped.lock().unwrap().push(id);
        Ok(())
    }
}

struct Harness {
    registry: Arc<RwLock<DomainRegistry>>,
    storage: Arc<MockStorage>,
    hypervisor: Arc<MockHypervisor>,
    config_store: Arc<MockConfigStore>,
    command: Arc<MockDaemon>,
    display: Arc<MockDaemon>,
    admission: Arc<MockAdmission>,
    controller: LifecycleController,
    events: EventLog,
}

fn fast_settings() -> LifecycleSettings {
    LifecycleSettings {
        readiness: PollBudget::new(5, Duration::from_millis(1)),
        suspend: PollBudget::new(5, Duration::from_millis(1)),
        teardown: PollBudget::new(5, Duration::from_millis(1)),
        timezone: "UTC".to_string(),
    }
}

impl Harness {
    fn new() -> Self {
        Self::with_store(None)
    }

    fn with_store(store: Option<RegistryStore>) -> Self {
        let events: EventLog = Arc::default();
        let registry = Arc::new(RwLock::new(DomainRegistry::new()));
        let storage = Arc::new(MockStorage {
            events: Arc::clone(&events),
            ..MockStorage::default()
        });
        let hypervisor = Arc::new(MockHypervisor::new(Arc::clone(&events)));
        let config_store = Arc::new(MockConfigStore {
            events: Arc::clone(&events),
            ..MockConfigStore::default()
        });
        let command = Arc::new(MockDaemon::new(Arc::clone(&events), "command"));
        let display = Arc::new(MockDaemon::new(Arc::clone(&events), "display"));
        let admission = Arc::new(MockAdmission::new(Arc::clone(&events)));
        let collaborators = Collaborators {
            storage: Arc::clone(&storage) as _,
            hypervisor: Arc::clone(&hypervisor) as _,
            config_store: Arc::clone(&config_store) as _,
            command_daemon: Arc::clone(&command) as _,
            display_daemon: Arc::clone(&display) as _,
            admission: Arc::clone(&admission) as _,
        };
        let controller = match store {
            Some(store) => LifecycleController::with_store(
                Arc::clone(&registry),
                store,
                collaborators,
                fast_settings(),
            ),
            None => {
                LifecycleController::new(Arc::clone(&registry), collaborators, fast_settings())
            }
        };
        Self {
            registry,
            storage,
            hypervisor,
            config_store,
            command,
            display,
            admission,
            controller,
            events,
        }
    }

    async fn add(&self, spec: DomainSpec) -> DomainId {
        self.registry.write().await.add(spec).unwrap()
    }

    fn event_position(&self, needle: &str) -> usize {
        let events = self.events.lock().unwrap();
        events
            .iter()
            .position(|e| e == needle)
            .unwrap_or_else(|| panic!("event {needle:?} not found in {events:?}"))
    }
}

fn name(s: &str) -> DomainName {
    DomainName::new(s).unwrap()
}

fn app(n: &str) -> DomainSpec {
    DomainSpec::new(name(n), DomainKind::Application).without_display_daemon()
}

fn app_with_display(n: &str) -> DomainSpec {
    DomainSpec::new(name(n), DomainKind::Application)
}

fn net(n: &str) -> DomainSpec {
    DomainSpec::new(name(n), DomainKind::NetworkProvider).without_display_daemon()
}

#[tokio::test]
async fn start_reaches_running() {
    let harness = Harness::new();
    let id = harness.add(app_with_display("work")).await;

    harness.controller.start(id).await.unwrap();
    assert_eq!(
        harness.controller.current_state(id).await.unwrap(),
        PowerState::Running
    );
    assert_eq!(harness.admission.started.lock().unwrap().as_slice(), &[id]);

    // steps ran in the documented order
    let verify = harness.event_position(&format!("storage.verify:{id}"));
    let prepare = harness.event_position(&format!("storage.prepare:{id}"));
    let define = harness.event_position(&format!("hv.define:{id}"));
    let resume = harness.event_position(&format!("hv.resume:{id}"));
    let command = harness.event_position(&format!("command.start:{id}"));
    let display = harness.event_position(&format!("display.start:{id}"));
    assert!(verify < prepare && prepare < define && define < resume);
    assert!(resume < command && command < display);
}

#[tokio::test]
async fn start_while_running_is_invalid_state() {
    let harness = Harness::new();
    let id = harness.add(app("work")).await;
    harness.controller.start(id).await.unwrap();

    let err = harness.controller.start(id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidState { .. }), "{err}");
    // still running, nothing rolled back
    assert_eq!(
        harness.controller.current_state(id).await.unwrap(),
        PowerState::Running
    );
}

#[tokio::test]
async fn start_unknown_domain_is_not_found() {
    let harness = Harness::new();
    let err = harness.controller.start(DomainId(99)).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Registry(_)), "{err}");
}

#[tokio::test]
async fn admission_denial_aborts_start() {
    let harness = Harness::new();
    let id = harness.add(app("work")).await;
    harness.admission.grant.store(false, Ordering::SeqCst);

    let err = harness.controller.start(id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::InsufficientMemory { .. }), "{err}");
    assert_eq!(
        harness.controller.current_state(id).await.unwrap(),
        PowerState::Undefined
    );
    // admission denial happens before any hypervisor object exists
    assert_eq!(harness.hypervisor.live_objects(), 0);
}

#[tokio::test]
async fn admission_request_includes_overhead() {
    let harness = Harness::new();
    let id = harness
        .add(app("work").with_memory(400 << 20, 4 << 30).with_vcpus(2))
        .await;
    harness.controller.start(id).await.unwrap();

    let expected = (400 << 20) + 4 * 1024 * 1024 + 2 * (3 * 1024 * 1024 / 2);
    harness.event_position(&format!("admission.request:{expected}"));
}

#[tokio::test]
async fn every_start_step_failure_rolls_back_to_halted() {
    // storage failures: nothing was created yet
    for op in ["verify_images", "prepare_for_startup"] {
        let harness = Harness::new();
        let id = harness.add(app("work")).await;
        harness.storage.fail_on(op);
        let err = harness.controller.start(id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Collaborator(_)), "{op}: {err}");
        assert_eq!(
            harness.controller.current_state(id).await.unwrap(),
            PowerState::Undefined,
            "after {op} failure"
        );
        assert_eq!(harness.hypervisor.live_objects(), 0, "after {op} failure");
    }

    // hypervisor failures after define: object torn down again
    for op in ["start_paused", "bind_device", "resume"] {
        let harness = Harness::new();
        let id = harness
            .add(app("work").with_exclusive_device("pci:00:14.0"))
            .await;
        harness.hypervisor.fail_on(op);
        let err = harness.controller.start(id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Collaborator(_)), "{op}: {err}");
        assert_eq!(
            harness.controller.current_state(id).await.unwrap(),
            PowerState::Undefined,
            "after {op} failure"
        );
        assert_eq!(harness.hypervisor.live_objects(), 0, "after {op} failure");
    }

    // define failure itself
    let harness = Harness::new();
    let id = harness.add(app("work")).await;
    harness.hypervisor.fail_on("define");
    let err = harness.controller.start(id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Collaborator(_)), "{err}");
    assert_eq!(harness.hypervisor.live_objects(), 0);

    // config publication failure
    let harness = Harness::new();
    let id = harness.add(app("work")).await;
    harness.config_store.fail.store(true, Ordering::SeqCst);
    let err = harness.controller.start(id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Collaborator(_)), "{err}");
    assert_eq!(harness.hypervisor.live_objects(), 0);
    assert_eq!(
        harness.controller.current_state(id).await.unwrap(),
        PowerState::Undefined
    );
}

#[tokio::test]
async fn daemon_readiness_timeout_rolls_back() {
    let harness = Harness::new();
    let id = harness.add(app("work")).await;
    harness.command.never_ready();

    let err = harness.controller.start(id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Timeout { .. }), "{err}");
    assert_eq!(
        harness.controller.current_state(id).await.unwrap(),
        PowerState::Undefined
    );
    assert_eq!(harness.hypervisor.live_objects(), 0);
    // the balancer was told about the short-lived domain both ways
    assert_eq!(harness.admission.stopped.lock().unwrap().as_slice(), &[id]);
}

#[tokio::test]
async fn display_daemon_timeout_rolls_back_unless_suppressed() {
    let harness = Harness::new();
    let id = harness.add(app_with_display("work")).await;
    harness.display.never_ready();
    let err = harness.controller.start(id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Timeout { .. }), "{err}");
    assert_eq!(harness.hypervisor.live_objects(), 0);

    // same domain with the display daemon suppressed starts fine
    let harness = Harness::new();
    let id = harness.add(app("headless")).await;
    harness.display.never_ready();
    harness.controller.start(id).await.unwrap();
    assert_eq!(
        harness.controller.current_state(id).await.unwrap(),
        PowerState::Running
    );
}

#[tokio::test]
async fn provider_chain_starts_root_first() {
    let harness = Harness::new();
    let provider = harness.add(net("sys-net")).await;
    let dependent = harness.add(app("work").with_network_provider(provider)).await;

    harness.controller.start(dependent).await.unwrap();

    assert_eq!(
        harness.controller.current_state(provider).await.unwrap(),
        PowerState::Running
    );
    // the provider is fully running before the dependent publishes its
    // network attachment
    let provider_resume = harness.event_position(&format!("hv.resume:{provider}"));
    let provider_ready = harness.event_position(&format!("command.start:{provider}"));
    let dependent_attach =
        harness.event_position(&format!("config.publish:{dependent}:network/provider"));
    assert!(provider_resume < dependent_attach);
    assert!(provider_ready < dependent_attach);

    // the dependent sees the provider's name in its boot config
    let published = harness.config_store.published.lock().unwrap();
    assert!(published.iter().any(|(id, key, value)| {
        *id == dependent && key == "network/provider" && value == "sys-net"
    }));
}

#[tokio::test]
async fn provider_failure_propagates_to_dependent() {
    let harness = Harness::new();
    let provider = harness.add(net("sys-net")).await;
    let dependent = harness.add(app("work").with_network_provider(provider)).await;
    harness.hypervisor.fail_on("resume");

    let err = harness.controller.start(dependent).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Collaborator(_)), "{err}");
    // neither domain is left partially started
    assert_eq!(harness.hypervisor.live_objects(), 0);
    assert_eq!(
        harness.controller.current_state(provider).await.unwrap(),
        PowerState::Undefined
    );
    assert_eq!(
        harness.controller.current_state(dependent).await.unwrap(),
        PowerState::Undefined
    );
}

#[tokio::test]
async fn admin_provider_is_not_recursively_started() {
    let harness = Harness::new();
    let id = harness
        .add(app("work").with_network_provider(warden_core::registry::ADMIN_DOMAIN_ID))
        .await;
    harness.controller.start(id).await.unwrap();
    assert_eq!(
        harness.controller.current_state(id).await.unwrap(),
        PowerState::Running
    );
}

#[tokio::test]
async fn shutdown_refused_with_running_dependents() {
    let harness = Harness::new();
    let provider = harness.add(net("sys-net")).await;
    let dependent = harness.add(app("work").with_network_provider(provider)).await;
    harness.controller.start(dependent).await.unwrap();

    let err = harness.controller.shutdown(provider).await.unwrap_err();
    match err {
        LifecycleError::StillReferenced { dependents, .. } => {
            assert_eq!(dependents, vec![dependent]);
        }
        other => panic!("expected StillReferenced, got {other}"),
    }
    let err = harness.controller.kill(provider).await.unwrap_err();
    assert!(matches!(err, LifecycleError::StillReferenced { .. }), "{err}");
}

#[tokio::test]
async fn shutdown_tree_stops_leaves_first() {
    let harness = Harness::new();
    let provider = harness.add(net("sys-net")).await;
    let dependent = harness.add(app("work").with_network_provider(provider)).await;
    harness.controller.start(dependent).await.unwrap();

    harness.controller.shutdown_tree(provider).await.unwrap();

    let dep_shutdown = harness.event_position(&format!("hv.shutdown:{dependent}"));
    let provider_shutdown = harness.event_position(&format!("hv.shutdown:{provider}"));
    assert!(dep_shutdown < provider_shutdown);
    // both are down (Halted and Undefined are equivalent here)
    assert!(harness
        .controller
        .current_state(provider)
        .await
        .unwrap()
        .can_start());
    assert!(harness
        .controller
        .current_state(dependent)
        .await
        .unwrap()
        .can_start());
}

#[tokio::test]
async fn shutdown_detaches_devices_best_effort() {
    let harness = Harness::new();
    let id = harness
        .add(app("work").with_exclusive_device("pci:00:14.0"))
        .await;
    harness.controller.start(id).await.unwrap();
    // detach failure must not abort the shutdown
    harness.hypervisor.fail_on("detach_device");

    harness.controller.shutdown(id).await.unwrap();
    assert_eq!(
        harness.controller.current_state(id).await.unwrap(),
        PowerState::Halted
    );
}

#[tokio::test]
async fn shutdown_from_halted_is_invalid() {
    let harness = Harness::new();
    let id = harness.add(app("work")).await;
    let err = harness.controller.shutdown(id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidState { .. }), "{err}");
}

#[tokio::test]
async fn kill_destroys_and_untracks() {
    let harness = Harness::new();
    let id = harness.add(app("work")).await;
    harness.controller.start(id).await.unwrap();

    harness.controller.kill(id).await.unwrap();
    assert_eq!(
        harness.controller.current_state(id).await.unwrap(),
        PowerState::Undefined
    );
    assert_eq!(harness.hypervisor.live_objects(), 0);
    assert_eq!(harness.admission.stopped.lock().unwrap().as_slice(), &[id]);
}

#[tokio::test]
async fn kill_when_halted_is_not_running() {
    let harness = Harness::new();
    let id = harness.add(app("work")).await;
    let err = harness.controller.kill(id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::NotRunning { .. }), "{err}");
}

#[tokio::test]
async fn pause_and_unpause_round_trip() {
    let harness = Harness::new();
    let id = harness.add(app("work")).await;
    harness.controller.start(id).await.unwrap();

    harness.controller.pause(id).await.unwrap();
    assert_eq!(
        harness.controller.current_state(id).await.unwrap(),
        PowerState::Paused
    );
    // pausing twice is invalid
    let err = harness.controller.pause(id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidState { .. }), "{err}");

    harness.controller.unpause(id).await.unwrap();
    assert_eq!(
        harness.controller.current_state(id).await.unwrap(),
        PowerState::Running
    );
}

#[tokio::test]
async fn suspend_refused_with_exclusive_devices() {
    let harness = Harness::new();
    let id = harness
        .add(app("work").with_exclusive_device("pci:00:14.0"))
        .await;
    harness.controller.start(id).await.unwrap();

    let err = harness.controller.suspend(id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::NotImplemented { .. }), "{err}");
    // nothing changed
    assert_eq!(
        harness.controller.current_state(id).await.unwrap(),
        PowerState::Running
    );
}

#[tokio::test]
async fn suspend_and_resume_round_trip() {
    let harness = Harness::new();
    let id = harness.add(app("work")).await;
    harness.controller.start(id).await.unwrap();

    harness.controller.suspend(id).await.unwrap();
    assert_eq!(
        harness.controller.current_state(id).await.unwrap(),
        PowerState::Suspended
    );

    harness.controller.resume(id).await.unwrap();
    assert_eq!(
        harness.controller.current_state(id).await.unwrap(),
        PowerState::Running
    );
}

#[tokio::test]
async fn resume_without_suspend_marker_is_invalid() {
    let harness = Harness::new();
    let id = harness.add(app("work")).await;
    harness.controller.start(id).await.unwrap();

    let err = harness.controller.resume(id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidState { .. }), "{err}");
}

#[tokio::test]
async fn rename_requires_halted() {
    let harness = Harness::new();
    let id = harness.add(app("work")).await;
    harness.controller.start(id).await.unwrap();

    let err = harness
        .controller
        .rename(id, name("renamed"))
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidState { .. }), "{err}");

    harness.controller.kill(id).await.unwrap();
    harness.controller.rename(id, name("renamed")).await.unwrap();
    assert_eq!(
        harness.registry.read().await.get(id).unwrap().name.as_str(),
        "renamed"
    );
}

#[tokio::test]
async fn define_domain_creates_storage_and_fills_defaults() {
    let harness = Harness::new();
    let tpl = harness
        .add(DomainSpec::new(name("tpl"), DomainKind::Template))
        .await;

    let id = harness
        .controller
        .define_domain(DomainSpec::new(name("work"), DomainKind::Application))
        .await
        .unwrap();
    let record = harness.registry.read().await.get(id).unwrap().clone();
    // unset template was filled from the registry's default-template role
    assert_eq!(record.template, Some(tpl));
    harness.event_position(&format!("storage.create:{id}:{tpl}"));
}

#[tokio::test]
async fn define_domain_rolls_back_record_on_storage_failure() {
    let harness = Harness::new();
    harness.storage.fail_on("create_on_disk");

    let err = harness
        .controller
        .define_domain(DomainSpec::new(name("work"), DomainKind::Application))
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Collaborator(_)), "{err}");
    assert!(harness.registry.read().await.get_by_name("work").is_err());
}

#[tokio::test]
async fn clone_domain_copies_record_and_disk() {
    let harness = Harness::new();
    let src = harness
        .controller
        .define_domain(app("work").with_memory(512 << 20, 2 << 30))
        .await
        .unwrap();

    let id = harness
        .controller
        .clone_domain(src, name("work-copy"))
        .await
        .unwrap();
    let record = harness.registry.read().await.get(id).unwrap().clone();
    assert_eq!(record.memory_target, 512 << 20);
    assert_eq!(record.name.as_str(), "work-copy");
    harness.event_position(&format!("storage.clone:{id}:{src}"));
}

#[tokio::test]
async fn remove_domain_requires_halted_and_clears_disk() {
    let harness = Harness::new();
    let id = harness
        .controller
        .define_domain(app("work"))
        .await
        .unwrap();
    harness.controller.start(id).await.unwrap();

    let err = harness.controller.remove_domain(id).await.unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidState { .. }), "{err}");

    harness.controller.kill(id).await.unwrap();
    harness.controller.remove_domain(id).await.unwrap();
    assert!(harness.registry.read().await.get(id).is_err());
    harness.event_position(&format!("storage.remove:{id}"));
}

#[tokio::test]
async fn set_network_provider_live_requires_running_provider() {
    let harness = Harness::new();
    let provider = harness.add(net("sys-net")).await;
    let standby = harness.add(net("sys-net2")).await;
    let id = harness.add(app("work").with_network_provider(provider)).await;
    harness.controller.start(id).await.unwrap();

    // re-pointing a running domain at a halted provider is refused
    let err = harness
        .controller
        .set_network_provider(id, Some(standby))
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::InvalidState { .. }), "{err}");

    // once the standby provider runs, the switch goes through and the
    // boot config is republished
    harness.controller.start(standby).await.unwrap();
    harness
        .controller
        .set_network_provider(id, Some(standby))
        .await
        .unwrap();
    let published = harness.config_store.published.lock().unwrap();
    assert!(published
        .iter()
        .any(|(pid, key, value)| *pid == id && key == "network/provider" && value == "sys-net2"));
}

#[tokio::test]
async fn unrelated_domains_start_concurrently() {
    let harness = Arc::new(Harness::new());
    let a = harness.add(app("a")).await;
    let b = harness.add(app("b")).await;

    let ha = Arc::clone(&harness);
    let hb = Arc::clone(&harness);
    let (ra, rb) = tokio::join!(ha.controller.start(a), hb.controller.start(b));
    ra.unwrap();
    rb.unwrap();
    assert_eq!(
        harness.controller.current_state(a).await.unwrap(),
        PowerState::Running
    );
    assert_eq!(
        harness.controller.current_state(b).await.unwrap(),
        PowerState::Running
    );
}

#[tokio::test]
async fn mutations_persist_through_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = RegistryStore::new(dir.path().join("domains.json"));
    let harness = Harness::with_store(Some(store.clone()));

    let id = harness
        .controller
        .define_domain(app("work"))
        .await
        .unwrap();
    harness.controller.rename(id, name("renamed")).await.unwrap();

    let lock = store.lock_shared().unwrap();
    let reloaded = store.load(&lock).unwrap();
    assert_eq!(reloaded.get(id).unwrap().name.as_str(), "renamed");
}
