//! The memory balancing loop.
//!
//! One task owns the per-domain [`DomainMemoryState`] map; everyone else
//! talks to it through [`BalancerHandle`] messages. Running domains push
//! raw telemetry, the lifecycle controller announces starts/stops and
//! requests admission, and a periodic tick recomputes balloon targets
//! for the whole system.
//!
//! Admission follows the classic client/server flow: if free host
//! memory already covers the request it is granted immediately;
//! otherwise donor targets from
//! [`admission_check`](warden_core::memory::admission_check) are applied
//! and free memory is polled under a bounded budget, with donors that
//! make no observable progress flagged and excluded from subsequent
//! passes. Budget exhaustion is a denial, never a hang.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use warden_core::collaborators::{CollaboratorError, HypervisorControl, VmHandle};
use warden_core::lifecycle::PollBudget;
use warden_core::memory::{
    admission_check, rebalance, AdmissionControl, BalancerConfig, BalloonRequest,
    DomainMemoryState,
};
use warden_core::registry::DomainId;

/// Capacity of the command channel; telemetry producers are shed rather
/// than buffered without bound.
const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Messages understood by the balancing loop.
#[derive(Debug)]
enum BalancerCommand {
    /// Raw telemetry pushed by a running domain. Untrusted; sanitized
    /// by the loop.
    Telemetry { id: DomainId, raw: String },
    /// A domain started and should be tracked.
    DomainStarted {
        id: DomainId,
        handle: VmHandle,
        memory_actual: u64,
        memory_maximum: u64,
    },
    /// A domain is gone.
    DomainStopped { id: DomainId },
    /// Admission request: make `bytes` of host memory available.
    RequestMemory {
        bytes: u64,
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable handle submitting work to the balancing loop.
#[derive(Debug, Clone)]
pub struct BalancerHandle {
    tx: mpsc::Sender<BalancerCommand>,
}

impl BalancerHandle {
    /// Push a raw telemetry report for a domain. Drops the report (with
    /// a log line) when the loop is saturated; telemetry is periodic and
    /// the next report supersedes this one anyway.
    pub fn submit_telemetry(&self, id: DomainId, raw: String) {
        if let Err(err) = self.tx.try_send(BalancerCommand::Telemetry { id, raw }) {
            debug!(%id, error = %err, "telemetry report dropped");
        }
    }
}

#[async_trait]
impl AdmissionControl for BalancerHandle {
    async fn request_memory(&self, bytes: u64) -> Result<bool, CollaboratorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BalancerCommand::RequestMemory { bytes, reply })
            .await
            .map_err(|_| CollaboratorError::balancer("balancing loop unavailable"))?;
        rx.await
            .map_err(|_| CollaboratorError::balancer("balancing loop dropped the request"))
    }

    async fn domain_started(
        &self,
        id: DomainId,
        handle: VmHandle,
        memory_actual: u64,
        memory_maximum: u64,
    ) -> Result<(), CollaboratorError> {
        self.tx
            .send(BalancerCommand::DomainStarted {
                id,
                handle,
                memory_actual,
                memory_maximum,
            })
            .await
            .map_err(|_| CollaboratorError::balancer("balancing loop unavailable"))
    }

    async fn domain_stopped(&self, id: DomainId) -> Result<(), CollaboratorError> {
        self.tx
            .send(BalancerCommand::DomainStopped { id })
            .await
            .map_err(|_| CollaboratorError::balancer("balancing loop unavailable"))
    }
}

/// The last balloon request issued to a domain, kept to detect domains
/// that ignore shrink requests.
#[derive(Debug, Clone, Copy)]
struct LastRequest {
    target: u64,
    actual_at_request: u64,
}

#[derive(Debug)]
struct TrackedDomain {
    handle: VmHandle,
    state: DomainMemoryState,
    last_request: Option<LastRequest>,
}

/// The balancing loop task.
pub struct MemoryBalancer {
    hypervisor: Arc<dyn HypervisorControl>,
    config: BalancerConfig,
    admission_budget: PollBudget,
    balance_interval: Duration,
    rx: mpsc::Receiver<BalancerCommand>,
    domains: HashMap<DomainId, TrackedDomain>,
}

impl MemoryBalancer {
    /// Spawn the loop, returning the handle everyone else uses.
    #[must_use]
    pub fn spawn(
        hypervisor: Arc<dyn HypervisorControl>,
        config: BalancerConfig,
        admission_budget: PollBudget,
        balance_interval: Duration,
    ) -> (BalancerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let balancer = Self {
            hypervisor,
            config,
            admission_budget,
            balance_interval,
            rx,
            domains: HashMap::new(),
        };
        let task = tokio::spawn(balancer.run());
        (BalancerHandle { tx }, task)
    }

    async fn run(mut self) {
        info!(interval = ?self.balance_interval, "memory balancing loop started");
        let mut ticker = tokio::time::interval(self.balance_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    self.handle_command(command).await;
                }
                _ = ticker.tick() => {
                    self.balance_once().await;
                }
            }
        }
        info!("memory balancing loop stopped");
    }

    async fn handle_command(&mut self, command: BalancerCommand) {
        match command {
            BalancerCommand::Telemetry { id, raw } => {
                if let Some(tracked) = self.domains.get_mut(&id) {
                    tracked.state.refresh_telemetry(&raw);
                } else {
                    debug!(%id, "telemetry for untracked domain ignored");
                }
            }
            BalancerCommand::DomainStarted {
                id,
                handle,
                memory_actual,
                memory_maximum,
            } => {
                debug!(%id, %handle, "tracking domain");
                self.domains.insert(
                    id,
                    TrackedDomain {
                        handle,
                        state: DomainMemoryState::new(id, memory_actual, memory_maximum),
                        last_request: None,
                    },
                );
            }
            BalancerCommand::DomainStopped { id } => {
                debug!(%id, "untracking domain");
                self.domains.remove(&id);
            }
            BalancerCommand::RequestMemory { bytes, reply } => {
                let granted = self.handle_admission(bytes).await;
                // The requester may have given up; nothing to do then.
                let _ = reply.send(granted);
            }
        }
    }

    /// Refresh `memory_actual` from the hypervisor and update
    /// no-progress flags: a domain that was asked to shrink and did not
    /// move is excluded from balancing until it makes observable
    /// progress.
    async fn refresh_actuals(&mut self) {
        for tracked in self.domains.values_mut() {
            let actual = match self.hypervisor.domain_memory(tracked.handle).await {
                Ok(actual) => actual,
                Err(err) => {
                    warn!(id = %tracked.state.id, error = %err, "failed to read domain memory");
                    continue;
                }
            };
            tracked.state.memory_actual = actual;
            if let Some(last) = tracked.last_request {
                if last.target < last.actual_at_request {
                    tracked.state.no_progress = actual >= last.actual_at_request;
                }
            }
        }
    }

    fn states(&self) -> HashMap<DomainId, DomainMemoryState> {
        self.domains
            .iter()
            .map(|(&id, tracked)| (id, tracked.state.clone()))
            .collect()
    }

    async fn apply(&mut self, requests: &[BalloonRequest]) {
        for request in requests {
            let Some(tracked) = self.domains.get_mut(&request.id) else {
                continue;
            };
            if let Err(err) = self
                .hypervisor
                .set_memory_target(tracked.handle, request.target)
                .await
            {
                warn!(id = %request.id, error = %err, "failed to set balloon target");
                continue;
            }
            tracked.last_request = Some(LastRequest {
                target: request.target,
                actual_at_request: tracked.state.memory_actual,
            });
        }
    }

    /// One pass of the periodic rebalance.
    async fn balance_once(&mut self) {
        if self.domains.is_empty() {
            return;
        }
        self.refresh_actuals().await;
        let free = match self.hypervisor.free_host_memory().await {
            Ok(free) => free,
            Err(err) => {
                warn!(error = %err, "failed to read free host memory, skipping pass");
                return;
            }
        };
        let requests = rebalance(&self.config, free, &self.states());
        debug!(free, requests = requests.len(), "rebalance pass");
        self.apply(&requests).await;
    }

    /// Serve one admission request under the bounded budget.
    async fn handle_admission(&mut self, bytes: u64) -> bool {
        for attempt in 0..self.admission_budget.attempts {
            let free = match self.hypervisor.free_host_memory().await {
                Ok(free) => free,
                Err(err) => {
                    warn!(error = %err, "admission: failed to read free host memory");
                    return false;
                }
            };
            if free >= bytes {
                info!(bytes, free, attempt, "admission granted");
                return true;
            }
            self.refresh_actuals().await;
            let shortfall = bytes - free;
            let Some(requests) = admission_check(&self.config, shortfall, &self.states()) else {
                info!(bytes, free, "admission denied: not enough donor surplus");
                return false;
            };
            self.apply(&requests).await;
            tokio::time::sleep(self.admission_budget.interval).await;
        }
        info!(bytes, "admission denied: donors did not yield within budget");
        false
    }
}
