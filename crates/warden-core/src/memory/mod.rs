//! Guest telemetry sanitization and host memory balancing.
//!
//! Untrusted guest reports enter through [`Telemetry::sanitize`]; the
//! pure balancing math lives in [`balance`]; [`AdmissionControl`] is the
//! seam through which the lifecycle controller asks the balancing loop
//! for memory before growing any allocation.

pub mod balance;
pub mod telemetry;

use async_trait::async_trait;

use crate::collaborators::{CollaboratorError, VmHandle};
use crate::registry::DomainId;

pub use balance::{
    admission_check, memory_needed, prefmem, rebalance, BalancerConfig, BalloonRequest,
    REQUEST_SAFETY_FACTOR, ROUNDING_FACTOR,
};
pub use telemetry::{DomainMemoryState, Telemetry, MAX_TELEMETRY_LEN};

/// Seam between the lifecycle controller and the balancing loop.
///
/// The controller never touches balancer-internal state; it submits
/// admission requests and start/stop notifications through this trait
/// and the loop owns the rest.
#[async_trait]
pub trait AdmissionControl: Send + Sync {
    /// Ask for `bytes` of host memory to become available. Returns
    /// `Ok(true)` once the memory is free, `Ok(false)` when it cannot be
    /// reclaimed; the caller must not proceed on `false`.
    async fn request_memory(&self, bytes: u64) -> Result<bool, CollaboratorError>;

    /// Tell the balancer a domain is now running and should be tracked.
    async fn domain_started(
        &self,
        id: DomainId,
        handle: VmHandle,
        memory_actual: u64,
        memory_maximum: u64,
    ) -> Result<(), CollaboratorError>;

    /// Tell the balancer a domain is gone.
    async fn domain_stopped(&self, id: DomainId) -> Result<(), CollaboratorError>;
}
