//! Lifecycle-specific error types.

use std::time::Duration;

use thiserror::Error;

use crate::collaborators::CollaboratorError;
use crate::lifecycle::state::PowerState;
use crate::registry::store::StoreError;
use crate::registry::{DomainId, RegistryError};

use super::poll::PollError;

/// Errors from lifecycle operations.
///
/// The taxonomy separates "your request was invalid" (`InvalidState`,
/// `NotRunning`, `StillReferenced`, `NotImplemented`, `Registry`) from
/// "an external system failed" (`Collaborator`) from "we timed out
/// waiting" (`Timeout`): the first group must not be retried, the other
/// two may be after inspecting the domain's resulting state.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LifecycleError {
    /// The operation is not legal from the domain's current state.
    #[error("cannot {operation} domain {id} while {state}")]
    InvalidState {
        /// The domain.
        id: DomainId,
        /// The attempted operation.
        operation: &'static str,
        /// The state the domain was observed in.
        state: PowerState,
    },

    /// A teardown was requested for a domain with no live hypervisor
    /// object.
    #[error("domain {id} is not running")]
    NotRunning {
        /// The domain.
        id: DomainId,
    },

    /// Tearing this provider down would cut off running dependents.
    #[error("domain {id} still has running dependents: {dependents:?}")]
    StillReferenced {
        /// The provider.
        id: DomainId,
        /// Its running dependents.
        dependents: Vec<DomainId>,
    },

    /// Memory admission was denied; no allocation was grown.
    #[error("insufficient memory to start domain {id}: {requested} bytes denied")]
    InsufficientMemory {
        /// The domain being started.
        id: DomainId,
        /// Bytes requested (target plus overhead).
        requested: u64,
    },

    /// The operation is not supported for this domain's configuration.
    #[error("operation not implemented: {reason}")]
    NotImplemented {
        /// Why the operation cannot be performed.
        reason: String,
    },

    /// An external subsystem failed.
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    /// A bounded wait expired.
    #[error("timed out waiting for {what} after {waited:?}")]
    Timeout {
        /// What was being waited for.
        what: &'static str,
        /// Total time spent waiting.
        waited: Duration,
    },

    /// A registry mutation or lookup failed.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Persisting the registry snapshot failed. The in-memory mutation
    /// already happened; the caller may retry the persist.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<PollError> for LifecycleError {
    fn from(err: PollError) -> Self {
        match err {
            PollError::Timeout { what, waited } => Self::Timeout { what, waited },
            PollError::Collaborator(e) => Self::Collaborator(e),
        }
    }
}
