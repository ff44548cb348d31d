//! Observable domain power states.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::collaborators::HypervisorDomainState;

/// The state of a domain as observed through `current_state()`.
///
/// Derived from the hypervisor's report plus daemon readiness; the
/// controller stores no state of its own beyond the hypervisor handle.
/// `Undefined` (no hypervisor object exists) is equivalent to `Halted`
/// for every precondition check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// Not running; on-disk state only.
    Halted,
    /// Booting: the hypervisor object runs but the service daemons are
    /// not all ready yet.
    Transient,
    /// Fully usable.
    Running,
    /// Paused by the control plane.
    Paused,
    /// Suspended to memory.
    Suspended,
    /// Graceful shutdown in progress.
    Halting,
    /// Hypervisor-level teardown in progress.
    Dying,
    /// The guest crashed.
    Crashed,
    /// No hypervisor object exists.
    Undefined,
}

impl PowerState {
    /// Map a hypervisor report to the observable state. `fully_ready`
    /// is whether all required service daemons answer ready; a running
    /// hypervisor object without them is still booting.
    #[must_use]
    pub const fn from_hypervisor(hv: HypervisorDomainState, fully_ready: bool) -> Self {
        match hv {
            HypervisorDomainState::Running => {
                if fully_ready {
                    Self::Running
                } else {
                    Self::Transient
                }
            }
            HypervisorDomainState::Paused => Self::Paused,
            HypervisorDomainState::ShuttingDown => Self::Halting,
            HypervisorDomainState::Suspended => Self::Suspended,
            HypervisorDomainState::Dying => Self::Dying,
            HypervisorDomainState::Crashed => Self::Crashed,
            HypervisorDomainState::Absent => Self::Halted,
        }
    }

    /// Whether `start()` is legal from this state.
    #[must_use]
    pub const fn can_start(self) -> bool {
        matches!(self, Self::Halted | Self::Undefined)
    }

    /// Whether the domain occupies a hypervisor object in any form.
    /// "Running" in the loose sense: booting and halting count.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running | Self::Transient | Self::Halting)
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Halted => "halted",
            Self::Transient => "transient",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Suspended => "suspended",
            Self::Halting => "halting",
            Self::Dying => "dying",
            Self::Crashed => "crashed",
            Self::Undefined => "undefined",
        };
        f.write_str(s)
    }
}
