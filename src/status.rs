//! Machine lifecycle states.
//!
//! Statuses are numbered; the wire/state form is `"<code>:<Name>"`, e.g.
//! `"6:Deployed"`. Parsing only looks at the code before the colon.

use std::fmt;
use std::str::FromStr;

use crate::client::models::Machine;
use crate::error::ProviderError;
use crate::poller::PollState;

/// Lifecycle status of a DRP machine as seen by this provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineStatus {
    /// 0: discovered, not yet commissioned.
    New,
    /// 1: joining a pool.
    Commissioning,
    /// 2: joining a pool failed.
    FailedCommissioning,
    /// 3: the machine could not be found.
    Missing,
    /// 4: free in its pool.
    Ready,
    /// 5: held outside the allocation flow.
    Reserved,
    /// 6: allocated and its workflow has completed.
    Deployed,
    /// 7: removed from service.
    Retired,
    /// 8: unusable.
    Broken,
    /// 9: allocated, workflow still running.
    Deploying,
    /// 10: allocated, waiting to build.
    Allocated,
    /// 11: the deploy workflow failed.
    FailedDeployment,
    /// 12: being returned to its pool.
    Releasing,
    /// 13: returning to the pool failed.
    FailedReleasing,
}

impl MachineStatus {
    /// All statuses in code order.
    pub const ALL: [MachineStatus; 14] = [
        Self::New,
        Self::Commissioning,
        Self::FailedCommissioning,
        Self::Missing,
        Self::Ready,
        Self::Reserved,
        Self::Deployed,
        Self::Retired,
        Self::Broken,
        Self::Deploying,
        Self::Allocated,
        Self::FailedDeployment,
        Self::Releasing,
        Self::FailedReleasing,
    ];

    /// The numeric status code.
    pub fn code(self) -> u8 {
        match self {
            Self::New => 0,
            Self::Commissioning => 1,
            Self::FailedCommissioning => 2,
            Self::Missing => 3,
            Self::Ready => 4,
            Self::Reserved => 5,
            Self::Deployed => 6,
            Self::Retired => 7,
            Self::Broken => 8,
            Self::Deploying => 9,
            Self::Allocated => 10,
            Self::FailedDeployment => 11,
            Self::Releasing => 12,
            Self::FailedReleasing => 13,
        }
    }

    /// Look up a status by code.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }

    /// The status name without its code.
    pub fn name(self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Commissioning => "Commissioning",
            Self::FailedCommissioning => "FailedCommissioning",
            Self::Missing => "Missing",
            Self::Ready => "Ready",
            Self::Reserved => "Reserved",
            Self::Deployed => "Deployed",
            Self::Retired => "Retired",
            Self::Broken => "Broken",
            Self::Deploying => "Deploying",
            Self::Allocated => "Allocated",
            Self::FailedDeployment => "FailedDeployment",
            Self::Releasing => "Releasing",
            Self::FailedReleasing => "FailedReleasing",
        }
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.code(), self.name())
    }
}

impl FromStr for MachineStatus {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProviderError::Validation(format!("invalid machine status {:?}", s));
        let (code, _) = s.split_once(':').ok_or_else(invalid)?;
        code.trim()
            .parse::<u8>()
            .ok()
            .and_then(Self::from_code)
            .ok_or_else(invalid)
    }
}

impl PollState for MachineStatus {
    fn matches(&self, expected: &Self) -> bool {
        self.code() == expected.code()
    }
}

impl Machine {
    /// Derive the lifecycle status from the machine's pool status and workflow.
    pub fn status(&self) -> MachineStatus {
        match self.pool_status.as_str() {
            "Joining" | "HoldJoin" => MachineStatus::Commissioning,
            "Free" => MachineStatus::Ready,
            "Building" => MachineStatus::Deploying,
            "HoldBuild" => MachineStatus::Allocated,
            "InUse" if self.workflow_complete => MachineStatus::Deployed,
            "InUse" => MachineStatus::Deploying,
            "Destroying" | "HoldDestroy" | "Leaving" | "HoldLeave" => MachineStatus::Releasing,
            _ => MachineStatus::New,
        }
    }
}
