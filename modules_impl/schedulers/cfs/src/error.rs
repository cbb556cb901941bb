//! # Errors
//!
//! Only configuration and lookup failures are errors. Running out of
//! bandwidth, finding no idle CPU or losing a race with another CPU are
//! ordinary outcomes and never show up here.

use core::fmt;
use helix_execution::ExecError;

/// Fair scheduler result type
pub type CfsResult<T> = Result<T, CfsError>;

/// Fair scheduler errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfsError {
    /// No such task
    TaskNotFound,
    /// Task already known to the scheduler
    TaskExists,
    /// Task is not in a state that allows the operation
    InvalidState,
    /// No such group
    GroupNotFound,
    /// Group still has tasks or child groups
    GroupBusy,
    /// Operation not permitted on the root group
    RootGroup,
    /// CPU index out of range or offline
    InvalidCpu,
    /// Affinity mask allows no online CPU
    AffinityEmpty,
    /// Bandwidth quota below the minimum
    InvalidQuota,
    /// Bandwidth period out of range
    InvalidPeriod,
    /// Quota/period ratio exceeds what the parent group allows
    QuotaTooLarge,
    /// Shares out of range
    InvalidShares,
    /// Tunable value out of range
    InvalidTunable,
    /// Policy not handled by the fair class
    UnsupportedPolicy,
    /// Topology description inconsistent with the CPU count
    InvalidTopology,
}

impl fmt::Display for CfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            CfsError::TaskNotFound => "task not found",
            CfsError::TaskExists => "task already exists",
            CfsError::InvalidState => "task state does not allow this",
            CfsError::GroupNotFound => "group not found",
            CfsError::GroupBusy => "group is not empty",
            CfsError::RootGroup => "not permitted on the root group",
            CfsError::InvalidCpu => "invalid cpu",
            CfsError::AffinityEmpty => "affinity mask has no online cpu",
            CfsError::InvalidQuota => "invalid bandwidth quota",
            CfsError::InvalidPeriod => "invalid bandwidth period",
            CfsError::QuotaTooLarge => "quota exceeds parent limit",
            CfsError::InvalidShares => "invalid shares",
            CfsError::InvalidTunable => "tunable out of range",
            CfsError::UnsupportedPolicy => "policy not handled by the fair class",
            CfsError::InvalidTopology => "invalid topology",
        };
        f.write_str(msg)
    }
}

impl From<CfsError> for ExecError {
    fn from(err: CfsError) -> Self {
        match err {
            CfsError::TaskNotFound => ExecError::ThreadNotFound,
            CfsError::TaskExists => ExecError::AlreadyExists,
            CfsError::InvalidState => ExecError::InvalidState,
            CfsError::GroupNotFound | CfsError::InvalidCpu | CfsError::AffinityEmpty => {
                ExecError::InvalidArgument
            }
            CfsError::UnsupportedPolicy | CfsError::RootGroup => ExecError::InvalidArgument,
            CfsError::GroupBusy => ExecError::Busy,
            CfsError::InvalidQuota
            | CfsError::InvalidPeriod
            | CfsError::QuotaTooLarge
            | CfsError::InvalidShares
            | CfsError::InvalidTunable
            | CfsError::InvalidTopology => ExecError::InvalidConfiguration,
        }
    }
}
