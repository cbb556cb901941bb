//! # Helix Execution Subsystem
//!
//! The execution subsystem provides:
//! - Thread identity
//! - The scheduler framework (traits, registry, metrics)
//! - Host services a scheduler consumes (clock, timers, cross-CPU notification)
//!
//! ## Key Principle
//!
//! This subsystem provides FRAMEWORKS, not implementations.
//! The actual scheduler is a module that can be swapped.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod scheduler;

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for threads
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Allocate a fresh thread ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Build an ID from a raw value chosen by the host
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the kernel idle thread ID
    pub const fn idle() -> Self {
        Self(0)
    }

    /// Get the raw ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Execution result type
pub type ExecResult<T> = Result<T, ExecError>;

/// Execution errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// Thread not found
    ThreadNotFound,
    /// Invalid state
    InvalidState,
    /// Already exists
    AlreadyExists,
    /// Out of resources
    OutOfResources,
    /// Invalid argument
    InvalidArgument,
    /// Configuration rejected, previous configuration kept
    InvalidConfiguration,
    /// Object still in use
    Busy,
    /// Internal error
    Internal,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ExecError::ThreadNotFound => "thread not found",
            ExecError::InvalidState => "invalid state",
            ExecError::AlreadyExists => "already exists",
            ExecError::OutOfResources => "out of resources",
            ExecError::InvalidArgument => "invalid argument",
            ExecError::InvalidConfiguration => "invalid configuration",
            ExecError::Busy => "busy",
            ExecError::Internal => "internal error",
        };
        f.write_str(msg)
    }
}
