//! # Priority Management
//!
//! Static priorities and nice values.
//!
//! Priorities 0-99 belong to real-time classes, 100-139 map to the
//! nice range -20..=19 of the time-sharing classes.

use core::cmp::Ordering;
use static_assertions::const_assert_eq;

/// Lowest nice value (highest weight)
pub const MIN_NICE: i8 = -20;
/// Highest nice value (lowest weight)
pub const MAX_NICE: i8 = 19;
/// Number of nice levels
pub const NICE_WIDTH: usize = 40;
/// Number of real-time priority levels
pub const MAX_RT_PRIO: u8 = 100;
/// One past the largest static priority
pub const MAX_PRIO: u8 = MAX_RT_PRIO + NICE_WIDTH as u8;
/// Static priority of nice 0
pub const DEFAULT_PRIO: u8 = MAX_RT_PRIO + (NICE_WIDTH / 2) as u8;

const_assert_eq!((MAX_NICE - MIN_NICE + 1) as usize, NICE_WIDTH);

/// Thread priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Priority {
    /// Static priority (0-139)
    static_priority: u8,
}

impl Priority {
    /// Minimum priority (lowest)
    pub const MIN: Self = Self { static_priority: MAX_PRIO - 1 };

    /// Maximum priority (highest, real-time)
    pub const MAX: Self = Self { static_priority: 0 };

    /// Default normal priority (nice 0)
    pub const DEFAULT: Self = Self { static_priority: DEFAULT_PRIO };

    /// Idle priority
    pub const IDLE: Self = Self { static_priority: MAX_PRIO - 1 };

    /// Real-time threshold
    pub const REALTIME_THRESHOLD: u8 = MAX_RT_PRIO;

    /// Create a priority from a raw static priority, clamped to range
    pub const fn new(static_priority: u8) -> Self {
        Self {
            static_priority: if static_priority >= MAX_PRIO { MAX_PRIO - 1 } else { static_priority },
        }
    }

    /// Create a real-time priority
    pub const fn realtime(priority: u8) -> Self {
        Self {
            static_priority: if priority >= MAX_RT_PRIO { MAX_RT_PRIO - 1 } else { priority },
        }
    }

    /// Create a time-sharing priority from a nice value (clamped to -20..=19)
    pub const fn normal(nice: i8) -> Self {
        let nice = if nice < MIN_NICE {
            MIN_NICE
        } else if nice > MAX_NICE {
            MAX_NICE
        } else {
            nice
        };
        Self { static_priority: (DEFAULT_PRIO as i16 + nice as i16) as u8 }
    }

    /// Get the static priority
    pub const fn static_priority(&self) -> u8 {
        self.static_priority
    }

    /// Check if this is a real-time priority
    pub const fn is_realtime(&self) -> bool {
        self.static_priority < MAX_RT_PRIO
    }

    /// Nice value; real-time priorities report the strongest nice
    pub const fn nice(&self) -> i8 {
        if self.is_realtime() {
            MIN_NICE
        } else {
            (self.static_priority as i16 - DEFAULT_PRIO as i16) as i8
        }
    }

    /// Index into nice-indexed tables (0 for nice -20, 39 for nice 19)
    pub const fn nice_index(&self) -> usize {
        (self.nice() - MIN_NICE) as usize
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        // Lower number = higher priority
        other.static_priority.cmp(&self.static_priority)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Priority class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PriorityClass {
    /// Idle (only runs when nothing else)
    Idle,
    /// Below normal
    BelowNormal,
    /// Normal
    #[default]
    Normal,
    /// Above normal
    AboveNormal,
    /// High
    High,
    /// Real-time
    Realtime,
}

impl PriorityClass {
    /// Convert to a base priority
    pub fn to_priority(self) -> Priority {
        match self {
            PriorityClass::Idle => Priority::normal(MAX_NICE),
            PriorityClass::BelowNormal => Priority::normal(10),
            PriorityClass::Normal => Priority::normal(0),
            PriorityClass::AboveNormal => Priority::normal(-10),
            PriorityClass::High => Priority::normal(-15),
            PriorityClass::Realtime => Priority::realtime(50),
        }
    }
}
