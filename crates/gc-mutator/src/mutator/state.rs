//! State enums and flag sets shared between a mutator and the collector.
//!
//! Every type here is stored in an atomic inside [`Mutator`](super::Mutator)
//! and converted back with a `from_*` constructor, the same way
//! `MarkPhase` round-trips through an `AtomicUsize`.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// Whether a mutator is currently touching the managed heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SaferegionState {
    /// Running managed code; roots on its stack may be live and unscanned.
    NotInSaferegion = 0,
    /// Holds no unscanned roots; the collector may inspect it at will.
    InSaferegion = 1,
}

impl SaferegionState {
    #[must_use]
    pub(crate) const fn from_u32(v: u32) -> Self {
        if v == Self::InSaferegion as u32 {
            Self::InSaferegion
        } else {
            Self::NotInSaferegion
        }
    }
}

/// Collector phases as seen by a mutator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum GcPhase {
    /// No phase has been assigned yet.
    Undef = 0,
    /// No collection in progress.
    Idle = 1,
    /// A collection has been scheduled.
    Start = 2,
    /// Root enumeration.
    Enum = 3,
    /// Concurrent marking.
    Marking = 4,
    /// Re-marking objects logged by SATB barriers.
    RemarkSatb = 5,
    /// Final stop-the-world mark.
    FinalMark = 6,
    /// Marking finished; weak references are being processed.
    PostMark = 7,
    /// Preparing to evacuate.
    Precopy = 8,
    /// Concurrent evacuation.
    Copy = 9,
    /// Fixing up references after evacuation.
    Fix = 10,
}

impl GcPhase {
    /// Convert a stored value back to a phase. Unknown values map to `Undef`.
    #[must_use]
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Idle,
            2 => Self::Start,
            3 => Self::Enum,
            4 => Self::Marking,
            5 => Self::RemarkSatb,
            6 => Self::FinalMark,
            7 => Self::PostMark,
            8 => Self::Precopy,
            9 => Self::Copy,
            10 => Self::Fix,
            _ => Self::Undef,
        }
    }

    /// Returns `true` while the SATB write barrier must log overwritten
    /// references.
    #[must_use]
    pub const fn is_satb_marking(self) -> bool {
        matches!(
            self,
            Self::Enum | Self::Marking | Self::RemarkSatb | Self::FinalMark
        )
    }
}

/// Handshake state for a pending GC phase change.
///
/// `NoTransition -> NeedTransition -> InTransition -> FinishTransition`,
/// then back to `NeedTransition` on the next request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GcPhaseTransitionState {
    /// Nothing has ever been requested.
    NoTransition = 0,
    /// The collector asked for a transition that nobody has started.
    NeedTransition = 1,
    /// Exactly one party is applying the new phase.
    InTransition = 2,
    /// The last requested transition has been applied.
    FinishTransition = 3,
}

impl GcPhaseTransitionState {
    #[must_use]
    pub(crate) const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::NeedTransition,
            2 => Self::InTransition,
            3 => Self::FinishTransition,
            _ => Self::NoTransition,
        }
    }
}

/// Handshake state for a pending CPU profile sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CpuProfileState {
    /// Nothing has ever been requested.
    NoCpuProfile = 0,
    /// A sample was requested that nobody has started.
    NeedCpuProfile = 1,
    /// Exactly one party is taking the sample.
    InCpuProfiling = 2,
    /// The last requested sample has been taken.
    FinishCpuProfile = 3,
}

impl CpuProfileState {
    #[must_use]
    pub(crate) const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::NeedCpuProfile,
            2 => Self::InCpuProfiling,
            3 => Self::FinishCpuProfile,
            _ => Self::NoCpuProfile,
        }
    }
}

/// Set of independent reasons a mutator has been asked to act.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SuspensionType(u32);

impl SuspensionType {
    /// No request.
    pub const NONE: Self = Self(0);
    /// Move to the collector's current GC phase.
    pub const GC_PHASE: Self = Self(1 << 0);
    /// Park for a stop-the-world window.
    pub const STW: Self = Self(1 << 1);
    /// Wind down; the runtime is exiting.
    pub const EXIT: Self = Self(1 << 2);
    /// Yield a CPU profile sample.
    pub const CPU_PROFILE: Self = Self(1 << 3);
    /// Every request type.
    pub const ALL: Self = Self(0b1111);

    /// Build a set from raw bits, dropping unknown bits.
    #[must_use]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Raw bits of the set.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns `true` if no request is present.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if every request in `other` is present.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if any request in `other` is present.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for SuspensionType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for SuspensionType {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for SuspensionType {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for SuspensionType {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0 & Self::ALL.0)
    }
}

impl fmt::Debug for SuspensionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(SuspensionType, &str); 4] = [
            (SuspensionType::GC_PHASE, "GC_PHASE"),
            (SuspensionType::STW, "STW"),
            (SuspensionType::EXIT, "EXIT"),
            (SuspensionType::CPU_PROFILE, "CPU_PROFILE"),
        ];
        let mut list = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                list.entry(&format_args!("{name}"));
            }
        }
        list.finish()
    }
}
