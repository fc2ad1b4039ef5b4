use std::fmt::{Display, Formatter};
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// Known per-traversal markers carried by an exchange.
///
/// Stored as a bit set so several markers can be tested or cleared at once,
/// e.g. `state.any_flags(ExchangeState::ROUTE_STOP | ExchangeState::INTERRUPTED)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExchangeState(pub u32);

impl ExchangeState {
    pub const NONE: Self = Self(0);
    pub const ROUTE_STOP: Self = Self(1);
    pub const ROLLBACK_ONLY: Self = Self(1 << 1);
    pub const ROLLBACK_ONLY_LAST: Self = Self(1 << 2);
    pub const FAILURE_HANDLED: Self = Self(1 << 3);
    pub const ERROR_HANDLER_HANDLED: Self = Self(1 << 4);
    pub const REDELIVERY_EXHAUSTED: Self = Self(1 << 5);
    pub const UNIT_OF_WORK_EXHAUSTED: Self = Self(1 << 6);
    pub const INTERRUPTED: Self = Self(1 << 7);
    pub const REDELIVERED: Self = Self(1 << 8);

    pub fn any_flags(&self, flags: ExchangeState) -> bool {
        self.0 & flags.0 != 0
    }

    pub fn all_flags(&self, flags: ExchangeState) -> bool {
        self.0 & flags.0 == flags.0
    }

    pub fn all_flags_clear(&self, flags: ExchangeState) -> bool {
        self.0 & flags.0 == 0
    }

    pub fn set(&mut self, flags: ExchangeState) {
        self.0 |= flags.0;
    }

    pub fn clear(&mut self, flags: ExchangeState) {
        self.0 &= !flags.0;
    }

    /// Whether processing of the remaining stages should stop.
    pub fn is_stopped(&self) -> bool {
        self.any_flags(ExchangeState::ROUTE_STOP | ExchangeState::INTERRUPTED)
    }

    pub fn is_rollback(&self) -> bool {
        self.any_flags(ExchangeState::ROLLBACK_ONLY | ExchangeState::ROLLBACK_ONLY_LAST)
    }
}

impl Display for ExchangeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:b}", self.0)
    }
}

impl PartialEq for ExchangeState {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for ExchangeState {}

impl BitOrAssign for ExchangeState {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0
    }
}

impl BitAndAssign for ExchangeState {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0
    }
}

impl Not for ExchangeState {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self(!self.0)
    }
}

impl BitAnd for ExchangeState {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}

impl BitOr for ExchangeState {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Lifecycle state of a route or of the engine context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl ServiceStatus {
    pub fn is_started(&self) -> bool {
        matches!(self, ServiceStatus::Started)
    }
}

impl Display for ServiceStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Stopped => write!(f, "Stopped"),
            ServiceStatus::Starting => write!(f, "Starting"),
            ServiceStatus::Started => write!(f, "Started"),
            ServiceStatus::Stopping => write!(f, "Stopping"),
        }
    }
}
