use crate::roles::Role;

/// Why a role request was refused.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RoleError {
    #[error("Role already taken")]
    RoleTaken(Role),
    #[error("connection already holds role {0}")]
    AlreadyHolds(Role),
    #[error("unknown role: {0}")]
    UnknownRole(String),
}

/// Timer operations that the session refused without changing state.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TimerError {
    #[error("no active race")]
    NoActiveRace,
    #[error("lane has no recorded time to correct")]
    LaneNotFinalized,
}

impl TimerError {
    /// Stable reason string carried on the wire.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoActiveRace => "no_active_race",
            Self::LaneNotFinalized => "lane_not_finalized",
        }
    }
}
