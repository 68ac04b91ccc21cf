use std::fmt;

/// Why a crate transition was refused. Logged for diagnostics; every reason
/// reaches the client as the same conflict rejection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictReason {
    AlreadyCarried,
    NotCarried,
    NotYourCrate,
    OutsideDeliveryZone,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::AlreadyCarried => "crate is already carried",
            Self::NotCarried => "crate is not carried",
            Self::NotYourCrate => "crate is carried by another player",
            Self::OutsideDeliveryZone => "player is outside the delivery zone",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GameError {
    /// Blank or malformed identifiers, rejected before touching state.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(ConflictReason),

    #[error("crate not found: {0}")]
    NotFound(String),
}

pub type GameResult<T> = Result<T, GameError>;
