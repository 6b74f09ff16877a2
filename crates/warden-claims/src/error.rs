//! Claim mutation errors.
//!
//! Every variant is returned before anything is committed, so a caller that
//! receives one can rely on registry and account state being unchanged.

use crate::claim::{ClaimId, ClaimKind, WorldId};
use crate::geometry::GeometryError;

/// Reasons a claim or account mutation was rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClaimError {
    /// The requested bounds are malformed or below the configured minimums.
    #[error(transparent)]
    Geometry(#[from] GeometryError),

    /// The bounds partially overlap an existing claim, or overlap a claim
    /// that cannot become their parent.
    #[error("bounds overlap claim {conflicting}")]
    Overlap {
        /// The first conflicting claim found.
        conflicting: ClaimId,
    },

    /// The owner cannot afford the area.
    #[error("needs {required} claim blocks, {remaining} remaining")]
    InsufficientBlocks {
        /// Blocks the operation needs.
        required: u64,
        /// Blocks currently available (may be negative after a config change).
        remaining: i64,
    },

    /// A resize would leave a subdivision outside its parent.
    #[error("resize would leave subdivision {child} outside the claim")]
    ResizeViolatesChildren {
        /// The first child that would no longer fit.
        child: ClaimId,
    },

    /// Deleting would orphan subdivisions and cascading was not requested.
    #[error("claim has {count} subdivisions")]
    HasChildren {
        /// Number of direct children.
        count: usize,
    },

    /// A pre-commit observer vetoed the mutation.
    #[error("vetoed: {}", reason.as_deref().unwrap_or("a listener denied the change"))]
    Vetoed {
        /// Optional explanation supplied by the observer.
        reason: Option<String>,
    },

    /// No claim with this id exists in the world.
    #[error("claim {0} not found")]
    NotFound(ClaimId),

    /// The world has no loaded registry.
    #[error("world {0} is not loaded")]
    WorldNotLoaded(WorldId),

    /// The requested kind cannot sit where the bounds place it.
    #[error("a {kind:?} claim cannot be placed here")]
    InvalidParent {
        /// Requested kind.
        kind: ClaimKind,
    },

    /// The kind can never be created directly.
    #[error("{0:?} claims cannot be created")]
    InvalidKind(ClaimKind),

    /// Nesting would exceed the configured maximum depth.
    #[error("subdivisions cannot be nested deeper than {max} levels")]
    TooDeep {
        /// Configured maximum depth.
        max: u32,
    },

    /// The actor does not own the claim it is trying to change.
    #[error("claim {0} belongs to someone else")]
    NotOwner(ClaimId),

    /// The operation only applies to top-level claims.
    #[error("claim {0} is a subdivision")]
    NotTopLevel(ClaimId),

    /// An account could not be read from storage.
    #[error("account storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The actor lacks the ignore capability for this kind of land.
    #[error("missing capability to ignore {0:?} claims")]
    MissingCapability(ClaimKind),
}

impl ClaimError {
    /// `true` for errors caused by the claim's shape or placement, as opposed
    /// to ownership, budget or listener decisions.
    pub fn is_spatial(&self) -> bool {
        matches!(
            self,
            Self::Geometry(_)
                | Self::Overlap { .. }
                | Self::ResizeViolatesChildren { .. }
                | Self::InvalidParent { .. }
                | Self::TooDeep { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_veto_message_defaults() {
        let err = ClaimError::Vetoed { reason: None };
        assert_eq!(err.to_string(), "vetoed: a listener denied the change");

        let err = ClaimError::Vetoed {
            reason: Some("region locked".to_string()),
        };
        assert_eq!(err.to_string(), "vetoed: region locked");
    }

    #[test]
    fn test_geometry_errors_convert() {
        let err: ClaimError = GeometryError::Degenerate.into();
        assert!(err.is_spatial());
        assert!(!ClaimError::NotOwner(ClaimId(1)).is_spatial());
    }
}
