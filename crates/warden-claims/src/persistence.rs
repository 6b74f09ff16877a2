//! Persistence contract.
//!
//! The engine never performs storage I/O on the mutation path. Registries and
//! the engine describe committed changes as [`PersistOp`]s and hand them to a
//! [`PersistenceSink`] after releasing their locks; storage backends implement
//! [`PersistenceGateway`] and are used directly only for loading.

use crate::account::PlayerClaimAccount;
use crate::claim::{ActorId, Claim, ClaimId, WorldId};

/// Storage failures.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// Filesystem or socket failure.
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("record {record} is malformed: {message}")]
    Malformed {
        /// Which record (path or key).
        record: String,
        /// Codec error text.
        message: String,
    },

    /// The backend refused the request.
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// A committed change that storage has to catch up with.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistOp {
    /// Insert or overwrite a claim record.
    SaveClaim(Claim),
    /// Remove a claim record.
    DeleteClaim {
        /// World of the removed claim.
        world: WorldId,
        /// Removed claim.
        id: ClaimId,
    },
    /// Insert or overwrite an account record.
    SaveAccount(PlayerClaimAccount),
}

impl PersistOp {
    /// Short description for log lines.
    pub fn describe(&self) -> String {
        match self {
            Self::SaveClaim(claim) => format!("save claim {} in {}", claim.id(), claim.world()),
            Self::DeleteClaim { world, id } => format!("delete claim {id} in {world}"),
            Self::SaveAccount(account) => {
                format!("save account {} in {}", account.actor(), account.world())
            }
        }
    }
}

/// Durable storage for claims and accounts.
///
/// Implementations must be idempotent: saving a record that is already stored
/// with identical data, or deleting one that is already gone, succeeds and
/// changes nothing observable.
pub trait PersistenceGateway: Send + Sync {
    /// Every stored claim of `world`, in any order.
    fn load_all_claims(&self, world: &WorldId) -> Result<Vec<Claim>, PersistError>;

    /// Insert or overwrite a claim record.
    fn save_claim(&self, claim: &Claim) -> Result<(), PersistError>;

    /// Remove a claim record.
    fn delete_claim(&self, world: &WorldId, id: ClaimId) -> Result<(), PersistError>;

    /// The stored account of `actor` in `world`, if any.
    fn load_account(
        &self,
        world: &WorldId,
        actor: ActorId,
    ) -> Result<Option<PlayerClaimAccount>, PersistError>;

    /// Insert or overwrite an account record.
    fn save_account(&self, account: &PlayerClaimAccount) -> Result<(), PersistError>;

    /// Applies a queued operation.
    fn apply(&self, op: &PersistOp) -> Result<(), PersistError> {
        match op {
            PersistOp::SaveClaim(claim) => self.save_claim(claim),
            PersistOp::DeleteClaim { world, id } => self.delete_claim(world, *id),
            PersistOp::SaveAccount(account) => self.save_account(account),
        }
    }
}

/// Receives committed changes. Must not block on I/O.
pub trait PersistenceSink: Send + Sync {
    /// Queue `op` for storage.
    fn submit(&self, op: PersistOp);
}
