//! In-memory storage with an availability switch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use warden_claims::{
    ActorId, Claim, ClaimId, PersistError, PersistenceGateway, PlayerClaimAccount, WorldId,
};

/// Keeps every record in memory. Taking the store offline makes every call
/// fail with [`PersistError::Unavailable`], which is how degraded storage is
/// exercised without a real backend.
#[derive(Default)]
pub struct MemoryStore {
    claims: RwLock<FxHashMap<(WorldId, ClaimId), Claim>>,
    accounts: RwLock<FxHashMap<(WorldId, ActorId), PlayerClaimAccount>>,
    offline: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStore {
    /// An empty, available store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the store fail (`false`) or succeed (`true`).
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    /// Whether calls currently succeed.
    pub fn is_available(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }

    /// Successful writes and deletes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Stored claim, if any.
    pub fn claim(&self, world: &WorldId, id: ClaimId) -> Option<Claim> {
        self.claims.read().get(&(world.clone(), id)).cloned()
    }

    /// Number of stored claims across all worlds.
    pub fn claim_count(&self) -> usize {
        self.claims.read().len()
    }

    fn check(&self) -> Result<(), PersistError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(PersistError::Unavailable("memory store is offline".to_string()))
        }
    }

    fn wrote(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

impl PersistenceGateway for MemoryStore {
    fn load_all_claims(&self, world: &WorldId) -> Result<Vec<Claim>, PersistError> {
        self.check()?;
        Ok(self
            .claims
            .read()
            .iter()
            .filter(|((w, _), _)| w == world)
            .map(|(_, claim)| claim.clone())
            .collect())
    }

    fn save_claim(&self, claim: &Claim) -> Result<(), PersistError> {
        self.check()?;
        self.claims
            .write()
            .insert((claim.world().clone(), claim.id()), claim.clone());
        self.wrote();
        Ok(())
    }

    fn delete_claim(&self, world: &WorldId, id: ClaimId) -> Result<(), PersistError> {
        self.check()?;
        self.claims.write().remove(&(world.clone(), id));
        self.wrote();
        Ok(())
    }

    fn load_account(
        &self,
        world: &WorldId,
        actor: ActorId,
    ) -> Result<Option<PlayerClaimAccount>, PersistError> {
        self.check()?;
        Ok(self.accounts.read().get(&(world.clone(), actor)).cloned())
    }

    fn save_account(&self, account: &PlayerClaimAccount) -> Result<(), PersistError> {
        self.check()?;
        self.accounts
            .write()
            .insert((account.world().clone(), account.actor()), account.clone());
        self.wrote();
        Ok(())
    }
}
