//! File-backed storage: one RON file per claim and per account.
//!
//! ```text
//! <root>/<world>/claims/<id>.ron
//! <root>/<world>/accounts/<actor>.ron
//! ```
//!
//! Every write goes to a temporary sibling file that is then renamed over the
//! record, so readers never observe a half-written file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use warden_claims::{
    ActorId, Claim, ClaimId, PersistError, PersistenceGateway, PlayerClaimAccount, WorldId,
};

const CLAIMS_DIR: &str = "claims";
const ACCOUNTS_DIR: &str = "accounts";
const EXTENSION: &str = "ron";

/// Claims and accounts stored as RON files under a root directory.
#[derive(Debug, Clone)]
pub struct RonStore {
    root: PathBuf,
}

impl RonStore {
    /// A store rooted at `root`. Directories are created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn world_dir(&self, world: &WorldId) -> Result<PathBuf, PersistError> {
        let name = world.as_str();
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\']);
        if !valid {
            return Err(PersistError::Malformed {
                record: name.to_string(),
                message: "world name is not a valid directory name".to_string(),
            });
        }
        Ok(self.root.join(name))
    }

    fn claim_path(&self, world: &WorldId, id: ClaimId) -> Result<PathBuf, PersistError> {
        Ok(self
            .world_dir(world)?
            .join(CLAIMS_DIR)
            .join(format!("{}.{EXTENSION}", id.value())))
    }

    fn account_path(&self, world: &WorldId, actor: ActorId) -> Result<PathBuf, PersistError> {
        Ok(self
            .world_dir(world)?
            .join(ACCOUNTS_DIR)
            .join(format!("{actor}.{EXTENSION}")))
    }
}

impl PersistenceGateway for RonStore {
    fn load_all_claims(&self, world: &WorldId) -> Result<Vec<Claim>, PersistError> {
        let dir = self.world_dir(world)?.join(CLAIMS_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut claims = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            match read_record::<Claim>(&path) {
                Ok(claim) => claims.push(claim),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable claim record"),
            }
        }
        tracing::debug!(%world, count = claims.len(), "Read claim records");
        Ok(claims)
    }

    fn save_claim(&self, claim: &Claim) -> Result<(), PersistError> {
        let path = self.claim_path(claim.world(), claim.id())?;
        write_record(&path, claim)
    }

    fn delete_claim(&self, world: &WorldId, id: ClaimId) -> Result<(), PersistError> {
        let path = self.claim_path(world, id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load_account(
        &self,
        world: &WorldId,
        actor: ActorId,
    ) -> Result<Option<PlayerClaimAccount>, PersistError> {
        let path = self.account_path(world, actor)?;
        if !path.exists() {
            return Ok(None);
        }
        read_record(&path).map(Some)
    }

    fn save_account(&self, account: &PlayerClaimAccount) -> Result<(), PersistError> {
        let path = self.account_path(account.world(), account.actor())?;
        write_record(&path, account)
    }
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<T, PersistError> {
    let contents = fs::read_to_string(path)?;
    ron::from_str(&contents).map_err(|e| PersistError::Malformed {
        record: path.display().to_string(),
        message: e.to_string(),
    })
}

fn write_record<T: Serialize>(path: &Path, record: &T) -> Result<(), PersistError> {
    let pretty = ron::ser::PrettyConfig::new()
        .depth_limit(3)
        .separate_tuple_members(true)
        .enumerate_arrays(false);
    let serialized =
        ron::ser::to_string_pretty(record, pretty).map_err(|e| PersistError::Malformed {
            record: path.display().to_string(),
            message: e.to_string(),
        })?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("ron.tmp");
    fs::write(&tmp, serialized)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use warden_claims::{ClaimBounds, ClaimKind, TrustLevel, TrustSubject};

    use super::*;

    fn claim(world: &WorldId, id: u64, owner: ActorId) -> Claim {
        Claim::new(
            ClaimId(id),
            world.clone(),
            ClaimBounds::from_coords((0, 0, 0), (9, 255, 9)),
            Some(owner),
            ClaimKind::Basic,
        )
        .with_trust(TrustSubject::Public, TrustLevel::Access)
    }

    #[test]
    fn test_claims_round_trip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = RonStore::new(dir.path());
        let world = WorldId::new("overworld");
        let owner = ActorId::new_random();

        store.save_claim(&claim(&world, 1, owner)).unwrap();
        store.save_claim(&claim(&world, 2, owner)).unwrap();
        assert!(dir.path().join("overworld/claims/1.ron").exists());

        let mut loaded = store.load_all_claims(&world).unwrap();
        loaded.sort_by_key(Claim::id);
        assert_eq!(loaded, vec![claim(&world, 1, owner), claim(&world, 2, owner)]);
        assert!(store.load_all_claims(&WorldId::new("nether")).unwrap().is_empty());
    }

    #[test]
    fn test_save_and_delete_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = RonStore::new(dir.path());
        let world = WorldId::new("overworld");
        let record = claim(&world, 7, ActorId::new_random());

        store.save_claim(&record).unwrap();
        store.save_claim(&record).unwrap();
        assert_eq!(store.load_all_claims(&world).unwrap().len(), 1);

        store.delete_claim(&world, ClaimId(7)).unwrap();
        store.delete_claim(&world, ClaimId(7)).unwrap();
        assert!(store.load_all_claims(&world).unwrap().is_empty());
        assert!(!dir.path().join("overworld/claims/7.ron.tmp").exists());
    }

    #[test]
    fn test_unreadable_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = RonStore::new(dir.path());
        let world = WorldId::new("overworld");
        store.save_claim(&claim(&world, 1, ActorId::new_random())).unwrap();

        let claims_dir = dir.path().join("overworld/claims");
        fs::write(claims_dir.join("2.ron"), "not ron at all (").unwrap();
        fs::write(claims_dir.join("notes.txt"), "ignored").unwrap();

        let loaded = store.load_all_claims(&world).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id(), ClaimId(1));
    }

    #[test]
    fn test_accounts_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RonStore::new(dir.path());
        let world = WorldId::new("overworld");
        let actor = ActorId::new_random();

        assert_eq!(store.load_account(&world, actor).unwrap(), None);
        let account = PlayerClaimAccount::new(world.clone(), actor, 120);
        store.save_account(&account).unwrap();
        assert_eq!(store.load_account(&world, actor).unwrap(), Some(account));
    }

    #[test]
    fn test_rejects_path_like_world_names() {
        let store = RonStore::new("/nonexistent");
        assert!(matches!(
            store.load_all_claims(&WorldId::new("../escape")),
            Err(PersistError::Malformed { .. })
        ));
    }
}
