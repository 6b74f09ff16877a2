//! Multi-world facade: one registry per loaded world, the claim-block
//! economy, ignore modes and claim selection.
//!
//! All mutations go through one engine-wide mutation lock, so a block budget
//! computed across every world cannot change between check and commit.
//! Permission checks and lookups never take that lock.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use warden_config::ClaimsConfig;

use crate::access::{AccessResolver, Decision, PlayerAction};
use crate::account::{IgnoreCapabilities, PlayerClaimAccount};
use crate::claim::{ActorId, Claim, ClaimId, ClaimKind, WorldId};
use crate::error::ClaimError;
use crate::event::{ClaimEventKind, ClaimObserver, ObserverSet};
use crate::geometry::{BlockPos, ClaimBounds};
use crate::persistence::{PersistOp, PersistenceGateway, PersistenceSink};
use crate::registry::{
    ClaimIdAllocator, ClaimRegistry, CreateClaim, InvariantViolation, LoadReport, PlacementRules,
};

/// Result of abandoning a claim.
#[derive(Debug, Clone, PartialEq)]
pub struct AbandonOutcome {
    /// Removed claims, deepest first.
    pub removed: Vec<Claim>,
    /// Blocks lost to the abandon penalty.
    pub penalty: u64,
    /// The owner's remaining blocks afterwards, for player top-level claims.
    pub remaining: Option<i64>,
}

/// Claims, accounts and permissions of every loaded world.
pub struct ClaimEngine {
    config: ClaimsConfig,
    rules: PlacementRules,
    worlds: RwLock<FxHashMap<WorldId, Arc<ClaimRegistry>>>,
    accounts: DashMap<(WorldId, ActorId), PlayerClaimAccount>,
    ids: Arc<ClaimIdAllocator>,
    observers: Arc<ObserverSet>,
    gateway: Option<Arc<dyn PersistenceGateway>>,
    sink: Option<Arc<dyn PersistenceSink>>,
    mutation: Mutex<()>,
}

impl ClaimEngine {
    /// An engine with no worlds, no storage and no observers.
    pub fn new(config: ClaimsConfig) -> Self {
        Self {
            rules: PlacementRules::from_config(&config),
            config,
            worlds: RwLock::new(FxHashMap::default()),
            accounts: DashMap::new(),
            ids: Arc::new(ClaimIdAllocator::new()),
            observers: Arc::new(ObserverSet::new()),
            gateway: None,
            sink: None,
            mutation: Mutex::new(()),
        }
    }

    /// Storage used to load worlds and accounts.
    pub fn with_gateway(mut self, gateway: Arc<dyn PersistenceGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Destination of committed changes. Must be set before worlds are added.
    pub fn with_sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Claims configuration in force.
    pub fn config(&self) -> &ClaimsConfig {
        &self.config
    }

    /// Registers an observer for mutations in every world.
    pub fn register_observer(&self, observer: Arc<dyn ClaimObserver>) {
        self.observers.register(observer);
    }

    // -- worlds -------------------------------------------------------------

    /// Adds an empty registry for `world`, or returns the loaded one.
    pub fn add_world(&self, world: WorldId) -> Arc<ClaimRegistry> {
        let mut worlds = self.worlds.write();
        worlds
            .entry(world.clone())
            .or_insert_with(|| {
                tracing::debug!(%world, "World registry created");
                Arc::new(ClaimRegistry::with_shared(
                    world,
                    self.rules,
                    self.ids.clone(),
                    self.observers.clone(),
                    self.sink.clone(),
                ))
            })
            .clone()
    }

    /// Loads `world` from storage. Loading an already-loaded world is a no-op
    /// that reports nothing loaded.
    pub fn load_world(&self, world: WorldId) -> Result<LoadReport, ClaimError> {
        if self.worlds.read().contains_key(&world) {
            tracing::warn!(%world, "World is already loaded");
            return Ok(LoadReport::default());
        }
        let claims = match &self.gateway {
            Some(gateway) => gateway
                .load_all_claims(&world)
                .map_err(|e| ClaimError::StorageUnavailable(e.to_string()))?,
            None => Vec::new(),
        };

        let _guard = self.mutation.lock();
        let registry = self.add_world(world);
        Ok(registry.load(claims))
    }

    /// Drops the registry and cached accounts of `world`.
    pub fn unload_world(&self, world: &WorldId) -> Option<Arc<ClaimRegistry>> {
        let _guard = self.mutation.lock();
        let removed = self.worlds.write().remove(world);
        if removed.is_some() {
            self.accounts.retain(|(w, _), _| w != world);
            tracing::info!(%world, "World unloaded");
        }
        removed
    }

    /// Registry of a loaded world.
    pub fn registry(&self, world: &WorldId) -> Result<Arc<ClaimRegistry>, ClaimError> {
        self.worlds
            .read()
            .get(world)
            .cloned()
            .ok_or_else(|| ClaimError::WorldNotLoaded(world.clone()))
    }

    /// Loaded worlds by name.
    pub fn worlds(&self) -> Vec<WorldId> {
        let mut worlds: Vec<WorldId> = self.worlds.read().keys().cloned().collect();
        worlds.sort();
        worlds
    }

    /// Invariant check of every loaded world.
    pub fn verify(&self) -> Vec<(WorldId, InvariantViolation)> {
        let mut out = Vec::new();
        for world in self.worlds() {
            if let Ok(registry) = self.registry(&world) {
                out.extend(registry.verify().into_iter().map(|v| (world.clone(), v)));
            }
        }
        out
    }

    // -- lookups ------------------------------------------------------------

    /// Deepest claim at `pos`, or `None` in the wilderness.
    pub fn claim_at(&self, world: &WorldId, pos: BlockPos) -> Result<Option<Claim>, ClaimError> {
        Ok(self.registry(world)?.claim_at(pos))
    }

    /// Decides whether `actor` may perform `action` at `pos`.
    pub fn resolve(
        &self,
        world: &WorldId,
        actor: ActorId,
        pos: BlockPos,
        action: PlayerAction,
    ) -> Result<Decision, ClaimError> {
        let registry = self.registry(world)?;
        let account = self.known_account(world, actor);
        let tree = registry.read();
        let resolver = AccessResolver::new(&tree, self.config.wilderness_for(world.as_str()));
        Ok(resolver.resolve(actor, account.as_ref(), pos, action))
    }

    /// Total area of `actor`'s top-level claims across every loaded world.
    pub fn owned_area(&self, actor: ActorId) -> u64 {
        self.registries().iter().map(|r| r.owned_area(actor)).sum()
    }

    // -- accounts -----------------------------------------------------------

    /// The account of `actor` in `world`, created on first use from storage
    /// or with the configured initial blocks.
    pub fn account(&self, world: &WorldId, actor: ActorId) -> Result<PlayerClaimAccount, ClaimError> {
        self.registry(world)?;
        if let Some(account) = self.cached_account(world, actor) {
            return Ok(account);
        }

        let stored = match &self.gateway {
            Some(gateway) => gateway
                .load_account(world, actor)
                .map_err(|e| ClaimError::StorageUnavailable(e.to_string()))?,
            None => None,
        };
        let created = stored.is_none();
        let fresh = stored.unwrap_or_else(|| {
            PlayerClaimAccount::new(world.clone(), actor, self.config.initial_claim_blocks)
        });

        let account = self
            .accounts
            .entry((world.clone(), actor))
            .or_insert(fresh)
            .value()
            .clone();
        if created {
            tracing::debug!(%world, %actor, "Account created");
            self.persist(PersistOp::SaveAccount(account.clone()));
        }
        Ok(account)
    }

    /// Accrued plus bonus blocks minus the area of every top-level claim the
    /// actor owns.
    pub fn remaining_blocks(&self, world: &WorldId, actor: ActorId) -> Result<i64, ClaimError> {
        let account = self.account(world, actor)?;
        Ok(account.remaining(self.owned_area(actor)))
    }

    /// Adds `delta` accrued blocks (capped at the configured maximum) or
    /// removes them. Returns the new accrued balance.
    pub fn adjust_accrued(
        &self,
        world: &WorldId,
        actor: ActorId,
        delta: i64,
    ) -> Result<u64, ClaimError> {
        let _guard = self.mutation.lock();
        let owned = self.owned_area(actor);
        let cap = self.config.max_accrued_claim_blocks;
        self.update_account(world, actor, |account| account.adjust_accrued(delta, cap, owned))
    }

    /// Adds or removes bonus blocks. Returns the new bonus balance.
    pub fn adjust_bonus(&self, world: &WorldId, actor: ActorId, delta: i64) -> Result<u64, ClaimError> {
        let _guard = self.mutation.lock();
        let owned = self.owned_area(actor);
        self.update_account(world, actor, |account| account.adjust_bonus(delta, owned))
    }

    /// Records which kinds of land `actor` may ignore protection in.
    pub fn set_capabilities(
        &self,
        world: &WorldId,
        actor: ActorId,
        caps: IgnoreCapabilities,
    ) -> Result<(), ClaimError> {
        let _guard = self.mutation.lock();
        self.update_account(world, actor, |account| {
            account.set_capabilities(caps);
            Ok(())
        })
    }

    /// Flips the ignore-claims toggle. Turning it on requires the capability
    /// for the land at `pos`. Returns the new state.
    pub fn toggle_ignore_claims(
        &self,
        world: &WorldId,
        actor: ActorId,
        pos: BlockPos,
    ) -> Result<bool, ClaimError> {
        let _guard = self.mutation.lock();
        let kind = self.land_kind(world, pos)?;
        self.update_account(world, actor, |account| {
            let enable = !account.ignore_claims();
            if enable && !account.can_ignore(kind) {
                return Err(ClaimError::MissingCapability(kind));
            }
            account.set_ignore_claims(enable);
            Ok(enable)
        })
    }

    /// Sets or clears the claim `actor` is working on.
    pub fn select_claim(
        &self,
        world: &WorldId,
        actor: ActorId,
        selection: Option<ClaimId>,
    ) -> Result<(), ClaimError> {
        let registry = self.registry(world)?;
        if let Some(id) = selection
            && registry.get(id).is_none()
        {
            return Err(ClaimError::NotFound(id));
        }
        self.account(world, actor)?;
        if let Some(mut account) = self.accounts.get_mut(&(world.clone(), actor)) {
            account.set_active_claim_selection(selection);
        }
        Ok(())
    }

    // -- claim mutations ----------------------------------------------------

    /// Creates a claim in `world`. When `request.actor` is set and the
    /// request names a parent or asks for a subdivision kind, the actor needs
    /// subdivide rights in the claim it would nest under.
    pub fn create_claim(&self, world: &WorldId, request: CreateClaim) -> Result<Claim, ClaimError> {
        let _guard = self.mutation.lock();
        let registry = self.registry(world)?;

        if let Some(actor) = request.actor {
            let parent = match request.parent_hint {
                Some(hint) => Some(hint),
                None if request.kind.is_subdivision() => {
                    registry.read().container_of(&request.bounds)
                }
                None => None,
            };
            if let Some(parent) = parent {
                self.require(&registry, actor, parent, PlayerAction::Subdivide)?;
            }
        }
        let budget = match request.owner {
            Some(owner) if request.kind.is_top_level() && request.kind != ClaimKind::Admin => {
                Some(self.budget(world, owner)?)
            }
            _ => None,
        };
        registry.create(request, budget)
    }

    /// Resizes a claim. With an `actor`, resize rights on the claim are
    /// required.
    pub fn resize_claim(
        &self,
        world: &WorldId,
        id: ClaimId,
        bounds: ClaimBounds,
        actor: Option<ActorId>,
    ) -> Result<Claim, ClaimError> {
        let _guard = self.mutation.lock();
        let registry = self.registry(world)?;
        let claim = registry.get(id).ok_or(ClaimError::NotFound(id))?;

        if let Some(actor) = actor {
            self.require(&registry, actor, id, PlayerAction::Resize)?;
        }
        let budget = match claim.owner() {
            Some(owner) if claim.parent().is_none() => Some(self.budget(world, owner)?),
            _ => None,
        };
        registry.resize(id, bounds, actor, budget)
    }

    /// Removes a claim administratively, with no block effect.
    pub fn delete_claim(
        &self,
        world: &WorldId,
        id: ClaimId,
        cascade: bool,
    ) -> Result<Vec<Claim>, ClaimError> {
        let _guard = self.mutation.lock();
        let removed = self.registry(world)?.delete(id, cascade)?;
        self.clear_selections(world, &removed);
        Ok(removed)
    }

    /// Abandons the claim `id` on behalf of `actor`.
    ///
    /// Only `id` and its subdivisions are removed, never its ancestors. A
    /// claim with subdivisions is rejected unless `delete_top_level` is set.
    /// Abandoning a player top-level claim costs
    /// `ceil(area × (1 − abandon_return_ratio))` blocks. The owner's account
    /// is loaded before anything is removed, so a storage outage leaves the
    /// claim in place.
    pub fn abandon_claim(
        &self,
        world: &WorldId,
        actor: ActorId,
        id: ClaimId,
        delete_top_level: bool,
    ) -> Result<AbandonOutcome, ClaimError> {
        let _guard = self.mutation.lock();
        let registry = self.registry(world)?;

        let target = registry.get(id).ok_or(ClaimError::NotFound(id))?;
        // Player trees can only be abandoned by their owner; admin trees by
        // anyone holding manage rights there.
        match target.owner() {
            Some(owner) if owner == actor => {}
            Some(_) => return Err(ClaimError::NotOwner(target.id())),
            None => self.require(&registry, actor, target.id(), PlayerAction::Abandon)?,
        }

        let charge = match target.owner() {
            Some(owner) if target.parent().is_none() => {
                self.account(world, owner)?;
                let penalty = abandon_penalty(target.area(), self.config.abandon_return_ratio);
                Some((owner, penalty))
            }
            _ => None,
        };

        let removed = registry.remove(
            target.id(),
            delete_top_level,
            ClaimEventKind::Abandon,
            Some(actor),
        )?;
        self.clear_selections(world, &removed);

        // The account is cached and the mutation lock is held, so nothing
        // below can fail.
        let (penalty, remaining) = match charge {
            Some((owner, penalty)) => {
                let charged = self
                    .accounts
                    .get_mut(&(world.clone(), owner))
                    .map(|mut entry| {
                        entry.value_mut().charge_penalty(penalty);
                        entry.value().clone()
                    });
                let remaining = charged.map(|account| {
                    let remaining = account.remaining(self.owned_area(owner));
                    self.persist(PersistOp::SaveAccount(account));
                    remaining
                });
                (penalty, remaining)
            }
            None => (0, None),
        };

        tracing::debug!(
            %world,
            claim = %target.id(),
            %actor,
            removed = removed.len(),
            penalty,
            "Claim abandoned"
        );
        Ok(AbandonOutcome {
            removed,
            penalty,
            remaining,
        })
    }

    /// Gives a top-level claim to `new_owner`, who must afford its area.
    /// With an `actor`, only the current owner may give the claim away.
    pub fn transfer_claim(
        &self,
        world: &WorldId,
        id: ClaimId,
        new_owner: ActorId,
        actor: Option<ActorId>,
    ) -> Result<Claim, ClaimError> {
        let _guard = self.mutation.lock();
        let registry = self.registry(world)?;
        let claim = registry.get(id).ok_or(ClaimError::NotFound(id))?;
        if let Some(actor) = actor
            && claim.owner() != Some(actor)
        {
            return Err(ClaimError::NotOwner(id));
        }
        let budget = self.budget(world, new_owner)?;
        registry.transfer(id, new_owner, actor, Some(budget))
    }

    // -- helpers ------------------------------------------------------------

    fn registries(&self) -> Vec<Arc<ClaimRegistry>> {
        self.worlds.read().values().cloned().collect()
    }

    fn cached_account(&self, world: &WorldId, actor: ActorId) -> Option<PlayerClaimAccount> {
        self.accounts
            .get(&(world.clone(), actor))
            .map(|entry| entry.value().clone())
    }

    /// The cached account, or the stored one (which is then cached). Never
    /// creates an account; a storage failure reads as no account.
    fn known_account(&self, world: &WorldId, actor: ActorId) -> Option<PlayerClaimAccount> {
        if let Some(account) = self.cached_account(world, actor) {
            return Some(account);
        }
        let gateway = self.gateway.as_ref()?;
        match gateway.load_account(world, actor) {
            Ok(stored) => {
                let stored = stored?;
                Some(
                    self.accounts
                        .entry((world.clone(), actor))
                        .or_insert(stored)
                        .value()
                        .clone(),
                )
            }
            Err(e) => {
                tracing::warn!(%world, %actor, error = %e, "Account unavailable; resolving without it");
                None
            }
        }
    }

    /// Kind of the land at `pos`: the top-level claim's kind or wilderness.
    fn land_kind(&self, world: &WorldId, pos: BlockPos) -> Result<ClaimKind, ClaimError> {
        let registry = self.registry(world)?;
        let tree = registry.read();
        Ok(tree
            .claim_at(pos)
            .and_then(|claim| tree.root_of(claim.id()))
            .map_or(ClaimKind::Wilderness, Claim::kind))
    }

    /// Blocks `owner` can spend in `world`: their balance minus the claims
    /// they hold in every other world.
    fn budget(&self, world: &WorldId, owner: ActorId) -> Result<i64, ClaimError> {
        let account = self.account(world, owner)?;
        let elsewhere: u64 = self
            .registries()
            .iter()
            .filter(|r| r.world() != world)
            .map(|r| r.owned_area(owner))
            .sum();
        Ok(account.remaining(elsewhere))
    }

    fn require(
        &self,
        registry: &ClaimRegistry,
        actor: ActorId,
        id: ClaimId,
        action: PlayerAction,
    ) -> Result<(), ClaimError> {
        let account = self.known_account(registry.world(), actor);
        let tree = registry.read();
        let claim = tree.get(id).ok_or(ClaimError::NotFound(id))?;
        let resolver =
            AccessResolver::new(&tree, self.config.wilderness_for(registry.world().as_str()));
        if resolver
            .resolve_in_claim(actor, account.as_ref(), claim, action)
            .is_allowed()
        {
            Ok(())
        } else {
            Err(ClaimError::NotOwner(id))
        }
    }

    /// Applies `f` to the account and persists it when `f` succeeds.
    fn update_account<T>(
        &self,
        world: &WorldId,
        actor: ActorId,
        f: impl FnOnce(&mut PlayerClaimAccount) -> Result<T, ClaimError>,
    ) -> Result<T, ClaimError> {
        self.account(world, actor)?;
        let (out, snapshot) = {
            let mut entry = self
                .accounts
                .get_mut(&(world.clone(), actor))
                .ok_or_else(|| ClaimError::WorldNotLoaded(world.clone()))?;
            let out = f(entry.value_mut())?;
            (out, entry.value().clone())
        };
        self.persist(PersistOp::SaveAccount(snapshot));
        Ok(out)
    }

    fn clear_selections(&self, world: &WorldId, removed: &[Claim]) {
        let gone: FxHashSet<ClaimId> = removed.iter().map(Claim::id).collect();
        for mut entry in self.accounts.iter_mut() {
            let (account_world, _) = entry.key();
            if account_world != world {
                continue;
            }
            if entry
                .value()
                .active_claim_selection()
                .is_some_and(|id| gone.contains(&id))
            {
                entry.value_mut().set_active_claim_selection(None);
            }
        }
    }

    fn persist(&self, op: PersistOp) {
        if let Some(sink) = &self.sink {
            sink.submit(op);
        }
    }
}

/// Blocks lost when abandoning a claim of `area`: `ceil(area × (1 − ratio))`,
/// computed in parts per million so ratios like 0.7 round exactly.
pub fn abandon_penalty(area: u64, return_ratio: f64) -> u64 {
    const SCALE: u128 = 1_000_000;
    let ratio = return_ratio.clamp(0.0, 1.0);
    let keep_ppm = ((1.0 - ratio) * SCALE as f64).round() as u128;
    let penalty = (u128::from(area) * keep_ppm).div_ceil(SCALE);
    u64::try_from(penalty).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
