//! Per-world claim storage, spatial lookup and invariant-checked mutation.
//!
//! A [`ClaimTree`] is the arena of one world's claims plus its bucket index.
//! A [`ClaimRegistry`] guards a tree with a single read-write lock:
//!
//! - lookups take a read lock;
//! - mutations validate under an upgradable read lock (readers keep going),
//!   consult the pre-commit observers, then upgrade to a write lock and
//!   commit. Only one upgradable lock exists at a time, so nothing can change
//!   between validation and commit, and a rejected mutation leaves the tree
//!   untouched.
//!
//! Persistence ops and post-commit notifications are issued after the lock
//! has been released.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockUpgradableReadGuard};
use rustc_hash::FxHashMap;
use warden_config::ClaimsConfig;

use crate::claim::{
    ActorId, Claim, ClaimContext, ClaimId, ClaimKind, TrustLevel, TrustSubject, WorldId,
};
use crate::error::ClaimError;
use crate::event::{ClaimEvent, ClaimEventKind, ObserverSet, Verdict};
use crate::geometry::{BlockPos, ClaimBounds, GeometryError};
use crate::index::ClaimIndex;
use crate::persistence::{PersistOp, PersistenceSink};

// ---------------------------------------------------------------------------
// Id allocation
// ---------------------------------------------------------------------------

/// Hands out claim ids. Shared by every registry of an engine so ids are
/// unique across worlds.
#[derive(Debug)]
pub struct ClaimIdAllocator {
    next: AtomicU64,
}

impl ClaimIdAllocator {
    /// Starts at id 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Returns a fresh id.
    pub fn allocate(&self) -> ClaimId {
        ClaimId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Makes sure ids handed out later are greater than `id`.
    pub fn reserve_past(&self, id: ClaimId) {
        self.next
            .fetch_max(id.0.saturating_add(1), Ordering::Relaxed);
    }

    /// The id the next call to [`allocate`](Self::allocate) would return.
    pub fn peek(&self) -> ClaimId {
        ClaimId(self.next.load(Ordering::Relaxed))
    }
}

impl Default for ClaimIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Requests and reports
// ---------------------------------------------------------------------------

/// Size and nesting limits applied on create and resize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementRules {
    /// Minimum width along either horizontal axis for player top-level claims.
    pub min_width: u64,
    /// Minimum area for player top-level claims.
    pub min_area: u64,
    /// Deepest allowed nesting level.
    pub max_depth: u32,
}

impl PlacementRules {
    /// Extracts the placement limits from the claims config.
    pub fn from_config(config: &ClaimsConfig) -> Self {
        Self {
            min_width: u64::from(config.min_width),
            min_area: config.min_area,
            max_depth: config.max_depth,
        }
    }
}

impl Default for PlacementRules {
    fn default() -> Self {
        Self::from_config(&ClaimsConfig::default())
    }
}

/// Parameters of a claim creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateClaim {
    /// Requested box.
    pub bounds: ClaimBounds,
    /// Requested owner. Replaced by the tree owner for subdivisions.
    pub owner: Option<ActorId>,
    /// Requested kind. Top-level kinds placed inside a compatible claim
    /// become subdivisions.
    pub kind: ClaimKind,
    /// Expected parent. Creation fails if the bounds place the claim elsewhere.
    pub parent_hint: Option<ClaimId>,
    /// Who is asking, reported in the event.
    pub actor: Option<ActorId>,
}

impl CreateClaim {
    /// A player claim owned and requested by `owner`.
    pub fn basic(bounds: ClaimBounds, owner: ActorId) -> Self {
        Self {
            bounds,
            owner: Some(owner),
            kind: ClaimKind::Basic,
            parent_hint: None,
            actor: Some(owner),
        }
    }

    /// A subdivision of `parent` requested by `actor`.
    pub fn subdivision(bounds: ClaimBounds, parent: ClaimId, actor: Option<ActorId>) -> Self {
        Self {
            bounds,
            owner: actor,
            kind: ClaimKind::Subdivision,
            parent_hint: Some(parent),
            actor,
        }
    }

    /// An administrative claim.
    pub fn admin(bounds: ClaimBounds) -> Self {
        Self {
            bounds,
            owner: None,
            kind: ClaimKind::Admin,
            parent_hint: None,
            actor: None,
        }
    }

    /// Overrides the requested kind.
    pub fn with_kind(mut self, kind: ClaimKind) -> Self {
        self.kind = kind;
        self
    }

    /// Overrides the acting subject reported in the event.
    pub fn by(mut self, actor: ActorId) -> Self {
        self.actor = Some(actor);
        self
    }
}

/// Where a validated creation goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
    parent: Option<ClaimId>,
    kind: ClaimKind,
    owner: Option<ActorId>,
}

/// A broken structural invariant found by [`ClaimTree::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Bounds are inverted or degenerate.
    InvalidBounds {
        /// Offending claim.
        claim: ClaimId,
        /// What is wrong.
        error: GeometryError,
    },
    /// A child extends outside its parent.
    EscapesParent {
        /// Child claim.
        child: ClaimId,
        /// Its parent.
        parent: ClaimId,
    },
    /// Two unrelated claims intersect.
    Overlap {
        /// Lower id.
        a: ClaimId,
        /// Higher id.
        b: ClaimId,
    },
    /// A parent id does not resolve.
    DanglingParent {
        /// Child claim.
        child: ClaimId,
        /// Missing parent.
        parent: ClaimId,
    },
    /// `parent` and `children` disagree.
    ChildLinkMismatch {
        /// Parent side of the link.
        parent: ClaimId,
        /// Child side of the link.
        child: ClaimId,
    },
    /// Subdivision kind without parent, or top-level kind with one.
    KindMismatch(ClaimId),
    /// A subdivision's owner differs from its tree owner.
    OwnerMismatch(ClaimId),
    /// Index entries do not match the claim's bounds.
    IndexMismatch(ClaimId),
    /// The index holds an id with no claim.
    StaleIndexEntry(ClaimId),
}

/// Outcome of [`ClaimRegistry::load`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Claims admitted.
    pub loaded: usize,
    /// Claims rejected, with the reason.
    pub skipped: Vec<(ClaimId, String)>,
}

// ---------------------------------------------------------------------------
// ClaimTree
// ---------------------------------------------------------------------------

/// One world's claims, keyed by id, plus the bucket index over them.
#[derive(Debug, Clone)]
pub struct ClaimTree {
    world: WorldId,
    claims: FxHashMap<ClaimId, Claim>,
    index: ClaimIndex,
}

/// Iterator over a claim and its ancestors, innermost first.
pub struct Ancestors<'a> {
    tree: &'a ClaimTree,
    next: Option<ClaimId>,
    steps: usize,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a Claim;

    fn next(&mut self) -> Option<&'a Claim> {
        let id = self.next?;
        // A parent cycle would otherwise loop forever on corrupted input.
        if self.steps > self.tree.claims.len() {
            return None;
        }
        self.steps += 1;
        let claim = self.tree.claims.get(&id)?;
        self.next = claim.parent();
        Some(claim)
    }
}

impl ClaimTree {
    /// An empty tree for `world`.
    pub fn new(world: WorldId) -> Self {
        Self {
            world,
            claims: FxHashMap::default(),
            index: ClaimIndex::new(),
        }
    }

    /// World of this tree.
    pub fn world(&self) -> &WorldId {
        &self.world
    }

    /// Number of claims, subdivisions included.
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    /// `true` if the world has no claims.
    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Claim by id.
    pub fn get(&self, id: ClaimId) -> Option<&Claim> {
        self.claims.get(&id)
    }

    /// All claims in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Claim> {
        self.claims.values()
    }

    /// All claims without a parent.
    pub fn top_level(&self) -> impl Iterator<Item = &Claim> {
        self.claims.values().filter(|c| c.parent().is_none())
    }

    /// The claim and each of its ancestors, innermost first.
    pub fn ancestors(&self, id: ClaimId) -> Ancestors<'_> {
        Ancestors {
            tree: self,
            next: Some(id),
            steps: 0,
        }
    }

    /// Nesting depth; top-level claims are depth 0.
    pub fn depth(&self, id: ClaimId) -> u32 {
        self.ancestors(id).count().saturating_sub(1) as u32
    }

    /// The top-level claim of the tree containing `id`.
    pub fn root_of(&self, id: ClaimId) -> Option<&Claim> {
        self.ancestors(id).last()
    }

    /// `true` if `ancestor` is a strict ancestor of `of`.
    pub fn is_ancestor(&self, ancestor: ClaimId, of: ClaimId) -> bool {
        self.ancestors(of).skip(1).any(|c| c.id() == ancestor)
    }

    /// The deepest claim containing `pos`, or `None` for wilderness.
    ///
    /// Two claims of equal depth both containing a point break the
    /// non-overlap invariant; that is logged as an error and resolved in
    /// favour of the most recently created claim.
    pub fn claim_at(&self, pos: BlockPos) -> Option<&Claim> {
        let mut best: Option<(&Claim, u32)> = None;
        let mut tied = false;

        for id in self.index.query_point(pos) {
            let Some(claim) = self.claims.get(&id) else {
                continue;
            };
            if !claim.bounds().contains_point(pos) {
                continue;
            }
            let depth = self.depth(id);
            match best {
                Some((current, best_depth)) if depth == best_depth => {
                    tied = true;
                    if claim.id() > current.id() {
                        best = Some((claim, depth));
                    }
                }
                Some((_, best_depth)) if depth < best_depth => {}
                _ => {
                    best = Some((claim, depth));
                    tied = false;
                }
            }
        }

        if tied && let Some((claim, depth)) = best {
            tracing::error!(
                world = %self.world,
                %pos,
                picked = %claim.id(),
                depth,
                "Several claims of equal depth contain one point; registry invariant violated"
            );
        }
        best.map(|(claim, _)| claim)
    }

    /// Claims intersecting `bounds`, skipping the ids in `excluding`, in
    /// ascending id order.
    pub fn overlapping<'a>(
        &'a self,
        bounds: &'a ClaimBounds,
        excluding: &'a [ClaimId],
    ) -> impl Iterator<Item = &'a Claim> + 'a {
        self.index
            .query_bounds(bounds)
            .into_iter()
            .filter(move |id| !excluding.contains(id))
            .filter_map(move |id| self.claims.get(&id))
            .filter(move |claim| claim.bounds().intersects(bounds))
    }

    /// The claim a new claim with `bounds` would nest under, if the bounds
    /// fit inside one without partially overlapping anything.
    pub fn container_of(&self, bounds: &ClaimBounds) -> Option<ClaimId> {
        self.deepest_container(bounds, &[]).ok().flatten()
    }

    /// Total area of the player top-level claims owned by `actor`.
    pub fn owned_area(&self, actor: ActorId) -> u64 {
        self.top_level()
            .filter(|c| c.owner() == Some(actor))
            .map(Claim::area)
            .sum()
    }

    /// Top-level claims owned by `actor`, by ascending id.
    pub fn claims_owned_by(&self, actor: ActorId) -> Vec<&Claim> {
        let mut owned: Vec<&Claim> = self
            .top_level()
            .filter(|c| c.owner() == Some(actor))
            .collect();
        owned.sort_by_key(|c| c.id());
        owned
    }

    /// Every descendant of `id`, deepest first (children after their own
    /// descendants), excluding `id` itself.
    pub fn descendants(&self, id: ClaimId) -> Vec<ClaimId> {
        let mut out = Vec::new();
        if let Some(claim) = self.claims.get(&id) {
            for child in claim.children() {
                self.collect_post_order(*child, &mut out);
            }
        }
        out
    }

    fn collect_post_order(&self, id: ClaimId, out: &mut Vec<ClaimId>) {
        if let Some(claim) = self.claims.get(&id) {
            for child in claim.children() {
                self.collect_post_order(*child, out);
            }
            out.push(id);
        }
    }

    /// Checks every structural invariant and index entry.
    pub fn verify(&self) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        let mut ids: Vec<ClaimId> = self.claims.keys().copied().collect();
        ids.sort_unstable();

        for id in &ids {
            let id = *id;
            let claim = &self.claims[&id];

            if let Err(error) = claim.bounds().validate() {
                violations.push(InvariantViolation::InvalidBounds { claim: id, error });
            }
            if !self.index.is_consistent_with(id, claim.bounds()) {
                violations.push(InvariantViolation::IndexMismatch(id));
            }

            match claim.parent() {
                Some(parent_id) => match self.claims.get(&parent_id) {
                    None => violations.push(InvariantViolation::DanglingParent {
                        child: id,
                        parent: parent_id,
                    }),
                    Some(parent) => {
                        if !parent.bounds().contains(claim.bounds()) {
                            violations.push(InvariantViolation::EscapesParent {
                                child: id,
                                parent: parent_id,
                            });
                        }
                        if !parent.children().contains(&id) {
                            violations.push(InvariantViolation::ChildLinkMismatch {
                                parent: parent_id,
                                child: id,
                            });
                        }
                        if !claim.kind().is_subdivision() {
                            violations.push(InvariantViolation::KindMismatch(id));
                        }
                        if self.root_of(id).map(Claim::owner) != Some(claim.owner()) {
                            violations.push(InvariantViolation::OwnerMismatch(id));
                        }
                    }
                },
                None => {
                    if !claim.kind().is_top_level() {
                        violations.push(InvariantViolation::KindMismatch(id));
                    }
                }
            }

            for child in claim.children() {
                if self.claims.get(child).map(Claim::parent) != Some(Some(id)) {
                    violations.push(InvariantViolation::ChildLinkMismatch {
                        parent: id,
                        child: *child,
                    });
                }
            }

            let own = [id];
            for other in self.overlapping(claim.bounds(), &own) {
                if other.id() > id
                    && !self.is_ancestor(other.id(), id)
                    && !self.is_ancestor(id, other.id())
                {
                    violations.push(InvariantViolation::Overlap {
                        a: id,
                        b: other.id(),
                    });
                }
            }
        }

        let mut stale: Vec<ClaimId> = self
            .index
            .ids()
            .filter(|id| !self.claims.contains_key(*id))
            .copied()
            .collect();
        stale.sort_unstable();
        violations.extend(stale.into_iter().map(InvariantViolation::StaleIndexEntry));

        violations
    }

    // -- validation ---------------------------------------------------------

    /// The deepest claim fully containing `bounds`. Any intersecting claim
    /// that does not fully contain `bounds` is an overlap.
    fn deepest_container(
        &self,
        bounds: &ClaimBounds,
        excluding: &[ClaimId],
    ) -> Result<Option<ClaimId>, ClaimError> {
        let mut deepest: Option<(ClaimId, u32)> = None;
        for claim in self.overlapping(bounds, excluding) {
            if !claim.bounds().contains(bounds) {
                return Err(ClaimError::Overlap {
                    conflicting: claim.id(),
                });
            }
            let depth = self.depth(claim.id());
            if deepest.is_none_or(|(_, d)| depth > d) {
                deepest = Some((claim.id(), depth));
            }
        }
        Ok(deepest.map(|(id, _)| id))
    }

    fn check_budget(
        &self,
        owner: ActorId,
        required: u64,
        budget: Option<i64>,
    ) -> Result<(), ClaimError> {
        let Some(available) = budget else {
            return Ok(());
        };
        let remaining = available.saturating_sub(to_i64(self.owned_area(owner)));
        if to_i64(required) > remaining {
            return Err(ClaimError::InsufficientBlocks {
                required,
                remaining,
            });
        }
        Ok(())
    }

    fn plan_create(
        &self,
        request: &CreateClaim,
        rules: &PlacementRules,
        budget: Option<i64>,
    ) -> Result<Placement, ClaimError> {
        let kind = request.kind;
        if kind == ClaimKind::Wilderness {
            return Err(ClaimError::InvalidKind(kind));
        }
        request.bounds.validate()?;

        let container = self.deepest_container(&request.bounds, &[])?;
        if let Some(hint) = request.parent_hint
            && container != Some(hint)
        {
            return Err(ClaimError::InvalidParent { kind });
        }

        let Some(parent) = container else {
            if kind.is_subdivision() {
                return Err(ClaimError::InvalidParent { kind });
            }
            match (kind, request.owner) {
                (ClaimKind::Admin, _) => {
                    return Ok(Placement {
                        parent: None,
                        kind,
                        owner: None,
                    });
                }
                (_, None) => return Err(ClaimError::InvalidKind(kind)),
                (_, Some(owner)) => {
                    check_min_size(&request.bounds, rules)?;
                    self.check_budget(owner, request.bounds.area(), budget)?;
                    return Ok(Placement {
                        parent: None,
                        kind,
                        owner: Some(owner),
                    });
                }
            }
        };

        let root = self
            .root_of(parent)
            .ok_or(ClaimError::NotFound(parent))?;
        // Explicit subdivision requests are authorized by the caller; anything
        // else nests only inside the requester's own tree.
        let requester = if kind == ClaimKind::Admin {
            None
        } else {
            request.owner
        };
        if !kind.is_subdivision() && requester != root.owner() {
            return Err(ClaimError::Overlap {
                conflicting: parent,
            });
        }

        let nested = if kind.is_subdivision() {
            if kind == ClaimKind::TownSubdivision && !root.kind().is_town() {
                return Err(ClaimError::InvalidParent { kind });
            }
            kind
        } else {
            kind.nested_under(root.kind())
        };

        let depth = self.depth(parent) + 1;
        if depth > rules.max_depth {
            return Err(ClaimError::TooDeep {
                max: rules.max_depth,
            });
        }

        Ok(Placement {
            parent: Some(parent),
            kind: nested,
            owner: root.owner(),
        })
    }

    fn check_resize(
        &self,
        id: ClaimId,
        new_bounds: &ClaimBounds,
        rules: &PlacementRules,
        budget: Option<i64>,
    ) -> Result<(), ClaimError> {
        let claim = self.get(id).ok_or(ClaimError::NotFound(id))?;
        new_bounds.validate()?;

        let player_top_level = claim.parent().is_none() && claim.owner().is_some();
        if player_top_level {
            check_min_size(new_bounds, rules)?;
        }

        for child in claim.children() {
            if let Some(c) = self.get(*child)
                && !new_bounds.contains(c.bounds())
            {
                return Err(ClaimError::ResizeViolatesChildren { child: *child });
            }
        }

        let mut excluding = self.descendants(id);
        excluding.push(id);
        let container = self.deepest_container(new_bounds, &excluding)?;
        if container != claim.parent() {
            let conflicting = container.or(claim.parent()).unwrap_or(id);
            return Err(ClaimError::Overlap { conflicting });
        }

        if player_top_level && let Some(owner) = claim.owner() {
            let growth = new_bounds.area().saturating_sub(claim.area());
            if growth > 0 {
                self.check_budget(owner, growth, budget)?;
            }
        }
        Ok(())
    }

    /// Validates a stored claim for admission, normalizing what can be
    /// normalized (children, inherited owner, default context).
    fn admit_loaded(&self, mut claim: Claim) -> Result<Claim, String> {
        claim.bounds().validate().map_err(|e| e.to_string())?;
        let kind = claim.kind();

        match claim.parent() {
            None => {
                if !kind.is_top_level() {
                    return Err(format!("{kind:?} claim has no parent"));
                }
                if (kind == ClaimKind::Admin) != claim.owner().is_none() {
                    return Err(format!("{kind:?} claim has inconsistent owner"));
                }
            }
            Some(parent) => {
                if !kind.is_subdivision() {
                    return Err(format!("{kind:?} claim has a parent"));
                }
                let root = self
                    .root_of(parent)
                    .ok_or_else(|| format!("parent {parent} is missing"))?;
                if kind == ClaimKind::TownSubdivision && !root.kind().is_town() {
                    return Err("town subdivision outside a town".to_string());
                }
                if claim.owner() != root.owner() {
                    tracing::warn!(
                        claim = %claim.id(),
                        "Subdivision owner differs from tree owner; inheriting tree owner"
                    );
                    claim.set_owner(root.owner());
                }
            }
        }

        let container = self
            .deepest_container(claim.bounds(), &[])
            .map_err(|e| e.to_string())?;
        if container != claim.parent() {
            return Err(format!(
                "stored parent {:?} but bounds lie in {:?}",
                claim.parent(),
                container
            ));
        }

        claim.children_mut().clear();
        let own_context = ClaimContext::for_claim(claim.id());
        if !claim.contexts().contains(&own_context) {
            tracing::debug!(claim = %claim.id(), "Restoring missing claim context");
            claim.contexts_mut().insert(own_context);
        }
        Ok(claim)
    }

    // -- mutation (callers have validated) ----------------------------------

    fn insert(&mut self, claim: Claim) {
        let id = claim.id();
        if let Some(parent) = claim.parent()
            && let Some(p) = self.claims.get_mut(&parent)
        {
            p.children_mut().insert(id);
        }
        self.index.insert(id, claim.bounds());
        self.claims.insert(id, claim);
    }

    fn set_bounds(&mut self, id: ClaimId, bounds: ClaimBounds) -> Option<Claim> {
        let claim = self.claims.get_mut(&id)?;
        claim.set_bounds(bounds);
        self.index.insert(id, &bounds);
        Some(claim.clone())
    }

    fn remove_subtree(&mut self, id: ClaimId) -> Vec<Claim> {
        let mut order = self.descendants(id);
        order.push(id);

        if let Some(parent) = self.claims.get(&id).and_then(Claim::parent)
            && let Some(p) = self.claims.get_mut(&parent)
        {
            p.children_mut().remove(&id);
        }

        order
            .into_iter()
            .filter_map(|cid| {
                self.index.remove(cid);
                self.claims.remove(&cid)
            })
            .collect()
    }

    fn reassign_owner(&mut self, id: ClaimId, owner: ActorId) -> Vec<Claim> {
        let mut members = self.descendants(id);
        members.push(id);

        let mut updated = Vec::with_capacity(members.len());
        for member in members {
            if let Some(claim) = self.claims.get_mut(&member) {
                claim.set_owner(Some(owner));
                if claim.kind() == ClaimKind::Admin {
                    claim.set_kind(ClaimKind::Basic);
                }
                updated.push(claim.clone());
            }
        }
        updated
    }
}

fn check_min_size(bounds: &ClaimBounds, rules: &PlacementRules) -> Result<(), GeometryError> {
    let width = bounds.width_x().min(bounds.width_z());
    if width < rules.min_width {
        return Err(GeometryError::TooNarrow {
            width,
            min: rules.min_width,
        });
    }
    if bounds.area() < rules.min_area {
        return Err(GeometryError::TooSmall {
            area: bounds.area(),
            min: rules.min_area,
        });
    }
    Ok(())
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// ClaimRegistry
// ---------------------------------------------------------------------------

/// The claims of one world behind a read-write lock.
pub struct ClaimRegistry {
    world: WorldId,
    tree: RwLock<ClaimTree>,
    rules: PlacementRules,
    ids: Arc<ClaimIdAllocator>,
    observers: Arc<ObserverSet>,
    sink: Option<Arc<dyn PersistenceSink>>,
}

/// Lazy sequence of claims intersecting a box.
///
/// Holds the registry's read lock until dropped: do not keep it alive across
/// a mutating call on the same registry.
pub struct Overlapping<'a> {
    tree: RwLockReadGuard<'a, ClaimTree>,
    bounds: ClaimBounds,
    excluding: Option<ClaimId>,
    candidates: std::vec::IntoIter<ClaimId>,
}

impl Iterator for Overlapping<'_> {
    type Item = Claim;

    fn next(&mut self) -> Option<Claim> {
        for id in self.candidates.by_ref() {
            if Some(id) == self.excluding {
                continue;
            }
            if let Some(claim) = self.tree.claims.get(&id)
                && claim.bounds().intersects(&self.bounds)
            {
                return Some(claim.clone());
            }
        }
        None
    }
}

impl ClaimRegistry {
    /// A standalone registry with its own id allocator, no observers and no
    /// persistence.
    pub fn new(world: WorldId, rules: PlacementRules) -> Self {
        Self::with_shared(
            world,
            rules,
            Arc::new(ClaimIdAllocator::new()),
            Arc::new(ObserverSet::new()),
            None,
        )
    }

    /// A registry sharing id allocation, observers and persistence with the
    /// other registries of an engine.
    pub fn with_shared(
        world: WorldId,
        rules: PlacementRules,
        ids: Arc<ClaimIdAllocator>,
        observers: Arc<ObserverSet>,
        sink: Option<Arc<dyn PersistenceSink>>,
    ) -> Self {
        Self {
            tree: RwLock::new(ClaimTree::new(world.clone())),
            world,
            rules,
            ids,
            observers,
            sink,
        }
    }

    /// World of this registry.
    pub fn world(&self) -> &WorldId {
        &self.world
    }

    /// Placement limits in force.
    pub fn rules(&self) -> &PlacementRules {
        &self.rules
    }

    /// Observers consulted on every mutation.
    pub fn observers(&self) -> &ObserverSet {
        &self.observers
    }

    /// Read access to the whole tree for several lookups under one lock.
    pub fn read(&self) -> RwLockReadGuard<'_, ClaimTree> {
        self.tree.read()
    }

    /// Number of claims, subdivisions included.
    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    /// `true` if the world has no claims.
    pub fn is_empty(&self) -> bool {
        self.tree.read().is_empty()
    }

    /// Snapshot of a claim.
    pub fn get(&self, id: ClaimId) -> Option<Claim> {
        self.tree.read().get(id).cloned()
    }

    /// Snapshot of the deepest claim containing `pos`.
    pub fn claim_at(&self, pos: BlockPos) -> Option<Claim> {
        self.tree.read().claim_at(pos).cloned()
    }

    /// Claims intersecting `bounds`, other than `excluding`.
    pub fn find_overlapping(
        &self,
        bounds: ClaimBounds,
        excluding: Option<ClaimId>,
    ) -> Overlapping<'_> {
        let tree = self.tree.read();
        let candidates = tree.index.query_bounds(&bounds).into_iter();
        Overlapping {
            tree,
            bounds,
            excluding,
            candidates,
        }
    }

    /// Area of `actor`'s top-level claims in this world.
    pub fn owned_area(&self, actor: ActorId) -> u64 {
        self.tree.read().owned_area(actor)
    }

    /// Checks every invariant; empty when the registry is consistent.
    pub fn verify(&self) -> Vec<InvariantViolation> {
        self.tree.read().verify()
    }

    /// Creates a claim.
    ///
    /// `budget` is the owner's claim-block balance minus the area of their
    /// claims in *other* worlds; this registry subtracts its own. `None`
    /// skips the block check.
    pub fn create(&self, request: CreateClaim, budget: Option<i64>) -> Result<Claim, ClaimError> {
        let tree = self.tree.upgradable_read();
        let placement = tree.plan_create(&request, &self.rules, budget)?;

        let id = self.ids.allocate();
        let mut claim = Claim::new(
            id,
            self.world.clone(),
            request.bounds,
            placement.owner,
            placement.kind,
        );
        if let Some(parent) = placement.parent {
            claim = claim.with_parent(parent);
        }

        let event = ClaimEvent {
            kind: ClaimEventKind::Create,
            claim_id: id,
            world: self.world.clone(),
            actor: request.actor,
            before: None,
            after: Some(request.bounds),
        };
        let snapshot = claim.clone();
        self.commit(tree, &event, move |tree| tree.insert(claim))?;

        tracing::debug!(
            world = %self.world,
            claim = %id,
            bounds = %snapshot.bounds(),
            kind = ?snapshot.kind(),
            "Claim created"
        );
        self.persist(PersistOp::SaveClaim(snapshot.clone()));
        Ok(snapshot)
    }

    /// Changes a claim's bounds, keeping its id, trust, children and
    /// contexts. `budget` has the same meaning as in [`create`](Self::create).
    pub fn resize(
        &self,
        id: ClaimId,
        new_bounds: ClaimBounds,
        actor: Option<ActorId>,
        budget: Option<i64>,
    ) -> Result<Claim, ClaimError> {
        let tree = self.tree.upgradable_read();
        let current = tree.get(id).ok_or(ClaimError::NotFound(id))?.clone();
        tree.check_resize(id, &new_bounds, &self.rules, budget)?;
        if *current.bounds() == new_bounds {
            return Ok(current);
        }

        let event = ClaimEvent {
            kind: ClaimEventKind::Resize,
            claim_id: id,
            world: self.world.clone(),
            actor,
            before: Some(*current.bounds()),
            after: Some(new_bounds),
        };
        let updated = self
            .commit(tree, &event, |tree| tree.set_bounds(id, new_bounds))?
            .ok_or(ClaimError::NotFound(id))?;

        tracing::debug!(
            world = %self.world,
            claim = %id,
            from = %current.bounds(),
            to = %new_bounds,
            "Claim resized"
        );
        self.persist(PersistOp::SaveClaim(updated.clone()));
        Ok(updated)
    }

    /// Removes a claim. With `cascade`, its subdivisions are removed first,
    /// deepest first; without it, a claim with subdivisions is rejected.
    /// Returns the removed claims in removal order.
    pub fn delete(&self, id: ClaimId, cascade: bool) -> Result<Vec<Claim>, ClaimError> {
        self.remove(id, cascade, ClaimEventKind::Delete, None)
    }

    pub(crate) fn remove(
        &self,
        id: ClaimId,
        cascade: bool,
        kind: ClaimEventKind,
        actor: Option<ActorId>,
    ) -> Result<Vec<Claim>, ClaimError> {
        let tree = self.tree.upgradable_read();
        let (bounds, child_count) = {
            let claim = tree.get(id).ok_or(ClaimError::NotFound(id))?;
            (*claim.bounds(), claim.children().len())
        };
        if child_count > 0 && !cascade {
            return Err(ClaimError::HasChildren { count: child_count });
        }

        let event = ClaimEvent {
            kind,
            claim_id: id,
            world: self.world.clone(),
            actor,
            before: Some(bounds),
            after: None,
        };
        let removed = self.commit(tree, &event, |tree| tree.remove_subtree(id))?;

        tracing::debug!(
            world = %self.world,
            claim = %id,
            removed = removed.len(),
            ?kind,
            "Claim removed"
        );
        for claim in &removed {
            self.persist(PersistOp::DeleteClaim {
                world: self.world.clone(),
                id: claim.id(),
            });
        }
        Ok(removed)
    }

    /// Hands a top-level claim and its subdivisions to `new_owner`. An
    /// administrative claim becomes a basic claim. `budget` is the new
    /// owner's balance as in [`create`](Self::create).
    pub fn transfer(
        &self,
        id: ClaimId,
        new_owner: ActorId,
        actor: Option<ActorId>,
        budget: Option<i64>,
    ) -> Result<Claim, ClaimError> {
        let tree = self.tree.upgradable_read();
        let current = tree.get(id).ok_or(ClaimError::NotFound(id))?.clone();
        if current.parent().is_some() {
            return Err(ClaimError::NotTopLevel(id));
        }
        if current.owner() == Some(new_owner) {
            return Ok(current);
        }
        tree.check_budget(new_owner, current.area(), budget)?;

        let event = ClaimEvent {
            kind: ClaimEventKind::Transfer,
            claim_id: id,
            world: self.world.clone(),
            actor,
            before: Some(*current.bounds()),
            after: Some(*current.bounds()),
        };
        let updated = self.commit(tree, &event, |tree| tree.reassign_owner(id, new_owner))?;

        tracing::debug!(world = %self.world, claim = %id, owner = %new_owner, "Claim transferred");
        let root = updated
            .iter()
            .find(|c| c.id() == id)
            .cloned()
            .ok_or(ClaimError::NotFound(id))?;
        for claim in updated {
            self.persist(PersistOp::SaveClaim(claim));
        }
        Ok(root)
    }

    /// Sets the trust level of `subject` on one claim.
    pub fn set_trust(
        &self,
        id: ClaimId,
        subject: TrustSubject,
        level: TrustLevel,
    ) -> Result<(), ClaimError> {
        self.update_claim(id, |claim| {
            claim.trust_mut().insert(subject, level);
        })
    }

    /// Removes the entry of `subject`, returning the old level.
    pub fn remove_trust(
        &self,
        id: ClaimId,
        subject: TrustSubject,
    ) -> Result<Option<TrustLevel>, ClaimError> {
        self.update_claim(id, |claim| claim.trust_mut().remove(&subject))
    }

    /// Removes every trust entry of one claim.
    pub fn clear_trust(&self, id: ClaimId) -> Result<(), ClaimError> {
        self.update_claim(id, |claim| claim.trust_mut().clear())
    }

    /// Lets trust lookup continue into the parent claim.
    pub fn set_inherit_trust(&self, id: ClaimId, inherit: bool) -> Result<(), ClaimError> {
        self.update_claim(id, |claim| claim.set_inherit_trust(inherit))
    }

    /// Admits stored claims, parents before children. Records that are
    /// malformed, overlap admitted claims, or whose parent is missing are
    /// skipped and reported. Loading emits no events and no persistence ops.
    pub fn load(&self, claims: Vec<Claim>) -> LoadReport {
        let mut pending = claims;
        pending.sort_by_key(Claim::id);

        let mut report = LoadReport::default();
        let mut tree = self.tree.write();

        loop {
            let mut progressed = false;
            let mut deferred = Vec::new();

            for claim in pending {
                let id = claim.id();
                if claim.world() != &self.world {
                    report
                        .skipped
                        .push((id, format!("belongs to world {}", claim.world())));
                    continue;
                }
                if tree.claims.contains_key(&id) {
                    report.skipped.push((id, "duplicate id".to_string()));
                    continue;
                }
                if let Some(parent) = claim.parent()
                    && !tree.claims.contains_key(&parent)
                {
                    deferred.push(claim);
                    continue;
                }
                match tree.admit_loaded(claim) {
                    Ok(claim) => {
                        self.ids.reserve_past(id);
                        tree.insert(claim);
                        report.loaded += 1;
                        progressed = true;
                    }
                    Err(reason) => report.skipped.push((id, reason)),
                }
            }

            pending = deferred;
            if pending.is_empty() || !progressed {
                break;
            }
        }
        drop(tree);

        for orphan in pending {
            let reason = format!("parent {:?} was not loaded", orphan.parent());
            report.skipped.push((orphan.id(), reason));
        }
        for (id, reason) in &report.skipped {
            tracing::warn!(world = %self.world, claim = %id, %reason, "Skipped stored claim");
        }
        tracing::info!(
            world = %self.world,
            loaded = report.loaded,
            skipped = report.skipped.len(),
            "Claims loaded"
        );
        report
    }

    fn update_claim<T>(
        &self,
        id: ClaimId,
        f: impl FnOnce(&mut Claim) -> T,
    ) -> Result<T, ClaimError> {
        let mut tree = self.tree.write();
        let claim = tree.claims.get_mut(&id).ok_or(ClaimError::NotFound(id))?;
        let out = f(claim);
        let snapshot = claim.clone();
        drop(tree);

        self.persist(PersistOp::SaveClaim(snapshot));
        Ok(out)
    }

    fn commit<T>(
        &self,
        tree: RwLockUpgradableReadGuard<'_, ClaimTree>,
        event: &ClaimEvent,
        apply: impl FnOnce(&mut ClaimTree) -> T,
    ) -> Result<T, ClaimError> {
        if let Verdict::Veto(reason) = self.observers.pre_commit(event) {
            return Err(ClaimError::Vetoed { reason });
        }
        let mut tree = RwLockUpgradableReadGuard::upgrade(tree);
        let out = apply(&mut tree);
        drop(tree);

        self.observers.post_commit(event);
        Ok(out)
    }

    fn persist(&self, op: PersistOp) {
        if let Some(sink) = &self.sink {
            sink.submit(op);
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::event::{ClaimObserver, EventBuffer};

    fn b(min: (i32, i32, i32), max: (i32, i32, i32)) -> ClaimBounds {
        ClaimBounds::from_coords(min, max)
    }

    fn column(x0: i32, z0: i32, x1: i32, z1: i32) -> ClaimBounds {
        b((x0, 0, z0), (x1, 255, z1))
    }

    fn registry() -> ClaimRegistry {
        ClaimRegistry::new(
            WorldId::new("world"),
            PlacementRules {
                min_width: 1,
                min_area: 1,
                max_depth: 3,
            },
        )
    }

    fn p(x: i32, z: i32) -> BlockPos {
        BlockPos::new(x, 64, z)
    }

    #[derive(Default)]
    struct RecordingSink {
        ops: Mutex<Vec<PersistOp>>,
    }

    impl PersistenceSink for RecordingSink {
        fn submit(&self, op: PersistOp) {
            self.ops.lock().push(op);
        }
    }

    struct VetoAll;

    impl ClaimObserver for VetoAll {
        fn pre_commit(&self, _event: &ClaimEvent) -> Verdict {
            Verdict::Veto(Some("maintenance".to_string()))
        }
    }

    #[test]
    fn test_partial_overlap_rejected() {
        let reg = registry();
        let u1 = ActorId::new_random();
        let u2 = ActorId::new_random();
        let a = reg.create(CreateClaim::basic(column(0, 0, 10, 10), u1), None).unwrap();

        let result = reg.create(CreateClaim::basic(column(5, 5, 15, 15), u2), None);
        assert_eq!(result, Err(ClaimError::Overlap { conflicting: a.id() }));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_world_sized_admin_claim() {
        let reg = registry();
        let world = column(-30_000_000, -30_000_000, 30_000_000, 30_000_000);
        let admin = reg.create(CreateClaim::admin(world), None).unwrap();
        let spawn = reg
            .create(CreateClaim::admin(column(-20, -20, 20, 20)), None)
            .unwrap();

        assert_eq!(spawn.parent(), Some(admin.id()));
        assert_eq!(reg.claim_at(p(0, 0)).map(|c| c.id()), Some(spawn.id()));
        assert_eq!(reg.claim_at(p(29_000_000, -5)).map(|c| c.id()), Some(admin.id()));
        assert_eq!(reg.find_overlapping(world, None).count(), 2);
        assert!(reg.verify().is_empty());
    }

    #[test]
    fn test_contained_request_by_owner_becomes_subdivision() {
        let reg = registry();
        let owner = ActorId::new_random();
        let a = reg.create(CreateClaim::basic(column(0, 0, 20, 20), owner), None).unwrap();

        let s = reg.create(CreateClaim::basic(column(2, 2, 8, 8), owner), None).unwrap();
        assert_eq!(s.parent(), Some(a.id()));
        assert_eq!(s.kind(), ClaimKind::Subdivision);
        assert_eq!(s.owner(), Some(owner));
        assert!(reg.get(a.id()).unwrap().children().contains(&s.id()));
    }

    #[test]
    fn test_contained_request_by_stranger_is_overlap() {
        let reg = registry();
        let a = reg
            .create(CreateClaim::basic(column(0, 0, 20, 20), ActorId::new_random()), None)
            .unwrap();
        let result = reg.create(
            CreateClaim::basic(column(2, 2, 8, 8), ActorId::new_random()),
            None,
        );
        assert_eq!(result, Err(ClaimError::Overlap { conflicting: a.id() }));
    }

    #[test]
    fn test_engulfing_an_existing_claim_is_overlap() {
        let reg = registry();
        let owner = ActorId::new_random();
        let small = reg.create(CreateClaim::basic(column(5, 5, 8, 8), owner), None).unwrap();
        let result = reg.create(CreateClaim::basic(column(0, 0, 20, 20), owner), None);
        assert_eq!(result, Err(ClaimError::Overlap { conflicting: small.id() }));
    }

    #[test]
    fn test_sibling_subdivisions_cannot_overlap() {
        let reg = registry();
        let owner = ActorId::new_random();
        let a = reg.create(CreateClaim::basic(column(0, 0, 40, 40), owner), None).unwrap();
        let s1 = reg
            .create(CreateClaim::subdivision(column(0, 0, 10, 10), a.id(), Some(owner)), None)
            .unwrap();

        let result = reg.create(
            CreateClaim::subdivision(column(5, 5, 15, 15), a.id(), Some(owner)),
            None,
        );
        assert_eq!(result, Err(ClaimError::Overlap { conflicting: s1.id() }));
    }

    #[test]
    fn test_subdivision_without_parent_rejected() {
        let reg = registry();
        let result = reg.create(
            CreateClaim::basic(column(0, 0, 10, 10), ActorId::new_random())
                .with_kind(ClaimKind::Subdivision),
            None,
        );
        assert_eq!(
            result,
            Err(ClaimError::InvalidParent {
                kind: ClaimKind::Subdivision
            })
        );
    }

    #[test]
    fn test_parent_hint_must_match_container() {
        let reg = registry();
        let owner = ActorId::new_random();
        let a = reg.create(CreateClaim::basic(column(0, 0, 40, 40), owner), None).unwrap();
        let s = reg
            .create(CreateClaim::subdivision(column(0, 0, 20, 20), a.id(), Some(owner)), None)
            .unwrap();

        // Bounds fall inside `s`, so claiming `a` as direct parent is wrong.
        let result = reg.create(
            CreateClaim::subdivision(column(2, 2, 4, 4), a.id(), Some(owner)),
            None,
        );
        assert!(matches!(result, Err(ClaimError::InvalidParent { .. })));

        let nested = reg
            .create(CreateClaim::subdivision(column(2, 2, 4, 4), s.id(), Some(owner)), None)
            .unwrap();
        assert_eq!(reg.read().depth(nested.id()), 2);
    }

    #[test]
    fn test_max_depth_enforced() {
        let reg = ClaimRegistry::new(
            WorldId::new("world"),
            PlacementRules {
                min_width: 1,
                min_area: 1,
                max_depth: 1,
            },
        );
        let owner = ActorId::new_random();
        let a = reg.create(CreateClaim::basic(column(0, 0, 40, 40), owner), None).unwrap();
        let s = reg
            .create(CreateClaim::subdivision(column(0, 0, 20, 20), a.id(), Some(owner)), None)
            .unwrap();
        let result = reg.create(
            CreateClaim::subdivision(column(2, 2, 4, 4), s.id(), Some(owner)),
            None,
        );
        assert_eq!(result, Err(ClaimError::TooDeep { max: 1 }));
    }

    #[test]
    fn test_town_subdivision_requires_town() {
        let reg = registry();
        let owner = ActorId::new_random();
        let a = reg.create(CreateClaim::basic(column(0, 0, 40, 40), owner), None).unwrap();
        let result = reg.create(
            CreateClaim::subdivision(column(2, 2, 8, 8), a.id(), Some(owner))
                .with_kind(ClaimKind::TownSubdivision),
            None,
        );
        assert!(matches!(result, Err(ClaimError::InvalidParent { .. })));

        let town = reg
            .create(
                CreateClaim::basic(column(100, 100, 140, 140), owner).with_kind(ClaimKind::TownBasic),
                None,
            )
            .unwrap();
        let plot = reg
            .create(
                CreateClaim::basic(column(102, 102, 108, 108), owner).with_kind(ClaimKind::TownBasic),
                None,
            )
            .unwrap();
        assert_eq!(plot.parent(), Some(town.id()));
        assert_eq!(plot.kind(), ClaimKind::TownSubdivision);
    }

    #[test]
    fn test_min_size_applies_to_player_top_level_only() {
        let reg = ClaimRegistry::new(WorldId::new("world"), PlacementRules::default());
        let owner = ActorId::new_random();

        let narrow = reg.create(CreateClaim::basic(column(0, 0, 2, 50), owner), None);
        assert_eq!(
            narrow,
            Err(ClaimError::Geometry(GeometryError::TooNarrow { width: 3, min: 5 }))
        );
        let small = reg.create(CreateClaim::basic(column(0, 0, 5, 5), owner), None);
        assert_eq!(
            small,
            Err(ClaimError::Geometry(GeometryError::TooSmall { area: 36, min: 100 }))
        );

        let a = reg.create(CreateClaim::basic(column(0, 0, 9, 9), owner), None).unwrap();
        assert!(
            reg.create(CreateClaim::subdivision(column(0, 0, 1, 1), a.id(), Some(owner)), None)
                .is_ok()
        );
        assert!(reg.create(CreateClaim::admin(column(50, 50, 51, 51)), None).is_ok());
    }

    #[test]
    fn test_degenerate_bounds_rejected() {
        let reg = registry();
        let result = reg.create(
            CreateClaim::basic(column(3, 3, 3, 3), ActorId::new_random()),
            None,
        );
        assert_eq!(result, Err(ClaimError::Geometry(GeometryError::Degenerate)));
    }

    #[test]
    fn test_budget_counts_claims_in_this_world() {
        let reg = registry();
        let owner = ActorId::new_random();
        reg.create(CreateClaim::basic(column(0, 0, 9, 9), owner), Some(150)).unwrap();

        // 100 used, 50 left: a 100-block claim no longer fits.
        let result = reg.create(CreateClaim::basic(column(50, 50, 59, 59), owner), Some(150));
        assert_eq!(
            result,
            Err(ClaimError::InsufficientBlocks {
                required: 100,
                remaining: 50
            })
        );
        // Subdivisions and admin claims cost nothing.
        let a = reg.read().claims_owned_by(owner)[0].id();
        assert!(
            reg.create(CreateClaim::subdivision(column(0, 0, 4, 4), a, Some(owner)), Some(0))
                .is_ok()
        );
    }

    #[test]
    fn test_claim_at_returns_deepest() {
        let reg = registry();
        let owner = ActorId::new_random();
        let a = reg.create(CreateClaim::basic(column(0, 0, 40, 40), owner), None).unwrap();
        let s = reg
            .create(CreateClaim::subdivision(column(10, 10, 20, 20), a.id(), Some(owner)), None)
            .unwrap();

        assert_eq!(reg.claim_at(p(15, 15)).map(|c| c.id()), Some(s.id()));
        assert_eq!(reg.claim_at(p(10, 20)).map(|c| c.id()), Some(s.id()));
        assert_eq!(reg.claim_at(p(21, 15)).map(|c| c.id()), Some(a.id()));
        assert_eq!(reg.claim_at(p(41, 15)), None);
        // Vertical extent counts too.
        assert_eq!(reg.claim_at(BlockPos::new(15, 300, 15)), None);
    }

    #[test]
    fn test_claim_at_is_deterministic() {
        let reg = registry();
        let owner = ActorId::new_random();
        let a = reg.create(CreateClaim::basic(column(-30, -30, 30, 30), owner), None).unwrap();
        reg.create(CreateClaim::subdivision(column(-5, -5, 5, 5), a.id(), Some(owner)), None)
            .unwrap();

        for x in -35..35 {
            for z in [-31, -5, 0, 5, 30] {
                let first = reg.claim_at(p(x, z)).map(|c| c.id());
                let second = reg.claim_at(p(x, z)).map(|c| c.id());
                assert_eq!(first, second);
            }
        }
    }

    #[test]
    fn test_cascading_delete() {
        let reg = registry();
        let owner = ActorId::new_random();
        let a = reg.create(CreateClaim::basic(column(0, 0, 20, 20), owner), None).unwrap();
        let s = reg
            .create(CreateClaim::subdivision(column(2, 2, 8, 8), a.id(), Some(owner)), None)
            .unwrap();

        assert_eq!(
            reg.delete(a.id(), false),
            Err(ClaimError::HasChildren { count: 1 })
        );
        assert_eq!(reg.len(), 2);

        let removed = reg.delete(a.id(), true).unwrap();
        let ids: Vec<ClaimId> = removed.iter().map(Claim::id).collect();
        assert_eq!(ids, vec![s.id(), a.id()]);
        for x in 0..=20 {
            for z in 0..=20 {
                assert_eq!(reg.claim_at(p(x, z)), None);
            }
        }
        assert!(reg.is_empty());
        assert!(reg.verify().is_empty());
    }

    #[test]
    fn test_delete_subdivision_unlinks_parent() {
        let reg = registry();
        let owner = ActorId::new_random();
        let a = reg.create(CreateClaim::basic(column(0, 0, 20, 20), owner), None).unwrap();
        let s = reg
            .create(CreateClaim::subdivision(column(2, 2, 8, 8), a.id(), Some(owner)), None)
            .unwrap();

        reg.delete(s.id(), false).unwrap();
        assert!(reg.get(a.id()).unwrap().children().is_empty());
        assert_eq!(reg.claim_at(p(5, 5)).map(|c| c.id()), Some(a.id()));
        assert_eq!(reg.delete(s.id(), false), Err(ClaimError::NotFound(s.id())));
    }

    #[test]
    fn test_resize_keeps_children_contained() {
        let reg = registry();
        let owner = ActorId::new_random();
        let a = reg.create(CreateClaim::basic(column(0, 0, 20, 20), owner), None).unwrap();
        let s = reg
            .create(CreateClaim::subdivision(column(10, 10, 18, 18), a.id(), Some(owner)), None)
            .unwrap();

        let result = reg.resize(a.id(), column(0, 0, 15, 15), None, None);
        assert_eq!(result, Err(ClaimError::ResizeViolatesChildren { child: s.id() }));
        assert_eq!(*reg.get(a.id()).unwrap().bounds(), column(0, 0, 20, 20));

        let grown = reg.resize(a.id(), column(-5, -5, 30, 30), None, None).unwrap();
        assert_eq!(grown.children().len(), 1);
        assert!(grown.bounds().contains(reg.get(s.id()).unwrap().bounds()));
        assert_eq!(reg.claim_at(p(-5, -5)).map(|c| c.id()), Some(a.id()));
        assert!(reg.verify().is_empty());
    }

    #[test]
    fn test_resize_subdivision_stays_inside_parent() {
        let reg = registry();
        let owner = ActorId::new_random();
        let a = reg.create(CreateClaim::basic(column(0, 0, 20, 20), owner), None).unwrap();
        let s = reg
            .create(CreateClaim::subdivision(column(2, 2, 8, 8), a.id(), Some(owner)), None)
            .unwrap();

        let result = reg.resize(s.id(), column(2, 2, 25, 8), None, None);
        assert_eq!(result, Err(ClaimError::Overlap { conflicting: a.id() }));

        reg.resize(s.id(), column(2, 2, 20, 8), None, None).unwrap();
        assert!(reg.verify().is_empty());
    }

    #[test]
    fn test_resize_into_neighbour_rejected() {
        let reg = registry();
        let u1 = ActorId::new_random();
        let a = reg.create(CreateClaim::basic(column(0, 0, 10, 10), u1), None).unwrap();
        let b2 = reg
            .create(CreateClaim::basic(column(20, 0, 30, 10), ActorId::new_random()), None)
            .unwrap();

        let result = reg.resize(a.id(), column(0, 0, 25, 10), None, None);
        assert_eq!(result, Err(ClaimError::Overlap { conflicting: b2.id() }));
        assert_eq!(reg.claim_at(p(15, 5)), None);
    }

    #[test]
    fn test_resize_growth_checks_budget() {
        let reg = registry();
        let owner = ActorId::new_random();
        let a = reg.create(CreateClaim::basic(column(0, 0, 9, 9), owner), Some(150)).unwrap();

        let result = reg.resize(a.id(), column(0, 0, 9, 19), None, Some(150));
        assert_eq!(
            result,
            Err(ClaimError::InsufficientBlocks {
                required: 100,
                remaining: 50
            })
        );
        // Shrinking is always affordable.
        assert!(reg.resize(a.id(), column(0, 0, 9, 4), None, Some(0)).is_ok());
    }

    #[test]
    fn test_veto_leaves_state_untouched() {
        let reg = registry();
        let owner = ActorId::new_random();
        let a = reg.create(CreateClaim::basic(column(0, 0, 20, 20), owner), None).unwrap();
        reg.observers().register(Arc::new(VetoAll));

        let before = reg.read().clone();
        assert_eq!(
            reg.create(CreateClaim::basic(column(50, 50, 60, 60), owner), None),
            Err(ClaimError::Vetoed {
                reason: Some("maintenance".to_string())
            })
        );
        assert!(matches!(
            reg.resize(a.id(), column(0, 0, 30, 30), None, None),
            Err(ClaimError::Vetoed { .. })
        ));
        assert!(matches!(reg.delete(a.id(), true), Err(ClaimError::Vetoed { .. })));

        let after = reg.read();
        assert_eq!(after.len(), before.len());
        assert_eq!(after.get(a.id()), before.get(a.id()));
        assert_eq!(after.claim_at(p(25, 25)), None);
        assert!(after.verify().is_empty());
    }

    #[test]
    fn test_vetoed_id_is_never_reused() {
        let reg = registry();
        let owner = ActorId::new_random();
        let first = reg.create(CreateClaim::basic(column(0, 0, 5, 5), owner), None).unwrap();

        struct VetoOnce(Mutex<bool>);
        impl ClaimObserver for VetoOnce {
            fn pre_commit(&self, _event: &ClaimEvent) -> Verdict {
                let mut fired = self.0.lock();
                if *fired {
                    Verdict::Allow
                } else {
                    *fired = true;
                    Verdict::Veto(None)
                }
            }
        }
        reg.observers().register(Arc::new(VetoOnce(Mutex::new(false))));

        assert!(reg.create(CreateClaim::basic(column(10, 10, 15, 15), owner), None).is_err());
        let next = reg.create(CreateClaim::basic(column(10, 10, 15, 15), owner), None).unwrap();
        assert_eq!(next.id(), ClaimId(first.id().0 + 2));
    }

    #[test]
    fn test_events_and_persistence_follow_commits() {
        let sink = Arc::new(RecordingSink::default());
        let observers = Arc::new(ObserverSet::new());
        let buffer = Arc::new(EventBuffer::new());
        observers.register(buffer.clone());
        let reg = ClaimRegistry::with_shared(
            WorldId::new("world"),
            PlacementRules {
                min_width: 1,
                min_area: 1,
                max_depth: 3,
            },
            Arc::new(ClaimIdAllocator::new()),
            observers,
            Some(sink.clone()),
        );
        let owner = ActorId::new_random();

        let a = reg.create(CreateClaim::basic(column(0, 0, 20, 20), owner), None).unwrap();
        let s = reg
            .create(CreateClaim::subdivision(column(2, 2, 8, 8), a.id(), Some(owner)), None)
            .unwrap();
        reg.resize(a.id(), column(0, 0, 30, 30), Some(owner), None).unwrap();
        reg.delete(a.id(), true).unwrap();

        let kinds: Vec<ClaimEventKind> = buffer.drain().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ClaimEventKind::Create,
                ClaimEventKind::Create,
                ClaimEventKind::Resize,
                ClaimEventKind::Delete
            ]
        );

        let ops = sink.ops.lock();
        assert_eq!(ops.len(), 5);
        assert!(matches!(&ops[2], PersistOp::SaveClaim(c) if *c.bounds() == column(0, 0, 30, 30)));
        assert_eq!(
            ops[3],
            PersistOp::DeleteClaim {
                world: WorldId::new("world"),
                id: s.id()
            }
        );
    }

    #[test]
    fn test_find_overlapping_is_lazy_and_excludes() {
        let reg = registry();
        let owner = ActorId::new_random();
        let a = reg.create(CreateClaim::basic(column(0, 0, 10, 10), owner), None).unwrap();
        let b2 = reg.create(CreateClaim::basic(column(20, 0, 30, 10), owner), None).unwrap();
        reg.create(CreateClaim::basic(column(100, 0, 110, 10), owner), None).unwrap();

        let hits: Vec<ClaimId> = reg
            .find_overlapping(column(5, 5, 25, 5), None)
            .map(|c| c.id())
            .collect();
        assert_eq!(hits, vec![a.id(), b2.id()]);

        let hits: Vec<ClaimId> = reg
            .find_overlapping(column(5, 5, 25, 5), Some(a.id()))
            .map(|c| c.id())
            .collect();
        assert_eq!(hits, vec![b2.id()]);

        // Dropping the iterator releases the lock.
        let mut iter = reg.find_overlapping(column(0, 0, 200, 200), None);
        assert!(iter.next().is_some());
        drop(iter);
        assert!(reg.delete(b2.id(), false).is_ok());
    }

    #[test]
    fn test_trust_updates_persist() {
        let sink = Arc::new(RecordingSink::default());
        let reg = ClaimRegistry::with_shared(
            WorldId::new("world"),
            PlacementRules::default(),
            Arc::new(ClaimIdAllocator::new()),
            Arc::new(ObserverSet::new()),
            Some(sink.clone()),
        );
        let owner = ActorId::new_random();
        let friend = ActorId::new_random();
        let a = reg.create(CreateClaim::basic(column(0, 0, 9, 9), owner), None).unwrap();

        reg.set_trust(a.id(), TrustSubject::Actor(friend), TrustLevel::Build).unwrap();
        assert_eq!(
            reg.remove_trust(a.id(), TrustSubject::Actor(friend)).unwrap(),
            Some(TrustLevel::Build)
        );
        assert_eq!(
            reg.set_trust(ClaimId(99), TrustSubject::Public, TrustLevel::Access),
            Err(ClaimError::NotFound(ClaimId(99)))
        );
        assert_eq!(sink.ops.lock().len(), 3);
    }

    #[test]
    fn test_transfer_rewrites_tree_owner() {
        let reg = registry();
        let owner = ActorId::new_random();
        let heir = ActorId::new_random();
        let a = reg.create(CreateClaim::basic(column(0, 0, 20, 20), owner), None).unwrap();
        let s = reg
            .create(CreateClaim::subdivision(column(2, 2, 8, 8), a.id(), Some(owner)), None)
            .unwrap();

        assert_eq!(
            reg.transfer(s.id(), heir, None, None),
            Err(ClaimError::NotTopLevel(s.id()))
        );
        assert!(matches!(
            reg.transfer(a.id(), heir, None, Some(10)),
            Err(ClaimError::InsufficientBlocks { .. })
        ));

        let moved = reg.transfer(a.id(), heir, Some(owner), None).unwrap();
        assert_eq!(moved.owner(), Some(heir));
        assert_eq!(reg.get(s.id()).unwrap().owner(), Some(heir));
        assert_eq!(reg.owned_area(owner), 0);
        assert_eq!(reg.owned_area(heir), 441);
        assert!(reg.verify().is_empty());
    }

    #[test]
    fn test_transfer_admin_claim_becomes_basic() {
        let reg = registry();
        let a = reg.create(CreateClaim::admin(column(0, 0, 20, 20)), None).unwrap();
        let heir = ActorId::new_random();
        let moved = reg.transfer(a.id(), heir, None, None).unwrap();
        assert_eq!(moved.kind(), ClaimKind::Basic);
        assert!(reg.verify().is_empty());
    }

    #[test]
    fn test_load_rebuilds_hierarchy_and_skips_bad_records() {
        let world = WorldId::new("world");
        let owner = ActorId::new_random();
        let a = Claim::new(ClaimId(10), world.clone(), column(0, 0, 20, 20), Some(owner), ClaimKind::Basic);
        // Child listed before its parent and with a stale owner.
        let s = Claim::new(
            ClaimId(11),
            world.clone(),
            column(2, 2, 8, 8),
            Some(ActorId::new_random()),
            ClaimKind::Subdivision,
        )
        .with_parent(ClaimId(10));
        let clash = Claim::new(ClaimId(12), world.clone(), column(15, 15, 30, 30), Some(owner), ClaimKind::Basic);
        let orphan = Claim::new(ClaimId(13), world.clone(), column(50, 50, 60, 60), Some(owner), ClaimKind::Subdivision)
            .with_parent(ClaimId(99));
        let foreign = Claim::new(ClaimId(14), WorldId::new("nether"), column(70, 70, 80, 80), Some(owner), ClaimKind::Basic);

        let reg = registry();
        let report = reg.load(vec![s, clash, orphan, a, foreign]);
        assert_eq!(report.loaded, 2);
        let mut skipped: Vec<ClaimId> = report.skipped.iter().map(|(id, _)| *id).collect();
        skipped.sort();
        assert_eq!(skipped, vec![ClaimId(12), ClaimId(13), ClaimId(14)]);

        assert_eq!(reg.get(ClaimId(11)).unwrap().owner(), Some(owner));
        assert!(reg.get(ClaimId(10)).unwrap().children().contains(&ClaimId(11)));
        assert!(reg.verify().is_empty());

        // New ids continue after the highest loaded one.
        let fresh = reg.create(CreateClaim::basic(column(100, 100, 110, 110), owner), None).unwrap();
        assert!(fresh.id() > ClaimId(11));
    }

    #[test]
    fn test_verify_reports_unrelated_overlap() {
        let reg = registry();
        let owner = ActorId::new_random();
        reg.create(CreateClaim::basic(column(0, 0, 10, 10), owner), None).unwrap();
        let mut tree = reg.read().clone();
        // Bypass validation to plant a conflicting claim.
        tree.insert(Claim::new(
            ClaimId(50),
            WorldId::new("world"),
            column(5, 5, 15, 15),
            Some(owner),
            ClaimKind::Basic,
        ));
        assert_eq!(
            tree.verify(),
            vec![InvariantViolation::Overlap {
                a: ClaimId(1),
                b: ClaimId(50)
            }]
        );
    }

    #[test]
    fn test_random_mutations_preserve_invariants() {
        let reg = registry();
        let owners = [ActorId::new_random(), ActorId::new_random(), ActorId::new_random()];
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..400 {
            let x = rng.random_range(-64..64);
            let z = rng.random_range(-64..64);
            let w = rng.random_range(1..24);
            let d = rng.random_range(1..24);
            let bounds = b((x, rng.random_range(0..8), z), (x + w, rng.random_range(60..80), z + d));
            let owner = owners[rng.random_range(0..owners.len())];

            let ids: Vec<ClaimId> = reg.read().iter().map(Claim::id).collect();
            match rng.random_range(0..10) {
                0..=5 => {
                    let _ = reg.create(CreateClaim::basic(bounds, owner), None);
                }
                6..=7 if !ids.is_empty() => {
                    let id = ids[rng.random_range(0..ids.len())];
                    let _ = reg.resize(id, bounds, None, None);
                }
                8..=9 if !ids.is_empty() => {
                    let id = ids[rng.random_range(0..ids.len())];
                    let _ = reg.delete(id, rng.random_bool(0.5));
                }
                _ => {}
            }

            let violations = reg.verify();
            assert!(violations.is_empty(), "{violations:?}");
        }
    }
}
