//! Claim nodes and the identifiers, kinds and trust levels they carry.
//!
//! Claims refer to their parent and children by [`ClaimId`] only. The owning
//! [`ClaimTree`](crate::registry::ClaimTree) is the arena that resolves ids,
//! so a `Claim` value is a plain snapshot that can be cloned, serialized and
//! handed to callers freely.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geometry::ClaimBounds;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Stable claim identifier. Allocated once, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClaimId(pub u64);

impl ClaimId {
    /// Get the inner u64 value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClaimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A player (or any other acting subject), identified by UUID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub Uuid);

impl ActorId {
    /// A random actor id.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Name of a world. Each world has its own registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorldId(pub String);

impl WorldId {
    /// Creates a world id from its name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The world name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque permission-context tag attached to a claim for its whole lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClaimContext(pub String);

impl ClaimContext {
    /// The context every claim receives on creation.
    pub fn for_claim(id: ClaimId) -> Self {
        Self(format!("claim:{}", id.0))
    }
}

// ---------------------------------------------------------------------------
// Kinds and trust
// ---------------------------------------------------------------------------

/// What a claim is. Determines nesting rules and which ignore capability
/// bypasses it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClaimKind {
    /// Unclaimed land. Reported for points outside every claim, never stored.
    Wilderness,
    /// A player's top-level claim.
    Basic,
    /// A server-owned top-level claim with no player owner.
    Admin,
    /// A nested claim inside another claim, owned by the top-level owner.
    Subdivision,
    /// A player's top-level town claim.
    TownBasic,
    /// A nested claim inside a town.
    TownSubdivision,
}

impl ClaimKind {
    /// `true` for kinds that must have a parent.
    pub fn is_subdivision(self) -> bool {
        matches!(self, Self::Subdivision | Self::TownSubdivision)
    }

    /// `true` for kinds that must not have a parent.
    pub fn is_top_level(self) -> bool {
        matches!(self, Self::Basic | Self::Admin | Self::TownBasic)
    }

    /// `true` for town kinds.
    pub fn is_town(self) -> bool {
        matches!(self, Self::TownBasic | Self::TownSubdivision)
    }

    /// The nested kind a claim of this kind becomes when it is created inside
    /// a tree whose root has kind `root`.
    pub(crate) fn nested_under(self, root: ClaimKind) -> ClaimKind {
        if root.is_town() && self.is_town() {
            Self::TownSubdivision
        } else {
            Self::Subdivision
        }
    }
}

/// Ordinal permission tier. Each tier includes every tier below it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrustLevel {
    /// Explicitly nothing.
    None,
    /// Doors, buttons, levers, beds.
    Access,
    /// Inventories, animals, crops.
    Container,
    /// Placing and breaking blocks.
    Build,
    /// Trust management, resizing, subdividing.
    Manage,
}

/// Who a trust entry applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrustSubject {
    /// Everyone without an entry of their own.
    Public,
    /// One actor.
    Actor(ActorId),
}

// ---------------------------------------------------------------------------
// Claim
// ---------------------------------------------------------------------------

/// A single claimed region.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    id: ClaimId,
    world: WorldId,
    bounds: ClaimBounds,
    owner: Option<ActorId>,
    kind: ClaimKind,
    parent: Option<ClaimId>,
    /// Rebuilt from `parent` links on load.
    #[serde(skip)]
    children: BTreeSet<ClaimId>,
    #[serde(default)]
    trust: BTreeMap<TrustSubject, TrustLevel>,
    #[serde(default)]
    inherit_trust: bool,
    #[serde(default)]
    contexts: BTreeSet<ClaimContext>,
}

impl Claim {
    /// Creates a claim record with no parent, no trust entries and the
    /// default `claim:<id>` context.
    pub fn new(
        id: ClaimId,
        world: WorldId,
        bounds: ClaimBounds,
        owner: Option<ActorId>,
        kind: ClaimKind,
    ) -> Self {
        let mut contexts = BTreeSet::new();
        contexts.insert(ClaimContext::for_claim(id));
        Self {
            id,
            world,
            bounds,
            owner,
            kind,
            parent: None,
            children: BTreeSet::new(),
            trust: BTreeMap::new(),
            inherit_trust: false,
            contexts,
        }
    }

    /// Sets the parent link (used when building records to load).
    pub fn with_parent(mut self, parent: ClaimId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Adds a trust entry (used when building records to load).
    pub fn with_trust(mut self, subject: TrustSubject, level: TrustLevel) -> Self {
        self.trust.insert(subject, level);
        self
    }

    /// Claim id.
    pub fn id(&self) -> ClaimId {
        self.id
    }

    /// World this claim belongs to.
    pub fn world(&self) -> &WorldId {
        &self.world
    }

    /// Claimed box.
    pub fn bounds(&self) -> &ClaimBounds {
        &self.bounds
    }

    /// Owner, or `None` for administrative claims.
    pub fn owner(&self) -> Option<ActorId> {
        self.owner
    }

    /// Claim kind.
    pub fn kind(&self) -> ClaimKind {
        self.kind
    }

    /// Enclosing claim, if this is a subdivision.
    pub fn parent(&self) -> Option<ClaimId> {
        self.parent
    }

    /// Direct subdivisions in creation order.
    pub fn children(&self) -> &BTreeSet<ClaimId> {
        &self.children
    }

    /// All explicit trust entries.
    pub fn trust(&self) -> &BTreeMap<TrustSubject, TrustLevel> {
        &self.trust
    }

    /// Whether trust lookup may continue to the parent claim.
    pub fn inherit_trust(&self) -> bool {
        self.inherit_trust
    }

    /// Attached permission contexts.
    pub fn contexts(&self) -> &BTreeSet<ClaimContext> {
        &self.contexts
    }

    /// `true` for administrative claims and their subdivisions.
    pub fn is_admin(&self) -> bool {
        self.owner.is_none()
    }

    /// Horizontal area of the claim.
    pub fn area(&self) -> u64 {
        self.bounds.area()
    }

    /// The explicit entry for `actor`, or failing that the public entry.
    pub fn explicit_trust(&self, actor: ActorId) -> Option<TrustLevel> {
        self.trust
            .get(&TrustSubject::Actor(actor))
            .or_else(|| self.trust.get(&TrustSubject::Public))
            .copied()
    }

    pub(crate) fn set_bounds(&mut self, bounds: ClaimBounds) {
        self.bounds = bounds;
    }

    pub(crate) fn set_owner(&mut self, owner: Option<ActorId>) {
        self.owner = owner;
    }

    pub(crate) fn set_kind(&mut self, kind: ClaimKind) {
        self.kind = kind;
    }

    pub(crate) fn contexts_mut(&mut self) -> &mut BTreeSet<ClaimContext> {
        &mut self.contexts
    }

    pub(crate) fn children_mut(&mut self) -> &mut BTreeSet<ClaimId> {
        &mut self.children
    }

    pub(crate) fn trust_mut(&mut self) -> &mut BTreeMap<TrustSubject, TrustLevel> {
        &mut self.trust
    }

    pub(crate) fn set_inherit_trust(&mut self, inherit: bool) {
        self.inherit_trust = inherit;
    }
}
