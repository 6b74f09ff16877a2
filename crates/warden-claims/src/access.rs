//! Permission resolution for a single action at a single block.
//!
//! Order of precedence:
//!
//! 1. Outside every claim the world's wilderness rule applies.
//! 2. An actor with the ignore toggle on *and* the capability for the land's
//!    kind is allowed. The capability is checked on every call.
//! 3. The owner of the top-level claim is allowed everywhere in the tree.
//! 4. Trust entries are looked up innermost claim first (actor entry, then
//!    public). The first explicit entry decides. Lookup continues into the
//!    parent only where a claim opts in with `inherit_trust`.
//!
//! The resolver only reads accounts and claims.

use warden_config::WildernessRule;

use crate::account::PlayerClaimAccount;
use crate::claim::{ActorId, Claim, ClaimKind, TrustLevel};
use crate::geometry::BlockPos;
use crate::registry::ClaimTree;

/// Something an actor tries to do at a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlayerAction {
    /// Doors, buttons, levers, beds.
    Access,
    /// Chests, furnaces, animals, crops.
    OpenContainer,
    /// Placing a block.
    Build,
    /// Breaking a block.
    Break,
    /// Emptying a bucket.
    PlaceFluid,
    /// Changing trust entries.
    ManageTrust,
    /// Changing the claim's bounds.
    Resize,
    /// Creating a subdivision.
    Subdivide,
    /// Giving the claim up.
    Abandon,
}

impl PlayerAction {
    /// Least trust level that permits this action.
    pub fn required_trust(self) -> TrustLevel {
        match self {
            Self::Access => TrustLevel::Access,
            Self::OpenContainer => TrustLevel::Container,
            Self::Build | Self::Break | Self::PlaceFluid => TrustLevel::Build,
            Self::ManageTrust | Self::Resize | Self::Subdivide | Self::Abandon => {
                TrustLevel::Manage
            }
        }
    }
}

/// Why an action was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DenyReason {
    /// An entry exists but is below what the action needs.
    InsufficientTrust,
    /// No entry applies to the actor.
    NotTrusted,
    /// The wilderness rule of the world forbids the action.
    WildernessProtected,
}

/// Outcome of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    /// The action may proceed.
    Allow,
    /// The action is refused.
    Deny(DenyReason),
}

impl Decision {
    /// `true` for [`Decision::Allow`].
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Trust level granted to everyone in unclaimed land.
pub fn wilderness_trust(rule: WildernessRule) -> TrustLevel {
    if rule.allow_build {
        TrustLevel::Build
    } else if rule.allow_containers {
        TrustLevel::Container
    } else if rule.allow_access {
        TrustLevel::Access
    } else {
        TrustLevel::None
    }
}

/// Resolves actions against one world's claims.
pub struct AccessResolver<'a> {
    tree: &'a ClaimTree,
    wilderness: WildernessRule,
}

impl<'a> AccessResolver<'a> {
    /// A resolver over `tree` using `wilderness` for unclaimed land.
    pub fn new(tree: &'a ClaimTree, wilderness: WildernessRule) -> Self {
        Self { tree, wilderness }
    }

    /// Decides whether `actor` may perform `action` at `pos`. `account` is
    /// the actor's account in this world, if one exists.
    pub fn resolve(
        &self,
        actor: ActorId,
        account: Option<&PlayerClaimAccount>,
        pos: BlockPos,
        action: PlayerAction,
    ) -> Decision {
        match self.tree.claim_at(pos) {
            Some(claim) => self.resolve_in_claim(actor, account, claim, action),
            None => self.resolve_wilderness(account, action),
        }
    }

    /// Decides `action` inside a known claim of this tree, e.g. for commands
    /// that target a selected claim instead of a position.
    pub fn resolve_in_claim(
        &self,
        actor: ActorId,
        account: Option<&PlayerClaimAccount>,
        claim: &Claim,
        action: PlayerAction,
    ) -> Decision {
        let root_kind = self
            .tree
            .root_of(claim.id())
            .map_or(claim.kind(), Claim::kind);
        if account.is_some_and(|a| a.bypasses(root_kind)) {
            return Decision::Allow;
        }

        let tree_owner = self
            .tree
            .root_of(claim.id())
            .and_then(Claim::owner)
            .or(claim.owner());
        if tree_owner == Some(actor) {
            return Decision::Allow;
        }

        for level in self.tree.ancestors(claim.id()) {
            if let Some(trust) = level.explicit_trust(actor) {
                return compare(trust, action);
            }
            if !level.inherit_trust() {
                break;
            }
        }
        Decision::Deny(DenyReason::NotTrusted)
    }

    fn resolve_wilderness(
        &self,
        account: Option<&PlayerClaimAccount>,
        action: PlayerAction,
    ) -> Decision {
        if account.is_some_and(|a| a.bypasses(ClaimKind::Wilderness)) {
            return Decision::Allow;
        }
        if wilderness_trust(self.wilderness) >= action.required_trust() {
            Decision::Allow
        } else {
            Decision::Deny(DenyReason::WildernessProtected)
        }
    }
}

fn compare(trust: TrustLevel, action: PlayerAction) -> Decision {
    if trust >= action.required_trust() {
        Decision::Allow
    } else {
        Decision::Deny(DenyReason::InsufficientTrust)
    }
}
