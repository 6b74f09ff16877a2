//! Per-player claim-block balance, ignore-mode flags and claim selection.

use serde::{Deserialize, Serialize};

use crate::claim::{ActorId, ClaimId, ClaimKind, WorldId};
use crate::error::ClaimError;

/// Which kinds of land an actor is permitted to ignore protection in.
///
/// Granted by an external permission system; the toggle itself
/// ([`PlayerClaimAccount::ignore_claims`]) only takes effect for kinds
/// covered here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoreCapabilities {
    /// Player claims and their subdivisions (including towns).
    pub basic_claims: bool,
    /// Unclaimed land.
    pub wilderness: bool,
    /// Administrative claims and their subdivisions.
    pub admin_claims: bool,
}

/// Claim-block balance and preferences of one actor in one world.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerClaimAccount {
    world: WorldId,
    actor: ActorId,
    accrued_claim_blocks: u64,
    #[serde(default)]
    bonus_claim_blocks: u64,
    #[serde(default)]
    ignore_claims: bool,
    #[serde(default)]
    ignore_basic_claims: bool,
    #[serde(default)]
    ignore_wilderness: bool,
    #[serde(default)]
    ignore_admin_claims: bool,
    /// Session-only; never stored.
    #[serde(skip)]
    active_claim_selection: Option<ClaimId>,
}

impl PlayerClaimAccount {
    /// A fresh account holding `initial_blocks` accrued blocks.
    pub fn new(world: WorldId, actor: ActorId, initial_blocks: u64) -> Self {
        Self {
            world,
            actor,
            accrued_claim_blocks: initial_blocks,
            bonus_claim_blocks: 0,
            ignore_claims: false,
            ignore_basic_claims: false,
            ignore_wilderness: false,
            ignore_admin_claims: false,
            active_claim_selection: None,
        }
    }

    /// World of the account.
    pub fn world(&self) -> &WorldId {
        &self.world
    }

    /// Account holder.
    pub fn actor(&self) -> ActorId {
        self.actor
    }

    /// Blocks earned through play.
    pub fn accrued_claim_blocks(&self) -> u64 {
        self.accrued_claim_blocks
    }

    /// Blocks granted or purchased.
    pub fn bonus_claim_blocks(&self) -> u64 {
        self.bonus_claim_blocks
    }

    /// Accrued plus bonus blocks.
    pub fn total_claim_blocks(&self) -> u64 {
        self.accrued_claim_blocks
            .saturating_add(self.bonus_claim_blocks)
    }

    /// Remaining blocks given the area of every top-level claim the actor
    /// owns. Negative when stored claims exceed the balance.
    pub fn remaining(&self, owned_area: u64) -> i64 {
        to_i64(self.total_claim_blocks()) - to_i64(owned_area)
    }

    /// Whether the ignore-claims toggle is on.
    pub fn ignore_claims(&self) -> bool {
        self.ignore_claims
    }

    /// Granted ignore capabilities.
    pub fn capabilities(&self) -> IgnoreCapabilities {
        IgnoreCapabilities {
            basic_claims: self.ignore_basic_claims,
            wilderness: self.ignore_wilderness,
            admin_claims: self.ignore_admin_claims,
        }
    }

    /// The claim the actor is currently inspecting or editing.
    pub fn active_claim_selection(&self) -> Option<ClaimId> {
        self.active_claim_selection
    }

    /// Whether the capability for land of `kind` is held. `kind` is the kind
    /// of the top-level claim (or `Wilderness`).
    pub fn can_ignore(&self, kind: ClaimKind) -> bool {
        match kind {
            ClaimKind::Wilderness => self.ignore_wilderness,
            ClaimKind::Admin => self.ignore_admin_claims,
            ClaimKind::Basic
            | ClaimKind::Subdivision
            | ClaimKind::TownBasic
            | ClaimKind::TownSubdivision => self.ignore_basic_claims,
        }
    }

    /// Whether protection checks are bypassed for land of `kind`: the toggle
    /// must be on and the capability must still be held.
    pub fn bypasses(&self, kind: ClaimKind) -> bool {
        self.ignore_claims && self.can_ignore(kind)
    }

    pub(crate) fn set_capabilities(&mut self, caps: IgnoreCapabilities) {
        self.ignore_basic_claims = caps.basic_claims;
        self.ignore_wilderness = caps.wilderness;
        self.ignore_admin_claims = caps.admin_claims;
    }

    pub(crate) fn set_ignore_claims(&mut self, ignore: bool) {
        self.ignore_claims = ignore;
    }

    pub(crate) fn set_active_claim_selection(&mut self, selection: Option<ClaimId>) {
        self.active_claim_selection = selection;
    }

    /// Adjusts accrued blocks by `delta`, capping growth at `cap` (an
    /// existing balance above the cap is kept). Rejects results below zero
    /// or that would leave `remaining` negative.
    pub(crate) fn adjust_accrued(
        &mut self,
        delta: i64,
        cap: u64,
        owned_area: u64,
    ) -> Result<u64, ClaimError> {
        let current = self.accrued_claim_blocks;
        let next = if delta >= 0 {
            let ceiling = cap.max(current);
            current.saturating_add(delta.unsigned_abs()).min(ceiling)
        } else {
            self.checked_debit(current, delta, owned_area)?
        };
        self.accrued_claim_blocks = next;
        Ok(next)
    }

    /// Adjusts bonus blocks by `delta` with the same rejection rules as
    /// [`adjust_accrued`](Self::adjust_accrued), without a cap.
    pub(crate) fn adjust_bonus(&mut self, delta: i64, owned_area: u64) -> Result<u64, ClaimError> {
        let current = self.bonus_claim_blocks;
        let next = if delta >= 0 {
            current.saturating_add(delta.unsigned_abs())
        } else {
            self.checked_debit(current, delta, owned_area)?
        };
        self.bonus_claim_blocks = next;
        Ok(next)
    }

    /// Takes an abandon penalty out of accrued blocks, then bonus blocks,
    /// never going below zero in either.
    pub(crate) fn charge_penalty(&mut self, penalty: u64) {
        let from_accrued = penalty.min(self.accrued_claim_blocks);
        self.accrued_claim_blocks -= from_accrued;
        let rest = penalty - from_accrued;
        self.bonus_claim_blocks = self.bonus_claim_blocks.saturating_sub(rest);
    }

    fn checked_debit(&self, current: u64, delta: i64, owned_area: u64) -> Result<u64, ClaimError> {
        let debit = delta.unsigned_abs();
        let remaining = self.remaining(owned_area);
        if debit > current || to_i64(debit) > remaining {
            return Err(ClaimError::InsufficientBlocks {
                required: debit,
                remaining,
            });
        }
        Ok(current - debit)
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
