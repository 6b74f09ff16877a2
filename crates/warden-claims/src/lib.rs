//! Land claims: nested, non-overlapping regions of a block world and the
//! permission rules they impose.
//!
//! # Layout
//!
//! - [`geometry`]: inclusive integer boxes and the overlap predicates every
//!   placement decision rests on.
//! - [`claim`]: claim records, ids, kinds and trust levels.
//! - [`index`]: chunk-column buckets mapping positions to candidate claims.
//! - [`registry`]: one world's claim arena and its invariant-checked
//!   create/resize/delete/transfer operations.
//! - [`access`]: "may actor A do X at P" resolution.
//! - [`account`]: per-player claim-block balances and ignore modes.
//! - [`event`]: pre-commit veto hooks and post-commit notifications.
//! - [`persistence`]: the storage contract implemented by backends.
//! - [`engine`]: the multi-world facade tying the above together.
//!
//! ```rust
//! use warden_claims::{
//!     ActorId, BlockPos, ClaimBounds, ClaimEngine, CreateClaim, Decision, PlayerAction, WorldId,
//! };
//! use warden_config::ClaimsConfig;
//!
//! let engine = ClaimEngine::new(ClaimsConfig::default());
//! let world = WorldId::new("overworld");
//! engine.add_world(world.clone());
//!
//! let owner = ActorId::new_random();
//! let bounds = ClaimBounds::from_coords((0, 0, 0), (9, 255, 9));
//! engine.create_claim(&world, CreateClaim::basic(bounds, owner)).unwrap();
//!
//! let visitor = ActorId::new_random();
//! let pos = BlockPos::new(4, 64, 4);
//! assert_eq!(
//!     engine.resolve(&world, owner, pos, PlayerAction::Build).unwrap(),
//!     Decision::Allow
//! );
//! assert!(!engine.resolve(&world, visitor, pos, PlayerAction::Build).unwrap().is_allowed());
//! ```

pub mod access;
pub mod account;
pub mod claim;
pub mod engine;
pub mod error;
pub mod event;
pub mod geometry;
pub mod index;
pub mod persistence;
pub mod registry;

pub use access::{AccessResolver, Decision, DenyReason, PlayerAction, wilderness_trust};
pub use account::{IgnoreCapabilities, PlayerClaimAccount};
pub use claim::{
    ActorId, Claim, ClaimContext, ClaimId, ClaimKind, TrustLevel, TrustSubject, WorldId,
};
pub use engine::{AbandonOutcome, ClaimEngine, abandon_penalty};
pub use error::ClaimError;
pub use event::{ClaimEvent, ClaimEventKind, ClaimObserver, EventBuffer, ObserverSet, Verdict};
pub use geometry::{BlockPos, ClaimBounds, GeometryError};
pub use index::{BUCKET_SHIFT, BucketKey, ClaimIndex, MAX_CLAIM_BUCKETS};
pub use persistence::{PersistError, PersistOp, PersistenceGateway, PersistenceSink};
pub use registry::{
    ClaimIdAllocator, ClaimRegistry, ClaimTree, CreateClaim, InvariantViolation, LoadReport,
    Overlapping, PlacementRules,
};
