//! Chunk-column bucket index for claim lookup by location.
//!
//! Claims are bucketed by every 16×16 chunk column their horizontal footprint
//! touches, so a point lookup only inspects the claims of one bucket instead of
//! scanning the world.
//!
//! Claims touching more than [`MAX_CLAIM_BUCKETS`] columns (world-sized admin
//! claims) are kept in a separate list that every query includes, and queries
//! over more columns than that scan the indexed ids instead of the buckets.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::claim::ClaimId;
use crate::geometry::{BlockPos, ClaimBounds};

/// Log2 of the bucket edge length in blocks.
pub const BUCKET_SHIFT: u32 = 4;

/// Most buckets a single claim is filed under; larger claims are oversized.
pub const MAX_CLAIM_BUCKETS: u64 = 4096;

/// A chunk column, identified by block coordinates shifted by [`BUCKET_SHIFT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    /// Chunk X.
    pub x: i32,
    /// Chunk Z.
    pub z: i32,
}

impl BucketKey {
    /// The bucket containing `pos`.
    pub fn from_block(pos: BlockPos) -> Self {
        Self {
            x: pos.x >> BUCKET_SHIFT,
            z: pos.z >> BUCKET_SHIFT,
        }
    }

    /// Every bucket a box's footprint touches, row by row.
    pub fn covering(bounds: &ClaimBounds) -> impl Iterator<Item = BucketKey> {
        let lo = Self::from_block(bounds.min());
        let hi = Self::from_block(bounds.max());
        (lo.x..=hi.x).flat_map(move |x| (lo.z..=hi.z).map(move |z| BucketKey { x, z }))
    }

    /// Number of buckets [`covering`](Self::covering) yields for `bounds`.
    pub fn span(bounds: &ClaimBounds) -> u64 {
        let lo = Self::from_block(bounds.min());
        let hi = Self::from_block(bounds.max());
        let dx = (i64::from(hi.x) - i64::from(lo.x) + 1).unsigned_abs();
        let dz = (i64::from(hi.z) - i64::from(lo.z) + 1).unsigned_abs();
        dx.saturating_mul(dz)
    }
}

/// Bucket index mapping chunk columns to the claims that intersect them.
#[derive(Debug, Default, Clone)]
pub struct ClaimIndex {
    /// Primary storage: bucket -> claims intersecting it.
    buckets: FxHashMap<BucketKey, Vec<ClaimId>>,

    /// Reverse index: claim -> buckets it was filed under, for exact removal.
    /// Empty for oversized claims.
    entries: FxHashMap<ClaimId, Vec<BucketKey>>,

    /// Claims too large to bucket; candidates for every query.
    oversized: FxHashSet<ClaimId>,
}

impl ClaimIndex {
    /// Create a new empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed claims.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Return true if no claims are indexed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of non-empty buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// File `id` under every bucket `bounds` touches.
    /// If the claim is already indexed, its old entries are removed first.
    pub fn insert(&mut self, id: ClaimId, bounds: &ClaimBounds) {
        self.remove(id);

        if BucketKey::span(bounds) > MAX_CLAIM_BUCKETS {
            self.oversized.insert(id);
            self.entries.insert(id, Vec::new());
            return;
        }

        let keys: Vec<BucketKey> = BucketKey::covering(bounds).collect();
        for key in &keys {
            self.buckets.entry(*key).or_default().push(id);
        }
        self.entries.insert(id, keys);
    }

    /// Remove every bucket entry for `id`. Returns `true` if it was indexed.
    pub fn remove(&mut self, id: ClaimId) -> bool {
        let Some(keys) = self.entries.remove(&id) else {
            return false;
        };
        self.oversized.remove(&id);
        for key in keys {
            if let Some(bucket) = self.buckets.get_mut(&key) {
                bucket.retain(|c| *c != id);
                if bucket.is_empty() {
                    self.buckets.remove(&key);
                }
            }
        }
        true
    }

    /// Claims filed under the bucket containing `pos`, plus oversized
    /// claims. Candidates only; the caller still checks exact containment.
    pub fn query_point(&self, pos: BlockPos) -> Vec<ClaimId> {
        let mut found: Vec<ClaimId> = self
            .buckets
            .get(&BucketKey::from_block(pos))
            .map(|v| v.to_vec())
            .unwrap_or_default();
        found.extend(self.oversized.iter().copied());
        found
    }

    /// Distinct claims filed under any bucket `bounds` touches, in ascending
    /// id order. Candidates only.
    pub fn query_bounds(&self, bounds: &ClaimBounds) -> Vec<ClaimId> {
        if BucketKey::span(bounds) > MAX_CLAIM_BUCKETS {
            let mut all: Vec<ClaimId> = self.entries.keys().copied().collect();
            all.sort_unstable();
            return all;
        }

        let mut seen = FxHashSet::default();
        let mut found: Vec<ClaimId> = self.oversized.iter().copied().collect();
        seen.extend(found.iter().copied());
        for key in BucketKey::covering(bounds) {
            if let Some(bucket) = self.buckets.get(&key) {
                for id in bucket {
                    if seen.insert(*id) {
                        found.push(*id);
                    }
                }
            }
        }
        found.sort_unstable();
        found
    }

    /// `true` if `id` is filed under exactly the buckets `bounds` touches.
    pub fn is_consistent_with(&self, id: ClaimId, bounds: &ClaimBounds) -> bool {
        let Some(keys) = self.entries.get(&id) else {
            return false;
        };
        if BucketKey::span(bounds) > MAX_CLAIM_BUCKETS {
            return keys.is_empty() && self.oversized.contains(&id);
        }
        let expected: Vec<BucketKey> = BucketKey::covering(bounds).collect();
        keys == &expected
            && expected.iter().all(|key| {
                self.buckets
                    .get(key)
                    .is_some_and(|bucket| bucket.contains(&id))
            })
    }

    /// Iterates over all indexed claim ids.
    pub fn ids(&self) -> impl Iterator<Item = &ClaimId> {
        self.entries.keys()
    }
}
