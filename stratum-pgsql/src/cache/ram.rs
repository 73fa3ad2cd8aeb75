//! Budgeted in-memory node coordinate cache.
//!
//! The id space is partitioned into blocks of 2¹³ consecutive ids. A
//! block's coordinates live either as individual entries in a shared
//! sparse map, or, once enough of the block is occupied to pay for it,
//! in a dense slot array indexed by `id mod 8192`. When the memory target
//! is reached in lossy mode, the least-recently-allocated dense block is
//! discarded; its coordinates are simply gone and later lookups fall
//! through to the flat file or the nodes table. A lookup therefore
//! returns either the coordinate that was stored for that id or a miss,
//! never a coordinate belonging to a different id.

use std::collections::{BTreeMap, HashMap, VecDeque};

use geo::Coord;
use log::{debug, warn};
use stratum_core::OsmId;

use crate::options::CoordRepr;

const BLOCK_SHIFT: u32 = 13;
const BLOCK_SIZE: usize = 1 << BLOCK_SHIFT;
/// Sparse entries a block accumulates before it is worth a dense array.
const DENSE_THRESHOLD: usize = BLOCK_SIZE / 16;

/// Slot bytes in a dense block (one `Coord<f64>`).
const SLOT_BYTES: usize = 16;
const DENSE_BLOCK_BYTES: usize = BLOCK_SIZE * SLOT_BYTES;
/// Approximate cost of one sparse entry (key + coordinate + tree node).
const SPARSE_ENTRY_BYTES: usize = 48;

const EMPTY_SLOT: Coord<f64> = Coord {
    x: f64::NAN,
    y: f64::NAN,
};

fn block_index(id: OsmId) -> i64 {
    id >> BLOCK_SHIFT
}

fn slot_index(id: OsmId) -> usize {
    (id & (BLOCK_SIZE as i64 - 1)) as usize
}

/// Lossy, block-structured positional cache of node coordinates.
///
/// Coordinates are quantised through the storage representation on
/// `set`, so a RAM hit is bit-identical to the same node read back from
/// the flat file or the nodes table.
pub struct NodeRamCache {
    repr: CoordRepr,
    lossy: bool,
    capacity_bytes: usize,
    used_bytes: usize,
    dense: HashMap<i64, Vec<Coord<f64>>>,
    /// Dense block indexes in allocation order; eviction pops the front.
    alloc_order: VecDeque<i64>,
    sparse: BTreeMap<OsmId, Coord<f64>>,
    /// Sparse occupancy per not-yet-dense block.
    sparse_fill: HashMap<i64, usize>,
    full_warned: bool,
    stored: u64,
    hits: u64,
    misses: u64,
}

impl NodeRamCache {
    /// Creates a cache with a memory target of `cache_mib` MiB.
    ///
    /// In lossy mode (the normal configuration for large imports) old
    /// blocks are evicted once the target is reached; otherwise the cache
    /// stops accepting new entries.
    #[must_use]
    pub fn new(cache_mib: usize, repr: CoordRepr, lossy: bool) -> Self {
        Self::with_capacity_bytes(cache_mib * 1024 * 1024, repr, lossy)
    }

    fn with_capacity_bytes(capacity_bytes: usize, repr: CoordRepr, lossy: bool) -> Self {
        Self {
            repr,
            lossy,
            capacity_bytes,
            used_bytes: 0,
            dense: HashMap::new(),
            alloc_order: VecDeque::new(),
            sparse: BTreeMap::new(),
            sparse_fill: HashMap::new(),
            full_warned: false,
            stored: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Stores a coordinate. Tags carried alongside node upserts are not
    /// this cache's concern and never reach it.
    pub fn set(&mut self, id: OsmId, location: Coord<f64>) {
        let location = Coord {
            x: self.repr.quantize(location.x),
            y: self.repr.quantize(location.y),
        };

        let block = block_index(id);
        if let Some(slots) = self.dense.get_mut(&block) {
            slots[slot_index(id)] = location;
            self.stored += 1;
            return;
        }

        if let Some(existing) = self.sparse.get_mut(&id) {
            *existing = location;
            self.stored += 1;
            return;
        }

        let fill = self.sparse_fill.get(&block).copied().unwrap_or(0) + 1;
        if fill >= DENSE_THRESHOLD {
            if self.make_room(DENSE_BLOCK_BYTES) {
                self.promote_block(block);
                // Promotion cannot race the id we are inserting: it only
                // migrates entries already in the sparse map.
                if let Some(slots) = self.dense.get_mut(&block) {
                    slots[slot_index(id)] = location;
                }
                self.stored += 1;
                return;
            }
        } else if self.make_room(SPARSE_ENTRY_BYTES) {
            self.sparse.insert(id, location);
            self.sparse_fill.insert(block, fill);
            self.used_bytes += SPARSE_ENTRY_BYTES;
            self.stored += 1;
            return;
        }

        if !self.full_warned {
            warn!(
                "node cache is full at {} MiB; further nodes will not be cached",
                self.capacity_bytes / (1024 * 1024)
            );
            self.full_warned = true;
        }
    }

    /// Looks up a coordinate; `None` means the id was never stored here
    /// or its block has been evicted.
    pub fn get(&mut self, id: OsmId) -> Option<Coord<f64>> {
        let found = self
            .dense
            .get(&block_index(id))
            .map(|slots| slots[slot_index(id)])
            .filter(|c| !c.x.is_nan())
            .or_else(|| self.sparse.get(&id).copied());
        match found {
            Some(c) => {
                self.hits += 1;
                Some(c)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Moves a block's sparse entries into a freshly allocated dense
    /// array.
    fn promote_block(&mut self, block: i64) {
        let mut slots = vec![EMPTY_SLOT; BLOCK_SIZE];
        let base = block << BLOCK_SHIFT;
        let range = base..base + BLOCK_SIZE as i64;
        let migrated: Vec<(OsmId, Coord<f64>)> = self
            .sparse
            .range(range)
            .map(|(id, c)| (*id, *c))
            .collect();
        for (id, c) in migrated {
            self.sparse.remove(&id);
            self.used_bytes -= SPARSE_ENTRY_BYTES;
            slots[slot_index(id)] = c;
        }
        self.sparse_fill.remove(&block);
        self.dense.insert(block, slots);
        self.alloc_order.push_back(block);
        self.used_bytes += DENSE_BLOCK_BYTES;
    }

    /// Frees space until `wanted` more bytes fit, evicting the oldest
    /// dense blocks in lossy mode. Returns false when the space cannot
    /// be made.
    fn make_room(&mut self, wanted: usize) -> bool {
        while self.used_bytes + wanted > self.capacity_bytes {
            if !self.lossy {
                return false;
            }
            let Some(oldest) = self.alloc_order.pop_front() else {
                return false;
            };
            self.dense.remove(&oldest);
            self.used_bytes -= DENSE_BLOCK_BYTES;
            debug!("evicted node cache block {oldest}");
        }
        true
    }

    /// Bytes currently accounted against the memory target.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }
}

impl Drop for NodeRamCache {
    fn drop(&mut self) {
        let requests = self.hits + self.misses;
        if requests > 0 {
            debug!(
                "node cache: {} stored, {}/{} lookups served ({:.1}%)",
                self.stored,
                self.hits,
                requests,
                100.0 * self.hits as f64 / requests as f64
            );
        }
    }
}
