//! Two-tier tile cache (C3): L1 decoded RGB + L2 compressed JPEG, with
//! independent byte budgets, LRU eviction, and single-flight fetch
//! coalescing.
//!
//! One coarse lock (`CacheGuts`) protects the LRU orders and the in-flight
//! table; it is held only for constant-time bookkeeping, never across I/O
//! or decode. L1/L2 data itself lives in `DashMap`s so a plain L1 hit never
//! touches the coarse lock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::decoder::{decode_jpeg_bytes, CompressedTileData, TileData};
use crate::error::{EngineError, EngineResult};
use crate::pack::PackReader;

/// Tile coordinate key: `(level, col, row)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCoord {
    pub level: u32,
    pub col: u32,
    pub row: u32,
}

impl TileCoord {
    pub fn new(level: u32, col: u32, row: u32) -> Self {
        Self { level, col, row }
    }
}

/// Shared-ownership handle to a decoded tile. Eviction drops only the
/// cache's own reference; a caller holding a clone keeps the buffer alive.
pub type DecodedRef = Arc<TileData>;

/// Cache statistics, per spec §4.3/§6.5.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l1_bytes: usize,
    pub l2_bytes: usize,
    pub l1_count: usize,
    pub l2_count: usize,
    pub inflight_count: usize,
}

/// A one-shot completion handle shared by all concurrent waiters fetching
/// the same coordinate. The first arriver dispatches the work; everyone
/// else blocks on `wait()` until it completes.
struct InFlight {
    result: Mutex<Option<EngineResult<Option<DecodedRef>>>>,
    cond: Condvar,
}

impl InFlight {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn wait(&self) -> EngineResult<Option<DecodedRef>> {
        let mut guard = self.result.lock();
        while guard.is_none() {
            self.cond.wait(&mut guard);
        }
        clone_result(guard.as_ref().unwrap())
    }

    fn complete(&self, result: EngineResult<Option<DecodedRef>>) {
        let mut guard = self.result.lock();
        *guard = Some(result);
        self.cond.notify_all();
    }
}

fn clone_result(r: &EngineResult<Option<DecodedRef>>) -> EngineResult<Option<DecodedRef>> {
    match r {
        Ok(v) => Ok(v.clone()),
        Err(e) => Err(EngineError::DecodeError(e.to_string())),
    }
}

/// Bookkeeping guarded by the cache's single coarse lock.
struct CacheGuts {
    l1_lru: VecDeque<TileCoord>,
    l2_lru: VecDeque<TileCoord>,
    in_flight: HashMap<TileCoord, Arc<InFlight>>,
}

pub struct TileCache {
    l1: DashMap<TileCoord, DecodedRef>,
    l2: DashMap<TileCoord, Arc<CompressedTileData>>,
    guts: Mutex<CacheGuts>,

    l1_budget_bytes: usize,
    l2_budget_bytes: usize,
    l1_bytes: AtomicUsize,
    l2_bytes: AtomicUsize,

    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
}

impl TileCache {
    pub fn new(l1_budget_bytes: usize, l2_budget_bytes: usize) -> Self {
        Self {
            l1: DashMap::new(),
            l2: DashMap::new(),
            guts: Mutex::new(CacheGuts {
                l1_lru: VecDeque::new(),
                l2_lru: VecDeque::new(),
                in_flight: HashMap::new(),
            }),
            l1_budget_bytes,
            l2_budget_bytes,
            l1_bytes: AtomicUsize::new(0),
            l2_bytes: AtomicUsize::new(0),
            l1_hits: AtomicU64::new(0),
            l1_misses: AtomicU64::new(0),
            l2_hits: AtomicU64::new(0),
            l2_misses: AtomicU64::new(0),
        }
    }

    /// Nonblocking L1-only lookup. Increments refcount on hit via `Arc`
    /// clone; never touches disk.
    pub fn get_l1(&self, coord: TileCoord) -> Option<DecodedRef> {
        // Clone and drop the DashMap shard guard before touching `guts` —
        // `touch_l1` takes `guts`, and holding a shard guard across that
        // call risks a shard->guts lock order opposite the guts->shard
        // order used everywhere a mutation happens (`install_l1`,
        // `evict_l1_if_needed`), which can deadlock.
        let hit = self.l1.get(&coord).map(|entry| entry.clone());
        match hit {
            Some(tile) => {
                self.l1_hits.fetch_add(1, Ordering::Relaxed);
                self.touch_l1(coord);
                Some(tile)
            }
            None => {
                self.l1_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Projection: of `coords`, return only those already resident in L1.
    pub fn filter_cached(&self, coords: &[TileCoord]) -> Vec<TileCoord> {
        coords.iter().copied().filter(|c| self.l1.contains_key(c)).collect()
    }

    /// Warm L2 without decoding (used by the low-res pre-warm pass).
    pub fn insert_jpeg(&self, coord: TileCoord, bytes: bytes::Bytes) {
        let compressed = Arc::new(CompressedTileData::new(bytes));
        let size = compressed.size_bytes();

        let mut guts = self.guts.lock();
        // L1 presence and in-flight status must be checked under the same
        // `guts` lock as the L2 insert below — otherwise a concurrent
        // `fetch` can promote/dispatch this coord in the gap, leaving it
        // in both L1 and L2 at once (violates tier exclusivity).
        if self.l1.contains_key(&coord) || guts.in_flight.contains_key(&coord) {
            return;
        }
        if self.l2.contains_key(&coord) {
            return;
        }
        if !self.evict_l2_if_needed(&mut guts, size) {
            // Budget could not be satisfied; skip caching, caller already has
            // the bytes it needs (this is only ever called with bytes the
            // caller already possesses).
            return;
        }
        self.l2.insert(coord, compressed);
        self.l2_bytes.fetch_add(size, Ordering::Relaxed);
        guts.l2_lru.push_back(coord);
    }

    /// Produce a decoded tile for `coord`, promoting through L1/L2/pack per
    /// the tier discipline in spec §4.3. Blocks the calling thread for the
    /// first arriver (pack-read + decode); later concurrent callers for the
    /// same coord share that single decode via the in-flight handle.
    ///
    /// Returns `Ok(None)` for an absent tile (zero-length index entry),
    /// never an error.
    pub fn fetch(&self, coord: TileCoord, pack: &PackReader) -> EngineResult<Option<DecodedRef>> {
        self.fetch_inner(coord, pack, None)
    }

    /// Same as `fetch`, but checked for cancellation between the pack-read
    /// and decode phases. Used by background prefetch workers.
    pub fn fetch_cancellable(
        &self,
        coord: TileCoord,
        pack: &PackReader,
        cancelled: &std::sync::atomic::AtomicBool,
    ) -> EngineResult<Option<DecodedRef>> {
        self.fetch_inner(coord, pack, Some(cancelled))
    }

    fn fetch_inner(
        &self,
        coord: TileCoord,
        pack: &PackReader,
        cancelled: Option<&std::sync::atomic::AtomicBool>,
    ) -> EngineResult<Option<DecodedRef>> {
        // Clone and drop the shard guard before `touch_l1` locks `guts` —
        // see the comment in `get_l1`.
        if let Some(v) = self.l1.get(&coord) {
            let tile = v.clone();
            drop(v);
            self.l1_hits.fetch_add(1, Ordering::Relaxed);
            self.touch_l1(coord);
            return Ok(Some(tile));
        }

        enum Action {
            Promote(Arc<CompressedTileData>),
            Wait(Arc<InFlight>),
            Dispatch(Arc<InFlight>),
        }

        let action = {
            let mut guts = self.guts.lock();
            // Re-check L1 under lock: another thread may have promoted
            // while we were acquiring it. Drop the shard guard, then the
            // `guts` guard, before `touch_l1` re-locks `guts`.
            if let Some(v) = self.l1.get(&coord) {
                let tile = v.clone();
                drop(v);
                drop(guts);
                self.l1_hits.fetch_add(1, Ordering::Relaxed);
                self.touch_l1(coord);
                return Ok(Some(tile));
            }
            self.l1_misses.fetch_add(1, Ordering::Relaxed);

            if let Some((_, compressed)) = self.l2.remove(&coord) {
                self.l2_bytes.fetch_sub(compressed.size_bytes(), Ordering::Relaxed);
                guts.l2_lru.retain(|c| *c != coord);
                self.l2_hits.fetch_add(1, Ordering::Relaxed);
                Action::Promote(compressed)
            } else if let Some(handle) = guts.in_flight.get(&coord) {
                self.l2_misses.fetch_add(1, Ordering::Relaxed);
                Action::Wait(handle.clone())
            } else {
                self.l2_misses.fetch_add(1, Ordering::Relaxed);
                let handle = Arc::new(InFlight::new());
                guts.in_flight.insert(coord, handle.clone());
                Action::Dispatch(handle)
            }
        };

        match action {
            Action::Promote(compressed) => {
                let tile = decode_jpeg_bytes(&compressed)?;
                let arc_tile = Arc::new(tile);
                self.install_l1(coord, arc_tile.clone());
                Ok(Some(arc_tile))
            }
            Action::Wait(handle) => handle.wait(),
            Action::Dispatch(handle) => {
                let result = self.do_fetch(coord, pack, cancelled);
                // Remove the in-flight sentinel before waking waiters so a
                // retry after a failure doesn't observe a stale entry.
                self.guts.lock().in_flight.remove(&coord);
                handle.complete(clone_result(&result));
                result
            }
        }
    }

    /// The actual pack-read + decode, run by whichever caller dispatched.
    fn do_fetch(
        &self,
        coord: TileCoord,
        pack: &PackReader,
        cancelled: Option<&std::sync::atomic::AtomicBool>,
    ) -> EngineResult<Option<DecodedRef>> {
        let jpeg_bytes = match pack.read(coord.level, coord.col, coord.row) {
            Some(b) => bytes::Bytes::copy_from_slice(b),
            None => return Ok(None),
        };

        if let Some(flag) = cancelled {
            if flag.load(Ordering::Acquire) {
                debug!(?coord, "prefetch cancelled before decode");
                return Ok(None);
            }
        }

        let compressed = CompressedTileData::new(jpeg_bytes);
        let tile = decode_jpeg_bytes(&compressed)?;
        let arc_tile = Arc::new(tile);
        self.install_l1(coord, arc_tile.clone());
        Ok(Some(arc_tile))
    }

    fn install_l1(&self, coord: TileCoord, tile: DecodedRef) {
        let size = tile.size_bytes();
        let mut guts = self.guts.lock();
        if self.l1.contains_key(&coord) {
            return;
        }
        self.evict_l1_if_needed(&mut guts, size);
        self.l1.insert(coord, tile);
        self.l1_bytes.fetch_add(size, Ordering::Relaxed);
        guts.l1_lru.push_back(coord);
    }

    fn touch_l1(&self, coord: TileCoord) {
        let mut guts = self.guts.lock();
        if let Some(pos) = guts.l1_lru.iter().position(|c| *c == coord) {
            guts.l1_lru.remove(pos);
            guts.l1_lru.push_back(coord);
        }
    }

    /// Evict L1 entries with refcount == 1 (cache's own reference only)
    /// until `new_size` bytes fit within budget.
    fn evict_l1_if_needed(&self, guts: &mut CacheGuts, new_size: usize) {
        let target = self.l1_budget_bytes.saturating_sub(new_size);
        let mut scanned = 0;
        let queue_len = guts.l1_lru.len();
        while self.l1_bytes.load(Ordering::Relaxed) > target && scanned < queue_len {
            let Some(coord) = guts.l1_lru.pop_front() else { break };
            scanned += 1;
            let Some(entry) = self.l1.get(&coord) else { continue };
            if Arc::strong_count(&entry) > 1 {
                // Still referenced by a caller; not evictable. Recirculate.
                drop(entry);
                guts.l1_lru.push_back(coord);
                continue;
            }
            drop(entry);
            if let Some((_, tile)) = self.l1.remove(&coord) {
                self.l1_bytes.fetch_sub(tile.size_bytes(), Ordering::Relaxed);
            }
        }
    }

    fn evict_l2_if_needed(&self, guts: &mut CacheGuts, new_size: usize) -> bool {
        let target = self.l2_budget_bytes.saturating_sub(new_size);
        let mut scanned = 0;
        let queue_len = guts.l2_lru.len();
        while self.l2_bytes.load(Ordering::Relaxed) > target && scanned < queue_len {
            let Some(coord) = guts.l2_lru.pop_front() else { break };
            scanned += 1;
            if let Some((_, compressed)) = self.l2.remove(&coord) {
                self.l2_bytes.fetch_sub(compressed.size_bytes(), Ordering::Relaxed);
            }
        }
        // L2 entries are never refcounted, so unlike L1 there is no
        // outstanding-reference exception: if eviction couldn't bring the
        // budget down far enough, reject the insertion outright rather
        // than overshoot.
        self.l2_bytes.load(Ordering::Relaxed) <= target
    }

    /// Flush everything, waiting for in-flight work to settle.
    pub fn clear(&self) {
        // Wait for any in-flight handles to complete so `clear` never races
        // a dispatcher installing into a freshly-cleared L1.
        let handles: Vec<Arc<InFlight>> = {
            let guts = self.guts.lock();
            guts.in_flight.values().cloned().collect()
        };
        for handle in handles {
            let _ = handle.wait();
        }

        let mut guts = self.guts.lock();
        self.l1.clear();
        self.l2.clear();
        guts.in_flight.clear();
        guts.l1_lru.clear();
        guts.l2_lru.clear();
        self.l1_bytes.store(0, Ordering::Relaxed);
        self.l2_bytes.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            l1_misses: self.l1_misses.load(Ordering::Relaxed),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            l2_misses: self.l2_misses.load(Ordering::Relaxed),
            l1_bytes: self.l1_bytes.load(Ordering::Relaxed),
            l2_bytes: self.l2_bytes.load(Ordering::Relaxed),
            l1_count: self.l1.len(),
            l2_count: self.l2.len(),
            inflight_count: self.guts.lock().in_flight.len(),
        }
    }
}
