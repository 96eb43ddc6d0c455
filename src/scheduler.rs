//! Prefetch scheduler (C5): priority work queue driven by viewport updates,
//! a fixed worker pool, and velocity-biased lookahead.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::cache::{TileCache, TileCoord};
use crate::format::SlideDescriptor;
use crate::pack::PackReader;
use crate::viewport::{level_for_scale, tiles_in_rect, ViewportRect};

/// Tunables for prefetch work generation, per spec §4.5.
#[derive(Debug, Clone, Copy)]
pub struct PrefetchConfig {
    /// Seconds of pan motion to extrapolate when building the velocity halo.
    pub lookahead_seconds: f64,
    /// Tile-widths of margin used to build the spatial halo.
    pub prefetch_distance: u32,
    /// Maximum pending (unclaimed) work items; lowest priority is shed first.
    pub queue_capacity: usize,
    /// Worker thread count.
    pub worker_count: usize,
    /// A level is eligible for low-res pre-warm if it has at most this many
    /// tiles in total.
    pub low_res_max_tiles_per_level: u32,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            lookahead_seconds: 0.25,
            prefetch_distance: 2,
            queue_capacity: 512,
            worker_count: num_cpus::get().min(8).max(1),
            low_res_max_tiles_per_level: 64,
        }
    }
}

/// Priority tiers, lowest to highest; `Ord` derives from declaration order so
/// `Visible` sorts greatest and is popped first from the max-heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Priority {
    LowResFallback,
    SpatialHalo,
    VelocityHalo,
    Visible,
}

#[derive(Debug, Clone, Copy)]
struct WorkItem {
    coord: TileCoord,
    priority: Priority,
    distance: f64,
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.coord == other.coord
    }
}
impl Eq for WorkItem {}

impl Ord for WorkItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| (-self.distance).total_cmp(&(-other.distance)))
    }
}
impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct WorkQueue {
    heap: BinaryHeap<WorkItem>,
    queued: HashSet<TileCoord>,
    shutdown: bool,
}

impl WorkQueue {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            queued: HashSet::new(),
            shutdown: false,
        }
    }

    /// Drop queued items not present in `keep`, then push `items` not
    /// already queued, shedding the lowest-priority pending item when the
    /// capacity would be exceeded. `Visible`-tier items are never shed.
    fn coalesce(&mut self, keep: &HashSet<TileCoord>, items: Vec<WorkItem>, capacity: usize) {
        if !self.heap.is_empty() {
            let retained: Vec<WorkItem> = self.heap.drain().filter(|i| keep.contains(&i.coord)).collect();
            self.queued = retained.iter().map(|i| i.coord).collect();
            self.heap = retained.into_iter().collect();
        }

        for item in items {
            if self.queued.contains(&item.coord) {
                continue;
            }
            if self.heap.len() >= capacity {
                if !self.shed_one_below(item.priority) {
                    continue;
                }
            }
            self.queued.insert(item.coord);
            self.heap.push(item);
        }
    }

    /// Remove the single lowest-priority item if it is strictly lower
    /// priority than `incoming`. Returns whether room was made.
    fn shed_one_below(&mut self, incoming: Priority) -> bool {
        let mut items: Vec<WorkItem> = self.heap.drain().collect();
        let Some((idx, _)) = items
            .iter()
            .enumerate()
            .filter(|(_, i)| i.priority < incoming)
            .min_by(|a, b| a.1.cmp(b.1))
        else {
            self.heap = items.into_iter().collect();
            return false;
        };
        let removed = items.swap_remove(idx);
        self.queued.remove(&removed.coord);
        self.heap = items.into_iter().collect();
        true
    }
}

/// Drives background tile fetches ahead of the viewer, biased by pan
/// velocity. Does not own the cache or pack reader — both are borrowed for
/// the scheduler's lifetime by the owning `Session`.
pub struct PrefetchScheduler {
    state: Arc<(Mutex<WorkQueue>, Condvar)>,
    cancelled: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cache: Arc<TileCache>,
    pack: Arc<PackReader>,
    descriptor: Arc<SlideDescriptor>,
    config: PrefetchConfig,
}

impl PrefetchScheduler {
    pub fn new(
        cache: Arc<TileCache>,
        pack: Arc<PackReader>,
        descriptor: Arc<SlideDescriptor>,
        config: PrefetchConfig,
    ) -> Self {
        let state = Arc::new((Mutex::new(WorkQueue::new()), Condvar::new()));
        let cancelled = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(config.worker_count);
        for id in 0..config.worker_count {
            let state = Arc::clone(&state);
            let cancelled = Arc::clone(&cancelled);
            let cache = Arc::clone(&cache);
            let pack = Arc::clone(&pack);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("fastpath-prefetch-{id}"))
                    .spawn(move || worker_loop(state, cancelled, cache, pack))
                    .expect("failed to spawn prefetch worker"),
            );
        }

        Self {
            state,
            cancelled,
            workers: Mutex::new(workers),
            cache,
            pack,
            descriptor,
            config,
        }
    }

    /// Recompute the ranked work set for a viewport update and coalesce it
    /// into the live queue, per §4.5.
    pub fn update_viewport(&self, rect: ViewportRect, scale: f64, velocity_x: f64, velocity_y: f64) {
        if scale <= 0.0 || rect.width <= 0.0 || rect.height <= 0.0 {
            return;
        }
        let level = level_for_scale(&self.descriptor, scale);
        let Some(level_info) = self.descriptor.get_level(level) else {
            return;
        };

        let center = (rect.x + rect.width / 2.0, rect.y + rect.height / 2.0);
        let distance = |coord: TileCoord, downsample: u32| -> f64 {
            let tile_px = (self.descriptor.tile_size as f64) * (downsample as f64);
            let tx = (coord.col as f64 + 0.5) * tile_px;
            let ty = (coord.row as f64 + 0.5) * tile_px;
            ((tx - center.0).powi(2) + (ty - center.1).powi(2)).sqrt()
        };

        let visible = tiles_in_rect(self.descriptor.tile_size, level_info, rect);
        let visible_set: HashSet<TileCoord> = visible.iter().copied().collect();

        let predicted_rect = rect.offset(
            velocity_x * self.config.lookahead_seconds,
            velocity_y * self.config.lookahead_seconds,
        );
        let predicted = tiles_in_rect(self.descriptor.tile_size, level_info, predicted_rect);
        let velocity_halo: Vec<TileCoord> = predicted
            .into_iter()
            .filter(|c| !visible_set.contains(c))
            .collect();
        let velocity_set: HashSet<TileCoord> = velocity_halo.iter().copied().collect();

        let margin = (self.config.prefetch_distance as f64) * (self.descriptor.tile_size as f64) * (level_info.downsample as f64);
        let inflated_rect = rect.inflate(margin);
        let inflated = tiles_in_rect(self.descriptor.tile_size, level_info, inflated_rect);
        let spatial_halo: Vec<TileCoord> = inflated
            .into_iter()
            .filter(|c| !visible_set.contains(c) && !velocity_set.contains(c))
            .collect();

        let mut low_res_fallback = Vec::new();
        for lower in self.descriptor.levels.iter().filter(|l| l.level < level) {
            low_res_fallback.extend(tiles_in_rect(self.descriptor.tile_size, lower, rect));
        }

        let mut keep = HashSet::new();
        keep.extend(visible.iter().copied());
        keep.extend(velocity_halo.iter().copied());
        keep.extend(spatial_halo.iter().copied());
        keep.extend(low_res_fallback.iter().copied());

        let mut items = Vec::with_capacity(keep.len());
        for coord in &visible {
            items.push(WorkItem {
                coord: *coord,
                priority: Priority::Visible,
                distance: distance(*coord, level_info.downsample),
            });
        }
        for coord in &velocity_halo {
            items.push(WorkItem {
                coord: *coord,
                priority: Priority::VelocityHalo,
                distance: distance(*coord, level_info.downsample),
            });
        }
        for coord in &spatial_halo {
            items.push(WorkItem {
                coord: *coord,
                priority: Priority::SpatialHalo,
                distance: distance(*coord, level_info.downsample),
            });
        }
        for coord in &low_res_fallback {
            let ds = self
                .descriptor
                .get_level(coord.level)
                .map(|l| l.downsample)
                .unwrap_or(level_info.downsample);
            items.push(WorkItem {
                coord: *coord,
                priority: Priority::LowResFallback,
                distance: distance(*coord, ds),
            });
        }

        let (lock, cvar) = &*self.state;
        {
            let mut queue = lock.lock();
            queue.coalesce(&keep, items, self.config.queue_capacity);
        }
        cvar.notify_all();
    }

    /// Synchronously warm L2 (not L1) with the pack bytes of every tile at
    /// levels small enough to be cheap, so the very first render has a
    /// usable fallback at any zoom. Run once from `Session::open`.
    pub fn prewarm_low_res(&self) {
        let mut total = 0usize;
        for level_info in &self.descriptor.levels {
            if level_info.cols * level_info.rows > self.config.low_res_max_tiles_per_level {
                continue;
            }
            for row in 0..level_info.rows {
                for col in 0..level_info.cols {
                    let coord = TileCoord::new(level_info.level, col, row);
                    if let Some(bytes) = self.pack.read(coord.level, coord.col, coord.row) {
                        self.cache.insert_jpeg(coord, bytes::Bytes::copy_from_slice(bytes));
                        total += 1;
                    }
                }
            }
        }
        info!(tiles = total, "low-res pre-warm complete");
    }

    /// Stop accepting new work, signal in-progress workers to cancel
    /// between pack-read and decode, discard everything still queued, and
    /// join all worker threads. Idempotent.
    pub fn stop(&self) {
        self.cancelled.store(true, AtomicOrdering::Release);
        {
            let (lock, cvar) = &*self.state;
            let mut queue = lock.lock();
            queue.shutdown = true;
            queue.heap.clear();
            queue.queued.clear();
            cvar.notify_all();
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock();
            std::mem::take(&mut *workers)
        };
        for handle in handles {
            let _ = handle.join();
        }
        debug!("prefetch scheduler stopped");
    }
}

impl Drop for PrefetchScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    state: Arc<(Mutex<WorkQueue>, Condvar)>,
    cancelled: Arc<AtomicBool>,
    cache: Arc<TileCache>,
    pack: Arc<PackReader>,
) {
    let (lock, cvar) = &*state;
    loop {
        let item = {
            let mut queue = lock.lock();
            loop {
                if queue.shutdown {
                    return;
                }
                if let Some(item) = queue.heap.pop() {
                    queue.queued.remove(&item.coord);
                    break item;
                }
                cvar.wait(&mut queue);
            }
        };

        if cancelled.load(AtomicOrdering::Acquire) {
            continue;
        }
        match cache.fetch_cancellable(item.coord, &pack, &cancelled) {
            Ok(_) => {}
            Err(e) => debug!(?item.coord, error = %e, "prefetch fetch failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::pack_tiles;
    use std::time::Duration;

    fn descriptor_single_level(cols: u32, rows: u32) -> Arc<SlideDescriptor> {
        Arc::new(SlideDescriptor {
            version: "2".into(),
            source_file: String::new(),
            source_mpp: 0.25,
            target_mpp: 0.5,
            target_magnification: 20.0,
            tile_size: 512,
            dimensions: (cols * 512, rows * 512),
            levels: vec![crate::format::LevelInfo {
                level: 0,
                downsample: 1,
                cols,
                rows,
            }],
            background_color: (255, 255, 255),
            preprocessed_at: String::new(),
            tile_format: "pack_v2".into(),
        })
    }

    #[test]
    fn test_update_viewport_eventually_populates_l1() {
        let (pack, _tmp) = pack_tiles(0, 4, 4);
        let descriptor = descriptor_single_level(4, 4);
        let cache = Arc::new(TileCache::new(10 * 1024 * 1024, 10 * 1024 * 1024));
        let scheduler = PrefetchScheduler::new(
            Arc::clone(&cache),
            Arc::new(pack),
            descriptor,
            PrefetchConfig {
                worker_count: 2,
                ..Default::default()
            },
        );

        scheduler.update_viewport(ViewportRect::new(0.0, 0.0, 512.0, 512.0), 1.0, 0.0, 0.0);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            if cache.get_l1(TileCoord::new(0, 0, 0)).is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(cache.get_l1(TileCoord::new(0, 0, 0)).is_some());
        scheduler.stop();
    }

    #[test]
    fn test_prewarm_low_res_fills_l2_not_l1() {
        let (pack, _tmp) = pack_tiles(0, 2, 2);
        let descriptor = descriptor_single_level(2, 2);
        let cache = Arc::new(TileCache::new(10 * 1024 * 1024, 10 * 1024 * 1024));
        let scheduler = PrefetchScheduler::new(
            Arc::clone(&cache),
            Arc::new(pack),
            descriptor,
            PrefetchConfig {
                worker_count: 1,
                ..Default::default()
            },
        );

        scheduler.prewarm_low_res();
        let stats = cache.stats();
        assert_eq!(stats.l2_count, 4);
        assert_eq!(stats.l1_count, 0);
        scheduler.stop();
    }

    #[test]
    fn test_zero_velocity_still_prefetches_spatial_halo() {
        let (pack, _tmp) = pack_tiles(0, 4, 4);
        let descriptor = descriptor_single_level(4, 4);
        let cache = Arc::new(TileCache::new(10 * 1024 * 1024, 10 * 1024 * 1024));
        let scheduler = PrefetchScheduler::new(
            Arc::clone(&cache),
            Arc::new(pack),
            descriptor,
            PrefetchConfig {
                worker_count: 2,
                prefetch_distance: 1,
                ..Default::default()
            },
        );

        scheduler.update_viewport(ViewportRect::new(512.0, 512.0, 512.0, 512.0), 1.0, 0.0, 0.0);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if cache.stats().l1_count >= 1 || std::time::Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(cache.stats().l1_count >= 1);
        scheduler.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (pack, _tmp) = pack_tiles(0, 1, 1);
        let descriptor = descriptor_single_level(1, 1);
        let cache = Arc::new(TileCache::new(1024 * 1024, 1024 * 1024));
        let scheduler = PrefetchScheduler::new(Arc::clone(&cache), Arc::new(pack), descriptor, PrefetchConfig {
            worker_count: 1,
            ..Default::default()
        });
        scheduler.stop();
        scheduler.stop();
    }
}
