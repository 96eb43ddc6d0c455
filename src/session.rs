//! Engine API (C6.5): `Session` is the single owning handle a host process
//! holds for one open slide directory.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, info_span};

use crate::cache::{CacheStats, DecodedRef, TileCache, TileCoord};
use crate::error::EngineResult;
use crate::format::SlideDescriptor;
use crate::pack::PackReader;
use crate::scheduler::{PrefetchConfig, PrefetchScheduler};
use crate::viewport::{level_for_scale, visible_tiles, ViewportRect};

/// Construction-time tunables, per spec §10.3. All defaults match §4/§5.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub l1_budget_bytes: usize,
    pub l2_budget_bytes: usize,
    pub prefetch_distance_tiles: u32,
    pub lookahead_seconds: f64,
    pub worker_threads: usize,
    pub queue_depth: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            l1_budget_bytes: 4 * 1024 * 1024 * 1024,
            l2_budget_bytes: 32 * 1024 * 1024 * 1024,
            prefetch_distance_tiles: 2,
            lookahead_seconds: 0.25,
            worker_threads: num_cpus::get().min(8).max(1),
            queue_depth: 512,
        }
    }
}

impl SessionConfig {
    fn prefetch_config(&self) -> PrefetchConfig {
        PrefetchConfig {
            lookahead_seconds: self.lookahead_seconds,
            prefetch_distance: self.prefetch_distance_tiles,
            queue_capacity: self.queue_depth,
            worker_count: self.worker_threads,
            ..Default::default()
        }
    }
}

/// The owning handle for one open `.fastpath` slide directory. Assembles
/// the pack reader, the cache, and the scheduler as peers and tears them
/// down in the fixed order described in §9/§10.5.
pub struct Session {
    descriptor: Arc<SlideDescriptor>,
    pack: Arc<PackReader>,
    cache: Arc<TileCache>,
    scheduler: PrefetchScheduler,
}

impl Session {
    /// Open a `.fastpath` directory. Fails atomically: no session state is
    /// left behind if any step errors.
    pub fn open(slide_dir: &Path, config: SessionConfig) -> EngineResult<Self> {
        let _span = info_span!("session_open", slide_dir = %slide_dir.display()).entered();

        let descriptor = Arc::new(SlideDescriptor::load(slide_dir)?);
        let pack = Arc::new(PackReader::open(slide_dir, &descriptor)?);
        let cache = Arc::new(TileCache::new(config.l1_budget_bytes, config.l2_budget_bytes));
        let scheduler = PrefetchScheduler::new(
            Arc::clone(&cache),
            Arc::clone(&pack),
            Arc::clone(&descriptor),
            config.prefetch_config(),
        );

        info!(
            dimensions = ?descriptor.dimensions,
            levels = descriptor.num_levels(),
            "slide opened"
        );
        scheduler.prewarm_low_res();

        Ok(Self {
            descriptor,
            pack,
            cache,
            scheduler,
        })
    }

    pub fn metadata(&self) -> &SlideDescriptor {
        &self.descriptor
    }

    pub fn level_for_scale(&self, scale: f64) -> u32 {
        level_for_scale(&self.descriptor, scale)
    }

    pub fn visible_tiles(&self, x: f64, y: f64, w: f64, h: f64, scale: f64) -> Vec<TileCoord> {
        visible_tiles(&self.descriptor, ViewportRect::new(x, y, w, h), scale)
    }

    /// Nonblocking lookup; never touches disk.
    pub fn get_tile_l1(&self, level: u32, col: u32, row: u32) -> Option<DecodedRef> {
        self.cache.get_l1(TileCoord::new(level, col, row))
    }

    /// Synchronous fetch; may block on pack-read + decode for a cold coord.
    pub fn fetch_tile(&self, level: u32, col: u32, row: u32) -> EngineResult<Option<DecodedRef>> {
        self.cache.fetch(TileCoord::new(level, col, row), &self.pack)
    }

    pub fn filter_cached(&self, coords: &[TileCoord]) -> Vec<TileCoord> {
        self.cache.filter_cached(coords)
    }

    /// Submit a viewport update; recomputes and coalesces the prefetch
    /// queue, then returns without waiting for background work.
    pub fn update_viewport(&self, x: f64, y: f64, w: f64, h: f64, scale: f64, vx: f64, vy: f64) {
        self.scheduler
            .update_viewport(ViewportRect::new(x, y, w, h), scale, vx, vy);
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Tear down in the fixed order: scheduler stop → worker join → cache
    /// drain → pack reader close. Terminal; the session cannot be reused.
    pub fn close(self) {
        info!("slide closing");
        self.scheduler.stop();
        self.cache.clear();
        drop(self.pack);
    }
}
