//! Tile serving engine for whole-slide pathology image viewers.
//!
//! A slide is preprocessed once into a `.fastpath` directory: a packed,
//! multi-resolution tile pyramid plus a metadata descriptor. This crate
//! opens that directory and serves decoded RGB tiles to an interactive
//! viewer driving a viewport, keeping pan/zoom responsive by random-
//! accessing tiles through a memory-mapped pack reader and a two-tier
//! cache fed by a velocity-biased prefetch scheduler.
//!
//! The UI/rendering layer, the pyramid builder, and any process-level
//! session or plugin glue are out of scope — this crate is a reusable
//! library a shell wraps.

mod cache;
mod decoder;
mod error;
mod format;
mod pack;
mod scheduler;
mod session;
mod viewport;

#[cfg(test)]
mod test_support;

pub use cache::{CacheStats, DecodedRef, TileCache, TileCoord};
pub use decoder::{CompressedTileData, TileData};
pub use error::{EngineError, EngineResult};
pub use format::{LevelInfo, SlideDescriptor};
pub use pack::PackReader;
pub use scheduler::{PrefetchConfig, PrefetchScheduler};
pub use session::{Session, SessionConfig};
pub use viewport::{level_for_scale, tiles_in_rect, visible_tiles, ViewportRect};
