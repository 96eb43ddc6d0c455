//! Memory-mapped packed tile reader (C1).
//!
//! Per level, a `.pack` file (raw concatenated JPEG bytestreams, no framing)
//! and an `.idx` file (fixed binary layout, see module constants) are
//! memory-mapped. `read()` resolves `(level, col, row)` to a borrowed slice
//! into the mapping with no copy.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::{EngineError, EngineResult};
use crate::format::SlideDescriptor;

const INDEX_MAGIC: &[u8; 8] = b"FPTIDX1\0";
const INDEX_VERSION: u32 = 1;
const INDEX_HEADER_SIZE: usize = 16;
const LEVEL_TABLE_ENTRY_SIZE: usize = 24;
const TILE_ENTRY_SIZE: usize = 16;

#[derive(Debug, Clone, Copy)]
struct TileEntry {
    pack_offset: u64,
    length: u32,
}

struct LevelPack {
    level: u32,
    cols: u32,
    rows: u32,
    entries: Vec<TileEntry>,
    pack: Arc<Mmap>,
}

impl LevelPack {
    /// Entry for `(col, row)` within this level, or `None` if out of bounds
    /// or the tile is absent (`length == 0`).
    fn entry(&self, col: u32, row: u32) -> Option<TileEntry> {
        if col >= self.cols || row >= self.rows {
            return None;
        }
        let idx = (row * self.cols + col) as usize;
        let entry = self.entries[idx];
        if entry.length == 0 {
            None
        } else {
            Some(entry)
        }
    }
}

/// Memory-mapped multi-level packed tile store.
///
/// Read-only after construction; freely shared across threads. Dropping the
/// reader invalidates all slices previously handed out — the cache must
/// drain before the reader is closed.
pub struct PackReader {
    levels: Vec<LevelPack>,
}

/// Parse and validate one level's `.idx` file contents against the byte
/// layout in spec §6.3, cross-checked against the level's metadata geometry.
fn parse_index(level: u32, idx_bytes: &[u8], pack_len: u64, expect_cols: u32, expect_rows: u32) -> EngineResult<(u32, u32, Vec<TileEntry>)> {
    if idx_bytes.len() < INDEX_HEADER_SIZE {
        return Err(EngineError::IndexCorrupt(format!(
            "level_{level}.idx shorter than header"
        )));
    }

    let magic = &idx_bytes[0..8];
    if magic != INDEX_MAGIC {
        return Err(EngineError::IndexCorrupt(format!(
            "level_{level}.idx bad magic"
        )));
    }

    let version = u32::from_le_bytes(idx_bytes[8..12].try_into().unwrap());
    if version != INDEX_VERSION {
        return Err(EngineError::IndexCorrupt(format!(
            "level_{level}.idx unsupported version {version}"
        )));
    }

    let level_count = u32::from_le_bytes(idx_bytes[12..16].try_into().unwrap()) as usize;
    if level_count == 0 {
        return Err(EngineError::IndexCorrupt(format!(
            "level_{level}.idx has zero level_count"
        )));
    }

    let level_table_bytes = level_count
        .checked_mul(LEVEL_TABLE_ENTRY_SIZE)
        .ok_or_else(|| EngineError::IndexCorrupt(format!("level_{level}.idx level table overflow")))?;
    let level_table_end = INDEX_HEADER_SIZE + level_table_bytes;
    if idx_bytes.len() < level_table_end {
        return Err(EngineError::IndexCorrupt(format!(
            "level_{level}.idx missing level table"
        )));
    }

    // This implementation stores exactly one level per index file; read the
    // first (and only) level table entry.
    let row_start = INDEX_HEADER_SIZE;
    let level_id = u32::from_le_bytes(idx_bytes[row_start..row_start + 4].try_into().unwrap());
    let cols = u32::from_le_bytes(idx_bytes[row_start + 4..row_start + 8].try_into().unwrap());
    let rows = u32::from_le_bytes(idx_bytes[row_start + 8..row_start + 12].try_into().unwrap());
    let entries_offset =
        u64::from_le_bytes(idx_bytes[row_start + 12..row_start + 20].try_into().unwrap());

    if level_id != level {
        return Err(EngineError::IndexCorrupt(format!(
            "level_{level}.idx declares level_id {level_id}, expected {level}"
        )));
    }
    if cols != expect_cols || rows != expect_rows {
        return Err(EngineError::IndexCorrupt(format!(
            "level_{level}.idx geometry {cols}x{rows} does not match metadata {expect_cols}x{expect_rows}"
        )));
    }

    let entry_count = (cols as u64).saturating_mul(rows as u64);
    let entries_bytes = entry_count
        .checked_mul(TILE_ENTRY_SIZE as u64)
        .ok_or_else(|| EngineError::IndexCorrupt(format!("level_{level}.idx entry table overflow")))?;
    let expected_total = entries_offset
        .checked_add(entries_bytes)
        .ok_or_else(|| EngineError::IndexCorrupt(format!("level_{level}.idx entries_offset overflow")))?;
    if (idx_bytes.len() as u64) < expected_total {
        return Err(EngineError::IndexCorrupt(format!(
            "level_{level}.idx shorter than entry table requires"
        )));
    }

    let mut entries = Vec::with_capacity(entry_count as usize);
    let mut cursor = entries_offset as usize;
    for _ in 0..entry_count {
        let pack_offset =
            u64::from_le_bytes(idx_bytes[cursor..cursor + 8].try_into().unwrap());
        let length = u32::from_le_bytes(idx_bytes[cursor + 8..cursor + 12].try_into().unwrap());
        let flags = u32::from_le_bytes(idx_bytes[cursor + 12..cursor + 16].try_into().unwrap());
        if flags != 0 {
            return Err(EngineError::IndexCorrupt(format!(
                "level_{level}.idx entry at offset {cursor} has nonzero flags {flags}"
            )));
        }
        let end = pack_offset
            .checked_add(length as u64)
            .ok_or_else(|| EngineError::IndexCorrupt(format!("level_{level}.idx entry offset+length overflow")))?;
        if length > 0 && end > pack_len {
            return Err(EngineError::IndexCorrupt(format!(
                "level_{level}.idx entry [{pack_offset}..{end}) exceeds pack size {pack_len}"
            )));
        }
        entries.push(TileEntry { pack_offset, length });
        cursor += TILE_ENTRY_SIZE;
    }

    Ok((cols, rows, entries))
}

impl PackReader {
    /// Open a `.fastpath` directory's `tiles/` subdirectory, one pack+index
    /// pair per level declared in `metadata`.
    pub fn open(fastpath_dir: &Path, metadata: &SlideDescriptor) -> EngineResult<Self> {
        let tiles_dir = fastpath_dir.join("tiles");
        if !tiles_dir.exists() {
            return Err(EngineError::NotFound(format!(
                "tiles directory not found in {:?}",
                fastpath_dir
            )));
        }

        let mut levels = Vec::with_capacity(metadata.levels.len());
        for level_info in &metadata.levels {
            let level = level_info.level;
            let pack_path = tiles_dir.join(format!("level_{level}.pack"));
            let idx_path = tiles_dir.join(format!("level_{level}.idx"));

            if !pack_path.exists() {
                return Err(EngineError::NotFound(format!("{:?} not found", pack_path)));
            }
            if !idx_path.exists() {
                return Err(EngineError::NotFound(format!("{:?} not found", idx_path)));
            }

            let pack_file = File::open(&pack_path)?;
            let pack_len = pack_file.metadata()?.len();
            // SAFETY: the pack file is not expected to be mutated while mapped;
            // the engine treats the slide directory as read-only input.
            let pack_mmap = unsafe { Mmap::map(&pack_file)? };
            let pack = Arc::new(pack_mmap);

            let idx_file = File::open(&idx_path)?;
            let idx_bytes = std::fs::read(&idx_path)?;
            drop(idx_file);

            let (cols, rows, entries) =
                parse_index(level, &idx_bytes, pack_len, level_info.cols, level_info.rows)?;

            levels.push(LevelPack {
                level,
                cols,
                rows,
                entries,
                pack,
            });
        }

        levels.sort_by_key(|l| l.level);
        Ok(Self { levels })
    }

    fn find_level(&self, level: u32) -> Option<&LevelPack> {
        self.levels.iter().find(|l| l.level == level)
    }

    /// Resolve `(level, col, row)` to a borrowed slice of JPEG bytes.
    ///
    /// Returns `None` if the tile is absent (zero-length entry) or the
    /// coordinate is out of bounds. Never errors: out-of-range reads are a
    /// caller bug surfaced as "no tile here", not an I/O failure.
    pub fn read(&self, level: u32, col: u32, row: u32) -> Option<&[u8]> {
        let level_pack = self.find_level(level)?;
        let entry = level_pack.entry(col, row)?;
        let start = entry.pack_offset as usize;
        let end = start + entry.length as usize;
        Some(&level_pack.pack[start..end])
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_test_fastpath;
    use tempfile::TempDir;

    #[test]
    fn test_open_and_read_tile() {
        let temp = TempDir::new().unwrap();
        write_test_fastpath(temp.path());
        let metadata = SlideDescriptor::load(temp.path()).unwrap();
        let reader = PackReader::open(temp.path(), &metadata).unwrap();

        let bytes = reader.read(1, 0, 0);
        assert!(bytes.is_some());
        assert!(!bytes.unwrap().is_empty());
    }

    #[test]
    fn test_out_of_bounds_returns_none() {
        let temp = TempDir::new().unwrap();
        write_test_fastpath(temp.path());
        let metadata = SlideDescriptor::load(temp.path()).unwrap();
        let reader = PackReader::open(temp.path(), &metadata).unwrap();

        assert!(reader.read(1, 999, 999).is_none());
        assert!(reader.read(99, 0, 0).is_none());
    }

    #[test]
    fn test_missing_pack_directory() {
        let temp = TempDir::new().unwrap();
        write_test_fastpath(temp.path());
        std::fs::remove_dir_all(temp.path().join("tiles")).unwrap();
        let metadata = SlideDescriptor::load(temp.path()).unwrap();

        let result = PackReader::open(temp.path(), &metadata);
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }
}
