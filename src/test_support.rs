//! Shared test fixtures: a minimal real JPEG, and helpers that write
//! spec-conformant pack/index files and `.fastpath` directories.

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use crate::format::SlideDescriptor;
use crate::pack::PackReader;

/// The smallest valid baseline JPEG commonly used as a test fixture: a
/// single 1x1 pixel, 3-component (YCbCr) image.
pub fn tiny_jpeg() -> Vec<u8> {
    vec![
        255, 216, 255, 224, 0, 16, 74, 70, 73, 70, 0, 1, 1, 0, 0, 1, 0, 1, 0, 0, 255, 219, 0, 67,
        0, 3, 2, 2, 2, 2, 2, 3, 2, 2, 2, 3, 3, 3, 3, 4, 6, 4, 4, 4, 4, 4, 8, 6, 6, 5, 6, 9, 8, 10,
        10, 9, 8, 9, 9, 10, 12, 15, 12, 10, 11, 14, 11, 9, 9, 13, 17, 13, 14, 15, 16, 16, 17, 16,
        10, 12, 18, 19, 18, 16, 19, 15, 16, 16, 16, 255, 219, 0, 67, 1, 3, 3, 3, 4, 3, 4, 8, 4, 4,
        8, 16, 11, 9, 11, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16,
        16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16,
        16, 16, 16, 16, 16, 16, 16, 255, 192, 0, 17, 8, 0, 1, 0, 1, 3, 1, 34, 0, 2, 17, 1, 3, 17,
        1, 255, 196, 0, 21, 0, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 8, 255, 196, 0,
        20, 16, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 255, 196, 0, 21, 1, 1, 1, 0, 0,
        0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 5, 255, 196, 0, 20, 17, 1, 0, 0, 0, 0, 0, 0, 0, 0,
        0, 0, 0, 0, 0, 0, 0, 0, 255, 218, 0, 12, 3, 1, 0, 2, 17, 3, 17, 0, 63, 0, 157, 0, 25, 151,
        255, 217,
    ]
}

const INDEX_MAGIC: &[u8; 8] = b"FPTIDX1\0";

/// Write a spec §6.3/§6.4-conformant `level_{level}.pack` / `.idx` pair of
/// `cols*rows` copies of `tiny_jpeg()` into `tiles_dir`.
fn write_level_pack(tiles_dir: &Path, level: u32, cols: u32, rows: u32) {
    let jpeg = tiny_jpeg();
    let mut pack_bytes = Vec::new();
    let mut entries = Vec::new();
    for _ in 0..(cols * rows) {
        entries.push((pack_bytes.len() as u64, jpeg.len() as u32));
        pack_bytes.extend_from_slice(&jpeg);
    }

    let mut idx = Vec::new();
    idx.extend_from_slice(INDEX_MAGIC);
    idx.extend_from_slice(&1u32.to_le_bytes()); // version
    idx.extend_from_slice(&1u32.to_le_bytes()); // level_count

    let entries_offset = 16 + 24u64;
    idx.extend_from_slice(&level.to_le_bytes());
    idx.extend_from_slice(&cols.to_le_bytes());
    idx.extend_from_slice(&rows.to_le_bytes());
    idx.extend_from_slice(&entries_offset.to_le_bytes());

    for (offset, length) in entries {
        idx.extend_from_slice(&offset.to_le_bytes());
        idx.extend_from_slice(&length.to_le_bytes());
        idx.extend_from_slice(&0u32.to_le_bytes()); // flags, reserved
    }

    fs::write(tiles_dir.join(format!("level_{level}.pack")), pack_bytes).unwrap();
    fs::write(tiles_dir.join(format!("level_{level}.idx")), idx).unwrap();
}

/// Write a complete minimal `.fastpath` directory with a single level of
/// `cols*rows` tiles of nominal size `tile_size`, downsample 1.
pub fn write_single_level_fastpath(dir: &Path, level: u32, cols: u32, rows: u32) {
    let tiles_dir = dir.join("tiles");
    fs::create_dir_all(&tiles_dir).unwrap();
    write_level_pack(&tiles_dir, level, cols, rows);

    let json = format!(
        r#"{{
            "version": "2",
            "source_file": "slide.svs",
            "source_mpp": 0.25,
            "target_mpp": 0.5,
            "target_magnification": 20.0,
            "tile_size": 512,
            "dimensions": [{width}, {height}],
            "levels": [
                {{"level": {level}, "downsample": 1, "cols": {cols}, "rows": {rows}}}
            ],
            "background_color": [255, 255, 255],
            "preprocessed_at": "2024-01-01T00:00:00Z",
            "tile_format": "pack_v2"
        }}"#,
        width = cols * 512,
        height = rows * 512,
    );
    fs::write(dir.join("metadata.json"), json).unwrap();
}

/// Write a two-level `.fastpath` directory matching the upstream test
/// fixture convention: 2048x2048, tile_size 512 (a 4x4 grid at level 1,
/// a 1x1 apex at level 0).
pub fn write_test_fastpath(dir: &Path) {
    let tiles_dir = dir.join("tiles");
    fs::create_dir_all(&tiles_dir).unwrap();
    write_level_pack(&tiles_dir, 0, 1, 1);
    write_level_pack(&tiles_dir, 1, 4, 4);

    let json = r#"{
        "version": "2",
        "source_file": "slide.svs",
        "source_mpp": 0.25,
        "target_mpp": 0.5,
        "target_magnification": 20.0,
        "tile_size": 512,
        "dimensions": [2048, 2048],
        "levels": [
            {"level": 0, "downsample": 4, "cols": 1, "rows": 1},
            {"level": 1, "downsample": 1, "cols": 4, "rows": 4}
        ],
        "background_color": [255, 255, 255],
        "preprocessed_at": "2024-01-01T00:00:00Z",
        "tile_format": "pack_v2"
    }"#;
    fs::write(dir.join("metadata.json"), json).unwrap();
}

/// Build a single-level `PackReader` of `cols*rows` tiles for cache/scheduler
/// tests. The returned `TempDir` must be kept alive for the reader's
/// lifetime (its mmap points into files beneath it).
pub fn pack_tiles(level: u32, cols: u32, rows: u32) -> (PackReader, TempDir) {
    let temp = TempDir::new().unwrap();
    write_single_level_fastpath(temp.path(), level, cols, rows);
    let metadata = SlideDescriptor::load(temp.path()).unwrap();
    let reader = PackReader::open(temp.path(), &metadata).unwrap();
    (reader, temp)
}
