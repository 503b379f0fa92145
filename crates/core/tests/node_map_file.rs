//! Disk-backed node map scenarios: parallel writers, seal, random reads.

use std::path::PathBuf;

use polar_tiles_core::node_map::{MmapNodeMap, MISSING};

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("polar-node-map-it-{}-{name}.bin", std::process::id()))
}

#[test]
fn test_two_writers_interleaved_segments() {
    // 1 MiB segments keep the mapped-segment count reasonable while the keys
    // still span several segments
    let mut map = MmapNodeMap::with_segment_bits(temp_path("two-writers"), 20).unwrap();

    std::thread::scope(|scope| {
        let map = &map;
        scope.spawn(move || {
            let mut a = map.new_writer();
            a.put(0, 1).unwrap();
            a.put(100, 2).unwrap();
            a.put(1 << 25, 3).unwrap();
        });
        scope.spawn(move || {
            let mut b = map.new_writer();
            b.put(1, 4).unwrap();
            b.put(1 << 24, 5).unwrap();
            b.put(1 << 26, 6).unwrap();
        });
    });

    map.seal().unwrap();
    assert_eq!(map.get(0).unwrap(), 1);
    assert_eq!(map.get(1).unwrap(), 4);
    assert_eq!(map.get(100).unwrap(), 2);
    assert_eq!(map.get(1 << 24).unwrap(), 5);
    assert_eq!(map.get(1 << 25).unwrap(), 3);
    assert_eq!(map.get(1 << 26).unwrap(), 6);
    assert_eq!(map.get(42).unwrap(), MISSING);
    map.close().unwrap();
}

#[test]
fn test_many_writers_striped_keys() {
    const WRITERS: u64 = 4;
    const KEYS: u64 = 4096;

    // 1 KiB segments so writers cross many segment boundaries and exercise
    // the shared-buffer eviction path
    let mut map = MmapNodeMap::with_segment_bits(temp_path("striped"), 10).unwrap();

    std::thread::scope(|scope| {
        let map = &map;
        for stripe in 0..WRITERS {
            scope.spawn(move || {
                let mut writer = map.new_writer();
                let mut key = stripe;
                while key < KEYS {
                    writer.put(key, key + 10).unwrap();
                    key += WRITERS;
                }
            });
        }
    });

    map.seal().unwrap();
    for key in 0..KEYS {
        assert_eq!(map.get(key).unwrap(), key + 10, "round trip of key {key}");
    }
    assert_eq!(map.get(KEYS + 5).unwrap(), MISSING);
    map.close().unwrap();
}

#[test]
fn test_get_auto_seals() {
    let mut map = MmapNodeMap::with_segment_bits(temp_path("auto-seal"), 10).unwrap();
    map.new_writer().put(7, 77).unwrap();
    // no explicit seal
    assert_eq!(map.get(7).unwrap(), 77);
    assert_eq!(map.get(8).unwrap(), MISSING);
    map.close().unwrap();
}

#[test]
fn test_sparse_holes_read_as_missing() {
    let mut map = MmapNodeMap::with_segment_bits(temp_path("sparse"), 10).unwrap();
    {
        let mut writer = map.new_writer();
        writer.put(10, 1).unwrap();
        writer.put(5000, 2).unwrap();
    }
    map.seal().unwrap();
    assert_eq!(map.get(10).unwrap(), 1);
    assert_eq!(map.get(5000).unwrap(), 2);
    // untouched keys inside written segments and in skipped segments
    assert_eq!(map.get(11).unwrap(), MISSING);
    assert_eq!(map.get(2000).unwrap(), MISSING);
    map.close().unwrap();
}
