use range_store::{LocationCache, RangeLocation};

fn location(start: &str, end: &str, server: &str) -> RangeLocation {
    RangeLocation {
        start_row: start.into(),
        end_row: end.into(),
        location: server.into(),
    }
}

#[test_log::test]
fn location_cache_eviction_order() {
    let cache = LocationCache::new(2);

    cache.insert("1", location("", "m", "rs1"), false);
    cache.insert("1", location("m", "z", "rs2"), false);

    let hit = cache.lookup("1", b"a").expect("rs1 entry cached");
    assert_eq!("rs1", hit.location);

    // A third entry pushes one out
    cache.insert("2", location("", "z", "rs3"), false);

    let hit = cache.lookup("1", b"n").expect("rs2 entry not evicted");
    assert_eq!("rs2", hit.location);

    assert!(cache.lookup("1", b"a").is_none(), "rs1 entry evicted");
}
