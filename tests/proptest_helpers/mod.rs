#![allow(dead_code)]

use std::collections::BTreeMap;

use compograph::annotation::{BBox, Normalized, Part, Tags};
use proptest::prelude::*;
use proptest::test_runner::{Config as ProptestConfig, FileFailurePersistence};

pub const TAG_KEYS: [&str; 4] = ["CLASS", "SHAPE", "COLOR", "NOTE"];

pub fn proptest_config() -> ProptestConfig {
    let cases = std::env::var("PROPTEST_CASES")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(64);

    let mut config = ProptestConfig::with_failure_persistence(FileFailurePersistence::WithSource(
        "proptest-regressions",
    ));
    config.cases = cases;
    config.max_shrink_iters = 1024;
    config
}

/// Tag values that never contain the join strings used in tests.
pub fn arb_value() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,6}"
}

pub fn arb_tags() -> impl Strategy<Value = Tags> {
    prop::collection::btree_map(prop::sample::select(TAG_KEYS.to_vec()), arb_value(), 0..4)
        .prop_map(|map: BTreeMap<&str, String>| map.into_iter().collect())
}

/// A non-empty ordered subset of [`TAG_KEYS`].
pub fn arb_keys() -> impl Strategy<Value = Vec<String>> {
    prop::sample::subsequence(TAG_KEYS.to_vec(), 1..=TAG_KEYS.len())
        .prop_map(|keys| keys.into_iter().map(str::to_string).collect())
}

pub fn arb_bbox() -> impl Strategy<Value = BBox<Normalized>> {
    (0.0..1.0f64, 0.0..1.0f64, 0.01..0.5f64, 0.01..0.5f64)
        .prop_map(|(cx, cy, w, h)| BBox::new(cx, cy, w, h))
}

/// Boxes on a coarse grid, so identical boxes and ties are common.
pub fn arb_grid_bbox() -> impl Strategy<Value = BBox<Normalized>> {
    (0u8..4, 0u8..4, 1u8..3).prop_map(|(x, y, s)| {
        let size = s as f64 * 0.2;
        BBox::new(0.2 + x as f64 * 0.2, 0.2 + y as f64 * 0.2, size, size)
    })
}

pub fn arb_parts(max: usize) -> impl Strategy<Value = Vec<Part>> {
    prop::collection::vec(arb_grid_bbox().prop_map(Part::new), 0..=max)
}
