//! Fuzz target for dataset configuration parsing and pipeline building.
//!
//! Every configured pipeline is built against the builtin registry, so
//! malformed pipeline values and reference cycles are exercised too.

#![no_main]

use std::path::Path;
use std::sync::Arc;

use compograph::config::DatasetConfig;
use compograph::pipeline::{build_pipeline, Registry};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() > 1024 * 1024 {
        return;
    }
    let Ok(yaml) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(config) = DatasetConfig::from_yaml_str(yaml, Path::new("/fuzz")) else {
        return;
    };

    let config = Arc::new(config);
    let registry = Registry::with_builtins();
    for name in config.pipelines.keys() {
        let _ = build_pipeline(name, config.clone(), &registry);
    }
});
