//! Fuzz target for assembly and isolated part JSON parsing.

#![no_main]

use std::path::Path;

use compograph::annotation::io_json::{parse_assembly, parse_part};
use compograph::annotation::ImageSource;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() > 10 * 1024 * 1024 {
        return;
    }
    let Ok(json) = std::str::from_utf8(data) else {
        return;
    };

    let path = Path::new("fuzz.json");
    let _ = parse_assembly(json, path, "fuzz/a", ImageSource::none());
    let _ = parse_part(json, path, "fuzz/p", ImageSource::none());
});
