//! Fuzz target for decoding model labels into tags.

#![no_main]

use compograph::annotation::Tags;
use compograph::codec::TagCodec;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(label) = std::str::from_utf8(data) else {
        return;
    };

    let codec = TagCodec::list(["CLASS", "SHAPE", "ROLE"], "_");
    let tags = codec.decode(label);
    let mut applied = Tags::new();
    codec.apply(&mut applied, label);
    let _ = codec.encode(&tags);
});
