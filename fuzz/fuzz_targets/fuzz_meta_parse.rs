// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Fuzz target for the WAL metadata parser.
// Run with: cargo +nightly fuzz run fuzz_meta_parse

#![no_main]

use libfuzzer_sys::fuzz_target;
use tsdb_wal::meta::{parse_meta, serialize_meta};

fuzz_target!(|data: &[u8]| {
    // Whatever validates must serialize and parse back to the same state.
    if let Ok((versions, segments)) = parse_meta(data) {
        let bytes = serialize_meta(&versions, &segments).unwrap();
        let (again_versions, again_segments) = parse_meta(&bytes).unwrap();
        assert_eq!(versions, again_versions);
        assert_eq!(segments, again_segments);
    }
});
