// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Fuzz target for the WAL record frame decoder.
// Run with: cargo +nightly fuzz run fuzz_record_decode
//
// Segment tails after a crash hold arbitrary bytes, so decoding must reject
// anything malformed without panicking. Every accepted frame must re-encode
// to exactly the bytes it was decoded from.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tsdb_wal::entry::peek_frame_len;
use tsdb_wal::WalRecord;

fuzz_target!(|data: &[u8]| {
    if data.len() >= 4 {
        let _ = peek_frame_len([data[0], data[1], data[2], data[3]]);
    }

    let mut offset = 0;
    let mut record = WalRecord::default();
    while offset < data.len() {
        match record.decode_from(&data[offset..]) {
            Ok(consumed) => {
                assert_eq!(record.encode(), &data[offset..offset + consumed]);
                offset += consumed;
            }
            Err(_) => break,
        }
    }
});
