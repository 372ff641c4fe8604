// SPDX-License-Identifier: PMPL-1.0-or-later
//! Property-based tests for the version protocol and read-back

use proptest::prelude::*;
use tempfile::TempDir;
use tsdb_wal::{SyncMode, Version, Wal, WalConfig, WalError};

fn config(seg_size: i64) -> WalConfig {
    WalConfig::default()
        .with_seg_size(seg_size)
        .with_sync_mode(SyncMode::Async)
}

/// Generate arbitrary record payloads
fn arb_payloads() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..60)
}

/// Generate arbitrary segment size limits, including "disabled"
fn arb_seg_size() -> impl Strategy<Value = i64> {
    prop_oneof![Just(-1i64), 64i64..512]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_sequential_appends_read_back(
        payloads in arb_payloads(),
        seg_size in arb_seg_size()
    ) {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(dir.path(), config(seg_size)).unwrap();
        for (ver, payload) in payloads.iter().enumerate() {
            wal.append(ver as Version, (ver % 3) as u8, payload).unwrap();
        }
        prop_assert_eq!(wal.last_ver().unwrap(), payloads.len() as Version - 1);

        let mut handle = wal.open_read_handle().unwrap();
        for (ver, payload) in payloads.iter().enumerate() {
            let record = handle.read_next().unwrap();
            prop_assert_eq!(record.version, ver as Version);
            prop_assert_eq!(&record.payload, payload);
        }
    }

    #[test]
    fn test_out_of_order_append_is_rejected(
        count in 1i64..30,
        offset in prop_oneof![-40i64..0, 1i64..40]
    ) {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(dir.path(), config(-1)).unwrap();
        for ver in 0..count {
            wal.append(ver, 0, b"x").unwrap();
        }
        let before = wal.serialize_meta().unwrap();

        let result = wal.append(count + offset, 0, b"bad");
        let rejected = matches!(result, Err(WalError::OutOfOrderVersion { expected, .. }) if expected == count);
        prop_assert!(rejected);
        prop_assert_eq!(wal.last_ver().unwrap(), count - 1);
        prop_assert_eq!(wal.serialize_meta().unwrap(), before);
    }

    #[test]
    fn test_rollback_lowers_last_version(
        count in 2i64..60,
        commit_fraction in 0.0f64..1.0,
        target_fraction in 0.0f64..1.0,
        seg_size in arb_seg_size()
    ) {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(dir.path(), config(seg_size)).unwrap();
        for ver in 0..count {
            wal.append(ver, 0, format!("r-{ver}").as_bytes()).unwrap();
        }
        let commit = ((count - 1) as f64 * commit_fraction) as Version;
        wal.commit(commit).unwrap();

        let target = ((count as f64) * target_fraction) as Version;
        let result = wal.rollback(target);
        if target > commit && target < count {
            prop_assert!(result.is_ok());
            prop_assert_eq!(wal.last_ver().unwrap(), target - 1);
            prop_assert!(wal.last_ver().unwrap() >= wal.commit_ver().unwrap());

            // The next append must carry exactly the rollback point.
            wal.append(target, 0, b"again").unwrap();
            let mut handle = wal.open_read_handle().unwrap();
            prop_assert_eq!(&handle.read_at(target).unwrap().payload, &b"again".to_vec());
        } else {
            prop_assert!(result.is_err());
            prop_assert_eq!(wal.last_ver().unwrap(), count - 1);
        }
    }

    #[test]
    fn test_snapshot_floor_never_loses_needed_versions(
        count in 10i64..120,
        snapshot_fraction in 0.0f64..1.0
    ) {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(dir.path(), config(128)).unwrap();
        for ver in 0..count {
            wal.append(ver, 0, format!("s-{ver}").as_bytes()).unwrap();
        }
        wal.commit(count - 1).unwrap();
        let snapshot = ((count - 1) as f64 * snapshot_fraction) as Version;
        wal.begin_snapshot(snapshot).unwrap();
        wal.end_snapshot().unwrap();

        let first = wal.first_ver().unwrap();
        prop_assert!(first <= snapshot + 1);

        let mut handle = wal.open_read_handle().unwrap();
        for ver in snapshot..count {
            prop_assert_eq!(handle.read_at(ver).unwrap().version, ver);
        }
    }
}
