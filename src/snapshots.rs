use std::collections::{HashMap, HashSet};

use chrono::{NaiveDate, NaiveDateTime};

use crate::config::KeepSpec;
use crate::zfs::{Snapshot, SnapshotInfo};

pub const DEFAULT_PREFIX: &str = "snappy";

// Serialized form of the wall clock at creation, no timezone.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H%M%S";

// Buckets of the interval keep specs are aligned on this date rather than
// the epoch; the year 2001 starts with a Monday, so weekly buckets line up
// with calendar weeks.
fn bucket_time_base() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2001, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

pub fn make_snapshot_name(prefix: &str, timestamp: NaiveDateTime) -> String {
    format!("{prefix}-{}", timestamp.format(TIMESTAMP_FORMAT))
}

/// The timestamp of a snapshot name created by [`make_snapshot_name`] with
/// the same prefix, or `None` for any other name.
pub fn parse_snapshot_name(name: &str, prefix: &str) -> Option<NaiveDateTime> {
    let timestamp = name.strip_prefix(prefix)?.strip_prefix('-')?;
    NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()
}

/// Snapshots on a single dataset that are covered by none of the keep
/// specs. Snapshots whose name does not parse under `prefix` are ignored
/// entirely; they are neither kept nor expired.
pub fn find_expired_snapshots(
    snapshots: &[SnapshotInfo],
    keep_specs: &[KeepSpec],
    prefix: &str,
) -> Vec<Snapshot> {
    // Newest first, so every keep spec prefers newer snapshots. The sort is
    // stable, co-created snapshots keep their listing order.
    let mut newest_first: Vec<&SnapshotInfo> = snapshots.iter().collect();
    newest_first.sort_by_key(|info| std::cmp::Reverse(info.createtxg));

    let with_timestamps: Vec<(&Snapshot, NaiveDateTime)> = newest_first
        .iter()
        .filter_map(|info| {
            parse_snapshot_name(&info.snapshot.name, prefix).map(|t| (&info.snapshot, t))
        })
        .collect();

    let mut kept: HashSet<&Snapshot> = HashSet::new();
    for spec in keep_specs {
        match spec {
            KeepSpec::MostRecent { count } => {
                kept.extend(with_timestamps.iter().take(*count).map(|(s, _)| *s));
            }
            KeepSpec::Interval { interval, count } => {
                let interval = interval.num_seconds();
                let time_base = bucket_time_base();
                let mut bucket_order = Vec::new();
                let mut kept_in_bucket: HashMap<i64, &Snapshot> = HashMap::new();
                for (snapshot, timestamp) in &with_timestamps {
                    let elapsed = (*timestamp - time_base).num_seconds();
                    let bucket = elapsed.div_euclid(interval);

                    if !kept_in_bucket.contains_key(&bucket) {
                        bucket_order.push(bucket);
                    }
                    // Walking newest to oldest, the last write wins: each
                    // bucket ends up with its oldest snapshot.
                    kept_in_bucket.insert(bucket, *snapshot);
                }

                let count = count.unwrap_or(usize::MAX);
                kept.extend(bucket_order.iter().take(count).map(|b| kept_in_bucket[b]));
            }
        }
    }

    with_timestamps
        .iter()
        .map(|(snapshot, _)| *snapshot)
        .filter(|snapshot| !kept.contains(snapshot))
        .cloned()
        .collect()
}
