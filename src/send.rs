use chrono::NaiveDateTime;
use color_eyre::Result;

use crate::snapshots::{TIMESTAMP_FORMAT, parse_snapshot_name};
use crate::zfs::{Bookmark, Dataset, SendRef, Snapshot, Zfs};

#[derive(Debug, thiserror::Error)]
#[error(
    "dataset `{0}` at the send target is unrelated to the source, but it is \
     the root of a pool and cannot be renamed out of the way"
)]
pub struct CannotMoveRootOfPool(pub Dataset);

/// Replicates all matching snapshots from `source` onto `target` and
/// destroys them on the source. On success the source carries exactly one
/// matching bookmark, pointing at the incremental base for the next run.
///
/// All state is recomputed from listings, so an interrupted run is picked
/// up where it left off by simply running again.
pub fn send_snapshots(
    zfs: &impl Zfs,
    source: &str,
    target: &str,
    prefix: &str,
    now: NaiveDateTime,
) -> Result<()> {
    let (source_snapshots, source_bookmarks) = zfs.list_snapshots_and_bookmarks(source)?;

    // A failed listing is taken to mean the target does not exist yet. It
    // will be created by the first full send.
    let (target_snapshots, target_exists) = match zfs.list_snapshots(target, true) {
        Ok(snapshots) => (snapshots, true),
        Err(_) => (Vec::new(), false),
    };

    // The newest target snapshot is the state the next incremental send
    // has to start from; the source bookmark sharing its guid is the base.
    let tip_guid = target_snapshots.last().map(|info| info.guid);
    let mut base: Option<Bookmark> = tip_guid.and_then(|guid| {
        source_bookmarks
            .iter()
            .find(|info| info.guid == guid)
            .map(|info| info.bookmark.clone())
    });

    if base.is_none() && target_exists {
        // The target has no snapshot in common with the source, so it must
        // be unrelated; the source may have been destroyed and re-created,
        // or another dataset occupies the name. Move it out of the way and
        // start over with a full send.
        move_target_away(zfs, target, now)?;
    }

    // Matching bookmarks other than the incremental base are left-overs
    // from runs that were aborted between sending and cleaning up.
    for info in &source_bookmarks {
        if parse_snapshot_name(&info.bookmark.name, prefix).is_none() {
            continue;
        }
        if base.as_ref() != Some(&info.bookmark) {
            zfs.destroy_bookmark(&info.bookmark)?;
        }
    }

    for info in &source_snapshots {
        let snapshot = &info.snapshot;
        if parse_snapshot_name(&snapshot.name, prefix).is_none() {
            continue;
        }

        // A snapshot that already is the target's tip was sent by an
        // earlier run that died before destroying the source copy.
        if Some(info.guid) != tip_guid {
            // The bookmark must exist before the receive completes; a
            // crash during the send then still leaves a usable base.
            let new_base = Bookmark::new(source, snapshot.name.clone());
            zfs.create_bookmark(snapshot, &new_base)?;

            let target_snapshot = Snapshot::new(target, snapshot.name.clone());
            let send_base = base.clone().map(SendRef::from);
            zfs.send_receive(send_base.as_ref(), snapshot, &target_snapshot)?;

            if let Some(old_base) = base.take() {
                zfs.destroy_bookmark(&old_base)?;
            }
            base = Some(new_base);
        }

        zfs.destroy_snapshots(std::slice::from_ref(snapshot))?;
    }

    Ok(())
}

fn move_target_away(zfs: &impl Zfs, target: &str, now: NaiveDateTime) -> Result<()> {
    let Some((parent, base_name)) = target.rsplit_once('/') else {
        return Err(CannotMoveRootOfPool(target.to_string()).into());
    };

    let moved_name = format!("{base_name}-snappy-moved-{}", now.format(TIMESTAMP_FORMAT));
    zfs.rename_dataset(target, &format!("{parent}/{moved_name}"))?;

    log::warn!("Warning: Dataset at send target {target} has been renamed to {moved_name}.");
    Ok(())
}
