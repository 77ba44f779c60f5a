use std::cell::RefCell;
use std::collections::BTreeMap;

use subprocess::ExitStatus;

use super::{Bookmark, BookmarkInfo, Dataset, SendRef, Snapshot, SnapshotInfo, Zfs, ZfsError};

// In-memory stand-in for a pool administered through zfs(8). Guids are
// unique per object and preserved by send/receive, createtxg increases
// with every change, like the real thing.
//
// Mutating operations optionally fail after a configured number of calls,
// which the crash recovery tests use to abort a run at every possible
// point. Listings never fail this way, mirroring that an aborted run dies
// in a side effect, not while reading state.
pub(crate) struct FakeZfs {
    pool: RefCell<Pool>,
}

#[derive(Debug, Default)]
struct Pool {
    datasets: BTreeMap<Dataset, DatasetState>,
    next_guid: u64,
    next_txg: u64,
    mutations: usize,
    mutations_allowed: Option<usize>,
    sends: usize,
}

#[derive(Debug, Default, Clone)]
struct DatasetState {
    snapshots: Vec<Entry>,
    bookmarks: Vec<Entry>,
}

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    guid: u64,
    createtxg: u64,
}

fn fail(message: impl Into<String>) -> ZfsError {
    ZfsError::Command {
        command: format!("fake zfs: {}", message.into()),
        status: ExitStatus::Exited(1),
    }
}

impl FakeZfs {
    pub(crate) fn new(datasets: &[&str]) -> Self {
        let zfs = Self {
            pool: RefCell::new(Pool::default()),
        };
        for dataset in datasets {
            zfs.ensure_dataset(dataset);
        }
        zfs
    }

    pub(crate) fn ensure_dataset(&self, dataset: &str) {
        self.pool
            .borrow_mut()
            .datasets
            .entry(dataset.to_string())
            .or_default();
    }

    pub(crate) fn has_dataset(&self, dataset: &str) -> bool {
        self.pool.borrow().datasets.contains_key(dataset)
    }

    // The helpers below act as an outside administrator: they bypass the
    // fault injector and the mutation counter.

    pub(crate) fn add_snapshot(&self, dataset: &str, name: &str) {
        let mut pool = self.pool.borrow_mut();
        let entry = pool.new_entry(name);
        pool.dataset_mut(dataset).snapshots.push(entry);
    }

    pub(crate) fn add_bookmark(&self, dataset: &str, snapshot_name: &str) {
        let mut pool = self.pool.borrow_mut();
        let entry = pool
            .dataset_mut(dataset)
            .snapshots
            .iter()
            .find(|entry| entry.name == snapshot_name)
            .expect("bookmarked snapshot exists")
            .clone();
        pool.dataset_mut(dataset).bookmarks.push(entry);
    }

    pub(crate) fn remove_bookmark(&self, dataset: &str, name: &str) {
        let mut pool = self.pool.borrow_mut();
        let bookmarks = &mut pool.dataset_mut(dataset).bookmarks;
        let index = bookmarks
            .iter()
            .position(|entry| entry.name == name)
            .expect("removed bookmark exists");
        bookmarks.remove(index);
    }

    pub(crate) fn copy_snapshot_to(&self, from: &str, name: &str, to: &str) {
        let mut pool = self.pool.borrow_mut();
        let mut entry = pool
            .dataset_mut(from)
            .snapshots
            .iter()
            .find(|entry| entry.name == name)
            .expect("copied snapshot exists")
            .clone();
        entry.createtxg = pool.next_txg();
        pool.dataset_mut(to).snapshots.push(entry);
    }

    pub(crate) fn wipe_snapshots(&self, dataset: &str) {
        self.pool.borrow_mut().dataset_mut(dataset).snapshots.clear();
    }

    pub(crate) fn snapshot_names(&self, dataset: &str) -> Vec<String> {
        let pool = self.pool.borrow();
        let state = pool.datasets.get(dataset).expect("listed dataset exists");
        sorted_names(&state.snapshots)
    }

    pub(crate) fn bookmark_names(&self, dataset: &str) -> Vec<String> {
        let pool = self.pool.borrow();
        let state = pool.datasets.get(dataset).expect("listed dataset exists");
        sorted_names(&state.bookmarks)
    }

    pub(crate) fn send_count(&self) -> usize {
        self.pool.borrow().sends
    }

    pub(crate) fn mutation_count(&self) -> usize {
        self.pool.borrow().mutations
    }

    /// Lets `count` further mutating calls succeed, then fails every one
    /// after that.
    pub(crate) fn abort_after(&self, count: usize) {
        let mut pool = self.pool.borrow_mut();
        pool.mutations_allowed = Some(pool.mutations + count);
    }

    pub(crate) fn disable_abort(&self) {
        self.pool.borrow_mut().mutations_allowed = None;
    }

    fn mutate(&self, op: &str) -> Result<(), ZfsError> {
        let mut pool = self.pool.borrow_mut();
        if pool.mutations_allowed == Some(pool.mutations) {
            return Err(fail(format!("{op} aborted by fault injection")));
        }
        pool.mutations += 1;
        Ok(())
    }
}

impl Pool {
    fn dataset_mut(&mut self, dataset: &str) -> &mut DatasetState {
        self.datasets
            .get_mut(dataset)
            .expect("referenced dataset exists")
    }

    fn next_guid(&mut self) -> u64 {
        self.next_guid += 1;
        self.next_guid
    }

    fn next_txg(&mut self) -> u64 {
        self.next_txg += 1;
        self.next_txg
    }

    fn new_entry(&mut self, name: &str) -> Entry {
        Entry {
            name: name.to_string(),
            guid: self.next_guid(),
            createtxg: self.next_txg(),
        }
    }
}

fn sorted_names(entries: &[Entry]) -> Vec<String> {
    let mut entries: Vec<&Entry> = entries.iter().collect();
    entries.sort_by_key(|entry| entry.createtxg);
    entries.iter().map(|entry| entry.name.clone()).collect()
}

impl Zfs for FakeZfs {
    fn list_children(&self, dataset: &str) -> Result<Vec<Dataset>, ZfsError> {
        let pool = self.pool.borrow();
        if !pool.datasets.contains_key(dataset) {
            return Err(fail(format!("cannot open `{dataset}`")));
        }

        let prefix = format!("{dataset}/");
        Ok(pool
            .datasets
            .keys()
            .filter(|name| *name == dataset || name.starts_with(&prefix))
            .cloned()
            .collect())
    }

    fn list_snapshots(&self, dataset: &str, _quiet: bool) -> Result<Vec<SnapshotInfo>, ZfsError> {
        let pool = self.pool.borrow();
        let state = pool
            .datasets
            .get(dataset)
            .ok_or_else(|| fail(format!("cannot open `{dataset}`")))?;

        let mut entries: Vec<&Entry> = state.snapshots.iter().collect();
        entries.sort_by_key(|entry| entry.createtxg);
        Ok(entries
            .iter()
            .map(|entry| SnapshotInfo {
                snapshot: Snapshot::new(dataset, entry.name.clone()),
                guid: entry.guid,
                createtxg: entry.createtxg,
            })
            .collect())
    }

    fn list_snapshots_and_bookmarks(
        &self,
        dataset: &str,
    ) -> Result<(Vec<SnapshotInfo>, Vec<BookmarkInfo>), ZfsError> {
        let snapshots = self.list_snapshots(dataset, false)?;

        let pool = self.pool.borrow();
        let state = pool
            .datasets
            .get(dataset)
            .ok_or_else(|| fail(format!("cannot open `{dataset}`")))?;

        let mut entries: Vec<&Entry> = state.bookmarks.iter().collect();
        entries.sort_by_key(|entry| entry.createtxg);
        let bookmarks = entries
            .iter()
            .map(|entry| BookmarkInfo {
                bookmark: Bookmark::new(dataset, entry.name.clone()),
                guid: entry.guid,
                createtxg: entry.createtxg,
            })
            .collect();

        Ok((snapshots, bookmarks))
    }

    fn create_snapshots(&self, snapshots: &[Snapshot]) -> Result<(), ZfsError> {
        if snapshots.is_empty() {
            return Ok(());
        }
        self.mutate("snapshot")?;

        let mut pool = self.pool.borrow_mut();
        for snapshot in snapshots {
            let Some(state) = pool.datasets.get(&snapshot.dataset) else {
                return Err(fail(format!("cannot open `{}`", snapshot.dataset)));
            };
            if state.snapshots.iter().any(|e| e.name == snapshot.name) {
                return Err(fail(format!("snapshot `{snapshot}` already exists")));
            }
        }

        // One transaction group for the whole batch, like an atomic
        // `zfs snapshot a@x b@x`.
        let txg = pool.next_txg();
        for snapshot in snapshots {
            let guid = pool.next_guid();
            pool.dataset_mut(&snapshot.dataset).snapshots.push(Entry {
                name: snapshot.name.clone(),
                guid,
                createtxg: txg,
            });
        }
        Ok(())
    }

    fn create_bookmark(&self, snapshot: &Snapshot, bookmark: &Bookmark) -> Result<(), ZfsError> {
        self.mutate("bookmark")?;

        let mut pool = self.pool.borrow_mut();
        let Some(state) = pool.datasets.get_mut(&snapshot.dataset) else {
            return Err(fail(format!("cannot open `{}`", snapshot.dataset)));
        };
        let Some(entry) = state.snapshots.iter().find(|e| e.name == snapshot.name) else {
            return Err(fail(format!("snapshot `{snapshot}` does not exist")));
        };
        if state.bookmarks.iter().any(|e| e.name == bookmark.name) {
            return Err(fail(format!("bookmark `{bookmark}` already exists")));
        }

        let entry = entry.clone();
        state.bookmarks.push(entry);
        Ok(())
    }

    fn destroy_bookmark(&self, bookmark: &Bookmark) -> Result<(), ZfsError> {
        self.mutate("destroy bookmark")?;

        let mut pool = self.pool.borrow_mut();
        let Some(state) = pool.datasets.get_mut(&bookmark.dataset) else {
            return Err(fail(format!("cannot open `{}`", bookmark.dataset)));
        };
        let Some(index) = state.bookmarks.iter().position(|e| e.name == bookmark.name) else {
            return Err(fail(format!("bookmark `{bookmark}` does not exist")));
        };
        state.bookmarks.remove(index);
        Ok(())
    }

    fn destroy_snapshots(&self, snapshots: &[Snapshot]) -> Result<(), ZfsError> {
        let Some(first) = snapshots.first() else {
            return Ok(());
        };
        self.mutate("destroy")?;

        let mut pool = self.pool.borrow_mut();
        let Some(state) = pool.datasets.get_mut(&first.dataset) else {
            return Err(fail(format!("cannot open `{}`", first.dataset)));
        };
        for snapshot in snapshots {
            if !state.snapshots.iter().any(|e| e.name == snapshot.name) {
                return Err(fail(format!("snapshot `{snapshot}` does not exist")));
            }
        }
        state
            .snapshots
            .retain(|e| !snapshots.iter().any(|s| s.name == e.name));
        Ok(())
    }

    fn rename_dataset(&self, source: &str, target: &str) -> Result<(), ZfsError> {
        self.mutate("rename")?;

        let mut pool = self.pool.borrow_mut();
        if !pool.datasets.contains_key(source) {
            return Err(fail(format!("cannot open `{source}`")));
        }
        if pool.datasets.contains_key(target) {
            return Err(fail(format!("dataset `{target}` already exists")));
        }

        let prefix = format!("{source}/");
        let moved: Vec<Dataset> = pool
            .datasets
            .keys()
            .filter(|name| *name == source || name.starts_with(&prefix))
            .cloned()
            .collect();
        for name in moved {
            let state = pool.datasets.remove(&name).expect("key was just listed");
            let renamed = format!("{target}{}", &name[source.len()..]);
            pool.datasets.insert(renamed, state);
        }
        Ok(())
    }

    fn send_receive(
        &self,
        base: Option<&SendRef>,
        source: &Snapshot,
        target: &Snapshot,
    ) -> Result<(), ZfsError> {
        self.mutate("send/receive")?;

        let mut pool = self.pool.borrow_mut();
        let Some(source_state) = pool.datasets.get(&source.dataset) else {
            return Err(fail(format!("cannot open `{}`", source.dataset)));
        };
        let Some(entry) = source_state
            .snapshots
            .iter()
            .find(|e| e.name == source.name)
        else {
            return Err(fail(format!("snapshot `{source}` does not exist")));
        };
        let guid = entry.guid;

        match base {
            None => {
                // A full stream only receives into a dataset that does not
                // exist yet.
                if pool.datasets.contains_key(&target.dataset) {
                    return Err(fail(format!(
                        "destination `{}` exists",
                        target.dataset
                    )));
                }
                let entry = Entry {
                    name: target.name.clone(),
                    guid,
                    createtxg: pool.next_txg(),
                };
                pool.datasets.insert(
                    target.dataset.clone(),
                    DatasetState {
                        snapshots: vec![entry],
                        bookmarks: Vec::new(),
                    },
                );
            }
            Some(base) => {
                let base_guid = match base {
                    SendRef::Snapshot(snapshot) => source_state
                        .snapshots
                        .iter()
                        .find(|e| e.name == snapshot.name)
                        .map(|e| e.guid),
                    SendRef::Bookmark(bookmark) => source_state
                        .bookmarks
                        .iter()
                        .find(|e| e.name == bookmark.name)
                        .map(|e| e.guid),
                };
                let Some(base_guid) = base_guid else {
                    return Err(fail(format!("incremental source `{base}` does not exist")));
                };

                let Some(target_state) = pool.datasets.get(&target.dataset) else {
                    return Err(fail(format!("cannot open `{}`", target.dataset)));
                };
                let tip = target_state
                    .snapshots
                    .iter()
                    .max_by_key(|e| e.createtxg)
                    .map(|e| e.guid);
                if tip != Some(base_guid) {
                    return Err(fail(format!(
                        "incremental source `{base}` does not match the most \
                         recent snapshot of `{}`",
                        target.dataset
                    )));
                }

                let entry = Entry {
                    name: target.name.clone(),
                    guid,
                    createtxg: pool.next_txg(),
                };
                pool.dataset_mut(&target.dataset).snapshots.push(entry);
            }
        }

        pool.sends += 1;
        Ok(())
    }
}
