use std::fmt;
use std::thread;
use std::time::Duration;

use byte_unit::Byte;
use itertools::Itertools;
use subprocess::{Exec, ExitStatus, NullFile, Popen, PopenConfig, Redirection};

#[cfg(test)]
pub(crate) mod fake;

pub type Dataset = String;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Snapshot {
    pub dataset: Dataset,
    pub name: String,
}

impl Snapshot {
    pub fn new(dataset: impl Into<Dataset>, name: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.dataset, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bookmark {
    pub dataset: Dataset,
    pub name: String,
}

impl Bookmark {
    pub fn new(dataset: impl Into<Dataset>, name: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Bookmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.dataset, self.name)
    }
}

// Base of an incremental send. A bookmark works just as well as a snapshot
// here, and survives the snapshot it was created from being destroyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendRef {
    Snapshot(Snapshot),
    Bookmark(Bookmark),
}

impl fmt::Display for SendRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendRef::Snapshot(snapshot) => snapshot.fmt(f),
            SendRef::Bookmark(bookmark) => bookmark.fmt(f),
        }
    }
}

impl From<Snapshot> for SendRef {
    fn from(snapshot: Snapshot) -> Self {
        SendRef::Snapshot(snapshot)
    }
}

impl From<Bookmark> for SendRef {
    fn from(bookmark: Bookmark) -> Self {
        SendRef::Bookmark(bookmark)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub snapshot: Snapshot,
    pub guid: u64,
    pub createtxg: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookmarkInfo {
    pub bookmark: Bookmark,
    pub guid: u64,
    pub createtxg: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ZfsError {
    #[error("`{command}` exited with {status:?}")]
    Command { command: String, status: ExitStatus },
    #[error("failed to run `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: subprocess::PopenError,
    },
    #[error("unexpected output from `{command}`: {message}")]
    Output { command: String, message: String },
}

/// The subset of ZFS administration this tool needs. One implementation
/// shells out to zfs(8), the test double keeps pools in memory.
pub trait Zfs {
    /// The dataset and all its descendants, in no particular order.
    fn list_children(&self, dataset: &str) -> Result<Vec<Dataset>, ZfsError>;

    /// Snapshots directly on `dataset`, ascending by createtxg. With
    /// `quiet` the diagnostic stream is suppressed, for callers that
    /// expect the dataset to possibly not exist.
    fn list_snapshots(&self, dataset: &str, quiet: bool) -> Result<Vec<SnapshotInfo>, ZfsError>;

    /// Like [`Zfs::list_snapshots`] but also returns the bookmarks on
    /// `dataset`. Both lists are ascending by createtxg.
    fn list_snapshots_and_bookmarks(
        &self,
        dataset: &str,
    ) -> Result<(Vec<SnapshotInfo>, Vec<BookmarkInfo>), ZfsError>;

    /// Creates all snapshots in a single atomic operation.
    fn create_snapshots(&self, snapshots: &[Snapshot]) -> Result<(), ZfsError>;

    fn create_bookmark(&self, snapshot: &Snapshot, bookmark: &Bookmark) -> Result<(), ZfsError>;

    fn destroy_bookmark(&self, bookmark: &Bookmark) -> Result<(), ZfsError>;

    /// Destroys snapshots that all live on the same dataset. No-op on an
    /// empty list.
    fn destroy_snapshots(&self, snapshots: &[Snapshot]) -> Result<(), ZfsError>;

    fn rename_dataset(&self, source: &str, target: &str) -> Result<(), ZfsError>;

    /// Pipes `zfs send` into `zfs receive`, incrementally from `base` if
    /// given. The receive side is only forced for incremental sends; the
    /// caller must make sure the target can be rolled back safely.
    fn send_receive(
        &self,
        base: Option<&SendRef>,
        source: &Snapshot,
        target: &Snapshot,
    ) -> Result<(), ZfsError>;
}

macro_rules! argv {
    ($($arg:expr),* $(,)?) => {
        vec![$($arg.to_string()),*]
    };
}

const RENAME_ATTEMPTS: u32 = 5;
const RENAME_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct ZfsCli;

impl Zfs for ZfsCli {
    fn list_children(&self, dataset: &str) -> Result<Vec<Dataset>, ZfsError> {
        // zfs list -H -r -t filesystem,volume -o name -- dataset
        let argv = argv![
            "zfs",
            "list",
            "-H",
            "-r",
            "-t",
            "filesystem,volume",
            "-o",
            "name",
            "--",
            dataset
        ];
        Ok(read(&argv, false)?.lines().map(str::to_string).collect())
    }

    fn list_snapshots(&self, dataset: &str, quiet: bool) -> Result<Vec<SnapshotInfo>, ZfsError> {
        let (snapshots, _) = list(dataset, false, quiet)?;
        Ok(snapshots)
    }

    fn list_snapshots_and_bookmarks(
        &self,
        dataset: &str,
    ) -> Result<(Vec<SnapshotInfo>, Vec<BookmarkInfo>), ZfsError> {
        list(dataset, true, false)
    }

    fn create_snapshots(&self, snapshots: &[Snapshot]) -> Result<(), ZfsError> {
        if snapshots.is_empty() {
            return Ok(());
        }

        log::info!("Creating snapshots: {}", snapshots.iter().join(", "));

        // All snapshots go into one invocation so they are created in a
        // single transaction group and share a consistent point in time.
        let mut argv = argv!["zfs", "snapshot", "--"];
        argv.extend(snapshots.iter().map(Snapshot::to_string));
        run(&argv)
    }

    fn create_bookmark(&self, snapshot: &Snapshot, bookmark: &Bookmark) -> Result<(), ZfsError> {
        run(&argv![
            "zfs",
            "bookmark",
            "--",
            snapshot.to_string(),
            bookmark.to_string()
        ])
    }

    fn destroy_bookmark(&self, bookmark: &Bookmark) -> Result<(), ZfsError> {
        run(&argv!["zfs", "destroy", "--", bookmark.to_string()])
    }

    fn destroy_snapshots(&self, snapshots: &[Snapshot]) -> Result<(), ZfsError> {
        let Some(first) = snapshots.first() else {
            return Ok(());
        };
        debug_assert!(snapshots.iter().all(|s| s.dataset == first.dataset));

        // zfs destroy -- dataset@name1,name2,...
        let arg = format!(
            "{}@{}",
            first.dataset,
            snapshots.iter().map(|s| s.name.as_str()).join(",")
        );

        log::info!("Destroying snapshots: {arg}");
        run(&argv!["zfs", "destroy", "--", arg])
    }

    fn rename_dataset(&self, source: &str, target: &str) -> Result<(), ZfsError> {
        let argv = argv!["zfs", "rename", "--", source, target];

        // Renaming occasionally fails because the dataset cannot be
        // unmounted right now (a shell still has its cwd inside, a scan
        // holds a file open). Those failures clear up by themselves.
        let mut attempt = 1;
        loop {
            let captured = Exec::cmd(&argv[0])
                .args(&argv[1..])
                .stderr(Redirection::Pipe)
                .capture()
                .map_err(|source| ZfsError::Spawn {
                    command: argv.iter().join(" "),
                    source,
                })?;

            if captured.exit_status.success() {
                return Ok(());
            }

            let stderr = captured.stderr_str();
            if attempt < RENAME_ATTEMPTS && stderr.contains("cannot unmount") {
                log::info!("Retrying rename of {source} after transient unmount failure");
                attempt += 1;
                thread::sleep(RENAME_RETRY_DELAY);
                continue;
            }

            eprint!("{stderr}");
            return Err(ZfsError::Command {
                command: argv.iter().join(" "),
                status: captured.exit_status,
            });
        }
    }

    fn send_receive(
        &self,
        base: Option<&SendRef>,
        source: &Snapshot,
        target: &Snapshot,
    ) -> Result<(), ZfsError> {
        let mut send_argv = argv!["zfs", "send", "--raw", "--props"];
        if let Some(base) = base {
            send_argv.push("-i".to_string());
            send_argv.push(base.to_string());
        }
        send_argv.push("--".to_string());
        send_argv.push(source.to_string());

        if let Some(size) = estimate_send_size(&send_argv)? {
            log::info!(
                "Sending {source} to {target} ({})",
                Byte::from_bytes(size).get_appropriate_unit(true)
            );
        } else {
            log::info!("Sending {source} to {target}");
        }

        let mut receive_argv = argv!["zfs", "receive"];
        if base.is_some() {
            // Receiving an increment requires rolling the target back to
            // the base snapshot first, discarding any local modifications.
            receive_argv.push("-F".to_string());
        }
        receive_argv.push("--".to_string());
        receive_argv.push(target.to_string());

        pipeline(&send_argv, &receive_argv)
    }
}

// `zfs send -nP` reports the estimated stream size on stdout as a
// tab-separated `size <bytes>` row.
fn estimate_send_size(send_argv: &[String]) -> Result<Option<u128>, ZfsError> {
    let mut argv = send_argv.to_vec();
    argv.insert(2, "-nP".to_string());

    let output = read(&argv, false)?;
    Ok(output
        .lines()
        .filter_map(|line| line.strip_prefix("size"))
        .find_map(|rest| rest.trim().parse().ok()))
}

// Both halves of the pipeline are started before either is waited on;
// waiting for send to finish first would fill the pipe and deadlock.
fn pipeline(send_argv: &[String], receive_argv: &[String]) -> Result<(), ZfsError> {
    let command = format!(
        "{} | {}",
        send_argv.iter().join(" "),
        receive_argv.iter().join(" ")
    );
    let spawn_err = |source| ZfsError::Spawn {
        command: command.clone(),
        source,
    };

    let mut send = Popen::create(
        send_argv,
        PopenConfig {
            stdout: Redirection::Pipe,
            ..Default::default()
        },
    )
    .map_err(&spawn_err)?;
    let send_stdout = send.stdout.take().expect("stdout was configured as a pipe");

    let mut receive = Popen::create(
        receive_argv,
        PopenConfig {
            stdin: Redirection::File(send_stdout),
            ..Default::default()
        },
    )
    .map_err(&spawn_err)?;

    let send_status = send.wait().map_err(&spawn_err)?;
    let receive_status = receive.wait().map_err(&spawn_err)?;

    for (argv, status) in [(send_argv, send_status), (receive_argv, receive_status)] {
        if !status.success() {
            return Err(ZfsError::Command {
                command: argv.iter().join(" "),
                status,
            });
        }
    }

    Ok(())
}

fn list(
    dataset: &str,
    with_bookmarks: bool,
    quiet: bool,
) -> Result<(Vec<SnapshotInfo>, Vec<BookmarkInfo>), ZfsError> {
    // zfs list -Hpd1 -t snapshot[,bookmark] -o name,guid,createtxg -s createtxg -- dataset
    let types = if with_bookmarks {
        "snapshot,bookmark"
    } else {
        "snapshot"
    };
    let argv = argv![
        "zfs",
        "list",
        "-Hpd1",
        "-t",
        types,
        "-o",
        "name,guid,createtxg",
        "-s",
        "createtxg",
        "--",
        dataset
    ];

    let output = read(&argv, quiet)?;
    parse_listing(&output, &argv.iter().join(" "))
}

fn parse_listing(
    output: &str,
    command: &str,
) -> Result<(Vec<SnapshotInfo>, Vec<BookmarkInfo>), ZfsError> {
    let row_err = |line: &str, what: &str| ZfsError::Output {
        command: command.to_string(),
        message: format!("{what} in row `{line}`"),
    };

    let mut snapshots = Vec::new();
    let mut bookmarks = Vec::new();
    for line in output.lines() {
        let (name, guid, createtxg) = line
            .split('\t')
            .collect_tuple()
            .ok_or_else(|| row_err(line, "expected three columns"))?;
        let guid = guid.parse().map_err(|_| row_err(line, "unparsable guid"))?;
        let createtxg = createtxg
            .parse()
            .map_err(|_| row_err(line, "unparsable createtxg"))?;

        if let Some((dataset, snapshot)) = name.split_once('@') {
            snapshots.push(SnapshotInfo {
                snapshot: Snapshot::new(dataset, snapshot),
                guid,
                createtxg,
            });
        } else if let Some((dataset, bookmark)) = name.split_once('#') {
            bookmarks.push(BookmarkInfo {
                bookmark: Bookmark::new(dataset, bookmark),
                guid,
                createtxg,
            });
        } else {
            return Err(row_err(line, "name is neither a snapshot nor a bookmark"));
        }
    }

    Ok((snapshots, bookmarks))
}

fn read(argv: &[String], quiet: bool) -> Result<String, ZfsError> {
    let mut exec = Exec::cmd(&argv[0])
        .args(&argv[1..])
        .stdout(Redirection::Pipe);
    if quiet {
        exec = exec.stderr(NullFile);
    }

    let captured = exec.capture().map_err(|source| ZfsError::Spawn {
        command: argv.iter().join(" "),
        source,
    })?;

    if captured.exit_status.success() {
        Ok(captured.stdout_str())
    } else {
        Err(ZfsError::Command {
            command: argv.iter().join(" "),
            status: captured.exit_status,
        })
    }
}

// Perform a side effect, like snapshot or destroy. Diagnostics go straight
// to our stderr.
fn run(argv: &[String]) -> Result<(), ZfsError> {
    let status = Exec::cmd(&argv[0])
        .args(&argv[1..])
        .join()
        .map_err(|source| ZfsError::Spawn {
            command: argv.iter().join(" "),
            source,
        })?;

    if status.success() {
        Ok(())
    } else {
        Err(ZfsError::Command {
            command: argv.iter().join(" "),
            status,
        })
    }
}
