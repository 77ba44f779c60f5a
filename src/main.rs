use std::io::Write;
use std::path::PathBuf;

use chrono::Local;
use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::eyre;

use crate::config::{DEFAULT_CONFIG_PATH, Job, KeepSpec};
use crate::orchestrate::Actions;
use crate::zfs::ZfsCli;

mod config;
mod orchestrate;
mod send;
mod snapshots;
mod zfs;

/// Create, prune and replicate snapshots on ZFS filesystems.
///
/// A keep specification is either a number, meaning keep that many most
/// recent snapshots, or a time interval like `1d' or `12h', meaning keep
/// one snapshot per that interval. An interval can be followed by `:' and
/// a number to also limit how many snapshots to keep in that interval.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Datasets on which to create (and prune) snapshots.
    #[arg(value_name = "DATASETS")]
    datasets: Vec<String>,

    /// Create and prune snapshots recursively on the specified datasets.
    #[arg(short, long)]
    recursive: bool,

    /// Leave out a dataset and its descendants. Requires --recursive; can
    /// be given multiple times.
    #[arg(short, long, value_name = "DATASET")]
    exclude: Vec<String>,

    /// Prefix of snapshot names of created and pruned snapshots. Defaults
    /// to `snappy'.
    #[arg(short, long)]
    prefix: Option<String>,

    /// Disables creating snapshots. Instead, only prune or send snapshots.
    #[arg(short = 'S', long)]
    no_snapshot: bool,

    /// Comma-separated list of keep specifications that specify how many
    /// snapshots to keep in what intervals. All other snapshots with the
    /// used prefix are destroyed.
    #[arg(short, long, value_name = "KEEP_SPECIFICATION", value_delimiter = ',')]
    keep: Option<Vec<KeepSpec>>,

    /// Replicate snapshots to this dataset with incremental sends and
    /// destroy them on the source.
    #[arg(short = 's', long = "send-to", value_name = "DATASET")]
    send_to: Option<String>,

    /// Prefix replaced by the send target when mapping each source dataset
    /// onto its target. Required when sending more than one dataset.
    #[arg(short = 'b', long = "send-base", value_name = "DATASET")]
    send_base: Option<String>,

    /// Run the jobs from the configuration file instead of the command
    /// line, optionally restricted to the `snapshot' or `send' actions.
    #[arg(
        long,
        value_name = "ACTIONS",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "snapshot,send"
    )]
    auto: Option<Actions>,

    /// Path to the configuration file to use. Requires --auto.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn check(condition: bool, message: &str) -> Result<()> {
    if condition { Ok(()) } else { Err(eyre!("{message}")) }
}

fn validate_args(args: &Args) -> Result<()> {
    if args.auto.is_some() {
        check(
            args.datasets.is_empty()
                && !args.recursive
                && args.exclude.is_empty()
                && args.prefix.is_none()
                && !args.no_snapshot
                && args.keep.is_none()
                && args.send_to.is_none()
                && args.send_base.is_none(),
            "--auto conflicts with --recursive, --exclude, --prefix, --no-snapshot, \
             --keep, --send-to, --send-base and DATASETS",
        )
    } else {
        check(
            !args.datasets.is_empty(),
            "DATASETS is required unless --auto is given",
        )?;
        check(args.config.is_none(), "--config requires --auto")?;
        check(
            args.exclude.is_empty() || args.recursive,
            "--exclude requires --recursive",
        )?;
        check(
            !args.no_snapshot || args.keep.is_some() || args.send_to.is_some(),
            "--no-snapshot requires --keep or --send-to",
        )?;
        check(
            args.send_base.is_none() || args.send_to.is_some(),
            "--send-base requires --send-to",
        )?;
        check(
            args.send_to.is_none() || args.datasets.len() < 2 || args.send_base.is_some(),
            "--send-base is required when sending more than one dataset",
        )
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();

    let args = Args::parse();
    validate_args(&args)?;

    match args.auto {
        Some(actions) => {
            let path = args
                .config
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
            let config = config::load(&path)?;
            for job in &config.snapshot {
                orchestrate::run_job(&ZfsCli, job, actions, Local::now().naive_local())?;
            }
        }
        None => {
            let job = Job {
                datasets: args.datasets,
                recursive: args.recursive,
                exclude: args.exclude,
                prefix: args.prefix,
                take_snapshot: !args.no_snapshot,
                pre_snapshot_script: None,
                prune_keep: args.keep,
                send_target: args.send_to,
                send_base: args.send_base,
            };
            orchestrate::run_job(&ZfsCli, &job, Actions::ALL, Local::now().naive_local())?;
        }
    }

    Ok(())
}
