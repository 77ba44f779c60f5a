use std::collections::HashSet;
use std::str::FromStr;

use chrono::NaiveDateTime;
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use itertools::Itertools;
use subprocess::{Exec, ExitStatus};

use crate::config::{Job, KeepSpec};
use crate::send::send_snapshots;
use crate::snapshots::{DEFAULT_PREFIX, find_expired_snapshots, make_snapshot_name};
use crate::zfs::{Dataset, Snapshot, Zfs};

/// Which of the configured actions to run. Auto mode can restrict a run to
/// snapshotting or sending so the two can follow independent schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actions {
    pub snapshot: bool,
    pub send: bool,
}

impl Actions {
    pub const ALL: Actions = Actions {
        snapshot: true,
        send: true,
    };
}

impl FromStr for Actions {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut actions = Actions {
            snapshot: false,
            send: false,
        };
        for part in value.split(',') {
            match part {
                "snapshot" => actions.snapshot = true,
                "send" => actions.send = true,
                other => return Err(format!("unknown action `{other}'")),
            }
        }
        Ok(actions)
    }
}

/// Runs one job: pre-snapshot script, snapshot creation, replication and
/// pruning, in that order. `now` is the single timestamp of this run; all
/// created snapshots share it.
pub fn run_job(zfs: &impl Zfs, job: &Job, actions: Actions, now: NaiveDateTime) -> Result<()> {
    let prefix = job.prefix.as_deref().unwrap_or(DEFAULT_PREFIX);

    if actions.snapshot
        && let Some(script) = &job.pre_snapshot_script
    {
        run_pre_snapshot_script(script)?;
    }

    let selected = select_datasets(zfs, &job.datasets, job.recursive, &job.exclude)?;

    if actions.snapshot && job.take_snapshot {
        let name = make_snapshot_name(prefix, now);
        let snapshots: Vec<Snapshot> = selected
            .iter()
            .map(|dataset| Snapshot::new(dataset.clone(), name.clone()))
            .collect();
        zfs.create_snapshots(&snapshots)?;
    }

    let (prune_datasets, do_prune) = match &job.send_target {
        None => (selected.clone(), actions.snapshot),
        Some(send_target) => {
            let send_base = match &job.send_base {
                Some(send_base) => send_base.clone(),
                None => {
                    // Without an explicit base the single input dataset
                    // maps straight onto the target.
                    let (only,) = job.datasets.iter().collect_tuple().ok_or_else(|| {
                        eyre!("A send base is required when sending more than one dataset")
                    })?;
                    only.clone()
                }
            };

            let targets: Vec<Dataset> = selected
                .iter()
                .map(|source| {
                    let rest = source.strip_prefix(send_base.as_str()).ok_or_else(|| {
                        eyre!("Dataset `{source}` does not start with the send base `{send_base}`")
                    })?;
                    Ok(format!("{send_target}{rest}"))
                })
                .collect::<Result<_>>()?;

            if actions.send {
                for (source, target) in selected.iter().zip(&targets) {
                    send_snapshots(zfs, source, target, prefix, now)?;
                }
            }

            // Sending moves the snapshots, so pruning applies to where
            // they now live.
            (targets, actions.send)
        }
    };

    if do_prune && let Some(keep_specs) = &job.prune_keep {
        for dataset in &prune_datasets {
            prune(zfs, dataset, keep_specs, prefix)?;
        }
    }

    Ok(())
}

// A dataset is selected if the nearest enclosing dataset that is named in
// either list is one of the inputs. Excluding a dataset takes its whole
// subtree along, unless a descendant is itself named as an input again.
fn select_datasets(
    zfs: &impl Zfs,
    inputs: &[Dataset],
    recursive: bool,
    exclude: &[Dataset],
) -> Result<Vec<Dataset>> {
    if !recursive {
        debug_assert!(exclude.is_empty());
        return Ok(inputs.to_vec());
    }

    let input_set: HashSet<&str> = inputs.iter().map(String::as_str).collect();
    let exclude_set: HashSet<&str> = exclude.iter().map(String::as_str).collect();

    let included = |dataset: &str| {
        let mut current = dataset;
        loop {
            if input_set.contains(current) {
                return true;
            }
            if exclude_set.contains(current) {
                return false;
            }
            match current.rsplit_once('/') {
                Some((parent, _)) => current = parent,
                None => return false,
            }
        }
    };

    let mut seen = HashSet::new();
    let mut selected = Vec::new();
    for input in inputs.iter().sorted().dedup() {
        for dataset in zfs.list_children(input)? {
            if included(&dataset) && seen.insert(dataset.clone()) {
                selected.push(dataset);
            }
        }
    }

    Ok(selected)
}

fn prune(zfs: &impl Zfs, dataset: &str, keep_specs: &[KeepSpec], prefix: &str) -> Result<()> {
    let snapshots = zfs.list_snapshots(dataset, false)?;

    // The newest snapshot is always kept, whatever the configured specs
    // say. Expiring it on a send target would sever the incremental chain.
    let keep_specs: Vec<KeepSpec> = keep_specs
        .iter()
        .cloned()
        .chain([KeepSpec::MostRecent { count: 1 }])
        .collect();

    let expired = find_expired_snapshots(&snapshots, &keep_specs, prefix);
    zfs.destroy_snapshots(&expired)?;
    Ok(())
}

fn run_pre_snapshot_script(script: &str) -> Result<()> {
    log::info!("Running pre-snapshot script: {script}");

    let status = Exec::shell(script)
        .join()
        .wrap_err("Could not run the pre-snapshot script")?;
    match status {
        ExitStatus::Exited(0) => Ok(()),
        ExitStatus::Exited(code) => Err(eyre!("Pre-snapshot script failed with exit code {code}")),
        other => Err(eyre!("Pre-snapshot script failed: {other:?}")),
    }
}
