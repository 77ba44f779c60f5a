use std::fs;
use std::path::Path;
use std::str::FromStr;

use chrono::Duration;
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use serde::Deserialize;

use crate::zfs::Dataset;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/snappy/snappy.toml";

/// How many snapshots to keep, either a plain "newest N" or one snapshot
/// per time bucket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum KeepSpec {
    MostRecent {
        count: usize,
    },
    Interval {
        interval: Duration,
        count: Option<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct InvalidKeepSpec(String);

const UNITS: [(&str, u64); 5] = [
    ("s", 1),
    ("m", 60),
    ("h", 60 * 60),
    ("d", 60 * 60 * 24),
    ("w", 60 * 60 * 24 * 7),
];

impl FromStr for KeepSpec {
    type Err = InvalidKeepSpec;

    // spec  := count | interval [":" count]
    // unit  := "s" | "m" | "h" | "d" | "w"
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = |message: String| InvalidKeepSpec(message);

        let (spec, count_str) = match value.split_once(':') {
            Some((spec, count_str)) => (spec, Some(count_str)),
            None => (value, None),
        };

        let digits_end = spec
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(spec.len());
        let (number_str, unit_str) = spec.split_at(digits_end);

        if number_str.is_empty() {
            return Err(invalid("Missing count or interval.".to_string()));
        }
        let number: u64 = number_str
            .parse()
            .map_err(|_| invalid(format!("Count or interval out of range `{number_str}'.")))?;

        if unit_str.is_empty() {
            if count_str.is_some() {
                return Err(invalid(
                    "Only a time interval can be followed by a `:'.".to_string(),
                ));
            }
            if number == 0 {
                return Err(invalid("Count must be non-zero.".to_string()));
            }

            return Ok(KeepSpec::MostRecent {
                count: number as usize,
            });
        }

        let Some((_, unit_seconds)) = UNITS.iter().find(|(unit, _)| *unit == unit_str) else {
            return Err(invalid(format!("Unknown unit `{unit_str}'.")));
        };
        if number == 0 {
            return Err(invalid("Interval must be non-zero.".to_string()));
        }
        let interval = number
            .checked_mul(*unit_seconds)
            .and_then(|s| i64::try_from(s).ok())
            .and_then(Duration::try_seconds)
            .ok_or_else(|| invalid(format!("Interval out of range `{spec}'.")))?;

        let count = match count_str {
            None => None,
            Some("") => return Err(invalid("Missing count after `:'.".to_string())),
            Some(count_str) => {
                let count: usize = count_str
                    .parse()
                    .map_err(|_| invalid(format!("Invalid count `{count_str}'.")))?;
                if count == 0 {
                    return Err(invalid("Count must be non-zero.".to_string()));
                }
                Some(count)
            }
        };

        Ok(KeepSpec::Interval { interval, count })
    }
}

impl TryFrom<String> for KeepSpec {
    type Error = InvalidKeepSpec;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One snapshot/prune/send job. Built from the command line or read from
/// the `[[snapshot]]` tables of the configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Job {
    pub datasets: Vec<Dataset>,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub exclude: Vec<Dataset>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default = "default_take_snapshot")]
    pub take_snapshot: bool,
    #[serde(default)]
    pub pre_snapshot_script: Option<String>,
    #[serde(default)]
    pub prune_keep: Option<Vec<KeepSpec>>,
    #[serde(default)]
    pub send_target: Option<Dataset>,
    #[serde(default)]
    pub send_base: Option<Dataset>,
}

fn default_take_snapshot() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub snapshot: Vec<Job>,
}

pub fn load(path: &Path) -> Result<Config> {
    let text = fs::read_to_string(path)
        .wrap_err_with(|| format!("Could not load config file `{}`", path.display()))?;
    let config: Config = toml::from_str(&text)
        .wrap_err_with(|| format!("Error in config file `{}`", path.display()))?;

    validate(&config, path)?;
    Ok(config)
}

fn validate(config: &Config, path: &Path) -> Result<()> {
    let check = |condition: bool, message: &str| {
        if condition {
            Ok(())
        } else {
            Err(eyre!("Error in config file `{}`: {message}", path.display()))
        }
    };

    for job in &config.snapshot {
        check(
            job.take_snapshot || job.prune_keep.is_some() || job.send_target.is_some(),
            "at least one of the keys `prune_keep' and `send_target' is required \
             if `take_snapshot' is set to false",
        )?;
        check(
            job.recursive || job.exclude.is_empty(),
            "key `exclude' requires that `recursive' is set to true",
        )?;
        check(
            job.prune_keep.as_ref().is_none_or(|keep| !keep.is_empty()),
            "`prune_keep' cannot be an empty list",
        )?;
        check(
            job.pre_snapshot_script.is_none() || job.take_snapshot,
            "key `pre_snapshot_script' requires that `take_snapshot' is set to true",
        )?;
        check(
            job.send_base.is_none() || job.send_target.is_some(),
            "key `send_target' is required if `send_base' is set",
        )?;
        check(
            job.send_target.is_none() || job.datasets.len() < 2 || job.send_base.is_some(),
            "key `send_base' is required if `send_target' is set and multiple \
             datasets are specified",
        )?;
    }

    Ok(())
}
