//! Configuration of a planner/executor run.
//!
//! [`ScoobiConf`] is a key-value map of tuning parameters with typed getters
//! for the recognised keys:
//!
//! | key | effect | default |
//! |---|---|---|
//! | `scoobi.mode` | execution backend (`InMemory`/`Local`/`Cluster`) | `Local` |
//! | `scoobi.workingdir` | base for temporary outputs | `<tmp>/scoobi` |
//! | `scoobi.concurrentjobs` | run MSCRs within a layer in parallel | `true` |
//! | `scoobi.reducers.max` | reducer-count upper bound | `i32::MAX` |
//! | `scoobi.reducers.min` | reducer-count lower bound | `1` |
//! | `scoobi.reducers.bytesperreducer` | heuristic divisor | 1 GiB |
//!
//! `scoobi.uploadedlibjars` is carried for the CLI collaborator but not
//! interpreted here. Unknown keys are stored and ignored.
//!
//! Every job executes against its own clone of the configuration, so nothing
//! here needs interior mutability.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::ids::JobId;

/// Execution backend selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// In-process execution over host-memory iterables, no job scratch dirs.
    InMemory,
    /// In-process execution with the working-directory layout of a real run.
    Local,
    /// A real batch cluster; requires a caller-supplied job runtime.
    Cluster,
}

const KEY_MODE: &str = "scoobi.mode";
const KEY_WORKING_DIR: &str = "scoobi.workingdir";
const KEY_CONCURRENT_JOBS: &str = "scoobi.concurrentjobs";
const KEY_REDUCERS_MAX: &str = "scoobi.reducers.max";
const KEY_REDUCERS_MIN: &str = "scoobi.reducers.min";
const KEY_BYTES_PER_REDUCER: &str = "scoobi.reducers.bytesperreducer";

const GIB: u64 = 1024 * 1024 * 1024;

/// A key-value map of tuning parameters, cloned per job.
#[derive(Clone, Debug, Default)]
pub struct ScoobiConf {
    settings: HashMap<String, String>,
}

impl ScoobiConf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one parameter, returning `self` for chaining.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    /// Set one parameter in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.settings.insert(key.into(), value.into());
    }

    /// Raw value of a key, if set.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }

    /// The selected execution backend.
    ///
    /// # Errors
    /// If `scoobi.mode` is set to an unrecognised value.
    pub fn mode(&self) -> Result<Mode> {
        match self.get(KEY_MODE) {
            None => Ok(Mode::Local),
            Some("InMemory") | Some("inmemory") => Ok(Mode::InMemory),
            Some("Local") | Some("local") => Ok(Mode::Local),
            Some("Cluster") | Some("cluster") => Ok(Mode::Cluster),
            Some(other) => bail!("unrecognised {KEY_MODE}: {other:?}"),
        }
    }

    /// Base directory for temporary outputs.
    pub fn working_dir(&self) -> PathBuf {
        match self.get(KEY_WORKING_DIR) {
            Some(dir) => PathBuf::from(dir),
            None => std::env::temp_dir().join("scoobi"),
        }
    }

    /// Job staging area under the working directory.
    pub fn staging_dir(&self) -> PathBuf {
        self.working_dir().join("staging")
    }

    /// Per-job local scratch under the working directory.
    pub fn local_runner_dir(&self) -> PathBuf {
        self.working_dir().join("localRunner")
    }

    /// Temporary output directory of one job.
    pub fn tmp_out_dir(&self, job: JobId) -> PathBuf {
        self.working_dir().join(format!("tmp-out-{}", job.raw()))
    }

    /// Whether MSCRs within a layer run in parallel.
    pub fn concurrent_jobs(&self) -> bool {
        match self.get(KEY_CONCURRENT_JOBS) {
            Some(v) => v.eq_ignore_ascii_case("true"),
            None => true,
        }
    }

    /// Upper bound of the reducer-count heuristic.
    pub fn max_reducers(&self) -> usize {
        self.parse_or(KEY_REDUCERS_MAX, i32::MAX as usize)
    }

    /// Lower bound of the reducer-count heuristic.
    pub fn min_reducers(&self) -> usize {
        self.parse_or(KEY_REDUCERS_MIN, 1)
    }

    /// Input bytes per reducer in the heuristic.
    pub fn bytes_per_reducer(&self) -> u64 {
        self.parse_or(KEY_BYTES_PER_REDUCER, GIB)
    }

    fn parse_or<T: std::str::FromStr + Copy>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let conf = ScoobiConf::new();
        assert_eq!(conf.mode().unwrap(), Mode::Local);
        assert!(conf.concurrent_jobs());
        assert_eq!(conf.min_reducers(), 1);
        assert_eq!(conf.max_reducers(), i32::MAX as usize);
        assert_eq!(conf.bytes_per_reducer(), GIB);
    }

    #[test]
    fn recognised_keys_parse() {
        let conf = ScoobiConf::new()
            .with("scoobi.mode", "InMemory")
            .with("scoobi.concurrentjobs", "false")
            .with("scoobi.reducers.max", "16")
            .with("scoobi.reducers.min", "2")
            .with("scoobi.reducers.bytesperreducer", "1024");
        assert_eq!(conf.mode().unwrap(), Mode::InMemory);
        assert!(!conf.concurrent_jobs());
        assert_eq!(conf.max_reducers(), 16);
        assert_eq!(conf.min_reducers(), 2);
        assert_eq!(conf.bytes_per_reducer(), 1024);
    }

    #[test]
    fn bad_mode_is_an_error() {
        let conf = ScoobiConf::new().with("scoobi.mode", "warp-drive");
        assert!(conf.mode().is_err());
    }

    #[test]
    fn tmp_out_encodes_job_id() {
        let conf = ScoobiConf::new().with("scoobi.workingdir", "/tmp/w");
        let dir = conf.tmp_out_dir(crate::ids::JobId::new(7));
        assert_eq!(dir, PathBuf::from("/tmp/w/tmp-out-7"));
    }
}
