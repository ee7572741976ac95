//! Cluster files tie a submitted cluster to the directory it was submitted from.
//!
//! They live directly in the submit directory and are named
//! `<scheduler>.<cluster id>.cluster`. The scheduler is part of the name since cluster ids are
//! only unique per schedd, an agent fronting several schedds would otherwise overwrite records.

use crate::condor::local_scheduler_name;
use globset::{Glob, GlobMatcher};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, warn};

pub const CLUSTER_EXTENSION: &str = "cluster";

#[derive(Debug, Error)]
pub enum ClusterFileError {
    #[error("Cluster file io failed: {0}")]
    Io(#[from] io::Error),
    #[error("Cluster file is malformed: {0}")]
    Malformed(#[from] serde_yaml::Error),
    #[error("Cluster glob was invalid")]
    InvalidGlob(#[from] globset::Error),
    #[error("{0:?} is not a directory")]
    NotADirectory(PathBuf),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ClusterRecord {
    #[serde(alias = "clusterid")]
    pub cluster_id: u64,
    // None means the local schedd, condor_q is run without -name then
    #[serde(alias = "queue", default)]
    pub scheduler: Option<String>,
    #[serde(alias = "tmpdir")]
    pub job_dir: PathBuf,
    // seconds since the unix epoch
    #[serde(default)]
    pub submitted_at: u64,
}

impl ClusterRecord {
    pub fn file_name(&self) -> String {
        file_name(self.scheduler.as_deref(), self.cluster_id)
    }
}

/// Build the file name for a cluster on the given scheduler
pub fn file_name(scheduler: Option<&str>, cluster_id: u64) -> String {
    let scheduler = scheduler
        .filter(|name| !name.is_empty())
        .unwrap_or(local_scheduler_name());

    format!(
        "{}.{cluster_id}.{CLUSTER_EXTENSION}",
        sanitize_scheduler(scheduler)
    )
}

/// Percent-encode every byte outside `[A-Za-z0-9@._-]`, distinct schedulers keep distinct names
fn sanitize_scheduler(name: &str) -> String {
    name.bytes()
        .map(|byte| match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'@' | b'.' | b'_' | b'-' => {
                char::from(byte).to_string()
            }
            _ => format!("%{byte:02X}"),
        })
        .collect()
}

/// Persist the record in `dir`, readers never observe a partially written file
pub fn write(dir: &Path, record: &ClusterRecord) -> Result<PathBuf, ClusterFileError> {
    let path = dir.join(record.file_name());
    let staging = path.with_extension(format!("{CLUSTER_EXTENSION}.tmp"));

    fs::write(&staging, serde_yaml::to_string(record)?)?;
    // rename is atomic on the same filesystem
    if let Err(error) = fs::rename(&staging, &path) {
        let _ = fs::remove_file(&staging);

        return Err(error.into());
    }

    debug!(path = ?path, "Wrote cluster file");

    Ok(path)
}

pub fn load(path: &Path) -> Result<ClusterRecord, ClusterFileError> {
    let file = File::open(path)?;

    Ok(serde_yaml::from_reader(file)?)
}

/// All cluster files directly inside `dir`, sorted by path
pub fn locate(dir: &Path) -> Result<Vec<PathBuf>, ClusterFileError> {
    if !dir.is_dir() {
        return Err(ClusterFileError::NotADirectory(dir.to_path_buf()));
    }

    let matcher = cluster_matcher()?;

    Ok(WalkBuilder::new(dir)
        .max_depth(Some(1))
        .standard_filters(false)
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(error) => {
                warn!(error = ?error, "Failed to read entry in submit directory");
                None
            }
        })
        .filter(|entry| entry.file_type().is_some_and(|kind| kind.is_file()))
        .filter(|entry| matcher.is_match(entry.file_name()))
        .map(DirEntry::into_path)
        .sorted()
        .collect_vec())
}

fn cluster_matcher() -> Result<GlobMatcher, ClusterFileError> {
    Ok(Glob::new(&format!("*.{CLUSTER_EXTENSION}"))?.compile_matcher())
}
