use crate::{
    cluster::{self, ClusterFileError, ClusterRecord},
    command::{self, CommandError, CommandSpec},
    condor::resolve_submit_dir,
    config::AgentConfig,
};
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Component, Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Name of the submit description inside each job directory
pub const SUBMIT_FILE: &str = "job.sub";
const JOB_DIR_PREFIX: &str = "submit-";
const CLUSTER_MARKER: &str = "submitted to cluster";

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("No submit directory configured, set CONDOR_AGENT_SUBMIT_DIR")]
    NoSubmitDir,
    #[error("Submit description is empty")]
    EmptyDescription,
    #[error("Invalid file name {0:?}")]
    InvalidFileName(String),
    #[error("Failed to prepare job directory: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("condor_submit rejected the submission: {0}")]
    Rejected(String),
    #[error("condor_submit output contained no cluster id")]
    NoClusterId,
    #[error(transparent)]
    ClusterFile(#[from] ClusterFileError),
}

#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub description: String,
    pub scheduler: Option<String>,
    // auxiliary files placed next to the submit description, name -> content
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub cluster_id: u64,
    pub scheduler: Option<String>,
    pub job_dir: PathBuf,
    pub cluster_file: PathBuf,
}

impl SubmitRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn scheduler(mut self, scheduler: Option<String>) -> Self {
        self.scheduler = scheduler.filter(|name| !name.trim().is_empty());
        self
    }

    pub fn file(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(name.into(), content.into());
        self
    }
}

/// Wraps condor_submit, every submission gets its own job directory and cluster file
#[derive(Debug, Clone)]
pub struct Submitter {
    config: AgentConfig,
}

impl Submitter {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    #[tracing::instrument(level = "info", skip(self, request), fields(scheduler = ?request.scheduler))]
    pub fn submit(&self, request: &SubmitRequest) -> Result<Submission, SubmitError> {
        if request.description.trim().is_empty() {
            return Err(SubmitError::EmptyDescription);
        }

        let submit_dir = resolve_submit_dir(&self.config).ok_or(SubmitError::NoSubmitDir)?;

        if let Some(name) = request.files.keys().find(|name| !valid_file_name(name)) {
            return Err(SubmitError::InvalidFileName(name.clone()));
        }

        fs::create_dir_all(&submit_dir)?;

        let job_dir = tempfile::Builder::new()
            .prefix(JOB_DIR_PREFIX)
            .tempdir_in(&submit_dir)?
            .keep();
        debug!(job_dir = ?job_dir, "Created job directory");

        match self.submit_in(&submit_dir, &job_dir, request) {
            Ok(submission) => Ok(submission),
            Err(error) => {
                if let Err(cleanup) = fs::remove_dir_all(&job_dir) {
                    warn!(job_dir = ?job_dir, error = ?cleanup, "Failed to remove job directory of failed submission");
                }

                Err(error)
            }
        }
    }

    fn submit_in(
        &self,
        submit_dir: &Path,
        job_dir: &Path,
        request: &SubmitRequest,
    ) -> Result<Submission, SubmitError> {
        fs::write(job_dir.join(SUBMIT_FILE), &request.description)?;
        for (name, content) in request.files.iter() {
            fs::write(job_dir.join(name), content)?;
        }

        let commands = &self.config.commands;
        let mut spec = CommandSpec::new(&commands.condor_submit, commands.timeout()).current_dir(job_dir);
        if let Some(ref scheduler) = request.scheduler {
            spec = spec.args(["-name", scheduler.as_str()]);
        }
        let output = command::run(&spec.arg(SUBMIT_FILE))?;

        if !output.success() {
            let reason = if output.stderr.trim().is_empty() {
                format!("exit status {:?}", output.status)
            } else {
                output.stderr.trim().to_string()
            };

            return Err(SubmitError::Rejected(reason));
        }

        let cluster_id = parse_cluster_id(&output.stdout).ok_or(SubmitError::NoClusterId)?;
        let record = ClusterRecord {
            cluster_id,
            scheduler: request.scheduler.clone(),
            job_dir: job_dir.to_path_buf(),
            submitted_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or_default(),
        };
        let cluster_file = cluster::write(submit_dir, &record)?;

        info!(
            cluster_id,
            job_dir = ?job_dir,
            "Submitted cluster"
        );

        Ok(Submission {
            cluster_id,
            scheduler: record.scheduler,
            job_dir: record.job_dir,
            cluster_file,
        })
    }
}

/// Extract the cluster id from condor_submit output, e.g. `1 job(s) submitted to cluster 42.`
pub fn parse_cluster_id(stdout: &str) -> Option<u64> {
    let start = stdout.rfind(CLUSTER_MARKER)? + CLUSTER_MARKER.len();
    let digits: String = stdout[start..]
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();

    digits.parse().ok()
}

fn valid_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();

    !name.contains('/')
        && name != SUBMIT_FILE
        && matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none()
}
