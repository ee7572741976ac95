use crate::{
    command::{self, CommandError, CommandSpec},
    config::CommandsConfig,
};
use thiserror::Error;
use tracing::{error, info};

/// Removed (3) and completed (4) jobs may linger in the queue, they don't hold on to their files
pub const LIVE_JOB_CONSTRAINT: &str = "JobStatus != 3 && JobStatus != 4";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("condor_q reported an error: {0}")]
    Stderr(String),
    #[error("condor_q exited with status {0:?}")]
    Failed(Option<i32>),
}

/// condor_q arguments listing one line per live job of the cluster, `None` queries the local schedd
pub fn queue_args(scheduler: Option<&str>, cluster_id: u64) -> Vec<String> {
    let mut args = Vec::with_capacity(8);

    if let Some(scheduler) = scheduler {
        args.push("-name".to_string());
        args.push(scheduler.to_string());
    }

    args.extend([
        "-format".to_string(),
        "%d\n".to_string(),
        "ClusterId".to_string(),
        "-constraint".to_string(),
        LIVE_JOB_CONSTRAINT.to_string(),
        cluster_id.to_string(),
    ]);

    args
}

/// Number of live jobs condor still holds for the cluster
#[tracing::instrument(level = "debug", skip(commands))]
pub fn jobs_in_queue(
    commands: &CommandsConfig,
    scheduler: Option<&str>,
    cluster_id: u64,
) -> Result<usize, QueueError> {
    let spec =
        CommandSpec::new(&commands.condor_q, commands.timeout()).args(queue_args(scheduler, cluster_id));

    info!(target: "cleaner", "...running: {}", spec.display());
    let output = command::run(&spec)?;

    // older condor versions exit with 0 and only complain on stderr
    if !output.stderr.trim().is_empty() {
        error!(target: "cleaner", "...got error running command: {}", output.stderr.trim());

        return Err(QueueError::Stderr(output.stderr.trim().to_string()));
    }

    if !output.success() {
        return Err(QueueError::Failed(output.status));
    }

    Ok(count_cluster_lines(&output.stdout, cluster_id))
}

/// Count the output lines that belong to the cluster, one line per job
pub fn count_cluster_lines(stdout: &str, cluster_id: u64) -> usize {
    let cluster_id = cluster_id.to_string();

    stdout
        .lines()
        .filter(|line| line.split_whitespace().next() == Some(cluster_id.as_str()))
        .count()
}

#[cfg(test)]
#[path = "queue_test.rs"]
mod queue_test;
