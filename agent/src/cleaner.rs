//! Background cleanup of job directories.
//!
//! Every submission leaves a job directory and a cluster file behind in the submit directory.
//! The cleaner runs on its own thread and periodically removes the job directories of clusters
//! that have no live jobs left in the queue, so old output doesn't pile up on disk.

use crate::{
    cluster::{self, ClusterFileError},
    condor::{local_scheduler_name, resolve_submit_dir},
    config::AgentConfig,
    queue::{jobs_in_queue, QueueError},
};
use parking_lot::{Condvar, Mutex};
use std::{
    fs, io,
    path::{Component, Path, PathBuf},
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum CleanerError {
    #[error(transparent)]
    ClusterFile(#[from] ClusterFileError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("Unable to stat {path:?}: {source}")]
    Stat { path: PathBuf, source: io::Error },
    #[error("Unable to remove {path:?}: {source}")]
    Remove { path: PathBuf, source: io::Error },
    #[error("Job directory {0:?} is outside of the submit directory, refusing to remove it")]
    OutsideSubmitDir(PathBuf),
}

/// What happened to a single cluster file during a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    TooYoung,
    StillQueued(usize),
    WouldRemove,
    Removed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub too_young: usize,
    pub still_queued: usize,
    pub would_remove: usize,
    pub removed: usize,
    pub errors: usize,
}

#[derive(Debug, Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    /// sleep for `timeout` or until stopped, returns whether a stop was requested
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock();

        while !*stopped {
            if self.wake.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }

        *stopped
    }

    fn stop(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }
}

/// Handle to a running cleaner thread
#[derive(Debug)]
pub struct CleanerHandle {
    stop: Arc<StopSignal>,
    thread: JoinHandle<()>,
}

impl CleanerHandle {
    /// Ask the thread to stop, it wakes up from its sleep immediately
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    pub fn join(self) -> thread::Result<()> {
        self.thread.join()
    }
}

#[derive(Debug, Clone)]
pub struct SubmitCleaner {
    config: AgentConfig,
    dry_run: bool,
    interval: Duration,
    min_age: Duration,
}

impl SubmitCleaner {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            dry_run: config.cleaner.dry_run,
            interval: config.cleaner.interval(),
            min_age: config.cleaner.min_age(),
            config,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn min_age(mut self, min_age: Duration) -> Self {
        self.min_age = min_age;
        self
    }

    /// Start the cleaner loop on a dedicated thread
    pub fn spawn(self) -> io::Result<CleanerHandle> {
        let stop = Arc::new(StopSignal::default());
        let thread_stop = stop.clone();
        let thread = thread::Builder::new()
            .name("submit-cleaner".to_string())
            .spawn(move || self.run(&thread_stop))?;

        Ok(CleanerHandle { stop, thread })
    }

    fn run(self, stop: &StopSignal) {
        info!(target: "cleaner", "Local submission cleanup thread starting up");

        // a missing submit dir is not fatal, it may be configured later on
        if resolve_submit_dir(&self.config).is_none() {
            warn!(target: "cleaner", "No CONDOR_AGENT_SUBMIT_DIR setting found for this host, no cleanup is performed until one is set");
        }

        loop {
            // sleep first, the schedds need a moment after a restart before condor_q lists their jobs
            info!(target: "cleaner", "Sleeping for {} seconds", self.interval.as_secs());
            if stop.wait(self.interval) {
                break;
            }

            match resolve_submit_dir(&self.config) {
                None => {
                    warn!(target: "cleaner", "Could not find a CONDOR_AGENT_SUBMIT_DIR setting for this host -- no cleanup performed");
                }
                Some(dir) => {
                    info!(target: "cleaner", "Scanning submit directory {dir:?} for *.cluster files...");
                    let report = self.sweep(&dir, SystemTime::now());
                    info!(target: "cleaner", report = ?report, "Finished sweep");
                }
            }
        }

        info!(target: "cleaner", "Local submission cleanup thread stopped");
    }

    /// Visit every cluster file in `dir` once, no single failure ends the sweep
    pub fn sweep(&self, dir: &Path, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();

        let files = match cluster::locate(dir) {
            Ok(files) => files,
            Err(error) => {
                error!(target: "cleaner", error = ?error, "Unable to list submit directory {dir:?}");
                report.errors += 1;

                return report;
            }
        };

        for path in files {
            report.examined += 1;

            match self.clean_cluster_file(&path, now) {
                Ok(Outcome::TooYoung) => report.too_young += 1,
                Ok(Outcome::StillQueued(_)) => report.still_queued += 1,
                Ok(Outcome::WouldRemove) => report.would_remove += 1,
                Ok(Outcome::Removed) => report.removed += 1,
                Err(error) => {
                    error!(target: "cleaner", path = ?path, "Caught unhandled error: {error}");
                    report.errors += 1;
                }
            }
        }

        report
    }

    /// Remove the job directory and cluster file once condor no longer holds live jobs for it
    pub fn clean_cluster_file(&self, path: &Path, now: SystemTime) -> Result<Outcome, CleanerError> {
        let modified = fs::metadata(path)
            .and_then(|metadata| metadata.modified())
            .map_err(|source| CleanerError::Stat {
                path: path.to_path_buf(),
                source,
            })?;

        // fresh jobs may not show up in condor_q yet, removing their directory would break them
        if now.duration_since(modified).unwrap_or_default() < self.min_age {
            info!(target: "cleaner", "...submission file {path:?} is not old enough to be considered");

            return Ok(Outcome::TooYoung);
        }

        let record = cluster::load(path)?;
        info!(
            target: "cleaner",
            "Checking cluster {} for jobs in queue {}...",
            record.cluster_id,
            record.scheduler.as_deref().unwrap_or(local_scheduler_name())
        );

        let jobs = jobs_in_queue(
            &self.config.commands,
            record.scheduler.as_deref(),
            record.cluster_id,
        )?;
        if jobs > 0 {
            info!(target: "cleaner", "...found {jobs} jobs in the queue still, no cleanup done");

            return Ok(Outcome::StillQueued(jobs));
        }

        // only ever remove a job directory sitting directly in the submit directory
        if !path
            .parent()
            .is_some_and(|submit_dir| is_job_dir_of(submit_dir, &record.job_dir))
        {
            return Err(CleanerError::OutsideSubmitDir(record.job_dir));
        }

        if self.dry_run {
            debug!(target: "cleaner", "...DRY RUN would have removed path {:?}", record.job_dir);
            debug!(target: "cleaner", "...DRY RUN would have removed file {path:?}");

            return Ok(Outcome::WouldRemove);
        }

        info!(target: "cleaner", "...found no jobs in the queue, performing cleanup of directory {:?}", record.job_dir);
        match fs::remove_dir_all(&record.job_dir) {
            Ok(()) => info!(target: "cleaner", "...removed path {:?}", record.job_dir),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!(target: "cleaner", "...path {:?} was already gone", record.job_dir)
            }
            Err(source) => {
                return Err(CleanerError::Remove {
                    path: record.job_dir,
                    source,
                })
            }
        }

        fs::remove_file(path).map_err(|source| CleanerError::Remove {
            path: path.to_path_buf(),
            source,
        })?;
        info!(target: "cleaner", "...removed file {path:?}");

        Ok(Outcome::Removed)
    }
}

/// `job_dir` names an entry directly below `submit_dir`, without any `.` or `..` detours
fn is_job_dir_of(submit_dir: &Path, job_dir: &Path) -> bool {
    job_dir
        .components()
        .all(|component| !matches!(component, Component::ParentDir | Component::CurDir))
        && matches!(job_dir.components().next_back(), Some(Component::Normal(_)))
        && job_dir.parent() == Some(submit_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterRecord;
    use std::os::unix::fs::PermissionsExt;

    struct Fixture {
        root: tempfile::TempDir,
        config: AgentConfig,
    }

    impl Fixture {
        /// condor_q answers with the content of `queue/<cluster id>`, an absent file is an empty queue
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let submit_dir = root.path().join("spool");
            let queue_dir = root.path().join("queue");
            fs::create_dir(&submit_dir).unwrap();
            fs::create_dir(&queue_dir).unwrap();

            let script = root.path().join("condor_q");
            fs::write(
                &script,
                format!(
                    "#!/bin/sh\nfor last; do :; done\ncat \"{}/$last\" 2>/dev/null\nexit 0\n",
                    queue_dir.display()
                ),
            )
            .unwrap();
            fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

            let mut config = AgentConfig::default();
            config.submit_dir = Some(submit_dir);
            config.commands.condor_q = script;

            Self { root, config }
        }

        fn submit_dir(&self) -> PathBuf {
            self.root.path().join("spool")
        }

        fn queue_jobs(&self, cluster_id: u64, jobs: usize) {
            fs::write(
                self.root.path().join("queue").join(cluster_id.to_string()),
                format!("{cluster_id}\n").repeat(jobs),
            )
            .unwrap();
        }

        fn submission(&self, cluster_id: u64) -> (PathBuf, PathBuf) {
            let job_dir = self.submit_dir().join(format!("submit-{cluster_id}"));
            fs::create_dir(&job_dir).unwrap();
            fs::write(job_dir.join("job.sub"), "queue").unwrap();

            let record = ClusterRecord {
                cluster_id,
                scheduler: Some("q1@node7".to_string()),
                job_dir: job_dir.clone(),
                submitted_at: 0,
            };

            (cluster::write(&self.submit_dir(), &record).unwrap(), job_dir)
        }

        fn cleaner(&self) -> SubmitCleaner {
            SubmitCleaner::new(self.config.clone()).min_age(Duration::from_secs(300))
        }
    }

    fn later() -> SystemTime {
        SystemTime::now() + Duration::from_secs(3600)
    }

    #[test]
    fn young_files_are_left_alone() {
        let fixture = Fixture::new();
        let (cluster_file, job_dir) = fixture.submission(1);

        let outcome = fixture
            .cleaner()
            .clean_cluster_file(&cluster_file, SystemTime::now())
            .unwrap();

        assert_eq!(outcome, Outcome::TooYoung);
        assert!(cluster_file.exists());
        assert!(job_dir.exists());
    }

    #[test]
    fn queued_clusters_are_kept() {
        let fixture = Fixture::new();
        let (cluster_file, job_dir) = fixture.submission(2);
        fixture.queue_jobs(2, 3);

        let outcome = fixture.cleaner().clean_cluster_file(&cluster_file, later()).unwrap();

        assert_eq!(outcome, Outcome::StillQueued(3));
        assert!(job_dir.exists());
    }

    #[test]
    fn finished_clusters_are_removed() {
        let fixture = Fixture::new();
        let (cluster_file, job_dir) = fixture.submission(3);

        let outcome = fixture.cleaner().clean_cluster_file(&cluster_file, later()).unwrap();

        assert_eq!(outcome, Outcome::Removed);
        assert!(!cluster_file.exists());
        assert!(!job_dir.exists());
    }

    #[test]
    fn dry_run_removes_nothing() {
        let fixture = Fixture::new();
        let (cluster_file, job_dir) = fixture.submission(4);

        let outcome = fixture
            .cleaner()
            .dry_run(true)
            .clean_cluster_file(&cluster_file, later())
            .unwrap();

        assert_eq!(outcome, Outcome::WouldRemove);
        assert!(cluster_file.exists());
        assert!(job_dir.exists());
    }

    #[test]
    fn missing_job_dir_still_drops_cluster_file() {
        let fixture = Fixture::new();
        let (cluster_file, job_dir) = fixture.submission(5);
        fs::remove_dir_all(&job_dir).unwrap();

        let outcome = fixture.cleaner().clean_cluster_file(&cluster_file, later()).unwrap();

        assert_eq!(outcome, Outcome::Removed);
        assert!(!cluster_file.exists());
    }

    #[test]
    fn refuses_directories_outside_submit_dir() {
        let fixture = Fixture::new();
        let outside = fixture.root.path().join("precious");
        fs::create_dir(&outside).unwrap();
        let record = ClusterRecord {
            cluster_id: 6,
            scheduler: None,
            job_dir: outside.clone(),
            submitted_at: 0,
        };
        let cluster_file = cluster::write(&fixture.submit_dir(), &record).unwrap();

        let result = fixture.cleaner().clean_cluster_file(&cluster_file, later());

        assert!(matches!(result, Err(CleanerError::OutsideSubmitDir(_))));
        assert!(outside.exists());
        assert!(cluster_file.exists());
    }

    #[test]
    fn refuses_parent_dir_detours() {
        let fixture = Fixture::new();
        let outside = fixture.root.path().join("precious");
        fs::create_dir(&outside).unwrap();
        fs::write(outside.join("data"), "keep me").unwrap();
        let record = ClusterRecord {
            cluster_id: 8,
            scheduler: None,
            job_dir: fixture.submit_dir().join("..").join("precious"),
            submitted_at: 0,
        };
        let cluster_file = cluster::write(&fixture.submit_dir(), &record).unwrap();

        let result = fixture.cleaner().clean_cluster_file(&cluster_file, later());

        assert!(matches!(result, Err(CleanerError::OutsideSubmitDir(_))));
        assert!(outside.join("data").exists());
        assert!(cluster_file.exists());
    }

    #[test]
    fn refuses_the_submit_dir_itself() {
        let fixture = Fixture::new();
        let (other_file, other_job) = fixture.submission(9);
        fixture.queue_jobs(9, 1);
        let record = ClusterRecord {
            cluster_id: 13,
            scheduler: None,
            job_dir: fixture.submit_dir(),
            submitted_at: 0,
        };
        let cluster_file = cluster::write(&fixture.submit_dir(), &record).unwrap();

        let result = fixture.cleaner().clean_cluster_file(&cluster_file, later());

        assert!(matches!(result, Err(CleanerError::OutsideSubmitDir(_))));
        assert!(fixture.submit_dir().exists());
        assert!(other_job.exists());
        assert!(other_file.exists());
        assert!(cluster_file.exists());
    }

    #[test]
    fn job_dir_must_be_a_direct_child() {
        let submit_dir = Path::new("/spool");

        assert!(is_job_dir_of(submit_dir, Path::new("/spool/submit-abc")));
        assert!(!is_job_dir_of(submit_dir, Path::new("/spool")));
        assert!(!is_job_dir_of(submit_dir, Path::new("/spool/")));
        assert!(!is_job_dir_of(submit_dir, Path::new("/spool/.")));
        assert!(!is_job_dir_of(submit_dir, Path::new("/spool/../etc")));
        assert!(!is_job_dir_of(submit_dir, Path::new("/spool/a/../b")));
        assert!(!is_job_dir_of(submit_dir, Path::new("/spool/a/b")));
        assert!(!is_job_dir_of(submit_dir, Path::new("/elsewhere/submit-abc")));
        assert!(!is_job_dir_of(submit_dir, Path::new("submit-abc")));
    }

    #[test]
    fn condor_q_errors_keep_everything() {
        let mut fixture = Fixture::new();
        let broken = fixture.root.path().join("broken_condor_q");
        fs::write(&broken, "#!/bin/sh\necho 'Error: no schedd' >&2\n").unwrap();
        fs::set_permissions(&broken, fs::Permissions::from_mode(0o755)).unwrap();
        fixture.config.commands.condor_q = broken;
        let (cluster_file, job_dir) = fixture.submission(7);

        let result = fixture.cleaner().clean_cluster_file(&cluster_file, later());

        assert!(matches!(result, Err(CleanerError::Queue(QueueError::Stderr(_)))));
        assert!(job_dir.exists());
        assert!(cluster_file.exists());
    }

    #[test]
    fn sweep_survives_bad_files() {
        let fixture = Fixture::new();
        fixture.submission(10);
        fixture.submission(11);
        fixture.queue_jobs(11, 1);
        fs::write(fixture.submit_dir().join("junk.99.cluster"), "not: [valid").unwrap();

        let report = fixture.cleaner().sweep(&fixture.submit_dir(), later());

        assert_eq!(
            report,
            SweepReport {
                examined: 3,
                still_queued: 1,
                removed: 1,
                errors: 1,
                ..SweepReport::default()
            }
        );
    }

    #[test]
    fn sweep_of_missing_directory() {
        let fixture = Fixture::new();

        let report = fixture
            .cleaner()
            .sweep(&fixture.root.path().join("gone"), later());

        assert_eq!(report.errors, 1);
        assert_eq!(report.examined, 0);
    }

    #[test]
    fn thread_keeps_running_without_submit_dir() {
        let mut config = AgentConfig::default();
        config.commands.condor_config_val = PathBuf::from("/nonexistent/condor_config_val");

        let handle = SubmitCleaner::new(config)
            .interval(Duration::from_millis(10))
            .spawn()
            .unwrap();

        thread::sleep(Duration::from_millis(100));
        assert!(!handle.is_finished());

        handle.stop();
        handle.join().unwrap();
    }

    #[test]
    fn thread_cleans_and_stops() {
        let fixture = Fixture::new();
        let (cluster_file, job_dir) = fixture.submission(12);

        let handle = SubmitCleaner::new(fixture.config.clone())
            .interval(Duration::from_millis(10))
            .min_age(Duration::ZERO)
            .spawn()
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while cluster_file.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        handle.stop();
        handle.join().unwrap();

        assert!(!cluster_file.exists());
        assert!(!job_dir.exists());
    }

    #[test]
    fn stop_interrupts_long_sleep() {
        let mut config = AgentConfig::default();
        config.commands.condor_config_val = PathBuf::from("/nonexistent/condor_config_val");

        let handle = SubmitCleaner::new(config)
            .interval(Duration::from_secs(3600))
            .spawn()
            .unwrap();

        let start = Instant::now();
        handle.stop();
        handle.join().unwrap();

        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
