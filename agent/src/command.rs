use itertools::Itertools;
use std::{
    io::{self, Read},
    path::PathBuf,
    process::{Command, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, trace, warn};
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to spawn {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        source: io::Error,
    },
    #[error("{program:?} did not finish within {timeout:?}")]
    Timeout { program: PathBuf, timeout: Duration },
    #[error("Failed to wait for a child process: {0}")]
    Io(#[from] io::Error),
}

/// A single invocation of an external program
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
/// container for everything a finished child left behind
pub struct RunOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub runtime: Duration,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// shell-like rendering, only meant for log lines
    pub fn display(&self) -> String {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .join(" ")
    }
}

/// Run the command to completion or until its timeout expires
#[tracing::instrument(level = "debug", skip(spec), fields(command = %spec.display()))]
pub fn run(spec: &CommandSpec) -> Result<RunOutput, CommandError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(ref cwd) = spec.cwd {
        command.current_dir(cwd);
    }

    let start = Instant::now();
    let mut child = command.spawn().map_err(|source| CommandError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    // both pipes are drained concurrently, a child filling one of them would otherwise block forever
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = match child.wait_timeout(spec.timeout)? {
        Some(status) => status,
        None => {
            // child hasn't exited yet
            if let Err(error) = child.kill() {
                warn!(error = ?error, "Failed to kill timed out child");
            }
            child.wait()?;

            // the reader threads are left to finish on their own, grandchildren may still hold the pipes
            return Err(CommandError::Timeout {
                program: spec.program.clone(),
                timeout: spec.timeout,
            });
        }
    };

    let output = RunOutput {
        status: status.code(),
        stdout: collect(stdout)?,
        stderr: collect(stderr)?,
        runtime: start.elapsed(),
    };

    debug!(
        "Finished in {} ms | status: {:?}",
        output.runtime.as_millis(),
        output.status
    );
    trace!(stdout = output.stdout, stderr = output.stderr);

    Ok(output)
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<io::Result<String>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();

        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buffer)?;
        }

        Ok(String::from_utf8_lossy(&buffer).into_owned())
    })
}

fn collect(handle: JoinHandle<io::Result<String>>) -> Result<String, CommandError> {
    match handle.join() {
        Ok(result) => Ok(result?),
        Err(_) => Err(io::Error::other("pipe reader panicked").into()),
    }
}
