//! Lookups against the local HTCondor installation

use crate::{
    command::{self, CommandError, CommandSpec},
    config::{AgentConfig, CommandsConfig},
};
use once_cell::sync::Lazy;
use std::{env, ffi::OsString, path::PathBuf};
use tracing::{debug, error};

/// Environment variable (and condor config knob) naming the submit directory
pub const SUBMIT_DIR_VAR: &str = "CONDOR_AGENT_SUBMIT_DIR";

static LOCAL_SCHEDULER: Lazy<String> = Lazy::new(|| match nix::unistd::gethostname() {
    Ok(hostname) => hostname.to_string_lossy().into_owned(),
    Err(error) => {
        error!(error = ?error, "Failed to retrieve hostname, labelling the local scheduler 'localhost'");

        "localhost".to_string()
    }
});

/// Name used for the scheduler when a submission doesn't name one, i.e. the local schedd
pub fn local_scheduler_name() -> &'static str {
    LOCAL_SCHEDULER.as_str()
}

/// Query a single condor config value, `None` if condor doesn't know it
pub fn config_val(commands: &CommandsConfig, name: &str) -> Result<Option<String>, CommandError> {
    let output = command::run(
        &CommandSpec::new(&commands.condor_config_val, commands.timeout()).arg(name),
    )?;

    if !output.success() {
        debug!(
            name,
            status = ?output.status,
            "condor_config_val has no value"
        );

        return Ok(None);
    }

    Ok(non_empty(output.stdout.trim().replace('"', "")))
}

/// Find the submit directory, checking the agent config, the environment and then condor itself
pub fn resolve_submit_dir(config: &AgentConfig) -> Option<PathBuf> {
    resolve_submit_dir_with(config, env::var_os(SUBMIT_DIR_VAR))
}

pub fn resolve_submit_dir_with(config: &AgentConfig, from_env: Option<OsString>) -> Option<PathBuf> {
    if let Some(ref dir) = config.submit_dir {
        if !dir.as_os_str().is_empty() {
            return Some(dir.clone());
        }
    }

    if let Some(dir) = from_env.filter(|value| !value.is_empty()) {
        return Some(PathBuf::from(dir));
    }

    match config_val(&config.commands, SUBMIT_DIR_VAR) {
        Ok(value) => value.map(PathBuf::from),
        Err(error) => {
            debug!(error = ?error, "Unable to ask condor for {SUBMIT_DIR_VAR}");

            None
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
