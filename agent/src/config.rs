use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::Error,
    net::SocketAddr,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::error;

pub const DEFAULT_CONFIG_PATH: &str = "condor-agent.yaml";

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::Io(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Failed to read file or metadata: {0}")]
    Io(#[from] Error),
    #[error("Config could not be parsed: {0}")]
    ParseFailed(#[from] serde_yaml::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    // falls back to CONDOR_AGENT_SUBMIT_DIR and then to the condor config, see condor::resolve_submit_dir
    #[serde(default)]
    pub submit_dir: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub cleaner: CleanerConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct CommandsConfig {
    #[serde(default = "default_condor_submit")]
    pub condor_submit: PathBuf,
    #[serde(default = "default_condor_q")]
    pub condor_q: PathBuf,
    #[serde(default = "default_condor_config_val")]
    pub condor_config_val: PathBuf,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct CleanerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    // cluster files younger than this are never considered, condor_q may not list fresh jobs yet
    #[serde(default = "default_min_age_secs")]
    pub min_age_secs: u64,
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            submit_dir: None,
            log_level: default_log_level(),
            commands: CommandsConfig::default(),
            cleaner: CleanerConfig::default(),
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            condor_submit: default_condor_submit(),
            condor_q: default_condor_q(),
            condor_config_val: default_condor_config_val(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            min_age_secs: default_min_age_secs(),
            dry_run: false,
        }
    }
}

impl CommandsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl CleanerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn min_age(&self) -> Duration {
        Duration::from_secs(self.min_age_secs)
    }
}

impl AgentConfig {
    /// Load the config from a yaml file, a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let file = File::open(path)?;

        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn preflight_checks(&mut self) -> bool {
        // collect all errors instead of stopping at the first one, makes fixing a config less tedious
        let mut contains_error = false;

        self.log_level = self.log_level.to_lowercase();

        if self.cleaner.interval_secs == 0 {
            error!("cleaner.interval_secs cannot be 0, the cleaner would spin without sleeping");
            contains_error = true;
        }

        if self.commands.timeout_ms == 0 {
            error!("commands.timeout_ms cannot be 0, every condor command would time out");
            contains_error = true;
        }

        if let Some(ref dir) = self.submit_dir {
            if !dir.is_dir() {
                error!(
                    "submit_dir {} is not a directory or does not exist",
                    dir.to_string_lossy()
                );
                contains_error = true;
            }
        }

        for (name, exec) in [
            ("condor_submit", &self.commands.condor_submit),
            ("condor_q", &self.commands.condor_q),
            ("condor_config_val", &self.commands.condor_config_val),
        ] {
            // bare names are resolved through PATH at spawn time
            if exec.components().count() < 2 {
                continue;
            }

            match check_executable(exec) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "commands.{name} target {} is not executable",
                        exec.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if commands.{name} ({}) is an executable: {e}",
                        exec.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        contains_error
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8008))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_condor_submit() -> PathBuf {
    PathBuf::from("condor_submit")
}

fn default_condor_q() -> PathBuf {
    PathBuf::from("condor_q")
}

fn default_condor_config_val() -> PathBuf {
    PathBuf::from("condor_config_val")
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    600
}

fn default_min_age_secs() -> u64 {
    300
}
