use crate::job::KernelSize;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, warn};

/// placeholders understood in `launcher.args`
pub const PLACEHOLDER_SLOTS: &str = "{slots}";
pub const PLACEHOLDER_MACHINEFILE: &str = "{machinefile}";
pub const PLACEHOLDER_WORKER: &str = "{worker}";
pub const PLACEHOLDER_KERNEL: &str = "{kernel}";
pub const PLACEHOLDER_INPUT: &str = "{input}";

pub const PLACEHOLDERS: [&str; 5] = [
    PLACEHOLDER_SLOTS,
    PLACEHOLDER_MACHINEFILE,
    PLACEHOLDER_WORKER,
    PLACEHOLDER_KERNEL,
    PLACEHOLDER_INPUT,
];

/// `mpirun -n <slots> -f <machinefile> <worker> <kernel> <input>`
pub const MPIRUN_TEMPLATE: [&str; 7] = [
    "-n",
    PLACEHOLDER_SLOTS,
    "-f",
    PLACEHOLDER_MACHINEFILE,
    PLACEHOLDER_WORKER,
    PLACEHOLDER_KERNEL,
    PLACEHOLDER_INPUT,
];

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Config could not be parsed: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // how the distributed launcher is invoked
    #[serde(default)]
    pub launcher: LauncherConfig,
    // worker executable as seen from the compute nodes
    #[serde(default = "default_worker")]
    pub worker: PathBuf,
    #[serde(default)]
    pub machinefile: MachineFileConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub kernel_size: KernelSize,
    // the worker writes its results here, relative to the working directory
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    // printed by the worker once per finished image
    #[serde(default = "default_marker")]
    pub marker: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct LauncherConfig {
    #[serde(default = "default_launcher")]
    pub exec: PathBuf,
    #[serde(default = "default_launcher_args")]
    pub args: Vec<String>,
    // time between SIGTERM and SIGKILL when a run is cancelled
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct MachineFileConfig {
    #[serde(default = "default_machinefile_path")]
    pub path: PathBuf,
    // load `path` leniently when the orchestrator starts up
    #[serde(default = "default_true")]
    pub autoload: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_path")]
    pub path: PathBuf,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            launcher: LauncherConfig::default(),
            worker: default_worker(),
            machinefile: MachineFileConfig::default(),
            metrics: MetricsConfig::default(),
            kernel_size: KernelSize::default(),
            output_dir: default_output_dir(),
            marker: default_marker(),
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            exec: default_launcher(),
            args: default_launcher_args(),
            grace_ms: default_grace_ms(),
        }
    }
}

impl Default for MachineFileConfig {
    fn default() -> Self {
        Self {
            path: default_machinefile_path(),
            autoload: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            path: default_metrics_path(),
            interval_ms: default_interval_ms(),
        }
    }
}

impl LauncherConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

impl MetricsConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl RunnerConfig {
    /// load the config from a YAML file, without a path the defaults are used
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigErrors> {
        match path {
            Some(path) => {
                if !path.is_file() {
                    return Err(ConfigErrors::FileNotFound(path.to_path_buf()));
                }

                debug!(path = ?path, "Loading config");

                Self::parse(&fs::read_to_string(path)?)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn parse(content: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Validate the config, returns true if any error was found
    pub fn preflight_checks(&self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        for required in [
            PLACEHOLDER_MACHINEFILE,
            PLACEHOLDER_WORKER,
            PLACEHOLDER_KERNEL,
            PLACEHOLDER_INPUT,
        ] {
            if !self.launcher.args.iter().any(|arg| arg.contains(required)) {
                error!("launcher.args must reference {required}");
                contains_error = true;
            }
        }

        let unknown = self
            .launcher
            .args
            .iter()
            .flat_map(|arg| placeholders_in(arg))
            .filter(|placeholder| !PLACEHOLDERS.contains(placeholder))
            .unique()
            .collect_vec();

        if !unknown.is_empty() {
            error!(
                "launcher.args uses unknown placeholders {}, supported are {}",
                unknown.join(", "),
                PLACEHOLDERS.join(", ")
            );
            contains_error = true;
        }

        if self.marker.trim().is_empty() {
            error!("marker must not be empty, progress could never be tracked");
            contains_error = true;
        }

        if self.metrics.interval_ms == 0 {
            error!("metrics.interval_ms cannot be 0");
            contains_error = true;
        }

        // the worker only has to exist on the compute nodes, locally this is a hint
        if self.worker.is_file() {
            match check_executable(&self.worker) {
                Ok(true) => {}
                Ok(false) => warn!(
                    "Worker {} is not executable, this might cause problems",
                    self.worker.to_string_lossy()
                ),
                Err(e) => warn!(
                    "Failed to determine if worker ({}) is an executable: {e}",
                    self.worker.to_string_lossy()
                ),
            }
        } else {
            debug!(worker = ?self.worker, "Worker not found locally, assuming it exists on the nodes");
        }

        contains_error
    }
}

/// all `{...}` tokens within a template argument
fn placeholders_in(arg: &str) -> Vec<&str> {
    let mut found = Vec::new();
    let mut rest = arg;

    while let Some(start) = rest.find('{') {
        match rest[start..].find('}') {
            Some(end) => {
                found.push(&rest[start..start + end + 1]);
                rest = &rest[start + end + 1..];
            }
            None => break,
        }
    }

    found
}

fn default_launcher() -> PathBuf {
    PathBuf::from("mpirun")
}

fn default_launcher_args() -> Vec<String> {
    MPIRUN_TEMPLATE.iter().map(|arg| arg.to_string()).collect()
}

fn default_grace_ms() -> u64 {
    5000
}

fn default_worker() -> PathBuf {
    PathBuf::from("./programa")
}

fn default_machinefile_path() -> PathBuf {
    PathBuf::from("machinefile")
}

fn default_metrics_path() -> PathBuf {
    PathBuf::from("estadisticas.txt")
}

fn default_interval_ms() -> u64 {
    5000
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("salidas")
}

fn default_marker() -> String {
    String::from("Terminó imagen")
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn empty_document_uses_defaults() {
        let config = RunnerConfig::parse("{}").unwrap();

        assert_eq!(config.launcher.exec, PathBuf::from("mpirun"));
        assert_eq!(config.launcher.args, MPIRUN_TEMPLATE);
        assert_eq!(config.kernel_size.get(), 55);
        assert_eq!(config.metrics.interval(), Duration::from_secs(5));
        assert_eq!(config.marker, "Terminó imagen");
        assert!(config.machinefile.autoload);
        assert!(!config.preflight_checks());
    }

    #[test]
    fn partial_config() {
        let config = RunnerConfig::parse(
            "
launcher:
  exec: /opt/mpich/bin/mpiexec
kernel_size: 9
metrics:
  path: /tmp/stats.txt
",
        )
        .unwrap();

        assert_eq!(config.launcher.exec, PathBuf::from("/opt/mpich/bin/mpiexec"));
        assert_eq!(config.launcher.args.len(), 7);
        assert_eq!(config.kernel_size.get(), 9);
        assert_eq!(config.metrics.path, PathBuf::from("/tmp/stats.txt"));
        assert_eq!(config.metrics.interval_ms, 5000);
    }

    #[test]
    fn unknown_fields_and_bad_kernel_are_rejected() {
        assert_matches!(RunnerConfig::parse("launcher_path: x"), Err(ConfigErrors::Parse(_)));
        assert_matches!(RunnerConfig::parse("kernel_size: 0"), Err(ConfigErrors::Parse(_)));
    }

    #[test]
    fn preflight_catches_template_problems() {
        let mut config = RunnerConfig::default();
        config.launcher.args = vec!["-np".into(), "{slots}".into(), "{nodes}".into()];

        assert!(config.preflight_checks());

        let mut config = RunnerConfig::default();
        config.marker = "  ".into();
        assert!(config.preflight_checks());

        let mut config = RunnerConfig::default();
        config.launcher.args = vec![
            "--hostfile={machinefile}".into(),
            "{worker}".into(),
            "{kernel}".into(),
            "{input}".into(),
        ];
        assert!(!config.preflight_checks());
    }

    #[test]
    fn placeholder_scan() {
        assert_eq!(placeholders_in("--hostfile={machinefile}"), vec!["{machinefile}"]);
        assert_eq!(placeholders_in("{a}{b}"), vec!["{a}", "{b}"]);
        assert!(placeholders_in("{unterminated").is_empty());
    }

    #[test]
    fn missing_config_file() {
        assert_matches!(
            RunnerConfig::load(Some(Path::new("/definitely/not/here.yaml"))),
            Err(ConfigErrors::FileNotFound(_))
        );
        assert!(RunnerConfig::load(None).is_ok());
    }
}
