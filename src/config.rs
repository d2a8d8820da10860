use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_STDERR_POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Settings shared by every stay-open process started from them.
///
/// ```
/// use exiftool_stayopen::StayOpenConfig;
/// use std::time::Duration;
///
/// let config = StayOpenConfig::default()
///     .with_executable("/usr/local/bin/exiftool")
///     .with_default_args(&["-json", "-n"])
///     .with_shutdown_timeout(Duration::from_secs(1));
/// assert_eq!(config.default_args, vec!["-json", "-n"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StayOpenConfig {
    /// Program to launch. A bare name is looked up in `PATH`.
    pub executable: PathBuf,
    /// Arguments written ahead of every request, e.g. `-json`.
    pub default_args: Vec<String>,
    /// How long `stop()` waits for the process to exit before killing it.
    pub shutdown_timeout: Duration,
    /// How long to wait for stderr lines when a response comes back empty.
    pub stderr_poll_timeout: Duration,
}

impl Default for StayOpenConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("exiftool"),
            default_args: vec!["-json".to_string()],
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            stderr_poll_timeout: DEFAULT_STDERR_POLL_TIMEOUT,
        }
    }
}

impl StayOpenConfig {
    pub fn new(executable: impl AsRef<Path>, default_args: &[&str]) -> Self {
        Self::default()
            .with_executable(executable)
            .with_default_args(default_args)
    }

    pub fn with_executable(mut self, executable: impl AsRef<Path>) -> Self {
        self.executable = executable.as_ref().to_path_buf();
        self
    }

    pub fn with_default_args(mut self, default_args: &[&str]) -> Self {
        self.default_args = default_args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_stderr_poll_timeout(mut self, timeout: Duration) -> Self {
        self.stderr_poll_timeout = timeout;
        self
    }
}
