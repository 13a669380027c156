//! Agent session execution.
//!
//! The [`SessionRunner`] trait decouples the control loop from the actual
//! agent backend (currently the `claude` CLI). Tests use scripted runners
//! that return predetermined outputs without spawning processes.
//!
//! A session never raises past its boundary: every failure mode is
//! normalized into either normal output text or a string starting with
//! [`SESSION_ERROR_PREFIX`], so callers test for failure with a prefix check.

use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::io::config::SessionConfig;
use crate::io::process::run_command_with_timeout;

/// Marker prefix for normalized session failures.
pub const SESSION_ERROR_PREFIX: &str = "SESSION_ERROR:";

/// Keywords in stderr that flag a transient, network-flavored failure.
const NETWORK_KEYWORDS: [&str; 4] = ["network", "connection", "timeout", "econnrefused"];
/// Maximum attempts for a network-flavored failure (including the first).
const NETWORK_MAX_RETRIES: u32 = 3;
/// Wait between network retries.
const NETWORK_RETRY_WAIT: Duration = Duration::from_secs(30);

/// True if `output` is a normalized session failure.
pub fn is_session_error(output: &str) -> bool {
    output.starts_with(SESSION_ERROR_PREFIX)
}

/// Abstraction over agent session backends.
pub trait SessionRunner {
    /// Run one blocking agent session with the rendered prompt, working
    /// directory pinned to `workdir`. Returns raw output text or a
    /// sentinel-prefixed error string; never an `Err`.
    fn run(&self, prompt: &str, workdir: &Path) -> String;
}

/// Session backend that spawns the configured agent CLI.
pub struct CliSession {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    retry_wait: Duration,
}

impl CliSession {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
            retry_wait: NETWORK_RETRY_WAIT,
        }
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn with_retry_wait(mut self, wait: Duration) -> Self {
        self.retry_wait = wait;
        self
    }

    fn build_command(&self, workdir: &Path) -> Command {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]).current_dir(workdir);
        cmd
    }
}

impl SessionRunner for CliSession {
    #[instrument(skip_all, fields(timeout_secs = self.timeout.as_secs()))]
    fn run(&self, prompt: &str, workdir: &Path) -> String {
        info!(workdir = %workdir.display(), "starting agent session");

        for attempt in 1..=NETWORK_MAX_RETRIES {
            let cmd = self.build_command(workdir);
            let output = match run_command_with_timeout(
                cmd,
                Some(prompt.as_bytes()),
                self.timeout,
                self.output_limit_bytes,
            ) {
                Ok(output) => output,
                Err(err) => {
                    if let Some(io_err) = err.downcast_ref::<std::io::Error>()
                        && io_err.kind() == std::io::ErrorKind::NotFound
                    {
                        return format!(
                            "{SESSION_ERROR_PREFIX} '{}' command not found. Ensure the agent CLI is installed and in PATH.",
                            self.command[0]
                        );
                    }
                    return format!("{SESSION_ERROR_PREFIX} {err:#}");
                }
            };

            if output.timed_out {
                warn!(timeout_secs = self.timeout.as_secs(), "session timed out");
                return format!(
                    "{SESSION_ERROR_PREFIX} Timed out after {}s",
                    self.timeout.as_secs()
                );
            }

            if !output.status.success() {
                let stderr = output.stderr_lossy();
                if is_network_error(&stderr) && attempt < NETWORK_MAX_RETRIES {
                    warn!(
                        attempt,
                        max = NETWORK_MAX_RETRIES,
                        "network error, retrying after wait"
                    );
                    thread::sleep(self.retry_wait);
                    continue;
                }
                warn!(exit_code = ?output.status.code(), "session failed");
                return format!(
                    "{SESSION_ERROR_PREFIX} Exit code {}\n{}\n{}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim(),
                    output.stdout_lossy()
                );
            }

            debug!("session completed");
            return output.stdout_lossy();
        }

        format!("{SESSION_ERROR_PREFIX} All network retries exhausted")
    }
}

/// True if stderr looks like a transient network failure.
fn is_network_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    NETWORK_KEYWORDS.iter().any(|kw| lower.contains(kw))
}
