use serde::{Deserialize, Serialize};
use std::{
    io::Read,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};
use tracing::{debug, error, info, warn};
use wait_timeout::ChildExt;

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum NotifyConfig {
    #[default]
    Null,
    Exec {
        exec: PathBuf,
        #[serde(default)]
        params: Vec<String>,
        // milliseconds
        #[serde(default = "default_notify_timeout")]
        timeout: u64,
    },
}

fn default_notify_timeout() -> u64 {
    30_000
}

/// What is reported once a job has been reassembled
#[derive(Debug, Clone)]
pub struct Completion<'a> {
    pub run_dir: &'a Path,
    pub workers: usize,
    pub units: usize,
}

/// Side effect run after a successful reassembly, e.g. submitting an
/// email-alert job. Failures are logged, never propagated.
#[derive(Debug, Clone)]
pub enum Notifier {
    Null,
    Exec {
        exec: PathBuf,
        params: Vec<String>,
        timeout: Duration,
    },
}

impl Notifier {
    pub fn load(config: &NotifyConfig) -> Self {
        match config {
            NotifyConfig::Null => Self::Null,
            NotifyConfig::Exec {
                exec,
                params,
                timeout,
            } => Self::Exec {
                exec: exec.clone(),
                params: params.clone(),
                timeout: Duration::from_millis(*timeout),
            },
        }
    }

    /// returns whether the notification went through
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn notify(&self, completion: &Completion) -> bool {
        match self {
            Self::Null => {
                debug!("No notifier configured");

                true
            }
            Self::Exec {
                exec,
                params,
                timeout,
            } => {
                let mut handle = match Command::new(exec)
                    .args(params)
                    .env("SEARCHLIGHT_RUN_DIR", completion.run_dir)
                    .env("SEARCHLIGHT_WORKERS", completion.workers.to_string())
                    .env("SEARCHLIGHT_UNITS", completion.units.to_string())
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped())
                    .spawn()
                {
                    Ok(handle) => handle,
                    Err(error) => {
                        error!(exec = ?exec, error = ?error, "Failed to spawn notifier");

                        return false;
                    }
                };

                match handle.wait_timeout(*timeout) {
                    Ok(Some(status)) if status.success() => {
                        info!(exec = ?exec, "Sent completion notification");

                        true
                    }
                    Ok(Some(status)) => {
                        let mut stderr = String::new();
                        if let Some(mut pipe) = handle.stderr.take() {
                            if let Err(error) = pipe.read_to_string(&mut stderr) {
                                debug!(error = ?error, "Failed to read notifier stderr");
                            }
                        }
                        warn!(exec = ?exec, status = ?status, stderr = %stderr, "Notifier failed");

                        false
                    }
                    Ok(None) => {
                        warn!(exec = ?exec, "Notifier ran into timeout, killing it");
                        if let Err(error) = handle.kill().and_then(|()| handle.wait().map(drop)) {
                            error!(error = ?error, "Failed to kill notifier");
                        }

                        false
                    }
                    Err(error) => {
                        error!(exec = ?exec, error = ?error, "Failed to wait for notifier");

                        false
                    }
                }
            }
        }
    }
}
