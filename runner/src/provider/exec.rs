use super::{ProviderError, ScoreRequest, Scorer, UnitResult};
use crate::config::ScorerConfig;
use std::{
    ffi::OsString,
    io::{self, Read, Write},
    path::PathBuf,
    process::{Command, Stdio},
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, trace};
use wait_timeout::ChildExt;

/// Scores units by running an external model once per unit.
///
/// The request goes to the child's stdin as YAML, the child answers on stdout
/// with `score: <f64>` and `weights: [<f64>, ...]`.
#[derive(Debug, Clone)]
pub struct ExecScorer {
    pub exec: PathBuf,
    pub params: Vec<OsString>,
    pub timeout: Duration,
}

impl ExecScorer {
    pub fn load(config: &ScorerConfig) -> Self {
        Self {
            exec: config.exec.clone(),
            params: config.params.iter().map(OsString::from).collect(),
            timeout: Duration::from_millis(config.timeout),
        }
    }
}

/// Reads a child pipe to the end on its own thread so the child never blocks on a full pipe.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<io::Result<String>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buffer = String::new();
            pipe.read_to_string(&mut buffer).map(|_| buffer)
        })
    })
}

fn collect(reader: Option<JoinHandle<io::Result<String>>>, name: &str) -> io::Result<String> {
    match reader.map(JoinHandle::join) {
        Some(Ok(result)) => result,
        Some(Err(_)) => {
            error!("Scorer {name} reader panicked");

            Ok(String::new())
        }
        None => Ok(String::new()),
    }
}

impl Scorer for ExecScorer {
    #[tracing::instrument(level = "debug", skip_all, fields(unit = request.unit))]
    fn score_and_weights(&self, request: &ScoreRequest) -> Result<UnitResult, ProviderError> {
        let payload = serde_yaml::to_string(request)?;

        let mut handle = Command::new(&self.exec)
            .args(&self.params)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(ProviderError::SpawnScorer)?;

        // a large weight vector or a chatty model would otherwise fill a pipe
        // and stall the child until the timeout hits
        let stdout = drain(handle.stdout.take());
        let stderr = drain(handle.stderr.take());

        if let Some(mut stdin) = handle.stdin.take() {
            match stdin.write_all(payload.as_bytes()) {
                Ok(()) => {}
                // the scorer does not read its request, its answer still counts
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    debug!("Scorer closed stdin early");
                }
                Err(e) => {
                    error!("Failed to send request to scorer: {e}");
                    handle.kill()?;
                    handle.wait()?;

                    return Err(e.into());
                }
            }
            // Dropping stdin here will close the underlying file descriptor
            // this gives scorers a clear end of input
        }

        debug!("Scorer waiting on {}", handle.id());
        let status = match handle.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                debug!("Scorer ran into timeout, killing it");
                handle.kill()?;
                handle.wait()?;

                return Err(ProviderError::ScorerTimeout);
            }
        };

        let output = collect(stdout, "stdout")?;
        let stderr = collect(stderr, "stderr")?;

        if !status.success() {
            return Err(ProviderError::ScorerFailed {
                status: status.code(),
                stderr,
            });
        }

        if !stderr.is_empty() {
            debug!(bytes = stderr.len(), "Scorer wrote to stderr");
            trace!("Scorer stderr: {stderr}");
        }
        trace!("Output from scorer: {output}");

        match serde_yaml::from_str::<UnitResult>(&output) {
            Ok(result) => Ok(result),
            Err(e) => {
                error!("Scorer returned unreadable output: {e}");

                Err(e.into())
            }
        }
    }
}
