use std::{
    ffi::OsString,
    fs,
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{error, warn};

pub const PROGRESS_FILE: &str = "progress.txt";
pub const RATE_FILE: &str = "rate.txt";
pub const SCALAR_PREFIX: &str = "r_all";
pub const WEIGHT_PREFIX: &str = "weights";
pub const HEARTBEAT_PREFIX: &str = "heartbeat";
pub const MERGED_SCALARS: &str = "correlations.txt";
pub const MERGED_WEIGHTS: &str = "weights.txt";
pub const VOLUME_FILE: &str = "rdata_3D.yaml";

// distinguishes temporary files of threads sharing one process
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Layout of the shared run directory
#[derive(Debug, Clone)]
pub struct RunDir {
    root: PathBuf,
}

impl RunDir {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn create(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)
    }

    pub fn progress(&self) -> PathBuf {
        self.root.join(PROGRESS_FILE)
    }

    pub fn rate(&self) -> PathBuf {
        self.root.join(RATE_FILE)
    }

    pub fn scalars(&self, core: usize) -> PathBuf {
        self.root.join(format!("{SCALAR_PREFIX}{core}.txt"))
    }

    pub fn weights(&self, core: usize) -> PathBuf {
        self.root.join(format!("{WEIGHT_PREFIX}{core}.txt"))
    }

    pub fn heartbeat(&self, core: usize) -> PathBuf {
        self.root.join(format!("{HEARTBEAT_PREFIX}{core}.txt"))
    }

    pub fn merged_scalars(&self) -> PathBuf {
        self.root.join(MERGED_SCALARS)
    }

    pub fn merged_weights(&self) -> PathBuf {
        self.root.join(MERGED_WEIGHTS)
    }

    pub fn volume(&self) -> PathBuf {
        self.root.join(VOLUME_FILE)
    }
}

/// Read a shared record, a missing file is reported as `None`
pub fn read_record(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error),
    }
}

/// Replace `path` with `contents` through a rename, readers see either the old
/// or the new record but never a partial one
pub fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let tmp_path = tmp_path_for(path);

    let result = fs::File::create(&tmp_path)
        .and_then(|mut file| {
            file.write_all(contents.as_bytes())?;
            file.sync_data()
        })
        .and_then(|()| fs::rename(&tmp_path, path));

    if let Err(ref error) = result {
        error!(path = ?path, error = ?error, "Failed to replace shared record");

        if let Err(cleanup_error) = fs::remove_file(&tmp_path) {
            if cleanup_error.kind() != ErrorKind::NotFound {
                warn!(path = ?tmp_path, error = ?cleanup_error, "Failed to remove temporary file");
            }
        }
    }

    result
}

/// Hidden sibling of `path` that is unique per process and call
pub fn tmp_path_for(path: &Path) -> PathBuf {
    let mut file_name = OsString::from(".");
    file_name.push(path.file_name().unwrap_or_default());
    file_name.push(format!(
        ".{}.{}.tmp",
        process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let mut tmp_path = path.to_path_buf();
    tmp_path.set_file_name(file_name);

    tmp_path
}

/// Seconds since the unix epoch
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or_default()
}

/// Name of the node this worker runs on
pub fn hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(hostname) => hostname.to_string_lossy().into_owned(),
        Err(error) => {
            warn!(error = ?error, "Failed to retrieve hostname: {error}");

            String::from("unknown")
        }
    }
}
