use super::SyncError;
use nix::fcntl::{flock, FlockArg};
use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
};
use tracing::{error, trace};

/// Shared file held under an exclusive `flock(2)` until dropped.
///
/// Every opener gets its own file description, so the lock serializes
/// threads of one process as well as separate processes. The record is
/// rewritten in place, replacing the file would orphan the lock.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
    path: PathBuf,
}

impl LockedFile {
    /// open (creating if needed) and block until the exclusive lock is held
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(|errno| SyncError::Lock {
            path: path.to_path_buf(),
            errno,
        })?;
        trace!(path = ?path, "Acquired lock");

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn read_to_string(&mut self) -> Result<String, SyncError> {
        let mut contents = String::new();

        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_string(&mut contents)?;

        Ok(contents)
    }

    pub fn replace(&mut self, contents: &str) -> Result<(), SyncError> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(contents.as_bytes())?;
        self.file.sync_data()?;

        Ok(())
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        // closing the descriptor releases the lock as well, this only makes it explicit
        match flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            Ok(()) => trace!(path = ?self.path, "Released lock"),
            Err(errno) => error!(path = ?self.path, errno = ?errno, "Failed to release lock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LockedFile;
    use std::{sync::Arc, thread};

    #[test]
    fn locked_increments_do_not_race() {
        let dir = tempfile::tempdir().unwrap();
        let path = Arc::new(dir.path().join("counter.txt"));

        let handles = (0..8)
            .map(|_| {
                let path = Arc::clone(&path);

                thread::spawn(move || {
                    for _ in 0..25 {
                        let mut file = LockedFile::open(&path).unwrap();
                        let current = file.read_to_string().unwrap().parse::<u32>().unwrap_or(0);
                        file.replace(&(current + 1).to_string()).unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        let mut file = LockedFile::open(&path).unwrap();
        assert_eq!(file.read_to_string().unwrap(), "200");
    }
}
