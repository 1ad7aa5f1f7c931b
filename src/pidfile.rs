//! Identifier files: a text file whose whole content is one decimal PID.
//!
//! [`IdFile`] is the plain text channel used by readers and writers.
//! [`PidFile`] is the owning process's guard: it holds an advisory lock,
//! writes the current PID, and removes the file on drop.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

/// Access mode for [`IdFile::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ReadOnly,
    /// Create the file if missing, truncate it otherwise.
    WriteOnly,
}

/// Errors produced by identifier file operations.
#[derive(Debug)]
pub enum AdapterError {
    /// The file does not exist.
    NotFound { path: PathBuf },
    /// Another owner holds the file's lock.
    Locked { path: PathBuf },
    /// The file was opened in a mode that does not permit the operation.
    WrongMode { path: PathBuf, mode: Mode },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl AdapterError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            AdapterError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            AdapterError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterError::NotFound { path } => {
                write!(f, "identifier file {} does not exist", path.display())
            }
            AdapterError::Locked { path } => {
                write!(f, "identifier file {} is held by another process", path.display())
            }
            AdapterError::WrongMode { path, mode } => {
                write!(f, "identifier file {} is open {:?}", path.display(), mode)
            }
            AdapterError::Io { path, source } => {
                write!(f, "I/O error on identifier file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for AdapterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AdapterError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

enum Channel {
    Reader(BufReader<File>),
    Writer(File),
}

/// Scoped text channel over an identifier file. Closed on drop.
pub struct IdFile {
    path: PathBuf,
    channel: Channel,
}

impl IdFile {
    pub fn open(path: impl Into<PathBuf>, mode: Mode) -> Result<Self, AdapterError> {
        let path = path.into();
        let channel = match mode {
            Mode::ReadOnly => {
                let file = File::open(&path).map_err(|e| AdapterError::io(&path, e))?;
                Channel::Reader(BufReader::new(file))
            }
            Mode::WriteOnly => {
                let file = File::create(&path).map_err(|e| AdapterError::io(&path, e))?;
                Channel::Writer(file)
            }
        };
        Ok(Self { path, channel })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn put_string(&mut self, text: &str) -> Result<(), AdapterError> {
        match &mut self.channel {
            Channel::Writer(file) => file
                .write_all(text.as_bytes())
                .map_err(|e| AdapterError::io(&self.path, e)),
            Channel::Reader(_) => Err(AdapterError::WrongMode {
                path: self.path.clone(),
                mode: Mode::ReadOnly,
            }),
        }
    }

    /// Read the next line without its terminator. Returns an empty string at EOF.
    pub fn get_line(&mut self) -> Result<String, AdapterError> {
        match &mut self.channel {
            Channel::Reader(reader) => {
                let mut line = String::new();
                reader
                    .read_line(&mut line)
                    .map_err(|e| AdapterError::io(&self.path, e))?;
                let trimmed_len = line.trim_end_matches(['\n', '\r']).len();
                line.truncate(trimmed_len);
                Ok(line)
            }
            Channel::Writer(_) => Err(AdapterError::WrongMode {
                path: self.path.clone(),
                mode: Mode::WriteOnly,
            }),
        }
    }

    /// Read everything left in the file, terminators included.
    pub fn get_contents(&mut self) -> Result<String, AdapterError> {
        match &mut self.channel {
            Channel::Reader(reader) => {
                let mut contents = String::new();
                reader
                    .read_to_string(&mut contents)
                    .map_err(|e| AdapterError::io(&self.path, e))?;
                Ok(contents)
            }
            Channel::Writer(_) => Err(AdapterError::WrongMode {
                path: self.path.clone(),
                mode: Mode::WriteOnly,
            }),
        }
    }

    /// Flush pending writes and close the file, surfacing errors that a
    /// plain drop would swallow.
    pub fn close(self) -> Result<(), AdapterError> {
        if let Channel::Writer(file) = &self.channel {
            file.sync_all()
                .map_err(|e| AdapterError::io(&self.path, e))?;
        }
        Ok(())
    }

    pub fn remove(path: &Path) -> Result<(), AdapterError> {
        std::fs::remove_file(path).map_err(|e| AdapterError::io(path, e))
    }
}

/// Owner-side PID file. Holds an exclusive advisory lock for as long as it
/// lives so a second owner is refused; readers never take the lock.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: File,
}

impl PidFile {
    /// Lock `path` and write the current PID into it.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, AdapterError> {
        Self::create_for(path, std::process::id())
    }

    fn create_for(path: impl Into<PathBuf>, pid: u32) -> Result<Self, AdapterError> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| AdapterError::io(&path, e))?;

        file.try_lock_exclusive()
            .map_err(|e| lock_error(&path, e))?;

        // Truncate only after the lock is ours so a live owner's PID is never clobbered.
        file.set_len(0)
            .and_then(|_| file.write_all(pid.to_string().as_bytes()))
            .and_then(|_| file.sync_all())
            .map_err(|e| AdapterError::io(&path, e))?;

        tracing::info!(path = %path.display(), pid, "pid file written");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Only contention means another owner; anything else is a real I/O failure.
fn lock_error(path: &Path, source: std::io::Error) -> AdapterError {
    if source.kind() == fs2::lock_contended_error().kind() {
        AdapterError::Locked {
            path: path.to_path_buf(),
        }
    } else {
        AdapterError::io(path, source)
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = IdFile::remove(&self.path) {
            tracing::warn!(error = %e, "failed to remove pid file");
        }
        if let Err(e) = self.file.unlock() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to unlock pid file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_read_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        let mut writer = IdFile::open(&path, Mode::WriteOnly).unwrap();
        writer.put_string("4242").unwrap();
        writer.close().unwrap();

        let mut reader = IdFile::open(&path, Mode::ReadOnly).unwrap();
        assert_eq!(reader.get_line().unwrap(), "4242");
        assert_eq!(reader.get_line().unwrap(), "");
    }

    #[test]
    fn test_get_line_strips_terminator() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        std::fs::write(&path, "17\r\n").unwrap();

        let mut reader = IdFile::open(&path, Mode::ReadOnly).unwrap();
        assert_eq!(reader.get_line().unwrap(), "17");
    }

    #[test]
    fn test_get_contents_reads_to_eof() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        std::fs::write(&path, "1\ngarbage\n").unwrap();

        let mut reader = IdFile::open(&path, Mode::ReadOnly).unwrap();
        assert_eq!(reader.get_line().unwrap(), "1");
        assert_eq!(reader.get_contents().unwrap(), "garbage\n");
        assert_eq!(reader.get_contents().unwrap(), "");

        let mut writer = IdFile::open(&path, Mode::WriteOnly).unwrap();
        assert!(matches!(
            writer.get_contents(),
            Err(AdapterError::WrongMode { mode: Mode::WriteOnly, .. })
        ));
    }

    #[test]
    fn test_write_only_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        std::fs::write(&path, "123456789").unwrap();

        let mut writer = IdFile::open(&path, Mode::WriteOnly).unwrap();
        writer.put_string("5").unwrap();
        writer.close().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "5");
    }

    #[test]
    fn test_wrong_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        let mut writer = IdFile::open(&path, Mode::WriteOnly).unwrap();
        assert!(matches!(
            writer.get_line(),
            Err(AdapterError::WrongMode { mode: Mode::WriteOnly, .. })
        ));

        let mut reader = IdFile::open(&path, Mode::ReadOnly).unwrap();
        assert!(matches!(
            reader.put_string("1"),
            Err(AdapterError::WrongMode { mode: Mode::ReadOnly, .. })
        ));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.pid");

        let err = IdFile::open(&path, Mode::ReadOnly).err().unwrap();
        assert!(matches!(err, AdapterError::NotFound { .. }));
        assert!(err.to_string().contains("does not exist"));

        assert!(matches!(
            IdFile::remove(&path),
            Err(AdapterError::NotFound { .. })
        ));
    }

    #[test]
    fn test_write_into_missing_dir_is_io_error() {
        let err = IdFile::open("/nonexistent-dir/x/daemon.pid", Mode::WriteOnly)
            .err()
            .unwrap();
        // Missing parent directory also surfaces as NotFound.
        assert!(matches!(err, AdapterError::NotFound { .. }));
    }

    #[test]
    fn test_pid_file_lifecycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        let pid_file = PidFile::create(&path).unwrap();
        assert_eq!(pid_file.path(), path);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );

        drop(pid_file);
        assert!(!path.exists());
    }

    #[test]
    fn test_pid_file_overwrites_stale_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        std::fs::write(&path, "99999999\n").unwrap();

        let _pid_file = PidFile::create_for(&path, 12).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "12");
    }

    #[test]
    fn test_second_owner_is_locked_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        let _owner = PidFile::create_for(&path, 100).unwrap();
        let err = PidFile::create_for(&path, 200).unwrap_err();
        assert!(matches!(err, AdapterError::Locked { .. }));
        // The live owner's contents are untouched.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "100");
    }

    #[test]
    fn test_owner_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        drop(PidFile::create_for(&path, 100).unwrap());
        let next = PidFile::create_for(&path, 200).unwrap();
        assert_eq!(std::fs::read_to_string(next.path()).unwrap(), "200");
    }

    #[test]
    fn test_only_contention_maps_to_locked() {
        let path = Path::new("daemon.pid");
        assert!(matches!(
            lock_error(path, fs2::lock_contended_error()),
            AdapterError::Locked { .. }
        ));

        let err = lock_error(path, std::io::Error::from_raw_os_error(nix::libc::ENOLCK));
        match err {
            AdapterError::Io { source, .. } => {
                assert_eq!(source.raw_os_error(), Some(nix::libc::ENOLCK))
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
