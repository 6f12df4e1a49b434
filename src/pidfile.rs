//! PID file handling.
//!
//! The running server writes `<pid>\n` at startup and removes the file on
//! clean exit. A sibling invocation (`navigator -s reload`) reads the file
//! and signals the running process.

use std::path::Path;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    #[error("cannot read pid file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("pid file {path} does not contain a pid")]
    Malformed { path: String },
    #[error("signal to pid {pid} failed: {source}")]
    Signal { pid: i32, source: std::io::Error },
    #[error("signals are not supported on this platform")]
    Unsupported,
}

/// Write the current process id. Errors are fatal at startup — a server that
/// cannot record its pid cannot be administered.
pub fn write(path: &Path) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
}

/// Remove the pid file; a missing file is fine on the shutdown path.
pub fn remove(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), err = %e, "could not remove pid file");
        }
    }
}

/// Read the pid recorded in `path`.
pub fn read(path: &Path) -> Result<i32, PidFileError> {
    let text = std::fs::read_to_string(path).map_err(|source| PidFileError::Read {
        path: path.display().to_string(),
        source,
    })?;
    text.trim()
        .parse::<i32>()
        .map_err(|_| PidFileError::Malformed {
            path: path.display().to_string(),
        })
}

/// Send SIGHUP to the process recorded in `path` (the admin reload channel).
#[cfg(unix)]
pub fn signal_reload(path: &Path) -> Result<(), PidFileError> {
    let pid = read(path)?;
    let rc = unsafe { libc::kill(pid, libc::SIGHUP) };
    if rc == 0 {
        Ok(())
    } else {
        Err(PidFileError::Signal {
            pid,
            source: std::io::Error::last_os_error(),
        })
    }
}

#[cfg(not(unix))]
pub fn signal_reload(_path: &Path) -> Result<(), PidFileError> {
    Err(PidFileError::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("navigator.pid");

        write(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.ends_with('\n'));
        assert_eq!(read(&path).unwrap() as u32, std::process::id());

        remove(&path);
        assert!(!path.exists());
        // Second removal is silent.
        remove(&path);
    }

    #[test]
    fn malformed_pid_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("navigator.pid");
        std::fs::write(&path, "not-a-pid\n").unwrap();
        assert!(matches!(read(&path), Err(PidFileError::Malformed { .. })));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            read(&dir.path().join("gone.pid")),
            Err(PidFileError::Read { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn signal_to_own_pid_zero_is_refused_gracefully() {
        // Signalling a clearly-invalid pid must surface an error, not panic.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("navigator.pid");
        std::fs::write(&path, "-999999\n").unwrap();
        assert!(signal_reload(&path).is_err());
    }
}
