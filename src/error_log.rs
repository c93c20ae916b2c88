//! Append-only error log file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

static GLOBAL: OnceLock<ErrorLog> = OnceLock::new();

/// Error log which creates its directory and file on the first write.
#[derive(Debug)]
pub struct ErrorLog {
    dir: PathBuf,
    file: Mutex<Option<File>>,
}

impl ErrorLog {
    /// Name of the log file inside the directory.
    pub const FILE_NAME: &'static str = "error.log";

    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            file: Mutex::new(None),
        }
    }

    /// Returns the process-wide log, if it was initialized.
    pub fn global() -> Option<&'static ErrorLog> {
        GLOBAL.get()
    }

    /// Initializes the process-wide log.
    ///
    /// Does nothing if the log was already initialized,
    /// the existing instance is returned in that case.
    pub fn init_global<P: Into<PathBuf>>(dir: P) -> &'static ErrorLog {
        GLOBAL.get_or_init(|| ErrorLog::new(dir))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Full path of the log file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(Self::FILE_NAME)
    }

    /// Appends a single line to the log.
    pub fn append(&self, message: &str) -> std::io::Result<()> {
        let mut guard = match self.file.lock() {
            Ok(guard) => guard,
            Err(e) => e.into_inner(),
        };

        let file = match &mut *guard {
            Some(file) => file,
            file @ None => {
                std::fs::create_dir_all(&self.dir)?;
                let created = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.path())?;
                tracing::debug!(path = %self.path().display(), "opened error log");
                file.insert(created)
            }
        };

        file.write_all(message.as_bytes())?;
        if !message.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        file.flush()
    }
}
