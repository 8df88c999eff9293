//! Status event log.
//!
//! Every status event is printed to the console as a colored symbol plus
//! message and appended to the log file as one timestamped line.

use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

pub const GREEN: &str = "\x1b[32m";
pub const BLUE: &str = "\x1b[34m";
pub const YELLOW: &str = "\x1b[33m";
pub const RED: &str = "\x1b[31m";
pub const MAGENTA: &str = "\x1b[35m";
pub const CYAN: &str = "\x1b[36m";
pub const RESET: &str = "\x1b[0m";

/// Kind of status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Something is about to happen
    Info,
    /// Completed successfully
    Ok,
    /// Degraded but continuing
    Warning,
    /// Failed
    Failure,
    /// A service is being started or stopped
    Progress,
    /// A service definition was loaded
    Loaded,
    /// Runlevel or phase banner
    Stage,
    /// A service was stopped
    Stopped,
}

impl Status {
    pub fn symbol(&self) -> &'static str {
        match self {
            Status::Info => "*",
            Status::Ok => "+",
            Status::Warning | Status::Failure => "!",
            Status::Progress => "~",
            Status::Loaded => "L",
            Status::Stage => "=",
            Status::Stopped => "-",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            Status::Info | Status::Progress => BLUE,
            Status::Ok | Status::Stopped => GREEN,
            Status::Warning => YELLOW,
            Status::Failure => RED,
            Status::Loaded => CYAN,
            Status::Stage => MAGENTA,
        }
    }
}

/// Console and file sink for status events.
#[derive(Debug)]
pub struct StatusLog {
    file: Mutex<Option<File>>,
    console: bool,
}

impl StatusLog {
    /// Open (or create) the log file for appending.
    ///
    /// If the file cannot be opened, events still reach the console.
    pub fn open(path: &Path) -> Self {
        let file = path
            .parent()
            .map(std::fs::create_dir_all)
            .transpose()
            .and_then(|_| OpenOptions::new().create(true).append(true).open(path));

        let file = match file {
            Ok(f) => Some(f),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to open status log");
                None
            }
        };

        Self {
            file: Mutex::new(file),
            console: true,
        }
    }

    /// A log that only writes to the console.
    pub fn console_only() -> Self {
        Self {
            file: Mutex::new(None),
            console: true,
        }
    }

    /// Disable console output.
    pub fn quiet(mut self) -> Self {
        self.console = false;
        self
    }

    /// Report a status event.
    pub fn status(&self, status: Status, message: impl AsRef<str>) {
        let message = message.as_ref();

        if self.console {
            println!("{}[{}]{} {}", status.color(), status.symbol(), RESET, message);
        }

        match status {
            Status::Failure => tracing::error!("{}", message),
            Status::Warning => tracing::warn!("{}", message),
            _ => tracing::debug!("{}", message),
        }

        self.message(format!("[{}] {}", status.symbol(), message));
    }

    /// Append a line to the log file only.
    pub fn message(&self, message: impl AsRef<str>) {
        let mut guard = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(file) = guard.as_mut() {
            let line = format!(
                "[{}] {}\n",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                message.as_ref()
            );
            if let Err(e) = file.write_all(line.as_bytes()) {
                tracing::warn!(error = %e, "Failed to write status log");
            }
        }
    }
}
