//! Per-run operator log
//!
//! Every entry goes three ways: the `log` facade (diagnostics), the run log
//! file (one per run, named by the run-start timestamp) and the frontend as
//! a `CoreToUi::Log` event. The file handle is owned here and swapped for a
//! fresh one on every reset.

use chrono::{DateTime, Local};
use flume::Sender;
use serde::Serialize;
use std::{
    fs::{File, OpenOptions},
    io::{LineWriter, Write},
    path::{Path, PathBuf},
};

use super::bus::CoreToUi;

/// One human-readable diagnostic line as shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub text: String,
    pub is_error: bool,
    /// False for high-volume lines (raw serial traffic) that only go to the file.
    pub display: bool,
}

/// File name for a run started at `started`.
pub fn log_file_name(started: DateTime<Local>) -> String {
    format!("mbt-{}.log", started.format("%Y-%m-%d-%H-%M-%S"))
}

pub struct RunLog {
    dir: Option<PathBuf>,
    path: Option<PathBuf>,
    file: Option<LineWriter<File>>,
    ui_tx: Sender<CoreToUi>,
}

impl RunLog {
    /// Create the log and open the first run file. `dir = None` disables the file sink.
    pub fn new(dir: Option<PathBuf>, ui_tx: Sender<CoreToUi>) -> Self {
        let mut log = Self {
            dir,
            path: None,
            file: None,
            ui_tx,
        };
        log.reopen();
        log
    }

    /// Close the current file and start a new one named by the current time.
    pub fn reopen(&mut self) {
        if let Some(mut previous) = self.file.take() {
            if let Err(err) = previous.flush() {
                log::warn!("Failed to flush run log: {err}");
            }
        }
        self.path = None;

        let Some(dir) = self.dir.as_ref() else {
            return;
        };
        let path = dir.join(log_file_name(Local::now()));
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                log::info!("Run log file opened at {}", path.display());
                self.file = Some(LineWriter::new(file));
                self.path = Some(path);
            }
            Err(err) => {
                log::warn!("Failed to open run log at '{}': {err}", path.display());
            }
        }
    }

    /// Path of the file currently written, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn info(&mut self, text: impl Into<String>) {
        self.record(text.into(), false, true);
    }

    /// Info line that is written to file but not displayed.
    pub fn info_quiet(&mut self, text: impl Into<String>) {
        self.record(text.into(), false, false);
    }

    pub fn error(&mut self, text: impl Into<String>) {
        self.record(text.into(), true, true);
    }

    fn record(&mut self, text: String, is_error: bool, display: bool) {
        if is_error {
            log::error!("{text}");
        } else {
            log::info!("{text}");
        }

        if let Some(file) = self.file.as_mut() {
            let stamp = Local::now().format("%Y-%m-%d %H:%M:%S,%3f");
            if let Err(err) = writeln!(file, "{stamp} - {text}") {
                log::warn!("Failed to write run log: {err}");
            }
        }

        let line = LogLine {
            text,
            is_error,
            display,
        };
        if self.ui_tx.send(CoreToUi::Log(line)).is_err() {
            log::debug!("Frontend channel closed, dropping log line");
        }
    }
}

impl Drop for RunLog {
    fn drop(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
    }
}
