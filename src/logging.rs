// SPDX-License-Identifier: MIT
//! Tracing subscriber setup, with a hand-rolled size-based rotating file
//! writer: `tracing_appender`'s built-in rolling only offers time-based
//! rotation (daily/hourly/minutely), but §6 calls for 10 MiB × 5 files.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Default rotation threshold per §6.
pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;
/// Default number of retained rotated files, plus the active one.
pub const DEFAULT_MAX_FILES: usize = 5;

struct RotatingFileInner {
    dir: PathBuf,
    base_name: String,
    max_bytes: u64,
    max_files: usize,
    current: File,
    current_size: u64,
}

impl RotatingFileInner {
    fn open(dir: &Path, base_name: &str) -> io::Result<(File, u64)> {
        let path = dir.join(base_name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        Ok((file, size))
    }

    /// Shift `base_name.{n-1}` -> `base_name.{n}` down the chain, then move
    /// the active file to `base_name.1` and open a fresh one.
    fn rotate(&mut self) -> io::Result<()> {
        for i in (1..self.max_files).rev() {
            let from = self.dir.join(format!("{}.{}", self.base_name, i));
            let to = self.dir.join(format!("{}.{}", self.base_name, i + 1));
            if from.exists() {
                let _ = fs::rename(&from, &to);
            }
        }
        let active = self.dir.join(&self.base_name);
        let rotated = self.dir.join(format!("{}.1", self.base_name));
        if active.exists() {
            let _ = fs::rename(&active, &rotated);
        }
        let (file, size) = Self::open(&self.dir, &self.base_name)?;
        self.current = file;
        self.current_size = size;
        Ok(())
    }
}

impl Write for RotatingFileInner {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.current_size > 0 && self.current_size + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let written = self.current.write(buf)?;
        self.current_size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.current.flush()
    }
}

/// A `Write` + [`MakeWriter`] implementation that rotates to `<name>.1` .. `<name>.N`
/// once the active file crosses `max_bytes`. Cheap to clone — the state lives
/// behind an `Arc<Mutex<_>>`, mirroring how `tracing_appender`'s own rolling
/// appender shares one file handle across the non-blocking worker thread.
#[derive(Clone)]
pub struct RotatingFileWriter(Arc<Mutex<RotatingFileInner>>);

impl RotatingFileWriter {
    pub fn new(dir: impl Into<PathBuf>, base_name: impl Into<String>, max_bytes: u64, max_files: usize) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let base_name = base_name.into();
        let (file, size) = RotatingFileInner::open(&dir, &base_name)?;
        Ok(Self(Arc::new(Mutex::new(RotatingFileInner {
            dir,
            base_name,
            max_bytes,
            max_files: max_files.max(1),
            current: file,
            current_size: size,
        }))))
    }
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("log writer mutex poisoned").write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().expect("log writer mutex poisoned").flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingFileWriter {
    type Writer = RotatingFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Initialize the global tracing subscriber. If `log_dir` is set, logs go to
/// stdout and a size-rotated file; otherwise stdout only. Returns the
/// [`WorkerGuard`] that must be kept alive for the process lifetime — dropping
/// it stops the non-blocking writer from flushing.
///
/// Falls back to stdout-only with a warning if the log directory can't be
/// created, rather than refusing to start.
pub fn init(log_level: &str, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let Some(dir) = log_dir else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        return None;
    };

    match RotatingFileWriter::new(dir, "cdpd.log", DEFAULT_MAX_BYTES, DEFAULT_MAX_FILES) {
        Ok(writer) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(writer);
            tracing_subscriber::registry()
                .with(tracing_subscriber::EnvFilter::new(log_level))
                .with(tracing_subscriber::fmt::layer().compact())
                .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();
            Some(guard)
        }
        Err(e) => {
            eprintln!("warn: could not open log directory '{}': {e} — falling back to stdout", dir.display());
            tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            None
        }
    }
}
