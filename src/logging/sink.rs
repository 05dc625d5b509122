//! Log destinations
//!
//! Each sink is shared between its `fmt` layer (through [`SinkWriter`]) and
//! the [`LogHandle`](super::LogHandle) that flushes and closes it. One
//! formatted record arrives per `write` call, so rotation and flushing are
//! decided per record.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;

/// A destination for formatted log records
pub trait Sink: Send + Sync {
    /// Short name used in diagnostics
    fn name(&self) -> &'static str;

    /// Write one formatted record, flushing afterwards when asked to
    fn write_record(&self, record: &[u8], flush: bool) -> io::Result<()>;

    /// Push buffered records to the destination
    fn flush(&self) -> io::Result<()>;

    /// Flush and stop accepting records; later writes are discarded
    fn close(&self) -> io::Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ConsoleState {
    out: Box<dyn Write + Send>,
    closed: bool,
}

/// Console destination, stdout unless a writer is injected
pub struct ConsoleSink {
    state: Mutex<ConsoleState>,
}

impl ConsoleSink {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            state: Mutex::new(ConsoleState { out, closed: false }),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }
}

impl Sink for ConsoleSink {
    fn name(&self) -> &'static str {
        "console"
    }

    fn write_record(&self, record: &[u8], _flush: bool) -> io::Result<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Ok(());
        }
        state.out.write_all(record)?;
        state.out.flush()
    }

    fn flush(&self) -> io::Result<()> {
        lock(&self.state).out.flush()
    }

    fn close(&self) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.closed = true;
        state.out.flush()
    }
}

struct FileState {
    file: BufWriter<File>,
    current_size: u64,
    closed: bool,
}

/// Size-rotating file destination
///
/// Before a record would push the active file past `max_size` bytes the
/// files shift one slot: `name.ext` becomes `name.1.ext`, `name.1.ext`
/// becomes `name.2.ext`, up to `max_files`. The oldest file falls off.
pub struct RotatingFileSink {
    base: PathBuf,
    max_size: u64,
    max_files: usize,
    state: Mutex<FileState>,
}

impl RotatingFileSink {
    /// Open (or create) the active file in append mode
    pub fn open(base: impl Into<PathBuf>, max_size: u64, max_files: usize) -> io::Result<Self> {
        let base = base.into();
        let file = open_append(&base)?;
        let current_size = file.metadata()?.len();

        Ok(Self {
            base,
            max_size,
            max_files: max_files.max(1),
            state: Mutex::new(FileState {
                file: BufWriter::new(file),
                current_size,
                closed: false,
            }),
        })
    }

    /// Path of the active file
    pub fn path(&self) -> &Path {
        &self.base
    }

    fn rotate(&self, state: &mut FileState) -> io::Result<()> {
        state.file.flush()?;

        for index in (1..=self.max_files).rev() {
            let src = rotated_path(&self.base, index - 1);
            if !src.exists() {
                continue;
            }
            let dst = rotated_path(&self.base, index);
            match std::fs::remove_file(&dst) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            if let Err(e) = std::fs::rename(&src, &dst) {
                // Keep the active file bounded even when the shift failed
                state.file = BufWriter::new(open_truncate(&self.base)?);
                state.current_size = 0;
                return Err(e);
            }
        }

        state.file = BufWriter::new(open_append(&self.base)?);
        state.current_size = 0;
        Ok(())
    }
}

impl Sink for RotatingFileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    fn write_record(&self, record: &[u8], flush: bool) -> io::Result<()> {
        let mut state = lock(&self.state);
        if state.closed {
            return Ok(());
        }

        let len = record.len() as u64;
        if state.current_size > 0 && state.current_size + len > self.max_size {
            self.rotate(&mut state)?;
        }

        state.file.write_all(record)?;
        state.current_size += len;
        if flush {
            state.file.flush()?;
        }
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        lock(&self.state).file.flush()
    }

    fn close(&self) -> io::Result<()> {
        let mut state = lock(&self.state);
        state.closed = true;
        state.file.flush()
    }
}

/// Path of the rotated file in slot `index` (0 is the active file)
///
/// The index goes before the extension: `logs/app.log` → `logs/app.2.log`.
pub fn rotated_path(base: &Path, index: usize) -> PathBuf {
    if index == 0 {
        return base.to_path_buf();
    }

    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match base.extension() {
        Some(ext) => format!("{stem}.{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}.{index}"),
    };
    base.with_file_name(name)
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn open_truncate(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
}

/// When records are pushed to the destination right away
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    /// Flush every record that passed the level filter
    pub immediate: bool,
}

impl FlushPolicy {
    fn flush_after(&self, level: &Level) -> bool {
        self.immediate || *level == Level::ERROR
    }
}

/// `MakeWriter` adapter feeding a sink from a `fmt` layer
pub struct SinkWriter {
    sink: Arc<dyn Sink>,
    policy: FlushPolicy,
    failed: AtomicBool,
}

impl SinkWriter {
    pub fn new(sink: Arc<dyn Sink>, policy: FlushPolicy) -> Self {
        Self {
            sink,
            policy,
            failed: AtomicBool::new(false),
        }
    }
}

impl<'a> MakeWriter<'a> for SinkWriter {
    type Writer = RecordWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RecordWriter {
            owner: self,
            flush: self.policy.immediate,
        }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        RecordWriter {
            owner: self,
            flush: self.policy.flush_after(meta.level()),
        }
    }
}

/// Writer handed out for a single record
pub struct RecordWriter<'a> {
    owner: &'a SinkWriter,
    flush: bool,
}

impl Write for RecordWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.owner.sink.write_record(buf, self.flush) {
            Ok(()) => Ok(buf.len()),
            Err(e) => {
                // Report once per sink; the record itself is dropped
                if !self.owner.failed.swap(true, Ordering::Relaxed) {
                    eprintln!("Warning: {} log sink write failed: {}", self.owner.sink.name(), e);
                }
                Err(e)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.owner.sink.flush()
    }
}
