//! Durable file writes.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use tempfile::NamedTempFile;

use crate::sequence::OneShotTimer;
use crate::Result;

/// Write `data` to `path` through a temp file and an atomic rename.
///
/// Missing parent directories are created.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Remove a file, treating a missing file as success.
pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Path of the backup copy taken before the first write of a session.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    path.with_file_name(name)
}

struct WriteRequest {
    data: Vec<u8>,
    /// Set for synchronous flushes
    ack: Option<Sender<bool>>,
}

/// Debounced, backed-up writer for one file.
///
/// Writes are coalesced by a fixed delay and executed in order on a
/// dedicated thread. The first write of a session copies the existing file
/// to its backup path. Dropping the writer drains the queue and joins the
/// thread; it does not serialize a pending debounced write, which is the
/// owner's job through [`flush`](Self::flush).
pub struct DebouncedWriter {
    path: PathBuf,
    delay: Duration,
    timer: OneShotTimer,
    tx: Option<Sender<WriteRequest>>,
    worker: Option<JoinHandle<()>>,
    writes: Arc<AtomicUsize>,
}

impl DebouncedWriter {
    pub fn new(path: PathBuf, delay: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<WriteRequest>();
        let writes = Arc::new(AtomicUsize::new(0));

        let worker_path = path.clone();
        let worker_writes = writes.clone();
        let worker = thread::Builder::new()
            .name("k2filter-storage".to_string())
            .spawn(move || {
                let mut backed_up = false;
                while let Ok(request) = rx.recv() {
                    if !backed_up {
                        backed_up = true;
                        if worker_path.exists() {
                            let backup = backup_path(&worker_path);
                            if let Err(e) = fs::copy(&worker_path, &backup) {
                                log::warn!("Failed to back up {}: {}", worker_path.display(), e);
                            }
                        }
                    }
                    let ok = match write_atomic(&worker_path, &request.data) {
                        Ok(()) => {
                            worker_writes.fetch_add(1, Ordering::SeqCst);
                            log::debug!(
                                "Wrote {} ({} bytes)",
                                worker_path.display(),
                                request.data.len()
                            );
                            true
                        }
                        Err(e) => {
                            log::error!("Failed to write {}: {}", worker_path.display(), e);
                            false
                        }
                    };
                    if let Some(ack) = request.ack {
                        let _ = ack.send(ok);
                    }
                }
            });

        let (tx, worker) = match worker {
            Ok(handle) => (Some(tx), Some(handle)),
            Err(e) => {
                log::error!("Failed to start storage writer thread: {}", e);
                (None, None)
            }
        };

        Self {
            path,
            delay,
            timer: OneShotTimer::new(),
            tx,
            worker,
            writes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Request a write. Requests made while one is pending are coalesced.
    pub fn schedule(&mut self, now: SystemTime) {
        self.timer.start(now, self.delay);
    }

    pub fn has_pending_write(&self) -> bool {
        self.timer.is_running()
    }

    pub fn next_deadline(&self) -> Option<SystemTime> {
        self.timer.deadline()
    }

    /// Disarm and return `true` if the pending write is due. The caller then
    /// hands the bytes to [`write`](Self::write).
    pub fn take_due(&mut self, now: SystemTime) -> bool {
        self.timer.take_if_due(now)
    }

    /// Queue `data` for writing without waiting.
    pub fn write(&self, data: Vec<u8>) {
        self.send(data, None);
    }

    /// Write `data` now and wait for it to land, cancelling any pending
    /// debounced write. Returns `true` on success.
    pub fn flush(&mut self, data: Vec<u8>) -> bool {
        self.timer.stop();
        let (ack_tx, ack_rx) = mpsc::channel();
        if !self.send(data, Some(ack_tx)) {
            return false;
        }
        ack_rx.recv().unwrap_or(false)
    }

    fn send(&self, data: Vec<u8>, ack: Option<Sender<bool>>) -> bool {
        match &self.tx {
            Some(tx) => tx.send(WriteRequest { data, ack }).is_ok(),
            None => {
                log::error!("Storage writer unavailable, dropping write of {}", self.path.display());
                false
            }
        }
    }

    /// Number of writes completed so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl Drop for DebouncedWriter {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for DebouncedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebouncedWriter")
            .field("path", &self.path)
            .field("delay", &self.delay)
            .field("pending", &self.timer.is_running())
            .finish()
    }
}
