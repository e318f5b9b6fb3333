//! Asynchronous write interface.
//!
//! The consumer never blocks on the kernel while formatting: it submits a
//! filled output buffer here and keeps assembling into the other half of
//! the double buffer. A dedicated I/O thread performs the actual writes and
//! signals completion by sending the buffer back; waiting for that return
//! is the "wait for outstanding write" half of a double-buffer swap.
//!
//! Write failures never abort anything: each failure prints one diagnostic
//! to stderr and the loop moves on, accepting that the affected bytes are
//! lost.

use std::fs::File;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use thiserror::Error;

/// Failure to install a new output target.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("can't open log file {path:?}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
}

enum Submission {
    /// Write `len` bytes of `buf`, then hand the buffer back.
    Write { buf: Box<[u8]>, len: usize },
    /// Replace the output target; the previous one closes on drop.
    SetTarget(File),
    Shutdown,
}

/// Counters shared with [`crate::logger`] so a `sync()` caller can observe
/// that every submitted buffer has been written out.
pub struct WriterStats {
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
}

impl WriterStats {
    pub fn idle(&self) -> bool {
        self.completed.load(Ordering::Acquire) == self.submitted.load(Ordering::Acquire)
    }
}

/// Producer-side handle for retargeting the output.
#[derive(Clone)]
pub struct WriterControl {
    tx: Sender<Submission>,
}

impl WriterControl {
    pub fn set_target(&self, file: File) {
        let _ = self.tx.send(Submission::SetTarget(file));
    }
}

/// Consumer-side handle: submit filled buffers, wait for their return.
pub struct AsyncWriter {
    tx: Sender<Submission>,
    completions: Receiver<Box<[u8]>>,
    outstanding: bool,
    stats: Arc<WriterStats>,
    handle: Option<thread::JoinHandle<()>>,
}

impl AsyncWriter {
    /// Spawns the I/O thread. Output goes to stdout until a target file is
    /// installed.
    pub fn spawn() -> (AsyncWriter, WriterControl) {
        let (tx, rx) = mpsc::channel::<Submission>();
        let (done_tx, done_rx) = mpsc::channel::<Box<[u8]>>();
        let stats = Arc::new(WriterStats {
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        });

        let worker_stats = stats.clone();
        let handle = thread::Builder::new()
            .name("stagelog-writer".into())
            .spawn(move || writer_main(rx, done_tx, worker_stats))
            .expect("failed to spawn log writer thread");

        let control = WriterControl { tx: tx.clone() };
        (
            AsyncWriter {
                tx,
                completions: done_rx,
                outstanding: false,
                stats,
                handle: Some(handle),
            },
            control,
        )
    }

    pub fn stats(&self) -> Arc<WriterStats> {
        self.stats.clone()
    }

    pub fn has_outstanding(&self) -> bool {
        self.outstanding
    }

    /// Submits `len` bytes of `buf` for writing. At most one submission may
    /// be outstanding; callers wait for the previous one first.
    pub fn submit(&mut self, buf: Box<[u8]>, len: usize) {
        debug_assert!(!self.outstanding);
        if len == 0 {
            return;
        }
        self.stats.submitted.fetch_add(1, Ordering::Release);
        if self.tx.send(Submission::Write { buf, len }).is_ok() {
            self.outstanding = true;
        }
    }

    /// Blocks until the outstanding write, if any, has completed, and
    /// returns its recycled buffer.
    pub fn wait_for_completion(&mut self) -> Option<Box<[u8]>> {
        if !self.outstanding {
            return None;
        }
        self.outstanding = false;
        self.completions.recv().ok()
    }

    /// Drains the outstanding write and joins the I/O thread.
    pub fn shutdown(mut self) {
        let _ = self.wait_for_completion();
        let _ = self.tx.send(Submission::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

enum Target {
    Stdout(io::Stdout),
    File(File),
}

impl Target {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Target::Stdout(out) => out.lock().write_all(bytes),
            Target::File(file) => file.write_all(bytes),
        }
    }
}

fn writer_main(rx: Receiver<Submission>, completions: Sender<Box<[u8]>>, stats: Arc<WriterStats>) {
    let mut target = Target::Stdout(io::stdout());

    while let Ok(submission) = rx.recv() {
        match submission {
            Submission::Write { buf, len } => {
                if let Err(e) = target.write_all(&buf[..len]) {
                    eprintln!("stagelog: write failed, log output may be incomplete: {}", e);
                }
                stats.completed.fetch_add(1, Ordering::Release);
                // The buffer going back is the completion signal.
                let _ = completions.send(buf);
            }
            Submission::SetTarget(file) => {
                target = Target::File(file);
            }
            Submission::Shutdown => break,
        }
    }
}
