//! Named pipes shared with local tools.
//!
//! Both pipes are opened non-blocking first and switched to blocking right
//! after: a blocking open of a FIFO waits for the other end, which the relay
//! must never do.
//!
//! - The input pipe stays open for reading all the time. After each request
//!   it is drained and reopened; otherwise `ppoll` keeps reporting `POLLHUP`
//!   once the writer has gone.
//! - The output pipe is opened per reply. A non-blocking open for writing
//!   fails with `ENXIO` while there is no reader, so opening is retried on a
//!   fixed step until a deadline.

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{access, mkfifo, AccessFlags};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum PipeError {
    #[error("{path} exists, but is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("{path} exists, but is not a FIFO pipe")]
    NotAFifo { path: PathBuf },

    #[error("{path} exists, but is not readable and writable")]
    NoAccess { path: PathBuf },

    #[error("cannot {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> PipeError + 'a {
    move |source| PipeError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}

/// Creates `dir` (mode 0777) if missing, then the FIFOs `in` and `out`.
///
/// # Errors
///
/// Fails if `dir` is not a directory, if an existing pipe path is not a FIFO
/// or not readable and writable, or on any file-system error.
pub fn prepare_pipes(dir: &Path) -> Result<(), PipeError> {
    match fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(PipeError::NotADirectory {
                path: dir.to_path_buf(),
            })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            DirBuilder::new()
                .mode(0o777)
                .create(dir)
                .map_err(io_error("create directory", dir))?;
            info!("created pipe directory {}", dir.display());
        }
        Err(e) => return Err(io_error("stat", dir)(e)),
    }

    ensure_fifo(&dir.join("in"))?;
    ensure_fifo(&dir.join("out"))
}

/// Creates a FIFO at `path` (mode 0666), or checks the one already there.
///
/// Both directions must be usable: other tools use the pipes the other way.
pub fn ensure_fifo(path: &Path) -> Result<(), PipeError> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let mode = Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IWGRP | Mode::S_IROTH | Mode::S_IWOTH;
            mkfifo(path, mode).map_err(|e| io_error("create FIFO", path)(e.into()))?;
            debug!("created FIFO {}", path.display());
            return Ok(());
        }
        Err(e) => return Err(io_error("stat", path)(e)),
    };

    if access(path, AccessFlags::R_OK | AccessFlags::W_OK).is_err() {
        return Err(PipeError::NoAccess {
            path: path.to_path_buf(),
        });
    }
    if !meta.file_type().is_fifo() {
        return Err(PipeError::NotAFifo {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

/// Opens `path` without waiting for the other end, then clears `O_NONBLOCK`.
fn open_then_block(path: &Path, write: bool) -> io::Result<File> {
    let file = OpenOptions::new()
        .read(!write)
        .write(write)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)?;
    set_nonblocking(&file, false)?;
    Ok(file)
}

fn set_nonblocking(file: &File, nonblocking: bool) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let mut flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    flags.set(OFlag::O_NONBLOCK, nonblocking);
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// The request pipe, always open for reading.
#[derive(Debug)]
pub struct PipeIn {
    path: PathBuf,
    file: File,
}

impl PipeIn {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PipeError> {
        let path = path.into();
        let file = open_then_block(&path, false).map_err(io_error("open", &path))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }

    /// The pipe for reading one request.
    pub fn reader(&mut self) -> &mut File {
        &mut self.file
    }

    /// Discards anything left in the pipe and reopens it.
    ///
    /// Must run before anything is written to the output pipe, or data from
    /// a second tool that already started writing could be lost.
    pub fn reopen(&mut self) -> Result<(), PipeError> {
        self.drain();
        self.file = open_then_block(&self.path, false).map_err(io_error("reopen", &self.path))?;
        trace!("{} reopened", self.path.display());
        Ok(())
    }

    fn drain(&mut self) {
        if let Err(e) = set_nonblocking(&self.file, true) {
            warn!("cannot drain {}: {e}", self.path.display());
            return;
        }
        let mut scratch = [0u8; 4096];
        let mut dropped = 0;
        loop {
            match self.file.read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => dropped += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        if dropped > 0 {
            debug!("dropped {dropped} stray bytes from {}", self.path.display());
        }
    }
}

/// Opens the reply pipe for writing, waiting up to `timeout` for a reader.
///
/// Returns `Ok(None)` on timeout.
///
/// # Errors
///
/// Failing to switch the pipe back to blocking mode.
pub fn open_pipe_out(path: &Path, timeout: Duration, retry: Duration) -> io::Result<Option<File>> {
    let attempts = (timeout.as_millis() / retry.as_millis().max(1)).max(1);
    for attempt in 0..attempts {
        let file = match OpenOptions::new()
            .write(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(path)
        {
            Ok(file) => file,
            Err(e) => {
                if attempt == 0 {
                    trace!("waiting for a reader on {}: {e}", path.display());
                }
                thread::sleep(retry);
                continue;
            }
        };
        set_nonblocking(&file, false)?;
        return Ok(Some(file));
    }
    warn!("timeout while opening {}", path.display());
    Ok(None)
}

/// Writes a one-line error report to the reply pipe.
pub fn report_error(path: &Path, message: &str, timeout: Duration, retry: Duration) {
    match open_pipe_out(path, timeout, retry) {
        Ok(Some(mut file)) => {
            if let Err(e) = file.write_all(message.as_bytes()) {
                warn!("cannot write to {}: {e}", path.display());
            }
        }
        Ok(None) => {}
        Err(e) => warn!("cannot open {}: {e}", path.display()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
