//! Output Redirection
//!
//! Swaps a process-wide file descriptor (stdout, stderr) for the write end of
//! a pipe and drains the read end on a background thread, handing every chunk
//! to a callback. Restoring the descriptor closes the last write end, which
//! lets the reader hit end-of-file and finish.

use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::thread::JoinHandle;

use nix::unistd::{dup, dup2, pipe};
use tracing::{debug, warn};

use crate::{Result, TransportError};

const CHUNK_SIZE: usize = 4096;

pub struct Redirector {
    target: RawFd,
    original: OwnedFd,
    reader: Option<JoinHandle<std::io::Result<()>>>,
}

impl Redirector {
    /// Redirect `target` into `handler` until [`Redirector::stop`]
    pub fn new<H>(target: RawFd, mut handler: H) -> Result<Self>
    where
        H: FnMut(&[u8]) + Send + 'static,
    {
        let original = dup(target).map_err(|e| TransportError::from_errno("dup", e))?;
        // SAFETY: `dup` returned a fresh descriptor that nothing else owns.
        let original = unsafe { OwnedFd::from_raw_fd(original) };

        let (read_end, write_end) = pipe().map_err(|e| TransportError::from_errno("pipe", e))?;
        dup2(write_end.as_raw_fd(), target)
            .map_err(|e| TransportError::from_errno("dup2 onto target", e))?;
        drop(write_end);

        let reader = std::thread::Builder::new()
            .name(format!("redirect-{}", target))
            .spawn(move || {
                let mut source = File::from(read_end);
                let mut chunk = vec![0u8; CHUNK_SIZE];
                loop {
                    match source.read(&mut chunk) {
                        Ok(0) => return Ok(()),
                        Ok(n) => handler(&chunk[..n]),
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
            });
        let reader = match reader {
            Ok(reader) => reader,
            Err(e) => {
                let _ = dup2(original.as_raw_fd(), target);
                return Err(TransportError::system("spawn redirect reader", e));
            }
        };

        debug!(fd = target, "Redirected descriptor");
        Ok(Self {
            target,
            original,
            reader: Some(reader),
        })
    }

    /// Restore the original descriptor and wait for the reader to drain
    ///
    /// Buffered writers (e.g. `std::io::stdout()`) must be flushed first.
    pub fn stop(&mut self) -> Result<()> {
        let Some(reader) = self.reader.take() else {
            return Ok(());
        };
        dup2(self.original.as_raw_fd(), self.target)
            .map_err(|e| TransportError::from_errno("restore redirected descriptor", e))?;

        match reader.join() {
            Ok(Ok(())) => {
                debug!(fd = self.target, "Descriptor restored");
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::system("drain redirected output", e)),
            Err(_) => Err(TransportError::protocol("redirect reader panicked")),
        }
    }
}

impl Drop for Redirector {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(fd = self.target, error = %e, "Restoring redirected descriptor failed");
        }
    }
}
