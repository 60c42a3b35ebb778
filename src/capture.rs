//! Captured output of a command graph.
//!
//! Each captured stream lives in a [`CaptureSlot`] that owns one OS
//! descriptor. A slot is consumed exactly once, either read into a `String`
//! or handed off raw as an [`OwnedFd`]. Whatever is still owned when the slot
//! is dropped is closed by that drop; a handed-off descriptor belongs to the
//! caller and is closed when their `OwnedFd` goes away.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::os::fd::OwnedFd;
use std::thread::{self, JoinHandle};

use os_pipe::PipeReader;
use tracing::{trace, warn};

use crate::command::{ExitCode, Stream};
use crate::error::{CaptureError, Error, ExecError};
use crate::exec::{ExecResult, Launched};

/// Observable state of a [`CaptureSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Unconsumed,
    ConsumedAsString,
    HandedOff,
    Closed,
}

#[derive(Debug)]
enum Slot {
    Unconsumed(OwnedFd),
    ConsumedAsString,
    HandedOff,
    Closed,
}

/// One captured stream.
#[derive(Debug)]
pub struct CaptureSlot {
    stream: Stream,
    slot: Slot,
}

impl CaptureSlot {
    pub(crate) fn new(stream: Stream, fd: OwnedFd) -> Self {
        Self {
            stream,
            slot: Slot::Unconsumed(fd),
        }
    }

    pub(crate) fn closed(stream: Stream) -> Self {
        Self {
            stream,
            slot: Slot::Closed,
        }
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    pub fn state(&self) -> SlotState {
        match self.slot {
            Slot::Unconsumed(_) => SlotState::Unconsumed,
            Slot::ConsumedAsString => SlotState::ConsumedAsString,
            Slot::HandedOff => SlotState::HandedOff,
            Slot::Closed => SlotState::Closed,
        }
    }

    fn take_fd(&mut self, next: Slot) -> Result<OwnedFd, CaptureError> {
        match std::mem::replace(&mut self.slot, next) {
            Slot::Unconsumed(fd) => Ok(fd),
            previous => {
                self.slot = previous;
                Err(CaptureError::AlreadyConsumed {
                    stream: self.stream,
                })
            }
        }
    }

    /// Read the whole stream and close it. Invalid UTF-8 is replaced.
    pub fn read_to_string(&mut self) -> Result<String, CaptureError> {
        let fd = self.take_fd(Slot::ConsumedAsString)?;
        let mut bytes = Vec::new();
        File::from(fd).read_to_end(&mut bytes).map_err(|source| {
            self.slot = Slot::Closed;
            CaptureError::Read {
                stream: self.stream,
                source,
            }
        })?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Transfer ownership of the descriptor to the caller.
    pub fn take_raw_handle(&mut self) -> Result<OwnedFd, CaptureError> {
        self.take_fd(Slot::HandedOff)
    }

    /// Close an unconsumed descriptor now. Returns whether anything was closed.
    pub fn close(&mut self) -> bool {
        self.take_fd(Slot::Closed).is_ok()
    }
}

/// Result of a captured execution.
#[derive(Debug)]
pub struct CapturedResult {
    pub result: ExecResult,
    pub stdout: CaptureSlot,
    pub stderr: CaptureSlot,
}

impl CapturedResult {
    pub fn exit_code(&self) -> ExitCode {
        self.result.exit_code
    }

    pub fn read_stdout(&mut self) -> Result<String, CaptureError> {
        self.stdout.read_to_string()
    }

    pub fn read_stderr(&mut self) -> Result<String, CaptureError> {
        self.stderr.read_to_string()
    }
}

/// A captured execution that is still running.
///
/// The read ends are live pipes. Take them with [`take_stdout`] /
/// [`take_stderr`] to stream output yourself, or call [`finish`] to have
/// both drained concurrently.
///
/// [`take_stdout`]: RunningCapture::take_stdout
/// [`take_stderr`]: RunningCapture::take_stderr
/// [`finish`]: RunningCapture::finish
#[derive(Debug)]
pub struct RunningCapture {
    launched: Launched,
    stdout: Option<PipeReader>,
    stderr: Option<PipeReader>,
}

impl RunningCapture {
    pub(crate) fn new(launched: Launched, stdout: PipeReader, stderr: PipeReader) -> Self {
        Self {
            launched,
            stdout: Some(stdout),
            stderr: Some(stderr),
        }
    }

    pub fn take_stdout(&mut self) -> Option<PipeReader> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<PipeReader> {
        self.stderr.take()
    }

    /// Process ids of the external stages started so far.
    pub fn pids(&self) -> Vec<u32> {
        self.launched.pids()
    }

    /// Send SIGKILL to every external stage.
    pub fn kill(&mut self) -> Result<(), ExecError> {
        self.launched.kill()
    }

    /// Wait for every stage. Read ends not taken are closed first, so a
    /// stage still writing to them sees a broken pipe instead of blocking.
    pub fn wait(mut self) -> ExecResult {
        self.stdout.take();
        self.stderr.take();
        ExecResult::from_stages(self.launched.wait())
    }

    /// Drain both streams while waiting, then hand back the captured output.
    ///
    /// Each stream is spooled on its own thread into an anonymous temporary
    /// file, so neither a full pipe nor a large output can stall the stages.
    pub fn finish(mut self) -> Result<CapturedResult, Error> {
        let stdout = self.stdout.take().map(|r| spool(Stream::Stdout, r));
        let stderr = self.stderr.take().map(|r| spool(Stream::Stderr, r));
        let result = ExecResult::from_stages(self.launched.wait());
        Ok(CapturedResult {
            result,
            stdout: collect(Stream::Stdout, stdout)?,
            stderr: collect(Stream::Stderr, stderr)?,
        })
    }
}

fn spool(stream: Stream, mut reader: PipeReader) -> JoinHandle<Result<File, CaptureError>> {
    thread::spawn(move || {
        let mut file = tempfile::tempfile().map_err(CaptureError::Allocate)?;
        let read_err = |source: io::Error| CaptureError::Read { stream, source };
        let bytes = io::copy(&mut reader, &mut file).map_err(read_err)?;
        file.seek(SeekFrom::Start(0)).map_err(read_err)?;
        trace!(%stream, bytes, "drained captured stream");
        Ok(file)
    })
}

fn collect(
    stream: Stream,
    drainer: Option<JoinHandle<Result<File, CaptureError>>>,
) -> Result<CaptureSlot, CaptureError> {
    let Some(drainer) = drainer else {
        return Ok(CaptureSlot::closed(stream));
    };
    match drainer.join() {
        Ok(file) => Ok(CaptureSlot::new(stream, OwnedFd::from(file?))),
        Err(_) => {
            warn!(%stream, "capture drain thread panicked");
            Err(CaptureError::Read {
                stream,
                source: io::Error::other("drain thread panicked"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn slot_with(contents: &str) -> CaptureSlot {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        CaptureSlot::new(Stream::Stdout, OwnedFd::from(file))
    }

    #[test]
    fn read_once_then_already_consumed() {
        let mut slot = slot_with("hello\n");
        assert_eq!(slot.state(), SlotState::Unconsumed);
        assert_eq!(slot.read_to_string().unwrap(), "hello\n");
        assert_eq!(slot.state(), SlotState::ConsumedAsString);

        let err = slot.read_to_string().unwrap_err();
        assert!(matches!(
            err,
            CaptureError::AlreadyConsumed {
                stream: Stream::Stdout
            }
        ));
        assert!(slot.take_raw_handle().is_err());
        assert_eq!(slot.state(), SlotState::ConsumedAsString);
    }

    #[test]
    fn handoff_transfers_ownership() {
        let mut slot = slot_with("raw bytes");
        let fd = slot.take_raw_handle().unwrap();
        assert_eq!(slot.state(), SlotState::HandedOff);
        assert!(slot.read_to_string().is_err());
        assert!(!slot.close());

        let mut s = String::new();
        File::from(fd).read_to_string(&mut s).unwrap();
        assert_eq!(s, "raw bytes");
    }

    #[test]
    fn close_only_affects_unconsumed_slots() {
        let mut slot = slot_with("x");
        assert!(slot.close());
        assert_eq!(slot.state(), SlotState::Closed);
        assert!(!slot.close());
        assert!(matches!(
            slot.read_to_string(),
            Err(CaptureError::AlreadyConsumed { .. })
        ));
    }

    #[test]
    fn spool_drains_pipe_into_rewound_file() {
        let (reader, mut writer) = os_pipe::pipe().unwrap();
        let drainer = spool(Stream::Stderr, reader);
        let payload = "e".repeat(200_000);
        writer.write_all(payload.as_bytes()).unwrap();
        drop(writer);

        let mut slot = collect(Stream::Stderr, Some(drainer)).unwrap();
        assert_eq!(slot.stream(), Stream::Stderr);
        assert_eq!(slot.read_to_string().unwrap().len(), payload.len());
    }
}
