//! Stream endpoints handed to pipeline stages.
//!
//! External stages turn an endpoint into a [`Stdio`]; builtins running
//! in-process turn it into a boxed reader or writer instead. Endpoints are
//! owned: moving one into a stage is what closes the engine's copy.

use std::fs::File;
use std::io::{self, Read, Write};
use std::process::Stdio;

use os_pipe::{PipeReader, PipeWriter};

#[cfg(test)]
use crate::test_support::SharedBuf;

/// Where a stage reads standard input from.
#[derive(Debug)]
pub enum Input {
    Inherit,
    Null,
    Pipe(PipeReader),
    File(File),
}

impl Input {
    pub fn try_clone(&self) -> io::Result<Input> {
        Ok(match self {
            Input::Inherit => Input::Inherit,
            Input::Null => Input::Null,
            Input::Pipe(r) => Input::Pipe(r.try_clone()?),
            Input::File(f) => Input::File(f.try_clone()?),
        })
    }

    pub fn into_stdio(self) -> Stdio {
        match self {
            Input::Inherit => Stdio::inherit(),
            Input::Null => Stdio::null(),
            Input::Pipe(r) => Stdio::from(r),
            Input::File(f) => Stdio::from(f),
        }
    }

    /// Reader for a builtin running in-process.
    pub fn into_reader(self) -> Box<dyn Read + Send> {
        match self {
            Input::Inherit => Box::new(io::stdin()),
            Input::Null => Box::new(io::empty()),
            Input::Pipe(r) => Box::new(r),
            Input::File(f) => Box::new(f),
        }
    }
}

/// Where a stage writes one of its output streams.
#[derive(Debug)]
pub enum Output {
    Inherit,
    Null,
    Pipe(PipeWriter),
    File(File),
}

impl Output {
    pub fn try_clone(&self) -> io::Result<Output> {
        Ok(match self {
            Output::Inherit => Output::Inherit,
            Output::Null => Output::Null,
            Output::Pipe(w) => Output::Pipe(w.try_clone()?),
            Output::File(f) => Output::File(f.try_clone()?),
        })
    }

    pub fn into_stdio(self) -> Stdio {
        match self {
            Output::Inherit => Stdio::inherit(),
            Output::Null => Stdio::null(),
            Output::Pipe(w) => Stdio::from(w),
            Output::File(f) => Stdio::from(f),
        }
    }

    /// Writer for a builtin running in-process; `is_stderr` picks which
    /// parent stream `Inherit` means.
    pub fn into_writer(self, is_stderr: bool) -> Box<dyn Write + Send> {
        match self {
            Output::Inherit if is_stderr => Box::new(io::stderr()),
            Output::Inherit => Box::new(io::stdout()),
            Output::Null => Box::new(io::sink()),
            Output::Pipe(w) => Box::new(w),
            Output::File(f) => Box::new(f),
        }
    }
}

/// The three standard streams of one stage.
#[derive(Debug)]
pub struct Io {
    pub stdin: Input,
    pub stdout: Output,
    pub stderr: Output,
}

impl Io {
    /// Inherit all three streams from this process.
    pub fn inherit() -> Self {
        Self {
            stdin: Input::Inherit,
            stdout: Output::Inherit,
            stderr: Output::Inherit,
        }
    }

    pub fn try_clone(&self) -> io::Result<Io> {
        Ok(Io {
            stdin: self.stdin.try_clone()?,
            stdout: self.stdout.try_clone()?,
            stderr: self.stderr.try_clone()?,
        })
    }
}

/// Reader/writer triple a builtin executes against.
pub struct BuiltinIo {
    pub stdin: Box<dyn Read + Send>,
    pub stdout: Box<dyn Write + Send>,
    pub stderr: Box<dyn Write + Send>,
}

impl From<Io> for BuiltinIo {
    fn from(io: Io) -> Self {
        Self {
            stdin: io.stdin.into_reader(),
            stdout: io.stdout.into_writer(false),
            stderr: io.stderr.into_writer(true),
        }
    }
}

impl BuiltinIo {
    /// Buffers only, for exercising builtins in isolation.
    #[cfg(test)]
    pub(crate) fn memory() -> (Self, SharedBuf, SharedBuf) {
        let out = SharedBuf::default();
        let err = SharedBuf::default();
        let io = Self {
            stdin: Box::new(io::empty()),
            stdout: Box::new(out.clone()),
            stderr: Box::new(err.clone()),
        };
        (io, out, err)
    }
}
