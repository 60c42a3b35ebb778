//! Error taxonomy for the execution core.
//!
//! Each branch of the taxonomy has its own enum so that callers can match on
//! exactly the failures an operation may produce; [`Error`] unifies them for
//! callers that don't care.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::command::{ExitCode, Stream};

/// Result type for operations that may fail with any error of this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Any error produced by the execution core.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Construction(#[from] ConstructionError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Directory(#[from] DirError),
}

/// A command graph could not be built.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConstructionError {
    /// A pipeline needs at least two stages.
    #[error("invalid pipeline: expected at least 2 stages, got {stages}")]
    InvalidPipeline { stages: usize },
}

/// A program name could not be turned into an executable path.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// Nothing on the search path matched.
    #[error("{0}: command not found")]
    NotFound(String),

    /// A literal path (containing `/`) does not exist.
    #[error("{0}: No such file or directory")]
    NoSuchFile(String),

    /// The file exists but is not executable.
    #[error("{0}: Permission denied")]
    PermissionDenied(String),

    /// `PATH` holds a value that can't be read as a directory list.
    #[error("invalid PATH: {0}")]
    InvalidPath(String),
}

impl ResolveError {
    /// Exit code a shell reports for this failure.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ResolveError::NotFound(_) => 127,
            ResolveError::NoSuchFile(_) => 127,
            ResolveError::PermissionDenied(_) => 126,
            ResolveError::InvalidPath(_) => 127,
        }
    }
}

/// Spawning, wiring or awaiting part of a command graph failed.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// The OS refused to start the process.
    #[error("{program}: failed to spawn: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The redirect target could not be opened or duplicated.
    #[error("{target}: {source}")]
    Redirect {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Waiting for or signalling a process failed.
    #[error("failed to wait for child process: {source}")]
    Wait {
        #[source]
        source: io::Error,
    },

    /// A pipe between stages could not be allocated.
    #[error("failed to create pipe: {source}")]
    Pipe {
        #[source]
        source: io::Error,
    },

    /// A builtin failed in a way that isn't reflected in its exit code.
    #[error("{name}: {message}")]
    Builtin { name: String, message: String },

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

impl ExecError {
    /// Exit code reported for a stage that failed with this error.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ExecError::Resolve(e) => e.exit_code(),
            ExecError::Spawn { source, .. } => match source.kind() {
                io::ErrorKind::NotFound => 127,
                _ => 126,
            },
            ExecError::Redirect { .. }
            | ExecError::Wait { .. }
            | ExecError::Pipe { .. }
            | ExecError::Builtin { .. }
            | ExecError::Capture(_) => 1,
        }
    }
}

/// A capture slot was misused or its descriptor could not be read.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The slot was already read or handed off.
    #[error("{stream} has already been consumed")]
    AlreadyConsumed { stream: Stream },

    /// Reading from the captured descriptor failed.
    #[error("failed to read captured {stream}: {source}")]
    Read {
        stream: Stream,
        #[source]
        source: io::Error,
    },

    /// Allocating engine-owned descriptors failed (e.g. descriptor exhaustion).
    #[error("failed to allocate capture descriptor: {0}")]
    Allocate(#[source] io::Error),
}

/// A directory navigation operation failed; state is left unchanged.
#[derive(Debug, Error)]
pub enum DirError {
    #[error("{}: No such file or directory", .0.display())]
    NotFound(PathBuf),

    #[error("{}: Not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("{}: Permission denied", .0.display())]
    PermissionDenied(PathBuf),

    #[error("directory stack empty")]
    EmptyStack,

    #[error("OLDPWD not set")]
    OldPwdNotSet,

    #[error("HOME not set")]
    HomeNotSet,

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl DirError {
    /// Classify an I/O failure that happened while entering `path`.
    pub(crate) fn from_io(path: PathBuf, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => DirError::NotFound(path),
            io::ErrorKind::PermissionDenied => DirError::PermissionDenied(path),
            io::ErrorKind::NotADirectory => DirError::NotADirectory(path),
            _ => DirError::Io { path, source },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_errors_follow_shell_exit_codes() {
        assert_eq!(ResolveError::NotFound("x".into()).exit_code(), 127);
        assert_eq!(ResolveError::NoSuchFile("./x".into()).exit_code(), 127);
        assert_eq!(ResolveError::PermissionDenied("./x".into()).exit_code(), 126);
    }

    #[test]
    fn spawn_error_maps_enoent_to_127() {
        let err = ExecError::Spawn {
            program: "x".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(err.exit_code(), 127);

        let err = ExecError::Spawn {
            program: "x".into(),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };
        assert_eq!(err.exit_code(), 126);
    }

    #[test]
    fn dir_error_classifies_io_kinds() {
        let err = DirError::from_io("/nope".into(), io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, DirError::NotFound(_)));
        assert_eq!(err.to_string(), "/nope: No such file or directory");
    }
}
