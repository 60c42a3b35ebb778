//! An embeddable execution core for a shell.
//!
//! Commands are not parsed from text. A front end builds an immutable graph
//! of [`Runnable`] nodes (leaf programs, pipelines, redirects, environment
//! overlays and subshells) with the helpers in [`command`] and hands it to a
//! [`Shell`], which spawns the processes, wires their descriptors and reports
//! exit codes or captured output.
//!
//! ```no_run
//! use ship_shell::{Shell, ShellConfig, program};
//!
//! let shell = Shell::new(ShellConfig::default())?;
//! let printf = program("printf").call(["hello\nworld\n"]);
//! let grep = program("grep").call(["world"]);
//! assert_eq!(shell.get_stdout(&(&printf | &grep))?, "world\n");
//! # Ok::<(), ship_shell::Error>(())
//! ```
//!
//! The [`Shell`] also owns the shared environment store ([`EnvStore`]), the
//! directory state behind `cd`/`pushd`/`popd`, and a [`HookRegistry`] a REPL
//! front end dispatches at its lifecycle points.

mod builtin;
pub mod capture;
pub mod command;
pub mod config;
pub mod dirs;
pub mod env;
pub mod error;
pub mod exec;
mod external;
pub mod hooks;
mod interpreter;
pub mod io_adapters;
pub mod state;

pub use capture::{CaptureSlot, CapturedResult, RunningCapture, SlotState};
pub use command::{
    ExitCode, Program, Redirect, RedirectMode, RedirectTarget, Runnable, Stream, pipe, program,
    sub,
};
pub use config::ShellConfig;
pub use env::{EnvStore, EnvValue};
pub use error::{
    CaptureError, ConstructionError, DirError, Error, ExecError, ResolveError, Result,
};
pub use exec::{ExecResult, StageResult};
pub use hooks::{Hook, HookEvent, HookFailure, HookId, HookKind, HookRegistry};
pub use interpreter::Shell;
pub use state::ShellState;
