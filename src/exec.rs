//! The execution engine.
//!
//! Running a graph has two phases. [`launch`] walks the graph, opens
//! redirects, allocates pipes and starts every stage: external leaves as
//! child processes, builtins on their own threads. Only then does
//! [`Launched::wait`] collect exit codes, so no stage waits on a neighbour
//! that was never started.
//!
//! Failure to start one pipeline stage is recorded in that stage's
//! [`StageResult`] and the other stages keep running. Outside a pipeline the
//! error is returned to the caller.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::process::Child;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::builtin::{self, BuiltinContext};
use crate::capture::RunningCapture;
use crate::command::{
    ExitCode, Node, Overlay, Program, Redirect, RedirectMode, RedirectTarget, Runnable,
};
use crate::env::render_all;
use crate::error::{CaptureError, Error, ExecError};
use crate::external::{LeafSpawn, exit_code_of, resolve_program, search_dirs, spawn_leaf};
use crate::io_adapters::{BuiltinIo, Input, Io, Output};
use crate::state::ShellState;

/// Outcome of one pipeline stage (or of a lone command).
#[derive(Debug)]
pub struct StageResult {
    /// Program name of a leaf, or the shell-like rendering of a compound stage.
    pub program: String,
    pub exit_code: ExitCode,
    /// Why the stage could not run or be awaited, if it didn't exit on its own.
    pub error: Option<ExecError>,
}

impl StageResult {
    fn exited(program: String, exit_code: ExitCode) -> Self {
        Self {
            program,
            exit_code,
            error: None,
        }
    }

    fn failed(program: String, error: ExecError) -> Self {
        Self {
            program,
            exit_code: error.exit_code(),
            error: Some(error),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Outcome of running a graph.
///
/// `exit_code` is the last stage's code; every stage is kept in `stages`.
#[derive(Debug)]
pub struct ExecResult {
    pub exit_code: ExitCode,
    pub stages: Vec<StageResult>,
}

impl ExecResult {
    pub(crate) fn from_stages(stages: Vec<StageResult>) -> Self {
        Self {
            exit_code: stages.last().map_or(0, |s| s.exit_code),
            stages,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stage_codes(&self) -> Vec<ExitCode> {
        self.stages.iter().map(|s| s.exit_code).collect()
    }
}

/// What [`launch`] started; awaited with [`Launched::wait`].
#[derive(Debug)]
pub(crate) enum Launched {
    Process { program: String, child: Child },
    Thread { program: String, handle: JoinHandle<ExitCode> },
    Done(StageResult),
    Pipeline(Vec<Launched>),
}

impl Launched {
    pub(crate) fn pids(&self) -> Vec<u32> {
        match self {
            Launched::Process { child, .. } => vec![child.id()],
            Launched::Pipeline(stages) => stages.iter().flat_map(Launched::pids).collect(),
            Launched::Thread { .. } | Launched::Done(_) => Vec::new(),
        }
    }

    /// SIGKILL every external process. Builtin threads can't be interrupted.
    pub(crate) fn kill(&mut self) -> Result<(), ExecError> {
        let mut first_err = None;
        for pid in self.pids() {
            // not yet awaited, so the pid can't have been reused
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => debug!(pid, "killed"),
                Err(errno) => {
                    warn!(pid, %errno, "failed to kill stage");
                    first_err.get_or_insert(ExecError::Wait {
                        source: io::Error::from(errno),
                    });
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Wait for every stage, in order.
    pub(crate) fn wait(self) -> Vec<StageResult> {
        match self {
            Launched::Process { program, mut child } => vec![match child.wait() {
                Ok(status) => {
                    let code = exit_code_of(status);
                    debug!(program = %program, code, "stage exited");
                    StageResult::exited(program, code)
                }
                Err(source) => StageResult::failed(program, ExecError::Wait { source }),
            }],
            Launched::Thread { program, handle } => vec![match handle.join() {
                Ok(code) => {
                    debug!(program = %program, code, "builtin finished");
                    StageResult::exited(program, code)
                }
                Err(_) => {
                    let err = ExecError::Builtin {
                        name: program.clone(),
                        message: "panicked".into(),
                    };
                    StageResult::failed(program, err)
                }
            }],
            Launched::Done(result) => vec![result],
            Launched::Pipeline(stages) => stages.into_iter().flat_map(Launched::wait).collect(),
        }
    }
}

/// Shell state plus the overlays accumulated on the way down the graph.
pub(crate) struct Scope {
    state: Arc<ShellState>,
    overlay: Overlay,
}

impl Scope {
    pub(crate) fn root(state: Arc<ShellState>) -> Self {
        Self {
            state,
            overlay: Overlay::new(),
        }
    }
}

/// Run `runnable` to completion with the given streams.
pub(crate) fn run(
    runnable: &Runnable,
    state: &Arc<ShellState>,
    io: Io,
) -> Result<ExecResult, ExecError> {
    let launched = launch(runnable, &Scope::root(Arc::clone(state)), io, false)?;
    Ok(ExecResult::from_stages(launched.wait()))
}

/// Start `runnable` with stdout and stderr connected to fresh capture pipes.
pub(crate) fn spawn_captured(
    runnable: &Runnable,
    state: &Arc<ShellState>,
) -> Result<RunningCapture, Error> {
    let (out_reader, out_writer) = os_pipe::pipe().map_err(CaptureError::Allocate)?;
    let (err_reader, err_writer) = os_pipe::pipe().map_err(CaptureError::Allocate)?;
    let io = Io {
        stdin: Input::Inherit,
        stdout: Output::Pipe(out_writer),
        stderr: Output::Pipe(err_writer),
    };
    let launched = launch(runnable, &Scope::root(Arc::clone(state)), io, false)?;
    Ok(RunningCapture::new(launched, out_reader, err_reader))
}

/// Start every process and thread of `runnable` without waiting for any.
///
/// `io` is consumed: each endpoint ends up owned by exactly one stage, and
/// whatever a stage doesn't use is dropped before this returns.
pub(crate) fn launch(
    runnable: &Runnable,
    scope: &Scope,
    io: Io,
    in_pipeline: bool,
) -> Result<Launched, ExecError> {
    match runnable.node() {
        Node::Leaf { program, args } => launch_leaf(program, args, scope, io, in_pipeline),
        Node::Pipe { stages } => launch_pipe(stages, scope, io),
        Node::Redirect { inner, redirect } => {
            let io = apply_redirect(redirect, &scope.state.cwd(), io)?;
            launch(inner, scope, io, in_pipeline)
        }
        Node::EnvOverlay { inner, overlay } => {
            let mut merged = scope.overlay.clone();
            merged.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
            let scope = Scope {
                state: Arc::clone(&scope.state),
                overlay: merged,
            };
            launch(inner, &scope, io, in_pipeline)
        }
        Node::Subshell { inner } => {
            debug!(command = %inner, "entering subshell");
            let scope = Scope {
                state: Arc::new(scope.state.snapshot()),
                overlay: scope.overlay.clone(),
            };
            launch(inner, &scope, io, in_pipeline)
        }
    }
}

fn launch_leaf(
    program: &Program,
    args: &[String],
    scope: &Scope,
    io: Io,
    in_pipeline: bool,
) -> Result<Launched, ExecError> {
    let name = program.name();
    if let Some(cmd) = builtin::lookup(name, args) {
        // pipeline stages behave like subshells
        let state = if in_pipeline {
            Arc::new(scope.state.snapshot())
        } else {
            Arc::clone(&scope.state)
        };
        let overlay = scope.overlay.clone();
        let mut io = BuiltinIo::from(io);
        let handle = thread::Builder::new()
            .name(format!("builtin-{name}"))
            .spawn(move || {
                let ctx = BuiltinContext {
                    state: &state,
                    overlay: &overlay,
                };
                cmd.execute(&mut io, &ctx)
            })
            .map_err(|source| ExecError::Spawn {
                program: name.to_owned(),
                source,
            })?;
        return Ok(Launched::Thread {
            program: name.to_owned(),
            handle,
        });
    }

    let (vars, cwd) = scope.state.launch_view(&scope.overlay);
    let search = search_dirs(vars.get("PATH"), scope.state.fallback_path())?;
    let executable = resolve_program(name, &search, &cwd)?;
    let child = spawn_leaf(
        LeafSpawn {
            name,
            executable: &executable,
            args,
            env: render_all(&vars),
            cwd: &cwd,
        },
        io,
    )?;
    Ok(Launched::Process {
        program: name.to_owned(),
        child,
    })
}

fn launch_pipe(stages: &[Runnable], scope: &Scope, io: Io) -> Result<Launched, ExecError> {
    let Io {
        stdin,
        stdout,
        stderr,
    } = io;

    // all pipes up front, so a failure here leaves nothing running
    let mut inputs = vec![stdin];
    let mut outputs = Vec::with_capacity(stages.len());
    for _ in 1..stages.len() {
        let (reader, writer) = os_pipe::pipe().map_err(|source| ExecError::Pipe { source })?;
        outputs.push(Output::Pipe(writer));
        inputs.push(Input::Pipe(reader));
    }
    outputs.push(stdout);
    debug!(stages = stages.len(), "launching pipeline");

    let mut launched = Vec::with_capacity(stages.len());
    for ((stage, stdin), stdout) in stages.iter().zip(inputs).zip(outputs) {
        let started = stderr
            .try_clone()
            .map_err(|source| ExecError::Pipe { source })
            .and_then(|stderr| {
                let io = Io {
                    stdin,
                    stdout,
                    stderr,
                };
                launch(stage, scope, io, true)
            });
        launched.push(started.unwrap_or_else(|err| {
            debug!(stage = %stage, error = %err, "pipeline stage failed to start");
            Launched::Done(StageResult::failed(stage_label(stage), err))
        }));
    }
    Ok(Launched::Pipeline(launched))
}

fn stage_label(stage: &Runnable) -> String {
    match stage.node() {
        Node::Leaf { program, .. } => program.name().to_owned(),
        _ => stage.to_string(),
    }
}

fn apply_redirect(redirect: &Redirect, cwd: &Path, mut io: Io) -> Result<Io, ExecError> {
    let err = |source| ExecError::Redirect {
        target: redirect.target.describe(),
        source,
    };
    let file = open_target(&redirect.target, redirect.mode, cwd).map_err(err)?;
    if redirect.stream.covers_stderr() {
        io.stderr = Output::File(file.try_clone().map_err(err)?);
    }
    if redirect.stream.covers_stdout() {
        io.stdout = Output::File(file);
    }
    Ok(io)
}

/// Open a path target, or duplicate an already-open handle. The mode only
/// applies to paths; a handle keeps its own offset and flags.
fn open_target(target: &RedirectTarget, mode: RedirectMode, cwd: &Path) -> io::Result<File> {
    match target {
        RedirectTarget::Path(path) => {
            let mut options = OpenOptions::new();
            options.write(true).create(true);
            match mode {
                RedirectMode::Truncate => options.truncate(true),
                RedirectMode::Append => options.append(true),
            };
            options.open(cwd.join(path))
        }
        RedirectTarget::Handle(file) => file.try_clone(),
    }
}
