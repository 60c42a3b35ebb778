use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use tracing::debug;

use crate::capture::{CapturedResult, RunningCapture};
use crate::command::{ExitCode, Runnable};
use crate::config::ShellConfig;
use crate::env::EnvStore;
use crate::error::{DirError, Error, Result};
use crate::exec::{self, ExecResult};
use crate::hooks::HookRegistry;
use crate::io_adapters::Io;
use crate::state::ShellState;

/// The surface a front end drives: runs command graphs against one shared
/// environment and directory state, and owns the hook registry.
///
/// Every method takes `&self`; a `Shell` can be shared between threads.
///
/// Example
/// ```no_run
/// use ship_shell::{Shell, ShellConfig, program};
///
/// let sh = Shell::new(ShellConfig::default())?;
/// let result = sh.run(&program("true").call(Vec::<String>::new()))?;
/// assert_eq!(result.exit_code, 0);
/// # Ok::<(), ship_shell::Error>(())
/// ```
#[derive(Debug)]
pub struct Shell {
    state: Arc<ShellState>,
    hooks: HookRegistry,
    last_exit_code: AtomicI32,
}

impl Shell {
    pub fn new(config: ShellConfig) -> std::result::Result<Self, DirError> {
        Ok(Self::with_state(ShellState::new(&config)?))
    }

    pub fn with_state(state: ShellState) -> Self {
        Self {
            state: Arc::new(state),
            hooks: HookRegistry::new(),
            last_exit_code: AtomicI32::new(0),
        }
    }

    pub fn state(&self) -> &ShellState {
        &self.state
    }

    pub fn env(&self) -> &EnvStore {
        self.state.env()
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Exit code of the most recent top-level run, including runs that
    /// failed before anything started.
    pub fn last_exit_code(&self) -> ExitCode {
        self.last_exit_code.load(Ordering::Relaxed)
    }

    fn record<T>(&self, outcome: Result<T>, code: impl Fn(&T) -> ExitCode) -> Result<T> {
        let exit_code = match &outcome {
            Ok(value) => code(value),
            Err(Error::Exec(e)) => e.exit_code(),
            Err(_) => 1,
        };
        self.last_exit_code.store(exit_code, Ordering::Relaxed);
        outcome
    }

    /// Run with the streams of this process.
    pub fn run(&self, runnable: &Runnable) -> Result<ExecResult> {
        debug!(command = %runnable, "run");
        let outcome = exec::run(runnable, &self.state, Io::inherit()).map_err(Error::from);
        self.record(outcome, |r| r.exit_code)
    }

    /// Run to completion with stdout and stderr captured.
    pub fn run_captured(&self, runnable: &Runnable) -> Result<CapturedResult> {
        debug!(command = %runnable, "run captured");
        let outcome = self.spawn_captured(runnable).and_then(RunningCapture::finish);
        self.record(outcome, CapturedResult::exit_code)
    }

    /// Start with stdout and stderr captured and return without waiting.
    pub fn spawn_captured(&self, runnable: &Runnable) -> Result<RunningCapture> {
        exec::spawn_captured(runnable, &self.state)
    }

    /// Captured stdout of `runnable`; its stderr is discarded.
    pub fn get_stdout(&self, runnable: &Runnable) -> Result<String> {
        Ok(self.run_captured(runnable)?.read_stdout()?)
    }

    /// Captured stderr of `runnable`; its stdout is discarded.
    pub fn get_stderr(&self, runnable: &Runnable) -> Result<String> {
        Ok(self.run_captured(runnable)?.read_stderr()?)
    }

    pub fn cd(&self, target: Option<&str>) -> std::result::Result<PathBuf, DirError> {
        self.state.cd(target)
    }

    pub fn pwd(&self, physical: bool) -> std::result::Result<PathBuf, DirError> {
        self.state.pwd(physical)
    }

    pub fn pushd(&self, target: &str) -> std::result::Result<PathBuf, DirError> {
        self.state.pushd(target)
    }

    pub fn popd(&self) -> std::result::Result<PathBuf, DirError> {
        self.state.popd()
    }

    pub fn dirs(&self) -> Vec<PathBuf> {
        self.state.dirs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::program;
    use crate::error::ExecError;
    use std::fs;

    fn detached_shell() -> (tempfile::TempDir, Shell) {
        let tmp = tempfile::tempdir().unwrap();
        let env = EnvStore::new();
        env.set("PATH", "/bin:/usr/bin");
        let state = ShellState::detached(env, fs::canonicalize(tmp.path()).unwrap());
        (tmp, Shell::with_state(state))
    }

    #[test]
    fn last_exit_code_tracks_every_top_level_run() {
        let (_tmp, sh) = detached_shell();
        let exit = |code: &str| program("sh").call(vec!["-c".to_owned(), format!("exit {code}")]);

        sh.run_captured(&exit("4")).unwrap();
        assert_eq!(sh.last_exit_code(), 4);

        let err = sh.run(&program("no-such-program-xyz").call(Vec::<String>::new()));
        assert!(matches!(err, Err(Error::Exec(ExecError::Resolve(_)))));
        assert_eq!(sh.last_exit_code(), 127);

        sh.run_captured(&exit("0")).unwrap();
        assert_eq!(sh.last_exit_code(), 0);
    }

    #[test]
    fn get_stdout_and_get_stderr() {
        let (_tmp, sh) = detached_shell();
        let r = program("sh").call(["-c", "printf out; printf err >&2"]);
        assert_eq!(sh.get_stdout(&r).unwrap(), "out");
        assert_eq!(sh.get_stderr(&r).unwrap(), "err");
    }

    #[test]
    fn directory_accessors_share_state_with_builtins() {
        let (tmp, sh) = detached_shell();
        fs::create_dir(tmp.path().join("d")).unwrap();
        let start = sh.pwd(false).unwrap();

        sh.pushd("d").unwrap();
        let pwd = program("pwd").call(Vec::<String>::new());
        assert_eq!(
            sh.get_stdout(&pwd).unwrap(),
            format!("{}\n", start.join("d").display())
        );

        sh.run_captured(&program("popd").call(Vec::<String>::new())).unwrap();
        assert_eq!(sh.dirs(), vec![start]);
    }
}
