use std::ffi::OsString;
use std::fs;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};

use nix::unistd::{AccessFlags, access};
use tracing::debug;

use crate::command::ExitCode;
use crate::env::EnvValue;
use crate::error::{ExecError, ResolveError};
use crate::io_adapters::Io;

/// Directories to search for a program, in order.
///
/// `path_var` is the effective `PATH`; when it is unset `fallback` is used.
pub(crate) fn search_dirs(
    path_var: Option<&EnvValue>,
    fallback: &[PathBuf],
) -> Result<Vec<PathBuf>, ResolveError> {
    match path_var {
        None => Ok(fallback.to_vec()),
        Some(value) => value.as_path_list().ok_or_else(|| {
            ResolveError::InvalidPath(format!(
                "PATH must be a string, a path or a list of them, got {:?}",
                value.kind()
            ))
        }),
    }
}

/// Resolve a command name the way a POSIX shell does.
///
/// Behavior:
/// - A name containing `/` is a literal path, relative to `cwd` unless
///   absolute. It must exist and be executable by this process.
/// - Otherwise every directory of `search` is tried in order and the first
///   regular, executable file wins. Empty entries are skipped and relative
///   entries are taken relative to `cwd`.
///
/// The returned path is always absolute.
pub(crate) fn resolve_program(
    name: &str,
    search: &[PathBuf],
    cwd: &Path,
) -> Result<PathBuf, ResolveError> {
    if name.contains('/') {
        let path = cwd.join(name);
        let meta = fs::metadata(&path).map_err(|_| ResolveError::NoSuchFile(name.to_owned()))?;
        if meta.is_dir() || !may_execute(&path) {
            return Err(ResolveError::PermissionDenied(name.to_owned()));
        }
        return Ok(path);
    }
    if name.is_empty() {
        return Err(ResolveError::NotFound(name.to_owned()));
    }
    find_in_path(name, search, cwd)
        .next()
        .ok_or_else(|| ResolveError::NotFound(name.to_owned()))
}

/// Every match for `name` on the search path, in search order.
pub(crate) fn find_in_path<'a>(
    name: &'a str,
    search: &'a [PathBuf],
    cwd: &'a Path,
) -> impl Iterator<Item = PathBuf> + 'a {
    search
        .iter()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(move |dir| cwd.join(dir).join(name))
        .filter(|candidate| is_executable_file(candidate))
}

fn is_executable_file(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) => meta.is_file() && may_execute(path),
        Err(_) => false,
    }
}

/// `access(2)` with `X_OK`: honors owner, group and other bits for this
/// process's credentials.
fn may_execute(path: &Path) -> bool {
    access(path, AccessFlags::X_OK).is_ok()
}

/// Everything needed to start one external leaf.
pub(crate) struct LeafSpawn<'a> {
    pub name: &'a str,
    pub executable: &'a Path,
    pub args: &'a [String],
    pub env: Vec<(String, OsString)>,
    pub cwd: &'a Path,
}

/// Start the process. The child sees `name` as `argv[0]` and exactly the
/// rendered environment, nothing inherited.
///
/// `io` is consumed here so the parent's copies of the stage's descriptors
/// are closed as soon as the child owns them.
pub(crate) fn spawn_leaf(leaf: LeafSpawn<'_>, io: Io) -> Result<Child, ExecError> {
    let mut cmd = Command::new(leaf.executable);
    cmd.arg0(leaf.name)
        .args(leaf.args)
        .env_clear()
        .envs(leaf.env)
        .current_dir(leaf.cwd)
        .stdin(io.stdin.into_stdio())
        .stdout(io.stdout.into_stdio())
        .stderr(io.stderr.into_stdio());
    let child = cmd.spawn().map_err(|source| ExecError::Spawn {
        program: leaf.name.to_owned(),
        source,
    })?;
    debug!(
        program = leaf.name,
        path = %leaf.executable.display(),
        pid = child.id(),
        "spawned"
    );
    Ok(child)
}

/// Shell-style exit code: the process's own code, or 128 + signal number.
pub(crate) fn exit_code_of(status: ExitStatus) -> ExitCode {
    if let Some(code) = status.code() {
        code
    } else if let Some(signal) = status.signal() {
        128 + signal
    } else {
        255
    }
}
