use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow, bail};
use argh::{EarlyExit, FromArgs};

use crate::command::{ExitCode, Overlay};
use crate::env::EnvValue;
use crate::external::{find_in_path, resolve_program, search_dirs};
use crate::io_adapters::BuiltinIo;
use crate::state::ShellState;

/// State a builtin executes against: the scope's shell state plus the
/// overlays enclosing it.
pub(crate) struct BuiltinContext<'a> {
    pub state: &'a ShellState,
    pub overlay: &'a Overlay,
}

impl BuiltinContext<'_> {
    fn effective_var(&self, name: &str) -> Option<EnvValue> {
        self.overlay
            .get(name)
            .cloned()
            .or_else(|| self.state.env().get(name))
    }
}

/// Built-in commands known to the shell at compile time.
///
/// Builtins are parsed using the [`argh`] crate (`FromArgs`) and executed
/// in-process without spawning a child process.
pub(crate) trait BuiltinCommand: Sized + FromArgs + Send + 'static {
    /// Canonical name of the command, e.g. "cd".
    fn name() -> &'static str;

    /// Rewrite raw arguments before `argh` sees them.
    fn normalize_args<'a>(args: &[&'a str]) -> Vec<&'a str> {
        args.to_vec()
    }

    /// Executes the command using provided IO streams and shell state.
    ///
    /// Return value should follow shell conventions: 0 for success, non-zero for error.
    fn execute(self, io: &mut BuiltinIo, ctx: &BuiltinContext<'_>) -> Result<ExitCode>;
}

/// A parsed builtin ready to run.
pub(crate) trait ExecutableBuiltin: Send {
    fn execute(self: Box<Self>, io: &mut BuiltinIo, ctx: &BuiltinContext<'_>) -> ExitCode;
}

impl<T: BuiltinCommand> ExecutableBuiltin for T {
    fn execute(self: Box<Self>, io: &mut BuiltinIo, ctx: &BuiltinContext<'_>) -> ExitCode {
        let code = match T::execute(*self, io, ctx) {
            Ok(x) => x,
            Err(e) => {
                let _ = writeln!(io.stderr, "{}: {:#}", T::name(), e);
                1
            }
        };
        let _ = io.stdout.flush();
        code
    }
}

struct InvalidArgs {
    output: String,
    is_error: bool,
}

impl ExecutableBuiltin for InvalidArgs {
    fn execute(self: Box<Self>, io: &mut BuiltinIo, _ctx: &BuiltinContext<'_>) -> ExitCode {
        if self.is_error {
            let _ = writeln!(io.stderr, "{}", self.output);
            1
        } else {
            let _ = writeln!(io.stdout, "{}", self.output);
            0
        }
    }
}

/// Creates builtins by name.
pub(crate) trait CommandFactory: Sync {
    fn name(&self) -> &'static str;

    fn try_create(&self, name: &str, args: &[&str]) -> Option<Box<dyn ExecutableBuiltin>>;
}

pub(crate) struct Factory<T>(PhantomData<fn() -> T>);

impl<T> Factory<T> {
    const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T: BuiltinCommand> CommandFactory for Factory<T> {
    fn name(&self) -> &'static str {
        T::name()
    }

    fn try_create(&self, name: &str, args: &[&str]) -> Option<Box<dyn ExecutableBuiltin>> {
        if name != T::name() {
            return None;
        }
        Some(match T::from_args(&[name], &T::normalize_args(args)) {
            Ok(cmd) => Box::new(cmd),
            Err(EarlyExit { output, status }) => Box::new(InvalidArgs {
                output,
                is_error: status.is_err(),
            }),
        })
    }
}

static BUILTINS: &[&dyn CommandFactory] = &[
    &Factory::<Cd>::new(),
    &Factory::<Pwd>::new(),
    &Factory::<Pushd>::new(),
    &Factory::<Popd>::new(),
    &Factory::<Dirs>::new(),
    &Factory::<Which>::new(),
    &Factory::<Export>::new(),
    &Factory::<Unset>::new(),
];

pub(crate) fn is_builtin(name: &str) -> bool {
    BUILTINS.iter().any(|f| f.name() == name)
}

/// Parse a builtin invocation, or `None` when `name` is not a builtin.
pub(crate) fn lookup(name: &str, args: &[String]) -> Option<Box<dyn ExecutableBuiltin>> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    BUILTINS.iter().find_map(|f| f.try_create(name, &args))
}

fn write_dirs(out: &mut dyn Write, dirs: &[PathBuf]) -> Result<()> {
    let line = dirs
        .iter()
        .map(|d| d.display().to_string())
        .collect::<Vec<_>>()
        .join(" ");
    writeln!(out, "{line}")?;
    Ok(())
}

#[derive(FromArgs)]
/// Change the current directory.
/// Without a target, changes to $HOME; `cd -` returns to $OLDPWD.
pub struct Cd {
    #[argh(positional)]
    /// directory to switch to; absolute, relative, `~`-prefixed or `-`.
    pub target: Option<String>,
}

impl BuiltinCommand for Cd {
    fn name() -> &'static str {
        "cd"
    }

    fn normalize_args<'a>(args: &[&'a str]) -> Vec<&'a str> {
        // argh would take a bare `-` for an unknown flag
        match args {
            ["-"] => vec!["--", "-"],
            _ => args.to_vec(),
        }
    }

    fn execute(self, io: &mut BuiltinIo, ctx: &BuiltinContext<'_>) -> Result<ExitCode> {
        let target = self.target.as_deref().filter(|t| !t.is_empty());
        let new_dir = ctx.state.cd_with(target, ctx.overlay)?;
        if target == Some("-") {
            writeln!(io.stdout, "{}", new_dir.display())?;
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Print the current working directory to standard output.
pub struct Pwd {
    #[argh(switch, short = 'P')]
    /// print the physical directory, with symlinks resolved.
    pub physical: bool,
}

impl BuiltinCommand for Pwd {
    fn name() -> &'static str {
        "pwd"
    }

    fn execute(self, io: &mut BuiltinIo, ctx: &BuiltinContext<'_>) -> Result<ExitCode> {
        writeln!(io.stdout, "{}", ctx.state.pwd(self.physical)?.display())?;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Push the current directory onto the stack and change to a new one.
pub struct Pushd {
    #[argh(positional)]
    /// directory to switch to.
    pub target: String,
}

impl BuiltinCommand for Pushd {
    fn name() -> &'static str {
        "pushd"
    }

    fn execute(self, io: &mut BuiltinIo, ctx: &BuiltinContext<'_>) -> Result<ExitCode> {
        ctx.state.pushd_with(&self.target, ctx.overlay)?;
        write_dirs(&mut io.stdout, &ctx.state.dirs())?;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Pop the top of the directory stack and change to it.
pub struct Popd {}

impl BuiltinCommand for Popd {
    fn name() -> &'static str {
        "popd"
    }

    fn execute(self, io: &mut BuiltinIo, ctx: &BuiltinContext<'_>) -> Result<ExitCode> {
        ctx.state.popd()?;
        write_dirs(&mut io.stdout, &ctx.state.dirs())?;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Print the current directory followed by the directory stack.
pub struct Dirs {}

impl BuiltinCommand for Dirs {
    fn name() -> &'static str {
        "dirs"
    }

    fn execute(self, io: &mut BuiltinIo, ctx: &BuiltinContext<'_>) -> Result<ExitCode> {
        write_dirs(&mut io.stdout, &ctx.state.dirs())?;
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Locate commands: builtins first, then the effective PATH.
pub struct Which {
    #[argh(switch, short = 'a')]
    /// list every match instead of the first one.
    pub all: bool,

    #[argh(switch, short = 's')]
    /// print nothing, only set the exit code.
    pub silent: bool,

    #[argh(positional, greedy)]
    /// command names to look up.
    pub names: Vec<String>,
}

impl BuiltinCommand for Which {
    fn name() -> &'static str {
        "which"
    }

    fn execute(self, io: &mut BuiltinIo, ctx: &BuiltinContext<'_>) -> Result<ExitCode> {
        if self.names.is_empty() {
            bail!("no command names given");
        }
        let path = ctx.effective_var("PATH");
        let search = search_dirs(path.as_ref(), ctx.state.fallback_path())?;
        let cwd = ctx.state.cwd();

        let mut all_found = true;
        for name in &self.names {
            let mut found: Vec<String> = Vec::new();
            if is_builtin(name) {
                found.push(format!("{name}: shell built-in command"));
            }
            if found.is_empty() || self.all {
                let matches: Vec<PathBuf> = if name.contains('/') {
                    literal_match(&cwd, name).into_iter().collect()
                } else {
                    find_in_path(name, &search, &cwd).collect()
                };
                let limit = if self.all { usize::MAX } else { 1 };
                found.extend(
                    matches
                        .iter()
                        .take(limit)
                        .map(|p| p.display().to_string()),
                );
            }
            if found.is_empty() {
                all_found = false;
                if !self.silent {
                    writeln!(io.stderr, "which: no {name} in PATH")?;
                }
                continue;
            }
            if !self.silent {
                for line in &found {
                    writeln!(io.stdout, "{line}")?;
                }
            }
        }
        Ok(if all_found { 0 } else { 1 })
    }
}

fn literal_match(cwd: &Path, name: &str) -> Option<PathBuf> {
    resolve_program(name, &[], cwd).ok()
}

#[derive(FromArgs)]
/// Set environment variables in the current scope.
pub struct Export {
    #[argh(positional, greedy)]
    /// assignments of the form NAME=VALUE, or NAME to check it is set.
    pub assignments: Vec<String>,
}

impl BuiltinCommand for Export {
    fn name() -> &'static str {
        "export"
    }

    fn execute(self, _io: &mut BuiltinIo, ctx: &BuiltinContext<'_>) -> Result<ExitCode> {
        let env = ctx.state.env();
        for assignment in &self.assignments {
            match assignment.split_once('=') {
                Some(("", _)) => bail!("`{assignment}`: not a valid identifier"),
                Some((name, value)) => env.set(name, EnvValue::from_os(name, value.as_ref())),
                None if ctx.effective_var(assignment).is_some() => {}
                None => return Err(anyhow!("{assignment}: not set")),
            }
        }
        Ok(0)
    }
}

#[derive(FromArgs)]
/// Remove environment variables; unknown names are ignored.
pub struct Unset {
    #[argh(positional, greedy)]
    /// variable names to remove.
    pub names: Vec<String>,
}

impl BuiltinCommand for Unset {
    fn name() -> &'static str {
        "unset"
    }

    fn execute(self, _io: &mut BuiltinIo, ctx: &BuiltinContext<'_>) -> Result<ExitCode> {
        for name in &self.names {
            ctx.state.env().delete(name);
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvStore;
    use std::fs;

    fn detached(dir: &Path) -> ShellState {
        ShellState::detached(EnvStore::new(), fs::canonicalize(dir).unwrap())
    }

    fn run(state: &ShellState, name: &str, args: &[&str]) -> (ExitCode, String, String) {
        run_with(state, &Overlay::new(), name, args)
    }

    fn run_with(
        state: &ShellState,
        overlay: &Overlay,
        name: &str,
        args: &[&str],
    ) -> (ExitCode, String, String) {
        let ctx = BuiltinContext { state, overlay };
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let cmd = lookup(name, &args).expect("not a builtin");
        let (mut io, out, err) = BuiltinIo::memory();
        let code = cmd.execute(&mut io, &ctx);
        (code, out.contents(), err.contents())
    }

    #[test]
    fn test_pwd_prints_current_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let state = detached(tmp.path());
        let (code, out, _) = run(&state, "pwd", &[]);
        assert_eq!(code, 0);
        assert_eq!(out, format!("{}\n", state.cwd().display()));
    }

    #[test]
    fn test_cd_changes_directory_and_dash_prints_it() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        let state = detached(tmp.path());
        let start = state.cwd();

        let (code, out, _) = run(&state, "cd", &["sub"]);
        assert_eq!(code, 0);
        assert!(out.is_empty());
        assert_eq!(state.cwd(), start.join("sub"));

        let (code, out, _) = run(&state, "cd", &["-"]);
        assert_eq!(code, 0);
        assert_eq!(out, format!("{}\n", start.display()));
        assert_eq!(state.cwd(), start);
    }

    #[test]
    fn test_cd_failure_reports_on_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let state = detached(tmp.path());
        let (code, _, err) = run(&state, "cd", &["nope"]);
        assert_eq!(code, 1);
        assert!(err.starts_with("cd: "), "{err}");
        assert!(err.contains("No such file or directory"), "{err}");
    }

    #[test]
    fn test_pushd_popd_print_stack() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("a")).unwrap();
        let state = detached(tmp.path());
        let start = state.cwd();

        let (code, out, _) = run(&state, "pushd", &["a"]);
        assert_eq!(code, 0);
        assert_eq!(
            out,
            format!("{} {}\n", start.join("a").display(), start.display())
        );

        let (_, out, _) = run(&state, "dirs", &[]);
        assert_eq!(
            out,
            format!("{} {}\n", start.join("a").display(), start.display())
        );

        let (code, out, _) = run(&state, "popd", &[]);
        assert_eq!(code, 0);
        assert_eq!(out, format!("{}\n", start.display()));

        let (code, _, err) = run(&state, "popd", &[]);
        assert_eq!(code, 1);
        assert_eq!(err, "popd: directory stack empty\n");
    }

    #[test]
    fn test_bad_arguments_exit_one() {
        let tmp = tempfile::tempdir().unwrap();
        let state = detached(tmp.path());
        let (code, _, err) = run(&state, "pwd", &["--bogus"]);
        assert_eq!(code, 1);
        assert!(!err.is_empty());

        let (code, out, _) = run(&state, "pwd", &["--help"]);
        assert_eq!(code, 0);
        assert!(out.contains("Usage"), "{out}");
    }

    #[test]
    fn test_which_prefers_builtins_and_searches_path() {
        let tmp = tempfile::tempdir().unwrap();
        let state = detached(tmp.path());
        state.env().set("PATH", "/bin:/usr/bin");

        let (code, out, _) = run(&state, "which", &["cd"]);
        assert_eq!(code, 0);
        assert_eq!(out, "cd: shell built-in command\n");

        let (code, out, _) = run(&state, "which", &["sh"]);
        assert_eq!(code, 0);
        assert!(out.trim_end().ends_with("/sh"), "{out}");

        let (code, out, err) = run(&state, "which", &["-s", "definitely-not-a-command"]);
        assert_eq!(code, 1);
        assert!(out.is_empty() && err.is_empty());
    }

    #[test]
    fn test_export_and_unset() {
        let tmp = tempfile::tempdir().unwrap();
        let state = detached(tmp.path());

        let (code, _, _) = run(&state, "export", &["GREETING=hi", "MANPATH=/a:/b"]);
        assert_eq!(code, 0);
        assert_eq!(state.env().get("GREETING"), Some(EnvValue::from("hi")));
        assert_eq!(
            state.env().get("MANPATH"),
            Some(EnvValue::List(vec![
                EnvValue::from(PathBuf::from("/a")),
                EnvValue::from(PathBuf::from("/b")),
            ]))
        );

        let (code, _, _) = run(&state, "unset", &["GREETING", "NEVER_SET"]);
        assert_eq!(code, 0);
        assert!(!state.env().contains("GREETING"));

        let (code, _, err) = run(&state, "export", &["NEVER_SET"]);
        assert_eq!(code, 1);
        assert_eq!(err, "export: NEVER_SET: not set\n");
    }

    #[test]
    fn test_builtins_see_enclosing_overlay() {
        let tmp = tempfile::tempdir().unwrap();
        let state = detached(tmp.path());
        let start = state.cwd();
        fs::create_dir(start.join("home")).unwrap();
        state.env().set("HOME", PathBuf::from("/"));
        let overlay = Overlay::from([
            ("HOME".to_owned(), EnvValue::from(start.join("home"))),
            ("ONLY_HERE".to_owned(), EnvValue::from("1")),
        ]);

        let (code, _, err) = run_with(&state, &overlay, "cd", &[]);
        assert_eq!(code, 0, "{err}");
        assert_eq!(state.cwd(), start.join("home"));

        let (code, _, _) = run_with(&state, &overlay, "export", &["ONLY_HERE"]);
        assert_eq!(code, 0);
        assert!(!state.env().contains("ONLY_HERE"));
    }

    #[test]
    fn test_which_resolves_relative_path_entries_against_cwd() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let state = detached(tmp.path());
        let tool = state.cwd().join("bin/tool");
        fs::create_dir(state.cwd().join("bin")).unwrap();
        fs::write(&tool, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        state.env().set("PATH", "bin");

        let (code, out, _) = run(&state, "which", &["tool"]);
        assert_eq!(code, 0);
        assert_eq!(out, format!("{}\n", tool.display()));
    }

    #[test]
    fn test_lookup_ignores_unknown_names() {
        assert!(lookup("ls", &[]).is_none());
        assert!(is_builtin("pushd"));
        assert!(!is_builtin("echo"));
    }
}
