//! Process-wide shell state: the environment store plus directory navigation.
//!
//! All directory operations hold the directory lock for their whole
//! duration and update `PWD`/`OLDPWD` before releasing it, so concurrent
//! readers never observe a half-applied `cd`.

use std::collections::BTreeMap;
use std::env as stdenv;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::command::Overlay;
use crate::config::ShellConfig;
use crate::dirs::{DirStack, expand_tilde, normalize, probe_dir};
use crate::env::{EnvStore, EnvValue};
use crate::error::DirError;

/// Environment and directory state shared by everything a shell runs.
#[derive(Debug)]
pub struct ShellState {
    env: EnvStore,
    dirs: Mutex<DirStack>,
    sync_process_cwd: bool,
    fallback_path: Vec<PathBuf>,
}

impl ShellState {
    /// Build the ambient state described by `config`.
    pub fn new(config: &ShellConfig) -> Result<Self, DirError> {
        let process_cwd =
            stdenv::current_dir().map_err(|e| DirError::from_io(PathBuf::from("."), e))?;
        let initial = match &config.initial_dir {
            Some(dir) => normalize(&process_cwd, dir),
            None => process_cwd,
        };
        probe_dir(&initial)?;
        if config.sync_process_cwd {
            stdenv::set_current_dir(&initial).map_err(|e| DirError::from_io(initial.clone(), e))?;
        }

        let env = if config.inherit_process_env {
            EnvStore::from_process()
        } else {
            EnvStore::new()
        };

        // Keep an inherited logical PWD when it names the same directory.
        let logical = env
            .get("PWD")
            .and_then(|v| v.as_path())
            .filter(|pwd| pwd.is_absolute() && same_dir(pwd, &initial))
            .unwrap_or(initial);
        env.set("PWD", logical.clone());

        Ok(Self {
            env,
            dirs: Mutex::new(DirStack::new(logical)),
            sync_process_cwd: config.sync_process_cwd,
            fallback_path: config.fallback_path.clone(),
        })
    }

    /// A state that never touches the process current directory.
    pub fn detached(env: EnvStore, cwd: impl Into<PathBuf>) -> Self {
        let cwd = cwd.into();
        env.set("PWD", cwd.clone());
        Self {
            env,
            dirs: Mutex::new(DirStack::new(cwd)),
            sync_process_cwd: false,
            fallback_path: ShellConfig::default().fallback_path,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DirStack> {
        self.dirs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn env(&self) -> &EnvStore {
        &self.env
    }

    /// Logical current directory children are started in.
    pub fn cwd(&self) -> PathBuf {
        self.lock().cwd().to_path_buf()
    }

    /// Effective variables and current directory, read under one lock so a
    /// concurrent `cd` can't pair a new `PWD` with the old directory.
    pub(crate) fn launch_view(&self, overlay: &Overlay) -> (BTreeMap<String, EnvValue>, PathBuf) {
        let dirs = self.lock();
        (self.env.merged(overlay), dirs.cwd().to_path_buf())
    }

    pub fn fallback_path(&self) -> &[PathBuf] {
        &self.fallback_path
    }

    pub fn syncs_process_cwd(&self) -> bool {
        self.sync_process_cwd
    }

    /// Private copy for a subshell: same values, no shared storage, never
    /// mirrors `cd` into the process.
    pub fn snapshot(&self) -> ShellState {
        let dirs = self.lock().clone();
        ShellState {
            env: self.env.snapshot(),
            dirs: Mutex::new(dirs),
            sync_process_cwd: false,
            fallback_path: self.fallback_path.clone(),
        }
    }

    /// Change directory.
    ///
    /// `None` goes to `HOME`, `"-"` to `OLDPWD`; anything else has `~`
    /// expanded and is resolved against the current directory.
    pub fn cd(&self, target: Option<&str>) -> Result<PathBuf, DirError> {
        self.cd_with(target, &Overlay::new())
    }

    /// [`cd`](Self::cd) with `HOME` and `OLDPWD` looked up in `overlay`
    /// before the store.
    pub fn cd_with(&self, target: Option<&str>, overlay: &Overlay) -> Result<PathBuf, DirError> {
        let mut dirs = self.lock();
        let target = self.resolve_target(target, overlay)?;
        self.change_dir(&mut dirs, &target)
    }

    /// Logical (`PWD`) or physical (symlinks resolved) current directory.
    pub fn pwd(&self, physical: bool) -> Result<PathBuf, DirError> {
        let cwd = self.cwd();
        if physical {
            let base = if self.sync_process_cwd {
                stdenv::current_dir().map_err(|e| DirError::from_io(cwd.clone(), e))?
            } else {
                cwd
            };
            return fs::canonicalize(&base).map_err(|e| DirError::from_io(base, e));
        }
        match self.env.get("PWD").and_then(|v| v.as_path()) {
            Some(pwd) => Ok(pwd),
            None if self.sync_process_cwd => {
                stdenv::current_dir().map_err(|e| DirError::from_io(cwd, e))
            }
            None => Ok(cwd),
        }
    }

    /// Push the current directory and `cd` to `target`.
    ///
    /// The stack is left as it was if the `cd` fails.
    pub fn pushd(&self, target: &str) -> Result<PathBuf, DirError> {
        self.pushd_with(target, &Overlay::new())
    }

    /// [`pushd`](Self::pushd) with `~` expanded from `overlay` first.
    pub fn pushd_with(&self, target: &str, overlay: &Overlay) -> Result<PathBuf, DirError> {
        let mut dirs = self.lock();
        let target = self.resolve_target(Some(target), overlay)?;
        let before = dirs.cwd().to_path_buf();
        dirs.push(before);
        self.change_dir(&mut dirs, &target).inspect_err(|_| {
            dirs.pop();
        })
    }

    /// Pop the top of the stack and `cd` to it.
    ///
    /// The entry is put back if the `cd` fails.
    pub fn popd(&self) -> Result<PathBuf, DirError> {
        let mut dirs = self.lock();
        let top = dirs.pop().ok_or(DirError::EmptyStack)?;
        self.change_dir(&mut dirs, &top).inspect_err(|_| {
            dirs.push(top.clone());
        })
    }

    /// Current directory followed by the stack, most recent first.
    pub fn dirs(&self) -> Vec<PathBuf> {
        self.lock().listing()
    }

    fn path_var(&self, name: &str, overlay: &Overlay) -> Option<PathBuf> {
        overlay
            .get(name)
            .cloned()
            .or_else(|| self.env.get(name))
            .and_then(|v| v.as_path())
    }

    fn resolve_target(&self, target: Option<&str>, overlay: &Overlay) -> Result<PathBuf, DirError> {
        let home = || self.path_var("HOME", overlay);
        match target {
            None => home().ok_or(DirError::HomeNotSet),
            Some("-") => self
                .path_var("OLDPWD", overlay)
                .ok_or(DirError::OldPwdNotSet),
            Some(t) => expand_tilde(t, home()),
        }
    }

    fn change_dir(&self, dirs: &mut DirStack, target: &Path) -> Result<PathBuf, DirError> {
        let new_dir = normalize(dirs.cwd(), target);
        probe_dir(&new_dir)?;
        if self.sync_process_cwd {
            stdenv::set_current_dir(&new_dir)
                .map_err(|e| DirError::from_io(new_dir.clone(), e))?;
        }
        let old_dir = dirs.cwd().to_path_buf();
        dirs.set_cwd(new_dir.clone());
        self.env.set("OLDPWD", old_dir.clone());
        self.env.set("PWD", new_dir.clone());
        debug!(from = %old_dir.display(), to = %new_dir.display(), "changed directory");
        Ok(new_dir)
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::lock_current_dir;

    fn detached_in(dir: &Path) -> ShellState {
        ShellState::detached(EnvStore::new(), fs::canonicalize(dir).unwrap())
    }

    #[test]
    fn cd_updates_pwd_and_oldpwd() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        let state = detached_in(tmp.path());
        let start = state.cwd();

        let new_dir = state.cd(Some("sub")).unwrap();

        assert_eq!(new_dir, start.join("sub"));
        assert_eq!(state.cwd(), new_dir);
        assert_eq!(state.env().get("PWD"), Some(EnvValue::Path(new_dir.clone())));
        assert_eq!(state.env().get("OLDPWD"), Some(EnvValue::Path(start.clone())));

        // cd - goes back
        assert_eq!(state.cd(Some("-")).unwrap(), start);
    }

    #[test]
    fn cd_nonexistent_leaves_state_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let state = detached_in(tmp.path());
        let before = state.cwd();
        let pwd_before = state.env().get("PWD");

        let err = state.cd(Some("does-not-exist")).unwrap_err();

        assert!(matches!(err, DirError::NotFound(_)));
        assert_eq!(state.cwd(), before);
        assert_eq!(state.env().get("PWD"), pwd_before);
        assert!(!state.env().contains("OLDPWD"));
    }

    #[test]
    fn cd_to_file_is_not_a_directory() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("f"), "").unwrap();
        let state = detached_in(tmp.path());
        assert!(matches!(
            state.cd(Some("f")),
            Err(DirError::NotADirectory(_))
        ));
    }

    #[test]
    fn cd_without_target_uses_home() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        let state = detached_in(tmp.path());

        assert!(matches!(state.cd(None), Err(DirError::HomeNotSet)));

        let home_path = fs::canonicalize(home.path()).unwrap();
        state.env().set("HOME", home_path.clone());
        assert_eq!(state.cd(None).unwrap(), home_path);
        assert_eq!(state.cd(Some("~")).unwrap(), home_path);
    }

    #[test]
    fn cd_with_overlay_reads_home_and_oldpwd_from_it() {
        let tmp = tempfile::tempdir().unwrap();
        let state = detached_in(tmp.path());
        let start = state.cwd();
        fs::create_dir(start.join("home")).unwrap();
        fs::create_dir(start.join("prev")).unwrap();
        state.env().set("HOME", PathBuf::from("/"));

        let overlay = Overlay::from([
            ("HOME".to_owned(), EnvValue::from(start.join("home"))),
            ("OLDPWD".to_owned(), EnvValue::from(start.join("prev"))),
        ]);
        assert_eq!(state.cd_with(None, &overlay).unwrap(), start.join("home"));
        assert_eq!(state.cd_with(Some("-"), &overlay).unwrap(), start.join("prev"));
        assert_eq!(
            state.pushd_with("~", &overlay).unwrap(),
            start.join("home")
        );
        assert_eq!(state.env().get("HOME"), Some(EnvValue::from(PathBuf::from("/"))));
    }

    #[test]
    fn launch_view_pairs_pwd_with_cwd() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        let state = detached_in(tmp.path());
        state.cd(Some("sub")).unwrap();

        let overlay = Overlay::from([("EXTRA".to_owned(), EnvValue::from("1"))]);
        let (vars, cwd) = state.launch_view(&overlay);

        assert_eq!(vars.get("PWD"), Some(&EnvValue::Path(cwd.clone())));
        assert_eq!(vars.get("EXTRA"), Some(&EnvValue::from("1")));
        assert_eq!(cwd, state.cwd());
    }

    #[test]
    fn cd_dash_without_oldpwd_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let state = detached_in(tmp.path());
        assert!(matches!(state.cd(Some("-")), Err(DirError::OldPwdNotSet)));
    }

    #[test]
    fn pushd_popd_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("a")).unwrap();
        let state = detached_in(tmp.path());
        let start = state.cwd();

        state.pushd("a").unwrap();
        assert_eq!(state.dirs(), vec![start.join("a"), start.clone()]);

        assert_eq!(state.popd().unwrap(), start);
        assert_eq!(state.cwd(), start);
        assert_eq!(state.dirs(), vec![start]);
    }

    #[test]
    fn failed_pushd_does_not_grow_stack() {
        let tmp = tempfile::tempdir().unwrap();
        let state = detached_in(tmp.path());
        assert!(state.pushd("missing").is_err());
        assert_eq!(state.dirs().len(), 1);
    }

    #[test]
    fn popd_empty_stack() {
        let tmp = tempfile::tempdir().unwrap();
        let state = detached_in(tmp.path());
        assert!(matches!(state.popd(), Err(DirError::EmptyStack)));
    }

    #[test]
    fn failed_popd_restores_entry() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("gone")).unwrap();
        let state = detached_in(tmp.path());
        let start = state.cwd();

        state.pushd("gone").unwrap();
        state.cd(Some("..")).unwrap();
        // leave a stack top that points at a directory removed below
        fs::create_dir(start.join("gone/inner")).unwrap();
        state.cd(Some("gone/inner")).unwrap();
        state.pushd("..").unwrap();
        fs::remove_dir(start.join("gone/inner")).unwrap();

        let before = state.dirs();
        assert!(state.popd().is_err());
        assert_eq!(state.dirs(), before);
    }

    #[test]
    fn pwd_logical_vs_physical() {
        let tmp = tempfile::tempdir().unwrap();
        let real = fs::canonicalize(tmp.path()).unwrap();
        fs::create_dir(real.join("target")).unwrap();
        std::os::unix::fs::symlink(real.join("target"), real.join("link")).unwrap();
        let state = detached_in(&real);

        state.cd(Some("link")).unwrap();

        assert_eq!(state.pwd(false).unwrap(), real.join("link"));
        assert_eq!(state.pwd(true).unwrap(), real.join("target"));

        state.env().delete("PWD");
        assert_eq!(state.pwd(false).unwrap(), real.join("link"));
    }

    #[test]
    fn snapshot_isolated_from_original() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("inner")).unwrap();
        let state = detached_in(tmp.path());
        let start = state.cwd();

        let copy = state.snapshot();
        copy.cd(Some("inner")).unwrap();
        copy.env().set("ONLY_IN_COPY", "1");

        assert_eq!(state.cwd(), start);
        assert!(!state.env().contains("ONLY_IN_COPY"));
        assert!(!copy.syncs_process_cwd());
    }

    #[test]
    fn synced_state_moves_process_cwd() {
        let _lock = lock_current_dir();
        let orig = stdenv::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let real = fs::canonicalize(tmp.path()).unwrap();
        fs::create_dir(real.join("x")).unwrap();

        let config = ShellConfig::default()
            .inherit_process_env(false)
            .initial_dir(&real);
        let state = ShellState::new(&config).unwrap();
        state.cd(Some("x")).unwrap();
        let observed = fs::canonicalize(stdenv::current_dir().unwrap()).unwrap();

        stdenv::set_current_dir(&orig).expect("failed to restore cwd");

        assert_eq!(observed, real.join("x"));
    }
}
