//! Startup configuration for a [`Shell`](crate::Shell).

use std::path::PathBuf;

/// Search list used when `PATH` is absent from the effective environment.
pub const DEFAULT_FALLBACK_PATH: [&str; 3] = ["/usr/local/bin", "/usr/bin", "/bin"];

/// How a shell initializes its environment and directory state.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Import the process environment at startup.
    pub inherit_process_env: bool,
    /// Mirror `cd` into the OS-level current directory of this process.
    pub sync_process_cwd: bool,
    /// Starting directory; the process current directory when `None`.
    pub initial_dir: Option<PathBuf>,
    /// Directories searched when `PATH` is unset.
    pub fallback_path: Vec<PathBuf>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            inherit_process_env: true,
            sync_process_cwd: true,
            initial_dir: None,
            fallback_path: DEFAULT_FALLBACK_PATH.iter().map(PathBuf::from).collect(),
        }
    }
}

impl ShellConfig {
    /// Configuration for an embedded shell that never changes the process
    /// current directory.
    pub fn detached(initial_dir: impl Into<PathBuf>) -> Self {
        Self {
            sync_process_cwd: false,
            initial_dir: Some(initial_dir.into()),
            ..Self::default()
        }
    }

    pub fn inherit_process_env(mut self, yes: bool) -> Self {
        self.inherit_process_env = yes;
        self
    }

    pub fn sync_process_cwd(mut self, yes: bool) -> Self {
        self.sync_process_cwd = yes;
        self
    }

    pub fn initial_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.initial_dir = Some(dir.into());
        self
    }

    pub fn fallback_path<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.fallback_path = dirs.into_iter().map(Into::into).collect();
        self
    }
}
