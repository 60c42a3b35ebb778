//! Directory stack and path helpers for `cd`/`pushd`/`popd`.

use std::fs;
use std::path::{Component, Path, PathBuf};

use nix::errno::Errno;
use nix::unistd::{AccessFlags, access};

use crate::error::DirError;

/// Logical current directory plus the `pushd` stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirStack {
    cwd: PathBuf,
    // top of the stack is the last element
    stack: Vec<PathBuf>,
}

impl DirStack {
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            cwd,
            stack: Vec::new(),
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub(crate) fn set_cwd(&mut self, cwd: PathBuf) {
        self.cwd = cwd;
    }

    pub(crate) fn push(&mut self, dir: PathBuf) {
        self.stack.push(dir);
    }

    pub(crate) fn pop(&mut self) -> Option<PathBuf> {
        self.stack.pop()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Current directory followed by the stack, most recent first.
    pub fn listing(&self) -> Vec<PathBuf> {
        std::iter::once(self.cwd.clone())
            .chain(self.stack.iter().rev().cloned())
            .collect()
    }
}

/// Expand a leading `~` or `~/` using `home`.
///
/// `~user` forms are left untouched.
pub fn expand_tilde(target: &str, home: Option<PathBuf>) -> Result<PathBuf, DirError> {
    if target == "~" {
        return home.ok_or(DirError::HomeNotSet);
    }
    if let Some(rest) = target.strip_prefix("~/") {
        return home.map(|h| h.join(rest)).ok_or(DirError::HomeNotSet);
    }
    Ok(PathBuf::from(target))
}

/// Join `target` onto `base` and fold `.` and `..` lexically.
///
/// This is the logical view a shell keeps in `PWD`: `..` removes the
/// previous component even when that component was reached through a symlink.
pub fn normalize(base: &Path, target: &Path) -> PathBuf {
    let joined = if target.is_absolute() {
        target.to_path_buf()
    } else {
        base.join(target)
    };
    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(Component::RootDir.as_os_str());
    }
    out
}

/// Check that `path` can become the current directory.
pub fn probe_dir(path: &Path) -> Result<(), DirError> {
    let meta = fs::metadata(path).map_err(|e| DirError::from_io(path.to_path_buf(), e))?;
    if !meta.is_dir() {
        return Err(DirError::NotADirectory(path.to_path_buf()));
    }
    match access(path, AccessFlags::X_OK) {
        Ok(()) => Ok(()),
        Err(Errno::EACCES) => Err(DirError::PermissionDenied(path.to_path_buf())),
        Err(errno) => Err(DirError::from_io(
            path.to_path_buf(),
            std::io::Error::from(errno),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_dots() {
        let base = Path::new("/home/user/src");
        assert_eq!(normalize(base, Path::new("..")), PathBuf::from("/home/user"));
        assert_eq!(
            normalize(base, Path::new("./a/../b")),
            PathBuf::from("/home/user/src/b")
        );
        assert_eq!(normalize(base, Path::new("/etc/./x/..")), PathBuf::from("/etc"));
        assert_eq!(normalize(Path::new("/"), Path::new("../..")), PathBuf::from("/"));
    }

    #[test]
    fn tilde_expansion() {
        let home = Some(PathBuf::from("/home/me"));
        assert_eq!(expand_tilde("~", home.clone()).unwrap(), PathBuf::from("/home/me"));
        assert_eq!(
            expand_tilde("~/docs", home.clone()).unwrap(),
            PathBuf::from("/home/me/docs")
        );
        assert_eq!(expand_tilde("~bob", home).unwrap(), PathBuf::from("~bob"));
        assert!(matches!(expand_tilde("~", None), Err(DirError::HomeNotSet)));
    }

    #[test]
    fn listing_is_cwd_then_most_recent_first() {
        let mut dirs = DirStack::new(PathBuf::from("/c"));
        dirs.push(PathBuf::from("/a"));
        dirs.push(PathBuf::from("/b"));
        assert_eq!(
            dirs.listing(),
            vec![
                PathBuf::from("/c"),
                PathBuf::from("/b"),
                PathBuf::from("/a")
            ]
        );
        assert_eq!(dirs.depth(), 2);
    }

    #[test]
    fn probe_classifies_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("file");
        fs::write(&file, "x").unwrap();

        assert!(probe_dir(tmp.path()).is_ok());
        assert!(matches!(probe_dir(&file), Err(DirError::NotADirectory(_))));
        assert!(matches!(
            probe_dir(&tmp.path().join("missing")),
            Err(DirError::NotFound(_))
        ));
    }
}
