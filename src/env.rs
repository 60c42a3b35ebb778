//! Typed, synchronized environment store.
//!
//! Variables hold an [`EnvValue`] rather than a plain string. A value is only
//! turned into a string when it is handed to a child process, following one
//! rule per variant:
//!
//! | variant | rendering |
//! |---|---|
//! | `Str`  | as-is |
//! | `Int`  | decimal |
//! | `Bool` | `"1"` / `"0"` |
//! | `Path` | the path's textual form |
//! | `List` | items rendered recursively, joined with `:` (the OS path-list separator) |
//!
//! The reverse direction ([`EnvValue::from_os`], used when importing the
//! process environment) yields `Str` for every variable except list-typed
//! names (`PATH`, `*PATH`, `*DIRS`), which come back as a `List` of `Path`.
//! [`EnvValue::parse_as`] reads a rendered string back into any variant.

use std::collections::BTreeMap;
use std::env as stdenv;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::command::Overlay;

/// Separator used when rendering `List` values.
pub const LIST_SEPARATOR: &str = ":";

/// A value stored in the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Path(PathBuf),
    List(Vec<EnvValue>),
}

/// Discriminant of [`EnvValue`], used to pick a parse rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvKind {
    Str,
    Int,
    Bool,
    Path,
    List,
}

impl EnvValue {
    pub fn kind(&self) -> EnvKind {
        match self {
            EnvValue::Str(_) => EnvKind::Str,
            EnvValue::Int(_) => EnvKind::Int,
            EnvValue::Bool(_) => EnvKind::Bool,
            EnvValue::Path(_) => EnvKind::Path,
            EnvValue::List(_) => EnvKind::List,
        }
    }

    /// String handed to child processes.
    pub fn render(&self) -> OsString {
        match self {
            EnvValue::Str(s) => OsString::from(s),
            EnvValue::Int(i) => OsString::from(i.to_string()),
            EnvValue::Bool(true) => OsString::from("1"),
            EnvValue::Bool(false) => OsString::from("0"),
            EnvValue::Path(p) => p.as_os_str().to_owned(),
            EnvValue::List(items) => {
                let mut out = OsString::new();
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(LIST_SEPARATOR);
                    }
                    out.push(item.render());
                }
                out
            }
        }
    }

    /// Import a raw process-environment value for variable `name`.
    pub fn from_os(name: &str, raw: &OsStr) -> EnvValue {
        if is_list_var(name) {
            EnvValue::parse_as(EnvKind::List, raw).unwrap_or_else(|| lossy_str(raw))
        } else {
            lossy_str(raw)
        }
    }

    /// Read a rendered string back as `kind`.
    ///
    /// Returns `None` when `raw` isn't a valid rendering of that variant
    /// (e.g. `"yes"` as `Bool`). Lists are split on the path-list separator
    /// and every item becomes a `Path`; an empty string is an empty list.
    pub fn parse_as(kind: EnvKind, raw: &OsStr) -> Option<EnvValue> {
        match kind {
            EnvKind::Str => Some(lossy_str(raw)),
            EnvKind::Int => raw.to_str()?.parse().ok().map(EnvValue::Int),
            EnvKind::Bool => match raw.to_str()? {
                "1" => Some(EnvValue::Bool(true)),
                "0" => Some(EnvValue::Bool(false)),
                _ => None,
            },
            EnvKind::Path => Some(EnvValue::Path(PathBuf::from(raw))),
            EnvKind::List => {
                if raw.is_empty() {
                    return Some(EnvValue::List(Vec::new()));
                }
                Some(EnvValue::List(
                    stdenv::split_paths(raw).map(EnvValue::Path).collect(),
                ))
            }
        }
    }

    /// Interpret this value as an ordered list of directories.
    ///
    /// `Str` is split on the path-list separator, `Path` is a single entry and
    /// a `List` may contain only `Str` and `Path` items.
    pub fn as_path_list(&self) -> Option<Vec<PathBuf>> {
        match self {
            EnvValue::Str(s) => Some(stdenv::split_paths(s).collect()),
            EnvValue::Path(p) => Some(vec![p.clone()]),
            EnvValue::List(items) => items
                .iter()
                .map(|item| match item {
                    EnvValue::Str(s) => Some(PathBuf::from(s)),
                    EnvValue::Path(p) => Some(p.clone()),
                    _ => None,
                })
                .collect(),
            EnvValue::Int(_) | EnvValue::Bool(_) => None,
        }
    }

    /// Interpret this value as a single path (`Str` or `Path`).
    pub fn as_path(&self) -> Option<PathBuf> {
        match self {
            EnvValue::Str(s) if !s.is_empty() => Some(PathBuf::from(s)),
            EnvValue::Path(p) => Some(p.clone()),
            _ => None,
        }
    }
}

fn lossy_str(raw: &OsStr) -> EnvValue {
    EnvValue::Str(raw.to_string_lossy().into_owned())
}

/// Whether variable `name` is rendered and imported as a path list.
pub fn is_list_var(name: &str) -> bool {
    name.ends_with("PATH") || name.ends_with("DIRS")
}

impl fmt::Display for EnvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render().to_string_lossy())
    }
}

impl From<&str> for EnvValue {
    fn from(s: &str) -> Self {
        EnvValue::Str(s.to_string())
    }
}

impl From<String> for EnvValue {
    fn from(s: String) -> Self {
        EnvValue::Str(s)
    }
}

impl From<i64> for EnvValue {
    fn from(i: i64) -> Self {
        EnvValue::Int(i)
    }
}

impl From<i32> for EnvValue {
    fn from(i: i32) -> Self {
        EnvValue::Int(i64::from(i))
    }
}

impl From<bool> for EnvValue {
    fn from(b: bool) -> Self {
        EnvValue::Bool(b)
    }
}

impl From<PathBuf> for EnvValue {
    fn from(p: PathBuf) -> Self {
        EnvValue::Path(p)
    }
}

impl From<&Path> for EnvValue {
    fn from(p: &Path) -> Self {
        EnvValue::Path(p.to_path_buf())
    }
}

impl From<Vec<EnvValue>> for EnvValue {
    fn from(items: Vec<EnvValue>) -> Self {
        EnvValue::List(items)
    }
}

type Vars = BTreeMap<String, EnvValue>;

/// Process-wide variable store.
///
/// Every accessor takes the internal lock for its whole duration, so `set`
/// and `delete` are atomic with respect to readers, and the sequence-returning
/// accessors hand out point-in-time copies.
#[derive(Debug, Default)]
pub struct EnvStore {
    vars: RwLock<Vars>,
}

impl EnvStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding a copy of the current process environment.
    pub fn from_process() -> Self {
        Self::from_os_pairs(stdenv::vars_os())
    }

    /// Import raw `(name, value)` pairs with the rules of [`EnvValue::from_os`].
    pub fn from_os_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        let vars = pairs
            .into_iter()
            .filter_map(|(k, v)| {
                let name = k.as_ref().to_str()?.to_string();
                let value = EnvValue::from_os(&name, v.as_ref());
                Some((name, value))
            })
            .collect();
        Self {
            vars: RwLock::new(vars),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vars> {
        self.vars.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vars> {
        self.vars.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// A copy of the value of `name`, if set.
    pub fn get(&self, name: &str) -> Option<EnvValue> {
        self.read().get(name).cloned()
    }

    /// Set `name`, replacing any previous value.
    pub fn set(&self, name: impl Into<String>, value: impl Into<EnvValue>) {
        self.write().insert(name.into(), value.into());
    }

    /// Remove `name`, returning its previous value.
    ///
    /// Deleting an absent name is not an error: it returns `None` and leaves
    /// the store untouched, so callers can treat deletion as idempotent or
    /// turn `None` into their own "not found" as they see fit.
    pub fn delete(&self, name: &str) -> Option<EnvValue> {
        self.write().remove(name)
    }

    /// Whether `name` is set.
    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Names in sorted order, copied out of the store.
    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Values in key order, copied out of the store.
    pub fn values(&self) -> Vec<EnvValue> {
        self.read().values().cloned().collect()
    }

    /// `(name, value)` pairs in key order, copied out of the store.
    pub fn items(&self) -> Vec<(String, EnvValue)> {
        self.read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Independent deep copy of this store.
    pub fn snapshot(&self) -> EnvStore {
        EnvStore {
            vars: RwLock::new(self.read().clone()),
        }
    }

    /// Ambient variables with `overlay` applied on top, taken under one lock.
    pub fn merged(&self, overlay: &Overlay) -> BTreeMap<String, EnvValue> {
        let mut vars = self.read().clone();
        vars.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
        vars
    }
}

/// Render a variable map for a child process.
pub fn render_all(vars: &BTreeMap<String, EnvValue>) -> Vec<(String, OsString)> {
    vars.iter().map(|(k, v)| (k.clone(), v.render())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_env_set_and_get_var() {
        let env = EnvStore::new();

        // initially absent
        assert_eq!(env.get("SOME_RANDOM_ENV_VAR_12345"), None);

        env.set("KEY", "VALUE");

        assert_eq!(env.get("KEY"), Some(EnvValue::from("VALUE")));
        assert!(env.contains("KEY"));
    }

    #[test]
    fn test_env_reads_from_process_env() {
        let env = EnvStore::from_process();
        assert!(env.get("PATH").is_some());
        assert!(matches!(env.get("PATH"), Some(EnvValue::List(_))));
    }

    #[test]
    fn delete_absent_is_none_and_idempotent() {
        let env = EnvStore::new();
        env.set("A", 1);
        assert_eq!(env.delete("A"), Some(EnvValue::Int(1)));
        assert_eq!(env.delete("A"), None);
        assert!(!env.contains("A"));
    }

    #[test]
    fn rendering_rules() {
        assert_eq!(EnvValue::from("x").render(), "x");
        assert_eq!(EnvValue::Int(-42).render(), "-42");
        assert_eq!(EnvValue::Bool(true).render(), "1");
        assert_eq!(EnvValue::Bool(false).render(), "0");
        assert_eq!(EnvValue::Path(PathBuf::from("/a/b")).render(), "/a/b");
        let list = EnvValue::List(vec![
            EnvValue::Path(PathBuf::from("/usr/bin")),
            EnvValue::from("/bin"),
        ]);
        assert_eq!(list.render(), "/usr/bin:/bin");
    }

    #[test]
    fn list_vars_read_back_as_the_same_list() {
        let path = EnvValue::List(vec![
            EnvValue::Path(PathBuf::from("/usr/local/bin")),
            EnvValue::Path(PathBuf::from("/usr/bin")),
        ]);
        let rendered = path.render();
        assert_eq!(EnvValue::from_os("PATH", &rendered), path);
        assert_eq!(EnvValue::from_os("LD_LIBRARY_PATH", &rendered), path);
        assert_eq!(
            EnvValue::from_os("EDITOR", OsStr::new("vim")),
            EnvValue::from("vim")
        );
    }

    #[test]
    fn parse_as_inverts_render() {
        for value in [
            EnvValue::Int(7),
            EnvValue::Bool(true),
            EnvValue::Bool(false),
            EnvValue::Path(PathBuf::from("/tmp")),
            EnvValue::from("plain"),
        ] {
            assert_eq!(
                EnvValue::parse_as(value.kind(), &value.render()),
                Some(value.clone())
            );
        }
        assert_eq!(EnvValue::parse_as(EnvKind::Bool, OsStr::new("yes")), None);
        assert_eq!(EnvValue::parse_as(EnvKind::Int, OsStr::new("1.5")), None);
    }

    #[test]
    fn path_list_views() {
        assert_eq!(
            EnvValue::from("/a:/b").as_path_list(),
            Some(vec![PathBuf::from("/a"), PathBuf::from("/b")])
        );
        assert_eq!(EnvValue::Int(3).as_path_list(), None);
        assert_eq!(
            EnvValue::List(vec![EnvValue::Bool(true)]).as_path_list(),
            None
        );
    }

    #[test]
    fn snapshot_is_independent() {
        let env = EnvStore::new();
        env.set("A", "1");
        let copy = env.snapshot();
        copy.set("A", "2");
        copy.set("B", "3");
        assert_eq!(env.get("A"), Some(EnvValue::from("1")));
        assert!(!env.contains("B"));
    }

    #[test]
    fn merged_applies_overlay_without_mutating() {
        let env = EnvStore::new();
        env.set("A", "1");
        env.set("B", "1");
        let mut overlay = Overlay::new();
        overlay.insert("A".into(), EnvValue::from("2"));
        let merged = env.merged(&overlay);
        assert_eq!(merged.get("A"), Some(&EnvValue::from("2")));
        assert_eq!(merged.get("B"), Some(&EnvValue::from("1")));
        assert_eq!(env.get("A"), Some(EnvValue::from("1")));
    }

    #[test]
    fn items_is_a_point_in_time_copy_under_concurrent_writes() {
        let env = Arc::new(EnvStore::new());
        for i in 0..100 {
            env.set(format!("K{i:03}"), i);
        }
        let writer = {
            let env = Arc::clone(&env);
            thread::spawn(move || {
                for i in 0..100 {
                    env.delete(&format!("K{i:03}"));
                    env.set(format!("N{i:03}"), i);
                }
            })
        };
        for _ in 0..50 {
            let items = env.items();
            let mut keys: Vec<_> = items.iter().map(|(k, _)| k.clone()).collect();
            let sorted = {
                let mut k = keys.clone();
                k.sort();
                k
            };
            assert_eq!(keys, sorted);
            keys.dedup();
            assert_eq!(keys.len(), items.len());
        }
        writer.join().unwrap();
        assert_eq!(env.len(), 100);
    }
}
