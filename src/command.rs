//! Immutable command graphs.
//!
//! A [`Runnable`] is a cheap, shareable handle to a node of the graph. Every
//! composition operator returns a new node and leaves its operands untouched,
//! so the same `Runnable` can be executed many times or from several threads.
//! Building a graph never touches the filesystem or the environment.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use crate::env::EnvValue;
use crate::error::ConstructionError;

/// Conventional process exit code type used by this crate.
///
/// A value of 0 indicates success; any non-zero value indicates failure.
/// This mirrors the convention used by POSIX shells and many command-line tools.
pub type ExitCode = i32;

/// Mapping applied on top of the effective environment of one subgraph.
pub type Overlay = BTreeMap<String, EnvValue>;

/// A named external executable.
///
/// The name is resolved to a path lazily, at execution time, against the
/// effective `PATH`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Program {
    name: String,
}

impl Program {
    /// A program referred to by `name`: a bare command name, or a path when
    /// it contains `/`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The name as written; children see it as `argv[0]`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Build a leaf invoking this program with `args`.
    pub fn call<I, S>(&self, args: I) -> Runnable
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Runnable::new(Node::Leaf {
            program: self.clone(),
            args: args.into_iter().map(Into::into).collect(),
        })
    }
}

/// Shorthand for [`Program::new`].
pub fn program(name: impl Into<String>) -> Program {
    Program::new(name)
}

/// Output stream(s) a redirect applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Stream {
    #[default]
    Stdout,
    Stderr,
    Both,
}

impl Stream {
    pub fn covers_stdout(self) -> bool {
        matches!(self, Stream::Stdout | Stream::Both)
    }

    pub fn covers_stderr(self) -> bool {
        matches!(self, Stream::Stderr | Stream::Both)
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
            Stream::Both => "stdout/stderr",
        })
    }
}

/// Whether a redirect replaces or extends its target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RedirectMode {
    #[default]
    Truncate,
    Append,
}

/// Where redirected output goes.
///
/// Resolved once, when the redirect is built: a path is opened anew on every
/// execution, an open handle is duplicated on every execution.
#[derive(Debug, Clone)]
pub enum RedirectTarget {
    Path(PathBuf),
    Handle(Arc<File>),
}

impl RedirectTarget {
    /// Human-readable name used in error messages.
    pub fn describe(&self) -> String {
        match self {
            RedirectTarget::Path(p) => p.display().to_string(),
            RedirectTarget::Handle(_) => "<open handle>".to_string(),
        }
    }
}

impl From<PathBuf> for RedirectTarget {
    fn from(p: PathBuf) -> Self {
        RedirectTarget::Path(p)
    }
}

impl From<&std::path::Path> for RedirectTarget {
    fn from(p: &std::path::Path) -> Self {
        RedirectTarget::Path(p.to_path_buf())
    }
}

impl From<&str> for RedirectTarget {
    fn from(p: &str) -> Self {
        RedirectTarget::Path(PathBuf::from(p))
    }
}

impl From<String> for RedirectTarget {
    fn from(p: String) -> Self {
        RedirectTarget::Path(PathBuf::from(p))
    }
}

impl From<File> for RedirectTarget {
    fn from(f: File) -> Self {
        RedirectTarget::Handle(Arc::new(f))
    }
}

/// A fully specified redirect.
#[derive(Debug, Clone)]
pub struct Redirect {
    pub target: RedirectTarget,
    pub mode: RedirectMode,
    pub stream: Stream,
}

/// One node of a command graph.
#[derive(Debug)]
pub enum Node {
    Leaf { program: Program, args: Vec<String> },
    Pipe { stages: Vec<Runnable> },
    Redirect { inner: Runnable, redirect: Redirect },
    EnvOverlay { inner: Runnable, overlay: Overlay },
    Subshell { inner: Runnable },
}

/// Shareable handle to an immutable command graph node.
#[derive(Debug, Clone)]
pub struct Runnable(Arc<Node>);

impl Runnable {
    fn new(node: Node) -> Self {
        Runnable(Arc::new(node))
    }

    pub fn node(&self) -> &Node {
        &self.0
    }

    /// Redirect `stream` of this runnable to `target`.
    pub fn redirect_to(
        &self,
        target: impl Into<RedirectTarget>,
        mode: RedirectMode,
        stream: Stream,
    ) -> Runnable {
        Runnable::new(Node::Redirect {
            inner: self.clone(),
            redirect: Redirect {
                target: target.into(),
                mode,
                stream,
            },
        })
    }

    /// `> target`
    pub fn write_to(&self, target: impl Into<RedirectTarget>) -> Runnable {
        self.redirect_to(target, RedirectMode::Truncate, Stream::Stdout)
    }

    /// `>> target`
    pub fn append_to(&self, target: impl Into<RedirectTarget>) -> Runnable {
        self.redirect_to(target, RedirectMode::Append, Stream::Stdout)
    }

    /// Scope `overlay` to the execution of this runnable.
    ///
    /// Calling this on a node that is itself an overlay merges the two maps
    /// into one node, with the keys of this call winning.
    pub fn with_env<I, K, V>(&self, overlay: I) -> Runnable
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<EnvValue>,
    {
        let additions = overlay.into_iter().map(|(k, v)| (k.into(), v.into()));
        match self.node() {
            Node::EnvOverlay { inner, overlay } => {
                let mut merged = overlay.clone();
                merged.extend(additions);
                Runnable::new(Node::EnvOverlay {
                    inner: inner.clone(),
                    overlay: merged,
                })
            }
            _ => Runnable::new(Node::EnvOverlay {
                inner: self.clone(),
                overlay: additions.collect(),
            }),
        }
    }

    /// Pipe this runnable's stdout into `next`.
    pub fn pipe_into(&self, next: &Runnable) -> Runnable {
        let mut stages = Vec::new();
        push_flattened(&mut stages, self);
        push_flattened(&mut stages, next);
        Runnable::new(Node::Pipe { stages })
    }

    /// Number of pipeline stages this node reports results for.
    pub fn stage_count(&self) -> usize {
        match self.node() {
            Node::Pipe { stages } => stages.len(),
            _ => 1,
        }
    }
}

impl fmt::Display for Runnable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node() {
            Node::Leaf { program, args } => {
                write!(f, "{}", program.name())?;
                for arg in args {
                    write!(f, " {}", arg)?;
                }
                Ok(())
            }
            Node::Pipe { stages } => {
                for (i, stage) in stages.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" | ")?;
                    }
                    write!(f, "{}", stage)?;
                }
                Ok(())
            }
            Node::Redirect { inner, redirect } => {
                let op = match (redirect.stream, redirect.mode) {
                    (Stream::Stdout, RedirectMode::Truncate) => ">",
                    (Stream::Stdout, RedirectMode::Append) => ">>",
                    (Stream::Stderr, RedirectMode::Truncate) => "2>",
                    (Stream::Stderr, RedirectMode::Append) => "2>>",
                    (Stream::Both, RedirectMode::Truncate) => "&>",
                    (Stream::Both, RedirectMode::Append) => "&>>",
                };
                write!(f, "{} {} {}", inner, op, redirect.target.describe())
            }
            Node::EnvOverlay { inner, overlay } => {
                for (k, v) in overlay {
                    write!(f, "{}={} ", k, v.render().to_string_lossy())?;
                }
                write!(f, "{}", inner)
            }
            Node::Subshell { inner } => write!(f, "({})", inner),
        }
    }
}

fn push_flattened(stages: &mut Vec<Runnable>, r: &Runnable) {
    match r.node() {
        Node::Pipe { stages: inner } => stages.extend(inner.iter().cloned()),
        _ => stages.push(r.clone()),
    }
}

/// Connect `stages` into a pipeline.
///
/// Nested pipelines are flattened. Fewer than two resulting stages is an
/// [`ConstructionError::InvalidPipeline`].
pub fn pipe<'a, I>(stages: I) -> Result<Runnable, ConstructionError>
where
    I: IntoIterator<Item = &'a Runnable>,
{
    let mut flat = Vec::new();
    for stage in stages {
        push_flattened(&mut flat, stage);
    }
    if flat.len() < 2 {
        return Err(ConstructionError::InvalidPipeline { stages: flat.len() });
    }
    Ok(Runnable::new(Node::Pipe { stages: flat }))
}

/// Run `inner` with private copies of the directory state and environment.
pub fn sub(inner: &Runnable) -> Runnable {
    Runnable::new(Node::Subshell {
        inner: inner.clone(),
    })
}

impl std::ops::BitOr for &Runnable {
    type Output = Runnable;

    fn bitor(self, rhs: &Runnable) -> Runnable {
        self.pipe_into(rhs)
    }
}
