//! Executor runs hook programs.

use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    process::Stdio,
};

use futures::{FutureExt, future::BoxFuture};
use walkdir::{DirEntry, WalkDir};

use crate::prelude::*;

/// ExecOutput is what a finished hook left behind.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Code is the exit code, or `None` if the process was killed by a signal.
    pub code: Option<i32>,
}

impl ExecOutput {
    /// Success reports whether the process exited 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Into_error turns an unsuccessful run into an [`Error::HookExec`].
    pub fn into_error(self, path: &Path) -> Error {
        Error::HookExec {
            path: path.to_path_buf(),
            code: self.code,
            stderr: String::from_utf8_lossy(&self.stderr).trim().to_string(),
        }
    }
}

/// Executor runs a program with arguments and extra environment, on top of the parent
/// environment.
pub trait Executor: Send + Sync {
    fn run<'a>(
        &'a self,
        path: &'a Path,
        args: &'a [&'a str],
        env: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<ExecOutput>>;
}

/// ProcessExecutor runs hooks as child processes.
#[derive(Clone, Debug, Default)]
pub struct ProcessExecutor {
    /// Dir is the working directory for hooks. Defaults to the operator's.
    pub dir: Option<PathBuf>,
}

impl Executor for ProcessExecutor {
    fn run<'a>(
        &'a self,
        path: &'a Path,
        args: &'a [&'a str],
        env: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<ExecOutput>> {
        async move {
            let mut cmd = tokio::process::Command::new(path);
            cmd.args(args)
                .envs(env)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if let Some(dir) = &self.dir {
                cmd.current_dir(dir);
            }
            debug!(?path, ?args, "running hook");
            let out = cmd.output().await?;
            Ok(ExecOutput {
                stdout: out.stdout,
                stderr: out.stderr,
                code: out.status.code(),
            })
        }
        .boxed()
    }
}

/// Find_executables lists executable files under `dir`, recursively, sorted by path.
///
/// Entries whose name starts with a `.` are skipped, as are directories with such names.
/// Symlinks are followed. Symlink loops and dangling symlinks are skipped, and a file reachable by
/// more than one path is only listed under the first.
pub fn find_executables(dir: &Path) -> Result<Vec<PathBuf>> {
    let walker = WalkDir::new(dir)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e));

    let mut found = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.loop_ancestor().is_some() => {
                warn!(path = ?err.path(), "skipping symlink loop");
                continue;
            }
            Err(err)
                if err.depth() > 0
                    && err
                        .io_error()
                        .is_some_and(|e| e.kind() == std::io::ErrorKind::NotFound) =>
            {
                warn!(path = ?err.path(), "skipping dangling symlink");
                continue;
            }
            Err(err) => return Err(std::io::Error::from(err).into()),
        };
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        let md = entry.metadata().map_err(std::io::Error::from)?;
        if !is_executable(&md) {
            trace!(?path, "skipping non-executable entry");
            continue;
        }
        found.push((path.to_path_buf(), std::fs::canonicalize(path)?));
    }
    found.sort();

    let mut seen = HashSet::new();
    Ok(found
        .into_iter()
        .filter_map(|(path, real)| {
            if seen.insert(real) {
                Some(path)
            } else {
                debug!(?path, "skipping hook already found under another path");
                None
            }
        })
        .collect())
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|n| n.starts_with('.'))
}

#[cfg(unix)]
fn is_executable(md: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_: &std::fs::Metadata) -> bool {
    true
}
