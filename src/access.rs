// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! File access capabilities.
//!
//! The patch engines never touch the network or the file system directly.
//! Instead they consume a narrow "read bytes at path" and "write bytes at
//! path" capability for each side of a deployment: the __local__ working copy
//! and the __remote__ target. All paths handed to a capability are relative
//! to the WordPress root of that side, e.g., `wp-content/plugins/acme/x.php`.
//!
//! # Remote Access Through SSH
//!
//! [`SshTree`] implements remote access by running small POSIX shell snippets
//! on the target host through the system `ssh` binary. Authentication is left
//! entirely to the user's SSH setup (agent, keys, config). Batch mode is
//! always enabled so a missing key fails fast instead of blocking on a
//! password prompt.

use std::{
    ffi::OsString,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::{read, write},
    io::{ErrorKind, Write},
    path::{Component, Path, PathBuf},
    process::{Command, Output, Stdio},
};
use tracing::{debug, instrument};

/// Exit code used by the remote read snippet when the file does not exist.
const MISSING_SENTINEL: i32 = 44;

/// Which side of a deployment a capability talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

impl Display for Side {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Local => fmt.write_str("local"),
            Self::Remote => fmt.write_str("remote"),
        }
    }
}

/// Read and write whole files relative to a WordPress root.
pub trait FileAccess {
    /// Side this capability operates on.
    fn side(&self) -> Side;

    /// Read entire file content.
    ///
    /// Returns `None` if the file does not exist.
    fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Replace entire file content, creating parent directories as needed.
    fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Check if file exists.
    fn exists(&self, path: &str) -> Result<bool>;

    /// List files in the directory of `prefix` whose names start with the
    /// file name of `prefix` and end with `suffix`.
    fn list_matching(&self, prefix: &str, suffix: &str) -> Result<Vec<String>>;
}

/// File access rooted at a directory on this machine.
#[derive(Debug, Clone)]
pub struct LocalTree {
    root: PathBuf,
    side: Side,
}

impl LocalTree {
    /// Construct local working copy access.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            side: Side::Local,
        }
    }

    /// Construct access to a remote target that happens to be mounted or
    /// mirrored on this machine.
    pub fn remote(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            side: Side::Remote,
        }
    }

    /// Root directory of tree.
    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    /// Resolve relative path under root.
    ///
    /// # Errors
    ///
    /// - Return [`AccessError::OutsideRoot`] if path is absolute or climbs
    ///   out of root.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        check_relative(self.side, path)?;
        Ok(self.root.join(path))
    }
}

impl FileAccess for LocalTree {
    fn side(&self) -> Side {
        self.side
    }

    fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let full_path = self.resolve(path)?;
        match read(&full_path) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(AccessError::Read {
                side: self.side,
                path: path.into(),
                source: err,
            }),
        }
    }

    fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.resolve(path)?;
        let write_err = |err| AccessError::Write {
            side: self.side,
            path: path.into(),
            source: err,
        };

        if let Some(parent) = full_path.parent() {
            mkdirp::mkdirp(parent).map_err(write_err)?;
        }

        write(&full_path, content).map_err(write_err)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.resolve(path)?.is_file())
    }

    fn list_matching(&self, prefix: &str, suffix: &str) -> Result<Vec<String>> {
        let full_prefix = self.resolve(prefix)?;
        let pattern = format!(
            "{}*{}",
            glob::Pattern::escape(full_prefix.to_string_lossy().as_ref()),
            glob::Pattern::escape(suffix)
        );
        let list_err = |err: std::io::Error| AccessError::List {
            side: self.side,
            path: prefix.into(),
            source: err,
        };

        let entries = glob::glob(&pattern)
            .map_err(|err| list_err(std::io::Error::new(ErrorKind::InvalidInput, err)))?;

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| list_err(err.into()))?;
            if !entry.is_file() {
                continue;
            }

            if let Ok(relative) = entry.strip_prefix(&self.root) {
                found.push(to_slash(relative));
            }
        }
        found.sort();

        Ok(found)
    }
}

/// File access on a remote host through the system SSH client.
#[derive(Debug, Clone)]
pub struct SshTree {
    host: String,
    port: Option<u16>,
    root: String,
}

impl SshTree {
    /// Construct new SSH file access.
    ///
    /// The `root` is the absolute WordPress root on the remote host.
    pub fn new(host: impl Into<String>, port: Option<u16>, root: impl Into<String>) -> Self {
        let root = root.into();
        let root = match root.trim_end_matches('/') {
            "" => "/".to_string(),
            trimmed => trimmed.to_string(),
        };

        Self {
            host: host.into(),
            port,
            root,
        }
    }

    /// Remote host label.
    pub fn host(&self) -> &str {
        self.host.as_str()
    }

    /// Run shell snippet on remote host.
    ///
    /// Exposed for collaborators that need to run commands other than plain
    /// file reads and writes on the target, e.g., WP-CLI.
    pub fn run(&self, script: &str, stdin: Option<&[u8]>) -> std::io::Result<Output> {
        let mut args: Vec<OsString> = vec!["-o".into(), "BatchMode=yes".into()];
        if let Some(port) = self.port {
            args.push("-p".into());
            args.push(port.to_string().into());
        }
        args.push(self.host.as_str().into());
        args.push("--".into());
        args.push(script.into());

        debug!("ssh {}: {script}", self.host);
        let mut child = Command::new("ssh")
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let (Some(content), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(content)?;
        }

        child.wait_with_output()
    }

    fn full_path(&self, path: &str) -> Result<String> {
        check_relative(Side::Remote, path)?;
        Ok(format!("{}/{}", self.root.trim_end_matches('/'), path))
    }
}

impl FileAccess for SshTree {
    fn side(&self) -> Side {
        Side::Remote
    }

    #[instrument(skip(self), level = "debug")]
    fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let target = quote(&self.full_path(path)?);
        let script =
            format!("if [ -f {target} ]; then cat {target}; else exit {MISSING_SENTINEL}; fi");
        let read_err = |err| AccessError::Read {
            side: Side::Remote,
            path: path.into(),
            source: err,
        };

        let output = self.run(&script, None).map_err(read_err)?;
        match output.status.code() {
            Some(0) => Ok(Some(output.stdout)),
            Some(MISSING_SENTINEL) => Ok(None),
            _ => Err(read_err(failed_status(&output))),
        }
    }

    #[instrument(skip(self, content), level = "debug")]
    fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path)?;
        let parent = full_path
            .rsplit_once('/')
            .map(|(parent, _)| parent)
            .filter(|parent| !parent.is_empty())
            .unwrap_or("/");
        let script = format!("mkdir -p {} && cat > {}", quote(parent), quote(&full_path));
        let write_err = |err| AccessError::Write {
            side: Side::Remote,
            path: path.into(),
            source: err,
        };

        let output = self.run(&script, Some(content)).map_err(write_err)?;
        if !output.status.success() {
            return Err(write_err(failed_status(&output)));
        }

        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let script = format!("test -f {}", quote(&self.full_path(path)?));
        let output = self.run(&script, None).map_err(|err| AccessError::Read {
            side: Side::Remote,
            path: path.into(),
            source: err,
        })?;

        // INVARIANT: test(1) exits with 1 for a missing file, while ssh itself
        //   exits with 255 on connection failure.
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(AccessError::Read {
                side: Side::Remote,
                path: path.into(),
                source: failed_status(&output),
            }),
        }
    }

    fn list_matching(&self, prefix: &str, suffix: &str) -> Result<Vec<String>> {
        check_relative(Side::Remote, prefix)?;
        let script = format!(
            "cd {} && for f in {}*{}; do [ -f \"$f\" ] && printf '%s\\n' \"$f\"; done; exit 0",
            quote(&self.root),
            quote(prefix),
            quote(suffix)
        );
        let list_err = |err| AccessError::List {
            side: Side::Remote,
            path: prefix.into(),
            source: err,
        };

        let output = self.run(&script, None).map_err(list_err)?;
        if !output.status.success() {
            return Err(list_err(failed_status(&output)));
        }

        let mut found = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        found.sort();

        Ok(found)
    }
}

fn check_relative(side: Side, path: &str) -> Result<()> {
    let escapes = Path::new(path).components().any(|component| {
        matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });

    if path.is_empty() || escapes {
        return Err(AccessError::OutsideRoot {
            side,
            path: path.into(),
        });
    }

    Ok(())
}

fn failed_status(output: &Output) -> std::io::Error {
    let stderr = String::from_utf8_lossy(output.stderr.as_slice());

    // INVARIANT: Chomp trailing newlines.
    let stderr = stderr.trim_end_matches(['\r', '\n']);
    std::io::Error::other(format!("command failed with {}: {stderr}", output.status))
}

/// Quote text for a POSIX shell.
pub(crate) fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// File access error types.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    /// File content cannot be read.
    #[error("failed to read {side} file {path:?}")]
    Read {
        side: Side,
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// File content cannot be written.
    #[error("failed to write {side} file {path:?}")]
    Write {
        side: Side,
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Directory listing fails.
    #[error("failed to list {side} files matching {path:?}")]
    List {
        side: Side,
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Path is not relative to the WordPress root.
    #[error("path {path:?} escapes the {side} root")]
    OutsideRoot { side: Side, path: String },
}

impl AccessError {
    /// Side on which the failure occurred.
    pub fn side(&self) -> Side {
        match self {
            Self::Read { side, .. }
            | Self::Write { side, .. }
            | Self::List { side, .. }
            | Self::OutsideRoot { side, .. } => *side,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = AccessError> = std::result::Result<T, E>;
