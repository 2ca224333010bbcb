//! Trigger events and the actions manifests attach to them.
//!
//! Actions run in manifest order; the first failure aborts the triggering
//! operation. Paths and strings are template-expanded before use and
//! relative paths resolve against the package root.

use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::errors::{HermitError, HermitResult};

/// The lifecycle events a manifest can attach actions to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Event {
    /// after an archive is extracted into the package store
    Unpack,
    /// after a package is installed into an environment
    Install,
    /// before a package is uninstalled from an environment
    Uninstall,
    /// when an environment is activated
    EnvActivate,
    /// before a binary from the package is executed
    Exec,
}

impl Event {
    /// The event name as written in manifests
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Unpack => "unpack",
            Event::Install => "install",
            Event::Uninstall => "uninstall",
            Event::EnvActivate => "env-activate",
            Event::Exec => "exec",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Event {
    type Err = HermitError;

    fn from_str(s: &str) -> HermitResult<Event> {
        match s {
            "unpack" => Ok(Event::Unpack),
            "install" => Ok(Event::Install),
            "uninstall" => Ok(Event::Uninstall),
            "env-activate" => Ok(Event::EnvActivate),
            "exec" => Ok(Event::Exec),
            _ => Err(HermitError::msg(format!("unknown trigger event {s:?}"))),
        }
    }
}

/// A single action within an `on <event>` block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Spawn a subprocess
    Run {
        /// the executable to run
        command: String,
        /// its arguments
        args: Vec<String>,
        /// extra `KEY=VALUE` environment entries
        env: Vec<String>,
        /// working directory; defaults to the package root
        dir: Option<String>,
        /// literal string piped to the child's stdin
        stdin: Option<String>,
    },
    /// Copy a file
    Copy {
        /// source path
        from: String,
        /// destination path
        to: String,
        /// octal permissions to set on the destination
        mode: Option<u32>,
    },
    /// Rename a file or directory
    Rename {
        /// source path
        from: String,
        /// destination path
        to: String,
    },
    /// Create a symlink
    Symlink {
        /// link target
        from: String,
        /// link path
        to: String,
    },
    /// Create a directory and any missing parents
    Mkdir {
        /// the directory to create
        dir: String,
        /// octal permissions to set on it
        mode: Option<u32>,
    },
    /// Change permissions of a file
    Chmod {
        /// the file to chmod
        file: String,
        /// octal permissions
        mode: u32,
    },
    /// Queue a message for display after the triggering operation
    Message {
        /// the message text
        text: String,
    },
    /// Delete files
    Delete {
        /// delete directories recursively
        recursive: bool,
        /// the files to delete
        files: Vec<String>,
    },
}

/// Everything an [`Action`] needs to execute
pub struct ActionContext<'a> {
    /// base directory for relative paths and the default working directory
    pub root: &'a Utf8Path,
    /// template expansion for action fields
    pub expand: &'a dyn Fn(&str) -> String,
    /// accumulates `message` action output for the caller to display
    pub messages: &'a mut Vec<String>,
}

impl<'a> ActionContext<'a> {
    fn resolve(&self, path: &str) -> Utf8PathBuf {
        let path = Utf8PathBuf::from((self.expand)(path));
        if path.is_absolute() {
            path
        } else {
            self.root.join(path)
        }
    }
}

impl Action {
    /// A copy of this action with `f` applied to every expandable string
    /// field. The resolver uses this to substitute template variables when a
    /// package is materialized.
    pub fn expanded(&self, f: &impl Fn(&str) -> String) -> Action {
        match self {
            Action::Run { command, args, env, dir, stdin } => Action::Run {
                command: f(command),
                args: args.iter().map(|a| f(a)).collect(),
                env: env.iter().map(|e| f(e)).collect(),
                dir: dir.as_deref().map(f),
                stdin: stdin.as_deref().map(f),
            },
            Action::Copy { from, to, mode } => {
                Action::Copy { from: f(from), to: f(to), mode: *mode }
            }
            Action::Rename { from, to } => Action::Rename { from: f(from), to: f(to) },
            Action::Symlink { from, to } => Action::Symlink { from: f(from), to: f(to) },
            Action::Mkdir { dir, mode } => Action::Mkdir { dir: f(dir), mode: *mode },
            Action::Chmod { file, mode } => Action::Chmod { file: f(file), mode: *mode },
            Action::Message { text } => Action::Message { text: f(text) },
            Action::Delete { recursive, files } => Action::Delete {
                recursive: *recursive,
                files: files.iter().map(|x| f(x)).collect(),
            },
        }
    }

    /// Execute the action. Errors are wrapped by the caller into
    /// `TriggerFailed` with the event and package attached.
    pub fn execute(&self, ctx: &mut ActionContext) -> HermitResult<()> {
        debug!("trigger action: {self:?}");
        match self {
            Action::Run { command, args, env, dir, stdin } => {
                let command = (ctx.expand)(command);
                let args: Vec<String> = args.iter().map(|a| (ctx.expand)(a)).collect();
                let dir = match dir {
                    Some(dir) => ctx.resolve(dir),
                    None => ctx.root.to_owned(),
                };
                let mut cmd = duct::cmd(command.as_str(), &args).dir(dir.as_std_path());
                for entry in env {
                    let entry = (ctx.expand)(entry);
                    let Some((key, value)) = entry.split_once('=') else {
                        return Err(HermitError::EnvParse { line: entry });
                    };
                    cmd = cmd.env(key.to_string(), value.to_string());
                }
                if let Some(stdin) = stdin {
                    cmd = cmd.stdin_bytes((ctx.expand)(stdin).into_bytes());
                }
                cmd.run().map_err(|err| HermitError::Subprocess {
                    command: command.clone(),
                    message: err.to_string(),
                })?;
                Ok(())
            }
            Action::Copy { from, to, mode } => {
                let from = ctx.resolve(from);
                let to = ctx.resolve(to);
                fs::copy(&from, &to)?;
                if let Some(mode) = mode {
                    fs::set_permissions(&to, fs::Permissions::from_mode(*mode))?;
                }
                Ok(())
            }
            Action::Rename { from, to } => {
                let from = ctx.resolve(from);
                let to = ctx.resolve(to);
                fs::rename(from, to)?;
                Ok(())
            }
            Action::Symlink { from, to } => {
                let from = ctx.resolve(from);
                let to = ctx.resolve(to);
                if to.symlink_metadata().is_ok() {
                    fs::remove_file(&to)?;
                }
                std::os::unix::fs::symlink(from, to)?;
                Ok(())
            }
            Action::Mkdir { dir, mode } => {
                let dir = ctx.resolve(dir);
                fs::create_dir_all(&dir)?;
                if let Some(mode) = mode {
                    fs::set_permissions(&dir, fs::Permissions::from_mode(*mode))?;
                }
                Ok(())
            }
            Action::Chmod { file, mode } => {
                let file = ctx.resolve(file);
                fs::set_permissions(&file, fs::Permissions::from_mode(*mode))?;
                Ok(())
            }
            Action::Message { text } => {
                ctx.messages.push((ctx.expand)(text));
                Ok(())
            }
            Action::Delete { recursive, files } => {
                for file in files {
                    let file = ctx.resolve(file);
                    let meta = match file.symlink_metadata() {
                        Ok(meta) => meta,
                        // deleting something already gone is not an error
                        Err(_) => continue,
                    };
                    if meta.is_dir() {
                        if !recursive {
                            return Err(HermitError::msg(format!(
                                "refusing to delete directory {file} without recursive = true"
                            )));
                        }
                        fs::remove_dir_all(&file)?;
                    } else {
                        fs::remove_file(&file)?;
                    }
                }
                Ok(())
            }
        }
    }
}
