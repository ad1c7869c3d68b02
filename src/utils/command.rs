use std::fmt;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Captured result of one external tool invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug)]
pub enum CommandError {
    /// The child could not be spawned or its pipes failed.
    Io { cmd: String, source: std::io::Error },
    /// The child ran but exited non-zero (checked invocations only).
    Failed {
        cmd: String,
        exit_code: Option<i32>,
        stderr: String,
    },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Io { cmd, source } => write!(f, "failed to run '{}': {}", cmd, source),
            CommandError::Failed {
                cmd,
                exit_code,
                stderr,
            } => write!(
                f,
                "'{}' exited with {:?}: {}",
                cmd,
                exit_code,
                stderr.trim()
            ),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Io { source, .. } => Some(source),
            CommandError::Failed { .. } => None,
        }
    }
}

pub type CommandResult<T> = Result<T, CommandError>;

pub struct CommandExecutor;

impl CommandExecutor {
    /// Run a command and capture its output. A non-zero exit is not an error
    /// here; callers inspect `CommandOutput::success`.
    pub async fn run<S: AsRef<str>>(argv: &[S]) -> CommandResult<CommandOutput> {
        Self::run_with_stdin(argv, None).await
    }

    /// Like `run`, optionally feeding a buffer to the child's stdin
    /// (used to pipe private keys into `wg pubkey`).
    pub async fn run_with_stdin<S: AsRef<str>>(
        argv: &[S],
        stdin: Option<&[u8]>,
    ) -> CommandResult<CommandOutput> {
        let cmd_line = render_argv(argv);
        let (program, args) = argv.split_first().ok_or_else(|| CommandError::Io {
            cmd: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
        })?;

        let mut command = Command::new(program.as_ref());
        command
            .args(args.iter().map(|a| a.as_ref()))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if stdin.is_some() {
            command.stdin(Stdio::piped());
        }

        let mut child = command.spawn().map_err(|e| CommandError::Io {
            cmd: cmd_line.clone(),
            source: e,
        })?;

        if let (Some(buf), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(buf).await.map_err(|e| CommandError::Io {
                cmd: cmd_line.clone(),
                source: e,
            })?;
            // Drop closes the pipe so the child sees EOF.
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CommandError::Io {
                cmd: cmd_line.clone(),
                source: e,
            })?;

        let result = CommandOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };

        if !result.stdout.is_empty() {
            tracing::debug!(cmd = %cmd_line, "stdout: {}", result.stdout.trim_end());
        }
        if !result.stderr.is_empty() {
            tracing::debug!(cmd = %cmd_line, "stderr: {}", result.stderr.trim_end());
        }

        Ok(result)
    }

    /// Run a command and fail unless it exits zero. Returns stdout.
    pub async fn run_checked<S: AsRef<str>>(argv: &[S]) -> CommandResult<String> {
        let cmd_line = render_argv(argv);
        let output = Self::run(argv).await?;
        if !output.success {
            return Err(CommandError::Failed {
                cmd: cmd_line,
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(output.stdout)
    }

    /// Checked variant with stdin.
    pub async fn run_checked_with_stdin<S: AsRef<str>>(
        argv: &[S],
        stdin: &[u8],
    ) -> CommandResult<String> {
        let cmd_line = render_argv(argv);
        let output = Self::run_with_stdin(argv, Some(stdin)).await?;
        if !output.success {
            return Err(CommandError::Failed {
                cmd: cmd_line,
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(output.stdout)
    }

    /// Prepend `sudo` when not already running as root.
    pub fn sudo_wrap(argv: Vec<String>) -> Vec<String> {
        if nix::unistd::geteuid().is_root() {
            argv
        } else {
            let mut wrapped = Vec::with_capacity(argv.len() + 1);
            wrapped.push("sudo".to_string());
            wrapped.extend(argv);
            wrapped
        }
    }

    /// Prepend `ip netns exec {ns}` for a non-empty namespace name.
    pub fn ns_wrap(ns: &str, argv: Vec<String>) -> Vec<String> {
        if ns.is_empty() {
            argv
        } else {
            let mut wrapped = Vec::with_capacity(argv.len() + 4);
            wrapped.extend(["ip", "netns", "exec", ns].iter().map(|s| s.to_string()));
            wrapped.extend(argv);
            wrapped
        }
    }

    /// Privileged execution inside a namespace: `run_checked(sudo_wrap(ns_wrap(..)))`.
    pub async fn run_privileged(ns: &str, argv: Vec<String>) -> CommandResult<String> {
        let argv = Self::sudo_wrap(Self::ns_wrap(ns, argv));
        Self::run_checked(&argv).await
    }

    /// Privileged, uncaptured-exit variant for callers that inspect stderr.
    pub async fn run_privileged_raw(ns: &str, argv: Vec<String>) -> CommandResult<CommandOutput> {
        let argv = Self::sudo_wrap(Self::ns_wrap(ns, argv));
        Self::run(&argv).await
    }
}

fn render_argv<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|a| a.as_ref())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build an owned argv from string slices and formatted pieces.
pub fn argv<S: AsRef<str>>(parts: &[S]) -> Vec<String> {
    parts.iter().map(|p| p.as_ref().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ns_wrap_skips_empty_namespace() {
        let cmd = argv(&["wg", "show"]);
        assert_eq!(CommandExecutor::ns_wrap("", cmd.clone()), cmd);
        assert_eq!(
            CommandExecutor::ns_wrap("netA", cmd),
            argv(&["ip", "netns", "exec", "netA", "wg", "show"])
        );
    }

    #[tokio::test]
    async fn run_captures_nonzero_exit_without_error() {
        let out = CommandExecutor::run(&["false"]).await.unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(1));
    }

    #[tokio::test]
    async fn run_checked_fails_on_nonzero_exit() {
        let err = CommandExecutor::run_checked(&["false"]).await.unwrap_err();
        match err {
            CommandError::Failed { exit_code, .. } => assert_eq!(exit_code, Some(1)),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn stdin_reaches_the_child() {
        let out = CommandExecutor::run_checked_with_stdin(&["cat"], b"key-material")
            .await
            .unwrap();
        assert_eq!(out, "key-material");
    }
}
