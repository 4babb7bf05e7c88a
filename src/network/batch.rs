//! Blocking command execution and the best-effort batch combinator.

use std::fmt;
use std::process::{Command, Stdio};

use crate::error::EffectorError;

/// One OS command, e.g. `gsettings set org.gnome.system.proxy mode 'none'`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl SysCommand {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for SysCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(' ') {
                write!(f, " \"{arg}\"")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            status: "exit status: 0".into(),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            status: "exit status: 1".into(),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Executes commands synchronously. Swapped for a fake in tests.
pub trait CommandRunner: Send + Sync {
    /// `Err` only when the program could not be started at all.
    fn run(&self, cmd: &SysCommand) -> Result<CommandOutput, EffectorError>;
}

/// Runs commands on the host, blocking the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &SysCommand) -> Result<CommandOutput, EffectorError> {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }
        let output = command.output().map_err(|source| EffectorError::Launch {
            command: cmd.to_string(),
            source,
        })?;
        Ok(CommandOutput {
            success: output.status.success(),
            status: output.status.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Run `cmd`, turning a non-zero exit into an error.
pub fn run_checked(runner: &dyn CommandRunner, cmd: &SysCommand) -> Result<String, EffectorError> {
    let output = runner.run(cmd)?;
    if output.success {
        Ok(output.stdout)
    } else {
        Err(EffectorError::Failed {
            command: cmd.to_string(),
            status: output.status,
            stderr: output.stderr,
        })
    }
}

/// Per-command outcomes of a batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<(SysCommand, Result<(), EffectorError>)>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|(_, r)| r.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&SysCommand, &EffectorError)> {
        self.outcomes
            .iter()
            .filter_map(|(cmd, r)| r.as_ref().err().map(|e| (cmd, e)))
    }

    pub fn all_ok(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Run every command regardless of earlier failures.
///
/// Failures are logged and recorded in the report; nothing is propagated.
/// On a machine without, say, a Thunderbolt interface, that one command
/// fails and the rest still apply.
pub fn run_batch(runner: &dyn CommandRunner, commands: &[SysCommand]) -> BatchReport {
    let outcomes = commands
        .iter()
        .map(|cmd| {
            let result = run_checked(runner, cmd).map(|_| ());
            if let Err(ref e) = result {
                tracing::warn!("system command failed: {e}");
            }
            (cmd.clone(), result)
        })
        .collect();
    BatchReport { outcomes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Flaky {
        seen: Mutex<Vec<String>>,
    }

    impl CommandRunner for Flaky {
        fn run(&self, cmd: &SysCommand) -> Result<CommandOutput, EffectorError> {
            self.seen.lock().push(cmd.to_string());
            match cmd.args.first().map(String::as_str) {
                Some("missing") => Err(EffectorError::Launch {
                    command: cmd.to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                }),
                Some("bad") => Ok(CommandOutput::failed("no such service")),
                _ => Ok(CommandOutput::ok("")),
            }
        }
    }

    #[test]
    fn batch_runs_everything_and_reports_failures() {
        let runner = Flaky {
            seen: Mutex::new(Vec::new()),
        };
        let cmds = vec![
            SysCommand::new("tool", ["good"]),
            SysCommand::new("tool", ["bad"]),
            SysCommand::new("tool", ["missing"]),
            SysCommand::new("tool", ["good", "again"]),
        ];
        let report = run_batch(&runner, &cmds);
        assert_eq!(runner.seen.lock().len(), 4);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failures().count(), 2);
        assert!(!report.all_ok());
    }

    #[test]
    fn display_quotes_spaced_args() {
        let cmd = SysCommand::new(
            "networksetup",
            ["-setwebproxystate", "Thunderbolt Ethernet", "off"],
        );
        assert_eq!(
            cmd.to_string(),
            "networksetup -setwebproxystate \"Thunderbolt Ethernet\" off"
        );
    }
}
