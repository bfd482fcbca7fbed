//! Process execution behind a trait, so the nft adapter can be tested
//! without the binary.

use anyhow::{bail, Context, Result};
use std::io::Write;
use std::process::{Command, Output, Stdio};

#[cfg(test)]
use mockall::automock;

/// Captured result of one process run
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit status was zero
    pub success: bool,
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Stdout of a successful run, or an error carrying stderr.
    pub fn into_stdout(self, program: &str) -> Result<String> {
        if self.success {
            return Ok(self.stdout);
        }
        let stderr = self.stderr.trim();
        match self.code {
            Some(_) if !stderr.is_empty() => bail!("{} failed: {}", program, stderr),
            Some(code) => bail!("{} failed with exit code {}", program, code),
            None => bail!("{} was terminated by a signal", program),
        }
    }
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: output.status.success(),
            code: output.status.code(),
        }
    }
}

/// Runs external programs.
///
/// Arguments are `&[String]` rather than `&[&str]` so mockall can generate
/// the mock without lifetime trouble.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    /// Run `cmd` with stdin closed.
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput>;

    /// Run `cmd` feeding `stdin` to it; used to submit nft scripts with `-f -`.
    fn execute_with_stdin(&self, cmd: &str, args: &[String], stdin: &str) -> Result<CommandOutput>;
}

/// [`CommandExecutor`] backed by `std::process`
#[derive(Debug, Clone, Default)]
pub struct RealCommandExecutor;

impl RealCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to spawn {}", cmd))?;
        Ok(output.into())
    }

    fn execute_with_stdin(
        &self,
        cmd: &str,
        args: &[String],
        stdin_data: &str,
    ) -> Result<CommandOutput> {
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", cmd))?;

        // Scripts can be several MB: write from a thread while the child's
        // output is drained, and close stdin when done so the child sees EOF
        let mut stdin = child.stdin.take().context("Child stdin not captured")?;
        let data = stdin_data.to_owned();
        let writer = std::thread::spawn(move || stdin.write_all(data.as_bytes()));

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for {}", cmd))?;
        match writer.join() {
            Ok(Ok(())) => {}
            // The child may exit before reading everything; its status says why
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(e).with_context(|| format!("Failed to write to {}", cmd)),
            Err(_) => bail!("stdin writer for {} panicked", cmd),
        }

        Ok(output.into())
    }
}

/// Convert `&[&str]` arguments to the owned form the trait takes.
pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
