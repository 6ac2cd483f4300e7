//! Supervision of external command-line tools.
//!
//! Every tool the harness drives (`helm`, `kubectl`, port-forwarders) goes
//! through [`ProcessSupervisor`]. Output is forwarded line by line to
//! `tracing` under the `env.process` target so a failing run can be
//! diagnosed from the test log alone.

use common::error::{HarnessError, Result};
use std::fmt;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Lines buffered for the holder of a [`ProcessHandle`]. Further lines are
/// still logged but no longer queued.
const HANDLE_LINE_BUFFER: usize = 256;

/// A program, its arguments, and extra environment variables.
///
/// A base invocation may carry leading arguments (for example
/// `sh -c <script>`); [`Invocation::args`] appends after them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Output of a process that ran to a successful exit.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Standard output only, for callers that parse it.
    pub stdout: String,
    /// Standard output and error interleaved in arrival order.
    pub combined: String,
}

/// Spawns external tools with a shared base environment.
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    base_env: Vec<(String, String)>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an environment variable applied to every invocation.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.base_env.push((key.into(), value.into()));
        self
    }

    fn spawn(&self, invocation: &Invocation) -> Result<Child> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(self.base_env.iter().map(|(k, v)| (k, v)))
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(target: "env.process", command = %invocation, "Spawning process");

        command.spawn().map_err(|source| HarnessError::LaunchFailure {
            program: invocation.program.clone(),
            source,
        })
    }

    /// Run to completion and capture combined output.
    ///
    /// # Errors
    ///
    /// `LaunchFailure` if the program could not be started, `ExitFailure`
    /// with the captured output if it exited unsuccessfully.
    pub async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let mut child = self.spawn(invocation)?;

        let (tx, mut rx) = mpsc::unbounded_channel::<(Stream, String)>();
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            forward_lines(stdout, invocation.program.clone(), Stream::Stdout, move |line| {
                let _ = tx.send((Stream::Stdout, line));
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            forward_lines(stderr, invocation.program.clone(), Stream::Stderr, move |line| {
                let _ = tx.send((Stream::Stderr, line));
            });
        }
        drop(tx);

        let mut output = CommandOutput::default();
        while let Some((stream, line)) = rx.recv().await {
            if stream == Stream::Stdout {
                output.stdout.push_str(&line);
                output.stdout.push('\n');
            }
            output.combined.push_str(&line);
            output.combined.push('\n');
        }

        // Waiting only fails if the OS lost track of the child.
        let status = child
            .wait()
            .await
            .map_err(|source| HarnessError::LaunchFailure {
                program: invocation.program.clone(),
                source,
            })?;

        if status.success() {
            Ok(output)
        } else {
            warn!(
                target: "env.process",
                command = %invocation,
                code = ?status.code(),
                "Process exited unsuccessfully"
            );
            Err(HarnessError::ExitFailure {
                program: invocation.program.clone(),
                code: status.code(),
                output: output.combined,
            })
        }
    }

    /// Launch without waiting; the caller owns the returned handle.
    ///
    /// # Errors
    ///
    /// `LaunchFailure` if the program could not be started.
    pub fn start(&self, invocation: &Invocation) -> Result<ProcessHandle> {
        let mut child = self.spawn(invocation)?;

        let (tx, rx) = mpsc::channel(HANDLE_LINE_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            forward_lines(stdout, invocation.program.clone(), Stream::Stdout, move |line| {
                let _ = tx.try_send(line);
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            forward_lines(stderr, invocation.program.clone(), Stream::Stderr, move |line| {
                let _ = tx.try_send(line);
            });
        }

        Ok(ProcessHandle {
            program: invocation.program.clone(),
            child,
            lines: rx,
            exit: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn as_str(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

fn forward_lines<R, F>(reader: R, program: String, stream: Stream, mut sink: F)
where
    R: AsyncRead + Unpin + Send + 'static,
    F: FnMut(String) + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(
                        target: "env.process",
                        program = %program,
                        stream = stream.as_str(),
                        "{line}"
                    );
                    sink(line);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        target: "env.process",
                        program = %program,
                        stream = stream.as_str(),
                        error = %e,
                        "Failed to read process output"
                    );
                    break;
                }
            }
        }
    });
}

/// A running process started by [`ProcessSupervisor::start`].
///
/// The child is killed if the handle is dropped while it is still running.
#[derive(Debug)]
pub struct ProcessHandle {
    program: String,
    child: Child,
    lines: mpsc::Receiver<String>,
    exit: Option<ExitStatus>,
}

impl ProcessHandle {
    pub fn program(&self) -> &str {
        &self.program
    }

    /// OS process id, or `None` once the process has been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Next line of stdout or stderr. `None` once both streams are closed.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Exit status if the process has already exited.
    ///
    /// # Errors
    ///
    /// `LaunchFailure` if the OS cannot report on the child.
    pub fn try_exit(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.exit {
            return Ok(Some(status));
        }
        let status = self
            .child
            .try_wait()
            .map_err(|source| HarnessError::LaunchFailure {
                program: self.program.clone(),
                source,
            })?;
        self.exit = status;
        Ok(status)
    }

    /// Ask the process to terminate gracefully (SIGINT).
    ///
    /// A process that has already exited is left alone.
    ///
    /// # Errors
    ///
    /// `LaunchFailure` if the signal could not be delivered.
    pub fn interrupt(&mut self) -> Result<()> {
        if self.try_exit()?.is_some() {
            return Ok(());
        }
        let Some(pid) = self.pid().and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
            return Ok(());
        };

        debug!(target: "env.process", program = %self.program, pid, "Sending SIGINT");

        // SAFETY: kill() has no memory-safety preconditions; pid belongs to
        // a child we have not reaped yet.
        let rc = unsafe { libc::kill(pid, libc::SIGINT) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            // ESRCH: exited between try_exit and kill.
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(HarnessError::LaunchFailure {
                    program: self.program.clone(),
                    source: err,
                });
            }
        }
        Ok(())
    }

    /// Block until the process exits.
    ///
    /// # Errors
    ///
    /// `LaunchFailure` if the OS cannot report on the child.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit {
            return Ok(status);
        }
        let status = self
            .child
            .wait()
            .await
            .map_err(|source| HarnessError::LaunchFailure {
                program: self.program.clone(),
                source,
            })?;
        self.exit = Some(status);
        Ok(status)
    }

    /// Kill the process (SIGKILL) and reap it.
    ///
    /// # Errors
    ///
    /// `LaunchFailure` if the process could not be killed or reaped.
    pub async fn kill(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.try_exit()? {
            return Ok(status);
        }

        warn!(target: "env.process", program = %self.program, pid = ?self.pid(), "Killing process");
        self.child
            .kill()
            .await
            .map_err(|source| HarnessError::LaunchFailure {
                program: self.program.clone(),
                source,
            })?;
        self.wait().await
    }
}
