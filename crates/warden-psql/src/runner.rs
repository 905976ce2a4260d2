//! External process seam. Every cluster-side command (`kubectl get`, the dump
//! pod, the restore load) goes through a [`CommandRunner`] so tests can
//! substitute scripted processes.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::process::{ChildStderr, Command};
use tracing::debug;
use warden_common::DataReader;

pub type CommandStdin = Pin<Box<dyn AsyncWrite + Send>>;

/// Trailing stderr bytes kept for error messages.
const STDERR_TAIL: usize = 16 * 1024;

/// Program invocation. Arguments may carry credentials, so `Debug` only shows
/// the program and the leading subcommand.
#[derive(Clone, Default)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Program name plus its first non-flag argument, for logs.
    pub fn label(&self) -> String {
        let program = self
            .program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        match self.args.iter().find(|a| !a.starts_with('-')) {
            Some(sub) => format!("{program} {sub}"),
            None => program,
        }
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("command", &self.label())
            .field("args", &self.args.len())
            .finish()
    }
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub code: Option<i32>,
    pub stderr: String,
}

impl CommandOutcome {
    pub fn success() -> Self {
        Self {
            code: Some(0),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn into_io_error(self, label: &str) -> io::Error {
        let code = self
            .code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        io::Error::new(
            io::ErrorKind::Other,
            format!("{label} exited with {code}: {}", self.stderr.trim()),
        )
    }
}

/// A spawned process. Dropping it (or the stream made from it) terminates the
/// process.
pub struct RunningCommand {
    label: String,
    pub stdin: Option<CommandStdin>,
    pub stdout: Option<DataReader>,
    exit: BoxFuture<'static, io::Result<CommandOutcome>>,
}

impl RunningCommand {
    pub fn new(
        label: impl Into<String>,
        stdin: Option<CommandStdin>,
        stdout: Option<DataReader>,
        exit: BoxFuture<'static, io::Result<CommandOutcome>>,
    ) -> Self {
        Self {
            label: label.into(),
            stdin,
            stdout,
            exit,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Writes `input` to stdin, closes it, and collects stdout. A non-zero exit is
    /// an error carrying the captured stderr.
    pub async fn output(mut self, input: Option<&[u8]>) -> io::Result<Vec<u8>> {
        let stdin = self.stdin.take();
        let stdout = self.stdout.take();
        let write = async move {
            if let Some(mut stdin) = stdin {
                if let Some(input) = input {
                    stdin.write_all(input).await?;
                }
                stdin.shutdown().await?;
            }
            Ok::<_, io::Error>(())
        };
        let read = async move {
            let mut out = Vec::new();
            if let Some(mut stdout) = stdout {
                stdout.read_to_end(&mut out).await?;
            }
            Ok::<_, io::Error>(out)
        };
        let (written, out, outcome) = tokio::join!(write, read, self.exit);
        let outcome = outcome?;
        if !outcome.is_success() {
            return Err(outcome.into_io_error(&self.label));
        }
        written?;
        out
    }

    /// Streams `input` into stdin while draining stdout, then checks the exit
    /// status. Returns the number of bytes fed.
    pub async fn feed(mut self, mut input: DataReader) -> io::Result<u64> {
        let mut stdin = self.stdin.take().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("{} has no stdin", self.label),
            )
        })?;
        let stdout = self.stdout.take();
        let write = async move {
            let n = tokio::io::copy(&mut input, &mut stdin).await?;
            stdin.shutdown().await?;
            Ok::<_, io::Error>(n)
        };
        let drain = async move {
            if let Some(mut stdout) = stdout {
                tokio::io::copy(&mut stdout, &mut tokio::io::sink()).await?;
            }
            Ok::<_, io::Error>(())
        };
        let (written, drained, outcome) = tokio::join!(write, drain, self.exit);
        let outcome = outcome?;
        if !outcome.is_success() {
            return Err(outcome.into_io_error(&self.label));
        }
        drained?;
        written
    }

    /// Turns stdout into a reader that owns the process. End of stream waits
    /// for the exit status, so a failed producer surfaces as a read error.
    pub fn into_stream(mut self) -> DataReader {
        drop(self.stdin.take());
        let stdout = self
            .stdout
            .take()
            .unwrap_or_else(|| Box::pin(tokio::io::empty()) as DataReader);
        Box::pin(ProcessStream {
            label: self.label,
            stdout,
            exit: Some(self.exit),
        })
    }
}

struct ProcessStream {
    label: String,
    stdout: DataReader,
    exit: Option<BoxFuture<'static, io::Result<CommandOutcome>>>,
}

impl AsyncRead for ProcessStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(this.stdout.as_mut().poll_read(cx, buf))?;
        if buf.filled().len() > before || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if let Some(exit) = this.exit.as_mut() {
            let outcome = ready!(exit.poll_unpin(cx));
            this.exit = None;
            let outcome = outcome?;
            if !outcome.is_success() {
                return Poll::Ready(Err(outcome.into_io_error(&this.label)));
            }
            debug!(command = %this.label, "Producer exited cleanly");
        }
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn spawn(&self, spec: &CommandSpec) -> io::Result<RunningCommand>;
}

/// Runs commands as local child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn spawn(&self, spec: &CommandSpec) -> io::Result<RunningCommand> {
        let label = spec.label();
        debug!(command = %label, "Spawning process");
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().map(|s| Box::pin(s) as CommandStdin);
        let stdout = child.stdout.take().map(|s| Box::pin(s) as DataReader);
        // Drained from spawn on, or a chatty child blocks before closing stdout.
        let stderr = child.stderr.take().map(|s| tokio::spawn(drain_stderr(s)));

        let exit = async move {
            let status = child.wait().await?;
            let stderr = match stderr {
                Some(task) => task
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??,
                None => String::new(),
            };
            Ok(CommandOutcome {
                code: status.code(),
                stderr,
            })
        }
        .boxed();

        Ok(RunningCommand::new(label, stdin, stdout, exit))
    }
}

/// Reads stderr to the end, keeping only the last [`STDERR_TAIL`] bytes.
async fn drain_stderr(mut stderr: ChildStderr) -> io::Result<String> {
    let mut tail = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = stderr.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        tail.extend_from_slice(&chunk[..n]);
        if tail.len() > STDERR_TAIL {
            let excess = tail.len() - STDERR_TAIL;
            tail.drain(..excess);
        }
    }
    Ok(String::from_utf8_lossy(&tail).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;

    fn scripted(stdout: &[u8], outcome: CommandOutcome) -> RunningCommand {
        RunningCommand::new(
            "scripted",
            None,
            Some(Box::pin(Cursor::new(stdout.to_vec()))),
            futures::future::ready(Ok(outcome)).boxed(),
        )
    }

    #[test]
    fn test_label_hides_arguments() {
        let spec = CommandSpec::new("/usr/local/bin/kubectl")
            .args(["--kubeconfig=/k", "run"])
            .arg("--env")
            .arg("PGPASSWORD=hunter2");
        assert_eq!(spec.label(), "kubectl run");
        assert!(!format!("{spec:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn test_stream_reports_failed_exit() {
        let mut ok = scripted(b"dump", CommandOutcome::success()).into_stream();
        let mut buf = Vec::new();
        ok.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"dump");

        let mut failed = scripted(b"partial", CommandOutcome::failure(2, "pg_dump: error")).into_stream();
        let mut buf = Vec::new();
        let err = failed.read_to_end(&mut buf).await.unwrap_err();
        assert!(err.to_string().contains("pg_dump: error"));
    }

    #[tokio::test]
    async fn test_output_checks_exit_status() {
        let out = scripted(b"{}", CommandOutcome::success()).output(None).await.unwrap();
        assert_eq!(out, b"{}");
        let err = scripted(b"", CommandOutcome::failure(1, "NotFound"))
            .output(None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited with 1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_round_trip() {
        let spec = CommandSpec::new("sh").args(["-c", "cat; echo done >&2; exit 3"]);
        let running = ProcessRunner.spawn(&spec).await.unwrap();
        let err = running.output(Some(b"hello")).await.unwrap_err();
        assert!(err.to_string().contains("exited with 3: done"));

        let spec = CommandSpec::new("sh").args(["-c", "cat"]);
        let out = ProcessRunner
            .spawn(&spec)
            .await
            .unwrap()
            .output(Some(b"hello"))
            .await
            .unwrap();
        assert_eq!(out, b"hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stream_survives_heavy_stderr() {
        let spec = CommandSpec::new("sh").args([
            "-c",
            "head -c 300000 /dev/zero | tr '\\0' x >&2; echo data",
        ]);
        let mut stream = ProcessRunner.spawn(&spec).await.unwrap().into_stream();
        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut buf))
            .await
            .expect("stream did not finish")
            .unwrap();
        assert_eq!(buf, b"data\n");

        let spec = CommandSpec::new("sh").args([
            "-c",
            "head -c 300000 /dev/zero | tr '\\0' x >&2; echo fatal >&2; exit 4",
        ]);
        let err = tokio::time::timeout(
            Duration::from_secs(10),
            ProcessRunner.spawn(&spec).await.unwrap().output(None),
        )
        .await
        .expect("command did not finish")
        .unwrap_err()
        .to_string();
        assert!(err.contains("exited with 4"));
        assert!(err.ends_with("fatal"));
        assert!(err.len() < STDERR_TAIL + 500);
    }
}
