//! Shell subprocess execution behind the `ProcessRunner` port.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::command::{CommandOutputSink, OutputStream};

/// How long a process group gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Result of running a subprocess to completion (or to its forced end).
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
}

/// Port abstracting subprocess execution so engine tests can script it.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        node_id: &str,
        command: &str,
        timeout: Duration,
        interactive: bool,
        cancel: &CancellationToken,
        sink: Arc<dyn CommandOutputSink>,
    ) -> std::io::Result<ProcessOutput>;
}

/// Default implementation: `sh -c <command>` in its own process group, with
/// line-streamed capture. Interactive commands inherit the terminal and
/// capture nothing.
pub struct ShellProcessRunner;

#[async_trait]
impl ProcessRunner for ShellProcessRunner {
    async fn run(
        &self,
        node_id: &str,
        command: &str,
        timeout: Duration,
        interactive: bool,
        cancel: &CancellationToken,
        sink: Arc<dyn CommandOutputSink>,
    ) -> std::io::Result<ProcessOutput> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command);

        if !interactive {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }

        // Own process group, so timeouts can kill the whole tree.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();
        debug!(node_id, pid, "spawned command");

        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let stderr_buf = Arc::new(Mutex::new(String::new()));
        let mut readers: Vec<JoinHandle<()>> = Vec::new();

        if !interactive {
            if let Some(stdout) = child.stdout.take() {
                readers.push(spawn_reader(
                    stdout,
                    node_id.to_string(),
                    OutputStream::Stdout,
                    Arc::clone(&sink),
                    Arc::clone(&stdout_buf),
                ));
            }
            if let Some(stderr) = child.stderr.take() {
                readers.push(spawn_reader(
                    stderr,
                    node_id.to_string(),
                    OutputStream::Stderr,
                    Arc::clone(&sink),
                    Arc::clone(&stderr_buf),
                ));
            }
        }

        let mut timed_out = false;
        let mut cancelled = false;

        let exit_code = tokio::select! {
            status = child.wait() => exit_code_of(status?),
            _ = tokio::time::sleep(timeout) => {
                warn!(node_id, timeout_secs = timeout.as_secs(), "command timed out");
                timed_out = true;
                terminate_group(&mut child, pid).await
            }
            _ = cancel.cancelled() => {
                debug!(node_id, "command cancelled");
                cancelled = true;
                terminate_group(&mut child, pid).await
            }
        };

        // Pipes close once the process group is gone; drain the readers.
        for reader in readers {
            let _ = reader.await;
        }

        let stdout = stdout_buf.lock().unwrap().clone();
        let stderr = stderr_buf.lock().unwrap().clone();

        Ok(ProcessOutput {
            exit_code,
            stdout,
            stderr,
            timed_out,
            cancelled,
        })
    }
}

fn spawn_reader(
    stream: impl AsyncRead + Unpin + Send + 'static,
    node_id: String,
    kind: OutputStream,
    sink: Arc<dyn CommandOutputSink>,
    buf: Arc<Mutex<String>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.line(&node_id, kind, &line);
            let mut buf = buf.lock().unwrap();
            buf.push_str(&line);
            buf.push('\n');
        }
    })
}

fn exit_code_of(status: std::process::ExitStatus) -> i64 {
    status.code().map(i64::from).unwrap_or(-1)
}

/// SIGTERM the process group, give it [`KILL_GRACE`], then SIGKILL.
async fn terminate_group(child: &mut Child, pid: Option<u32>) -> i64 {
    signal_group(pid, libc::SIGTERM);

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => exit_code_of(status),
        _ => {
            signal_group(pid, libc::SIGKILL);
            match child.wait().await {
                Ok(status) => exit_code_of(status),
                Err(_) => -1,
            }
        }
    }
}

fn signal_group(pid: Option<u32>, signal: i32) {
    if let Some(pid) = pid {
        unsafe {
            libc::killpg(pid as libc::pid_t, signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::NullSink;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = ShellProcessRunner
            .run(
                "n",
                "echo hello && exit 0",
                Duration::from_secs(5),
                false,
                &token(),
                Arc::new(NullSink),
            )
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "hello\n");
        assert!(!out.timed_out);
    }

    #[tokio::test]
    async fn nonzero_exit_preserved() {
        let out = ShellProcessRunner
            .run(
                "n",
                "echo oops >&2; exit 7",
                Duration::from_secs(5),
                false,
                &token(),
                Arc::new(NullSink),
            )
            .await
            .unwrap();
        assert_eq!(out.exit_code, 7);
        assert_eq!(out.stderr, "oops\n");
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let out = ShellProcessRunner
            .run(
                "n",
                "sleep 30",
                Duration::from_millis(100),
                false,
                &token(),
                Arc::new(NullSink),
            )
            .await
            .unwrap();
        assert!(out.timed_out);
    }

    #[tokio::test]
    async fn cancellation_stops_the_process() {
        let cancel = token();
        let child_token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            child_token.cancel();
        });

        let out = ShellProcessRunner
            .run(
                "n",
                "sleep 30",
                Duration::from_secs(60),
                false,
                &cancel,
                Arc::new(NullSink),
            )
            .await
            .unwrap();
        assert!(out.cancelled);
        assert!(!out.timed_out);
    }
}
