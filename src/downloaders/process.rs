//! Subprocess plumbing shared by the yt-dlp and ffmpeg runners
//!
//! Output from both pipes is read line by line and handed to a callback in
//! arrival order. The child is killed as soon as the cancellation token
//! fires or the idle timeout elapses. On unix the child leads its own process
//! group and the whole group is killed, so helpers it started (the ffmpeg
//! merge step of yt-dlp) go with it.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Number of stderr lines kept for error reporting
const STDERR_TAIL_LINES: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub status: ExitStatus,
    pub stderr_tail: String,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to start process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("process was cancelled")]
    Cancelled,

    #[error("no output for {0:?}")]
    IdleTimeout(Duration),

    #[error("failed waiting for process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Run `command`, streaming every output line to `on_line`.
///
/// Returns once both pipes are closed and the process has exited.
pub async fn run_streaming<F>(
    mut command: Command,
    cancel: &CancellationToken,
    idle_timeout: Option<Duration>,
    mut on_line: F,
) -> Result<RunOutcome, RunError>
where
    F: FnMut(&OutputLine),
{
    if cancel.is_cancelled() {
        return Err(RunError::Cancelled);
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(RunError::Spawn)?;
    debug!("Spawned subprocess pid={:?}", child.id());

    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        spawn_line_reader(stdout, OutputStream::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_line_reader(stderr, OutputStream::Stderr, tx.clone());
    }
    drop(tx);

    let mut stderr_tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);

    loop {
        let idle = async {
            match idle_timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(RunError::Cancelled);
            }
            line = rx.recv() => match line {
                Some(line) => {
                    if line.stream == OutputStream::Stderr {
                        if stderr_tail.len() == STDERR_TAIL_LINES {
                            stderr_tail.pop_front();
                        }
                        stderr_tail.push_back(line.text.clone());
                    }
                    on_line(&line);
                }
                None => break,
            },
            _ = idle => {
                terminate(&mut child).await;
                return Err(RunError::IdleTimeout(idle_timeout.unwrap_or_default()));
            }
        }
    }

    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            terminate(&mut child).await;
            return Err(RunError::Cancelled);
        }
        status = child.wait() => status.map_err(RunError::Wait)?,
    };

    Ok(RunOutcome {
        status,
        stderr_tail: Vec::from(stderr_tail).join("\n"),
    })
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: kill(2) only takes integers; a negative pid targets the group.
        unsafe {
            libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
        }
    }
    if let Err(e) = child.kill().await {
        warn!("Failed to kill subprocess: {}", e);
    }
}

fn spawn_line_reader<R>(reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send(OutputLine { stream, text }).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(script);
        command
    }

    #[tokio::test]
    async fn test_streams_lines_in_order() {
        let cancel = CancellationToken::new();
        let mut lines = Vec::new();
        let outcome = run_streaming(
            sh("echo one; echo two; echo oops >&2; exit 3"),
            &cancel,
            None,
            |line| lines.push(line.clone()),
        )
        .await
        .unwrap();

        assert_eq!(outcome.status.code(), Some(3));
        assert_eq!(outcome.stderr_tail, "oops");
        let stdout: Vec<&str> = lines
            .iter()
            .filter(|l| l.stream == OutputStream::Stdout)
            .map(|l| l.text.as_str())
            .collect();
        assert_eq!(stdout, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = run_streaming(sh("exec sleep 30"), &cancel, None, |_| {}).await;

        assert!(matches!(result, Err(RunError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancellation_kills_grandchildren() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("survived");
        let script = format!(
            "(sleep 1; touch '{}') & echo started; wait",
            marker.display()
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let result = run_streaming(sh(&script), &cancel, None, |line| {
            if line.text == "started" {
                trigger.cancel();
            }
        })
        .await;
        assert!(matches!(result, Err(RunError::Cancelled)));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let cancel = CancellationToken::new();
        let result = run_streaming(
            sh("exec sleep 30"),
            &cancel,
            Some(Duration::from_millis(100)),
            |_| {},
        )
        .await;

        assert!(matches!(result, Err(RunError::IdleTimeout(_))));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let cancel = CancellationToken::new();
        let result = run_streaming(
            Command::new("/definitely/not/a/program"),
            &cancel,
            None,
            |_| {},
        )
        .await;

        assert!(matches!(result, Err(RunError::Spawn(_))));
    }
}
