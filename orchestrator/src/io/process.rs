//! Helpers for running child processes with timeouts and bounded output.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// How long to wait for the output pipes to close once the process group is gone.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(5);

type ReaderResult = Result<(Vec<u8>, usize)>;

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// The child leads its own process group. Output is read concurrently while it runs, and
/// `output_limit_bytes` bounds what is kept in memory (the rest is drained and discarded).
/// When the child exits or times out, the whole group is killed so descendants holding the
/// pipes cannot outlive the call. On timeout `timed_out` is set; the caller decides how to
/// report it.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_rx = spawn_reader(stdout, output_limit_bytes);
    let stderr_rx = spawn_reader(stderr, output_limit_bytes);

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_process_group(child.id());
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };
    // Stragglers left behind by a finished child still hold the pipes.
    kill_process_group(child.id());

    let (stdout, stdout_truncated) = collect_output(&stdout_rx).context("collect stdout")?;
    let (stderr, stderr_truncated) = collect_output(&stderr_rx).context("collect stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    let elapsed = started.elapsed();
    debug!(exit_code = ?status.code(), timed_out, elapsed_ms = elapsed.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        elapsed,
    })
}

fn spawn_reader<R: Read + Send + 'static>(reader: R, limit: usize) -> mpsc::Receiver<ReaderResult> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        // The receiver is gone only if the caller already gave up on this stream.
        let _ = tx.send(read_stream_limited(reader, limit));
    });
    rx
}

fn collect_output(rx: &mpsc::Receiver<ReaderResult>) -> ReaderResult {
    match rx.recv_timeout(PIPE_DRAIN_GRACE) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(anyhow!(
            "output pipe still open {}s after the process group exited",
            PIPE_DRAIN_GRACE.as_secs()
        )),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(anyhow!("output reader thread panicked")),
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(pid) else {
        warn!(pid, "pid out of range; cannot signal process group");
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(pgid, err = %err, "failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
