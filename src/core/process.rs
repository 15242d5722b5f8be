#![forbid(unsafe_code)]

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::TaskqError;

const WAIT_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    /// Process exit code; `-1` when terminated by a signal.
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Run `cmd` to completion capturing both streams; the child is killed when
/// `timeout` elapses and [`TaskqError::Timeout`] is returned.
pub fn run_captured(mut cmd: Command, timeout: Option<Duration>) -> Result<CapturedOutput, TaskqError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => TaskqError::Other(format!("{program} not found in PATH")),
        _ => TaskqError::Other(format!("failed to run {program}: {e}")),
    })?;

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let start = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => return Err(TaskqError::Other(format!("failed to wait for {program}: {e}"))),
        }
        if let Some(limit) = timeout
            && start.elapsed() >= limit
        {
            let _ = child.kill();
            let _ = child.wait();
            return Err(TaskqError::Timeout {
                what: program,
                after: limit,
            });
        }
        std::thread::sleep(WAIT_INTERVAL);
    };

    Ok(CapturedOutput {
        code: status.code().unwrap_or(-1),
        stdout: join(stdout),
        stderr: join(stderr),
    })
}

fn drain<R: Read + Send + 'static>(mut r: R) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = r.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn captures_streams_and_exit_code() {
        let out = run_captured(sh("echo out; echo err >&2; exit 3"), None).unwrap();
        assert_eq!(out.code, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.success());
    }

    #[test]
    fn kills_on_timeout() {
        let start = Instant::now();
        let err = run_captured(sh("sleep 5"), Some(Duration::from_millis(100))).unwrap_err();
        assert!(matches!(err, TaskqError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn missing_program_is_an_error() {
        let err = run_captured(Command::new("taskq-no-such-binary"), None).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
