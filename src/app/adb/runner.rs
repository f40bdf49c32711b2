use std::io::Read;
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::app::error::AppError;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turns a non-zero exit into a dependency error carrying stderr (or stdout when stderr is empty).
    pub fn ensure_success(self, what: &str, trace_id: &str) -> Result<CommandOutput, AppError> {
        if self.succeeded() {
            return Ok(self);
        }
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            self.stderr.trim().to_string()
        };
        Err(AppError::dependency(
            format!("{what} failed (exit {:?}): {detail}", self.exit_code),
            trace_id,
        ))
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buffer = Vec::<u8>::new();
        let mut temp = [0u8; 4096];
        loop {
            match reader.read(&mut temp) {
                Ok(0) | Err(_) => break,
                Ok(count) => buffer.extend_from_slice(&temp[..count]),
            }
        }
        buffer
    })
}

pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    debug!(trace_id = %trace_id, program = %program, args = ?args, "spawning command");
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| AppError::dependency(format!("Failed to spawn {program}: {err}"), trace_id))?;

    // Both pipes are drained concurrently so a chatty child never blocks on a full buffer.
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stdout", trace_id))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::system("Failed to capture stderr", trace_id))?;
    let stdout_handle = drain(stdout);
    let stderr_handle = drain(stderr);

    let start = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_handle.join();
                    let _ = stderr_handle.join();
                    return Err(AppError::system(
                        format!("{program} timed out after {} ms", timeout.as_millis()),
                        trace_id,
                    ));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(AppError::system(
                    format!("Failed to poll command: {err}"),
                    trace_id,
                ));
            }
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        exit_code,
    })
}

/// Prefixes `-s <serial>` when a device is pinned.
pub fn adb_args<S: AsRef<str>>(serial: Option<&str>, args: &[S]) -> Vec<String> {
    let mut full = Vec::with_capacity(args.len() + 2);
    if let Some(serial) = serial.filter(|value| !value.trim().is_empty()) {
        full.push("-s".to_string());
        full.push(serial.to_string());
    }
    full.extend(args.iter().map(|arg| arg.as_ref().to_string()));
    full
}

pub fn run_adb<S: AsRef<str>>(
    program: &str,
    serial: Option<&str>,
    args: &[S],
    timeout: Duration,
    trace_id: &str,
) -> Result<CommandOutput, AppError> {
    run_command_with_timeout(program, &adb_args(serial, args), timeout, trace_id)
}
