use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::Duration;

use tracing::{info, warn};

use crate::app::adb::parse::{parse_forward_port, parse_package_listed};
use crate::app::adb::runner::{adb_args, run_adb, CommandOutput};
use crate::app::config::DeviceSettings;
use crate::app::error::AppError;
use crate::app::logcat::monitor::LineSource;

const KEYCODE_ENTER: u32 = 66;

/// Window-focus inspection used by the component state monitor.
pub trait FocusInspector: Send + Sync {
    fn window_dump(&self, trace_id: &str) -> Result<String, AppError>;
    fn press_enter(&self, trace_id: &str) -> Result<(), AppError>;
}

/// Device-bridge operations needed by the controller and campaign loop.
pub trait DeviceControl: Send + Sync {
    fn force_stop(&self, package: &str, trace_id: &str) -> Result<(), AppError>;
    fn start_activity(&self, component: &str, trace_id: &str) -> Result<(), AppError>;
    fn forward_port(&self, remote_port: u16, trace_id: &str) -> Result<u16, AppError>;
    fn is_installed(&self, package: &str, trace_id: &str) -> Result<bool, AppError>;
    fn install(&self, apk_path: &Path, trace_id: &str) -> Result<(), AppError>;
    fn push(&self, local: &Path, remote: &str, trace_id: &str) -> Result<(), AppError>;
    fn close_system_dialogs(&self, trace_id: &str) -> Result<(), AppError>;
}

#[derive(Debug, Clone)]
pub struct AdbDevice {
    program: String,
    serial: Option<String>,
    timeout: Duration,
}

impl AdbDevice {
    pub fn new(settings: &DeviceSettings) -> Self {
        Self {
            program: settings.adb_path.clone(),
            serial: settings.device_serial.clone(),
            timeout: Duration::from_millis(settings.command_timeout_ms),
        }
    }

    fn adb<S: AsRef<str>>(&self, args: &[S], trace_id: &str) -> Result<CommandOutput, AppError> {
        run_adb(&self.program, self.serial.as_deref(), args, self.timeout, trace_id)
    }

    fn shell(&self, command: &[&str], trace_id: &str) -> Result<CommandOutput, AppError> {
        let mut args = vec!["shell"];
        args.extend_from_slice(command);
        self.adb(&args, trace_id)
    }
}

impl FocusInspector for AdbDevice {
    fn window_dump(&self, trace_id: &str) -> Result<String, AppError> {
        let output = self
            .shell(&["dumpsys", "window", "windows"], trace_id)?
            .ensure_success("dumpsys window", trace_id)?;
        Ok(output.stdout)
    }

    fn press_enter(&self, trace_id: &str) -> Result<(), AppError> {
        let code = KEYCODE_ENTER.to_string();
        self.shell(&["input", "keyevent", code.as_str()], trace_id)?
            .ensure_success("input keyevent", trace_id)?;
        Ok(())
    }
}

impl DeviceControl for AdbDevice {
    fn force_stop(&self, package: &str, trace_id: &str) -> Result<(), AppError> {
        self.shell(&["am", "force-stop", package], trace_id)?
            .ensure_success("am force-stop", trace_id)?;
        Ok(())
    }

    fn start_activity(&self, component: &str, trace_id: &str) -> Result<(), AppError> {
        let output = self
            .shell(&["am", "start", "-n", component], trace_id)?
            .ensure_success("am start", trace_id)?;
        if output.stdout.contains("Error:") || output.stderr.contains("Error:") {
            return Err(AppError::dependency(
                format!("am start {component} failed: {}", output.stdout.trim()),
                trace_id,
            ));
        }
        Ok(())
    }

    fn forward_port(&self, remote_port: u16, trace_id: &str) -> Result<u16, AppError> {
        let remote = format!("tcp:{remote_port}");
        let output = self
            .adb(&["forward", "tcp:0", remote.as_str()], trace_id)?
            .ensure_success("adb forward", trace_id)?;
        let local = parse_forward_port(&output.stdout).ok_or_else(|| {
            AppError::dependency(
                format!("adb forward returned no port: {}", output.stdout.trim()),
                trace_id,
            )
        })?;
        info!(trace_id = %trace_id, local, remote_port, "port forwarded");
        Ok(local)
    }

    fn is_installed(&self, package: &str, trace_id: &str) -> Result<bool, AppError> {
        let output = self
            .shell(&["pm", "list", "packages", package], trace_id)?
            .ensure_success("pm list packages", trace_id)?;
        Ok(parse_package_listed(&output.stdout, package))
    }

    fn install(&self, apk_path: &Path, trace_id: &str) -> Result<(), AppError> {
        let path = apk_path.to_string_lossy().to_string();
        let output = self.adb(&["install", "-g", path.as_str()], trace_id)?;
        if output.stdout.contains("Success") || output.stderr.contains("INSTALL_FAILED_ALREADY_EXISTS") {
            return Ok(());
        }
        Err(AppError::dependency(
            format!(
                "Failed to install {path}: {}",
                if output.stderr.trim().is_empty() { output.stdout.trim() } else { output.stderr.trim() }
            ),
            trace_id,
        ))
    }

    fn push(&self, local: &Path, remote: &str, trace_id: &str) -> Result<(), AppError> {
        if let Some((parent, _)) = remote.rsplit_once('/') {
            if !parent.is_empty() {
                self.shell(&["mkdir", "-p", parent], trace_id)?
                    .ensure_success("mkdir", trace_id)?;
            }
        }
        let local = local.to_string_lossy().to_string();
        self.adb(&["push", local.as_str(), remote], trace_id)?
            .ensure_success("adb push", trace_id)?;
        Ok(())
    }

    fn close_system_dialogs(&self, trace_id: &str) -> Result<(), AppError> {
        self.shell(
            &["am", "broadcast", "-a", "android.intent.action.CLOSE_SYSTEM_DIALOGS"],
            trace_id,
        )?
        .ensure_success("close system dialogs", trace_id)?;
        Ok(())
    }
}

/// `adb logcat -v <format>` as a restartable line source. Each open clears the buffer first.
pub struct AdbLogcatSource {
    device: AdbDevice,
    verbosity: String,
}

impl AdbLogcatSource {
    pub fn new(settings: &DeviceSettings) -> Self {
        Self {
            device: AdbDevice::new(settings),
            verbosity: settings.log_verbosity.clone(),
        }
    }
}

struct ChildStream {
    child: Child,
    stdout: ChildStdout,
}

impl Read for ChildStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl Drop for ChildStream {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl LineSource for AdbLogcatSource {
    fn open(&self, trace_id: &str) -> Result<Box<dyn BufRead + Send>, AppError> {
        if let Err(err) = self.device.adb(&["logcat", "-c"], trace_id) {
            warn!(trace_id = %trace_id, error = %err, "failed to clear logcat buffer");
        }
        let args = adb_args(
            self.device.serial.as_deref(),
            &["logcat", "-v", self.verbosity.as_str()],
        );
        let mut child = Command::new(&self.device.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| AppError::dependency(format!("Failed to start logcat: {err}"), trace_id))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::system("Failed to capture logcat stdout", trace_id))?;
        info!(trace_id = %trace_id, verbosity = %self.verbosity, "logcat stream opened");
        Ok(Box::new(BufReader::new(ChildStream { child, stdout })))
    }
}
