use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::app::adb::locator::resolve_adb_program;
use crate::app::error::AppError;

/// Where the controller pushes case files and the bridge reads them. Both sides
/// must agree, so overriding one without the other breaks every `Load`.
pub const DEFAULT_CASE_ROOT: &str = "/sdcard/ICCBot/testcases";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceSettings {
    pub adb_path: String,
    pub device_serial: Option<String>,
    pub launcher_package: String,
    pub agent_package: String,
    pub agent_activity: String,
    pub agent_case_root: String,
    pub command_timeout_ms: u64,
    pub log_verbosity: String,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            adb_path: "adb".to_string(),
            device_serial: None,
            launcher_package: "com.android.launcher3".to_string(),
            agent_package: "com.test.apptestclient".to_string(),
            agent_activity: "com.test.apptestclient.activities.MainActivity".to_string(),
            agent_case_root: DEFAULT_CASE_ROOT.to_string(),
            command_timeout_ms: 10_000,
            log_verbosity: "year".to_string(),
        }
    }
}

impl DeviceSettings {
    /// Canonical `pkg/.Class` name of the agent's own activity.
    pub fn agent_component(&self) -> String {
        let short = self
            .agent_activity
            .strip_prefix(self.agent_package.as_str())
            .unwrap_or(self.agent_activity.as_str());
        format!("{}/{}", self.agent_package, short)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RpcSettings {
    pub host: String,
    pub bridge_port: u16,
    pub max_retry: u32,
    pub retry_backoff_ms: u64,
    pub ready_timeout_ms: u64,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            bridge_port: 0,
            max_retry: 3,
            retry_backoff_ms: 3000,
            ready_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorSettings {
    pub poll_interval_ms: u64,
    pub dwell_ms: u64,
    pub start_timeout_ms: u64,
    pub displayed_timeout_ms: u64,
    pub max_launcher_observations: u32,
    pub max_jump_observations: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            dwell_ms: 1000,
            start_timeout_ms: 5000,
            displayed_timeout_ms: 10_000,
            max_launcher_observations: 3,
            max_jump_observations: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CampaignSettings {
    pub apk_path: String,
    pub icc_model_path: String,
    pub testcase_path: String,
    pub strategy: String,
    pub continue_on_error: bool,
    pub only_exported: bool,
    pub run_apks_in_desc_order: bool,
    pub case_max_retry: u32,
    pub trace_settle_ms: u64,
    pub results_path: Option<String>,
    pub start_apk_index: usize,
    pub start_component_index: usize,
    pub start_case_index: usize,
    pub start_strategy: Option<String>,
    pub default_strength: u32,
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            apk_path: String::new(),
            icc_model_path: String::new(),
            testcase_path: String::new(),
            strategy: "iccBot+preset+randomWithStruct".to_string(),
            continue_on_error: false,
            only_exported: false,
            run_apks_in_desc_order: false,
            case_max_retry: 3,
            trace_settle_ms: 1000,
            results_path: None,
            start_apk_index: 0,
            start_component_index: 0,
            start_case_index: 0,
            start_strategy: None,
            default_strength: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ControllerConfig {
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub rpc: RpcSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub campaign: CampaignSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub bind_host: String,
    pub port: u16,
    pub case_root: String,
    pub launcher_program: String,
    pub launcher_args: Vec<String>,
    pub log_level: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port: 0,
            case_root: DEFAULT_CASE_ROOT.to_string(),
            launcher_program: String::new(),
            launcher_args: vec![
                "{pkg}".to_string(),
                "{comp}".to_string(),
                "{case_file}".to_string(),
                "{case_id}".to_string(),
            ],
            log_level: "info".to_string(),
        }
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("ICTDROID_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ictdroid_config.json")
}

pub fn load_config_from_path(path: &Path) -> Result<ControllerConfig, AppError> {
    if !path.exists() {
        return Ok(ControllerConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read config: {err}"), ""))?;
    let config: ControllerConfig = serde_json::from_str(&raw)
        .map_err(|err| AppError::validation(format!("Failed to parse config: {err}"), ""))?;
    Ok(validate_config(config))
}

pub fn load_bridge_config_from_path(path: &Path) -> Result<BridgeConfig, AppError> {
    if !path.exists() {
        return Ok(BridgeConfig::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read bridge config: {err}"), ""))?;
    serde_json::from_str(&raw)
        .map_err(|err| AppError::validation(format!("Failed to parse bridge config: {err}"), ""))
}

pub fn validate_config(mut config: ControllerConfig) -> ControllerConfig {
    let defaults = ControllerConfig::default();
    config.device.adb_path = resolve_adb_program(&config.device.adb_path);
    config.device.device_serial = config
        .device
        .device_serial
        .map(|serial| serial.trim().to_string())
        .filter(|serial| !serial.is_empty());
    if config.device.launcher_package.trim().is_empty() {
        config.device.launcher_package = defaults.device.launcher_package.clone();
    }
    if config.device.command_timeout_ms < 500 {
        config.device.command_timeout_ms = defaults.device.command_timeout_ms;
    }
    if config.device.log_verbosity.trim().is_empty() {
        config.device.log_verbosity = defaults.device.log_verbosity.clone();
    }
    if config.rpc.max_retry == 0 {
        config.rpc.max_retry = defaults.rpc.max_retry;
    }
    if config.rpc.ready_timeout_ms < 1000 {
        config.rpc.ready_timeout_ms = defaults.rpc.ready_timeout_ms;
    }
    if config.monitor.poll_interval_ms < 20 {
        config.monitor.poll_interval_ms = defaults.monitor.poll_interval_ms;
    }
    if config.monitor.start_timeout_ms == 0 {
        config.monitor.start_timeout_ms = defaults.monitor.start_timeout_ms;
    }
    if config.monitor.displayed_timeout_ms < config.monitor.dwell_ms {
        config.monitor.displayed_timeout_ms = defaults
            .monitor
            .displayed_timeout_ms
            .max(config.monitor.dwell_ms);
    }
    if config.monitor.max_launcher_observations == 0 {
        config.monitor.max_launcher_observations = defaults.monitor.max_launcher_observations;
    }
    if config.monitor.max_jump_observations == 0 {
        config.monitor.max_jump_observations = defaults.monitor.max_jump_observations;
    }
    if config.campaign.strategy.trim().is_empty() {
        config.campaign.strategy = defaults.campaign.strategy.clone();
    }
    config.campaign.start_strategy = config
        .campaign
        .start_strategy
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().expect("tmp");
        let config = load_config_from_path(&dir.path().join("absent.json")).expect("defaults");
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.rpc.max_retry, 3);
        assert_eq!(config.monitor.dwell_ms, 1000);
    }

    #[test]
    fn partial_sections_fill_from_defaults() {
        let dir = TempDir::new().expect("tmp");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"rpc": {"bridge_port": 9876}, "campaign": {"continue_on_error": true}}"#,
        )
        .expect("write");
        let config = load_config_from_path(&path).expect("config");
        assert_eq!(config.rpc.bridge_port, 9876);
        assert_eq!(config.rpc.retry_backoff_ms, 3000);
        assert!(config.campaign.continue_on_error);
        assert_eq!(config.campaign.case_max_retry, 3);
    }

    #[test]
    fn rejects_malformed_json() {
        let dir = TempDir::new().expect("tmp");
        let path = dir.path().join("config.json");
        fs::write(&path, b"{not json").expect("write");
        let err = load_config_from_path(&path).expect_err("expected error");
        assert_eq!(err.code, "ERR_VALIDATION");
        assert!(err.error.contains("Failed to parse config"));
    }

    #[test]
    fn clamps_invalid_values() {
        let mut config = ControllerConfig::default();
        config.device.adb_path = "  \"/opt/platform-tools/adb\" ".to_string();
        config.device.device_serial = Some("   ".to_string());
        config.rpc.max_retry = 0;
        config.monitor.poll_interval_ms = 1;
        config.monitor.max_launcher_observations = 0;
        config.campaign.start_strategy = Some(" ".to_string());
        let validated = validate_config(config);
        assert_eq!(validated.device.adb_path, "/opt/platform-tools/adb");
        assert_eq!(validated.device.device_serial, None);
        assert_eq!(validated.rpc.max_retry, 3);
        assert_eq!(validated.monitor.poll_interval_ms, 200);
        assert_eq!(validated.monitor.max_launcher_observations, 3);
        assert_eq!(validated.campaign.start_strategy, None);
    }

    #[test]
    fn agent_component_uses_short_form() {
        let device = DeviceSettings::default();
        assert_eq!(
            device.agent_component(),
            "com.test.apptestclient/.activities.MainActivity"
        );
    }

    #[test]
    fn controller_and_bridge_share_the_case_root() {
        assert_eq!(
            ControllerConfig::default().device.agent_case_root,
            BridgeConfig::default().case_root
        );
    }
}
