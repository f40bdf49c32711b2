use std::path::{Path, PathBuf};
use std::sync::Arc;

use ictdroid_rust_lib::app::adb::device::{AdbDevice, AdbLogcatSource};
use ictdroid_rust_lib::app::adb::locator::validate_program;
use ictdroid_rust_lib::app::campaign::{discover_apks, Campaign};
use ictdroid_rust_lib::app::comp_state::ComponentStateMonitor;
use ictdroid_rust_lib::app::config::{config_path, load_config_from_path, ControllerConfig};
use ictdroid_rust_lib::app::error::AppError;
use ictdroid_rust_lib::app::logcat::handlers::{default_chain, PortAnnouncer};
use ictdroid_rust_lib::app::logcat::monitor::LogStreamMonitor;
use ictdroid_rust_lib::app::logcat::parser::LogParser;
use ictdroid_rust_lib::app::logcat::trace::TraceAggregator;
use ictdroid_rust_lib::app::logging::init_logging;
use ictdroid_rust_lib::app::rpc::controller::RpcController;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct Args {
    config: Option<PathBuf>,
    start_apk: Option<usize>,
    start_component: Option<usize>,
    start_case: Option<usize>,
    start_strategy: Option<String>,
}

fn parse_index(flag: &str, value: Option<String>) -> Result<usize, String> {
    let value = value.ok_or_else(|| format!("{flag} requires a value"))?;
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| format!("{flag} must be a number"))
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--config requires a value".to_string())?;
                args.config = Some(PathBuf::from(value));
            }
            "--start-apk" => args.start_apk = Some(parse_index("--start-apk", it.next())?),
            "--start-component" => {
                args.start_component = Some(parse_index("--start-component", it.next())?)
            }
            "--start-case" => args.start_case = Some(parse_index("--start-case", it.next())?),
            "--start-strategy" => {
                args.start_strategy = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                if args.start_strategy.is_none() {
                    return Err("--start-strategy requires a value".to_string());
                }
            }
            "-h" | "--help" => {
                return Err("Usage: ictdroid_controller [--config PATH] [--start-apk N] [--start-component N] [--start-case N] [--start-strategy NAME]\n".to_string());
            }
            other => return Err(format!("Unknown arg: {other}")),
        }
    }
    Ok(args)
}

fn apply_resume(config: &mut ControllerConfig, args: &Args) {
    if let Some(index) = args.start_apk {
        config.campaign.start_apk_index = index;
    }
    if let Some(index) = args.start_component {
        config.campaign.start_component_index = index;
    }
    if let Some(index) = args.start_case {
        config.campaign.start_case_index = index;
    }
    if args.start_strategy.is_some() {
        config.campaign.start_strategy = args.start_strategy.clone();
    }
}

fn run(config: ControllerConfig) -> Result<bool, AppError> {
    let trace_id = Uuid::new_v4().to_string();
    validate_program(&config.device.adb_path, &trace_id)?;
    let apks = discover_apks(
        Path::new(&config.campaign.apk_path),
        config.campaign.run_apks_in_desc_order,
    )?;
    if apks.is_empty() {
        return Err(AppError::validation(
            format!("No APKs found under {}", config.campaign.apk_path),
            &trace_id,
        ));
    }
    info!(trace_id = %trace_id, apks = apks.len(), "apks discovered");

    let device = Arc::new(AdbDevice::new(&config.device));
    let monitor = Arc::new(ComponentStateMonitor::new(
        device.clone(),
        &config.monitor,
        &config.device,
    ));
    let traces = Arc::new(TraceAggregator::new());
    let controller = RpcController::new(&config.rpc, &config.device, device.clone(), monitor.clone());

    let weak = Arc::downgrade(&controller);
    let announced = config.rpc.bridge_port == 0;
    let announcer: PortAnnouncer = Arc::new(move |port: u16| {
        if !announced {
            return;
        }
        let weak = weak.clone();
        let spawned = std::thread::Builder::new()
            .name("rpc-announce".to_string())
            .spawn(move || {
                if let Some(controller) = weak.upgrade() {
                    if let Err(err) = controller.connect_announced(port) {
                        warn!(port, error = %err, "failed to connect to announced port");
                    }
                }
            });
        if let Err(err) = spawned {
            warn!(port, error = %err, "failed to spawn announce thread");
        }
    });
    let chain = default_chain(monitor.clone(), announcer, traces.clone())?;
    let parser = LogParser::for_format(&config.device.log_verbosity, &trace_id)?;
    let log_monitor = LogStreamMonitor::new(Arc::new(AdbLogcatSource::new(&config.device)), parser, chain);
    let log_handle = log_monitor.start()?;

    let campaign = Campaign::new(
        &config.campaign,
        &config.device,
        device,
        controller.clone(),
        monitor,
        traces,
    );
    if config.rpc.bridge_port == 0 {
        campaign.stop_targets(&apks);
    }
    controller.establish()?;

    let summary = campaign.run(&apks);
    controller.disconnect(false);
    log_handle.join();
    let summary = summary?;
    info!(
        trace_id = %trace_id,
        passed = summary.passed,
        failed = summary.failed,
        jumped = summary.jumped,
        skipped = summary.skipped,
        halted = summary.halted,
        "test finished"
    );
    Ok(!summary.halted)
}

fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };
    let path = args.config.clone().unwrap_or_else(config_path);
    let mut config = match load_config_from_path(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}: {}", err.code, err.error);
            std::process::exit(2);
        }
    };
    init_logging(Some(config.logging.level.as_str()));
    apply_resume(&mut config, &args);
    info!(config = %path.display(), "controller starting");

    match run(config) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            error!(trace_id = %err.trace_id, code = %err.code, error = %err.error, "controller failed");
            std::process::exit(1);
        }
    }
}
