use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use ictdroid_rust_lib::app::config::{load_bridge_config_from_path, BridgeConfig};
use ictdroid_rust_lib::app::error::AppError;
use ictdroid_rust_lib::app::logging::init_logging;
use ictdroid_rust_lib::app::rpc::agent::{default_registry, CommandLauncher};
use ictdroid_rust_lib::app::rpc::server::RpcServer;
use ictdroid_rust_lib::app::rpc::store::CsvCaseStore;
use tracing::{error, info};

#[derive(Debug, Clone, Default)]
struct Args {
    config: Option<PathBuf>,
    port: Option<u16>,
    case_root: Option<String>,
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
            "--port" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--port requires a value".to_string())?;
                args.port = Some(
                    value
                        .trim()
                        .parse::<u16>()
                        .map_err(|_| "--port must be a number".to_string())?,
                );
            }
            "--case-root" => {
                args.case_root = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                if args.case_root.is_none() {
                    return Err("--case-root requires a value".to_string());
                }
            }
            "-h" | "--help" => {
                return Err("Usage: ictdroid_bridge [--config PATH] [--port N] [--case-root DIR]\n".to_string());
            }
            other => return Err(format!("Unknown arg: {other}")),
        }
    }
    Ok(args)
}

fn serve(config: BridgeConfig) -> Result<(), AppError> {
    let store = Arc::new(CsvCaseStore::new(&config.case_root));
    let launcher = Arc::new(CommandLauncher::from_config(&config));
    let registry = default_registry(store, launcher, &config.case_root);
    let server = RpcServer::bind(&config.bind_host, config.port, registry)?;
    info!(
        host = %config.bind_host,
        port = server.port(),
        case_root = %config.case_root,
        launcher = %config.launcher_program,
        "bridge ready"
    );
    server.serve(Arc::new(AtomicBool::new(false)))
}

fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };
    let mut config = match args.config.as_deref() {
        Some(path) => match load_bridge_config_from_path(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{}: {}", err.code, err.error);
                std::process::exit(2);
            }
        },
        None => BridgeConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(case_root) = args.case_root {
        config.case_root = case_root;
    }
    init_logging(Some(config.log_level.as_str()));

    if let Err(err) = serve(config) {
        error!(trace_id = %err.trace_id, code = %err.code, error = %err.error, "bridge failed");
        std::process::exit(1);
    }
}
