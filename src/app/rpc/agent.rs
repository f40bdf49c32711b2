use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::app::adb::runner::run_command_with_timeout;
use crate::app::config::BridgeConfig;
use crate::app::error::AppError;
use crate::app::rpc::envelope::{data_of, Action, Envelope, LoadRequest, ResultCode};
use crate::app::rpc::server::{ActionHandler, HandlerRegistry};
use crate::app::rpc::store::{case_file_path, CaseStore, CaseSuite, StoreError};

pub const AGENT_PROTOCOL_VERSION: i64 = 1;

/// The suite a connection has loaded and the request that produced it.
#[derive(Debug, Clone)]
pub struct LoadedSuite {
    pub request: LoadRequest,
    pub suite: CaseSuite,
}

/// Per-connection state. A new connection starts with nothing loaded.
#[derive(Debug, Default)]
pub struct ConnectionContext {
    pub loaded: Option<LoadedSuite>,
}

/// Everything a launcher needs to start one case.
#[derive(Debug, Clone, Copy)]
pub struct CaseLaunch<'a> {
    pub request: &'a LoadRequest,
    pub case_file: &'a std::path::Path,
    pub case_id: usize,
    pub field_names: &'a [String],
    pub values: &'a [String],
}

impl CaseLaunch<'_> {
    /// The case row keyed by field name.
    pub fn fields_json(&self) -> Value {
        let map: Map<String, Value> = self
            .field_names
            .iter()
            .zip(self.values.iter())
            .map(|(name, value)| (name.clone(), Value::from(value.as_str())))
            .collect();
        Value::Object(map)
    }
}

/// Turns a case row into a component launch on the device.
pub trait ComponentLauncher: Send + Sync {
    fn launch(&self, case: &CaseLaunch<'_>, trace_id: &str) -> Result<(), AppError>;
}

/// Runs an external program per case, substituting `{pkg}`, `{comp}`, `{type}`,
/// `{strategy}`, `{case_file}`, `{case_id}` and `{case_json}` in its arguments.
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            config.launcher_program.trim(),
            config.launcher_args.clone(),
            Duration::from_secs(30),
        )
    }

    pub fn render_args(&self, case: &CaseLaunch<'_>) -> Vec<String> {
        let case_file = case.case_file.to_string_lossy();
        let case_id = case.case_id.to_string();
        let case_json = case.fields_json().to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{pkg}", &case.request.pkg_name)
                    .replace("{comp}", &case.request.comp_name)
                    .replace("{type}", &case.request.comp_type)
                    .replace("{strategy}", &case.request.strategy)
                    .replace("{case_file}", &case_file)
                    .replace("{case_id}", &case_id)
                    .replace("{case_json}", &case_json)
            })
            .collect()
    }
}

impl ComponentLauncher for CommandLauncher {
    fn launch(&self, case: &CaseLaunch<'_>, trace_id: &str) -> Result<(), AppError> {
        if self.program.is_empty() {
            return Err(AppError::validation("No launcher program configured", trace_id));
        }
        let args = self.render_args(case);
        run_command_with_timeout(&self.program, &args, self.timeout, trace_id)?
            .ensure_success("launcher", trace_id)?;
        Ok(())
    }
}

pub struct InitHandler;

impl ActionHandler for InitHandler {
    fn handle(
        &self,
        _request: &Envelope,
        _ctx: &mut ConnectionContext,
        trace_id: &str,
    ) -> Result<Envelope, AppError> {
        info!(trace_id = %trace_id, "init received");
        Ok(Envelope::response(ResultCode::Success)
            .with_data(data_of([("version", json!(AGENT_PROTOCOL_VERSION))])))
    }
}

pub struct LoadHandler {
    store: Arc<dyn CaseStore>,
}

impl LoadHandler {
    pub fn new(store: Arc<dyn CaseStore>) -> Self {
        Self { store }
    }
}

impl ActionHandler for LoadHandler {
    fn handle(
        &self,
        request: &Envelope,
        ctx: &mut ConnectionContext,
        trace_id: &str,
    ) -> Result<Envelope, AppError> {
        ctx.loaded = None;
        let Some(load) = LoadRequest::from_envelope(request) else {
            warn!(trace_id = %trace_id, "load request missing fields");
            return Ok(Envelope::response(ResultCode::InvalidRequest));
        };
        match self.store.load(&load) {
            Ok(suite) => {
                let count = suite.len();
                info!(
                    trace_id = %trace_id,
                    package = %load.pkg_name,
                    component = %load.comp_name,
                    strategy = %load.strategy,
                    count,
                    "case suite loaded"
                );
                ctx.loaded = Some(LoadedSuite {
                    request: load,
                    suite,
                });
                Ok(Envelope::response(ResultCode::Success)
                    .with_data(data_of([("count", json!(count))])))
            }
            Err(StoreError::NotFound(path)) => {
                warn!(trace_id = %trace_id, path = %path.display(), "case file not found");
                Ok(Envelope::response(ResultCode::LoadFileNotFound))
            }
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "failed to load case file");
                Ok(Envelope::response(ResultCode::InvalidRequest))
            }
        }
    }
}

pub struct RunCaseHandler {
    launcher: Arc<dyn ComponentLauncher>,
    case_root: PathBuf,
}

impl RunCaseHandler {
    pub fn new(launcher: Arc<dyn ComponentLauncher>, case_root: impl Into<PathBuf>) -> Self {
        Self {
            launcher,
            case_root: case_root.into(),
        }
    }
}

impl ActionHandler for RunCaseHandler {
    fn handle(
        &self,
        request: &Envelope,
        ctx: &mut ConnectionContext,
        trace_id: &str,
    ) -> Result<Envelope, AppError> {
        let Some(case_id) = request.data_i64("caseId") else {
            return Ok(Envelope::response(ResultCode::InvalidRequest));
        };
        let Some(loaded) = ctx.loaded.as_ref() else {
            warn!(trace_id = %trace_id, case_id, "run case before load");
            return Ok(Envelope::response(ResultCode::NotLoaded));
        };
        let row = usize::try_from(case_id)
            .ok()
            .and_then(|index| loaded.suite.cases.get(index).map(|row| (index, row)));
        let Some((index, values)) = row else {
            warn!(trace_id = %trace_id, case_id, count = loaded.suite.len(), "case id out of range");
            return Ok(Envelope::response(ResultCode::StartComponentFailed));
        };
        let case_file = if loaded.suite.source.as_os_str().is_empty() {
            case_file_path(
                &self.case_root,
                &loaded.request.pkg_name,
                &loaded.request.comp_name,
                &loaded.request.strategy,
            )
        } else {
            loaded.suite.source.clone()
        };
        let launch = CaseLaunch {
            request: &loaded.request,
            case_file: &case_file,
            case_id: index,
            field_names: &loaded.suite.field_names,
            values,
        };
        match self.launcher.launch(&launch, trace_id) {
            Ok(()) => {
                info!(trace_id = %trace_id, case_id = index, component = %loaded.request.comp_name, "case launched");
                Ok(Envelope::response(ResultCode::Success))
            }
            Err(err) => {
                warn!(trace_id = %trace_id, case_id = index, error = %err, "failed to start component");
                Ok(Envelope::response(ResultCode::StartComponentFailed))
            }
        }
    }
}

/// The agent's registration table: one handler per request action.
pub fn default_registry(
    store: Arc<dyn CaseStore>,
    launcher: Arc<dyn ComponentLauncher>,
    case_root: impl Into<PathBuf>,
) -> HandlerRegistry {
    HandlerRegistry::builder()
        .register(Action::Init, "Init", 0, Arc::new(InitHandler))
        .register(Action::Load, "Load", 0, Arc::new(LoadHandler::new(store)))
        .register(
            Action::RunCase,
            "RunCase",
            0,
            Arc::new(RunCaseHandler::new(launcher, case_root)),
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLauncher {
        launched: Mutex<Vec<(usize, Value)>>,
        fail: bool,
    }

    impl ComponentLauncher for RecordingLauncher {
        fn launch(&self, case: &CaseLaunch<'_>, trace_id: &str) -> Result<(), AppError> {
            if self.fail {
                return Err(AppError::dependency("activity not found", trace_id));
            }
            self.launched
                .lock()
                .expect("launched")
                .push((case.case_id, case.fields_json()));
            Ok(())
        }
    }

    struct FixedStore;

    impl CaseStore for FixedStore {
        fn load(&self, request: &LoadRequest) -> Result<CaseSuite, StoreError> {
            if request.comp_name == "Missing" {
                return Err(StoreError::NotFound(PathBuf::from("missing.csv")));
            }
            Ok(CaseSuite {
                source: PathBuf::from("/cases/com.x/C_s.csv"),
                field_names: vec!["action".to_string(), "data".to_string()],
                cases: vec![
                    vec!["VIEW".to_string(), "a".to_string()],
                    vec!["EDIT".to_string(), "b".to_string()],
                ],
            })
        }
    }

    fn load_envelope(comp: &str) -> Envelope {
        let request = LoadRequest {
            pkg_name: "com.x".to_string(),
            comp_name: comp.to_string(),
            comp_type: "a".to_string(),
            strategy: "s".to_string(),
        };
        Envelope::request(Action::Load, Some(request.to_data()))
    }

    fn run_envelope(case_id: i64) -> Envelope {
        Envelope::request(Action::RunCase, Some(data_of([("caseId", json!(case_id))])))
    }

    #[test]
    fn run_case_launches_loaded_row() {
        let launcher = Arc::new(RecordingLauncher::default());
        let load = LoadHandler::new(Arc::new(FixedStore));
        let run = RunCaseHandler::new(launcher.clone(), "/cases");
        let mut ctx = ConnectionContext::default();

        let response = load.handle(&load_envelope("C"), &mut ctx, "t").expect("load");
        assert_eq!(response.data_i64("count"), Some(2));

        let response = run.handle(&run_envelope(1), &mut ctx, "t").expect("run");
        assert!(response.is_success());
        let launched = launcher.launched.lock().expect("launched");
        assert_eq!(launched[0], (1, json!({"action": "EDIT", "data": "b"})));
    }

    #[test]
    fn run_case_rejections() {
        let run = RunCaseHandler::new(Arc::new(RecordingLauncher::default()), "/cases");
        let mut ctx = ConnectionContext::default();
        let code = |envelope: Envelope| envelope.result_code();

        assert_eq!(code(run.handle(&run_envelope(0), &mut ctx, "t").expect("run")), Some(ResultCode::NotLoaded));

        LoadHandler::new(Arc::new(FixedStore))
            .handle(&load_envelope("C"), &mut ctx, "t")
            .expect("load");
        assert_eq!(
            code(run.handle(&run_envelope(5), &mut ctx, "t").expect("run")),
            Some(ResultCode::StartComponentFailed)
        );
        assert_eq!(
            code(run.handle(&run_envelope(-1), &mut ctx, "t").expect("run")),
            Some(ResultCode::StartComponentFailed)
        );
        let missing_id = Envelope::request(Action::RunCase, None);
        assert_eq!(
            code(run.handle(&missing_id, &mut ctx, "t").expect("run")),
            Some(ResultCode::InvalidRequest)
        );

        let failing = RunCaseHandler::new(
            Arc::new(RecordingLauncher {
                fail: true,
                ..RecordingLauncher::default()
            }),
            "/cases",
        );
        assert_eq!(
            code(failing.handle(&run_envelope(0), &mut ctx, "t").expect("run")),
            Some(ResultCode::StartComponentFailed)
        );
    }

    #[test]
    fn failed_load_clears_previous_suite() {
        let load = LoadHandler::new(Arc::new(FixedStore));
        let mut ctx = ConnectionContext::default();
        load.handle(&load_envelope("C"), &mut ctx, "t").expect("load");
        assert!(ctx.loaded.is_some());

        let response = load.handle(&load_envelope("Missing"), &mut ctx, "t").expect("load");
        assert_eq!(response.result_code(), Some(ResultCode::LoadFileNotFound));
        assert!(ctx.loaded.is_none());

        let response = load
            .handle(&Envelope::request(Action::Load, None), &mut ctx, "t")
            .expect("load");
        assert_eq!(response.result_code(), Some(ResultCode::InvalidRequest));
    }

    #[test]
    fn command_launcher_substitutes_placeholders() {
        let launcher = CommandLauncher::new(
            "launch-case",
            vec!["-n".to_string(), "{pkg}/{comp}".to_string(), "{case_file}#{case_id}".to_string(), "{type}:{strategy}".to_string()],
            Duration::from_secs(1),
        );
        let request = LoadRequest {
            pkg_name: "com.x".to_string(),
            comp_name: "com.x.Main".to_string(),
            comp_type: "a".to_string(),
            strategy: "iccBot".to_string(),
        };
        let fields = vec!["action".to_string()];
        let values = vec!["VIEW".to_string()];
        let launch = CaseLaunch {
            request: &request,
            case_file: Path::new("/cases/x.csv"),
            case_id: 4,
            field_names: &fields,
            values: &values,
        };
        assert_eq!(
            launcher.render_args(&launch),
            vec!["-n", "com.x/com.x.Main", "/cases/x.csv#4", "a:iccBot"]
        );
        let unconfigured = CommandLauncher::new("", Vec::new(), Duration::from_secs(1));
        assert_eq!(
            unconfigured.launch(&launch, "t").expect_err("no program").code,
            "ERR_VALIDATION"
        );
    }
}
