use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app::adb::device::DeviceControl;
use crate::app::app_model::{AppModel, ComponentModel};
use crate::app::comp_state::ComponentStateMonitor;
use crate::app::config::{CampaignSettings, DeviceSettings};
use crate::app::error::AppError;
use crate::app::logcat::trace::TraceAggregator;
use crate::app::models::{CampaignSummary, CaseRecord, CaseVerdict, ComponentState, Cursor, TraceBlock};
use crate::app::rpc::controller::{LoadStatus, RpcController};
use crate::app::rpc::envelope::LoadRequest;
use crate::app::rpc::store::{case_file_path, remote_case_file_path};

const ACTIVITY_NOT_FOUND: &str = "android.content.ActivityNotFoundException";
const RESPONSE_GRACE: Duration = Duration::from_secs(1);

/// The campaign's view of the agent link.
pub trait AgentLink: Send + Sync {
    /// Sends a `Load` and blocks until it is answered.
    fn load_suite(&self, request: LoadRequest) -> Result<LoadStatus, AppError>;
    fn launch_case(&self, case_id: usize) -> Result<(), AppError>;
    /// Called once a case has resolved; an answer still missing by then is abandoned.
    fn release_case(&self);
    fn is_exhausted(&self) -> bool;
}

impl AgentLink for RpcController {
    fn load_suite(&self, request: LoadRequest) -> Result<LoadStatus, AppError> {
        self.load_cases(request)?;
        self.wait_load()
    }

    fn launch_case(&self, case_id: usize) -> Result<(), AppError> {
        self.run_case(case_id).map(|_| ())
    }

    fn release_case(&self) {
        self.release_outstanding(RESPONSE_GRACE);
    }

    fn is_exhausted(&self) -> bool {
        RpcController::is_exhausted(self)
    }
}

/// Every `*.apk` under `path` (or `path` itself), sorted by path.
pub fn discover_apks(path: &Path, descending: bool) -> Result<Vec<PathBuf>, AppError> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(AppError::validation(
            format!("APK path does not exist: {}", path.display()),
            "",
        ));
    }
    let mut found = Vec::new();
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir)
            .map_err(|err| AppError::system(format!("Failed to read {}: {err}", dir.display()), ""))?;
        for entry in entries.flatten() {
            let entry_path = entry.path();
            if entry_path.is_dir() {
                pending.push(entry_path);
            } else if entry_path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("apk"))
                .unwrap_or(false)
            {
                found.push(entry_path);
            }
        }
    }
    found.sort();
    if descending {
        found.reverse();
    }
    Ok(found)
}

/// `"preset+iccBot; iccBot+preset;random"` -> `["iccBot+preset", "random"]`.
pub fn normalize_strategies(raw: &str) -> Vec<String> {
    let mut groups = Vec::new();
    for group in raw.split(';') {
        let providers: BTreeSet<&str> = group
            .split('+')
            .map(str::trim)
            .filter(|provider| !provider.is_empty())
            .collect();
        if providers.is_empty() {
            continue;
        }
        let name = providers.into_iter().collect::<Vec<_>>().join("+");
        if !groups.contains(&name) {
            groups.push(name);
        }
    }
    groups
}

/// Merges trace blocks that mention any of `packages`, first head wins.
pub fn merge_traces(blocks: Vec<TraceBlock>, packages: &[&str]) -> Option<TraceBlock> {
    blocks
        .into_iter()
        .filter(|block| packages.iter().any(|package| block.body.contains(package)))
        .reduce(|mut merged, block| {
            merged.body.push('\n');
            merged.body.push_str(&block.body);
            merged
        })
}

/// Logs each case record and, when configured, appends it to an NDJSON file.
pub struct ResultReporter {
    path: Option<PathBuf>,
}

impl ResultReporter {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn record(&self, record: &CaseRecord) -> Result<(), AppError> {
        match record.verdict {
            CaseVerdict::Failed | CaseVerdict::Skipped => warn!(
                trace_id = %record.trace_id,
                component = %record.component,
                strategy = %record.strategy,
                apk_index = record.cursor.apk_index,
                component_index = record.cursor.component_index,
                case_index = record.cursor.case_index,
                state = %record.state,
                verdict = ?record.verdict,
                focused = ?record.focused_component,
                "case finished"
            ),
            _ => info!(
                trace_id = %record.trace_id,
                component = %record.component,
                strategy = %record.strategy,
                case_index = record.cursor.case_index,
                state = %record.state,
                verdict = ?record.verdict,
                "case finished"
            ),
        }
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        let line = serde_json::to_string(record)
            .map_err(|err| AppError::system(format!("Failed to encode case record: {err}"), &record.trace_id))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| AppError::system(format!("Failed to open {}: {err}", path.display()), &record.trace_id))?;
        writeln!(file, "{line}")
            .map_err(|err| AppError::system(format!("Failed to write {}: {err}", path.display()), &record.trace_id))
    }
}

enum Flow {
    Continue,
    SkipComponent,
    Halt,
}

/// The orchestration loop: apk, then component, then strategy, then case.
pub struct Campaign {
    settings: CampaignSettings,
    agent_package: String,
    agent_case_root: String,
    device: Arc<dyn DeviceControl>,
    link: Arc<dyn AgentLink>,
    monitor: Arc<ComponentStateMonitor>,
    traces: Arc<TraceAggregator>,
    reporter: ResultReporter,
}

struct CaseScope<'a> {
    apk: &'a Path,
    package: &'a str,
    component: &'a ComponentModel,
    strategy: &'a str,
}

impl Campaign {
    pub fn new(
        settings: &CampaignSettings,
        device_settings: &DeviceSettings,
        device: Arc<dyn DeviceControl>,
        link: Arc<dyn AgentLink>,
        monitor: Arc<ComponentStateMonitor>,
        traces: Arc<TraceAggregator>,
    ) -> Self {
        Self {
            settings: settings.clone(),
            agent_package: device_settings.agent_package.clone(),
            agent_case_root: device_settings.agent_case_root.clone(),
            device,
            link,
            monitor,
            traces,
            reporter: ResultReporter::new(settings.results_path.as_ref().map(PathBuf::from)),
        }
    }

    pub fn start_cursor(&self) -> Cursor {
        Cursor {
            apk_index: self.settings.start_apk_index,
            component_index: self.settings.start_component_index,
            case_index: self.settings.start_case_index,
            strategy: self.settings.start_strategy.clone(),
        }
    }

    /// Force-stops every target package once so no stale process skews the first case.
    pub fn stop_targets(&self, apks: &[PathBuf]) {
        let trace_id = Uuid::new_v4().to_string();
        for apk in apks {
            match AppModel::load(Path::new(&self.settings.icc_model_path), apk) {
                Ok(model) => {
                    if let Err(err) = self.device.force_stop(&model.package, &trace_id) {
                        warn!(trace_id = %trace_id, package = %model.package, error = %err, "force-stop failed");
                    }
                }
                Err(err) => warn!(trace_id = %trace_id, apk = %apk.display(), error = %err, "no component model"),
            }
        }
    }

    pub fn run(&self, apks: &[PathBuf]) -> Result<CampaignSummary, AppError> {
        let trace_id = Uuid::new_v4().to_string();
        let strategies = normalize_strategies(&self.settings.strategy);
        let mut summary = CampaignSummary::default();
        let mut cursor = self.start_cursor();
        info!(trace_id = %trace_id, apks = apks.len(), strategies = ?strategies, cursor = ?cursor, "campaign started");

        while cursor.apk_index < apks.len() {
            let apk = &apks[cursor.apk_index];
            info!(trace_id = %trace_id, apk = %apk.display(), apk_index = cursor.apk_index, total = apks.len(), "processing apk");
            let model = match self.prepare_apk(apk, &trace_id) {
                Ok(model) => model,
                Err(err) => {
                    error!(trace_id = %trace_id, apk = %apk.display(), error = %err, "apk skipped");
                    cursor.next_apk();
                    continue;
                }
            };

            while cursor.component_index < model.components.len() {
                let component = &model.components[cursor.component_index];
                if let Some(reason) = component.skip_reason(self.settings.only_exported) {
                    warn!(
                        trace_id = %trace_id,
                        component = %component.class_name,
                        kind = %component.kind,
                        reason = reason.describe(),
                        "component skipped"
                    );
                    cursor.next_component();
                    continue;
                }
                info!(
                    trace_id = %trace_id,
                    component = %component.class_name,
                    component_index = cursor.component_index,
                    total = model.components.len(),
                    "processing component"
                );
                match self.run_component(apk, &model, component, &strategies, &mut cursor, &mut summary, &trace_id)? {
                    Flow::Halt => {
                        summary.halted = true;
                        error!(trace_id = %trace_id, cursor = ?cursor, "campaign halted");
                        return Ok(summary);
                    }
                    Flow::Continue | Flow::SkipComponent => cursor.next_component(),
                }
            }

            if let Err(err) = self.device.force_stop(&model.package, &trace_id) {
                warn!(trace_id = %trace_id, package = %model.package, error = %err, "force-stop failed");
            }
            cursor.next_apk();
        }
        info!(
            trace_id = %trace_id,
            passed = summary.passed,
            failed = summary.failed,
            jumped = summary.jumped,
            skipped = summary.skipped,
            "campaign finished"
        );
        Ok(summary)
    }

    fn prepare_apk(&self, apk: &Path, trace_id: &str) -> Result<AppModel, AppError> {
        let model = AppModel::load(Path::new(&self.settings.icc_model_path), apk)?;
        if !self.device.is_installed(&model.package, trace_id)? {
            warn!(trace_id = %trace_id, package = %model.package, "apk not installed, installing");
            self.device.install(apk, trace_id)?;
        }
        info!(
            trace_id = %trace_id,
            package = %model.package,
            version = ?model.version,
            components = model.components.len(),
            "component model loaded"
        );
        Ok(model)
    }

    /// Strategies whose case file exists locally, sorted.
    fn ready_strategies(&self, package: &str, class_name: &str, strategies: &[String]) -> Vec<String> {
        let root = Path::new(&self.settings.testcase_path);
        let mut ready: Vec<String> = strategies
            .iter()
            .filter(|strategy| case_file_path(root, package, class_name, strategy).is_file())
            .cloned()
            .collect();
        ready.sort();
        ready
    }

    #[allow(clippy::too_many_arguments)]
    fn run_component(
        &self,
        apk: &Path,
        model: &AppModel,
        component: &ComponentModel,
        strategies: &[String],
        cursor: &mut Cursor,
        summary: &mut CampaignSummary,
        trace_id: &str,
    ) -> Result<Flow, AppError> {
        let ready = self.ready_strategies(&model.package, &component.class_name, strategies);
        if ready.len() < strategies.len() {
            let missing: Vec<&String> = strategies.iter().filter(|s| !ready.contains(s)).collect();
            warn!(trace_id = %trace_id, component = %component.class_name, missing = ?missing, "no test cases for strategies");
        }

        let root = Path::new(&self.settings.testcase_path);
        for strategy in &ready {
            let local = case_file_path(root, &model.package, &component.class_name, strategy);
            let remote = remote_case_file_path(&self.agent_case_root, &model.package, &component.class_name, strategy);
            if let Err(err) = self.device.push(&local, &remote, trace_id) {
                error!(trace_id = %trace_id, local = %local.display(), remote = %remote, error = %err, "failed to push test cases");
                if !self.settings.continue_on_error {
                    return Ok(Flow::Halt);
                }
            }
        }
        info!(trace_id = %trace_id, component = %component.class_name, ready = ?ready, "test cases pushed");

        self.monitor
            .set_component(&model.package, &component.class_name, &component.kind);
        let mut resume = cursor.strategy.take();
        for strategy in &ready {
            if let Some(start) = resume.as_deref() {
                if start != strategy.as_str() {
                    continue;
                }
            }
            resume = None;
            cursor.strategy = Some(strategy.clone());
            info!(trace_id = %trace_id, strategy = %strategy, "using strategy");

            let request = LoadRequest {
                pkg_name: model.package.clone(),
                comp_name: component.class_name.clone(),
                comp_type: component.kind.clone(),
                strategy: strategy.clone(),
            };
            let count = match self.link.load_suite(request) {
                Ok(LoadStatus::Loaded { count }) => count,
                Ok(status) => {
                    error!(trace_id = %trace_id, component = %component.class_name, strategy = %strategy, status = ?status, "unexpected load result");
                    if self.settings.continue_on_error {
                        return Ok(Flow::SkipComponent);
                    }
                    return Ok(Flow::Halt);
                }
                Err(err) => {
                    error!(trace_id = %trace_id, error = %err, "agent link failed while loading");
                    return Ok(Flow::Halt);
                }
            };

            let scope = CaseScope {
                apk,
                package: &model.package,
                component,
                strategy,
            };
            match self.run_cases(&scope, count, cursor, summary)? {
                Flow::Continue => {}
                Flow::SkipComponent => return Ok(Flow::SkipComponent),
                Flow::Halt => return Ok(Flow::Halt),
            }
            cursor.case_index = 0;
        }
        Ok(Flow::Continue)
    }

    fn run_cases(
        &self,
        scope: &CaseScope<'_>,
        count: usize,
        cursor: &mut Cursor,
        summary: &mut CampaignSummary,
    ) -> Result<Flow, AppError> {
        let mut retries = 0u32;
        while cursor.case_index < count {
            let trace_id = Uuid::new_v4().to_string();
            if let Err(err) = self.device.force_stop(scope.package, &trace_id) {
                warn!(trace_id = %trace_id, package = %scope.package, error = %err, "force-stop failed");
            }
            info!(trace_id = %trace_id, case = cursor.case_index + 1, count, "running case");
            self.monitor.start()?;
            if let Err(err) = self.link.launch_case(cursor.case_index) {
                if self.link.is_exhausted() {
                    error!(trace_id = %trace_id, error = %err, "agent link gave up");
                    self.monitor.raise(ComponentState::ClientError);
                    let trace = merge_traces(self.traces.drain(), &[scope.package, self.agent_package.as_str()]);
                    self.report(
                        scope,
                        cursor,
                        retries + 1,
                        self.monitor.state(),
                        CaseVerdict::Failed,
                        trace.as_ref(),
                        &trace_id,
                        summary,
                    );
                    return Ok(Flow::Halt);
                }
                warn!(trace_id = %trace_id, error = %err, "failed to send case");
                self.monitor.raise(ComponentState::ClientError);
            }

            let mut state = self.monitor.wait_resolved(self.monitor.run_budget());
            if !state.is_resolved() {
                self.monitor.raise(ComponentState::Timeout);
                state = self.monitor.state();
            }
            self.link.release_case();
            if self.settings.trace_settle_ms > 0 {
                std::thread::sleep(Duration::from_millis(self.settings.trace_settle_ms));
            }
            let trace = merge_traces(self.traces.drain(), &[scope.package, self.agent_package.as_str()]);

            if state <= ComponentState::ClientError {
                retries += 1;
                error!(trace_id = %trace_id, state = %state, attempt = retries, focused = ?self.monitor.focused(), "case did not run, retrying");
                if retries > self.settings.case_max_retry {
                    error!(trace_id = %trace_id, "case retry budget exceeded, skipping case");
                    self.report(scope, cursor, retries, state, CaseVerdict::Skipped, trace.as_ref(), &trace_id, summary);
                    cursor.case_index += 1;
                    retries = 0;
                }
                continue;
            }
            let attempt = retries + 1;
            retries = 0;

            match trace.as_ref() {
                Some(block) => warn!(trace_id = %trace_id, head = %block.head.raw_line, body = %block.body, "stack trace caught"),
                None if state < ComponentState::Jumped => warn!(trace_id = %trace_id, "no stack trace caught"),
                None => {}
            }

            let verdict = if state < ComponentState::Jumped {
                CaseVerdict::Failed
            } else if state == ComponentState::Jumped {
                CaseVerdict::Jumped
            } else {
                CaseVerdict::Passed
            };
            self.report(scope, cursor, attempt, state, verdict, trace.as_ref(), &trace_id, summary);

            if trace.as_ref().map(|block| block.body.contains(ACTIVITY_NOT_FOUND)).unwrap_or(false) {
                error!(trace_id = %trace_id, component = %scope.component.class_name, "activity not found, skipping component");
                return Ok(Flow::SkipComponent);
            }
            if verdict == CaseVerdict::Failed {
                if state >= ComponentState::AppCrashed && !self.settings.continue_on_error {
                    return Ok(Flow::Halt);
                }
                if let Err(err) = self.device.close_system_dialogs(&trace_id) {
                    warn!(trace_id = %trace_id, error = %err, "failed to close system dialogs");
                }
            }
            cursor.case_index += 1;
        }
        Ok(Flow::Continue)
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        scope: &CaseScope<'_>,
        cursor: &Cursor,
        attempt: u32,
        state: ComponentState,
        verdict: CaseVerdict,
        trace: Option<&TraceBlock>,
        trace_id: &str,
        summary: &mut CampaignSummary,
    ) {
        summary.record(verdict);
        let record = CaseRecord {
            recorded_at: chrono::Utc::now().to_rfc3339(),
            trace_id: trace_id.to_string(),
            apk: scope.apk.display().to_string(),
            package: scope.package.to_string(),
            component: self.monitor.target(),
            strategy: scope.strategy.to_string(),
            cursor: cursor.clone(),
            attempt,
            state,
            verdict,
            focused_component: self.monitor.focused(),
            trace_head: trace.map(|block| block.head.raw_line.clone()),
            trace_body: trace.map(|block| block.body.clone()),
        };
        if let Err(err) = self.reporter.record(&record) {
            warn!(trace_id = %trace_id, error = %err, "failed to persist case record");
        }
    }
}
