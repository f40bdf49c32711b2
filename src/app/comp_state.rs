use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::adb::device::FocusInspector;
use crate::app::adb::parse::{normalize_component_name, normalize_focus_name, CurrentFocus, FocusParser};
use crate::app::config::{DeviceSettings, MonitorSettings};
use crate::app::error::AppError;
use crate::app::logcat::handlers::ComponentSignals;
use crate::app::models::ComponentState;
use crate::app::rpc::controller::LinkObserver;
use crate::app::rpc::envelope::ResultCode;

const DEPRECATED_SDK_DIALOG: &str = "DeprecatedTargetSdkVersionDialog";

fn package_of(component: &str) -> &str {
    component.split_once('/').map(|(package, _)| package).unwrap_or(component)
}

#[derive(Debug, Default)]
struct RunState {
    run_id: u64,
    package: String,
    target: String,
    inspect_focus: bool,
    state: ComponentState,
    started_at: Option<Instant>,
    first_displayed_at: Option<Instant>,
    dwell_since: Option<Instant>,
    launcher_observations: u32,
    jump_observations: u32,
    is_started: bool,
    focused: Option<String>,
}

/// Per-case state machine fed by log signals and periodic window-focus polling.
/// The state only moves up within a run; `start()` is the only reset.
pub struct ComponentStateMonitor {
    inspector: Arc<dyn FocusInspector>,
    parser: FocusParser,
    settings: MonitorSettings,
    launcher_package: String,
    agent_package: String,
    agent_component: String,
    run: Mutex<RunState>,
    changed: Condvar,
}

impl ComponentStateMonitor {
    pub fn new(
        inspector: Arc<dyn FocusInspector>,
        settings: &MonitorSettings,
        device: &DeviceSettings,
    ) -> Self {
        Self {
            inspector,
            parser: FocusParser::default(),
            settings: settings.clone(),
            launcher_package: device.launcher_package.clone(),
            agent_package: device.agent_package.clone(),
            agent_component: device.agent_component(),
            run: Mutex::new(RunState::default()),
            changed: Condvar::new(),
        }
    }

    fn lock_run(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the component under test. Only activities are checked against window focus.
    pub fn set_component(&self, package: &str, component: &str, component_type: &str) {
        let mut run = self.lock_run();
        run.package = package.to_string();
        run.target = normalize_component_name(package, component);
        run.inspect_focus = matches!(component_type, "a" | "activity" | "Activity");
        info!(component = %run.target, inspect_focus = run.inspect_focus, "monitor target set");
    }

    pub fn target(&self) -> String {
        self.lock_run().target.clone()
    }

    pub fn state(&self) -> ComponentState {
        self.lock_run().state
    }

    /// The last focused component (or error dialog) seen by the poller.
    pub fn focused(&self) -> Option<String> {
        self.lock_run().focused.clone()
    }

    /// Resets the run and spawns the poll loop, which ends once the state is resolved
    /// or another run starts.
    pub fn start(self: &Arc<Self>) -> Result<(), AppError> {
        let run_id = self.begin_run(Instant::now());
        let trace_id = Uuid::new_v4().to_string();
        let monitor = Arc::clone(self);
        let poll_trace = trace_id.clone();
        std::thread::Builder::new()
            .name("comp-state-poll".to_string())
            .spawn(move || monitor.poll_loop(run_id, &poll_trace))
            .map_err(|err| AppError::system(format!("Failed to spawn state poller: {err}"), &trace_id))?;
        Ok(())
    }

    fn begin_run(&self, now: Instant) -> u64 {
        let mut run = self.lock_run();
        run.run_id += 1;
        run.state = ComponentState::Unknown;
        run.started_at = Some(now);
        run.first_displayed_at = None;
        run.dwell_since = None;
        run.launcher_observations = 0;
        run.jump_observations = 0;
        run.is_started = false;
        run.focused = None;
        debug!(run_id = run.run_id, component = %run.target, "monitor run started");
        run.run_id
    }

    fn poll_loop(&self, run_id: u64, trace_id: &str) {
        let interval = Duration::from_millis(self.settings.poll_interval_ms);
        loop {
            {
                let run = self.lock_run();
                if run.run_id != run_id || run.state.is_resolved() {
                    break;
                }
                if !run.inspect_focus {
                    drop(run);
                    self.check_timeout(Instant::now());
                    std::thread::sleep(interval);
                    continue;
                }
            }
            match self.inspector.window_dump(trace_id) {
                Ok(dump) => {
                    if self.observe_run(run_id, &dump, Instant::now()) {
                        info!(trace_id = %trace_id, "dismissing deprecated sdk dialog");
                        for _ in 0..2 {
                            if let Err(err) = self.inspector.press_enter(trace_id) {
                                warn!(trace_id = %trace_id, error = %err, "failed to dismiss dialog");
                            }
                        }
                    }
                }
                Err(err) => warn!(trace_id = %trace_id, error = %err, "window inspection failed"),
            }
            self.check_timeout(Instant::now());
            std::thread::sleep(interval);
        }
        debug!(trace_id = %trace_id, run_id, "poll loop finished");
    }

    fn observe_run(&self, run_id: u64, dump: &str, now: Instant) -> bool {
        if self.lock_run().run_id != run_id {
            return false;
        }
        self.observe(dump, now)
    }

    /// Applies one window dump. Returns `true` when a dialog should be dismissed.
    pub fn observe(&self, dump: &str, now: Instant) -> bool {
        let focus = self.parser.parse(dump);
        let mut run = self.lock_run();
        if run.state.is_resolved() {
            return false;
        }

        match &focus.current {
            Some(CurrentFocus::ApplicationError(name)) => {
                run.focused = Some(name.clone());
                drop(run);
                self.raise(ComponentState::AppCrashed);
                return false;
            }
            Some(CurrentFocus::Other(name)) if name.contains(DEPRECATED_SDK_DIALOG) => {
                run.focused = Some(name.clone());
                return true;
            }
            _ => {}
        }

        if let Some(closing) = focus.last_closing_app.as_deref() {
            if !run.package.is_empty() && package_of(closing) == run.package && !run.is_started {
                debug!(closing = %closing, "target seen closing, marking started");
                run.is_started = true;
            }
        }

        let Some(focused) = focus.focused_component().map(normalize_focus_name) else {
            debug!("focus inconclusive this tick");
            return false;
        };
        run.focused = Some(focused.clone());

        let mut next = None;
        if focused == run.target {
            run.launcher_observations = 0;
            run.jump_observations = 0;
            if run.first_displayed_at.is_none() {
                run.first_displayed_at = Some(now);
                next = Some(ComponentState::Displayed);
            }
            match run.dwell_since {
                None => run.dwell_since = Some(now),
                Some(since) if now.duration_since(since) >= Duration::from_millis(self.settings.dwell_ms) => {
                    next = Some(ComponentState::Success);
                }
                Some(_) => {}
            }
        } else {
            run.dwell_since = None;
            if package_of(&focused) == self.launcher_package {
                run.jump_observations = 0;
                run.launcher_observations += 1;
                if run.launcher_observations >= self.settings.max_launcher_observations && !run.is_started {
                    next = Some(ComponentState::AppCrashed);
                }
            } else if focused == self.agent_component || package_of(&focused) == self.agent_package {
                run.launcher_observations = 0;
                run.jump_observations = 0;
            } else {
                run.launcher_observations = 0;
                run.jump_observations += 1;
                if run.jump_observations > self.settings.max_jump_observations {
                    next = Some(ComponentState::Jumped);
                }
            }
        }
        drop(run);
        if let Some(state) = next {
            self.raise(state);
        }
        false
    }

    /// Resolves runs that never displayed, or displayed without ever satisfying the dwell rule.
    pub fn check_timeout(&self, now: Instant) {
        let next = {
            let run = self.lock_run();
            if run.state.is_resolved() {
                return;
            }
            let Some(started_at) = run.started_at else {
                return;
            };
            match run.first_displayed_at {
                Some(displayed_at)
                    if now.duration_since(displayed_at)
                        >= Duration::from_millis(self.settings.displayed_timeout_ms) =>
                {
                    Some(ComponentState::DisplayedTimeout)
                }
                Some(_) => None,
                None if run.state < ComponentState::Displayed
                    && now.duration_since(started_at)
                        >= Duration::from_millis(self.settings.start_timeout_ms) =>
                {
                    Some(if run.is_started {
                        ComponentState::Success
                    } else {
                        ComponentState::Timeout
                    })
                }
                None => None,
            }
        };
        if let Some(state) = next {
            self.raise(state);
        }
    }

    /// Moves the state up to `state`; lower values are ignored.
    pub fn raise(&self, state: ComponentState) {
        let mut run = self.lock_run();
        if state > run.state {
            info!(from = %run.state, to = %state, component = %run.target, "component state changed");
            run.state = state;
            drop(run);
            self.changed.notify_all();
        }
    }

    /// Blocks until the run resolves or `timeout` passes, returning the state at that point.
    pub fn wait_resolved(&self, timeout: Duration) -> ComponentState {
        let deadline = Instant::now() + timeout;
        let mut run = self.lock_run();
        while !run.state.is_resolved() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            run = self
                .changed
                .wait_timeout(run, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        run.state
    }

    /// Upper bound on how long a single run can take to resolve on its own.
    pub fn run_budget(&self) -> Duration {
        Duration::from_millis(
            self.settings.start_timeout_ms + self.settings.displayed_timeout_ms + self.settings.dwell_ms,
        ) + Duration::from_millis(self.settings.poll_interval_ms * 4)
    }
}

impl ComponentSignals for ComponentStateMonitor {
    fn on_activity_displayed(&self, component: &str) {
        let now = Instant::now();
        let mut run = self.lock_run();
        if run.state != ComponentState::Unknown || normalize_focus_name(component) != run.target {
            return;
        }
        run.first_displayed_at = Some(now);
        run.dwell_since = Some(now);
        drop(run);
        self.raise(ComponentState::Displayed);
    }

    fn on_begin_of_crash(&self) {
        self.raise(ComponentState::AppCrashed);
    }
}

impl LinkObserver for ComponentStateMonitor {
    fn on_link_lost(&self) {
        self.raise(ComponentState::ClientError);
    }

    fn on_case_rejected(&self, code: i64) {
        if code == ResultCode::NotLoaded.code() {
            self.raise(ComponentState::ClientError);
        } else {
            self.raise(ComponentState::IntentError);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedInspector {
        dumps: Mutex<Vec<String>>,
        enters: AtomicUsize,
    }

    impl ScriptedInspector {
        fn new(dumps: Vec<String>) -> Self {
            Self {
                dumps: Mutex::new(dumps),
                enters: AtomicUsize::new(0),
            }
        }
    }

    impl FocusInspector for ScriptedInspector {
        fn window_dump(&self, _trace_id: &str) -> Result<String, AppError> {
            let mut dumps = self.dumps.lock().expect("dumps");
            if dumps.len() > 1 {
                Ok(dumps.remove(0))
            } else {
                dumps.first().cloned().ok_or_else(|| AppError::dependency("no device", "t"))
            }
        }

        fn press_enter(&self, _trace_id: &str) -> Result<(), AppError> {
            self.enters.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn focus_dump(component: &str) -> String {
        format!(
            "  mCurrentFocus=Window{{a1 u0 {component}}}\n  mFocusedApp=ActivityRecord{{e9 u0 {component} t12}}\n"
        )
    }

    fn closing_dump(focus: &str, closing: &str) -> String {
        format!(
            "{}  mLastClosingApp=AppWindowToken{{1 token=Token{{2 ActivityRecord{{3 u0 {closing} t11}}}}}}\n",
            focus_dump(focus)
        )
    }

    fn monitor_with(dumps: Vec<String>) -> (Arc<ComponentStateMonitor>, Arc<ScriptedInspector>) {
        let inspector = Arc::new(ScriptedInspector::new(dumps));
        let settings = MonitorSettings {
            poll_interval_ms: 20,
            dwell_ms: 100,
            start_timeout_ms: 300,
            displayed_timeout_ms: 2000,
            ..MonitorSettings::default()
        };
        let monitor = Arc::new(ComponentStateMonitor::new(
            inspector.clone(),
            &settings,
            &DeviceSettings::default(),
        ));
        monitor.set_component("com.x", "com.x.Main", "a");
        (monitor, inspector)
    }

    fn ms(base: Instant, offset: u64) -> Instant {
        base + Duration::from_millis(offset)
    }

    #[test]
    fn launcher_focus_without_start_is_a_crash() {
        let (monitor, _) = monitor_with(Vec::new());
        let t0 = Instant::now();
        monitor.begin_run(t0);
        let launcher = focus_dump("com.android.launcher3/.uioverrides.QuickstepLauncher");
        monitor.observe(&launcher, ms(t0, 10));
        monitor.observe(&launcher, ms(t0, 20));
        assert_eq!(monitor.state(), ComponentState::Unknown);
        monitor.observe(&launcher, ms(t0, 30));
        assert_eq!(monitor.state(), ComponentState::AppCrashed);
    }

    #[test]
    fn launcher_after_target_closed_is_not_a_crash() {
        let (monitor, _) = monitor_with(Vec::new());
        let t0 = Instant::now();
        monitor.begin_run(t0);
        let dump = closing_dump("com.android.launcher3/.Launcher", "com.x/.Main");
        for tick in 1..=5 {
            monitor.observe(&dump, ms(t0, tick * 10));
        }
        assert_eq!(monitor.state(), ComponentState::Unknown);
        monitor.check_timeout(ms(t0, 400));
        assert_eq!(monitor.state(), ComponentState::Success);
    }

    #[test]
    fn target_focused_for_dwell_is_success() {
        let (monitor, _) = monitor_with(Vec::new());
        let t0 = Instant::now();
        monitor.begin_run(t0);
        let target = focus_dump("com.x/com.x.Main");
        monitor.observe(&target, ms(t0, 10));
        assert_eq!(monitor.state(), ComponentState::Displayed);
        monitor.observe(&target, ms(t0, 60));
        assert_eq!(monitor.state(), ComponentState::Displayed);
        monitor.observe(&target, ms(t0, 110));
        assert_eq!(monitor.state(), ComponentState::Success);
    }

    #[test]
    fn losing_focus_restarts_the_dwell_window() {
        let (monitor, _) = monitor_with(Vec::new());
        let t0 = Instant::now();
        monitor.begin_run(t0);
        let target = focus_dump("com.x/.Main");
        monitor.observe(&target, ms(t0, 0));
        monitor.observe(&focus_dump("com.test.apptestclient/.activities.MainActivity"), ms(t0, 50));
        monitor.observe(&target, ms(t0, 120));
        assert_eq!(monitor.state(), ComponentState::Displayed);
        monitor.observe(&target, ms(t0, 230));
        assert_eq!(monitor.state(), ComponentState::Success);
    }

    #[test]
    fn foreign_focus_beyond_threshold_is_jump() {
        let (monitor, _) = monitor_with(Vec::new());
        let t0 = Instant::now();
        monitor.begin_run(t0);
        let other = focus_dump("com.other/.Browser");
        for tick in 1..=3 {
            monitor.observe(&other, ms(t0, tick * 10));
        }
        assert_eq!(monitor.state(), ComponentState::Unknown);
        monitor.observe(&other, ms(t0, 40));
        assert_eq!(monitor.state(), ComponentState::Jumped);
    }

    #[test]
    fn timeouts() {
        let (monitor, _) = monitor_with(Vec::new());
        let t0 = Instant::now();
        monitor.begin_run(t0);
        monitor.check_timeout(ms(t0, 200));
        assert_eq!(monitor.state(), ComponentState::Unknown);
        monitor.check_timeout(ms(t0, 300));
        assert_eq!(monitor.state(), ComponentState::Timeout);

        monitor.begin_run(t0);
        monitor.on_activity_displayed("com.x/.Main");
        assert_eq!(monitor.state(), ComponentState::Displayed);
        let displayed_at = monitor.lock_run().first_displayed_at.expect("displayed");
        monitor.check_timeout(displayed_at + Duration::from_millis(1999));
        assert_eq!(monitor.state(), ComponentState::Displayed);
        monitor.check_timeout(displayed_at + Duration::from_millis(2000));
        assert_eq!(monitor.state(), ComponentState::DisplayedTimeout);
    }

    #[test]
    fn state_never_decreases_within_a_run() {
        let (monitor, _) = monitor_with(Vec::new());
        let t0 = Instant::now();
        monitor.begin_run(t0);
        monitor.raise(ComponentState::Jumped);
        monitor.on_begin_of_crash();
        monitor.on_link_lost();
        monitor.on_activity_displayed("com.x/.Main");
        assert_eq!(monitor.state(), ComponentState::Jumped);
        monitor.observe(&focus_dump("  Application Error: com.x"), ms(t0, 10));
        assert_eq!(monitor.state(), ComponentState::Jumped);

        monitor.begin_run(t0);
        assert_eq!(monitor.state(), ComponentState::Unknown);
        monitor.on_case_rejected(ResultCode::StartComponentFailed.code());
        assert_eq!(monitor.state(), ComponentState::IntentError);
    }

    #[test]
    fn application_error_dialog_is_a_crash() {
        let (monitor, _) = monitor_with(Vec::new());
        let t0 = Instant::now();
        monitor.begin_run(t0);
        monitor.observe("  mCurrentFocus=Window{77 u0 Application Error: com.x}\n", ms(t0, 10));
        assert_eq!(monitor.state(), ComponentState::AppCrashed);
        assert_eq!(monitor.focused().as_deref(), Some("Application Error: com.x"));
    }

    #[test]
    fn poll_loop_resolves_and_dismisses_dialogs() {
        let (monitor, inspector) = monitor_with(vec![
            "  mCurrentFocus=Window{42 u0 DeprecatedTargetSdkVersionDialog}\n".to_string(),
            focus_dump("com.x/com.x.Main"),
        ]);
        monitor.start().expect("start");
        let state = monitor.wait_resolved(Duration::from_secs(5));
        assert_eq!(state, ComponentState::Success);
        assert_eq!(inspector.enters.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn non_activity_components_resolve_by_timeout_only() {
        let (monitor, _) = monitor_with(vec![focus_dump("com.other/.Browser")]);
        monitor.set_component("com.x", "com.x.SyncService", "s");
        monitor.start().expect("start");
        assert_eq!(monitor.wait_resolved(Duration::from_secs(5)), ComponentState::Timeout);
    }

    #[test]
    fn state_survives_a_poisoned_lock() {
        let (monitor, _) = monitor_with(Vec::new());
        let poisoner = Arc::clone(&monitor);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.run.lock().expect("lock");
            panic!("poll loop panicked while holding the lock");
        })
        .join();

        monitor.raise(ComponentState::AppCrashed);
        assert_eq!(monitor.state(), ComponentState::AppCrashed);
        assert_eq!(monitor.wait_resolved(Duration::from_millis(10)), ComponentState::AppCrashed);
    }
}
