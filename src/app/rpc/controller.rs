use std::io::BufReader;
use std::net::{Shutdown, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::adb::device::DeviceControl;
use crate::app::config::{DeviceSettings, RpcSettings};
use crate::app::error::AppError;
use crate::app::rpc::envelope::{data_of, Action, Envelope, LoadRequest, ResultCode};
use crate::app::rpc::frame::{read_envelope, write_envelope};

/// Receives link failures the campaign must see as component states.
pub trait LinkObserver: Send + Sync {
    fn on_link_lost(&self);
    fn on_case_rejected(&self, code: i64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Idle,
    Pending,
    Loaded { count: usize },
    Failed { code: i64 },
}

pub type ResponseCallback = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// A response handler. `auto_remove` handlers are dropped after their first invocation.
#[derive(Clone)]
pub struct Registration {
    pub name: String,
    pub priority: i32,
    pub auto_remove: bool,
    pub callback: ResponseCallback,
}

impl Registration {
    pub fn once(name: impl Into<String>, priority: i32, callback: ResponseCallback) -> Self {
        Self {
            name: name.into(),
            priority,
            auto_remove: true,
            callback,
        }
    }

    pub fn persistent(name: impl Into<String>, priority: i32, callback: ResponseCallback) -> Self {
        Self {
            auto_remove: false,
            ..Self::once(name, priority, callback)
        }
    }
}

struct LinkState {
    writer: Option<TcpStream>,
    generation: u64,
    seq: u32,
    awaiting: Option<u32>,
    ready: bool,
    loaded: bool,
    load_status: LoadStatus,
    cached_load: Option<LoadRequest>,
    retries_used: u32,
    reconnecting: bool,
    exhausted: bool,
    teardowns: usize,
}

impl Default for LinkState {
    fn default() -> Self {
        Self {
            writer: None,
            generation: 0,
            seq: 0,
            awaiting: None,
            ready: false,
            loaded: false,
            load_status: LoadStatus::Idle,
            cached_load: None,
            retries_used: 0,
            reconnecting: false,
            exhausted: false,
            teardowns: 0,
        }
    }
}

/// The initiator half of the protocol: one link to the agent, one outstanding
/// request at a time, reconnect with a bounded retry budget.
pub struct RpcController {
    me: Weak<RpcController>,
    settings: RpcSettings,
    agent_package: String,
    agent_component: String,
    device: Arc<dyn DeviceControl>,
    observer: Arc<dyn LinkObserver>,
    state: Mutex<LinkState>,
    changed: Condvar,
    handlers: Mutex<Vec<Registration>>,
}

impl RpcController {
    pub fn new(
        settings: &RpcSettings,
        device_settings: &DeviceSettings,
        device: Arc<dyn DeviceControl>,
        observer: Arc<dyn LinkObserver>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            settings: settings.clone(),
            agent_package: device_settings.agent_package.clone(),
            agent_component: device_settings.agent_component(),
            device,
            observer,
            state: Mutex::new(LinkState::default()),
            changed: Condvar::new(),
            handlers: Mutex::new(Vec::new()),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.ready_timeout_ms)
    }

    pub fn is_ready(&self) -> bool {
        self.lock_state().ready
    }

    pub fn is_loaded(&self) -> bool {
        self.lock_state().loaded
    }

    pub fn is_exhausted(&self) -> bool {
        self.lock_state().exhausted
    }

    pub fn load_status(&self) -> LoadStatus {
        self.lock_state().load_status
    }

    /// Number of times a live link was actually torn down.
    #[cfg(test)]
    fn teardowns(&self) -> usize {
        self.lock_state().teardowns
    }

    /// Forwards a local port to the agent's `remote_port` and connects through it.
    pub fn connect_announced(&self, remote_port: u16) -> Result<(), AppError> {
        let trace_id = Uuid::new_v4().to_string();
        let local = self.device.forward_port(remote_port, &trace_id)?;
        self.connect(local)
    }

    /// Opens the link, starts its receive loop and sends `Init`. An existing link is replaced.
    pub fn connect(&self, port: u16) -> Result<(), AppError> {
        let trace_id = Uuid::new_v4().to_string();
        let stream = TcpStream::connect((self.settings.host.as_str(), port)).map_err(|err| {
            AppError::dependency(format!("Failed to connect to agent on port {port}: {err}"), &trace_id)
        })?;
        let _ = stream.set_nodelay(true);
        let reader = stream
            .try_clone()
            .map_err(|err| AppError::system(format!("Failed to split rpc stream: {err}"), &trace_id))?;

        let generation = {
            let mut state = self.lock_state();
            if let Some(previous) = state.writer.take() {
                let _ = previous.shutdown(Shutdown::Both);
            }
            state.generation += 1;
            state.seq = 0;
            state.awaiting = None;
            state.ready = false;
            state.loaded = false;
            state.writer = Some(stream);
            state.generation
        };
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.changed.notify_all();

        let weak = self.me.clone();
        let loop_trace = trace_id.clone();
        std::thread::Builder::new()
            .name("rpc-receive".to_string())
            .spawn(move || receive_loop(weak, generation, reader, &loop_trace))
            .map_err(|err| AppError::system(format!("Failed to spawn rpc receive loop: {err}"), &trace_id))?;
        info!(trace_id = %trace_id, port, generation, "rpc link connected");

        let weak = self.me.clone();
        let on_init: ResponseCallback = Arc::new(move |response: &Envelope| {
            if let Some(controller) = weak.upgrade() {
                controller.on_init_response(response);
            }
        });
        self.send(
            Envelope::request(Action::Init, None),
            Some(Registration::once("InitResponse", 0, on_init)),
        )?;
        Ok(())
    }

    /// Blocks until the link may carry `action`, then assigns the next sequence number and writes.
    pub fn send(&self, mut envelope: Envelope, handler: Option<Registration>) -> Result<u32, AppError> {
        let trace_id = Uuid::new_v4().to_string();
        let action = envelope.action_kind().ok_or_else(|| {
            AppError::validation(format!("Cannot send unknown action {:?}", envelope.action), &trace_id)
        })?;
        let mut state = self.wait_until(&format!("{action:?} send"), &trace_id, |state| {
            state.writer.is_some()
                && state.awaiting.is_none()
                && (action == Action::Init || state.ready)
                && (action != Action::RunCase || state.loaded)
        })?;

        state.seq = state.seq.wrapping_add(1);
        let seq = state.seq;
        envelope.seq = Some(seq);
        if action == Action::Load {
            state.cached_load = LoadRequest::from_envelope(&envelope);
            state.load_status = LoadStatus::Pending;
            state.loaded = false;
        }
        if let Some(handler) = handler {
            self.register(handler);
        }

        let written = match state.writer.as_mut() {
            Some(writer) => write_envelope(writer, &envelope),
            None => return Err(AppError::dependency("rpc link closed", &trace_id)),
        };
        match written {
            Ok(()) => {
                state.awaiting = Some(seq);
                debug!(trace_id = %trace_id, action = ?action, seq, "request sent");
                Ok(seq)
            }
            Err(err) => {
                drop(state);
                warn!(trace_id = %trace_id, error = %err, "rpc write failed");
                self.link_failed(None);
                Err(err.into_app_error(&trace_id))
            }
        }
    }

    pub fn register(&self, registration: Registration) {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        handlers.push(registration);
        handlers.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
    }

    pub fn load_cases(&self, request: LoadRequest) -> Result<u32, AppError> {
        let weak = self.me.clone();
        let on_load: ResponseCallback = Arc::new(move |response: &Envelope| {
            if let Some(controller) = weak.upgrade() {
                controller.on_load_response(response);
            }
        });
        self.send(
            Envelope::request(Action::Load, Some(request.to_data())),
            Some(Registration::once("LoadResponse", 0, on_load)),
        )
    }

    /// Replays the most recent `Load`. Returns `Ok(None)` when nothing was ever loaded.
    pub fn reload_cases(&self) -> Result<Option<u32>, AppError> {
        let cached = self.lock_state().cached_load.clone();
        match cached {
            Some(request) => {
                info!(component = %request.comp_name, strategy = %request.strategy, "replaying load");
                self.load_cases(request).map(Some)
            }
            None => Ok(None),
        }
    }

    pub fn run_case(&self, case_id: usize) -> Result<u32, AppError> {
        let weak = self.me.clone();
        let on_run: ResponseCallback = Arc::new(move |response: &Envelope| {
            if let Some(controller) = weak.upgrade() {
                controller.on_run_case_response(response);
            }
        });
        self.send(
            Envelope::request(Action::RunCase, Some(data_of([("caseId", json!(case_id))]))),
            Some(Registration::once("RunCaseResponse", 0, on_run)),
        )
    }

    pub fn wait_ready(&self) -> Result<(), AppError> {
        let trace_id = Uuid::new_v4().to_string();
        self.wait_until("agent ready", &trace_id, |state| state.ready)
            .map(|_| ())
    }

    /// Blocks until the outstanding `Load` is answered.
    pub fn wait_load(&self) -> Result<LoadStatus, AppError> {
        let trace_id = Uuid::new_v4().to_string();
        self.wait_until("load response", &trace_id, |state| {
            state.load_status != LoadStatus::Pending
        })
        .map(|state| state.load_status)
    }

    /// Gives an unanswered request `grace` to complete, then drops the link with a
    /// retry so later sends do not queue behind it. Returns whether the link was dropped.
    pub fn release_outstanding(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        let mut state = self.lock_state();
        while let Some(seq) = state.awaiting {
            let now = Instant::now();
            if now >= deadline {
                drop(state);
                warn!(seq, grace_ms = grace.as_millis() as u64, "request never answered, resetting link");
                self.disconnect(true);
                return true;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        false
    }

    /// Brings the agent up the configured way and waits for `Init`. With no fixed
    /// bridge port the link is opened by the log announcer once the agent reports its port.
    pub fn establish(&self) -> Result<(), AppError> {
        let trace_id = Uuid::new_v4().to_string();
        if self.settings.bridge_port == 0 {
            self.restart_agent(&trace_id)?;
        } else {
            self.connect_announced(self.settings.bridge_port)?;
        }
        self.wait_ready()
    }

    /// Tears the link down. A no-op when already disconnected. With `is_retry` a
    /// reconnect is scheduled while retry budget remains.
    pub fn disconnect(&self, is_retry: bool) {
        {
            let mut state = self.lock_state();
            let Some(writer) = state.writer.take() else {
                return;
            };
            let _ = writer.shutdown(Shutdown::Both);
            state.teardowns += 1;
            state.generation += 1;
            state.awaiting = None;
            state.ready = false;
            state.loaded = false;
            let replay = is_retry && state.cached_load.is_some();
            if state.load_status == LoadStatus::Pending && !replay {
                state.load_status = LoadStatus::Idle;
            }
            info!(generation = state.generation, is_retry, "rpc link disconnected");
        }
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.changed.notify_all();
        if is_retry {
            self.schedule_reconnect();
        }
    }

    fn wait_until<F>(&self, what: &str, trace_id: &str, ready: F) -> Result<MutexGuard<'_, LinkState>, AppError>
    where
        F: Fn(&LinkState) -> bool,
    {
        let deadline = Instant::now() + self.ready_timeout();
        let mut state = self.lock_state();
        loop {
            if state.exhausted {
                return Err(AppError::dependency(
                    format!("rpc link gave up after {} retries ({what})", self.settings.max_retry),
                    trace_id,
                ));
            }
            if ready(&state) {
                return Ok(state);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(AppError::dependency(format!("Timed out waiting for {what}"), trace_id));
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn accept_response(&self, generation: u64, response: &Envelope) -> Result<(), String> {
        {
            let mut state = self.lock_state();
            if state.generation != generation {
                return Ok(());
            }
            let (Some(seq), Some(_)) = (response.seq, response.code) else {
                return Err("response without seq or code".to_string());
            };
            if seq != state.seq {
                return Err(format!("response seq {seq} does not match last sent {}", state.seq));
            }
            state.awaiting = None;
        }
        self.changed.notify_all();
        self.dispatch(generation, response);
        Ok(())
    }

    fn dispatch(&self, generation: u64, response: &Envelope) {
        let taken = std::mem::take(&mut *self.handlers.lock().unwrap_or_else(PoisonError::into_inner));
        let mut kept = Vec::with_capacity(taken.len());
        for registration in taken {
            let callback = Arc::clone(&registration.callback);
            if catch_unwind(AssertUnwindSafe(|| callback(response))).is_err() {
                error!(handler = %registration.name, "response handler panicked");
            }
            if !registration.auto_remove {
                kept.push(registration);
            }
        }
        if kept.is_empty() || self.lock_state().generation != generation {
            return;
        }
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        handlers.extend(kept);
        handlers.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
    }

    fn on_init_response(&self, response: &Envelope) {
        if !response.is_success() {
            warn!(code = ?response.code, "agent rejected init");
            return;
        }
        self.lock_state().ready = true;
        self.changed.notify_all();
        info!(version = ?response.data_i64("version"), "agent ready");
    }

    fn on_load_response(&self, response: &Envelope) {
        {
            let mut state = self.lock_state();
            if response.is_success() {
                let count = response
                    .data_i64("count")
                    .and_then(|count| usize::try_from(count).ok())
                    .unwrap_or(0);
                state.loaded = true;
                state.retries_used = 0;
                state.load_status = LoadStatus::Loaded { count };
                info!(count, "cases loaded");
            } else {
                let code = response.code.unwrap_or_default();
                state.loaded = false;
                state.load_status = LoadStatus::Failed { code };
                warn!(code, "agent rejected load");
            }
        }
        self.changed.notify_all();
    }

    fn on_run_case_response(&self, response: &Envelope) {
        match response.result_code() {
            Some(ResultCode::Success) => {
                self.lock_state().retries_used = 0;
            }
            Some(ResultCode::NotLoaded) => {
                warn!("agent lost the loaded suite, reloading");
                self.lock_state().loaded = false;
                self.changed.notify_all();
                self.observer.on_case_rejected(ResultCode::NotLoaded.code());
                if let Err(err) = self.reload_cases() {
                    warn!(error = %err, "failed to replay load");
                }
            }
            _ => {
                let code = response.code.unwrap_or_default();
                warn!(code, "agent failed to start the case");
                self.observer.on_case_rejected(code);
            }
        }
    }

    fn link_failed(&self, generation: Option<u64>) {
        if let Some(generation) = generation {
            if self.lock_state().generation != generation {
                return;
            }
        }
        self.observer.on_link_lost();
        self.disconnect(true);
    }

    fn restart_agent(&self, trace_id: &str) -> Result<(), AppError> {
        info!(trace_id = %trace_id, agent = %self.agent_component, "restarting agent");
        self.device.force_stop(&self.agent_package, trace_id)?;
        self.device.start_activity(&self.agent_component, trace_id)?;
        if self.settings.bridge_port == 0 {
            return Ok(());
        }
        // The agent needs a moment to open its listener after the activity starts.
        let deadline = Instant::now() + self.ready_timeout();
        loop {
            match self.connect_announced(self.settings.bridge_port) {
                Ok(()) => return Ok(()),
                Err(err) if Instant::now() < deadline => {
                    debug!(trace_id = %trace_id, error = %err, "agent not listening yet");
                    std::thread::sleep(Duration::from_millis(200));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn schedule_reconnect(&self) {
        {
            let mut state = self.lock_state();
            if state.reconnecting || state.exhausted {
                return;
            }
            state.reconnecting = true;
        }
        let Some(controller) = self.me.upgrade() else {
            return;
        };
        let spawned = std::thread::Builder::new()
            .name("rpc-reconnect".to_string())
            .spawn(move || controller.reconnect_loop());
        if let Err(err) = spawned {
            error!(error = %err, "failed to spawn reconnect thread");
            self.lock_state().reconnecting = false;
        }
    }

    fn reconnect_loop(&self) {
        let trace_id = Uuid::new_v4().to_string();
        loop {
            {
                let mut state = self.lock_state();
                if state.retries_used >= self.settings.max_retry {
                    state.exhausted = true;
                    state.reconnecting = false;
                    drop(state);
                    self.changed.notify_all();
                    error!(trace_id = %trace_id, max_retry = self.settings.max_retry, "rpc retry budget exhausted");
                    self.observer.on_link_lost();
                    return;
                }
                state.retries_used += 1;
                info!(trace_id = %trace_id, attempt = state.retries_used, "reconnecting to agent");
            }
            std::thread::sleep(Duration::from_millis(self.settings.retry_backoff_ms));
            if let Err(err) = self.restart_agent(&trace_id) {
                warn!(trace_id = %trace_id, error = %err, "agent restart failed");
                continue;
            }
            match self.wait_ready() {
                Ok(()) => break,
                Err(err) => warn!(trace_id = %trace_id, error = %err, "agent did not become ready"),
            }
        }
        self.lock_state().reconnecting = false;
        match self.reload_cases() {
            Ok(Some(seq)) => info!(trace_id = %trace_id, seq, "load replayed after reconnect"),
            Ok(None) => {}
            Err(err) => warn!(trace_id = %trace_id, error = %err, "failed to replay load after reconnect"),
        }
    }
}

fn receive_loop(weak: Weak<RpcController>, generation: u64, stream: TcpStream, trace_id: &str) {
    let mut reader = BufReader::new(stream);
    loop {
        let result = read_envelope(&mut reader);
        let Some(controller) = weak.upgrade() else {
            return;
        };
        match result {
            Ok(Some(response)) => {
                debug!(trace_id = %trace_id, seq = ?response.seq, code = ?response.code, "response received");
                if let Err(reason) = controller.accept_response(generation, &response) {
                    warn!(trace_id = %trace_id, reason = %reason, "invalid response, reconnecting");
                    controller.link_failed(Some(generation));
                    return;
                }
            }
            Ok(None) => {
                info!(trace_id = %trace_id, "rpc link closed by agent");
                controller.link_failed(Some(generation));
                return;
            }
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "rpc receive failed");
                controller.link_failed(Some(generation));
                return;
            }
        }
    }
}
