use serde::{Deserialize, Serialize};

/// One parsed logcat line. Structured fields are `None` when the line did not
/// match the configured format; `raw_line` is always present.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEvent {
    pub timestamp: Option<String>,
    pub pid: Option<String>,
    pub tid: Option<String>,
    pub level: Option<String>,
    pub tag: Option<String>,
    pub message: Option<String>,
    pub raw_line: String,
}

impl LogEvent {
    pub fn raw(line: impl Into<String>) -> Self {
        Self {
            raw_line: line.into(),
            ..Self::default()
        }
    }

    pub fn message_starts_with(&self, prefix: &str) -> bool {
        self.message
            .as_deref()
            .map(|message| message.starts_with(prefix))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceBlock {
    pub head: LogEvent,
    pub body: String,
}

impl TraceBlock {
    pub fn mentions(&self, needle: &str) -> bool {
        self.body.contains(needle) || self.head.raw_line.contains(needle)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentState {
    #[default]
    Unknown = 0,
    Displayed = 1,
    /// Watchdog threshold only; never assigned.
    Result = 2,
    ClientError = 3,
    IntentError = 4,
    SystemError = 5,
    AppCrashed = 6,
    Timeout = 7,
    DisplayedTimeout = 8,
    Jumped = 9,
    Success = 10,
}

impl ComponentState {
    pub fn code(&self) -> &'static str {
        match self {
            ComponentState::Unknown => "UNK",
            ComponentState::Displayed => "DISPLAYED",
            ComponentState::Result => "RESULT",
            ComponentState::ClientError => "CLIENT_ERROR",
            ComponentState::IntentError => "INTENT_ERROR",
            ComponentState::SystemError => "SYS_ERROR",
            ComponentState::AppCrashed => "APP_CRASHED",
            ComponentState::Timeout => "TIMEOUT",
            ComponentState::DisplayedTimeout => "DISPLAYED_TIMEOUT",
            ComponentState::Jumped => "JUMPED",
            ComponentState::Success => "SUCCESS",
        }
    }

    pub fn is_resolved(&self) -> bool {
        *self >= ComponentState::Result
    }
}

impl std::fmt::Display for ComponentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Resumable position of the campaign loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cursor {
    pub apk_index: usize,
    pub component_index: usize,
    pub case_index: usize,
    pub strategy: Option<String>,
}

impl Cursor {
    pub fn next_apk(&mut self) {
        self.apk_index += 1;
        self.component_index = 0;
        self.case_index = 0;
        self.strategy = None;
    }

    pub fn next_component(&mut self) {
        self.component_index += 1;
        self.case_index = 0;
        self.strategy = None;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaseVerdict {
    Passed,
    Failed,
    Jumped,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CaseRecord {
    pub recorded_at: String,
    pub trace_id: String,
    pub apk: String,
    pub package: String,
    pub component: String,
    pub strategy: String,
    pub cursor: Cursor,
    pub attempt: u32,
    pub state: ComponentState,
    pub verdict: CaseVerdict,
    pub focused_component: Option<String>,
    pub trace_head: Option<String>,
    pub trace_body: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CampaignSummary {
    pub passed: usize,
    pub failed: usize,
    pub jumped: usize,
    pub skipped: usize,
    pub halted: bool,
}

impl CampaignSummary {
    pub fn record(&mut self, verdict: CaseVerdict) {
        match verdict {
            CaseVerdict::Passed => self.passed += 1,
            CaseVerdict::Failed => self.failed += 1,
            CaseVerdict::Jumped => self.jumped += 1,
            CaseVerdict::Skipped => self.skipped += 1,
        }
    }
}
