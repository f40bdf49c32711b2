use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Action {
    Init = 1,
    Load = 2,
    RunCase = 3,
    RunCaseResult = 4,
}

impl Action {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Action::Init),
            2 => Some(Action::Load),
            3 => Some(Action::RunCase),
            4 => Some(Action::RunCaseResult),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        *self as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success = 0,
    InvalidSeq = 1,
    InvalidRequest = 2,
    InvalidAction = 3,
    NotLoaded = 4,
    LoadFileNotFound = -1,
    StartComponentFailed = -2,
}

impl ResultCode {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ResultCode::Success),
            1 => Some(ResultCode::InvalidSeq),
            2 => Some(ResultCode::InvalidRequest),
            3 => Some(ResultCode::InvalidAction),
            4 => Some(ResultCode::NotLoaded),
            -1 => Some(ResultCode::LoadFileNotFound),
            -2 => Some(ResultCode::StartComponentFailed),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        *self as i64
    }
}

/// One protocol message. Requests carry `action`, responses carry `code`; both carry `seq`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl Envelope {
    pub fn request(action: Action, data: Option<Map<String, Value>>) -> Self {
        Self {
            action: Some(action.code()),
            seq: None,
            code: None,
            data,
        }
    }

    pub fn response(code: ResultCode) -> Self {
        Self {
            action: None,
            seq: None,
            code: Some(code.code()),
            data: None,
        }
    }

    pub fn with_seq(mut self, seq: u32) -> Self {
        self.seq = Some(seq);
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn action_kind(&self) -> Option<Action> {
        self.action.and_then(Action::from_code)
    }

    pub fn result_code(&self) -> Option<ResultCode> {
        self.code.and_then(ResultCode::from_code)
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(ResultCode::Success.code())
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.as_ref()?.get(key)?.as_str()
    }

    pub fn data_i64(&self, key: &str) -> Option<i64> {
        self.data.as_ref()?.get(key)?.as_i64()
    }
}

/// Payload of a `Load` request: which component's case file the agent should open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadRequest {
    pub pkg_name: String,
    pub comp_name: String,
    pub comp_type: String,
    pub strategy: String,
}

impl LoadRequest {
    pub fn to_data(&self) -> Map<String, Value> {
        data_of([
            ("pkgName", Value::from(self.pkg_name.as_str())),
            ("compName", Value::from(self.comp_name.as_str())),
            ("compType", Value::from(self.comp_type.as_str())),
            ("strategy", Value::from(self.strategy.as_str())),
        ])
    }

    /// `None` unless all four fields are present, strings, and non-empty.
    pub fn from_envelope(envelope: &Envelope) -> Option<Self> {
        let field = |key: &str| {
            envelope
                .data_str(key)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        Some(Self {
            pkg_name: field("pkgName")?,
            comp_name: field("compName")?,
            comp_type: field("compType")?,
            strategy: field("strategy")?,
        })
    }
}

/// Builds a JSON object from key/value pairs.
pub fn data_of<I, K>(pairs: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(key, value)| (key.into(), value)).collect()
}
