//! Wire types for the remote task API.

use serde::{Deserialize, Serialize};

// ============================================================================
// Requests
// ============================================================================

/// Body of `POST /api/v1/jobs/createTask`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateTaskRequest {
    /// Remote model identifier.
    pub model: String,
    /// Opaque model input.
    pub input: serde_json::Value,
    /// Where the remote service should post completion notifications.
    #[serde(rename = "callBackUrl", skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

impl CreateTaskRequest {
    /// Create a request without a callback URL.
    #[must_use]
    pub fn new(model: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            model: model.into(),
            input,
            callback_url: None,
        }
    }

    /// Set the callback URL.
    #[must_use]
    pub fn with_callback(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Envelope wrapping every response: `{code, msg, data}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    /// Application status code (200 on success).
    pub code: i64,
    /// Human-readable message.
    #[serde(default)]
    pub msg: Option<String>,
    /// Payload.
    pub data: Option<T>,
}

/// `data` of a createTask response.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskData {
    /// Remote task ID.
    #[serde(rename = "taskId", default)]
    pub task_id: Option<String>,
}

/// `data` of a recordInfo response.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordInfo {
    /// Remote task ID.
    #[serde(default)]
    pub task_id: Option<String>,
    /// Raw remote state.
    #[serde(default)]
    pub state: Option<String>,
    /// Result payload, either an object or a JSON-encoded string.
    #[serde(default)]
    pub result_json: Option<serde_json::Value>,
    /// Failure code (numeric or string).
    #[serde(default)]
    pub fail_code: Option<serde_json::Value>,
    /// Failure message.
    #[serde(default)]
    pub fail_msg: Option<String>,
    /// URLs reported outside `resultJson`.
    #[serde(default)]
    pub result_urls: Option<serde_json::Value>,
    /// Single URL reported outside `resultJson`.
    #[serde(default)]
    pub result_url: Option<String>,
}

/// Normalized remote task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Still running (any unrecognized state maps here).
    Waiting,
    /// Finished with results.
    Success,
    /// Finished without results.
    Fail,
}

impl TaskState {
    /// Whether no further transitions will be reported.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Waiting)
    }
}

/// Map a raw remote state onto [`TaskState`].
#[must_use]
pub fn normalize_state(raw: &str) -> TaskState {
    match raw.trim().to_ascii_lowercase().as_str() {
        "success" | "done" | "completed" => TaskState::Success,
        "fail" | "failed" | "error" | "canceled" | "cancelled" => TaskState::Fail,
        _ => TaskState::Waiting,
    }
}

/// Normalized status of a remote task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    /// Normalized state.
    pub state: TaskState,
    /// Result URLs, in report order.
    pub result_urls: Vec<String>,
    /// Failure code, if any.
    pub error_code: Option<String>,
    /// Failure message, if any.
    pub error_message: Option<String>,
}

impl TaskStatus {
    /// A status with no results yet.
    #[must_use]
    pub fn waiting() -> Self {
        Self {
            state: TaskState::Waiting,
            result_urls: Vec::new(),
            error_code: None,
            error_message: None,
        }
    }
}

impl From<RecordInfo> for TaskStatus {
    fn from(record: RecordInfo) -> Self {
        let state = record
            .state
            .as_deref()
            .map_or(TaskState::Waiting, normalize_state);
        let result_urls = parse_result_urls(&record);
        let error_code = record.fail_code.as_ref().and_then(value_to_string);
        let error_message = record.fail_msg.filter(|m| !m.trim().is_empty());

        Self {
            state,
            result_urls,
            error_code,
            error_message,
        }
    }
}

/// Collect result URLs from every place the remote service reports them.
///
/// `resultJson` may be an object or a JSON string holding one; inside it,
/// `resultUrls` may be a list or a single string and `resultUrl` a single
/// string. A `resultJson` string that is not JSON is scanned for bare URLs.
#[must_use]
pub fn parse_result_urls(record: &RecordInfo) -> Vec<String> {
    let mut urls = Vec::new();

    match &record.result_json {
        Some(serde_json::Value::String(raw)) if !raw.trim().is_empty() => {
            match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(object) => collect_from_object(&object, &mut urls),
                Err(_) => urls.extend(scan_urls(raw)),
            }
        }
        Some(object @ serde_json::Value::Object(_)) => collect_from_object(object, &mut urls),
        _ => {}
    }

    if let Some(direct) = &record.result_urls {
        collect_url_list(direct, &mut urls);
    }
    if let Some(url) = &record.result_url {
        urls.push(url.clone());
    }

    urls.retain(|u| !u.trim().is_empty());
    urls
}

fn collect_from_object(object: &serde_json::Value, out: &mut Vec<String>) {
    if let Some(list) = object.get("resultUrls").or_else(|| object.get("result_urls")) {
        collect_url_list(list, out);
    }
    if let Some(single) = object
        .get("resultUrl")
        .or_else(|| object.get("result_url"))
        .and_then(serde_json::Value::as_str)
    {
        out.push(single.to_string());
    }
}

fn collect_url_list(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => out.push(s.clone()),
        serde_json::Value::Array(items) => out.extend(
            items
                .iter()
                .filter_map(serde_json::Value::as_str)
                .map(ToString::to_string),
        ),
        _ => {}
    }
}

fn scan_urls(raw: &str) -> Vec<String> {
    raw.split(|c: char| c.is_whitespace() || c == '"' || c == '\'')
        .filter(|token| token.starts_with("http://") || token.starts_with("https://"))
        .map(ToString::to_string)
        .collect()
}

fn value_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) if s.is_empty() => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
