use crate::types::StatusSnapshot;
use async_trait::async_trait;
use colony_core::{ColonyError, ColonyResult, TaskRequest};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::warn;

/// Tasks proposed by an oracle for one autonomy cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OracleResponse {
    pub tasks: Vec<TaskRequest>,
    pub rationale: Option<String>,
    /// Entries of `tasks` that were not task objects at all.
    #[serde(skip)]
    pub malformed: usize,
}

impl OracleResponse {
    /// Read `{tasks: [...], rationale?}`. A bare array is taken as the task list.
    pub fn from_value(value: Value) -> ColonyResult<Self> {
        let (items, rationale) = match value {
            Value::Array(items) => (items, None),
            Value::Object(mut obj) => {
                let rationale = obj
                    .remove("rationale")
                    .and_then(|r| r.as_str().map(str::to_string));
                let items = match obj.remove("tasks") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(items)) => items,
                    Some(_) => {
                        return Err(ColonyError::Json(
                            "oracle response 'tasks' must be an array".to_string(),
                        ))
                    }
                };
                (items, rationale)
            }
            _ => {
                return Err(ColonyError::Json(
                    "oracle response must be an object or an array".to_string(),
                ))
            }
        };

        let mut tasks = Vec::with_capacity(items.len());
        let mut malformed = 0;
        for item in items {
            match serde_json::from_value::<TaskRequest>(item) {
                Ok(task) if task.action.is_empty() && task.details.is_empty() => malformed += 1,
                Ok(task) => tasks.push(task),
                Err(e) => {
                    warn!(error = %e, "Oracle proposed a malformed task");
                    malformed += 1;
                }
            }
        }
        Ok(Self {
            tasks,
            rationale,
            malformed,
        })
    }

    /// Extract the JSON reply from free-form model output, tolerating code
    /// fences and surrounding prose.
    pub fn from_text(text: &str) -> ColonyResult<Self> {
        let trimmed = strip_fences(text.trim());
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return Self::from_value(value);
        }
        let start = trimmed.find(['{', '[']);
        let end = trimmed.rfind(['}', ']']);
        match (start, end) {
            (Some(start), Some(end)) if end > start => {
                let value: Value = serde_json::from_str(&trimmed[start..=end])?;
                Self::from_value(value)
            }
            _ => Err(ColonyError::Json(
                "no JSON object found in oracle output".to_string(),
            )),
        }
    }
}

fn strip_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// External language-model service that proposes tasks from a status snapshot.
#[async_trait]
pub trait Oracle: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        snapshot: &StatusSnapshot,
        instructions: &str,
        max_tasks: usize,
        temperature: f32,
    ) -> ColonyResult<OracleResponse>;
}

/// Oracle that replays a canned reply. Used for tests and `mock_response` config.
pub struct MockOracle {
    reply: Result<Value, String>,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockOracle {
    pub fn new(reply: Value) -> Self {
        Self {
            reply: Ok(reply),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// An oracle whose every call fails.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            reply: Err(reason.into()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Oracle for MockOracle {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(
        &self,
        _snapshot: &StatusSnapshot,
        _instructions: &str,
        _max_tasks: usize,
        _temperature: f32,
    ) -> ColonyResult<OracleResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.reply {
            Ok(value) => OracleResponse::from_value(value.clone()),
            Err(reason) => {
                warn!(reason = %reason, "Mock oracle failing");
                Err(ColonyError::OracleUnavailable)
            }
        }
    }
}
