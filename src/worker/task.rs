//! Task types
//!
//! A task is a typed payload plus the delivery options the broker keeps
//! alongside it.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// High-priority lane
pub const QUEUE_CRITICAL: &str = "critical";
/// Everything else
pub const QUEUE_DEFAULT: &str = "default";

const DEFAULT_MAX_RETRY: u32 = 25;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Kind name plus JSON payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub kind: String,
    pub payload: serde_json::Value,
}

impl Task {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Build a task from any serializable payload
    pub fn from_payload<P: Serialize>(
        kind: impl Into<String>,
        payload: &P,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, serde_json::to_value(payload)?))
    }

    pub fn decode<P: DeserializeOwned>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Per-task delivery options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOptions {
    pub queue: String,
    pub max_retry: u32,
    /// Earliest execution is `now + process_in`
    pub process_in: Option<Duration>,
    /// Upper bound for a single attempt
    pub timeout: Duration,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self {
            queue: QUEUE_DEFAULT.to_string(),
            max_retry: DEFAULT_MAX_RETRY,
            process_in: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_in = Some(delay);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Earliest execution time for a task enqueued now
    pub fn process_at(&self) -> DateTime<Utc> {
        let now = Utc::now();
        match self
            .process_in
            .and_then(|d| chrono::Duration::from_std(d).ok())
        {
            Some(delay) => now + delay,
            None => now,
        }
    }
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// A task together with the options to enqueue it with
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub task: Task,
    pub options: TaskOptions,
}

impl TaskRequest {
    pub fn new(task: Task, options: TaskOptions) -> Self {
        Self { task, options }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for its first attempt
    Pending,
    /// Leased by a worker
    Active,
    /// Waiting for another attempt after a retryable failure
    Retry,
    Completed,
    /// Terminal failure; kept for operators
    Archived,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Active => "active",
            TaskState::Retry => "retry",
            TaskState::Completed => "completed",
            TaskState::Archived => "archived",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "active" => Ok(TaskState::Active),
            "retry" => Ok(TaskState::Retry),
            "completed" => Ok(TaskState::Completed),
            "archived" => Ok(TaskState::Archived),
            other => Err(format!("unknown task state: {}", other)),
        }
    }
}

/// What the broker reports back after an enqueue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub id: i64,
    pub kind: String,
    pub queue: String,
    pub max_retry: u32,
    pub process_at: DateTime<Utc>,
    pub state: TaskState,
}

/// A task leased to a worker for one attempt
#[derive(Debug, Clone)]
pub struct LeasedTask {
    pub id: i64,
    pub task: Task,
    pub queue: String,
    /// Attempts that already failed
    pub retried: u32,
    pub max_retry: u32,
    pub timeout: Duration,
}

impl LeasedTask {
    /// True once no retry budget is left
    pub fn retries_exhausted(&self) -> bool {
        self.retried >= self.max_retry
    }
}
