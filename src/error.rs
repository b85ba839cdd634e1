use thiserror::Error;

/// Failure raised by a provider adapter while talking to its upstream API.
#[derive(Debug, Error)]
pub enum AdapterError {
  #[error("HTTP request failed: {0}")]
  Http(String),

  #[error("upstream returned status {status}: {body}")]
  Status { status: u16, body: String },

  #[error("could not decode upstream response: {0}")]
  Decode(String),

  #[error("upstream call timed out after {0}s")]
  Timeout(u64),

  #[error("selector not supported by provider {provider}: {selector}")]
  Unsupported { provider: String, selector: String },

  #[error("{0}")]
  Other(String),
}

impl AdapterError {
  /// Whether a retry of the same call could plausibly succeed.
  pub fn is_transient(&self) -> bool {
    match self {
      AdapterError::Http(_) | AdapterError::Timeout(_) => true,
      AdapterError::Status { status, .. } => *status == 429 || *status >= 500,
      _ => false,
    }
  }
}

impl From<reqwest::Error> for AdapterError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_decode() {
      AdapterError::Decode(e.to_string())
    } else if let Some(status) = e.status() {
      AdapterError::Status { status: status.as_u16(), body: e.to_string() }
    } else {
      AdapterError::Http(e.to_string())
    }
  }
}

#[derive(Debug, Error)]
pub enum StorageError {
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("migration failed: {0}")]
  Migration(#[from] sqlx::migrate::MigrateError),

  #[error("corrupt row: {0}")]
  Corrupt(String),

  #[error("storage operation timed out after {0}s")]
  Timeout(u64),
}

impl From<serde_json::Error> for StorageError {
  fn from(e: serde_json::Error) -> Self {
    StorageError::Corrupt(e.to_string())
  }
}

/// Reason a single record was refused by the dedup engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
  #[error("missing provider")]
  MissingProvider,

  #[error("missing metric")]
  MissingMetric,

  #[error("latitude and longitude must both be present or both absent")]
  PartialLocation,

  #[error("coordinates out of range: {lat},{lon}")]
  OutOfRange { lat: f64, lon: f64 },

  #[error("value is not a finite number")]
  NonFiniteValue,
}

#[derive(Debug, Error)]
pub enum ScanError {
  #[error("invalid scan request: {0}")]
  InvalidRequest(String),

  #[error(transparent)]
  Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum TaskError {
  #[error("unknown task: {0}")]
  NotFound(String),

  #[error("task {0} is already running")]
  AlreadyRunning(String),

  #[error("invalid parameters for task {task}: {reason}")]
  InvalidParams { task: String, reason: String },

  #[error("task {task} failed in provider {provider}: {source}")]
  Adapter {
    task: String,
    provider: String,
    #[source]
    source: AdapterError,
  },

  #[error("task {task} could not store results: {source}")]
  Storage {
    task: String,
    #[source]
    source: StorageError,
  },

  #[error("task {task} exceeded its maximum duration of {secs}s")]
  Timeout { task: String, secs: u64 },
}
