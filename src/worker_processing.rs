use anyhow::{Result, anyhow};
use regex::Regex;
use std::sync::LazyLock;
use tracing::{error, info};

use crate::error::TaskError;
use crate::messaging::RunRequest;
use crate::tasks::{RunOutcome, TaskRunner};

const TASK_NAME_MAX: usize = 128;

static TASK_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap());

pub fn valid_task_name(name: &str) -> bool {
  name.len() <= TASK_NAME_MAX && TASK_NAME.is_match(name)
}

/// Decodes a queued delivery body.
pub fn parse_run_request(payload: &[u8]) -> Result<RunRequest> {
  let request: RunRequest = serde_json::from_slice(payload)?;
  if !valid_task_name(&request.task) {
    return Err(anyhow!("invalid task name '{}'", request.task));
  }
  Ok(request)
}

/// Executes one queued request. Failed runs are already recorded in the run
/// history; the return value only says whether a run took place.
pub async fn process_run_request(runner: &TaskRunner, request: &RunRequest, worker_id: &str) -> Result<Option<RunOutcome>> {
  info!(worker = worker_id, task = %request.task, trigger = request.trigger.as_str(), "Processing run request");
  match runner.run(&request.task, request.params.as_ref(), request.trigger).await {
    Ok(outcome) => {
      if outcome.success {
        info!(worker = worker_id, task = %request.task, run_id = %outcome.run_id, records = outcome.records_processed, "Run request completed");
      } else {
        error!(worker = worker_id, task = %request.task, run_id = %outcome.run_id, error = ?outcome.error, "Run request failed");
      }
      Ok(Some(outcome))
    }
    Err(TaskError::AlreadyRunning(task)) => {
      info!(worker = worker_id, task = %task, "Task already running, request dropped");
      Ok(None)
    }
    Err(e) => Err(e.into()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::RunTrigger;

  #[test]
  fn parses_queue_payloads() {
    let request = parse_run_request(br#"{"task": "air_global", "trigger": "schedule", "priority": 2}"#).unwrap();
    assert_eq!(request.task, "air_global");
    assert_eq!(request.trigger, RunTrigger::Schedule);
    assert_eq!(request.priority, 2);

    assert!(parse_run_request(b"not json").is_err());
    assert!(parse_run_request(br#"{"task": "../etc"}"#).is_err());
    assert!(parse_run_request(br#"{"task": "a", "trigger": "cron"}"#).is_err());
  }

  #[test]
  fn task_name_pattern_compiles() {
    assert!(LazyLock::force(&TASK_NAME).is_match("air_global"));
  }

  #[test]
  fn task_name_charset() {
    assert!(valid_task_name("fires_nordic-v2.1"));
    assert!(!valid_task_name(""));
    assert!(!valid_task_name("a b"));
    assert!(!valid_task_name("x/y"));
  }
}
