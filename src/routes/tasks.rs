use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info};
use warp::http::StatusCode;
use warp::hyper::body::Bytes;
use warp::{Filter, Rejection, Reply};

use super::{ApiError, AppState, with_state};
use crate::error::TaskError;
use crate::messaging::{DEFAULT_PRIORITY, RunRequest, publish_run_request};
use crate::models::RunTrigger;
use crate::worker_processing::valid_task_name;

const DEFAULT_LOG_LIMIT: i64 = 20;
const MAX_LOG_LIMIT: i64 = 500;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunBody {
  #[serde(default)]
  pub params: Option<Map<String, Value>>,
  #[serde(default)]
  pub priority: Option<u8>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
  pub limit: Option<i64>,
}

#[derive(Serialize)]
pub struct EnqueueResponse {
  pub task: String,
  pub status: String,
}

fn check_name(name: &str) -> Result<(), Rejection> {
  if valid_task_name(name) {
    Ok(())
  } else {
    Err(ApiError::bad_request(format!("invalid task name '{name}'")))
  }
}

// an empty body means "no overrides"
fn parse_body(body: &Bytes) -> Result<RunBody, Rejection> {
  if body.iter().all(u8::is_ascii_whitespace) {
    return Ok(RunBody::default());
  }
  serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid body: {e}")))
}

pub fn task_routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  list_route(state.clone())
    .or(run_route(state.clone()))
    .or(enqueue_route(state.clone()))
    .or(logs_route(state))
}

fn list_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path("tasks")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_state(state))
    .and_then(handle_list)
}

fn run_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("tasks" / String / "run")
    .and(warp::post())
    .and(warp::body::bytes())
    .and(with_state(state))
    .and_then(handle_run)
}

fn enqueue_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("tasks" / String / "enqueue")
    .and(warp::post())
    .and(warp::body::bytes())
    .and(with_state(state))
    .and_then(handle_enqueue)
}

fn logs_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path!("tasks" / String / "logs")
    .and(warp::get())
    .and(warp::query::<LogsQuery>())
    .and(with_state(state))
    .and_then(handle_logs)
}

async fn handle_list(state: AppState) -> Result<impl Reply, Rejection> {
  let tasks = state.context.coverage.task_summaries().await.map_err(ApiError::internal)?;
  Ok(warp::reply::json(&tasks))
}

async fn handle_run(name: String, body: Bytes, state: AppState) -> Result<impl Reply, Rejection> {
  check_name(&name)?;
  let body = parse_body(&body)?;
  match state.context.runner.run(&name, body.params.as_ref(), RunTrigger::Manual).await {
    Ok(outcome) => Ok(warp::reply::json(&outcome)),
    Err(TaskError::NotFound(_)) => Err(ApiError::new(StatusCode::NOT_FOUND, format!("unknown task '{name}'"))),
    Err(TaskError::AlreadyRunning(_)) => Err(ApiError::new(StatusCode::CONFLICT, format!("task '{name}' is already running"))),
    Err(e) => Err(ApiError::internal(e)),
  }
}

async fn handle_enqueue(name: String, body: Bytes, state: AppState) -> Result<impl Reply, Rejection> {
  check_name(&name)?;
  let body = parse_body(&body)?;
  let known = state.context.runner.registry().get(&name).await.map_err(ApiError::internal)?;
  if known.is_none() {
    return Err(ApiError::new(StatusCode::NOT_FOUND, format!("unknown task '{name}'")));
  }
  let Some(channel) = state.channel.as_ref() else {
    return Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "run queue is not configured"));
  };

  let request = RunRequest {
    task: name.clone(),
    params: body.params,
    trigger: RunTrigger::Manual,
    priority: body.priority.unwrap_or(DEFAULT_PRIORITY),
  };
  if let Err(e) = publish_run_request(channel, &request).await {
    error!(task = %name, "Failed to publish run request: {:?}", e);
    return Err(ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "could not publish run request"));
  }

  info!(task = %name, "Run request queued");
  let response = EnqueueResponse { task: name, status: "queued".into() };
  Ok(warp::reply::with_status(warp::reply::json(&response), StatusCode::ACCEPTED))
}

async fn handle_logs(name: String, query: LogsQuery, state: AppState) -> Result<impl Reply, Rejection> {
  check_name(&name)?;
  let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
  match state.context.runner.logs(&name, limit).await {
    Ok(runs) => Ok(warp::reply::json(&runs)),
    Err(TaskError::NotFound(_)) => Err(ApiError::new(StatusCode::NOT_FOUND, format!("unknown task '{name}'"))),
    Err(e) => Err(ApiError::internal(e)),
  }
}
