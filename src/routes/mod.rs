use lapin::Channel;
use serde_json::json;
use std::convert::Infallible;
use tracing::error;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::app::AppContext;

pub mod scan;
pub mod tasks;

/// What every handler gets: the shared components and, when configured, a
/// channel for queued runs.
#[derive(Clone)]
pub struct AppState {
  pub context: AppContext,
  pub channel: Option<Channel>,
}

#[derive(Debug)]
pub struct ApiError {
  pub status: StatusCode,
  pub message: String,
}

impl warp::reject::Reject for ApiError {}

impl ApiError {
  pub fn new(status: StatusCode, message: impl Into<String>) -> Rejection {
    warp::reject::custom(ApiError { status, message: message.into() })
  }

  pub fn bad_request(message: impl Into<String>) -> Rejection {
    Self::new(StatusCode::BAD_REQUEST, message)
  }

  pub fn internal(message: impl std::fmt::Display) -> Rejection {
    error!("Request failed: {}", message);
    Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
  }
}

pub(crate) fn with_state(state: AppState) -> impl Filter<Extract = (AppState,), Error = Infallible> + Clone {
  warp::any().map(move || state.clone())
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
  let (status, message) = if let Some(e) = err.find::<ApiError>() {
    (e.status, e.message.clone())
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if err.is_not_found() {
    (StatusCode::NOT_FOUND, "not found".to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
  } else {
    error!("Unhandled rejection: {:?}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
  };
  Ok(warp::reply::with_status(warp::reply::json(&json!({ "error": message })), status))
}

pub fn routes(state: AppState) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
  scan::scan_route(state.clone())
    .or(scan::coverage_route(state.clone()))
    .or(tasks::task_routes(state))
    .recover(handle_rejection)
}
