use tracing::info;
use warp::{Filter, Rejection, Reply};

use super::{ApiError, AppState, with_state};
use crate::error::ScanError;
use crate::models::ScanActor;
use crate::scan::ScanRequest;

pub fn scan_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path("scan")
    .and(warp::path::end())
    .and(warp::post())
    .and(warp::body::json())
    .and(with_state(state))
    .and_then(handle_scan)
}

pub fn coverage_route(state: AppState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
  warp::path("coverage")
    .and(warp::path::end())
    .and(warp::get())
    .and(with_state(state))
    .and_then(handle_coverage)
}

async fn handle_scan(request: ScanRequest, state: AppState) -> Result<impl Reply, Rejection> {
  match state.context.scans.scan(&request, ScanActor::User).await {
    Ok(response) => {
      info!(bbox = %request.bbox, cached = response.cached, partial = response.partial_cache, "Scan served");
      Ok(warp::reply::json(&response))
    }
    Err(e @ ScanError::InvalidRequest(_)) => Err(ApiError::bad_request(e.to_string())),
    Err(e) => Err(ApiError::internal(e)),
  }
}

async fn handle_coverage(state: AppState) -> Result<impl Reply, Rejection> {
  let report = state.context.coverage.report().await.map_err(ApiError::internal)?;
  Ok(warp::reply::json(&report))
}
