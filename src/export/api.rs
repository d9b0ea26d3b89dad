//! Read-only JSON view of the published snapshot for the rendering layer.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::snapshot::{day_range, Snapshot, SnapshotSlot};
use crate::task::TaskRecord;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug, PartialEq)]
pub enum RangeError {
    #[error("invalid {param} date {value:?}, expected YYYY-MM-DD")]
    InvalidDate { param: &'static str, value: String },

    #[error("from {from} is after to {to}")]
    Reversed { from: NaiveDate, to: NaiveDate },
}

/// Query parameters of `GET /tasks`. Both bounds are whole days, inclusive.
#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TasksResponse<'a> {
    pub refreshed_at: Option<NaiveDateTime>,
    pub from: Option<NaiveDateTime>,
    pub to: Option<NaiveDateTime>,
    pub count: usize,
    pub records: Vec<&'a TaskRecord>,
}

#[derive(Debug, Serialize)]
struct BoundsResponse {
    min: Option<NaiveDate>,
    max: Option<NaiveDate>,
}

/// Routes serving the snapshot held in `slot`.
pub fn router(slot: Arc<SnapshotSlot>) -> Router {
    Router::new()
        .route("/tasks", get(tasks_handler))
        .route("/tasks/bounds", get(bounds_handler))
        .with_state(slot)
}

/// Resolve `query` against `snapshot`.
///
/// A missing bound falls back to the calendar day of the most recent record:
/// `from` to its midnight, `to` to its last second.
pub fn select_range<'a>(
    snapshot: &'a Snapshot,
    query: &RangeQuery,
) -> Result<TasksResponse<'a>, RangeError> {
    let from = parse_day("from", query.from.as_deref())?;
    let to = parse_day("to", query.to.as_deref())?;
    let latest = snapshot.default_day_range();

    let from = from.map(|d| day_range(d).0).or(latest.map(|r| r.0));
    let to = to.map(|d| day_range(d).1).or(latest.map(|r| r.1));
    let range = from.zip(to);

    if let Some((from, to)) = range {
        if from > to {
            return Err(RangeError::Reversed {
                from: from.date(),
                to: to.date(),
            });
        }
    }

    let records: Vec<_> = match range {
        Some((from, to)) => snapshot.in_range(from, to).collect(),
        None => Vec::new(),
    };

    Ok(TasksResponse {
        refreshed_at: snapshot.refreshed_at(),
        from: range.map(|r| r.0),
        to: range.map(|r| r.1),
        count: records.len(),
        records,
    })
}

fn parse_day(param: &'static str, raw: Option<&str>) -> Result<Option<NaiveDate>, RangeError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(value) => NaiveDate::parse_from_str(value, DATE_FORMAT)
            .map(Some)
            .map_err(|_| RangeError::InvalidDate {
                param,
                value: value.to_string(),
            }),
    }
}

/// GET /tasks - records in a date range.
async fn tasks_handler(
    State(slot): State<Arc<SnapshotSlot>>,
    Query(query): Query<RangeQuery>,
) -> Response {
    let snapshot = slot.load();
    match select_range(&snapshot, &query) {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

/// GET /tasks/bounds - earliest and latest task dates.
async fn bounds_handler(State(slot): State<Arc<SnapshotSlot>>) -> Json<BoundsResponse> {
    let bounds = slot.load().date_bounds();
    Json(BoundsResponse {
        min: bounds.map(|b| b.0),
        max: bounds.map(|b| b.1),
    })
}
