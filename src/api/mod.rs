use actix::Addr;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::actors::{HiveRegistry, SupervisorActor};
use crate::error::{ErrorKind, HivewatchError};
use crate::messages::{GetSystemHealth, HiveStats, SystemHealth};
use crate::store::{DateRange, DetectionQuery, DetectionRecord, ResultStore};
use crate::utils::image_utils::content_type;

/// Shared state of the query API.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn ResultStore>,
    pub supervisor: Option<Addr<SupervisorActor>>,
    pub registry: Option<Arc<HiveRegistry>>,
}

impl ApiState {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self {
            store,
            supervisor: None,
            registry: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found")]
    NotFound,

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl From<HivewatchError> for ApiError {
    fn from(err: HivewatchError) -> Self {
        match err.kind() {
            ErrorKind::PermanentInput => ApiError::BadRequest(err.to_string()),
            _ => ApiError::Unavailable(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            ApiError::Unavailable(msg) => {
                error!(target: "api", error = %msg, "Store unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "results are temporarily unavailable".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Query parameters for listing detections. Bounds accept RFC 3339 or `YYYY-MM-DD`.
#[derive(Debug, Default, Deserialize)]
pub struct DetectionParams {
    pub hive_id: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DetectionDto {
    pub id: i64,
    pub hive_id: String,
    pub timestamp: DateTime<Utc>,
    pub coverage: f64,
}

impl From<DetectionRecord> for DetectionDto {
    fn from(record: DetectionRecord) -> Self {
        Self {
            id: record.id,
            hive_id: record.hive_id,
            timestamp: record.timestamp,
            coverage: record.coverage.percent(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    system: Option<SystemHealth>,
    hives: Vec<HiveStats>,
}

/// Parse a range bound. A bare date means the start or the end of that day.
pub fn parse_bound(value: &str, end_of_day: bool) -> Result<DateTime<Utc>, HivewatchError> {
    let value = value.trim();
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Ok(timestamp.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| {
        HivewatchError::PermanentInput(format!("cannot parse {:?} as a date or timestamp", value))
    })?;
    let time = if end_of_day {
        NaiveTime::from_hms_milli_opt(23, 59, 59, 999)
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)
    }
    .ok_or_else(|| HivewatchError::Other("invalid time of day".to_string()))?;
    Ok(date.and_time(time).and_utc())
}

impl DetectionParams {
    pub fn into_query(self) -> Result<DetectionQuery, HivewatchError> {
        let start = self.start.as_deref().map(|v| parse_bound(v, false)).transpose()?;
        let end = self.end.as_deref().map(|v| parse_bound(v, true)).transpose()?;
        let range = match (start, end) {
            (None, None) => None,
            _ => Some(DateRange::new(start, end)?),
        };
        Ok(DetectionQuery {
            hive_id: self.hive_id.filter(|h| !h.trim().is_empty()),
            range,
        })
    }
}

async fn list_detections(
    State(state): State<ApiState>,
    Query(params): Query<DetectionParams>,
) -> Result<Json<Vec<DetectionDto>>, ApiError> {
    let query = params.into_query()?;
    let records = state.store.list(&query).await?;
    Ok(Json(records.into_iter().map(DetectionDto::from).collect()))
}

async fn get_image(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let image = state.store.get_image(id).await?.ok_or(ApiError::NotFound)?;
    Ok(([(header::CONTENT_TYPE, content_type(&image))], image).into_response())
}

async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let system = match &state.supervisor {
        Some(supervisor) => supervisor.send(GetSystemHealth).await.ok(),
        None => None,
    };
    let hives = match &state.registry {
        Some(registry) => registry.stats().await,
        None => Vec::new(),
    };
    let status = match &system {
        Some(health) if !health.overall_healthy => "degraded",
        _ => "ok",
    };
    Json(HealthResponse {
        status,
        system,
        hives,
    })
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/detections", get(list_detections))
        .route("/api/detections/{id}/image", get(get_image))
        .route("/api/health", get(health))
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn serve(
    bind: &str,
    state: ApiState,
    shutdown: CancellationToken,
) -> Result<(), HivewatchError> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(target: "api", "Query API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Coverage, DetectionResult, SqliteResultStore};
    use axum::body::Body;
    use axum::http::Request;
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn seeded_state() -> (ApiState, i64) {
        let store = SqliteResultStore::open_in_memory(Duration::from_secs(5)).unwrap();
        let mut first_id = 0;
        for (i, (hive, minute)) in [("hive-1", 30), ("hive-1", 10), ("hive-2", 20)]
            .into_iter()
            .enumerate()
        {
            let id = store
                .upsert(
                    DetectionResult {
                        hive_id: hive.to_string(),
                        filename: format!("frame-{}.jpg", i),
                        timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 12, minute, 0).unwrap(),
                        coverage: Coverage::from_percent(i as f64 + 0.5),
                        blob_count: None,
                    },
                    Some(b"\x89PNG\r\n\x1a\n".to_vec()),
                )
                .await
                .unwrap()
                .id();
            if i == 0 {
                first_id = id;
            }
        }
        (ApiState::new(Arc::new(store)), first_id)
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_list_detections_for_hive() {
        let (state, _) = seeded_state().await;
        let (status, body) = get_json(router(state), "/api/detections?hive_id=hive-1").await;

        assert_eq!(status, StatusCode::OK);
        let detections: Vec<DetectionDto> = serde_json::from_value(body).unwrap();
        assert_eq!(detections.len(), 2);
        assert!(detections[0].timestamp < detections[1].timestamp);
        assert_eq!(detections[0].coverage, 1.5);
        assert_eq!(detections[0].hive_id, "hive-1");
    }

    #[tokio::test]
    async fn test_list_with_date_range() {
        let (state, _) = seeded_state().await;
        let (status, body) = get_json(
            router(state),
            "/api/detections?start=2024-06-01T12:15:00Z&end=2024-06-01",
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_inverted_range_is_bad_request() {
        let (state, _) = seeded_state().await;
        let (status, body) = get_json(
            router(state),
            "/api/detections?start=2024-06-02&end=2024-06-01",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (state, _) = seeded_state().await;
        let (status, _) = get_json(router(state), "/api/detections?start=yesterday").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_image_endpoint() {
        let (state, id) = seeded_state().await;
        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .uri(format!("/api/detections/{}/image", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");

        let (status, _) = get_json(router(state), "/api/detections/9999/image").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_without_supervisor() {
        let (state, _) = seeded_state().await;
        let (status, body) = get_json(router(state), "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[test]
    fn test_parse_bound_day_edges() {
        let start = parse_bound("2024-06-01", false).unwrap();
        let end = parse_bound("2024-06-01", true).unwrap();
        assert_eq!(start.to_rfc3339(), "2024-06-01T00:00:00+00:00");
        assert!(end > start);
        assert_eq!(end.date_naive(), start.date_naive());
    }
}
