use crate::dispatcher::{Command, CommandDispatcher, Publisher};
use crate::errors::Error;
use crate::health::{HealthStatus, PersistenceHealth};
use crate::metrics;
use crate::model::{MetricValue, Reading};
use crate::registry::{DeviceRegistry, DeviceSummary};
use crate::store::{Committed, DatasetStore};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, warn};

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

pub type SharedDispatcher = Arc<CommandDispatcher<Arc<dyn Publisher>>>;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DatasetStore>,
    pub devices: Arc<DeviceRegistry>,
    pub commands: SharedDispatcher,
    pub health: Arc<PersistenceHealth>,
}

#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    device_id: Option<String>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: Option<usize>,
    offset: Option<usize>,
}

/// A reading aligned to every metric column in the dataset.
#[derive(Debug, Clone, Serialize)]
pub struct ReadingRow {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub firmware_version: String,
    pub metrics: BTreeMap<String, MetricValue>,
}

#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    pub data: Vec<ReadingRow>,
    pub columns: Vec<String>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Deserialize)]
pub struct UpgradeRequest {
    firmware: String,
}

#[derive(Debug, Serialize)]
pub struct CommandAccepted {
    command: &'static str,
    topic: String,
    payload: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/readings", get(get_readings))
        .route("/api/v1/devices", get(get_devices))
        .route("/api/v1/commands/deploy", post(deploy))
        .route("/api/v1/commands/retract", post(retract))
        .route("/api/v1/commands/upgrade", post(upgrade))
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn get_readings(
    State(state): State<AppState>,
    Query(params): Query<ReadingsQuery>,
) -> Result<Json<ReadingsResponse>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let offset = params.offset.unwrap_or(0);

    let Committed {
        readings: snapshot,
        schema,
    } = state.store.committed()?;

    // Walk newest appends first so equal timestamps stay newest-first after
    // the stable sort.
    let mut matching: Vec<&Reading> = snapshot
        .iter()
        .rev()
        .filter(|r| params.device_id.as_deref().map_or(true, |id| r.device_id == id))
        .filter(|r| params.start.map_or(true, |start| r.timestamp >= start))
        .filter(|r| params.end.map_or(true, |end| r.timestamp <= end))
        .collect();
    matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let total = matching.len();
    let data = matching
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|reading| ReadingRow {
            device_id: reading.device_id.clone(),
            timestamp: reading.timestamp,
            firmware_version: reading.firmware_version.clone(),
            metrics: schema
                .resolve(reading)
                .into_iter()
                .map(|(column, value)| (column.to_string(), value))
                .collect(),
        })
        .collect();

    Ok(Json(ReadingsResponse {
        data,
        columns: schema.columns().to_vec(),
        total,
        limit,
        offset,
    }))
}

async fn get_devices(State(state): State<AppState>) -> Result<Json<Vec<DeviceSummary>>, AppError> {
    let snapshot = state.store.snapshot()?;
    Ok(Json(state.devices.summarize(&snapshot)))
}

async fn deploy(State(state): State<AppState>) -> Result<Response, AppError> {
    dispatch(&state.commands, Command::Deploy).await
}

async fn retract(State(state): State<AppState>) -> Result<Response, AppError> {
    dispatch(&state.commands, Command::Retract).await
}

async fn upgrade(
    State(state): State<AppState>,
    Json(request): Json<UpgradeRequest>,
) -> Result<Response, AppError> {
    dispatch(
        &state.commands,
        Command::Upgrade {
            firmware: request.firmware,
        },
    )
    .await
}

async fn dispatch(commands: &SharedDispatcher, command: Command) -> Result<Response, AppError> {
    commands.send_command(&command).await?;

    let accepted = CommandAccepted {
        command: command.kind(),
        topic: commands.topic_for(&command).to_string(),
        payload: command.payload().to_string(),
    };
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

async fn health(State(state): State<AppState>) -> Response {
    let report = state.health.report();
    let status = match report.status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(report)).into_response()
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

struct AppError(anyhow::Error);

impl AppError {
    fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<Error>() {
            Some(Error::InvalidPath(_)) | Some(Error::Malformed(_)) => StatusCode::BAD_REQUEST,
            Some(Error::PublishTimeout { .. })
            | Some(Error::Mqtt(_))
            | Some(Error::BrokerUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("API error: {}", self.0);
        } else {
            warn!("Rejected API request: {}", self.0);
        }
        (status, self.0.to_string()).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
