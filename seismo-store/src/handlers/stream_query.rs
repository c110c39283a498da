//! `GET /stream-query` (spec.md §6): parses query parameters, resolves
//! packets from one channel or every channel of a station, and renders the
//! requested export format.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use seismo_common::{Packet, Timestamp, timestamp_from_seconds};
use serde::Deserialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::metrics;
use crate::reader::QueryOptions;
use crate::registry::StreamIdentity;
use crate::server::AppState;

use super::error::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString)]
enum ExportFormat {
    #[strum(serialize = "miniseed2")]
    MiniSeed2,
    #[strum(serialize = "miniseed3")]
    MiniSeed3,
    #[strum(serialize = "json")]
    Json,
}

impl ExportFormat {
    fn parse(raw: &str) -> Option<Self> {
        raw.parse().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString)]
enum NoDataStatus {
    #[strum(serialize = "204")]
    NoContent,
    #[strum(serialize = "404")]
    NotFound,
}

impl NoDataStatus {
    fn parse(raw: &str) -> Option<Self> {
        raw.parse().ok()
    }

    fn status_code(self) -> StatusCode {
        match self {
            NoDataStatus::NoContent => StatusCode::NO_CONTENT,
            NoDataStatus::NotFound => StatusCode::NOT_FOUND,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RawParams {
    network: Option<String>,
    station: Option<String>,
    channel: Option<String>,
    location: Option<String>,
    starttime: Option<String>,
    endtime: Option<String>,
    format: Option<String>,
    nodata: Option<String>,
}

/// Accepts either a decimal epoch-seconds number or an ISO-8601 timestamp
/// (`YYYY-MM-DDTHH:MM:SS[.ssssss][Z]`), per spec.md §6.
fn parse_time(raw: &str) -> Result<Timestamp, ServiceError> {
    if let Ok(seconds) = raw.parse::<f64>() {
        return Ok(timestamp_from_seconds(seconds));
    }
    let parsed = OffsetDateTime::parse(raw, &Rfc3339)
        .map_err(|_| ServiceError::BadRequest(format!("invalid time value `{raw}`")))?;
    let seconds = parsed.unix_timestamp() as f64 + parsed.nanosecond() as f64 / 1_000_000_000.0;
    Ok(timestamp_from_seconds(seconds))
}

pub async fn handle(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RawParams>,
) -> Result<Response, ServiceError> {
    let started = Instant::now();

    let network = params
        .network
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ServiceError::BadRequest("`network` is required".to_string()))?;
    let station = params
        .station
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ServiceError::BadRequest("`station` is required".to_string()))?;
    let channel = params.channel.filter(|s| !s.trim().is_empty());
    let location = params.location.filter(|s| !s.trim().is_empty());

    let starttime = params
        .starttime
        .ok_or_else(|| ServiceError::BadRequest("`starttime` is required".to_string()))?;
    let endtime = params
        .endtime
        .ok_or_else(|| ServiceError::BadRequest("`endtime` is required".to_string()))?;
    let t0 = parse_time(&starttime)?;
    let t1 = parse_time(&endtime)?;
    if t0 >= t1 {
        return Err(ServiceError::BadRequest(
            "`starttime` must be before `endtime`".to_string(),
        ));
    }

    let format_raw = params
        .format
        .ok_or_else(|| ServiceError::BadRequest("`format` is required".to_string()))?;
    let format = ExportFormat::parse(&format_raw)
        .ok_or_else(|| ServiceError::BadRequest(format!("unsupported format `{format_raw}`")))?;

    let nodata = match params.nodata {
        Some(raw) => NoDataStatus::parse(&raw)
            .ok_or_else(|| ServiceError::BadRequest(format!("invalid `nodata` value `{raw}`")))?,
        None => NoDataStatus::NotFound,
    };

    let packets = {
        let state = state.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Packet>, ServiceError> {
            let mut conn = state.pool.get()?;
            match channel {
                Some(channel) => {
                    let identity =
                        StreamIdentity::new(&network, &station, &channel, location.as_deref());
                    Ok(state.reader.query(
                        &identity,
                        t0,
                        t1,
                        &state.registry,
                        &mut conn,
                        QueryOptions::default(),
                    )?)
                }
                None => {
                    let grouped = state.reader.query_station(
                        &network,
                        &station,
                        t0,
                        t1,
                        &state.registry,
                        &mut conn,
                        QueryOptions::default(),
                    )?;
                    Ok(grouped.into_values().flatten().collect())
                }
            }
        })
        .await??
    };

    metrics::observe_query_latency(started.elapsed());

    if packets.is_empty() {
        return Ok(nodata.status_code().into_response());
    }

    render(format, &packets, state.record_size, state.trace_merge_tolerance)
}

fn render(
    format: ExportFormat,
    packets: &[Packet],
    record_size: usize,
    trace_merge_tolerance: std::time::Duration,
) -> Result<Response, ServiceError> {
    match format {
        ExportFormat::MiniSeed2 | ExportFormat::MiniSeed3 => {
            let body = seismo_formats::write_records(packets, record_size, trace_merge_tolerance)?;
            let mut response = body.into_response();
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/vnd.fdsn.mseed"),
            );
            Ok(response)
        }
        ExportFormat::Json => {
            let document = seismo_formats::to_json_document(packets);
            Ok(axum::Json(document).into_response())
        }
    }
}
