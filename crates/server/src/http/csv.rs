//! CSV analytics endpoints: upload, cross-file relationship analysis, and
//! free-text questions over uploaded samples. All three require the
//! `analyze` capability.

use std::time::Instant;

use axum::extract::{Multipart, State};
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState, authenticate, json_error, require_capability};
use crate::files::{ERR_UPLOAD_INVALID, UploadStore};

// Sample sizes mirror the prompt budgets: analysis only needs a shape
// sketch, free-text questions get a little more data to reason over.
const ANALYZE_SAMPLE_ROWS: usize = 3;
const QUERY_SAMPLE_ROWS: usize = 5;

fn default_language() -> String {
    "English".to_string()
}

#[derive(Debug, Serialize)]
pub(super) struct UploadResponse {
    message: String,
    files: Vec<String>,
}

pub(super) async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let user = authenticate(&state, &headers)?;
    require_capability(&user, askdb_policy::capability::ANALYZE)?;

    let mut saved = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "invalid multipart body",
        )
    })? {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };

        let bytes = field.bytes().await.map_err(|_| {
            json_error(
                StatusCode::BAD_REQUEST,
                "ERR_INVALID_PARAMS",
                format!("failed to read uploaded file {}", filename),
            )
        })?;

        match save_blocking(&state.uploads, filename.clone(), bytes.to_vec()).await {
            Ok(name) => saved.push(name),
            Err(err) if err.code == ERR_UPLOAD_INVALID => {
                tracing::warn!(file = %filename, "skipping non-CSV upload");
            }
            Err(err) => {
                return Err(json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    err.code,
                    err.message,
                ));
            }
        }
    }

    if saved.is_empty() {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "No valid CSV files uploaded.",
        ));
    }

    tracing::info!(username = %user.username, count = saved.len(), "CSV files uploaded");

    Ok(Json(UploadResponse {
        message: format!("{} file(s) uploaded successfully", saved.len()),
        files: saved,
    }))
}

async fn save_blocking(
    store: &UploadStore,
    filename: String,
    bytes: Vec<u8>,
) -> Result<String, crate::files::FileError> {
    let store = store.clone();
    tokio::task::spawn_blocking(move || store.save_csv(&filename, &bytes))
        .await
        .map_err(|_| crate::files::FileError {
            code: "ERR_INTERNAL",
            message: "upload task failed".to_string(),
        })?
}

#[derive(Debug, Deserialize)]
pub(super) struct AnalyzeRequest {
    #[serde(default = "default_language")]
    language: String,
}

#[derive(Debug, Serialize)]
pub(super) struct AnalyzeResponse {
    files: Vec<String>,
    analysis: String,
}

pub(super) async fn analyze(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let user = authenticate(&state, &headers)?;
    require_capability(&user, askdb_policy::capability::ANALYZE)?;

    // The body is optional; an absent or empty body means default language.
    let language = req
        .map(|Json(r)| r.language)
        .unwrap_or_else(|_| default_language());

    let summaries = summaries_blocking(&state.uploads, ANALYZE_SAMPLE_ROWS).await?;
    if summaries.is_empty() {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "No CSV files uploaded yet.",
        ));
    }

    let files: Vec<String> = summaries.keys().cloned().collect();
    let summaries_json = serde_json::to_value(&summaries).map_err(|_| {
        json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_INTERNAL",
            "failed to encode CSV summaries",
        )
    })?;

    let started = Instant::now();
    let analysis = state
        .genai
        .analyze_csv(&summaries_json, &language)
        .await
        .map_err(|err| {
            json_error(
                StatusCode::BAD_GATEWAY,
                err.code(),
                format!("CSV analysis error: {}", err),
            )
        })?;
    crate::metrics::observe_generation("csv_analysis", started.elapsed());

    Ok(Json(AnalyzeResponse { files, analysis }))
}

#[derive(Debug, Deserialize)]
pub(super) struct CsvQueryRequest {
    query: String,
    #[serde(default = "default_language")]
    language: String,
}

#[derive(Debug, Serialize)]
pub(super) struct CsvQueryResponse {
    answer: String,
}

pub(super) async fn query_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<CsvQueryRequest>, JsonRejection>,
) -> Result<Json<CsvQueryResponse>, ApiError> {
    let user = authenticate(&state, &headers)?;
    require_capability(&user, askdb_policy::capability::ANALYZE)?;

    let Json(req) = req.map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "invalid JSON body",
        )
    })?;

    let question = req.query.trim().to_string();
    if question.is_empty() {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "Query is required",
        ));
    }

    let summaries = summaries_blocking(&state.uploads, QUERY_SAMPLE_ROWS).await?;
    if summaries.is_empty() {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "No CSV files uploaded yet.",
        ));
    }

    let data = serde_json::to_value(&summaries).map_err(|_| {
        json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_INTERNAL",
            "failed to encode CSV summaries",
        )
    })?;

    let started = Instant::now();
    let answer = state
        .genai
        .query_csv(&question, &data, &req.language)
        .await
        .map_err(|err| {
            json_error(
                StatusCode::BAD_GATEWAY,
                err.code(),
                format!("CSV query error: {}", err),
            )
        })?;
    crate::metrics::observe_generation("csv_query", started.elapsed());

    Ok(Json(CsvQueryResponse { answer }))
}

async fn summaries_blocking(
    store: &UploadStore,
    sample_rows: usize,
) -> Result<std::collections::BTreeMap<String, crate::files::CsvSummary>, ApiError> {
    let store = store.clone();
    tokio::task::spawn_blocking(move || store.summaries(sample_rows))
        .await
        .map_err(|_| {
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "ERR_INTERNAL",
                "CSV summary task failed",
            )
        })
}
