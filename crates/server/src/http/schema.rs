//! Admin-only DDL endpoints. Identifiers are validated and backtick-quoted
//! here; these statements never pass through text generation.

use axum::extract::{Path, State};
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState, authenticate, json_error, require_admin, require_capability};
use crate::db;

#[derive(Debug, Deserialize)]
pub(super) struct ColumnSpec {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
    #[serde(default)]
    primary_key: bool,
    #[serde(default)]
    not_null: bool,
    #[serde(default)]
    unique: bool,
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateTableRequest {
    table_name: String,
    columns: Vec<ColumnSpec>,
}

#[derive(Debug, Serialize)]
pub(super) struct TablesResponse {
    tables: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(super) struct MessageResponse {
    message: String,
}

pub(super) async fn list_tables(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<TablesResponse>, ApiError> {
    let user = authenticate(&state, &headers)?;
    require_capability(&user, askdb_policy::capability::READ)?;

    let tables = db::list_tables(&state.pool)
        .await
        .map_err(|err| json_error(StatusCode::INTERNAL_SERVER_ERROR, err.code, err.message))?;

    Ok(Json(TablesResponse { tables }))
}

pub(super) async fn create_table(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<CreateTableRequest>, JsonRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    let user = authenticate(&state, &headers)?;
    require_admin(&user)?;

    let Json(req) = req.map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "invalid JSON body",
        )
    })?;

    let sql = build_create_table_sql(&req)
        .map_err(|reason| json_error(StatusCode::BAD_REQUEST, "ERR_INVALID_PARAMS", reason))?;

    db::execute_statement(&state.pool, &sql, askdb_policy::classify(&sql))
        .await
        .map_err(|err| json_error(StatusCode::INTERNAL_SERVER_ERROR, err.code, err.message))?;

    tracing::info!(table = %req.table_name, username = %user.username, "table created");

    Ok(Json(MessageResponse {
        message: format!("Table {} created successfully", req.table_name),
    }))
}

pub(super) async fn drop_table(
    State(state): State<AppState>,
    Path(table_name): Path<String>,
    headers: HeaderMap,
) -> Result<Json<MessageResponse>, ApiError> {
    let user = authenticate(&state, &headers)?;
    require_admin(&user)?;

    if !is_valid_identifier(&table_name) {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            format!("invalid table name: {}", table_name),
        ));
    }

    let sql = format!("DROP TABLE IF EXISTS `{}`", table_name);
    db::execute_statement(&state.pool, &sql, askdb_policy::classify(&sql))
        .await
        .map_err(|err| json_error(StatusCode::INTERNAL_SERVER_ERROR, err.code, err.message))?;

    tracing::info!(table = %table_name, username = %user.username, "table dropped");

    Ok(Json(MessageResponse {
        message: format!("Table {} deleted successfully", table_name),
    }))
}

fn build_create_table_sql(req: &CreateTableRequest) -> Result<String, String> {
    if !is_valid_identifier(&req.table_name) {
        return Err(format!("invalid table name: {}", req.table_name));
    }
    if req.columns.is_empty() {
        return Err("at least one column is required".to_string());
    }

    let mut definitions = Vec::with_capacity(req.columns.len());
    for column in &req.columns {
        if !is_valid_identifier(&column.name) {
            return Err(format!("invalid column name: {}", column.name));
        }
        if !is_valid_column_type(&column.column_type) {
            return Err(format!("invalid column type: {}", column.column_type));
        }

        let mut definition = format!("`{}` {}", column.name, column.column_type);
        if column.primary_key {
            definition.push_str(" PRIMARY KEY");
        }
        if column.not_null {
            definition.push_str(" NOT NULL");
        }
        if column.unique {
            definition.push_str(" UNIQUE");
        }
        definitions.push(definition);
    }

    Ok(format!(
        "CREATE TABLE `{}` ({})",
        req.table_name,
        definitions.join(", ")
    ))
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if name.len() > 64 {
        return false;
    }
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// Type expressions like VARCHAR(255) or DECIMAL(10,2); anything that could
// escape the column definition is rejected.
fn is_valid_column_type(column_type: &str) -> bool {
    let column_type = column_type.trim();
    !column_type.is_empty()
        && column_type.len() <= 64
        && column_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '(' | ')' | ',' | '_' | ' '))
}
