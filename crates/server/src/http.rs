//! HTTP surface: router construction, authentication guards, and the login
//! endpoint. Pipeline endpoints live in the submodules.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use askdb_auth::{Role, TokenSigner, User, UserDirectory};
use askdb_synth::{GenerationClient, GenerationConfig};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};

use crate::config::{ServerConfig, StartupError};
use crate::files::UploadStore;
use crate::rate_limit::LoginLimiter;

mod csv;
mod query;
mod schema;

#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    users: Arc<UserDirectory>,
    signer: TokenSigner,
    genai: GenerationClient,
    pool: MySqlPool,
    uploads: UploadStore,
    login_limiter: LoginLimiter,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

fn json_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: code.to_string(),
            message: message.into(),
        }),
    )
}

pub async fn router(config: ServerConfig) -> Result<Router, StartupError> {
    let users = UserDirectory::seeded(&config.seed_accounts(), config.bcrypt_cost)
        .await
        .map_err(|err| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("failed to seed accounts: {}", err.message),
        })?;

    let signer = TokenSigner::new(&config.jwt_secret, Duration::from_secs(config.token_ttl_secs))
        .map_err(|err| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: err.message,
        })?;

    let genai = GenerationClient::new(GenerationConfig {
        base_url: config.genai_url.clone(),
        api_key: config.genai_api_key.clone(),
        model: config.genai_model.clone(),
        timeout: Duration::from_millis(config.genai_timeout_ms),
    })
    .map_err(|_| StartupError {
        code: "ERR_INVALID_CONFIG",
        message: "failed to initialize generation client".to_string(),
    })?;

    let pool = MySqlPoolOptions::new()
        .max_connections(config.db_max_connections)
        .acquire_timeout(Duration::from_millis(config.db_acquire_timeout_ms))
        .connect(&config.db_url)
        .await
        .map_err(|_| StartupError {
            code: "ERR_DB_UNAVAILABLE",
            message: "failed to initialize database pool".to_string(),
        })?;

    let uploads = UploadStore::new(&config.upload_dir).map_err(|err| StartupError {
        code: "ERR_INVALID_CONFIG",
        message: err.message,
    })?;

    let login_limiter = LoginLimiter::new(
        Duration::from_secs(config.login_rate_window_secs.max(1)),
        config.login_rate_limit,
    );

    let upload_max_bytes = config.upload_max_bytes;
    let state = AppState {
        config,
        users: Arc::new(users),
        signer,
        genai,
        pool,
        uploads,
        login_limiter,
    };

    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/login", post(login))
        .route("/api/query", post(query::run_query))
        .route(
            "/api/schema/tables",
            get(schema::list_tables).post(schema::create_table),
        )
        .route("/api/schema/tables/{table_name}", delete(schema::drop_table))
        .route("/api/csv/upload", post(csv::upload))
        .route("/api/csv/analyze", post(csv::analyze))
        .route("/api/csv/query", post(csv::query_files))
        .layer(DefaultBodyLimit::max(upload_max_bytes))
        .with_state(state))
}

/// Resolve the bearer token to a live account. All token failures map to
/// 401 with the specific token error code.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<User, ApiError> {
    state
        .signer
        .verify_headers(headers, &state.users)
        .map(User::clone)
        .map_err(|err| json_error(StatusCode::UNAUTHORIZED, err.code, err.message))
}

fn require_admin(user: &User) -> Result<(), ApiError> {
    if user.role == Role::Admin {
        return Ok(());
    }
    Err(json_error(
        StatusCode::FORBIDDEN,
        "PERMISSION_DENIED",
        format!(
            "This operation requires the 'admin' role. Your role is '{}'.",
            user.role.as_str()
        ),
    ))
}

fn require_capability(user: &User, cap: &str) -> Result<(), ApiError> {
    if user.has_capability(cap) {
        return Ok(());
    }
    Err(json_error(
        StatusCode::FORBIDDEN,
        "PERMISSION_DENIED",
        format!(
            "This operation requires the '{}' permission. Your role is '{}'.",
            cap,
            user.role.as_str()
        ),
    ))
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    checks.insert("database", crate::db::ping(&state.pool).await);
    checks.insert("generation", state.genai.ready().await.is_ok());

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: String,
    username: String,
    role: Role,
    permissions: Vec<String>,
}

async fn login(
    State(state): State<AppState>,
    req: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Json(req) = req.map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "invalid JSON body",
        )
    })?;

    let username = req.username.trim();
    if username.is_empty() || req.password.is_empty() {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "Username and password are required",
        ));
    }

    if !state.login_limiter.allow(username) {
        crate::metrics::observe_login("rate_limited");
        tracing::warn!(username = %username, "login rate limit exceeded");
        return Err(json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "ERR_RATE_LIMITED",
            "too many login attempts; try again later",
        ));
    }

    let user = state.users.verify(username, &req.password).await.map_err(|err| {
        if err.code == askdb_auth::ERR_INVALID_CREDENTIALS {
            crate::metrics::observe_login("failure");
            tracing::warn!(username = %username, "login rejected");
            json_error(StatusCode::UNAUTHORIZED, err.code, err.message)
        } else {
            crate::metrics::observe_login("error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, err.code, err.message)
        }
    })?;

    let token = state.signer.issue(user).map_err(|err| {
        crate::metrics::observe_login("error");
        json_error(StatusCode::INTERNAL_SERVER_ERROR, err.code, err.message)
    })?;

    crate::metrics::observe_login("success");
    tracing::info!(username = %user.username, role = user.role.as_str(), "login succeeded");

    Ok(Json(LoginResponse {
        token,
        username: user.username.clone(),
        role: user.role,
        permissions: user.permissions.clone(),
    }))
}
