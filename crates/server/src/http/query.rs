//! The natural-language query pipeline: gate pre-screen, SQL synthesis,
//! execution, and explanation.
//!
//! The pipeline is written against [`QueryBackend`] so the ordering rules
//! (token check before any schema fetch, gate denial before any synthesis
//! call) are testable without a database or generation endpoint.

use std::time::Instant;

use askdb_auth::{TokenSigner, UserDirectory};
use askdb_policy::StatementClass;
use askdb_synth::SynthError;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;
use ulid::Ulid;

use super::{ApiError, AppState, json_error};
use crate::db::{self, DbError, ExecutionOutcome};

const FALLBACK_EXPLANATION: &str =
    "Query executed successfully, but no explanation is available.";

fn default_language() -> String {
    "English".to_string()
}

#[derive(Debug, Deserialize)]
pub(super) struct QueryRequest {
    query: String,
    #[serde(default = "default_language")]
    language: String,
}

#[derive(Debug, Serialize)]
pub(super) struct QueryResponse {
    sql: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    results: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    explanation: String,
}

/// The pipeline's collaborators: schema introspection, SQL synthesis,
/// statement execution, and result explanation.
trait QueryBackend {
    async fn schema(&self) -> String;
    async fn synthesize(
        &self,
        question: &str,
        schema: &str,
        allow_destructive: bool,
    ) -> Result<String, SynthError>;
    async fn execute(&self, sql: &str, class: StatementClass)
    -> Result<ExecutionOutcome, DbError>;
    async fn explain(&self, sql: &str, rows: &[Value], language: &str)
    -> Result<String, SynthError>;
}

struct LiveBackend<'a> {
    state: &'a AppState,
}

impl QueryBackend for LiveBackend<'_> {
    async fn schema(&self) -> String {
        db::introspect_schema(&self.state.pool).await
    }

    async fn synthesize(
        &self,
        question: &str,
        schema: &str,
        allow_destructive: bool,
    ) -> Result<String, SynthError> {
        let started = Instant::now();
        let sql = self
            .state
            .genai
            .synthesize(question, schema, allow_destructive)
            .await?;
        crate::metrics::observe_generation("sql", started.elapsed());
        Ok(sql)
    }

    async fn execute(
        &self,
        sql: &str,
        class: StatementClass,
    ) -> Result<ExecutionOutcome, DbError> {
        db::execute_statement(&self.state.pool, sql, class).await
    }

    async fn explain(
        &self,
        sql: &str,
        rows: &[Value],
        language: &str,
    ) -> Result<String, SynthError> {
        let started = Instant::now();
        let text = self.state.genai.explain(sql, rows, language).await;
        crate::metrics::observe_generation("explanation", started.elapsed());
        text
    }
}

pub(super) async fn run_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, ApiError> {
    let parsed = req.map(|Json(r)| r).map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "invalid JSON body",
        )
    });

    let request_id = Ulid::new().to_string();
    let span = tracing::info_span!(
        "query.run",
        request_id = %request_id,
        username = tracing::field::Empty,
        role = tracing::field::Empty,
        statement_class = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let backend = LiveBackend { state: &state };
    let result = run_pipeline(&state.signer, &state.users, &headers, parsed, &backend)
        .instrument(span.clone())
        .await;

    let latency_ms = started.elapsed().as_millis() as u64;
    span.record("latency_ms", latency_ms);
    span.record(
        "outcome",
        match &result {
            Ok(_) => "ok",
            Err(_) => "error",
        },
    );

    result.map(Json)
}

/// The request sequence. Order is load-bearing: the session check comes
/// before body validation and any backend call, and the gate pre-screen
/// comes before synthesis is spent on the question.
async fn run_pipeline<B: QueryBackend>(
    signer: &TokenSigner,
    users: &UserDirectory,
    headers: &HeaderMap,
    parsed: Result<QueryRequest, ApiError>,
    backend: &B,
) -> Result<QueryResponse, ApiError> {
    let user = signer
        .verify_headers(headers, users)
        .map_err(|err| json_error(StatusCode::UNAUTHORIZED, err.code, err.message))?;

    let span = tracing::Span::current();
    span.record("username", user.username.as_str());
    span.record("role", user.role.as_str());

    let req = parsed?;
    let question = req.query.trim();
    if question.is_empty() {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_PARAMS",
            "Query is required",
        ));
    }

    // Cheap intent check before any generation call is spent.
    askdb_policy::prescreen(question, &user.permissions, user.role.as_str()).map_err(
        |denied| {
            crate::metrics::inc_gate_denial();
            crate::metrics::observe_query("denied");
            json_error(StatusCode::FORBIDDEN, "PERMISSION_DENIED", denied.message())
        },
    )?;

    let schema = backend.schema().await;
    let allow_destructive = user.allows_destructive();

    let sql = backend
        .synthesize(question, &schema, allow_destructive)
        .await
        .map_err(|err| match err {
            SynthError::Rejected(violation) => {
                crate::metrics::observe_query("rejected");
                json_error(StatusCode::BAD_REQUEST, violation.code, violation.message)
            }
            other => {
                crate::metrics::observe_query("generation_error");
                json_error(
                    StatusCode::BAD_GATEWAY,
                    askdb_synth::ERR_GENERATION_FAILURE,
                    format!("SQL generation error: {}", other),
                )
            }
        })?;

    let class = askdb_policy::classify(&sql);
    span.record("statement_class", class.as_str());

    let outcome = backend.execute(&sql, class).await.map_err(|err| {
        crate::metrics::observe_query("execution_error");
        json_error(StatusCode::INTERNAL_SERVER_ERROR, err.code, err.message)
    })?;

    let (results, message) = match outcome {
        ExecutionOutcome::Rows(rows) => (Some(rows), None),
        ExecutionOutcome::Affected(count) => (None, Some(format!("{} row(s) affected", count))),
    };

    // Explanation is best-effort; the executed result is already final.
    let sample = results.as_deref().unwrap_or(&[]);
    let explanation = match backend.explain(&sql, sample, &req.language).await {
        Ok(text) if !text.is_empty() => text,
        Ok(_) => FALLBACK_EXPLANATION.to_string(),
        Err(err) => {
            tracing::warn!(error = %err, "explanation failed");
            FALLBACK_EXPLANATION.to_string()
        }
    };

    crate::metrics::observe_query("success");

    Ok(QueryResponse {
        sql,
        results,
        message,
        explanation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use askdb_auth::Role;
    use axum::http::header;
    use jsonwebtoken::{EncodingKey, Header, encode};

    const SECRET: &str = "test-secret";
    const TEST_COST: u32 = 4;

    /// Counts backend calls so tests can assert which pipeline stages were
    /// never reached.
    #[derive(Default)]
    struct RecordingBackend {
        sql: String,
        affected: Option<u64>,
        schema_calls: AtomicUsize,
        synthesize_calls: AtomicUsize,
        execute_calls: AtomicUsize,
    }

    impl QueryBackend for RecordingBackend {
        async fn schema(&self) -> String {
            self.schema_calls.fetch_add(1, Ordering::SeqCst);
            "Database: library_db\nTables:\n1. books(book_id, title)".to_string()
        }

        async fn synthesize(
            &self,
            _question: &str,
            _schema: &str,
            _allow_destructive: bool,
        ) -> Result<String, SynthError> {
            self.synthesize_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.sql.clone())
        }

        async fn execute(
            &self,
            _sql: &str,
            _class: StatementClass,
        ) -> Result<ExecutionOutcome, DbError> {
            self.execute_calls.fetch_add(1, Ordering::SeqCst);
            match self.affected {
                Some(count) => Ok(ExecutionOutcome::Affected(count)),
                None => Ok(ExecutionOutcome::Rows(vec![serde_json::json!({
                    "book_id": 1, "title": "Dune"
                })])),
            }
        }

        async fn explain(
            &self,
            _sql: &str,
            _rows: &[Value],
            language: &str,
        ) -> Result<String, SynthError> {
            Ok(format!("A short summary in {language}."))
        }
    }

    async fn seeded() -> (TokenSigner, UserDirectory) {
        let users = UserDirectory::seeded(
            &[
                ("admin".to_string(), "admin123".to_string(), Role::Admin),
                ("editor".to_string(), "editor123".to_string(), Role::Editor),
                ("viewer".to_string(), "viewer123".to_string(), Role::Viewer),
            ],
            TEST_COST,
        )
        .await
        .expect("seeding should succeed");
        let signer = TokenSigner::new(SECRET, Duration::from_secs(60 * 60))
            .expect("signer init should succeed");
        (signer, users)
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {token}").parse().expect("header must parse"),
        );
        headers
    }

    fn request(query: &str) -> Result<QueryRequest, ApiError> {
        Ok(QueryRequest {
            query: query.to_string(),
            language: default_language(),
        })
    }

    #[tokio::test]
    async fn gate_denial_happens_before_any_backend_call() {
        let (signer, users) = seeded().await;
        let viewer = users.get("viewer").expect("viewer must be seeded");
        let token = signer.issue(viewer).expect("issue should succeed");
        let backend = RecordingBackend::default();

        let (status, Json(body)) = run_pipeline(
            &signer,
            &users,
            &bearer(&token),
            request("delete all loans"),
            &backend,
        )
        .await
        .unwrap_err();

        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body.error, "PERMISSION_DENIED");
        assert!(body.message.contains("viewer"));
        assert_eq!(backend.schema_calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.synthesize_calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.execute_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_token_aborts_before_schema_fetch() {
        let (signer, users) = seeded().await;

        let claims = serde_json::json!({
            "sub": "viewer",
            "role": "viewer",
            "iat": 1_000_000_000u64,
            "exp": 1_000_000_060u64,
        });
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .expect("token encode should succeed");
        let backend = RecordingBackend::default();

        let (status, Json(body)) = run_pipeline(
            &signer,
            &users,
            &bearer(&token),
            request("show all books"),
            &backend,
        )
        .await
        .unwrap_err();

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.error, askdb_auth::ERR_TOKEN_EXPIRED);
        assert_eq!(backend.schema_calls.load(Ordering::SeqCst), 0);
        assert_eq!(backend.synthesize_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_token_aborts_before_schema_fetch() {
        let (signer, users) = seeded().await;
        let backend = RecordingBackend::default();

        let (status, Json(body)) = run_pipeline(
            &signer,
            &users,
            &HeaderMap::new(),
            request("show all books"),
            &backend,
        )
        .await
        .unwrap_err();

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.error, askdb_auth::ERR_TOKEN_MISSING);
        assert_eq!(backend.schema_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn select_flows_through_to_rows_and_explanation() {
        let (signer, users) = seeded().await;
        let viewer = users.get("viewer").expect("viewer must be seeded");
        let token = signer.issue(viewer).expect("issue should succeed");
        let backend = RecordingBackend {
            sql: "SELECT * FROM books".to_string(),
            ..RecordingBackend::default()
        };

        let response = run_pipeline(
            &signer,
            &users,
            &bearer(&token),
            request("show all books"),
            &backend,
        )
        .await
        .expect("benign select should succeed");

        assert_eq!(response.sql, "SELECT * FROM books");
        assert_eq!(response.results.as_ref().map(Vec::len), Some(1));
        assert_eq!(response.message, None);
        assert_eq!(response.explanation, "A short summary in English.");
        assert_eq!(backend.schema_calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.synthesize_calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.execute_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn editor_update_reports_rows_affected() {
        let (signer, users) = seeded().await;
        let editor = users.get("editor").expect("editor must be seeded");
        let token = signer.issue(editor).expect("issue should succeed");
        let backend = RecordingBackend {
            sql: "UPDATE members SET name = 'x' WHERE member_id = 2".to_string(),
            affected: Some(2),
            ..RecordingBackend::default()
        };

        let response = run_pipeline(
            &signer,
            &users,
            &bearer(&token),
            request("update member name"),
            &backend,
        )
        .await
        .expect("editor update should succeed");

        assert_eq!(response.results, None);
        assert_eq!(response.message.as_deref(), Some("2 row(s) affected"));
        assert_eq!(backend.execute_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_question_is_rejected_after_authentication() {
        let (signer, users) = seeded().await;
        let viewer = users.get("viewer").expect("viewer must be seeded");
        let token = signer.issue(viewer).expect("issue should succeed");
        let backend = RecordingBackend::default();

        let (status, Json(body)) =
            run_pipeline(&signer, &users, &bearer(&token), request("   "), &backend)
                .await
                .unwrap_err();

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error, "ERR_INVALID_PARAMS");
        assert_eq!(backend.schema_calls.load(Ordering::SeqCst), 0);
    }
}
