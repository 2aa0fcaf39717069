//! Client for the text-generation backend: SQL synthesis, result
//! explanation, and CSV analysis prompts.
//!
//! The backend speaks a Gemini-style `generateContent` REST interface, but
//! response shapes have drifted across SDK and API versions, so
//! [`extract_text`] walks an ordered list of known shapes and falls back to
//! stringifying whatever arrived. Malformed output is caught downstream by
//! statement validation, never executed.

use std::time::Duration;

use askdb_policy::PolicyViolation;
use serde_json::Value;

/// Number of result rows included in the explanation prompt.
pub const EXPLANATION_SAMPLE_ROWS: usize = 5;

pub const ERR_GENERATION_FAILURE: &str = "ERR_GENERATION_FAILURE";

#[derive(Debug)]
pub enum SynthError {
    Timeout,
    Http(reqwest::Error),
    BadStatus(reqwest::StatusCode),
    /// The generated statement violated the caller's safety policy.
    Rejected(PolicyViolation),
}

impl SynthError {
    pub fn code(&self) -> &'static str {
        match self {
            SynthError::Rejected(violation) => violation.code,
            _ => ERR_GENERATION_FAILURE,
        }
    }
}

impl std::fmt::Display for SynthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SynthError::Timeout => write!(f, "generation request timed out"),
            SynthError::Http(err) => write!(f, "generation HTTP error: {}", err),
            SynthError::BadStatus(status) => {
                write!(f, "generation backend returned status {}", status)
            }
            SynthError::Rejected(violation) => write!(f, "{}", violation.message),
        }
    }
}

impl std::error::Error for SynthError {}

impl From<reqwest::Error> for SynthError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            SynthError::Timeout
        } else {
            SynthError::Http(value)
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct GenerationClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GenerationClient {
    pub fn new(config: GenerationConfig) -> Result<Self, SynthError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(SynthError::Http)?;

        Ok(Self {
            http,
            base_url: config.base_url,
            api_key: config.api_key,
            model: config.model,
        })
    }

    /// Convert a natural-language question into a single SQL statement,
    /// validated against the caller's destructive allowance before it is
    /// returned. Never returns an unvalidated string.
    pub async fn synthesize(
        &self,
        question: &str,
        schema: &str,
        allow_destructive: bool,
    ) -> Result<String, SynthError> {
        let prompt = sql_prompt(question, schema, allow_destructive);
        let sql = self.generate(&prompt).await?;

        askdb_policy::validate_statement(&sql, allow_destructive)
            .map_err(SynthError::Rejected)?;

        Ok(sql)
    }

    /// Short natural-language explanation of a statement and a sample of
    /// its result, in the requested language.
    pub async fn explain(
        &self,
        sql: &str,
        results: &[Value],
        language: &str,
    ) -> Result<String, SynthError> {
        let prompt = explanation_prompt(sql, results, language);
        self.generate(&prompt).await
    }

    /// Relationship summary across uploaded CSV files.
    pub async fn analyze_csv(&self, summaries: &Value, language: &str) -> Result<String, SynthError> {
        let prompt = csv_analysis_prompt(summaries, language);
        self.generate(&prompt).await
    }

    /// Free-text answer over uploaded CSV samples.
    pub async fn query_csv(
        &self,
        question: &str,
        data: &Value,
        language: &str,
    ) -> Result<String, SynthError> {
        let prompt = csv_query_prompt(question, data, language);
        self.generate(&prompt).await
    }

    /// Reachability probe for readiness checks; any HTTP response counts.
    pub async fn ready(&self) -> Result<(), SynthError> {
        self.http.get(&self.base_url).send().await?;
        Ok(())
    }

    async fn generate(&self, prompt: &str) -> Result<String, SynthError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );

        let resp = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&serde_json::json!({
                "contents": [{ "parts": [{ "text": prompt }] }]
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(SynthError::BadStatus(resp.status()));
        }

        let body = resp.json::<Value>().await?;
        Ok(extract_text(&body).trim().to_string())
    }
}

fn sql_prompt(question: &str, schema: &str, allow_destructive: bool) -> String {
    let role_instructions = if allow_destructive {
        "You are allowed to generate DML and DDL statements (SELECT, DELETE, UPDATE, DROP, ALTER) if the user request requires it."
    } else {
        "Only generate SELECT statements."
    };

    format!(
        "You are an expert SQL generator. Convert the following natural language query into a valid MySQL statement.\n\
Schema:\n{schema}\n\n\
Rules:\n\
- {role_instructions}\n\
- Ensure all table and column names are valid.\n\
- Do not include explanations or markdown.\n\n\
Natural language query: \"{question}\"\n\
SQL:\n"
    )
}

fn explanation_prompt(sql: &str, results: &[Value], language: &str) -> String {
    let sample = &results[..results.len().min(EXPLANATION_SAMPLE_ROWS)];
    let sample_json = serde_json::to_string(sample).unwrap_or_else(|_| "[]".to_string());

    format!(
        "You are a data analyst. Given the following SQL query and its result, write a short, clear explanation\n\
in 2-3 sentences about what this data represents.\n\
Respond in {language}.\n\n\
SQL Query: {sql}\n\
Query Result (sample of up to 5 rows): {sample_json}\n\
Explanation:\n"
    )
}

fn csv_analysis_prompt(summaries: &Value, language: &str) -> String {
    format!(
        "You are a data analyst. Determine if the following CSV files are related in any way\n\
(e.g., shared keys, similar columns, or logical relationships). Give a clear and short summary of your findings.\n\
Respond in {language}.\n\n\
CSV Information: {summaries}\n\n\
Answer in 3-4 lines:\n"
    )
}

fn csv_query_prompt(question: &str, data: &Value, language: &str) -> String {
    format!(
        "You are an intelligent data analyst.\n\
You have access to the following CSV datasets:\n{data}\n\n\
The user asked: \"{question}\"\n\n\
Using reasoning on these CSVs, answer clearly in 3-5 lines.\n\
Respond in {language}.\n\
If the answer involves numerical or tabular output, include that in your text naturally.\n"
    )
}

/// Pull plain text out of whatever shape the generation backend returned.
///
/// Attempts, in order: candidate lists under `candidates`/`outputs`/`output`
/// (candidate-level `text`, then `content` as parts list, object, or plain
/// string), then flat text-like top-level keys, then a stringified fallback
/// of the whole response. Never fails; an unusable result is caught by
/// statement validation downstream.
pub fn extract_text(response: &Value) -> String {
    if let Some(obj) = response.as_object() {
        for key in ["candidates", "outputs", "output"] {
            if let Some(text) = obj.get(key).and_then(candidate_text) {
                return text;
            }
        }

        for key in ["text", "content", "message", "output_text", "response"] {
            if let Some(text) = obj.get(key).and_then(Value::as_str) {
                if !text.is_empty() {
                    return text.to_string();
                }
            }
        }
    }

    match response {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn candidate_text(candidates: &Value) -> Option<String> {
    let first = match candidates {
        Value::Array(items) => items.first()?,
        other => other,
    };

    let candidate = first.as_object()?;

    if let Some(text) = candidate.get("text").and_then(Value::as_str) {
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }

    let content = candidate.get("content")?;
    match content {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(parts) => join_parts(parts),
        Value::Object(content_obj) => {
            let parts = content_obj.get("parts")?.as_array()?;
            join_parts(parts)
        }
        _ => None,
    }
}

fn join_parts(parts: &[Value]) -> Option<String> {
    let mut out = String::new();
    for part in parts {
        match part {
            Value::String(s) => out.push_str(s),
            Value::Object(obj) => {
                if let Some(text) = obj.get("text").and_then(Value::as_str) {
                    out.push_str(text);
                }
            }
            _ => {}
        }
    }

    if out.is_empty() { None } else { Some(out) }
}
