//! Database access for the query pipeline: statement execution with
//! JSON-shaped results, and schema introspection used to ground SQL
//! synthesis.

use askdb_policy::StatementClass;
use serde_json::{Map, Value};
use sqlx::mysql::{MySqlPool, MySqlRow};
use sqlx::{Column, Row};

/// Degraded schema descriptor used when live introspection fails. The
/// request still proceeds; generated SQL just loses schema grounding.
pub const FALLBACK_SCHEMA: &str = "\
Database: library_db
Tables:
1. authors(author_id, name, country)
2. books(book_id, title, author_id, publication_year, genre, available_copies)
3. members(member_id, name, join_date, membership_type)
4. loans(loan_id, book_id, member_id, loan_date, return_date, status)
Relationships:
- books.author_id -> authors.author_id
- loans.book_id -> books.book_id
- loans.member_id -> members.member_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for DbError {}

pub const ERR_EXECUTION_FAILED: &str = "ERR_EXECUTION_FAILED";

/// Result of executing a validated statement.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Ordered rows, one JSON object per row, for statements that return
    /// rows.
    Rows(Vec<Value>),
    /// Rows-affected count for mutating statements.
    Affected(u64),
}

/// Execute a single already-validated statement. Driver-level detail is
/// logged but not surfaced to the caller.
pub async fn execute_statement(
    pool: &MySqlPool,
    sql: &str,
    class: StatementClass,
) -> Result<ExecutionOutcome, DbError> {
    if class.returns_rows() {
        let rows = sqlx::query(sql).fetch_all(pool).await.map_err(|err| {
            tracing::warn!(class = class.as_str(), error = %err, "statement execution failed");
            DbError {
                code: ERR_EXECUTION_FAILED,
                message: "query execution failed".to_string(),
            }
        })?;
        Ok(ExecutionOutcome::Rows(
            rows.iter().map(row_to_json).collect(),
        ))
    } else {
        let result = sqlx::query(sql).execute(pool).await.map_err(|err| {
            tracing::warn!(class = class.as_str(), error = %err, "statement execution failed");
            DbError {
                code: ERR_EXECUTION_FAILED,
                message: "query execution failed".to_string(),
            }
        })?;
        Ok(ExecutionOutcome::Affected(result.rows_affected()))
    }
}

/// Textual schema descriptor for the current database, regenerated on
/// every call so it always reflects live DDL state. Falls back to a static
/// placeholder instead of failing the request.
pub async fn introspect_schema(pool: &MySqlPool) -> String {
    match introspect(pool).await {
        Ok(schema) => schema,
        Err(err) => {
            tracing::warn!(error = %err, "schema introspection failed; using fallback descriptor");
            FALLBACK_SCHEMA.to_string()
        }
    }
}

async fn introspect(pool: &MySqlPool) -> Result<String, sqlx::Error> {
    let database: Option<String> = sqlx::query_scalar("SELECT DATABASE()")
        .fetch_one(pool)
        .await?;

    let columns: Vec<(String, String)> = sqlx::query_as(
        "SELECT TABLE_NAME, COLUMN_NAME \
         FROM information_schema.columns \
         WHERE TABLE_SCHEMA = DATABASE() \
         ORDER BY TABLE_NAME, ORDINAL_POSITION",
    )
    .fetch_all(pool)
    .await?;

    let foreign_keys: Vec<(String, String, String, String)> = sqlx::query_as(
        "SELECT TABLE_NAME, COLUMN_NAME, REFERENCED_TABLE_NAME, REFERENCED_COLUMN_NAME \
         FROM information_schema.key_column_usage \
         WHERE TABLE_SCHEMA = DATABASE() AND REFERENCED_TABLE_NAME IS NOT NULL \
         ORDER BY TABLE_NAME, COLUMN_NAME",
    )
    .fetch_all(pool)
    .await?;

    let mut tables: Vec<(String, Vec<String>)> = Vec::new();
    for (table, column) in columns {
        match tables.last_mut() {
            Some((name, cols)) if *name == table => cols.push(column),
            _ => tables.push((table, vec![column])),
        }
    }

    Ok(format_schema(
        database.as_deref().unwrap_or("unknown"),
        &tables,
        &foreign_keys,
    ))
}

fn format_schema(
    database: &str,
    tables: &[(String, Vec<String>)],
    foreign_keys: &[(String, String, String, String)],
) -> String {
    let mut out = format!("Database: {}\nTables:\n", database);

    for (idx, (table, columns)) in tables.iter().enumerate() {
        out.push_str(&format!("{}. {}({})\n", idx + 1, table, columns.join(", ")));
    }

    if !foreign_keys.is_empty() {
        out.push_str("Relationships:\n");
        for (table, column, ref_table, ref_column) in foreign_keys {
            out.push_str(&format!(
                "- {}.{} -> {}.{}\n",
                table, column, ref_table, ref_column
            ));
        }
    }

    out.trim_end().to_string()
}

/// List base tables in the current database.
pub async fn list_tables(pool: &MySqlPool) -> Result<Vec<String>, DbError> {
    sqlx::query_scalar(
        "SELECT TABLE_NAME \
         FROM information_schema.tables \
         WHERE TABLE_SCHEMA = DATABASE() \
         ORDER BY TABLE_NAME",
    )
    .fetch_all(pool)
    .await
    .map_err(|err| {
        tracing::warn!(error = %err, "table listing failed");
        DbError {
            code: ERR_EXECUTION_FAILED,
            message: "failed to list tables".to_string(),
        }
    })
}

pub async fn ping(pool: &MySqlPool) -> bool {
    sqlx::query("SELECT 1").execute(pool).await.is_ok()
}

fn row_to_json(row: &MySqlRow) -> Value {
    let mut object = Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_string(), column_value(row, idx));
    }
    Value::Object(object)
}

// Decode one column into JSON by trying concrete Rust types in order;
// sqlx rejects incompatible decodes, so the first success wins. Unknown
// types degrade to a lossy string or null rather than failing the row.
fn column_value(row: &MySqlRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx) {
        return v
            .map(|ts| Value::String(ts.to_rfc3339()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(idx) {
        return v
            .map(|ts| Value::String(ts.to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(idx) {
        return v
            .map(|d| Value::String(d.to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveTime>, _>(idx) {
        return v
            .map(|t| Value::String(t.to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::String).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v
            .map(|bytes| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
            .unwrap_or(Value::Null);
    }

    Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_schema_lists_tables_and_relationships() {
        let tables = vec![
            (
                "authors".to_string(),
                vec!["author_id".to_string(), "name".to_string()],
            ),
            (
                "books".to_string(),
                vec!["book_id".to_string(), "author_id".to_string()],
            ),
        ];
        let fks = vec![(
            "books".to_string(),
            "author_id".to_string(),
            "authors".to_string(),
            "author_id".to_string(),
        )];

        let schema = format_schema("library_db", &tables, &fks);

        assert!(schema.starts_with("Database: library_db"));
        assert!(schema.contains("1. authors(author_id, name)"));
        assert!(schema.contains("2. books(book_id, author_id)"));
        assert!(schema.contains("- books.author_id -> authors.author_id"));
    }

    #[test]
    fn format_schema_omits_relationship_section_without_foreign_keys() {
        let tables = vec![("notes".to_string(), vec!["id".to_string()])];
        let schema = format_schema("scratch", &tables, &[]);

        assert!(schema.contains("1. notes(id)"));
        assert!(!schema.contains("Relationships:"));
    }
}
