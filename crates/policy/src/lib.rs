//! Capability policy for the query pipeline: lexical statement
//! classification, the pre-synthesis intent gate, and the post-synthesis
//! statement validation shared by every caller that is about to hand SQL
//! to the database.
//!
//! Classification is prefix/keyword inspection of the trimmed, lower-cased
//! statement text, not a parser. An obfuscated or comment-prefixed
//! destructive statement can evade it; that limitation is accepted for this
//! scope and must not be relied on as an injection defense.

use serde::Serialize;

/// Capability tokens carried in a user's permission set.
pub mod capability {
    pub const READ: &str = "read";
    pub const INSERT: &str = "insert";
    pub const UPDATE: &str = "update";
    pub const DELETE: &str = "delete";
    pub const ANALYZE: &str = "analyze";
    /// Unrestricted permission set.
    pub const WILDCARD: &str = "*";
}

/// Lexical class of a candidate SQL statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatementClass {
    Select,
    MutatingDml,
    DestructiveDml,
    DestructiveDdl,
    Unknown,
}

impl StatementClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementClass::Select => "select",
            StatementClass::MutatingDml => "mutating-dml",
            StatementClass::DestructiveDml => "destructive-dml",
            StatementClass::DestructiveDdl => "destructive-ddl",
            StatementClass::Unknown => "unknown",
        }
    }

    /// True when executing the statement returns rows rather than a
    /// rows-affected count.
    pub fn returns_rows(&self) -> bool {
        matches!(self, StatementClass::Select)
    }
}

/// Classify a statement by its leading keyword. Pure function of the
/// trimmed, lower-cased text: the same input always yields the same class.
pub fn classify(sql: &str) -> StatementClass {
    let sql = sql.trim().to_lowercase();

    if sql.starts_with("select") {
        StatementClass::Select
    } else if sql.starts_with("insert") || sql.starts_with("update") {
        StatementClass::MutatingDml
    } else if sql.starts_with("delete") {
        StatementClass::DestructiveDml
    } else if sql.starts_with("drop") {
        StatementClass::DestructiveDdl
    } else {
        StatementClass::Unknown
    }
}

/// True when the permission set grants `cap`, either literally or via the
/// wildcard.
pub fn has_capability(permissions: &[String], cap: &str) -> bool {
    permissions
        .iter()
        .any(|p| p == cap || p == capability::WILDCARD)
}

/// Destructive statement classes are only offered to users holding the
/// `delete` capability (or the wildcard).
pub fn allows_destructive(permissions: &[String]) -> bool {
    has_capability(permissions, capability::DELETE)
}

/// Denial from the pre-synthesis intent gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDenied {
    pub required: &'static str,
    pub role: String,
}

impl GateDenied {
    pub fn message(&self) -> String {
        format!(
            "You don't have permission for destructive operations. This request requires the `{}` privilege. Current role: {}",
            self.required, self.role
        )
    }
}

impl std::fmt::Display for GateDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for GateDenied {}

// Intent markers checked against the raw natural-language question.
// Conservative on purpose: a false positive only forces a rephrase, while
// a false negative would let a destructive request reach synthesis.
const DESTRUCTIVE_INTENT_MARKERS: &[&str] = &["delete", "drop table", "remove table"];

/// Pre-screen the natural-language question before any synthesis call is
/// spent on it. Questions that read as destructive are denied outright
/// unless the permission set carries `delete` or the wildcard.
pub fn prescreen(question: &str, permissions: &[String], role: &str) -> Result<(), GateDenied> {
    let question = question.to_lowercase();

    let destructive_intent = DESTRUCTIVE_INTENT_MARKERS
        .iter()
        .any(|marker| question.contains(marker));

    if destructive_intent && !allows_destructive(permissions) {
        return Err(GateDenied {
            required: capability::DELETE,
            role: role.to_string(),
        });
    }

    Ok(())
}

/// Violation raised by post-synthesis statement validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyViolation {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for PolicyViolation {}

pub const ERR_RESTRICTED_OPERATION: &str = "ERR_RESTRICTED_OPERATION";
pub const ERR_UNSAFE_QUERY: &str = "ERR_UNSAFE_QUERY";

/// Validate a synthesized statement against the caller's destructive
/// allowance. Empty output is never executable. Whole-database destruction
/// is rejected for every caller, including those allowed destructive DDL.
pub fn validate_statement(
    sql: &str,
    allow_destructive: bool,
) -> Result<StatementClass, PolicyViolation> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(PolicyViolation {
            code: ERR_UNSAFE_QUERY,
            message: "generated statement is empty".to_string(),
        });
    }

    let class = classify(trimmed);
    let lowered = trimmed.to_lowercase();

    if allow_destructive {
        if lowered.contains("drop database") {
            return Err(PolicyViolation {
                code: ERR_RESTRICTED_OPERATION,
                message: "Database-level DROP operations are not allowed through this interface."
                    .to_string(),
            });
        }
        return Ok(class);
    }

    match class {
        StatementClass::Select => Ok(class),
        StatementClass::DestructiveDml | StatementClass::DestructiveDdl => Err(PolicyViolation {
            code: ERR_RESTRICTED_OPERATION,
            message:
                "Deletion and drop operations are restricted through this interface. You may not have the required permissions."
                    .to_string(),
        }),
        _ => Err(PolicyViolation {
            code: ERR_UNSAFE_QUERY,
            message:
                "Unsafe or non-SELECT query generated. Only SELECT queries are allowed through this interface."
                    .to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perms(caps: &[&str]) -> Vec<String> {
        caps.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn classify_covers_every_statement_class() {
        assert_eq!(classify("SELECT * FROM books"), StatementClass::Select);
        assert_eq!(
            classify("  insert into books values (1)"),
            StatementClass::MutatingDml
        );
        assert_eq!(
            classify("UPDATE members SET name = 'x'"),
            StatementClass::MutatingDml
        );
        assert_eq!(classify("DELETE FROM loans"), StatementClass::DestructiveDml);
        assert_eq!(classify("DROP TABLE loans"), StatementClass::DestructiveDdl);
        assert_eq!(classify("SHOW TABLES"), StatementClass::Unknown);
    }

    #[test]
    fn classify_is_pure_over_trim_and_case() {
        let variants = ["select 1", "  SELECT 1  ", "\nSeLeCt 1"];
        for sql in variants {
            assert_eq!(classify(sql), StatementClass::Select);
            assert_eq!(classify(sql), classify(sql));
        }
    }

    #[test]
    fn prescreen_denies_destructive_intent_without_delete() {
        let err = prescreen(
            "please delete all loans",
            &perms(&["read", "analyze"]),
            "viewer",
        )
        .unwrap_err();
        assert_eq!(err.required, "delete");
        assert_eq!(err.role, "viewer");
        assert!(err.message().contains("viewer"));
        assert!(err.message().contains("`delete`"));
    }

    #[test]
    fn prescreen_allows_destructive_intent_with_delete_or_wildcard() {
        prescreen("delete old loans", &perms(&["read", "delete"]), "editor")
            .expect("delete capability should pass the gate");
        prescreen("drop table loans", &perms(&["*"]), "admin")
            .expect("wildcard should pass the gate");
    }

    #[test]
    fn prescreen_ignores_benign_questions() {
        prescreen("show all books", &perms(&["read"]), "viewer")
            .expect("benign question should pass the gate");
    }

    #[test]
    fn validate_rejects_empty_and_whitespace_statements() {
        for sql in ["", "   ", "\n\t"] {
            let err = validate_statement(sql, true).unwrap_err();
            assert_eq!(err.code, ERR_UNSAFE_QUERY);
        }
    }

    #[test]
    fn validate_without_destructive_allowance_requires_select() {
        assert_eq!(
            validate_statement("SELECT * FROM books", false).unwrap(),
            StatementClass::Select
        );

        let err = validate_statement("DELETE FROM loans", false).unwrap_err();
        assert_eq!(err.code, ERR_RESTRICTED_OPERATION);

        let err = validate_statement("DROP TABLE loans", false).unwrap_err();
        assert_eq!(err.code, ERR_RESTRICTED_OPERATION);

        let err = validate_statement("UPDATE members SET name = 'x'", false).unwrap_err();
        assert_eq!(err.code, ERR_UNSAFE_QUERY);
    }

    #[test]
    fn validate_with_destructive_allowance_accepts_dml_and_ddl() {
        assert_eq!(
            validate_statement("UPDATE members SET name = 'x'", true).unwrap(),
            StatementClass::MutatingDml
        );
        assert_eq!(
            validate_statement("DROP TABLE loans", true).unwrap(),
            StatementClass::DestructiveDdl
        );
    }

    #[test]
    fn drop_database_is_rejected_regardless_of_allowance_and_casing() {
        for sql in [
            "DROP DATABASE library_db",
            "drop database library_db",
            "  DrOp DaTaBaSe library_db;",
        ] {
            let err = validate_statement(sql, true).unwrap_err();
            assert_eq!(err.code, ERR_RESTRICTED_OPERATION);
        }
    }

    #[test]
    fn capability_checks_honor_wildcard() {
        assert!(has_capability(&perms(&["*"]), "delete"));
        assert!(has_capability(&perms(&["read", "analyze"]), "analyze"));
        assert!(!has_capability(&perms(&["read", "analyze"]), "delete"));
        assert!(allows_destructive(&perms(&["*"])));
        assert!(!allows_destructive(&perms(&["read"])));
    }
}
