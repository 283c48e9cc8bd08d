//! Deny-lists for keywords and called functions
//!
//! Both lists are compared case-insensitively against unquoted words (keywords)
//! or call sites (functions). Entries are stored uppercased. Table functions
//! in FROM position go the other way: only the listed generators are allowed.

use lazy_static::lazy_static;
use std::collections::HashSet;

lazy_static! {
    static ref BLOCKED_KEYWORDS: HashSet<&'static str> = [
        "DROP", "DELETE", "UPDATE", "INSERT", "ALTER", "GRANT", "TRUNCATE", "EXEC", "COPY", "CALL",
        "CREATE", "REVOKE", "EXECUTE", "MERGE", "ATTACH", "DETACH", "PRAGMA",
    ]
    .into_iter()
    .collect();

    // File access, shell access and remote reads across the supported engines.
    static ref BLOCKED_FUNCTIONS: HashSet<&'static str> = [
        "LOAD_FILE", "SYSTEM", "SHELL", "EVAL", "EXEC", "EXECUTE",
        "READ_CSV", "READ_CSV_AUTO", "READ_PARQUET", "READ_JSON", "READ_JSON_AUTO",
        "READ_NDJSON", "READ_TEXT", "READ_BLOB", "GLOB", "PARQUET_SCAN", "CSV_SCAN",
        "PG_READ_FILE", "PG_READ_BINARY_FILE", "PG_LS_DIR", "PG_STAT_FILE",
        "LO_IMPORT", "LO_EXPORT", "DBLINK", "DBLINK_EXEC",
        "LOAD_EXTENSION", "READFILE", "WRITEFILE", "FSDIR",
        "EXTERNAL_QUERY", "SYSTEM$EXECUTE",
    ]
    .into_iter()
    .collect();

    // Row generators that read nothing but their arguments.
    static ref TABLE_FUNCTIONS: HashSet<&'static str> = [
        "UNNEST", "GENERATE_SERIES", "GENERATE_ARRAY", "GENERATE_DATE_ARRAY",
        "GENERATE_TIMESTAMP_ARRAY", "JSON_EACH", "JSON_TREE", "FLATTEN", "SPLIT_TO_TABLE",
    ]
    .into_iter()
    .collect();
}

/// SQLite exposes every PRAGMA as a `pragma_<name>` table-valued function.
const BLOCKED_FUNCTION_PREFIXES: &[&str] = &["PRAGMA_"];

pub fn is_blocked_keyword(word: &str) -> bool {
    BLOCKED_KEYWORDS.contains(word.to_uppercase().as_str())
}

pub fn is_blocked_function(name: &str) -> bool {
    let name = name.to_uppercase();
    BLOCKED_FUNCTIONS.contains(name.as_str()) || BLOCKED_FUNCTION_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Whether `name` may be used as a relation in FROM/JOIN position.
pub fn is_permitted_table_function(name: &str) -> bool {
    TABLE_FUNCTIONS.contains(name.to_uppercase().as_str())
}
