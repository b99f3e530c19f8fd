/// Environment variable names used by this crate for convenient
/// configuration of the HTTP sink from services.
///
/// These are purely helpers; the core pipeline types remain decoupled from
/// environment access.

/// Base HTTP URL of the document store, e.g. `http://127.0.0.1:8123`.
pub const BULKLOG_URL_ENV: &str = "BULKLOG_URL";

/// Target database name.
pub const BULKLOG_DATABASE_ENV: &str = "BULKLOG_DATABASE";

/// Target table name.
pub const BULKLOG_TABLE_ENV: &str = "BULKLOG_TABLE";

/// Optional user name.
pub const BULKLOG_USER_ENV: &str = "BULKLOG_USER";

/// Optional password.
pub const BULKLOG_PASSWORD_ENV: &str = "BULKLOG_PASSWORD";

/// Read an environment variable or fall back to a provided default.
pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
