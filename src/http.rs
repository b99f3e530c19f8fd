use crate::env;
use crate::record::LogRecord;
use crate::sink::{BulkSession, BulkSink, SinkError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;

/// Configuration for [`HttpDocumentSink`].
///
/// The sink talks to the store over HTTP using the `JSONEachRow` bulk
/// format. The database name is not part of the config: it is the `target`
/// the pipeline passes to [`BulkSink::open`].
#[derive(Clone, Debug)]
pub struct HttpSinkConfig {
    /// Base URL without query, e.g. "http://127.0.0.1:8123"
    pub url: String,
    pub table: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl HttpSinkConfig {
    pub fn new(url: impl Into<String>, table: impl Into<String>) -> Self {
        HttpSinkConfig { url: url.into(), table: table.into(), user: None, password: None }
    }

    /// Build a config from the `BULKLOG_*` environment variables.
    pub fn from_env() -> Self {
        HttpSinkConfig {
            url: env::env_or(env::BULKLOG_URL_ENV, "http://127.0.0.1:8123"),
            table: env::env_or(env::BULKLOG_TABLE_ENV, "log_records"),
            user: std::env::var(env::BULKLOG_USER_ENV).ok(),
            password: std::env::var(env::BULKLOG_PASSWORD_ENV).ok(),
        }
    }
}

/// HTTP implementation of [`BulkSink`].
///
/// `open` probes that the target database exists (a missing target is the
/// one fatal condition the pipeline will not retry); the session buffers
/// rows locally and commits them in a single bulk insert on close.
#[derive(Clone)]
pub struct HttpDocumentSink {
    client: Client,
    config: HttpSinkConfig,
}

impl HttpDocumentSink {
    pub fn new(config: HttpSinkConfig) -> Self {
        HttpDocumentSink { client: Client::new(), config }
    }

    fn auth_params(&self) -> String {
        let mut params = String::new();
        if let Some(user) = &self.config.user {
            params.push_str(&format!("&user={}", urlencoding::encode(user)));
        }
        if let Some(password) = &self.config.password {
            params.push_str(&format!("&password={}", urlencoding::encode(password)));
        }
        params
    }

    fn probe_endpoint(&self, database: &str) -> String {
        format!(
            "{}/?query={}{}",
            self.config.url,
            urlencoding::encode(&format!("EXISTS DATABASE {database}")),
            self.auth_params()
        )
    }

    fn insert_endpoint(&self, database: &str) -> String {
        format!(
            "{}/?database={}&query={}{}",
            self.config.url,
            urlencoding::encode(database),
            urlencoding::encode(&format!("INSERT INTO {} FORMAT JSONEachRow", self.config.table)),
            self.auth_params()
        )
    }
}

/// One JSONEachRow line: the record as-is plus the expiration column the
/// store uses to auto-purge.
#[derive(Serialize)]
struct DocumentRow<'a> {
    #[serde(flatten)]
    record: &'a LogRecord,
    expires_at: DateTime<Utc>,
}

fn classify_failure(database: &str, status: reqwest::StatusCode, body: &str) -> SinkError {
    // ClickHouse reports UNKNOWN_DATABASE as code 81 and UNKNOWN_TABLE as
    // code 60; either way the target is gone and retrying cannot help.
    if body.contains("UNKNOWN_DATABASE")
        || body.contains("UNKNOWN_TABLE")
        || body.contains("Code: 81")
        || body.contains("Code: 60")
    {
        SinkError::TargetMissing(database.to_string())
    } else {
        SinkError::transport(format!("request failed with status {status}: {body}"))
    }
}

impl From<reqwest::Error> for SinkError {
    fn from(error: reqwest::Error) -> Self {
        SinkError::Transport(error.to_string())
    }
}

#[async_trait]
impl BulkSink for HttpDocumentSink {
    async fn open(&self, target: &str) -> Result<Box<dyn BulkSession>, SinkError> {
        let resp = self.client.get(self.probe_endpoint(target)).send().await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_else(|_| "<no body>".to_string());
        if !status.is_success() {
            return Err(classify_failure(target, status, &body));
        }
        if body.trim() == "0" {
            return Err(SinkError::TargetMissing(target.to_string()));
        }
        Ok(Box::new(HttpBulkSession {
            client: self.client.clone(),
            endpoint: self.insert_endpoint(target),
            database: target.to_string(),
            body: String::new(),
            rows: 0,
            broken: false,
        }))
    }
}

struct HttpBulkSession {
    client: Client,
    endpoint: String,
    database: String,
    /// Newline-delimited JSON rows accumulated for the bulk insert.
    body: String,
    rows: usize,
    broken: bool,
}

#[async_trait]
impl BulkSession for HttpBulkSession {
    async fn write(
        &mut self,
        record: &LogRecord,
        expires_at: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        if self.broken {
            return Err(SinkError::SessionClosed);
        }
        let row = DocumentRow { record, expires_at };
        match serde_json::to_string(&row) {
            Ok(line) => {
                self.body.push_str(&line);
                self.body.push('\n');
                self.rows += 1;
                Ok(())
            }
            Err(e) => {
                self.broken = true;
                Err(SinkError::Serialization(e))
            }
        }
    }

    async fn close(self: Box<Self>) -> Result<(), SinkError> {
        if self.broken {
            return Err(SinkError::SessionClosed);
        }
        if self.rows == 0 {
            return Ok(());
        }
        let resp = self.client.post(&self.endpoint).body(self.body).send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_else(|_| "<no body>".to_string());
            Err(classify_failure(&self.database, status, &body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Level, LogRecord};

    #[test]
    fn insert_endpoint_encodes_query_and_auth() {
        let mut config = HttpSinkConfig::new("http://localhost:8123", "log_records");
        config.user = Some("writer".to_string());
        let sink = HttpDocumentSink::new(config);
        let endpoint = sink.insert_endpoint("logs");
        assert!(endpoint.starts_with("http://localhost:8123/?database=logs&query=INSERT"));
        assert!(endpoint.contains("FORMAT%20JSONEachRow"));
        assert!(endpoint.contains("&user=writer"));
    }

    #[test]
    fn row_carries_record_fields_and_expiration() {
        let record =
            LogRecord::new(Level::Error, "svc.auth", "login failed").with_field("userId", 42);
        let expires_at = Utc::now();
        let row = DocumentRow { record: &record, expires_at };
        let value = serde_json::to_value(&row).expect("serialize row");
        assert_eq!(value["category"], serde_json::json!("svc.auth"));
        assert_eq!(value["fields"]["userId"], serde_json::json!(42));
        assert_eq!(value["expires_at"], serde_json::json!(expires_at));
    }

    #[test]
    fn missing_database_is_classified_fatal() {
        let err = classify_failure(
            "logs",
            reqwest::StatusCode::NOT_FOUND,
            "Code: 81. DB::Exception: Database logs does not exist. (UNKNOWN_DATABASE)",
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn other_failures_are_transient() {
        let err =
            classify_failure("logs", reqwest::StatusCode::SERVICE_UNAVAILABLE, "overloaded");
        assert!(!err.is_fatal());
    }
}
