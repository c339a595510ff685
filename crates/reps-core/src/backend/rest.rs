//! PostgREST-style storage backend

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use super::{ApplyOutcome, BackendError, ServerVersion, StorageBackend};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::models::{ConflictType, Operation, OperationKind};
use crate::util::compact_text;

const CONNECT_TIMEOUT_SECS: u64 = 5;
const CONFLICT_TYPE_HEADER: &str = "x-conflict-type";
const OVERWRITE_HEADER: &str = "x-reps-overwrite";
const BATCH_ID_HEADER: &str = "x-reps-batch-id";
const OPERATION_ID_HEADER: &str = "x-reps-operation-id";

/// Applies operations through `/rest/v1/{table}` endpoints
#[derive(Debug, Clone)]
pub struct RestBackend {
    client: reqwest::Client,
    config: BackendConfig,
}

impl RestBackend {
    /// `timeout` bounds each request end to end
    pub fn new(config: BackendConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(timeout)
            .build()
            .map_err(|error| Error::Config(format!("failed to build HTTP client: {error}")))?;
        Ok(Self { client, config })
    }

    pub const fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn table_url(&self, table: &str) -> String {
        format!(
            "{}/rest/v1/{}",
            self.config.base_url,
            urlencoding::encode(table)
        )
    }

    fn record_url(&self, table: &str, record_id: &str) -> String {
        format!(
            "{}?id=eq.{}",
            self.table_url(table),
            urlencoding::encode(record_id)
        )
    }

    fn request(&self, operation: &Operation) -> reqwest::RequestBuilder {
        let table = &operation.target_table;
        let request = match operation.kind {
            OperationKind::Create => self
                .client
                .post(self.table_url(table))
                .json(&operation.payload),
            OperationKind::Update => self
                .client
                .patch(self.record_url(table, &operation.record_id))
                .json(&operation.payload),
            OperationKind::Delete => self
                .client
                .delete(self.record_url(table, &operation.record_id)),
        };

        let prefer = if operation.overwrite {
            "return=minimal,resolution=merge-duplicates"
        } else {
            "return=minimal"
        };

        let request = request
            .header("apikey", &self.config.api_key)
            .bearer_auth(&self.config.api_key)
            .header("Prefer", prefer)
            .header(OPERATION_ID_HEADER, operation.id.as_str());
        let request = match &operation.batch_id {
            Some(batch_id) => request.header(BATCH_ID_HEADER, batch_id),
            None => request,
        };

        if operation.overwrite {
            request.header(OVERWRITE_HEADER, "true")
        } else {
            request
        }
    }
}

#[async_trait]
impl StorageBackend for RestBackend {
    async fn apply(&self, operation: &Operation) -> ApplyOutcome {
        let response = match self.request(operation).send().await {
            Ok(response) => response,
            Err(error) => return ApplyOutcome::Failed(classify_transport_error(&error)),
        };

        let status = response.status();
        if status.is_success() {
            return ApplyOutcome::Applied;
        }

        let header_conflict_type = response
            .headers()
            .get(CONFLICT_TYPE_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<ConflictType>().ok());

        let body = match response.text().await {
            Ok(body) => body,
            Err(error) => return ApplyOutcome::Failed(classify_transport_error(&error)),
        };

        if matches!(status, StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED) {
            return ApplyOutcome::Conflict(parse_conflict(operation.kind, header_conflict_type, &body));
        }

        let detail = format!("HTTP {}: {}", status.as_u16(), compact_text(&body));
        if is_transient_status(status) {
            ApplyOutcome::Failed(BackendError::Unavailable(detail))
        } else {
            ApplyOutcome::Failed(BackendError::Rejected(detail))
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    // 425 Too Early has no named constant
    status.is_server_error() || matches!(status.as_u16(), 408 | 425 | 429)
}

fn classify_transport_error(error: &reqwest::Error) -> BackendError {
    if error.is_timeout() {
        BackendError::Timeout(error.to_string())
    } else if error.is_builder() {
        BackendError::Malformed(error.to_string())
    } else {
        BackendError::Network(error.to_string())
    }
}

/// Read the server version out of a conflict response
///
/// Accepts either `{"server_version": .., "conflict_type": ..}` or the bare
/// server record.
fn parse_conflict(kind: OperationKind, header: Option<ConflictType>, body: &str) -> ServerVersion {
    let parsed = serde_json::from_str::<Value>(body).unwrap_or(Value::Null);
    let body_conflict_type = parsed
        .get("conflict_type")
        .and_then(Value::as_str)
        .and_then(|value| value.parse::<ConflictType>().ok());
    let data = match parsed.get("server_version") {
        Some(version) => version.clone(),
        None => parsed,
    };

    let conflict_type = header.or(body_conflict_type).unwrap_or(match kind {
        OperationKind::Delete => ConflictType::DeleteConflict,
        OperationKind::Create | OperationKind::Update => ConflictType::ConcurrentUpdate,
    });

    ServerVersion {
        data,
        conflict_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewOperation;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::task::JoinHandle;

    /// Serve one canned response and hand back the raw request
    async fn spawn_one_shot_server(
        status_line: &str,
        headers: &str,
        body: &str,
    ) -> (String, JoinHandle<String>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let address = listener.local_addr().expect("local address");
        let response = format!(
            "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\n{headers}content-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len(),
        );

        let handle = tokio::spawn(async move {
            let mut request = String::new();
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buffer = [0_u8; 4096];
                if let Ok(read) = socket.read(&mut buffer).await {
                    request = String::from_utf8_lossy(&buffer[..read]).into_owned();
                }
                let _ = socket.write_all(response.as_bytes()).await;
            }
            request
        });

        (format!("http://{address}"), handle)
    }

    fn backend(base_url: &str) -> RestBackend {
        RestBackend::new(
            BackendConfig::new(base_url, "anon-key").unwrap(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn op(new: NewOperation) -> Operation {
        Operation::from_new(new, 0, 0)
    }

    #[tokio::test]
    async fn create_posts_to_table_endpoint() {
        let (url, request) = spawn_one_shot_server("201 Created", "", "").await;
        let outcome = backend(&url)
            .apply(&op(NewOperation::create(
                "exercises",
                "ex-1",
                json!({"id": "ex-1", "name": "Squat"}),
            )))
            .await;
        assert_eq!(outcome, ApplyOutcome::Applied);

        let request = request.await.unwrap();
        assert!(request.starts_with("POST /rest/v1/exercises HTTP/1.1"));
        assert!(request.contains("apikey: anon-key"));
        assert!(request.contains("authorization: Bearer anon-key"));
        assert!(request.contains("x-reps-operation-id: "));
    }

    #[tokio::test]
    async fn overwrite_update_patches_record_with_headers() {
        let (url, request) = spawn_one_shot_server("204 No Content", "", "").await;
        let outcome = backend(&url)
            .apply(&op(
                NewOperation::update("exercises", "ex 1", json!({"name": "Row"})).overwriting(),
            ))
            .await;
        assert_eq!(outcome, ApplyOutcome::Applied);

        let request = request.await.unwrap();
        assert!(request.starts_with("PATCH /rest/v1/exercises?id=eq.ex%201 HTTP/1.1"));
        assert!(request.contains("prefer: return=minimal,resolution=merge-duplicates"));
        assert!(request.contains("x-reps-overwrite: true"));
        assert!(!request.contains("x-reps-batch-id"));
    }

    #[tokio::test]
    async fn batch_id_is_forwarded_as_header() {
        let (url, request) = spawn_one_shot_server("201 Created", "", "").await;
        let outcome = backend(&url)
            .apply(&op(
                NewOperation::create("exercises", "ex-1", json!({"name": "Row"}))
                    .with_batch("workout-7"),
            ))
            .await;
        assert_eq!(outcome, ApplyOutcome::Applied);

        let request = request.await.unwrap();
        assert!(request.contains("x-reps-batch-id: workout-7"));
    }

    #[tokio::test]
    async fn conflict_status_carries_server_version() {
        let (url, _request) = spawn_one_shot_server(
            "409 Conflict",
            "x-conflict-type: schema_mismatch\r\n",
            r#"{"server_version": {"name": "Server"}}"#,
        )
        .await;
        let outcome = backend(&url)
            .apply(&op(NewOperation::update("exercises", "ex-1", json!({"name": "Local"}))))
            .await;
        assert_eq!(
            outcome,
            ApplyOutcome::Conflict(ServerVersion {
                data: json!({"name": "Server"}),
                conflict_type: ConflictType::SchemaMismatch,
            })
        );
    }

    #[tokio::test]
    async fn delete_conflict_defaults_type_from_kind() {
        let (url, request) =
            spawn_one_shot_server("412 Precondition Failed", "", r#"{"name": "Kept"}"#).await;
        let outcome = backend(&url)
            .apply(&op(NewOperation::delete("exercises", "ex-1")))
            .await;
        assert_eq!(
            outcome,
            ApplyOutcome::Conflict(ServerVersion {
                data: json!({"name": "Kept"}),
                conflict_type: ConflictType::DeleteConflict,
            })
        );
        assert!(request.await.unwrap().starts_with("DELETE /rest/v1/exercises?id=eq.ex-1"));
    }

    #[tokio::test]
    async fn server_errors_are_retryable() {
        let (url, _request) =
            spawn_one_shot_server("503 Service Unavailable", "", r#"{"error":"down"}"#).await;
        let outcome = backend(&url)
            .apply(&op(NewOperation::create("exercises", "ex-1", json!({}))))
            .await;
        let ApplyOutcome::Failed(error) = outcome else {
            panic!("expected failure");
        };
        assert!(error.is_retryable());
        assert!(error.to_string().contains("HTTP 503"));
    }

    #[tokio::test]
    async fn client_errors_are_rejected() {
        let (url, _request) =
            spawn_one_shot_server("400 Bad Request", "", r#"{"message":"bad column"}"#).await;
        let outcome = backend(&url)
            .apply(&op(NewOperation::create("exercises", "ex-1", json!({}))))
            .await;
        assert!(matches!(
            outcome,
            ApplyOutcome::Failed(BackendError::Rejected(message)) if message.contains("bad column")
        ));
    }

    #[tokio::test]
    async fn rate_limit_is_retryable() {
        let (url, _request) = spawn_one_shot_server("429 Too Many Requests", "", "").await;
        let outcome = backend(&url)
            .apply(&op(NewOperation::create("exercises", "ex-1", json!({}))))
            .await;
        assert!(matches!(
            outcome,
            ApplyOutcome::Failed(BackendError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_host_is_network_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let outcome = backend(&format!("http://{address}"))
            .apply(&op(NewOperation::create("exercises", "ex-1", json!({}))))
            .await;
        let ApplyOutcome::Failed(error) = outcome else {
            panic!("expected failure");
        };
        assert!(matches!(error, BackendError::Network(_)));
        assert!(error.is_retryable());
    }
}
