use std::time::Duration;
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::protocol::{DEADLINE_HEADER, HEALTH_PATH, RECORDS_PATH, SERVICE_BINARY, SHUTDOWN_PATH};
use shared::types::{CallCode, ErrorBody, HealthResponse, HealthStatus, Record, RecordKind};
use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("service unavailable — start it with `{} service start`", SERVICE_BINARY)]
    Unavailable(#[source] reqwest::Error),

    #[error("{code}: {message}")]
    Remote { code: CallCode, message: String },

    #[error("request timed out: {0}")]
    Timeout(#[source] reqwest::Error),

    #[error("unexpected response from service: {0}")]
    Protocol(String),

    #[error("failed to decode service response: {0}")]
    Decode(#[source] reqwest::Error),
}

impl CallError {
    /// Wire outcome this error corresponds to.
    pub fn code(&self) -> CallCode {
        match self {
            CallError::Unavailable(_) => CallCode::Unavailable,
            CallError::Remote { code, .. } => *code,
            CallError::Timeout(_) => CallCode::DeadlineExceeded,
            CallError::Protocol(_) | CallError::Decode(_) => CallCode::Internal,
        }
    }

    fn from_send(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CallError::Timeout(e)
        } else {
            CallError::Unavailable(e)
        }
    }
}

/// A health-checked connection to the service. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ServiceChannel {
    http: reqwest::Client,
    address: String,
    probe_timeout: Duration,
    deadline: Option<Duration>,
}

impl ServiceChannel {
    pub fn new(address: impl Into<String>, call_timeout: Duration, probe_timeout: Duration) -> Result<Self, CallError> {
        let http = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| CallError::Protocol(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            http,
            address: address.into(),
            probe_timeout,
            deadline: None,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Copy of this channel whose calls carry a caller deadline `budget` from
    /// the moment each call is sent.
    pub fn with_deadline(&self, budget: Duration) -> Self {
        Self {
            deadline: Some(budget),
            ..self.clone()
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.address, path)
    }

    fn prepare(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.deadline {
            Some(budget) => {
                let budget_ms = i64::try_from(budget.as_millis()).unwrap_or(i64::MAX);
                let at = chrono::Utc::now().timestamp_millis().saturating_add(budget_ms);
                builder.header(DEADLINE_HEADER, at.to_string())
            }
            None => builder,
        }
    }

    /// Bounded health call. Transport failures come back as `Unreachable`.
    pub async fn health(&self) -> HealthStatus {
        match self.health_detail().await {
            Ok(resp) => resp.status,
            Err(CallError::Remote { code: CallCode::Unavailable, .. }) => HealthStatus::NotServing,
            Err(e) => {
                trace!("Health check against {} failed: {}", self.address, e);
                HealthStatus::Unreachable
            }
        }
    }

    pub async fn health_detail(&self) -> Result<HealthResponse, CallError> {
        let resp = self
            .http
            .get(self.url(HEALTH_PATH))
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(CallError::from_send)?;

        // A draining service answers 503 with a health body rather than an error body
        if resp.status().as_u16() == CallCode::Unavailable.http_status() {
            let bytes = resp.bytes().await.map_err(CallError::Decode)?;
            return match serde_json::from_slice::<HealthResponse>(&bytes) {
                Ok(health) => Ok(health),
                Err(_) => Err(error_from_body(503, &bytes)),
            };
        }
        decode(resp).await
    }

    pub async fn list_records(&self, kind: RecordKind) -> Result<Vec<Record>, CallError> {
        let url = self.url(&format!("{}/{}", RECORDS_PATH, kind));
        let resp = self.prepare(self.http.get(url)).send().await.map_err(CallError::from_send)?;
        decode(resp).await
    }

    pub async fn get_record(&self, kind: RecordKind, name: &str) -> Result<Record, CallError> {
        let url = self.url(&format!("{}/{}/{}", RECORDS_PATH, kind, name));
        let resp = self.prepare(self.http.get(url)).send().await.map_err(CallError::from_send)?;
        decode(resp).await
    }

    pub async fn put_record(&self, kind: RecordKind, name: &str, data: &serde_json::Value) -> Result<Record, CallError> {
        let url = self.url(&format!("{}/{}/{}", RECORDS_PATH, kind, name));
        let resp = self
            .prepare(self.http.put(url).json(data))
            .send()
            .await
            .map_err(CallError::from_send)?;
        decode(resp).await
    }

    pub async fn delete_record(&self, kind: RecordKind, name: &str) -> Result<(), CallError> {
        let url = self.url(&format!("{}/{}/{}", RECORDS_PATH, kind, name));
        let resp = self.prepare(self.http.delete(url)).send().await.map_err(CallError::from_send)?;
        expect_empty(resp).await
    }

    /// Ask the service to shut down gracefully.
    pub async fn shutdown(&self) -> Result<(), CallError> {
        let resp = self
            .prepare(self.http.post(self.url(SHUTDOWN_PATH)))
            .send()
            .await
            .map_err(CallError::from_send)?;
        expect_empty(resp).await
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, CallError> {
    let status = resp.status();
    if status.is_success() {
        return resp.json::<T>().await.map_err(CallError::Decode);
    }
    let bytes = resp.bytes().await.map_err(CallError::Decode)?;
    Err(error_from_body(status.as_u16(), &bytes))
}

async fn expect_empty(resp: Response) -> Result<(), CallError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let bytes = resp.bytes().await.map_err(CallError::Decode)?;
    Err(error_from_body(status.as_u16(), &bytes))
}

fn error_from_body(status: u16, bytes: &[u8]) -> CallError {
    match serde_json::from_slice::<ErrorBody>(bytes) {
        Ok(body) => CallError::Remote {
            code: body.code,
            message: body.message,
        },
        Err(_) => CallError::Protocol(format!("status {} without an error body", status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    fn channel(address: &str) -> ServiceChannel {
        ServiceChannel::new(address, Duration::from_secs(5), Duration::from_secs(1)).unwrap()
    }

    #[tokio::test]
    async fn test_health_unreachable_when_nothing_listens() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert_eq!(channel(&addr).health().await, HealthStatus::Unreachable);
    }

    #[tokio::test]
    async fn test_health_reports_not_serving() {
        let app = Router::new().route(
            HEALTH_PATH,
            get(|| async {
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(HealthResponse { status: HealthStatus::NotServing, pid: None, started_at: None }),
                )
            }),
        );
        let addr = serve(app).await;

        assert_eq!(channel(&addr).health().await, HealthStatus::NotServing);
    }

    #[tokio::test]
    async fn test_remote_error_body_is_decoded() {
        let app = Router::new().route(
            "/v1/records/:kind/:name",
            get(|| async {
                (
                    StatusCode::NOT_FOUND,
                    Json(ErrorBody { code: CallCode::NotFound, message: "no such record".to_string() }),
                )
            }),
        );
        let addr = serve(app).await;

        let err = channel(&addr).get_record(RecordKind::Profile, "missing").await.unwrap_err();
        assert_eq!(err.code(), CallCode::NotFound);
        assert!(err.to_string().contains("no such record"));
    }

    #[tokio::test]
    async fn test_deadline_header_is_attached() {
        let app = Router::new().route(
            "/v1/records/:kind",
            get(|headers: axum::http::HeaderMap| async move {
                let present = headers.contains_key(DEADLINE_HEADER);
                Json(if present { vec![] } else { vec![serde_json::json!("missing")] })
            }),
        );
        let addr = serve(app).await;

        let records = channel(&addr)
            .with_deadline(Duration::from_secs(10))
            .list_records(RecordKind::Workspace)
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_message_names_start_command() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = channel(&addr).list_records(RecordKind::Repository).await.unwrap_err();
        assert_eq!(err.code(), CallCode::Unavailable);
        assert!(err.to_string().contains("repokeepd service start"));
    }
}
