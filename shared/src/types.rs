use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Registry entry describing how to reach the running service instance.
/// Written by the service right after it binds, read by every client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// "host:port", e.g. "localhost:47310"
    pub address: String,

    pub port: u16,

    /// Process id of the owning service. Signed so a corrupt negative value
    /// still parses and is then rejected by the liveness check.
    pub pid: i64,

    pub started_at: DateTime<Utc>,
}

/// The record families the service keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Repository,
    Profile,
    Workspace,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [RecordKind::Repository, RecordKind::Profile, RecordKind::Workspace];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Repository => "repository",
            RecordKind::Profile => "profile",
            RecordKind::Workspace => "workspace",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown record kind '{}'", s))
    }
}

/// A keyed record held by the service's store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub kind: RecordKind,

    pub name: String,

    /// Free-form payload owned by whoever created the record
    pub data: serde_json::Value,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Tri-state result of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Serving,
    NotServing,
    /// Never sent by the service; produced client-side on transport failure.
    Unreachable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// Outcome classes carried on the wire for failed calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallCode {
    InvalidArgument,
    NotFound,
    Canceled,
    Internal,
    Unavailable,
    DeadlineExceeded,
}

impl CallCode {
    /// HTTP status used for this code.
    pub fn http_status(&self) -> u16 {
        match self {
            CallCode::InvalidArgument => 400,
            CallCode::NotFound => 404,
            // Non-standard "client closed request", as nginx uses it
            CallCode::Canceled => 499,
            CallCode::Internal => 500,
            CallCode::Unavailable => 503,
            CallCode::DeadlineExceeded => 504,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallCode::InvalidArgument => "invalid_argument",
            CallCode::NotFound => "not_found",
            CallCode::Canceled => "canceled",
            CallCode::Internal => "internal",
            CallCode::Unavailable => "unavailable",
            CallCode::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

impl fmt::Display for CallCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: CallCode,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_kind_parse() {
        assert_eq!("profile".parse::<RecordKind>().unwrap(), RecordKind::Profile);
        assert!("profiles".parse::<RecordKind>().is_err());
    }

    #[test]
    fn test_descriptor_wire_format() {
        let json = r#"{"address":"localhost:47310","port":47310,"pid":4242,"started_at":"2026-01-02T03:04:05Z"}"#;
        let desc: ServiceDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(desc.address, "localhost:47310");
        assert_eq!(desc.port, 47310);
        assert_eq!(desc.pid, 4242);
    }

    #[test]
    fn test_call_code_serializes_snake_case() {
        let body = ErrorBody { code: CallCode::DeadlineExceeded, message: "slow".to_string() };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"deadline_exceeded\""));
        assert_eq!(CallCode::Canceled.http_status(), 499);
    }
}
