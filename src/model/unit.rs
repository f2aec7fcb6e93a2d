//! Work units and idempotency records.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// One job invocation's input. Opaque to the engine apart from key extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkUnit(serde_json::Value);

impl WorkUnit {
    pub fn new(payload: serde_json::Value) -> Self {
        Self(payload)
    }

    /// An empty object, used by triggers that carry no payload of their own.
    pub fn empty() -> Self {
        Self(serde_json::Value::Object(Default::default()))
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn into_payload(self) -> serde_json::Value {
        self.0
    }
}

impl From<serde_json::Value> for WorkUnit {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// Proof that a key was admitted. Exactly one exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub admitted_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn new(key: impl Into<String>, admitted_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            admitted_at,
        }
    }

    /// The `updated_at` column value: RFC 3339 with millisecond precision.
    pub fn updated_at(&self) -> String {
        self.admitted_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Outcome of a conditional insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// This caller created the record and owns the execution.
    Admitted,
    /// A record for the key already existed.
    AlreadyExists,
}

impl Admission {
    pub fn as_str(self) -> &'static str {
        match self {
            Admission::Admitted => "admitted",
            Admission::AlreadyExists => "already_exists",
        }
    }
}
