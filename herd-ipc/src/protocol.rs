//! Remote job payloads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Payload format version for compatibility checking
pub const JOB_PROTOCOL_VERSION: u32 = 1;

/// Invocation of a named entry point with serialized arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub correlation_id: Uuid,
    pub entry_point: String,
    pub args: JsonValue,
}

impl JobRequest {
    pub fn new(entry_point: impl Into<String>, args: JsonValue) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            entry_point: entry_point.into(),
            args,
        }
    }
}

/// Result of an entry point invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobOutcome {
    Success { value: JsonValue },
    Failure { error: String },
}

/// Response written by the job runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResponse {
    pub correlation_id: Uuid,
    pub outcome: JobOutcome,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl JobResponse {
    pub fn success(correlation_id: Uuid, value: JsonValue, started_at: DateTime<Utc>) -> Self {
        Self {
            correlation_id,
            outcome: JobOutcome::Success { value },
            started_at,
            completed_at: Utc::now(),
        }
    }

    pub fn failure(correlation_id: Uuid, error: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            correlation_id,
            outcome: JobOutcome::Failure {
                error: error.into(),
            },
            started_at,
            completed_at: Utc::now(),
        }
    }

    pub fn duration_ms(&self) -> i64 {
        (self.completed_at - self.started_at).num_milliseconds()
    }
}

/// Message envelope for versioning and metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> JobEnvelope<T> {
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: JOB_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.protocol_version == JOB_PROTOCOL_VERSION
    }
}
