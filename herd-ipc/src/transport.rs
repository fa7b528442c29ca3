//! Transports for job envelopes

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::{IpcError, IpcResult};
use crate::protocol::{JobEnvelope, JOB_PROTOCOL_VERSION};

/// Transport that moves a single envelope between both ends
#[async_trait]
pub trait JobTransport: Send + Sync {
    async fn send<T: Serialize + Send + Sync>(&self, message: &JobEnvelope<T>) -> IpcResult<()>;

    async fn receive<T: DeserializeOwned + Send>(&self) -> IpcResult<JobEnvelope<T>>;
}

/// Envelope stored as a JSON file; the file is moved by the session layer
#[derive(Debug, Clone)]
pub struct FileTransport {
    path: PathBuf,
}

impl FileTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl JobTransport for FileTransport {
    async fn send<T: Serialize + Send + Sync>(&self, message: &JobEnvelope<T>) -> IpcResult<()> {
        let bytes = encode(message)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }

    async fn receive<T: DeserializeOwned + Send>(&self) -> IpcResult<JobEnvelope<T>> {
        let bytes = tokio::fs::read(&self.path).await?;
        decode(&bytes)
    }
}

/// Serialize an envelope
pub fn encode<T: Serialize>(message: &JobEnvelope<T>) -> IpcResult<Vec<u8>> {
    serde_json::to_vec(message).map_err(|e| IpcError::SerializationError(e.to_string()))
}

/// Deserialize an envelope, rejecting other protocol versions
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> IpcResult<JobEnvelope<T>> {
    let envelope: JobEnvelope<T> = serde_json::from_slice(bytes)?;
    if !envelope.is_compatible() {
        return Err(IpcError::ProtocolVersionMismatch {
            expected: JOB_PROTOCOL_VERSION,
            actual: envelope.protocol_version,
        });
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JobRequest;
    use serde_json::json;

    #[tokio::test]
    async fn test_file_transport() {
        let dir = tempfile::tempdir().unwrap();
        let transport = FileTransport::new(dir.path().join("request.json"));
        let request = JobRequest::new("sum", json!([1, 2, 3]));

        transport.send(&JobEnvelope::new(request.clone())).await.unwrap();
        let received: JobEnvelope<JobRequest> = transport.receive().await.unwrap();
        assert_eq!(received.message, request);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let raw = json!({
            "protocol_version": 99,
            "timestamp": "2024-01-01T00:00:00Z",
            "message": {"correlation_id": uuid::Uuid::new_v4(), "entry_point": "x", "args": null}
        });
        let result = decode::<JobRequest>(raw.to_string().as_bytes());
        assert!(matches!(
            result,
            Err(IpcError::ProtocolVersionMismatch { expected: 1, actual: 99 })
        ));
    }

    #[test]
    fn test_garbage_is_deserialization_error() {
        let result = decode::<JobRequest>(b"not json");
        assert!(matches!(result, Err(IpcError::DeserializationError(_))));
    }
}
