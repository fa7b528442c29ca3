//! Entry points available to the job runner on a remote host

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt::Display;
use std::process::ExitCode;
use tracing::{debug, error, info};

use crate::error::{IpcError, IpcResult};
use crate::protocol::{JobEnvelope, JobRequest, JobResponse};
use crate::transport::{FileTransport, JobTransport};

type EntryPoint = Box<dyn Fn(JsonValue) -> Result<JsonValue, String> + Send + Sync>;

/// Named entry points, dispatched by the job runner
#[derive(Default)]
pub struct JobRegistry {
    entry_points: HashMap<String, EntryPoint>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function` under `name`; arguments and result travel as JSON
    pub fn register<A, R, E, F>(mut self, name: impl Into<String>, function: F) -> Self
    where
        A: DeserializeOwned,
        R: Serialize,
        E: Display,
        F: Fn(A) -> Result<R, E> + Send + Sync + 'static,
    {
        let name = name.into();
        let entry: EntryPoint = Box::new(move |args: JsonValue| {
            let args: A = serde_json::from_value(args)
                .map_err(|e| format!("invalid arguments: {}", e))?;
            let result = function(args).map_err(|e| e.to_string())?;
            serde_json::to_value(result).map_err(|e| format!("unserializable result: {}", e))
        });
        self.entry_points.insert(name, entry);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entry_points.contains_key(name)
    }

    pub fn entry_point_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entry_points.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the requested entry point; failures become a failure outcome
    pub fn handle(&self, request: &JobRequest) -> JobResponse {
        let started_at = Utc::now();
        let Some(entry) = self.entry_points.get(&request.entry_point) else {
            return JobResponse::failure(
                request.correlation_id,
                IpcError::UnknownEntryPoint(request.entry_point.clone()).to_string(),
                started_at,
            );
        };

        debug!("Invoking entry point {}", request.entry_point);
        match entry(request.args.clone()) {
            Ok(value) => JobResponse::success(request.correlation_id, value, started_at),
            Err(message) => JobResponse::failure(request.correlation_id, message, started_at),
        }
    }

    /// Read a request envelope from `request_path` and write the response to `response_path`
    pub async fn serve_files(&self, request_path: &str, response_path: &str) -> IpcResult<JobResponse> {
        let request: JobEnvelope<JobRequest> = FileTransport::new(request_path).receive().await?;
        let response = self.handle(&request.message);
        FileTransport::new(response_path)
            .send(&JobEnvelope::new(response.clone()))
            .await?;
        info!(
            "Entry point {} finished in {} ms",
            request.message.entry_point,
            response.duration_ms()
        );
        Ok(response)
    }

    /// Runner main: `<runner> <request file> <response file>`.
    ///
    /// A failing entry point still exits successfully; its error is part of
    /// the response. Only protocol and I/O problems produce a failure code.
    pub async fn serve_from_args(&self) -> ExitCode {
        let args: Vec<String> = std::env::args().skip(1).collect();
        let result = match args.as_slice() {
            [request, response] => self.serve_files(request, response).await.map(|_| ()),
            _ => Err(IpcError::InvalidArguments(format!(
                "expected <request file> <response file>, got {} argument(s)",
                args.len()
            ))),
        };

        match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Job runner failed: {}", e);
                eprintln!("{}", e);
                ExitCode::FAILURE
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JobOutcome;
    use serde_json::json;

    fn registry() -> JobRegistry {
        JobRegistry::new()
            .register("sum", |values: Vec<i64>| Ok::<_, String>(values.iter().sum::<i64>()))
            .register("fail", |_: JsonValue| Err::<JsonValue, _>("always fails"))
    }

    #[test]
    fn test_dispatch_success() {
        let response = registry().handle(&JobRequest::new("sum", json!([1, 2, 3])));
        assert_eq!(response.outcome, JobOutcome::Success { value: json!(6) });
    }

    #[test]
    fn test_entry_point_error() {
        let response = registry().handle(&JobRequest::new("fail", json!(null)));
        assert_eq!(
            response.outcome,
            JobOutcome::Failure {
                error: "always fails".into()
            }
        );
    }

    #[test]
    fn test_unknown_entry_point_and_bad_args() {
        let registry = registry();
        let unknown = registry.handle(&JobRequest::new("missing", json!(null)));
        assert!(matches!(unknown.outcome, JobOutcome::Failure { error } if error.contains("missing")));

        let bad_args = registry.handle(&JobRequest::new("sum", json!("nope")));
        assert!(matches!(bad_args.outcome, JobOutcome::Failure { error } if error.contains("invalid arguments")));
    }

    #[tokio::test]
    async fn test_serve_files() {
        let dir = tempfile::tempdir().unwrap();
        let request_path = dir.path().join("req.json");
        let response_path = dir.path().join("resp.json");
        FileTransport::new(&request_path)
            .send(&JobEnvelope::new(JobRequest::new("sum", json!([4, 5]))))
            .await
            .unwrap();

        registry()
            .serve_files(request_path.to_str().unwrap(), response_path.to_str().unwrap())
            .await
            .unwrap();

        let response: JobEnvelope<JobResponse> =
            FileTransport::new(&response_path).receive().await.unwrap();
        assert_eq!(response.message.outcome, JobOutcome::Success { value: json!(9) });
    }

    #[test]
    fn test_entry_point_names_sorted() {
        assert_eq!(registry().entry_point_names(), vec!["fail", "sum"]);
    }
}
