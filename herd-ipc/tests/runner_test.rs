use herd_ipc::{FileTransport, JobEnvelope, JobOutcome, JobRequest, JobResponse, JobTransport};
use serde_json::json;
use std::process::Command;

#[tokio::test]
async fn test_stock_runner_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let request_path = dir.path().join("request.json");
    let response_path = dir.path().join("response.json");

    FileTransport::new(&request_path)
        .send(&JobEnvelope::new(JobRequest::new("sum", json!([1.5, 2.5]))))
        .await
        .unwrap();

    let status = Command::new(env!("CARGO_BIN_EXE_herd-job"))
        .arg(&request_path)
        .arg(&response_path)
        .status()
        .unwrap();
    assert!(status.success());

    let response: JobEnvelope<JobResponse> =
        FileTransport::new(&response_path).receive().await.unwrap();
    assert_eq!(response.message.outcome, JobOutcome::Success { value: json!(4.0) });
}

#[test]
fn test_stock_runner_rejects_missing_arguments() {
    let status = Command::new(env!("CARGO_BIN_EXE_herd-job"))
        .status()
        .unwrap();
    assert!(!status.success());
}
