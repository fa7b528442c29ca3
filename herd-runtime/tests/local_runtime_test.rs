//! Runtimes and groups backed by sessions on the control node

use herd_config::HerdConfig;
use herd_core::{local_port_is_free, HerdError};
use herd_runtime::{ExecuteOptions, Runtime, RuntimeGroup, RuntimeTask, TaskTarget};
use herd_session::LocalSession;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

fn config_with_logs(log_dir: &std::path::Path) -> Arc<HerdConfig> {
    let mut config = HerdConfig::default();
    config.logging.log_directory = log_dir.to_path_buf();
    config.runtime.tunnel_settle_delay = Duration::from_millis(20);
    Arc::new(config)
}

async fn local_runtime(host: &str, config: &Arc<HerdConfig>) -> Runtime {
    Runtime::connect(Arc::new(LocalSession::named(host)), None, Arc::clone(config))
        .await
        .unwrap()
}

#[tokio::test]
async fn free_port_is_verified_free() {
    let logs = tempfile::tempdir().unwrap();
    let config = config_with_logs(logs.path());
    let mut runtime = local_runtime("node-1", &config).await;

    let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
    let busy = occupied.local_addr().unwrap().port();
    let candidates: Vec<u16> = vec![busy, 41_871, 41_872, 41_873];

    let port = runtime.get_free_port(&candidates).await.unwrap();
    assert_ne!(port, busy);
    assert!(candidates.contains(&port));
    assert!(local_port_is_free(port).await);

    assert!(matches!(
        runtime.get_free_port(&[busy]).await,
        Err(HerdError::NoPortsLeft)
    ));
    runtime.cleanup().await.unwrap();
}

#[tokio::test]
async fn task_log_matches_steps_and_is_persisted() {
    let logs = tempfile::tempdir().unwrap();
    let config = config_with_logs(logs.path());
    let mut runtime = local_runtime("node-1", &config).await;

    let task = RuntimeTask::new("letters")
        .run_command("echo a")
        .unwrap()
        .run_command("echo b")
        .unwrap();
    runtime.execute_task(&task, ExecuteOptions::sync()).await.unwrap();

    assert_eq!(task.execution_log(), vec!["a".to_string(), "b".to_string()]);
    let log_file = task.log_file_path().unwrap();
    assert!(log_file.starts_with(config.logging.execution_log_directory().join("node-1")));
    let content = std::fs::read_to_string(log_file).unwrap();
    assert!(content.contains("echo b"));
    runtime.cleanup().await.unwrap();
}

#[tokio::test]
async fn working_dir_variable_is_visible_to_tasks() {
    let logs = tempfile::tempdir().unwrap();
    let config = config_with_logs(logs.path());
    let mut runtime = local_runtime("node-1", &config).await;

    let task = RuntimeTask::new("where").run_command("echo $WORKING_DIR").unwrap();
    runtime
        .execute_task(&task, ExecuteOptions::sync().stream_output(true))
        .await
        .unwrap();
    assert_eq!(task.execution_log(), vec![runtime.working_dir().to_string()]);
    assert!(task.log_file_path().is_none());
    runtime.cleanup().await.unwrap();
}

#[tokio::test]
async fn background_task_can_be_stopped() {
    let logs = tempfile::tempdir().unwrap();
    let config = config_with_logs(logs.path());
    let mut runtime = local_runtime("node-1", &config).await;

    let task = RuntimeTask::new("forever").run_command("sleep 60").unwrap();
    runtime.execute_task(&task, ExecuteOptions::background()).await.unwrap();
    let key = task.process_key().unwrap();
    assert!(key.is_task());
    assert_eq!(runtime.alive_task_process_count(), 1);

    runtime.stop_process(&key).await.unwrap();
    assert_eq!(runtime.alive_task_process_count(), 0);
    assert!(matches!(
        runtime.stop_process(&key).await,
        Err(HerdError::UnknownProcess(_))
    ));

    // A stopped task no longer blocks joins
    tokio::time::timeout(Duration::from_secs(5), task.join())
        .await
        .unwrap()
        .unwrap();
    runtime.cleanup().await.unwrap();
}

#[tokio::test]
async fn group_send_file_reaches_every_member() {
    let logs = tempfile::tempdir().unwrap();
    let config = config_with_logs(logs.path());
    let runtimes = vec![
        local_runtime("node-1", &config).await,
        local_runtime("node-2", &config).await,
    ];
    let mut group = RuntimeGroup::new(runtimes).unwrap();

    let local = tempfile::tempdir().unwrap();
    let source = local.path().join("shared.txt");
    std::fs::write(&source, "shared").unwrap();
    group.send_file(&source, None).await.unwrap();

    for runtime in group.runtimes() {
        let copied = std::path::Path::new(runtime.working_dir()).join("shared.txt");
        assert_eq!(std::fs::read_to_string(copied).unwrap(), "shared");
    }

    let tasks = group
        .execute_task(
            &RuntimeTask::new("read").run_command("cat shared.txt").unwrap(),
            TaskTarget::Broadcast,
            ExecuteOptions::background(),
        )
        .await
        .unwrap()
        .into_tasks();
    group.join().await.unwrap();
    assert!(tasks.iter().all(|t| t.execution_log() == vec!["shared".to_string()]));

    let dirs: Vec<String> = group.runtimes().iter().map(|r| r.working_dir().to_string()).collect();
    group.cleanup().await.unwrap();
    group.cleanup().await.unwrap();
    assert!(dirs.iter().all(|d| !std::path::Path::new(d).exists()));
}

#[tokio::test]
async fn directory_is_sent_and_fetched_as_a_whole() {
    let logs = tempfile::tempdir().unwrap();
    let config = config_with_logs(logs.path());
    let mut runtime = local_runtime("node-1", &config).await;

    let local = tempfile::tempdir().unwrap();
    let source = local.path().join("bundle");
    std::fs::create_dir_all(source.join("conf")).unwrap();
    std::fs::write(source.join("main.sh"), "echo main").unwrap();
    std::fs::write(source.join("conf/app.yaml"), "level: debug").unwrap();

    // Without a remote path the directory lands under its own name
    runtime.send_file(&source, None).await.unwrap();
    let task = RuntimeTask::new("list")
        .run_command("cat bundle/conf/app.yaml")
        .unwrap();
    runtime.execute_task(&task, ExecuteOptions::sync()).await.unwrap();
    assert_eq!(task.execution_log(), vec!["level: debug".to_string()]);

    let back = local.path().join("fetched");
    runtime.get_file("bundle", &back).await.unwrap();
    assert_eq!(std::fs::read_to_string(back.join("main.sh")).unwrap(), "echo main");
    assert_eq!(
        std::fs::read_to_string(back.join("conf/app.yaml")).unwrap(),
        "level: debug"
    );
    runtime.cleanup().await.unwrap();
}
