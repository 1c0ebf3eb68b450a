use std::sync::Arc;
use std::time::Duration;

use srs_mgmt::{
    config::{Config, NodeConfig, NodeState},
    runtime::{ContainerRuntime, MockRuntime},
    store::{keys, MemoryStore, StateStore},
    supervisor::{run_healing_loop, Managed, Supervisor},
};
use tokio::sync::watch;

fn test_config() -> Config {
    Config {
        listen_addr: "0.0.0.0:2022".parse().unwrap(),
        redis_port: 6379,
        redis_password: "secret".to_string(),
        work_dir: "/usr/local/srs-cloud/mgmt".into(),
        dev_mode: false,
        local_release: false,
        nginx_pid_file: None,
        log_level: "info".to_string(),
    }
}

fn test_node() -> NodeState {
    let mut node = NodeConfig::new(
        "TENCENT".to_string(),
        "ap-beijing".to_string(),
        "gitee".to_string(),
        "docker.io".to_string(),
    );
    node.is_darwin = false;
    NodeState::new(node)
}

/// Run one loop iteration: the first healing pass happens before any wait,
/// so signalling shutdown right away still lets it complete.
async fn run_one_pass(
    runtime: Arc<MockRuntime>,
    store: Arc<MemoryStore>,
    which: Managed,
) -> Arc<MockRuntime> {
    let config = test_config();
    let supervisor = Arc::new(Supervisor::new(
        runtime.clone() as Arc<dyn ContainerRuntime>,
        test_node(),
        &config,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(run_healing_loop(
        supervisor,
        store as Arc<dyn StateStore>,
        which,
        shutdown_rx,
    ));
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("healing loop did not stop on shutdown")
        .unwrap();

    runtime
}

#[tokio::test]
async fn healing_loop_restarts_a_stopped_platform() {
    let runtime = Arc::new(MockRuntime::new());
    runtime.insert_stopped("platform", "docker.io/ossrs/srs-cloud:platform-v0.0.9");

    let runtime = run_one_pass(runtime, Arc::new(MemoryStore::new()), Managed::Platform).await;

    assert_eq!(runtime.count("remove", "platform"), 1);
    assert_eq!(runtime.count("start", "platform"), 1);
}

#[tokio::test]
async fn healing_loop_leaves_a_running_container_alone() {
    let runtime = Arc::new(MockRuntime::new());
    runtime.insert_running("redis", "docker.io/ossrs/redis");

    let runtime = run_one_pass(runtime, Arc::new(MemoryStore::new()), Managed::Redis).await;

    assert_eq!(runtime.count("start", "redis"), 0);
}

#[tokio::test]
async fn healing_loop_honors_the_disabled_flag() {
    let runtime = Arc::new(MockRuntime::new());
    runtime.insert_stopped("platform", "docker.io/ossrs/srs-cloud:platform-v0.0.9");

    let store = Arc::new(MemoryStore::new());
    store
        .hset(keys::CONTAINER_DISABLED, "platform", "true")
        .await
        .unwrap();

    let runtime = run_one_pass(runtime, store, Managed::Platform).await;

    assert_eq!(runtime.count("start", "platform"), 0);
}

#[tokio::test]
async fn supervisor_restart_replaces_container_remains() {
    let runtime = Arc::new(MockRuntime::new());
    runtime.insert_stopped("redis", "docker.io/ossrs/redis");

    let config = test_config();
    let supervisor = Supervisor::new(
        runtime.clone() as Arc<dyn ContainerRuntime>,
        test_node(),
        &config,
    );

    supervisor.start_redis().await.unwrap();

    assert_eq!(runtime.count("remove", "redis"), 1);
    assert_eq!(runtime.count("start", "redis"), 1);

    // A second start finds the fresh container and replaces it again.
    supervisor.start_redis().await.unwrap();
    assert_eq!(runtime.count("start", "redis"), 2);
}

#[tokio::test]
async fn supervisor_wait_ready_returns_once_running() {
    let runtime = Arc::new(MockRuntime::new());
    let config = test_config();
    let supervisor = Arc::new(Supervisor::new(
        runtime.clone() as Arc<dyn ContainerRuntime>,
        test_node(),
        &config,
    ));

    let waiter = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.wait_ready("redis", Duration::from_secs(5)).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    runtime.insert_running("redis", "docker.io/ossrs/redis");

    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("wait_ready did not observe the running container")
        .unwrap()
        .unwrap();
}
