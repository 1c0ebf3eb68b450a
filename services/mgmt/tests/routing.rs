use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;

use srs_mgmt::{
    api,
    config::{NodeConfig, NodeState},
    gateway::proxy::ProxyClient,
    nginx::NginxReloader,
    release::ReleaseClient,
    runtime::MockRuntime,
    state::{AppState, AppStateInner},
    store::MemoryStore,
};
use tempfile::TempDir;
use tokio::net::TcpListener;

struct GatewayFixture {
    base_url: String,
    _work_dir: TempDir,
}

/// Serve the gateway over a real listener with a populated www tree.
async fn start_gateway() -> GatewayFixture {
    let work_dir = TempDir::new().unwrap();

    let www = work_dir.path().join("containers/www");
    for (path, content) in [
        ("console/index.html", "<html>console</html>"),
        ("console/player.html", "<html>player</html>"),
        ("tools/player.html", "<html>tools player</html>"),
        ("players/app.js", "console.log('players');"),
    ] {
        let file = www.join(path);
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, content).unwrap();
    }

    let mut node = NodeConfig::new(
        "DEV".to_string(),
        "ap-beijing".to_string(),
        "gitee".to_string(),
        "docker.io".to_string(),
    );
    node.iface = "eth0".to_string();
    node.ipv4 = IpAddr::V4(Ipv4Addr::new(192, 168, 3, 85));

    let state = AppState::new(AppStateInner {
        work_dir: work_dir.path().to_path_buf(),
        secret: "srs-v1-gateway-secret".to_string(),
        node: NodeState::new(node),
        store: Arc::new(MemoryStore::new()),
        runtime: Arc::new(MockRuntime::new()),
        release: ReleaseClient::with_base_url("http://127.0.0.1:9").unwrap(),
        reloader: NginxReloader::with_paths(true, PathBuf::from("/nonexistent"), None),
        proxy: ProxyClient::new().unwrap(),
    });
    let app = api::create_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base_url = format!("http://{addr}");

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    GatewayFixture {
        base_url,
        _work_dir: work_dir,
    }
}

#[tokio::test]
async fn console_assets_carry_a_year_of_cache() {
    let fixture = start_gateway().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/console/index.html", fixture.base_url))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(
        resp.headers()
            .get("cache-control")
            .and_then(|v| v.to_str().ok()),
        Some("public, max-age=31536000")
    );
    assert_eq!(resp.text().await.unwrap(), "<html>console</html>");
}

#[tokio::test]
async fn player_entry_points_are_never_cached() {
    let fixture = start_gateway().await;
    let client = reqwest::Client::new();

    for path in ["/console/player.html", "/tools/player.html"] {
        let resp = client
            .get(format!("{}{path}", fixture.base_url))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), reqwest::StatusCode::OK, "path: {path}");
        assert!(
            resp.headers().get("cache-control").is_none(),
            "path: {path}"
        );
    }
}

#[tokio::test]
async fn players_prefix_serves_static_files() {
    let fixture = start_gateway().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/players/app.js", fixture.base_url))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "console.log('players');");
}

#[tokio::test]
async fn missing_static_file_is_not_found() {
    let fixture = start_gateway().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/console/missing.js", fixture.base_url))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unmatched_paths_answer_hello() {
    let fixture = start_gateway().await;
    let client = reqwest::Client::new();

    for path in ["/", "/favicon.ico", "/index.html"] {
        let resp = client
            .get(format!("{}{path}", fixture.base_url))
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), reqwest::StatusCode::OK, "path: {path}");
        assert_eq!(resp.text().await.unwrap(), "Hello world!", "path: {path}");
    }
}
