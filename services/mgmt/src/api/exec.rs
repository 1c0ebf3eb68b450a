//! Command dispatch endpoint.
//!
//! `POST /terraform/v1/host/exec` carries `{"action", "token", "args"}`.
//! Processing order is fixed: parse the body, verify the token, resolve the
//! action against the closed [`ExecAction`] set, validate the args shape,
//! then run the handler. The platform is the only intended caller; it holds
//! a token signed with the shared secret.

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::auth;
use super::error::{ok_data, ok_empty, ApiError};
use crate::config::os_family;
use crate::runtime::ContainerQuery;
use crate::state::AppState;
use crate::supervisor::SRS_CONTAINER;
use crate::{envfile, nginx, upgrade};

/// Operator commands the endpoint accepts. Adding an action means adding a
/// variant, its wire name, and a handler arm; nothing is looked up by name
/// at runtime beyond this mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecAction {
    Cwd,
    HostPlatform,
    Ipv4,
    FetchContainer,
    RemoveContainer,
    RmContainer,
    QueryContainers,
    StartContainer,
    ReloadNginx,
    ReloadEnv,
    ExecUpgrade,
    QueryVersion,
    RefreshVersion,
    NginxGenerateConfig,
    NginxHlsDelivery,
}

impl ExecAction {
    pub fn parse(name: &str) -> Option<Self> {
        let action = match name {
            "cwd" => Self::Cwd,
            "hostPlatform" => Self::HostPlatform,
            "ipv4" => Self::Ipv4,
            "fetchContainer" => Self::FetchContainer,
            "removeContainer" => Self::RemoveContainer,
            "rmContainer" => Self::RmContainer,
            "queryContainers" => Self::QueryContainers,
            "startContainer" => Self::StartContainer,
            "reloadNginx" => Self::ReloadNginx,
            "reloadEnv" => Self::ReloadEnv,
            "execUpgrade" => Self::ExecUpgrade,
            "queryVersion" => Self::QueryVersion,
            "refreshVersion" => Self::RefreshVersion,
            "nginxGenerateConfig" => Self::NginxGenerateConfig,
            "nginxHlsDelivery" => Self::NginxHlsDelivery,
            _ => return None,
        };
        Some(action)
    }
}

/// The wire request. Args arrive as a loose JSON list; each handler declares
/// the shape it needs through the typed accessors below and anything else is
/// a bad-arguments error.
#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl ExecRequest {
    /// First non-empty string argument, `what` names it in the error.
    fn string_arg(&self, what: &str) -> Result<&str, ApiError> {
        match self.args.iter().find_map(Value::as_str) {
            Some(s) if !s.is_empty() => Ok(s),
            _ => Err(ApiError::bad_arguments(format!("no {what}"))),
        }
    }

    /// All non-empty string arguments.
    fn string_args(&self) -> Vec<&str> {
        self.args
            .iter()
            .filter_map(Value::as_str)
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// First list argument, keeping only its string elements.
    fn list_arg(&self) -> Option<Vec<String>> {
        self.args.iter().find_map(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
    }

    /// First object argument.
    fn map_arg(&self) -> Option<&Map<String, Value>> {
        self.args.iter().find_map(Value::as_object)
    }
}

/// `POST /terraform/v1/host/exec`.
pub async fn exec(State(state): State<AppState>, body: Bytes) -> Response {
    let req: ExecRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(err) => {
            return ApiError::bad_arguments(format!("parse request: {err}")).into_response();
        }
    };

    match dispatch(&state, &req).await {
        Ok(response) => response,
        Err(err) => {
            warn!(action = %req.action, error = %err, "exec failed");
            err.into_response()
        }
    }
}

/// Verify, resolve and run one command.
pub async fn dispatch(state: &AppState, req: &ExecRequest) -> Result<Response, ApiError> {
    auth::verify_token(state.secret(), &req.token)?;

    let action = ExecAction::parse(&req.action)
        .ok_or_else(|| ApiError::bad_arguments(format!("no handler for action={}", req.action)))?;
    info!(action = %req.action, args = ?req.args, "exec");

    match action {
        ExecAction::Cwd => Ok(ok_data(json!({
            "cwd": state.work_dir().display().to_string(),
        }))),

        // The OS family ("darwin", "linux"), not the cloud platform label.
        ExecAction::HostPlatform => Ok(ok_data(json!({"platform": os_family()}))),

        ExecAction::Ipv4 => {
            let node = state.node().snapshot();
            Ok(ok_data(json!({
                "name": node.iface,
                "address": node.ipv4.to_string(),
            })))
        }

        ExecAction::FetchContainer => {
            let name = req.string_arg("name")?;
            let query = state
                .runtime()
                .query(name)
                .await
                .with_context(|| format!("query container {name}"))?;
            Ok(ok_data(json!({
                "all": query.all,
                "running": query.running,
            })))
        }

        ExecAction::RemoveContainer | ExecAction::RmContainer => {
            let name = req.string_arg("name")?;
            remove_existing(state, name).await?;
            Ok(ok_empty())
        }

        ExecAction::QueryContainers => query_containers(state, req).await,

        ExecAction::StartContainer => {
            let name = req.string_arg("name")?;
            let args = req
                .list_arg()
                .ok_or_else(|| ApiError::bad_arguments("no args"))?;

            // A leftover with the same name blocks the new one; removal
            // failure is not fatal because the start will surface it anyway.
            if let Err(err) = remove_existing(state, name).await {
                info!(container = %name, error = %format!("{err:#}"), "ignore remove before start");
            }
            state
                .runtime()
                .start(name, &args)
                .await
                .with_context(|| format!("start container {name}"))?;
            Ok(ok_empty())
        }

        ExecAction::ReloadNginx => {
            state.reloader().reload().await.context("reload nginx")?;
            Ok(ok_empty())
        }

        ExecAction::ReloadEnv => {
            envfile::apply(&state.work_dir().join(".env")).context("load .env")?;
            Ok(ok_empty())
        }

        ExecAction::ExecUpgrade => {
            let target = req.string_arg("target")?;
            upgrade::exec_upgrade(state.work_dir(), target)
                .await
                .with_context(|| format!("upgrade to {target}"))?;
            Ok(ok_empty())
        }

        ExecAction::QueryVersion => Ok(ok_data(json!({
            "version": crate::VERSION.trim_start_matches('v'),
        }))),

        ExecAction::RefreshVersion => {
            let params = req
                .map_arg()
                .ok_or_else(|| ApiError::bad_arguments("no params"))?;
            let versions = state
                .release()
                .refresh_version(params)
                .await
                .context("refresh version")?;
            Ok(ok_data(
                serde_json::to_value(&versions).context("serialize versions")?,
            ))
        }

        ExecAction::NginxGenerateConfig => {
            nginx::generate_config(state.store(), state.work_dir(), state.reloader())
                .await
                .context("generate nginx config")?;
            Ok(ok_empty())
        }

        ExecAction::NginxHlsDelivery => {
            let enabled = match req.string_arg("enabled")? {
                "enable" => true,
                "disable" => false,
                other => {
                    return Err(ApiError::bad_arguments(format!(
                        "invalid hls delivery {other}"
                    )));
                }
            };
            state
                .store()
                .set_hls_delivery(enabled)
                .await
                .context("set hls delivery")?;
            Ok(ok_empty())
        }
    }
}

/// Force-remove a container if it exists. Absent is success.
async fn remove_existing(state: &AppState, name: &str) -> anyhow::Result<()> {
    let query = state
        .runtime()
        .query(name)
        .await
        .with_context(|| format!("query container {name}"))?;
    if query.all.is_some() {
        state
            .runtime()
            .remove(name)
            .await
            .with_context(|| format!("remove container {name}"))?;
    }
    Ok(())
}

/// Report state and enabled flag for a list of containers. Callers use the
/// short name `srs` for the media server; the dev variant is not reachable
/// through this endpoint.
async fn query_containers(state: &AppState, req: &ExecRequest) -> Result<Response, ApiError> {
    let names = req.string_args();
    if names.is_empty() {
        return Err(ApiError::bad_arguments("no name"));
    }

    let mut resolved = Vec::with_capacity(names.len());
    for name in names {
        match name {
            "srs" => resolved.push(SRS_CONTAINER),
            "srsDev" => return Err(ApiError::bad_arguments("srs dev is not supported")),
            other => resolved.push(other),
        }
    }

    let mut containers = Vec::with_capacity(resolved.len());
    for name in resolved {
        let disabled = state
            .store()
            .container_disabled(name)
            .await
            .with_context(|| format!("read disabled flag of {name}"))?;

        // A runtime hiccup on one name should not fail the whole report.
        let query = match state.runtime().query(name).await {
            Ok(query) => query,
            Err(err) => {
                warn!(container = %name, error = %format!("{err:#}"), "query failed, reporting as absent");
                ContainerQuery::default()
            }
        };
        let all = query.all.unwrap_or_default();

        containers.push(json!({
            "name": name,
            "enabled": !disabled,
            "container": {
                "ID": all.id,
                "State": all.state,
                "Status": all.status,
            },
        }));
    }

    Ok(ok_data(json!({"containers": containers})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    use chrono::Duration;
    use tempfile::TempDir;

    use crate::config::{NodeConfig, NodeState};
    use crate::gateway::proxy::ProxyClient;
    use crate::nginx::NginxReloader;
    use crate::release::ReleaseClient;
    use crate::runtime::MockRuntime;
    use crate::state::AppStateInner;
    use crate::store::{keys, MemoryStore, StateStore};

    const SECRET: &str = "srs-v1-0123456789abcdef";

    fn test_node() -> NodeConfig {
        let mut node = NodeConfig::new(
            "DEV".to_string(),
            "ap-beijing".to_string(),
            "gitee".to_string(),
            "registry.cn-hangzhou.aliyuncs.com".to_string(),
        );
        node.iface = "eth0".to_string();
        node.ipv4 = "192.168.3.85".parse().unwrap();
        node
    }

    fn test_state(work_dir: PathBuf) -> (AppState, Arc<MemoryStore>, Arc<MockRuntime>) {
        let mem = Arc::new(MemoryStore::new());
        let mock = Arc::new(MockRuntime::new());
        let state = AppState::new(AppStateInner {
            work_dir,
            secret: SECRET.to_string(),
            node: NodeState::new(test_node()),
            store: mem.clone(),
            runtime: mock.clone(),
            release: ReleaseClient::with_base_url("http://127.0.0.1:9").unwrap(),
            reloader: NginxReloader::with_paths(true, PathBuf::from("/nonexistent"), None),
            proxy: ProxyClient::new().unwrap(),
        });
        (state, mem, mock)
    }

    fn request(action: &str, args: Vec<Value>) -> ExecRequest {
        ExecRequest {
            action: action.to_string(),
            token: auth::sign_token(SECRET, Duration::hours(1)).unwrap(),
            args,
        }
    }

    async fn data_of(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], 0, "expected success envelope, got {body}");
        body["data"].clone()
    }

    #[test]
    fn parses_every_registered_action() {
        let names = [
            "cwd",
            "hostPlatform",
            "ipv4",
            "fetchContainer",
            "removeContainer",
            "rmContainer",
            "queryContainers",
            "startContainer",
            "reloadNginx",
            "reloadEnv",
            "execUpgrade",
            "queryVersion",
            "refreshVersion",
            "nginxGenerateConfig",
            "nginxHlsDelivery",
        ];
        for name in names {
            assert!(ExecAction::parse(name).is_some(), "{name} must resolve");
        }
        assert!(ExecAction::parse("launchMissiles").is_none());
        assert!(ExecAction::parse("").is_none());
    }

    #[tokio::test]
    async fn rejects_bad_token_before_any_side_effect() {
        let dir = TempDir::new().unwrap();
        let (state, _, mock) = test_state(dir.path().to_path_buf());
        mock.insert_running("platform", "ossrs/srs-cloud:platform-v1.0.0");

        let req = ExecRequest {
            action: "removeContainer".to_string(),
            token: auth::sign_token("wrong-secret", Duration::hours(1)).unwrap(),
            args: vec![json!("platform")],
        };

        let err = dispatch(&state, &req).await.unwrap_err();
        assert!(matches!(err, ApiError::BadToken(_)));
        assert!(mock.operations().is_empty(), "no runtime call may happen");
    }

    #[tokio::test]
    async fn unknown_action_names_the_action() {
        let dir = TempDir::new().unwrap();
        let (state, _, _) = test_state(dir.path().to_path_buf());

        let err = dispatch(&state, &request("launchMissiles", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadArguments(_)));
        assert!(err.to_string().contains("launchMissiles"));
    }

    #[tokio::test]
    async fn cwd_reports_work_dir() {
        let dir = TempDir::new().unwrap();
        let (state, _, _) = test_state(dir.path().to_path_buf());

        let response = dispatch(&state, &request("cwd", vec![])).await.unwrap();
        let data = data_of(response).await;
        assert_eq!(data["cwd"], dir.path().display().to_string());
    }

    #[tokio::test]
    async fn host_platform_reports_os_family() {
        let dir = TempDir::new().unwrap();
        let (state, _, _) = test_state(dir.path().to_path_buf());

        let response = dispatch(&state, &request("hostPlatform", vec![]))
            .await
            .unwrap();
        let data = data_of(response).await;
        assert_eq!(data["platform"], os_family());
    }

    #[tokio::test]
    async fn ipv4_reports_current_snapshot() {
        let dir = TempDir::new().unwrap();
        let (state, _, _) = test_state(dir.path().to_path_buf());

        let response = dispatch(&state, &request("ipv4", vec![])).await.unwrap();
        let data = data_of(response).await;
        assert_eq!(data["name"], "eth0");
        assert_eq!(data["address"], "192.168.3.85");
    }

    #[tokio::test]
    async fn fetch_container_requires_name() {
        let dir = TempDir::new().unwrap();
        let (state, _, _) = test_state(dir.path().to_path_buf());

        let err = dispatch(&state, &request("fetchContainer", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadArguments(_)));
        assert!(err.to_string().contains("no name"));
    }

    #[tokio::test]
    async fn fetch_container_reports_both_projections() {
        let dir = TempDir::new().unwrap();
        let (state, _, mock) = test_state(dir.path().to_path_buf());
        mock.insert_running("redis", "redis:5.0");

        let response = dispatch(&state, &request("fetchContainer", vec![json!("redis")]))
            .await
            .unwrap();
        let data = data_of(response).await;
        assert_eq!(data["all"]["Names"], "redis");
        assert_eq!(data["running"]["State"], "running");
    }

    #[tokio::test]
    async fn fetch_container_absent_is_null() {
        let dir = TempDir::new().unwrap();
        let (state, _, _) = test_state(dir.path().to_path_buf());

        let response = dispatch(&state, &request("fetchContainer", vec![json!("ghost")]))
            .await
            .unwrap();
        let data = data_of(response).await;
        assert!(data["all"].is_null());
        assert!(data["running"].is_null());
    }

    #[tokio::test]
    async fn remove_container_is_idempotent_when_absent() {
        let dir = TempDir::new().unwrap();
        let (state, _, mock) = test_state(dir.path().to_path_buf());

        let response = dispatch(&state, &request("removeContainer", vec![json!("ghost")]))
            .await
            .unwrap();
        data_of(response).await;
        assert_eq!(mock.count("remove", "ghost"), 0);
    }

    #[tokio::test]
    async fn remove_container_removes_existing() {
        let dir = TempDir::new().unwrap();
        let (state, _, mock) = test_state(dir.path().to_path_buf());
        mock.insert_stopped("platform", "ossrs/srs-cloud:platform-v1.0.0");

        let response = dispatch(&state, &request("rmContainer", vec![json!("platform")]))
            .await
            .unwrap();
        data_of(response).await;
        assert_eq!(mock.count("remove", "platform"), 1);
    }

    #[tokio::test]
    async fn query_containers_maps_srs_and_reads_disabled_flag() {
        let dir = TempDir::new().unwrap();
        let (state, mem, mock) = test_state(dir.path().to_path_buf());
        mock.insert_running("srs-server", "ossrs/srs:4");
        mem.hset(keys::CONTAINER_DISABLED, "srs-server", "true")
            .await
            .unwrap();

        let response = dispatch(&state, &request("queryContainers", vec![json!("srs")]))
            .await
            .unwrap();
        let data = data_of(response).await;
        let containers = data["containers"].as_array().unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0]["name"], "srs-server");
        assert_eq!(containers[0]["enabled"], false);
        assert_eq!(containers[0]["container"]["State"], "running");
    }

    #[tokio::test]
    async fn query_containers_rejects_dev_variant() {
        let dir = TempDir::new().unwrap();
        let (state, _, _) = test_state(dir.path().to_path_buf());

        let err = dispatch(&state, &request("queryContainers", vec![json!("srsDev")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadArguments(_)));
    }

    #[tokio::test]
    async fn query_containers_tolerates_absent_container() {
        let dir = TempDir::new().unwrap();
        let (state, _, _) = test_state(dir.path().to_path_buf());

        let response = dispatch(&state, &request("queryContainers", vec![json!("platform")]))
            .await
            .unwrap();
        let data = data_of(response).await;
        let containers = data["containers"].as_array().unwrap();
        assert_eq!(containers[0]["enabled"], true);
        assert_eq!(containers[0]["container"]["ID"], "");
    }

    #[tokio::test]
    async fn start_container_requires_arg_list() {
        let dir = TempDir::new().unwrap();
        let (state, _, _) = test_state(dir.path().to_path_buf());

        let err = dispatch(&state, &request("startContainer", vec![json!("my-c")]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no args"));
    }

    #[tokio::test]
    async fn start_container_replaces_existing() {
        let dir = TempDir::new().unwrap();
        let (state, _, mock) = test_state(dir.path().to_path_buf());
        mock.insert_stopped("my-c", "example:v1");

        let args = json!(["run", "-d", "--name", "my-c", "example:v2"]);
        let response = dispatch(
            &state,
            &request("startContainer", vec![json!("my-c"), args]),
        )
        .await
        .unwrap();
        data_of(response).await;
        assert_eq!(mock.count("remove", "my-c"), 1);
        assert_eq!(mock.count("start", "my-c"), 1);
    }

    #[tokio::test]
    async fn reload_env_tolerates_missing_file() {
        let dir = TempDir::new().unwrap();
        let (state, _, _) = test_state(dir.path().to_path_buf());

        let response = dispatch(&state, &request("reloadEnv", vec![])).await.unwrap();
        data_of(response).await;
    }

    #[tokio::test]
    async fn query_version_strips_leading_v() {
        let dir = TempDir::new().unwrap();
        let (state, _, _) = test_state(dir.path().to_path_buf());

        let response = dispatch(&state, &request("queryVersion", vec![]))
            .await
            .unwrap();
        let data = data_of(response).await;
        let version = data["version"].as_str().unwrap();
        assert!(!version.starts_with('v'));
        assert_eq!(format!("v{version}"), crate::VERSION);
    }

    #[tokio::test]
    async fn refresh_version_requires_params_map() {
        let dir = TempDir::new().unwrap();
        let (state, _, _) = test_state(dir.path().to_path_buf());

        let err = dispatch(&state, &request("refreshVersion", vec![]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no params"));
    }

    #[tokio::test]
    async fn hls_delivery_persists_flag() {
        let dir = TempDir::new().unwrap();
        let (state, mem, _) = test_state(dir.path().to_path_buf());

        let response = dispatch(&state, &request("nginxHlsDelivery", vec![json!("enable")]))
            .await
            .unwrap();
        data_of(response).await;
        assert!(mem.hls_delivery().await.unwrap());

        let response = dispatch(&state, &request("nginxHlsDelivery", vec![json!("disable")]))
            .await
            .unwrap();
        data_of(response).await;
        assert!(!mem.hls_delivery().await.unwrap());

        let err = dispatch(&state, &request("nginxHlsDelivery", vec![json!("maybe")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::BadArguments(_)));
    }

    #[tokio::test]
    async fn nginx_generate_config_writes_fragments() {
        let dir = TempDir::new().unwrap();
        let (state, _, _) = test_state(dir.path().to_path_buf());

        let response = dispatch(&state, &request("nginxGenerateConfig", vec![]))
            .await
            .unwrap();
        data_of(response).await;

        let config_dir = dir.path().join("containers/data/config");
        assert!(config_dir.join("nginx.http.conf").exists());
        assert!(config_dir.join("nginx.server.conf").exists());
    }
}
