use super::*;
use crate::config::{AccountConfig, ApiConfig, LoggingConfig, PresenceConfig};
use contactsd_api::{DevicePresenceSignal, DevicePresenceSnapshot, PresenceType};
use contactsd_core::config::RetryPolicy;
use http_body_util::BodyExt;
use hyper::client::conn::http1 as client_http1;
use hyper::server::conn::http1 as server_http1;
use serde::de::DeserializeOwned;
use tempfile::tempdir;
use tokio::io::duplex;

fn account(path: &str, presence: PresenceType, enabled: bool) -> AccountConfig {
    AccountConfig {
        path: path.to_string(),
        uri: format!("{}@example.org", path),
        service_provider: "jabber".to_string(),
        service_provider_display_name: "Jabber".to_string(),
        display_name: path.to_string(),
        icon_path: String::new(),
        enabled,
        presence,
        presence_message: String::new(),
        contacts_to_avoid: Vec::new(),
    }
}

fn test_config(data_dir: PathBuf) -> DaemonConfig {
    DaemonConfig {
        data_dir,
        logging: LoggingConfig {
            level: "error".to_string(),
        },
        presence: PresenceConfig::default(),
        retry: RetryPolicy::default(),
        disconnect_grace_ms: 0,
        api: ApiConfig {
            bind_addr: "127.0.0.1:0".to_string(),
        },
        accounts: vec![
            account("acct/a", PresenceType::Away, true),
            account("acct/b", PresenceType::Available, true),
            account("acct/c", PresenceType::Available, false),
        ],
    }
}

#[tokio::test]
async fn config_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("contactsd.toml");
    let cfg = format!(
        r#"
data_dir = "{dir}"
disconnect_grace_ms = 5000

[logging]
level = "debug"

[presence]
order = ["available", "busy", "away", "offline"]

[retry]
max_attempts = 3

[api]
bind_addr = "127.0.0.1:9999"

[[accounts]]
path = "gabble/jabber/alice0"
uri = "alice@example.org"
service_provider = "jabber"
contacts_to_avoid = ["spam@example.org"]

[[accounts]]
path = "gabble/jabber/alice1"
uri = "alice@work.example.org"
service_provider = "jabber"
enabled = false
presence = "extended-away"
"#,
        dir = dir.path().display()
    );
    std::fs::write(&path, cfg).unwrap();
    let loaded = config::load_config(&path).unwrap();
    assert_eq!(loaded.logging.level, "debug");
    assert_eq!(loaded.presence.order[1], PresenceType::Busy);
    assert_eq!(loaded.retry.max_attempts, 3);
    assert_eq!(loaded.retry.backoff_initial_ms, RetryPolicy::default().backoff_initial_ms);
    assert_eq!(loaded.accounts.len(), 2);
    assert!(loaded.accounts[0].enabled);
    assert!(!loaded.accounts[1].enabled);
    assert_eq!(loaded.accounts[1].presence, PresenceType::ExtendedAway);

    let core = loaded.core_config();
    assert_eq!(core.cache_dir, dir.path().join("cache"));
    assert_eq!(core.feature_retry.max_attempts, 3);
    assert_eq!(core.disconnect_grace_ms, 5000);
    assert_eq!(loaded.accounts[0].contacts_to_avoid, vec!["spam@example.org"]);
    assert!(loaded.accounts[1].contacts_to_avoid.is_empty());
}

#[test]
fn validation_rejects_bad_configs() {
    let dir = tempdir().unwrap();
    let mut cfg = test_config(dir.path().to_path_buf());
    assert!(cfg.validate().is_ok());

    cfg.accounts.push(account("acct/a", PresenceType::Away, true));
    assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    cfg.accounts.pop();

    cfg.accounts.push(account("bad!path", PresenceType::Away, true));
    assert!(cfg.validate().is_err());
    cfg.accounts.pop();

    cfg.presence.order = Vec::new();
    assert!(cfg.validate().is_err());
    cfg.presence = PresenceConfig::default();

    cfg.api.bind_addr = "not an address".to_string();
    assert!(cfg.validate().is_err());
}

#[test]
fn unknown_keys_fail_to_parse() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("contactsd.toml");
    std::fs::write(&path, "data_dir = \"/tmp\"\nsurprise = 1\n").unwrap();
    assert!(matches!(config::load_config(&path), Err(ConfigError::Parse)));
    assert!(matches!(
        config::load_config(&dir.path().join("missing.toml")),
        Err(ConfigError::Io)
    ));
}

#[tokio::test]
async fn daemon_starts_and_stops() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path().to_path_buf());
    init_logging(&cfg);
    let state = build_state(&cfg).await.unwrap();
    let (tx, rx) = oneshot::channel();
    let (_addr, handle) =
        start_control_server(state.clone(), cfg.api.socket_addr().unwrap(), rx).await;
    let _ = tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    state.core.shutdown().await;
}

#[tokio::test]
async fn presence_endpoints_report_aggregate() {
    let dir = tempdir().unwrap();
    let cfg = test_config(dir.path().to_path_buf());
    let state = build_state(&cfg).await.unwrap();

    let health: ApiResponse<HealthStatus> =
        decode(send_in_memory_request(state.clone(), build_request("GET", "/health")).await).await;
    assert_eq!(health.data.unwrap().accounts, 3);

    let mut snapshot = DevicePresenceSnapshot::default();
    for _ in 0..100 {
        let response: ApiResponse<DevicePresenceSnapshot> =
            decode(send_in_memory_request(state.clone(), build_request("GET", "/presence")).await)
                .await;
        snapshot = response.data.unwrap();
        if snapshot.accounts.len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(snapshot.accounts.len(), 3);
    assert_eq!(snapshot.global_presence_state, PresenceType::Available);

    let signals: ApiResponse<Vec<DevicePresenceSignal>> = decode(
        send_in_memory_request(state.clone(), build_request("POST", "/presence/request-update"))
            .await,
    )
    .await;
    let signals = signals.data.unwrap();
    assert_eq!(signals.len(), 5);
    assert!(matches!(signals[0], DevicePresenceSignal::AccountList { .. }));

    let missing = send_in_memory_request(state.clone(), build_request("GET", "/nope")).await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    let missing: ApiResponse<()> = decode(missing).await;
    assert_eq!(missing.error.unwrap().code, "not_found");
    state.core.shutdown().await;
}

fn build_request(method: &str, path: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(method)
        .uri(path)
        .header("host", "localhost")
        .body(Full::from(Bytes::new()))
        .unwrap()
}

async fn decode<T: DeserializeOwned>(resp: Response<Incoming>) -> ApiResponse<T> {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn send_in_memory_request(state: DaemonState, req: Request<Full<Bytes>>) -> Response<Incoming> {
    let (client, server) = duplex(4096);
    let service = service_fn(move |incoming: Request<Incoming>| {
        let inner = state.clone();
        async move { handle_request(inner, incoming).await }
    });
    let server_task = tokio::spawn(async move {
        let io = TokioIo::new(server);
        let _ = server_http1::Builder::new().serve_connection(io, service).await;
    });
    let io = TokioIo::new(client);
    let (mut sender, connection) = client_http1::handshake(io).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    let response = sender.send_request(req).await.unwrap();
    drop(sender);
    let _ = server_task.await;
    response
}
