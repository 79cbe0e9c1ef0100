//! Drives a `Manager` against a fake proxy server: a datagram socket bound
//! at the server's control path. The launched binary is `true`, which exits
//! immediately and never touches the socket.

use serde_json::Value;
use ssmanager::config::ManagerConfig;
use ssmanager::instance::ProxyConfig;
use ssmanager::supervisor::state_machine::State;
use ssmanager::{Manager, ManagerError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UnixDatagram;

const WAIT: Duration = Duration::from_secs(5);

fn test_config(dir: &Path) -> ManagerConfig {
    ManagerConfig {
        manager_address: dir.join("manager.sock"),
        client_address: dir.join("manager-client.sock"),
        ss_bin: PathBuf::from("true"),
        print_ss_log: false,
        ..ManagerConfig::default()
    }
}

struct FakeServer {
    socket: UnixDatagram,
    client_path: PathBuf,
}

impl FakeServer {
    fn bind(config: &ManagerConfig) -> Self {
        Self {
            socket: UnixDatagram::bind(&config.manager_address).unwrap(),
            client_path: config.client_address.clone(),
        }
    }

    async fn expect_frame(&self) -> String {
        let mut buf = vec![0u8; 2048];
        let len = tokio::time::timeout(WAIT, self.socket.recv(&mut buf))
            .await
            .expect("no frame from manager")
            .unwrap();
        String::from_utf8(buf[..len].to_vec()).unwrap()
    }

    async fn send(&self, frame: &[u8]) {
        self.socket.send_to(frame, &self.client_path).await.unwrap();
    }

    /// Receive the handshake and acknowledge it.
    async fn accept_handshake(&self) {
        assert_eq!(self.expect_frame().await, r#"remove: {"server":"127.0.1.2"}"#);
        self.send(b"ok").await;
    }
}

/// Start `manager` with the fake server appearing after `delay`.
async fn start_with_server(manager: &Arc<Manager>, delay: Duration) -> FakeServer {
    let starting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.start().await })
    };
    tokio::time::sleep(delay).await;
    let server = FakeServer::bind(manager.config());
    server.accept_handshake().await;
    tokio::time::timeout(WAIT, starting)
        .await
        .expect("start did not finish")
        .unwrap()
        .unwrap();
    server
}

async fn wait_for_traffic(manager: &Manager, port: u16, expected: u64) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while manager.traffic(port).unwrap() != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "traffic on {} stuck at {}",
            port,
            manager.traffic(port).unwrap()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn frame_body(frame: &str, verb: &str) -> Value {
    let body = frame
        .strip_prefix(&format!("{}: ", verb))
        .unwrap_or_else(|| panic!("expected {} frame, got {:?}", verb, frame));
    serde_json::from_str(body).unwrap()
}

#[tokio::test]
async fn test_end_to_end_lifecycle_and_traffic() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let manager = Arc::new(Manager::new(config.clone()));

    let mut proxy = ProxyConfig::new(8388, "secret");
    proxy.auth = true;
    manager.add_instance("0.0.0.0", proxy).unwrap();

    // first two attempts (after 10ms and 110ms) find no endpoint
    let server = start_with_server(&manager, Duration::from_millis(200)).await;
    assert!(manager.is_running());

    let starting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.start_instance(8388).await })
    };
    let body = frame_body(&server.expect_frame().await, "add");
    assert_eq!(body["server_port"], 8388);
    assert_eq!(body["password"], "secret");
    assert_eq!(body["one_time_auth"], true);
    assert!(body.get("auth").is_none());

    // the call must still be blocked on the ack
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!starting.is_finished());

    server.send(b"ok").await;
    starting.await.unwrap().unwrap();
    let instance = manager.instance(8388).unwrap();
    assert!(instance.is_running());
    assert_eq!(instance.state().unwrap(), State::Running);

    server.send(br#"stat:{"8388": 100}"#).await;
    wait_for_traffic(&manager, 8388, 100).await;

    server.send(br#"stat:{"9999": 50}"#).await;
    server.send(b"hello: {}").await;
    server.send(b"stat: {broken").await;
    server.send(br#"stat:{"8388": 1}"#).await;
    wait_for_traffic(&manager, 8388, 101).await;
    assert!(manager.instance(9999).is_err());
    assert_eq!(manager.instances().unwrap().len(), 1);

    let stopping = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.stop_instance(8388).await })
    };
    assert_eq!(server.expect_frame().await, r#"remove: {"server_port":8388}"#);
    server.send(b"ok").await;
    stopping.await.unwrap().unwrap();
    assert!(!instance.is_running());
    assert_eq!(instance.state().unwrap(), State::Stopped);
    assert_eq!(instance.traffic(), 101);

    manager.stop().await;
    assert!(!manager.is_running());
    assert!(!config.manager_address.exists());
    assert!(!config.client_address.exists());
    manager.stop().await;
}

#[tokio::test]
async fn test_unreachable_server_aborts_start() {
    let dir = TempDir::new().unwrap();
    let config = ManagerConfig {
        connect_backoff_ms: vec![1, 1, 1],
        ..test_config(dir.path())
    };
    let manager = Manager::new(config.clone());

    match manager.start().await {
        Err(ManagerError::ControlChannelUnreachable { attempts, path }) => {
            assert_eq!(attempts, 3);
            assert_eq!(path, config.manager_address);
        }
        other => panic!("expected ControlChannelUnreachable, got {:?}", other),
    }
    assert!(!manager.is_running());
    assert!(!config.client_address.exists());

    manager.stop().await;
}

#[tokio::test]
async fn test_unacknowledged_handshake_times_out() {
    let dir = TempDir::new().unwrap();
    let config = ManagerConfig {
        ack_timeout_ms: 200,
        ..test_config(dir.path())
    };
    // server is up before the manager starts, but never answers
    let server = FakeServer::bind(&config);
    let manager = Manager::new(config.clone());

    let err = manager.start().await.unwrap_err();
    assert!(matches!(err, ManagerError::CommandTimedOut { verb: "remove", .. }));
    assert_eq!(server.expect_frame().await, r#"remove: {"server":"127.0.1.2"}"#);
    assert!(!manager.is_running());
    assert!(!config.client_address.exists());
}

#[tokio::test]
async fn test_timed_out_start_rolls_back_and_late_ack_is_absorbed() {
    let dir = TempDir::new().unwrap();
    let config = ManagerConfig {
        ack_timeout_ms: 300,
        ..test_config(dir.path())
    };
    let manager = Arc::new(Manager::new(config));
    manager.add_instance("0.0.0.0", ProxyConfig::new(8388, "pw")).unwrap();
    let server = start_with_server(&manager, Duration::ZERO).await;

    let err = manager.start_instance(8388).await.unwrap_err();
    assert_eq!(err.error_code(), "COMMAND_TIMED_OUT");
    frame_body(&server.expect_frame().await, "add");
    let instance = manager.instance(8388).unwrap();
    assert!(!instance.is_running());
    assert_eq!(instance.state().unwrap(), State::Stopped);

    // late ok for the abandoned add
    server.send(b"ok").await;

    let retry = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.start_instance(8388).await })
    };
    frame_body(&server.expect_frame().await, "add");
    server.send(b"ok").await;
    retry.await.unwrap().unwrap();
    assert!(instance.is_running());

    manager.stop().await;
    // the process is gone, so every listener is gone with it
    assert!(!instance.is_running());
    assert_eq!(instance.state().unwrap(), State::Stopped);
}

#[tokio::test]
async fn test_overlapping_commands_from_concurrent_callers() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(Manager::new(test_config(dir.path())));
    for port in [8388u16, 8389] {
        manager.add_instance("0.0.0.0", ProxyConfig::new(port, "pw")).unwrap();
    }
    let server = start_with_server(&manager, Duration::ZERO).await;

    let calls: Vec<_> = [8388u16, 8389]
        .into_iter()
        .map(|port| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.start_instance(port).await })
        })
        .collect();

    let mut ports = Vec::new();
    for _ in 0..2 {
        let body = frame_body(&server.expect_frame().await, "add");
        ports.push(body["server_port"].as_u64().unwrap());
    }
    ports.sort();
    assert_eq!(ports, vec![8388, 8389]);

    server.send(b"ok").await;
    server.send(b"ok").await;
    for call in calls {
        call.await.unwrap().unwrap();
    }
    assert!(manager.instances().unwrap().iter().all(|i| i.is_running()));

    manager.stop().await;
}

#[tokio::test]
async fn test_double_start_and_remove_running_instance() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(Manager::new(test_config(dir.path())));
    manager.add_instance("0.0.0.0", ProxyConfig::new(8388, "pw")).unwrap();
    let server = start_with_server(&manager, Duration::ZERO).await;

    assert!(matches!(manager.start().await, Err(ManagerError::AlreadyStarted)));

    let starting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.start_instance(8388).await })
    };
    frame_body(&server.expect_frame().await, "add");
    server.send(b"ok").await;
    starting.await.unwrap().unwrap();

    // starting a running instance is rejected without sending anything
    let err = manager.start_instance(8388).await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_TRANSITION");

    let removing = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.remove_instance(8388).await })
    };
    assert_eq!(server.expect_frame().await, r#"remove: {"server_port":8388}"#);
    server.send(b"ok").await;
    let removed = removing.await.unwrap().unwrap();
    assert!(!removed.is_running());
    assert!(manager.instances().unwrap().is_empty());

    manager.stop().await;
}

#[tokio::test]
async fn test_manager_stop_during_pending_stop_instance() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(Manager::new(test_config(dir.path())));
    manager.add_instance("0.0.0.0", ProxyConfig::new(8388, "pw")).unwrap();
    let server = start_with_server(&manager, Duration::ZERO).await;

    let starting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.start_instance(8388).await })
    };
    frame_body(&server.expect_frame().await, "add");
    server.send(b"ok").await;
    starting.await.unwrap().unwrap();

    // the remove is never acknowledged; the manager shuts down underneath it
    let stopping = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.stop_instance(8388).await })
    };
    assert_eq!(server.expect_frame().await, r#"remove: {"server_port":8388}"#);
    manager.stop().await;

    let err = tokio::time::timeout(WAIT, stopping)
        .await
        .expect("stop_instance did not finish")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, ManagerError::ChannelClosed));

    let instance = manager.instance(8388).unwrap();
    assert!(!instance.is_running());
    assert_eq!(instance.state().unwrap(), State::Stopped);
}
