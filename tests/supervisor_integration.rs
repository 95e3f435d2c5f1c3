// Supervisor integration: a full configuration document brings up every
// enabled daemon, cooperative shutdown exits zero, lock-down exits non-zero.

use outpost::error::OutpostError;
use outpost::{Config, Supervisor};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn full_config(dns_port: u16, http_port: u16, mail_port: u16, sock_port: u16) -> Config {
    let document = format!(
        r#"{{
  "Features": {{"Shell": {{"InterpreterPath": "/bin/sh"}}}},
  "DNSDaemon": {{
    "ListenAddress": "127.0.0.1",
    "ListenPort": {dns_port},
    "ForwardTo": "127.0.0.1:53530",
    "AllowQueryIPPrefixes": ["127.0"],
    "PerIPLimit": 10
  }},
  "HTTPDaemon": {{"ListenAddress": "127.0.0.1", "ListenPort": {http_port}, "BaseRateLimit": 100}},
  "HTTPHandlers": {{"InformationEndpoint": "/info"}},
  "MailDaemon": {{"ListenAddress": "127.0.0.1", "ListenPort": {mail_port}, "PerIPLimit": 10}},
  "SockDaemon": {{"ListenAddress": "127.0.0.1", "ListenPort": {sock_port}, "PerIPLimit": 10, "Password": "1234567"}},
  "HealthCheck": {{"IntervalSec": 300}}
}}"#
    );
    Config::from_json(document.as_bytes()).expect("config")
}

#[tokio::test]
async fn test_shutdown_request_stops_all_daemons_cleanly() {
    let supervisor = Arc::new(Supervisor::new(full_config(61221, 23491, 18581, 6895)));
    let shared = supervisor.shared().clone();
    let runner = supervisor.clone();
    let running = tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_secs(1)).await;

    // The HTTP front is actually up before the shutdown request
    let status = reqwest::get("http://127.0.0.1:23491/info")
        .await
        .expect("request")
        .status();
    assert_eq!(status.as_u16(), 200);

    shared.request_shutdown();
    let outcome = timeout(Duration::from_secs(5), running)
        .await
        .expect("stop before deadline")
        .expect("join");
    assert_eq!(outcome, Ok(()));
}

#[tokio::test]
async fn test_lock_down_surfaces_as_daemon_error() {
    let supervisor = Arc::new(Supervisor::new(full_config(61222, 23492, 18582, 6896)));
    let shared = supervisor.shared().clone();
    let runner = supervisor.clone();
    let running = tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_secs(1)).await;

    shared.lock_down();
    let outcome = timeout(Duration::from_secs(5), running)
        .await
        .expect("stop before deadline")
        .expect("join");
    assert_eq!(outcome, Err(OutpostError::EmergencyLockDown));
}
