//! Session lifecycle behaviour: startup failure, graceful stop,
//! unexpected child death, and re-spawn independence.

use std::path::{Path, PathBuf};

use ipc_bridge::sample::{SampleClient, SAMPLE_SERVICE_ID};
use ipc_bridge::{BridgeError, ManagerConfig, ServiceManager, SessionState};

fn session_config(dir: &Path) -> ManagerConfig {
    let mut config = ManagerConfig::new(SAMPLE_SERVICE_ID);
    config.program = Some(PathBuf::from(env!("CARGO_BIN_EXE_ipc-bridge")));
    config.socket_dir = dir.to_path_buf();
    config
}

#[tokio::test]
async fn graceful_stop_exits_zero_and_parks_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let client = SampleClient::spawn(session_config(dir.path())).await.unwrap();

    assert_eq!(client.add(2, 2).await.unwrap(), 4);

    client.stop().await.unwrap();
    assert_eq!(client.manager().state(), SessionState::Stopped);
    assert_eq!(client.manager().exit_code(), Some(0));
}

#[tokio::test]
async fn shutdown_twice_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let client = SampleClient::spawn(session_config(dir.path())).await.unwrap();

    client.stop().await.unwrap();
    client.stop().await.unwrap();
    assert_eq!(client.manager().state(), SessionState::Stopped);
}

#[tokio::test]
async fn stop_sent_through_invoke_routes_into_graceful_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let client = SampleClient::spawn(session_config(dir.path())).await.unwrap();

    let value = client
        .manager()
        .invoke("stop_async", Vec::new())
        .await
        .unwrap();
    assert_eq!(value, None);
    assert_eq!(client.manager().state(), SessionState::Stopped);
    assert_eq!(client.manager().exit_code(), Some(0));
}

#[tokio::test]
async fn hard_exit_fails_the_pending_call_and_every_later_one() {
    let dir = tempfile::tempdir().unwrap();
    let client = SampleClient::spawn(session_config(dir.path())).await.unwrap();

    let err = client.hard_exit().await.unwrap_err();
    assert!(
        err.to_string().contains("Process exited unexpectedly"),
        "unexpected message: {err}"
    );

    // Later calls fail immediately with the same error.
    let err = client.add(1, 1).await.unwrap_err();
    assert!(err.to_string().contains("Process exited unexpectedly"));

    assert_eq!(client.manager().state(), SessionState::Stopped);
    assert_eq!(client.manager().exit_code(), Some(1));

    // Shutdown after the fact is still a clean no-op teardown.
    client.stop().await.unwrap();
}

#[tokio::test]
async fn calls_after_graceful_stop_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let client = SampleClient::spawn(session_config(dir.path())).await.unwrap();

    client.stop().await.unwrap();
    let err = client.add(1, 1).await.unwrap_err();
    assert!(matches!(err, BridgeError::Stopped));
}

#[tokio::test]
async fn startup_fails_with_the_exit_code_of_a_child_that_never_connects() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = session_config(dir.path());
    config.program = Some(PathBuf::from("/bin/false"));

    let err = ServiceManager::spawn(config).await.unwrap_err();
    match err {
        BridgeError::Startup { reason, exit_code } => {
            assert!(reason.contains("exited before connecting"), "{reason}");
            assert_eq!(exit_code, Some(1));
        }
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn startup_fails_for_an_unknown_service_identifier() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = session_config(dir.path());
    config.service_id = "no-such-service".to_string();

    // The runner connects both pipes before constructing the service, so
    // the failure surfaces either as a startup error or as the session
    // dying before the first call.
    match ServiceManager::spawn(config).await {
        Err(BridgeError::Startup { .. }) => {}
        Err(other) => panic!("unexpected error {other}"),
        Ok(manager) => {
            let err = manager.invoke("no_op", Vec::new()).await.unwrap_err();
            assert!(err.to_string().contains("Process exited unexpectedly"));
            assert_eq!(manager.exit_code(), Some(1));
        }
    }
}

#[tokio::test]
async fn respawn_after_shutdown_yields_an_independent_session() {
    let dir = tempfile::tempdir().unwrap();

    let first = SampleClient::spawn(session_config(dir.path())).await.unwrap();
    let _subscription = first.on_message(|_| {});
    assert_eq!(first.add(1, 2).await.unwrap(), 3);
    first.stop().await.unwrap();

    let second = SampleClient::spawn(session_config(dir.path())).await.unwrap();
    assert_eq!(second.add(10, 20).await.unwrap(), 30);
    assert_eq!(second.manager().state(), SessionState::Ready);
    second.stop().await.unwrap();
    assert_eq!(second.manager().exit_code(), Some(0));
}
