//! End-to-end session lifecycle against the real `mthost` binary.
//!
//! These tests spawn actual shells in PTYs through the full
//! spawn → endpoint → connect → handshake path. `CARGO_BIN_EXE_mthost`
//! forces cargo to build the ttyhost binary; at runtime the spawner finds
//! it one level above the test executable in the target tree.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use midterm::session::manager::{ManagerConfig, SessionManager};

/// Built alongside the tests; referencing it makes cargo produce it.
const MTHOST_BIN: &str = env!("CARGO_BIN_EXE_mthost");

const SHELL: &str = "/bin/sh";

fn manager() -> Arc<SessionManager> {
    SessionManager::new(ManagerConfig::default())
}

/// Poll `check` every 100 ms until it passes or `window` elapses.
async fn wait_for(window: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + window;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
async fn test_create_then_close_law() {
    assert!(std::path::Path::new(MTHOST_BIN).exists());
    let manager = manager();

    let dto = manager
        .create_session(Some(SHELL.into()), 80, 24, None)
        .await
        .expect("create session");
    assert_eq!(dto.id.len(), 8);
    assert_eq!(dto.shell, "sh");
    assert!(dto.is_running);
    assert!(manager.session_list().iter().any(|s| s.id == dto.id));

    // Close is idempotent: true once, false after.
    assert!(manager.close_session(&dto.id).await);
    assert!(!manager.close_session(&dto.id).await);
    assert!(
        !manager.session_list().iter().any(|s| s.id == dto.id),
        "closed session must not be listed"
    );
}

#[tokio::test]
async fn test_echo_round_trip() {
    // Happy-path echo at the session layer: input goes in, the echo and the
    // command output come back through the output event stream.
    let manager = manager();
    let dto = manager
        .create_session(Some(SHELL.into()), 80, 24, None)
        .await
        .expect("create session");

    let collected: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&collected);
    let session_id = dto.id.clone();
    let _sub = manager.on_output(move |event| {
        if event.session_id == session_id {
            sink.lock().unwrap().extend_from_slice(&event.data);
        }
    });

    // Give the shell a moment to print its prompt.
    tokio::time::sleep(Duration::from_millis(300)).await;
    manager.send_input(&dto.id, b"echo hi\n").await;

    let seen = wait_for(Duration::from_secs(10), || {
        let data = collected.lock().unwrap();
        String::from_utf8_lossy(&data).contains("hi")
    })
    .await;
    assert!(seen, "echoed output never arrived");

    // The ttyhost's scrollback replays the same bytes.
    let buffer = manager.get_buffer(&dto.id).await.expect("scrollback");
    assert!(String::from_utf8_lossy(&buffer).contains("hi"));

    assert!(manager.close_session(&dto.id).await);
}

#[tokio::test]
async fn test_resize_and_rename() {
    let manager = manager();
    let dto = manager
        .create_session(Some(SHELL.into()), 80, 24, None)
        .await
        .expect("create session");

    assert!(manager.resize(&dto.id, 120, 40).await);
    let session = manager.get_session(&dto.id).unwrap();
    assert_eq!((session.cols, session.rows), (120, 40));

    assert!(manager.rename_session(&dto.id, Some("build log".into())).await);
    let session = manager.get_session(&dto.id).unwrap();
    assert_eq!(session.title.as_deref(), Some("build log"));
    assert!(session.has_manual_name);

    // Clearing the manual name.
    assert!(manager.rename_session(&dto.id, None).await);
    assert!(!manager.get_session(&dto.id).unwrap().has_manual_name);

    assert!(manager.close_session(&dto.id).await);
}

#[tokio::test]
async fn test_shell_exit_updates_state_but_keeps_session() {
    let manager = manager();
    let dto = manager
        .create_session(Some(SHELL.into()), 80, 24, None)
        .await
        .expect("create session");

    tokio::time::sleep(Duration::from_millis(300)).await;
    manager.send_input(&dto.id, b"exit 3\n").await;

    let exited = wait_for(Duration::from_secs(10), || {
        manager
            .get_session(&dto.id)
            .is_some_and(|s| !s.is_running && s.exit_code == Some(3))
    })
    .await;
    assert!(exited, "exit never reflected in session state");

    // The ttyhost stays up so the scrollback remains viewable; only an
    // explicit close destroys the session.
    assert!(manager.session_list().iter().any(|s| s.id == dto.id));
    assert!(manager.close_session(&dto.id).await);
}

#[tokio::test]
async fn test_reorder_law() {
    let manager = manager();
    let a = manager
        .create_session(Some(SHELL.into()), 80, 24, None)
        .await
        .expect("create a");
    let b = manager
        .create_session(Some(SHELL.into()), 80, 24, None)
        .await
        .expect("create b");

    // Initial order is creation order.
    let ids: Vec<String> = manager.session_list().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![a.id.clone(), b.id.clone()]);

    // After reordering with a permutation, the list follows it.
    let permutation = vec![b.id.clone(), a.id.clone()];
    assert!(manager.reorder_sessions(&permutation));
    let ids: Vec<String> = manager.session_list().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, permutation);

    assert!(manager.close_session(&a.id).await);
    assert!(manager.close_session(&b.id).await);
}

#[tokio::test]
async fn test_cwd_is_honored() {
    let tmp = tempfile::TempDir::new().unwrap();
    let manager = manager();
    let dto = manager
        .create_session(Some(SHELL.into()), 80, 24, Some(tmp.path().to_path_buf()))
        .await
        .expect("create session");

    let collected: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&collected);
    let session_id = dto.id.clone();
    let _sub = manager.on_output(move |event| {
        if event.session_id == session_id {
            sink.lock().unwrap().extend_from_slice(&event.data);
        }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    manager.send_input(&dto.id, b"pwd\n").await;

    let expected = tmp.path().to_string_lossy().into_owned();
    let seen = wait_for(Duration::from_secs(10), || {
        let data = collected.lock().unwrap();
        String::from_utf8_lossy(&data).contains(&expected)
    })
    .await;
    assert!(seen, "shell did not start in the requested cwd");

    assert!(manager.close_session(&dto.id).await);
}
