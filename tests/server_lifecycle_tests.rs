/// Server lifecycle tests
///
/// Singleton start, session registry, admin consoles and both shutdown paths
/// Run with: cargo test --test server_lifecycle_tests

use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use wardendb::server::AdminEvent;
use wardendb::session::{AdminPrivilege, ClientMessage};
use wardendb::storage::USER_BASE;
use wardendb::{DbError, ErrorKind, LockScope, Server, ServerConfig, ServerState};

fn config(dir: &TempDir) -> ServerConfig {
    ServerConfig::new("rootpw")
        .bcrypt_cost(4)
        .load_on_start(false)
        .dump_path(dir.path().join("wardendb.db"))
        .shutdown_grace(Duration::from_millis(10))
}

async fn next_event<F>(events: &mut broadcast::Receiver<AdminEvent>, wanted: F) -> AdminEvent
where
    F: Fn(&AdminEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("admin event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("admin event not seen")
}

// The only test in this file that claims the process slot.
#[tokio::test]
async fn test_only_one_started_server_per_process() {
    let dir = tempfile::tempdir().unwrap();
    let first = Server::start(config(&dir)).await.unwrap();
    assert!(matches!(
        Server::start(config(&dir)).await,
        Err(DbError::ServerAlreadyRunning)
    ));

    // isolated servers never compete for the slot
    let other = tempfile::tempdir().unwrap();
    Server::isolated(config(&other)).await.unwrap();

    first.shutdown(None).await.unwrap();
    let again = Server::start(config(&dir)).await.unwrap();
    again.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_logins_get_unique_names() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::isolated(config(&dir)).await.unwrap();
    let alice = server.create_user("alice", "secret123").await.unwrap();

    let first = server.login("alice", "secret123", "desk").await.unwrap();
    let second = server.login("alice", "secret123", "laptop").await.unwrap();
    let third = server.login("alice", "secret123", "phone").await.unwrap();
    assert_eq!(first.name(), "alice");
    assert_eq!(second.name(), "alice[2]");
    assert_eq!(third.name(), "alice[3]");
    assert_eq!(server.login_count(), 3);

    assert!(first.take_messages().contains(&ClientMessage::Login {
        name: "alice[2]".to_string(),
        count: 2,
    }));

    second.logout().await.unwrap();
    assert!(first.take_messages().contains(&ClientMessage::Logout {
        name: "alice[2]".to_string(),
        count: 2,
    }));
    assert!(server.last_logout(alice).is_some());

    // the freed name is reused
    let fourth = server.login("alice", "secret123", "tablet").await.unwrap();
    assert_eq!(fourth.name(), "alice[2]");
    assert_eq!(server.session_names(), vec!["alice", "alice[2]", "alice[3]"]);
}

#[tokio::test]
async fn test_kill_user_forces_the_session_off() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::isolated(config(&dir)).await.unwrap();
    server.create_user("alice", "secret123").await.unwrap();
    server.create_user("bob", "hunter22").await.unwrap();
    let mut events = server.subscribe();

    let alice = server.login("alice", "secret123", "desk").await.unwrap();
    let bob = server.login("bob", "hunter22", "desk").await.unwrap();
    next_event(&mut events, |e| matches!(e, AdminEvent::SessionOpened { name, .. } if name == "bob")).await;

    assert!(server.kill_user("alice", "maintenance").await);
    assert!(!server.kill_user("alice", "maintenance").await);
    assert!(alice.is_closed());
    assert_eq!(alice.closed_reason().as_deref(), Some("maintenance"));
    assert!(!bob.is_closed());

    let closed = next_event(&mut events, |e| matches!(e, AdminEvent::SessionClosed { .. })).await;
    assert_eq!(
        closed,
        AdminEvent::SessionClosed {
            name: "alice".to_string(),
            reason: "maintenance".to_string(),
            forced: true,
        }
    );

    assert_eq!(server.kill_all_users("closing").await, 1);
    assert_eq!(server.login_count(), 0);
}

#[tokio::test]
async fn test_broadcast_reaches_every_session() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::isolated(config(&dir)).await.unwrap();
    server.create_user("alice", "secret123").await.unwrap();
    let first = server.login("alice", "secret123", "desk").await.unwrap();
    let second = server.login("alice", "secret123", "laptop").await.unwrap();

    let admin = server.admin("supergash", "rootpw").await.unwrap();
    assert_eq!(admin.broadcast("back in five").unwrap(), 2);

    let expected = ClientMessage::Broadcast {
        from: "supergash".to_string(),
        text: "back in five".to_string(),
    };
    assert!(first.take_messages().contains(&expected));
    assert!(second.take_messages().contains(&expected));
}

#[tokio::test]
async fn test_admin_privileges() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::isolated(config(&dir)).await.unwrap();
    let alice = server.create_user("alice", "secret123").await.unwrap();
    server
        .create_persona("alice:Viewer", "viewpass", Some(alice), AdminPrivilege::Basic)
        .await
        .unwrap();

    // plain users cannot attach
    let err = server.admin("alice", "secret123").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);

    let viewer = server.admin("alice:Viewer", "viewpass").await.unwrap();
    assert_eq!(viewer.privilege(), AdminPrivilege::Basic);
    assert!(viewer.user_table().await.is_empty());
    assert!(matches!(
        viewer.kill_all_users("nope").await,
        Err(DbError::PermissionDenied(_))
    ));
    assert!(matches!(viewer.dump().await, Err(DbError::PermissionDenied(_))));

    let root = server.admin("supergash", "rootpw").await.unwrap();
    assert_eq!(root.privilege(), AdminPrivilege::Interpreter);
    assert_eq!(root.kill_all_users("ok").await.unwrap(), 0);
    assert_eq!(server.audit().events_of(wardendb::audit::AuditKind::AdminConnect).len(), 2);
}

#[tokio::test]
async fn test_user_table_reports_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::isolated(config(&dir)).await.unwrap();
    server.create_user("alice", "secret123").await.unwrap();
    let session = server.login("alice", "secret123", "desk").await.unwrap();
    session.open_transaction("tidy up", true).await.unwrap();

    let table = server.user_table().await;
    assert_eq!(table.len(), 1);
    assert_eq!(table[0].name, "alice");
    assert_eq!(table[0].host, "desk");
    assert_eq!(table[0].transaction.as_deref(), Some("tidy up"));
}

#[tokio::test]
async fn test_shutdown_waits_for_the_last_user() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::isolated(config(&dir)).await.unwrap();
    server.create_user("alice", "secret123").await.unwrap();
    let session = server.login("alice", "secret123", "desk").await.unwrap();

    server.set_shutdown(Some("hardware swap")).await.unwrap();
    assert_eq!(server.state(), ServerState::ShutdownPending);

    let err = server.login("alice", "secret123", "laptop").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Admission);
    assert!(err.to_string().contains("hardware swap"));
    assert!(!session.is_closed());

    session.logout().await.unwrap();
    assert_eq!(server.wait_for_shutdown().await, ServerState::ShutDown);
    assert!(dir.path().join("wardendb.db").exists());
}

#[tokio::test]
async fn test_set_shutdown_with_nobody_logged_in_is_immediate() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::isolated(config(&dir)).await.unwrap();

    server.set_shutdown(None).await.unwrap();
    assert_eq!(server.state(), ServerState::ShutDown);
}

#[tokio::test]
async fn test_shutdown_forces_everyone_off() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::isolated(config(&dir)).await.unwrap();
    server.create_user("alice", "secret123").await.unwrap();
    let session = server.login("alice", "secret123", "desk").await.unwrap();
    let mut events = server.subscribe();

    server.shutdown(Some("power failure")).await.unwrap();
    assert_eq!(server.state(), ServerState::ShutDown);
    assert!(session.is_closed());
    assert!(session.take_messages().contains(&ClientMessage::ForcedOff {
        reason: "Server going down\n\nReason: power failure".to_string(),
    }));
    assert_eq!(server.login_count(), 0);
    assert!(server.locks().is_closed());
    assert!(server.scheduler().is_stopped());

    next_event(&mut events, |e| *e == AdminEvent::State(ServerState::ShutDown)).await;

    // a second call is a no-op
    server.shutdown(None).await.unwrap();
    assert!(server.login("alice", "secret123", "desk").await.is_err());
}

#[tokio::test]
async fn test_session_names_ignore_case() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::isolated(config(&dir)).await.unwrap();
    server.create_user("Alice", "secret123").await.unwrap();

    let first = server.login("alice", "secret123", "desk").await.unwrap();
    let second = server.login("ALICE", "secret123", "laptop").await.unwrap();
    assert_eq!(first.name(), "Alice");
    assert_eq!(second.name(), "Alice[2]");

    assert!(server.session("aLiCe").is_some_and(|s| s.id() == first.id()));
    assert!(server.kill_user("alice[2]", "duplicate").await);
    assert!(second.is_closed());
    assert_eq!(server.session_names(), vec!["Alice"]);
}

#[tokio::test]
async fn test_overlapping_account_creation_and_dumps() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::isolated(config(&dir)).await.unwrap();
    let reader = server
        .locks()
        .read("auditor", LockScope::base(USER_BASE))
        .await
        .unwrap()
        .into_result()
        .unwrap();

    let spawn_create = |name: &'static str| {
        let server = server.clone();
        tokio::spawn(async move { server.create_user(name, "secret123").await })
    };
    let first = spawn_create("carol");
    let second = spawn_create("dave");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!first.is_finished());
    assert!(!second.is_finished());

    drop(reader);
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let (a, b) = tokio::join!(server.dump(), server.dump());
    assert!(a.is_ok() && b.is_ok());
}

#[tokio::test]
async fn test_failed_final_dump_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    // a plain file where the dump directory should be
    std::fs::write(dir.path().join("blocker"), b"").unwrap();
    let server = Server::isolated(config(&dir).dump_path(dir.path().join("blocker").join("wardendb.db")))
        .await
        .unwrap();
    server.create_user("alice", "secret123").await.unwrap();
    let session = server.login("alice", "secret123", "desk").await.unwrap();

    let err = server.shutdown(Some("disk replaced")).await.unwrap_err();
    assert!(matches!(err, DbError::Fatal(_)));
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert_eq!(server.state(), ServerState::Failed);
    assert_eq!(server.wait_for_shutdown().await, ServerState::Failed);

    // nothing after the dump ran: sessions stay registered, no clean shutdown
    assert!(!session.is_closed());
    assert_eq!(server.login_count(), 1);
    assert!(!server.locks().is_closed());
    assert!(server.audit().events_of(wardendb::audit::AuditKind::Shutdown).is_empty());
}
