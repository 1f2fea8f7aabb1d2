/// Session and transaction tests
///
/// Login, edits, checkpoints, commit validation and idle handling through
/// a live server
/// Run with: cargo test --test session_transaction_tests

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tempfile::TempDir;
use wardendb::audit::AuditKind;
use wardendb::core::{BaseSchema, FieldDef, FieldKind, ManualClock};
use wardendb::session::ClientMessage;
use wardendb::transaction::CommitView;
use wardendb::{BaseId, CommitHook, DbError, ErrorKind, Server, ServerConfig, Value};

const HOST: BaseId = 300;
const HOST_NAME: u16 = 1;
const HOST_OWNER: u16 = 2;

fn config(dir: &TempDir) -> ServerConfig {
    ServerConfig::new("rootpw")
        .bcrypt_cost(4)
        .load_on_start(false)
        .dump_path(dir.path().join("wardendb.db"))
}

fn host_base() -> BaseSchema {
    BaseSchema::new(HOST, "Host")
        .with_field(FieldDef::new(HOST_NAME, "Name", FieldKind::Text).required())
        .with_field(FieldDef::new(
            HOST_OWNER,
            "Owner",
            FieldKind::Reference { target: Some(wardendb::storage::USER_BASE) },
        ))
        .with_label(HOST_NAME)
}

async fn server_with_alice(dir: &TempDir) -> Server {
    let server = Server::isolated(config(dir)).await.unwrap();
    server.add_base(host_base()).unwrap();
    server.create_user("alice", "secret123").await.unwrap();
    server
}

#[tokio::test]
async fn test_missing_required_field_rejects_commit() {
    let dir = tempfile::tempdir().unwrap();
    let server = server_with_alice(&dir).await;
    let before = server.login_count();

    let session = server.login("alice", "secret123", "localhost").await.unwrap();
    assert_eq!(server.login_count(), before + 1);
    session.open_transaction("add host", true).await.unwrap();
    session.create_object(HOST).await.unwrap();

    let err = session.commit_transaction().await.unwrap_err();
    match &err {
        DbError::ValidationFailed { field, .. } => assert_eq!(field, "Name"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(server.store().objects_in(HOST).unwrap().is_empty());
    assert!(!session.has_transaction().await);

    session.logout().await.unwrap();
    assert!(server.session("alice").is_none());
    assert_eq!(server.login_count(), before);
}

#[tokio::test]
async fn test_commit_installs_all_changes() {
    let dir = tempfile::tempdir().unwrap();
    let server = server_with_alice(&dir).await;
    let session = server.login("alice", "secret123", "localhost").await.unwrap();

    session.open_transaction("add hosts", true).await.unwrap();
    let first = session.create_object(HOST).await.unwrap();
    let second = session.create_object(HOST).await.unwrap();
    session.set_field(first, HOST_NAME, "gatekeeper".into()).await.unwrap();
    session.set_field(second, HOST_NAME, "watchtower".into()).await.unwrap();
    assert_eq!(session.commit_transaction().await.unwrap(), 2);

    let hosts = session.find_by_label(HOST, "GATEKEEPER").await.unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].invid(), first);
    assert_eq!(server.audit().events_of(AuditKind::Commit).len(), 2);
}

#[tokio::test]
async fn test_failed_commit_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let server = server_with_alice(&dir).await;
    let session = server.login("alice", "secret123", "localhost").await.unwrap();

    session.open_transaction("setup", true).await.unwrap();
    let host = session.create_object(HOST).await.unwrap();
    session.set_field(host, HOST_NAME, "gatekeeper".into()).await.unwrap();
    session.commit_transaction().await.unwrap();

    // one valid edit and one invalid object: neither may land
    session.open_transaction("mixed", true).await.unwrap();
    session.set_field(host, HOST_NAME, "renamed".into()).await.unwrap();
    session.create_object(HOST).await.unwrap();
    assert!(session.commit_transaction().await.is_err());

    let stored = server.store().require(host).unwrap();
    assert_eq!(stored.get(HOST_NAME).and_then(Value::as_str), Some("gatekeeper"));
    assert_eq!(server.store().objects_in(HOST).unwrap().len(), 1);
}

#[tokio::test]
async fn test_rollback_and_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let server = server_with_alice(&dir).await;
    let session = server.login("alice", "secret123", "localhost").await.unwrap();

    // nothing open: rollback is a no-op, twice
    session.rollback(None).await.unwrap();
    session.rollback(None).await.unwrap();

    session.open_transaction("edit", true).await.unwrap();
    let host = session.create_object(HOST).await.unwrap();
    session.set_field(host, HOST_NAME, "one".into()).await.unwrap();
    session.checkpoint("mark").await.unwrap();
    session.set_field(host, HOST_NAME, "two".into()).await.unwrap();
    session.checkpoint("mark").await.unwrap();
    session.set_field(host, HOST_NAME, "three".into()).await.unwrap();

    session.rollback(Some("mark")).await.unwrap();
    let seen = session.view_object(host).await.unwrap();
    assert_eq!(seen.get(HOST_NAME).and_then(Value::as_str), Some("two"));

    session.rollback(Some("mark")).await.unwrap();
    let seen = session.view_object(host).await.unwrap();
    assert_eq!(seen.get(HOST_NAME).and_then(Value::as_str), Some("one"));

    assert!(matches!(
        session.rollback(Some("mark")).await,
        Err(DbError::CheckpointNotFound(_))
    ));

    session.rollback(None).await.unwrap();
    assert!(!session.has_transaction().await);
    assert!(matches!(session.view_object(host).await, Err(DbError::ObjectNotFound(_))));
    assert!(server.store().objects_in(HOST).unwrap().is_empty());
}

#[tokio::test]
async fn test_one_transaction_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let server = server_with_alice(&dir).await;
    let session = server.login("alice", "secret123", "localhost").await.unwrap();

    assert!(matches!(session.create_object(HOST).await, Err(DbError::NoTransaction)));
    session.open_transaction("first", true).await.unwrap();
    assert!(matches!(
        session.open_transaction("second", true).await,
        Err(DbError::TransactionOpen(_))
    ));
    assert!(matches!(session.commit_transaction().await, Ok(0)));
    assert!(matches!(session.commit_transaction().await, Err(DbError::NoTransaction)));
}

#[tokio::test]
async fn test_other_sessions_see_only_committed_state() {
    let dir = tempfile::tempdir().unwrap();
    let server = server_with_alice(&dir).await;
    server.create_user("bob", "hunter22").await.unwrap();
    let alice = server.login("alice", "secret123", "localhost").await.unwrap();
    let bob = server.login("bob", "hunter22", "localhost").await.unwrap();

    alice.open_transaction("edit", true).await.unwrap();
    let host = alice.create_object(HOST).await.unwrap();
    alice.set_field(host, HOST_NAME, "private".into()).await.unwrap();
    assert!(bob.view_object(host).await.is_err());
    assert!(bob.query(HOST, |_| true).await.unwrap().is_empty());

    alice.commit_transaction().await.unwrap();
    assert_eq!(bob.query(HOST, |_| true).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_deleting_a_referenced_object_fails() {
    let dir = tempfile::tempdir().unwrap();
    let server = server_with_alice(&dir).await;
    let session = server.login("alice", "secret123", "localhost").await.unwrap();
    let bob = server.create_user("bob", "hunter22").await.unwrap();

    session.open_transaction("link", true).await.unwrap();
    let host = session.create_object(HOST).await.unwrap();
    session.set_field(host, HOST_NAME, "gatekeeper".into()).await.unwrap();
    session.add_reference(host, HOST_OWNER, bob).await.unwrap();
    session.commit_transaction().await.unwrap();

    session.open_transaction("remove owner", true).await.unwrap();
    session.delete_object(bob).await.unwrap();
    let err = session.commit_transaction().await.unwrap_err();
    assert!(matches!(err, DbError::ValidationFailed { invid, .. } if invid == host));
    assert!(server.store().contains(bob).unwrap());
}

struct NoRenames;

#[async_trait]
impl CommitHook for NoRenames {
    fn name(&self) -> &str {
        "no renames"
    }

    async fn check(&self, view: &CommitView<'_>) -> Result<(), String> {
        for change in view.edits().changes() {
            if let (Some(before), Some(after)) = (change.original(), change.current()) {
                if before.get(HOST_NAME) != after.get(HOST_NAME) {
                    return Err("hosts may not be renamed".to_string());
                }
            }
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_commit_hook_can_veto() {
    let dir = tempfile::tempdir().unwrap();
    let server = server_with_alice(&dir).await;
    server.add_commit_hook(Arc::new(NoRenames));
    let session = server.login("alice", "secret123", "localhost").await.unwrap();

    session.open_transaction("create", true).await.unwrap();
    let host = session.create_object(HOST).await.unwrap();
    session.set_field(host, HOST_NAME, "gatekeeper".into()).await.unwrap();
    session.commit_transaction().await.unwrap();

    session.open_transaction("rename", true).await.unwrap();
    session.set_field(host, HOST_NAME, "renamed".into()).await.unwrap();
    let err = session.commit_transaction().await.unwrap_err();
    assert!(matches!(err, DbError::CommitVetoed(_)));
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_idle_limits_depend_on_checked_out_objects() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let server = Server::isolated_with_clock(config(&dir), clock.clone()).await.unwrap();
    server.add_base(host_base()).unwrap();
    server.create_user("alice", "secret123").await.unwrap();
    server.create_user("bob", "hunter22").await.unwrap();

    let alice = server.login("alice", "secret123", "localhost").await.unwrap();
    let bob = server.login("bob", "hunter22", "localhost").await.unwrap();

    // bob checks out a committed object, alice does nothing
    bob.open_transaction("setup", true).await.unwrap();
    let host = bob.create_object(HOST).await.unwrap();
    bob.set_field(host, HOST_NAME, "gatekeeper".into()).await.unwrap();
    bob.commit_transaction().await.unwrap();
    bob.open_transaction("rename", true).await.unwrap();
    bob.set_field(host, HOST_NAME, "renamed".into()).await.unwrap();

    clock.advance(ChronoDuration::minutes(16));
    assert_eq!(server.clear_idle_sessions().await, 1);
    assert!(alice.is_closed());
    assert!(!bob.is_closed());
    assert!(
        alice
            .take_messages()
            .iter()
            .any(|m| matches!(m, ClientMessage::ForcedOff { .. }))
    );

    clock.advance(ChronoDuration::minutes(5));
    assert_eq!(server.clear_idle_sessions().await, 1);
    assert!(bob.is_closed());
    assert_eq!(server.login_count(), 0);
    assert!(server.store().require(host).unwrap().get(HOST_NAME) == Some(&Value::from("gatekeeper")));
}

#[tokio::test]
async fn test_closed_session_refuses_work() {
    let dir = tempfile::tempdir().unwrap();
    let server = server_with_alice(&dir).await;
    let session = server.login("alice", "secret123", "localhost").await.unwrap();
    session.open_transaction("edit", true).await.unwrap();

    assert!(server.kill_user("alice", "testing").await);
    let err = session.create_object(HOST).await.unwrap_err();
    assert!(matches!(err, DbError::SessionClosed(ref reason) if reason == "testing"));
    assert_eq!(server.login_count(), 0);

    // logout after being forced off changes nothing
    session.logout().await.unwrap();
    assert_eq!(server.login_count(), 0);
}

async fn committed_host(server: &Server, name: &str) -> wardendb::Invid {
    let setup = server.login("alice", "secret123", "setup").await.unwrap();
    setup.open_transaction("setup", true).await.unwrap();
    let host = setup.create_object(HOST).await.unwrap();
    setup.set_field(host, HOST_NAME, name.into()).await.unwrap();
    setup.commit_transaction().await.unwrap();
    setup.logout().await.unwrap();
    host
}

#[tokio::test]
async fn test_checked_out_object_is_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let server = server_with_alice(&dir).await;
    let bob_user = server.create_user("bob", "hunter22").await.unwrap();
    let host = committed_host(&server, "gatekeeper").await;

    let alice = server.login("alice", "secret123", "desk").await.unwrap();
    let bob = server.login("bob", "hunter22", "desk").await.unwrap();
    alice.open_transaction("rename", true).await.unwrap();
    bob.open_transaction("assign", true).await.unwrap();

    alice.set_field(host, HOST_NAME, "renamed".into()).await.unwrap();
    match bob.add_reference(host, HOST_OWNER, bob_user).await {
        Err(DbError::ObjectBusy { invid, holder }) => {
            assert_eq!(invid, host);
            assert_eq!(holder, "alice");
        }
        other => panic!("expected the host to be busy, got {other:?}"),
    }
    assert!(matches!(bob.delete_object(host).await, Err(DbError::ObjectBusy { .. })));

    // once alice commits, bob checks out her result and both changes land
    assert_eq!(alice.commit_transaction().await.unwrap(), 1);
    bob.add_reference(host, HOST_OWNER, bob_user).await.unwrap();
    assert_eq!(bob.commit_transaction().await.unwrap(), 1);

    let stored = server.store().require(host).unwrap();
    assert_eq!(stored.get(HOST_NAME).and_then(Value::as_str), Some("renamed"));
    assert_eq!(stored.get(HOST_OWNER), Some(&Value::Reference(bob_user)));
}

#[tokio::test]
async fn test_rollback_and_logout_release_checked_out_objects() {
    let dir = tempfile::tempdir().unwrap();
    let server = server_with_alice(&dir).await;
    server.create_user("bob", "hunter22").await.unwrap();
    let host = committed_host(&server, "gatekeeper").await;
    let other = committed_host(&server, "doorman").await;

    let alice = server.login("alice", "secret123", "desk").await.unwrap();
    let bob = server.login("bob", "hunter22", "desk").await.unwrap();
    bob.open_transaction("edit", true).await.unwrap();

    // objects checked out after a checkpoint are released by rolling back to it
    alice.open_transaction("edit", true).await.unwrap();
    alice.set_field(host, HOST_NAME, "first".into()).await.unwrap();
    alice.checkpoint("before other").await.unwrap();
    alice.set_field(other, HOST_NAME, "second".into()).await.unwrap();
    alice.rollback(Some("before other")).await.unwrap();
    bob.set_field(other, HOST_NAME, "bob's".into()).await.unwrap();
    assert!(matches!(
        bob.set_field(host, HOST_NAME, "bob's".into()).await,
        Err(DbError::ObjectBusy { .. })
    ));

    alice.rollback(None).await.unwrap();
    bob.set_field(host, HOST_NAME, "bob's too".into()).await.unwrap();
    bob.logout().await.unwrap();

    alice.open_transaction("again", true).await.unwrap();
    alice.set_field(host, HOST_NAME, "alice's".into()).await.unwrap();
    assert_eq!(alice.commit_transaction().await.unwrap(), 1);
}

#[tokio::test]
async fn test_commit_refuses_an_original_changed_underneath() {
    let dir = tempfile::tempdir().unwrap();
    let server = server_with_alice(&dir).await;
    let host = committed_host(&server, "gatekeeper").await;

    let alice = server.login("alice", "secret123", "desk").await.unwrap();
    alice.open_transaction("rename", true).await.unwrap();
    alice.set_field(host, HOST_NAME, "renamed".into()).await.unwrap();

    // installed behind the check-out table's back
    let mut replaced = server.store().require(host).unwrap();
    replaced.set(HOST_NAME, "replaced".into());
    server.store().apply(vec![(host, Some(replaced))], Utc::now()).unwrap();

    let err = alice.commit_transaction().await.unwrap_err();
    assert!(matches!(err, DbError::ObjectChanged(invid) if invid == host));
    assert_eq!(err.kind(), ErrorKind::Validation);
    let stored = server.store().require(host).unwrap();
    assert_eq!(stored.get(HOST_NAME).and_then(Value::as_str), Some("replaced"));
}
