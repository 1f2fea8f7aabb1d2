// ============================================================================
// Client facade
// ============================================================================
//
// The boundary a remote client talks to. Every call returns a ReturnVal so
// failures come back as dialogs instead of errors, and edits come back with
// rescan hints for the objects they touched.
//
// ============================================================================

use crate::core::{BaseId, DbError, DbObject, FieldId, Invid, Value};
use crate::result::{Dialog, ReturnVal};
use crate::server::Server;
use crate::session::{ClientMessage, Session};
use crate::transaction::TransactionId;
use tracing::debug;

/// One client connection: at most one logged-in session at a time.
pub struct Client {
    server: Server,
    host: String,
    session: Option<Session>,
}

impl Client {
    pub fn new(server: &Server, host: impl Into<String>) -> Self {
        Self {
            server: server.clone(),
            host: host.into(),
            session: None,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    fn current(&self) -> Result<&Session, DbError> {
        match &self.session {
            Some(session) if !session.is_closed() => Ok(session),
            Some(session) => Err(DbError::SessionClosed(
                session.closed_reason().unwrap_or_else(|| "logged out".to_string()),
            )),
            None => Err(DbError::SessionClosed("not logged in".to_string())),
        }
    }

    /// Log in, replacing any earlier session held by this client.
    pub async fn login(&mut self, name: &str, password: &str) -> ReturnVal<String> {
        if let Some(old) = self.session.take() {
            if let Err(e) = old.logout().await {
                debug!(session = old.name(), error = %e, "previous session logout failed");
            }
        }
        match self.server.login(name, password, &self.host).await {
            Ok(session) => {
                let label = session.name().to_string();
                self.session = Some(session);
                ReturnVal::success(label)
            }
            Err(e) => ReturnVal::failure(e),
        }
    }

    pub async fn open_transaction(&self, description: &str) -> ReturnVal<TransactionId> {
        match self.current() {
            Ok(session) => session.open_transaction(description, true).await.into(),
            Err(e) => ReturnVal::failure(e),
        }
    }

    pub async fn create_object(&self, base: BaseId) -> ReturnVal<Invid> {
        let session = match self.current() {
            Ok(session) => session,
            Err(e) => return ReturnVal::failure(e),
        };
        match session.create_object(base).await {
            Ok(invid) => ReturnVal::success(invid).with_rescan(invid, Vec::new()),
            Err(e) => ReturnVal::failure(e),
        }
    }

    pub async fn set_field(&self, invid: Invid, field: FieldId, value: Value) -> ReturnVal {
        let session = match self.current() {
            Ok(session) => session,
            Err(e) => return ReturnVal::failure(e),
        };
        match session.set_field(invid, field, value).await {
            Ok(()) => ReturnVal::ok().with_rescan(invid, vec![field]),
            Err(e) => ReturnVal::failure(e),
        }
    }

    pub async fn delete_object(&self, invid: Invid) -> ReturnVal {
        let session = match self.current() {
            Ok(session) => session,
            Err(e) => return ReturnVal::failure(e),
        };
        match session.delete_object(invid).await {
            Ok(()) => ReturnVal::ok().with_rescan(invid, Vec::new()),
            Err(e) => ReturnVal::failure(e),
        }
    }

    pub async fn view_object(&self, invid: Invid) -> ReturnVal<DbObject> {
        match self.current() {
            Ok(session) => session.view_object(invid).await.into(),
            Err(e) => ReturnVal::failure(e),
        }
    }

    pub async fn checkpoint(&self, label: &str) -> ReturnVal {
        match self.current() {
            Ok(session) => session.checkpoint(label).await.into(),
            Err(e) => ReturnVal::failure(e),
        }
    }

    pub async fn rollback(&self, label: Option<&str>) -> ReturnVal {
        match self.current() {
            Ok(session) => session.rollback(label).await.into(),
            Err(e) => ReturnVal::failure(e),
        }
    }

    /// Commit the open transaction. On success the dialog reports how many
    /// objects changed.
    pub async fn commit_transaction(&self) -> ReturnVal<usize> {
        let session = match self.current() {
            Ok(session) => session,
            Err(e) => return ReturnVal::failure(e),
        };
        match session.commit_transaction().await {
            Ok(0) => ReturnVal::success(0),
            Ok(changed) => ReturnVal::success(changed)
                .with_dialog(Dialog::new("Transaction committed", format!("{} objects changed", changed))),
            Err(e) => ReturnVal::failure(e),
        }
    }

    pub async fn logout(&mut self) -> ReturnVal {
        match self.session.take() {
            Some(session) => session.logout().await.into(),
            None => ReturnVal::ok(),
        }
    }

    /// Drain pending notices for the current session, including the
    /// forced-off notice of a session that was already closed.
    pub fn take_messages(&self) -> Vec<ClientMessage> {
        self.session
            .as_ref()
            .map(|session| session.take_messages())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::session::ServerConfig;
    use crate::storage::{USER_BASE, user_fields};

    fn config(dir: &tempfile::TempDir) -> ServerConfig {
        ServerConfig::new("rootpw")
            .bcrypt_cost(4)
            .load_on_start(false)
            .dump_path(dir.path().join("wardendb.db"))
            .audit_log_path(dir.path().join("audit.log"))
    }

    #[tokio::test]
    async fn test_not_logged_in() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::isolated(config(&dir)).await.unwrap();
        let client = Client::new(&server, "localhost");

        let rv = client.open_transaction("edit").await;
        assert!(!rv.did_succeed());
        assert!(matches!(rv.error(), Some(DbError::SessionClosed(_))));
        assert_eq!(rv.error_kind(), Some(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn test_bad_login_is_a_dialog() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::isolated(config(&dir)).await.unwrap();
        let mut client = Client::new(&server, "localhost");

        let rv = client.login("nobody", "nothing").await;
        assert!(!rv.did_succeed());
        assert_eq!(rv.error_kind(), Some(ErrorKind::Authentication));
        assert!(rv.dialog().is_some());
        assert!(client.session().is_none());
    }

    #[tokio::test]
    async fn test_edit_and_commit() {
        let dir = tempfile::tempdir().unwrap();
        let server = Server::isolated(config(&dir)).await.unwrap();
        server.create_user("alice", "secret123").await.unwrap();
        let mut client = Client::new(&server, "localhost");

        assert_eq!(client.login("alice", "secret123").await.value().map(String::as_str), Some("alice"));
        assert!(client.open_transaction("new user").await.did_succeed());

        let created = client.create_object(USER_BASE).await;
        assert!(created.did_succeed());
        let invid = *created.value().unwrap();
        assert_eq!(created.rescan()[0].invid, invid);

        let set = client.set_field(invid, user_fields::USERNAME, "bob".into()).await;
        assert_eq!(set.rescan()[0].fields, vec![user_fields::USERNAME]);

        let committed = client.commit_transaction().await;
        assert_eq!(committed.value(), Some(&1));
        assert!(committed.dialog().is_some());

        assert!(client.logout().await.did_succeed());
        assert_eq!(server.login_count(), 0);
    }
}
