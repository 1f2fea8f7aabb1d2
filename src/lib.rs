// ============================================================================
// WardenDB Library
// ============================================================================
//
// Kernel of a multi-user object database: an admission gate for logins,
// base-scoped read/write/dump locks, per-session transactions with
// checkpoints, and a background task scheduler.
//
// ```no_run
// use wardendb::{Server, ServerConfig};
//
// # async fn demo() -> wardendb::Result<()> {
// let server = Server::start(ServerConfig::new("root password")).await?;
// server.create_user("alice", "secret123").await?;
//
// let session = server.login("alice", "secret123", "localhost").await?;
// session.open_transaction("rename", true).await?;
// // ... edits ...
// session.commit_transaction().await?;
// session.logout().await?;
//
// server.shutdown(None).await?;
// # Ok(())
// # }
// ```
//
// ============================================================================

pub mod audit;
pub mod core;
pub mod facade;
pub mod lock;
pub mod result;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod storage;
pub mod transaction;

// Re-export main types for convenience
pub use core::{BaseId, DbError, DbObject, ErrorKind, FieldId, Invid, Result, Value};
pub use facade::Client;
pub use lock::{LockGuard, LockKind, LockManager, LockResult, LockScope};
pub use result::{Dialog, ReturnVal};
pub use scheduler::{Scheduler, Task, TaskContext};
pub use server::{AdminSession, Builder, Server, ServerState};
pub use session::{AdmissionSemaphore, ServerConfig, Session};
pub use transaction::CommitHook;
