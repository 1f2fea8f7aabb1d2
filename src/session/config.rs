use std::path::PathBuf;
use std::time::Duration;

/// Scheduler periods are kept at minute resolution.
const MIN_TASK_INTERVAL: Duration = Duration::from_secs(60);

/// Server configuration
///
/// All values are resolved before the server starts; nothing here is
/// re-read at runtime.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Idle limit for sessions with nothing checked out
    pub idle_timeout: Duration,

    /// Idle limit for sessions whose open transaction holds checked-out objects
    pub idle_timeout_with_objects: Duration,

    /// How long a login may wait for the admission gate to reopen
    pub login_wait: Duration,

    /// Bound on lock waits inside session operations (None = wait forever)
    pub lock_timeout: Option<Duration>,

    /// Durable dump file
    pub dump_path: PathBuf,

    /// Copy the previous dump aside before overwriting it
    pub archive_dumps: bool,

    /// Load the dump file at start if it exists
    pub load_on_start: bool,

    /// JSON-lines audit trail (None = in-memory only)
    pub audit_log_path: Option<PathBuf>,

    /// Password for the root persona
    pub root_password: String,

    /// bcrypt cost factor
    pub bcrypt_cost: u32,

    /// Wait between the last user logging out and a deferred shutdown
    pub shutdown_grace: Duration,

    /// Period of the idle-session sweep task
    pub idle_sweep_interval: Duration,

    /// Period of the automatic dump task (None = only dump at shutdown)
    pub dump_interval: Option<Duration>,
}

impl ServerConfig {
    pub fn new(root_password: &str) -> Self {
        Self {
            idle_timeout: Duration::from_secs(15 * 60),
            idle_timeout_with_objects: Duration::from_secs(20 * 60),
            login_wait: Duration::ZERO,
            lock_timeout: None,
            dump_path: PathBuf::from("wardendb.db"),
            archive_dumps: false,
            load_on_start: true,
            audit_log_path: None,
            root_password: root_password.to_string(),
            bcrypt_cost: bcrypt::DEFAULT_COST,
            shutdown_grace: Duration::from_secs(10),
            idle_sweep_interval: Duration::from_secs(60),
            dump_interval: Some(Duration::from_secs(2 * 60 * 60)),
        }
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn idle_timeout_with_objects(mut self, timeout: Duration) -> Self {
        self.idle_timeout_with_objects = timeout;
        self
    }

    pub fn login_wait(mut self, wait: Duration) -> Self {
        self.login_wait = wait;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn dump_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dump_path = path.into();
        self
    }

    pub fn archive_dumps(mut self, archive: bool) -> Self {
        self.archive_dumps = archive;
        self
    }

    pub fn load_on_start(mut self, load: bool) -> Self {
        self.load_on_start = load;
        self
    }

    pub fn audit_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.audit_log_path = Some(path.into());
        self
    }

    pub fn bcrypt_cost(mut self, cost: u32) -> Self {
        self.bcrypt_cost = cost;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn idle_sweep_interval(mut self, interval: Duration) -> Self {
        self.idle_sweep_interval = interval;
        self
    }

    pub fn dump_interval(mut self, interval: Option<Duration>) -> Self {
        self.dump_interval = interval;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.root_password.is_empty() {
            return Err("Root password cannot be empty".to_string());
        }

        if !(4..=31).contains(&self.bcrypt_cost) {
            return Err("bcrypt_cost must be between 4 and 31".to_string());
        }

        if self.idle_timeout.is_zero() || self.idle_timeout_with_objects.is_zero() {
            return Err("Idle timeouts must be > 0".to_string());
        }

        if self.idle_sweep_interval < MIN_TASK_INTERVAL {
            return Err("idle_sweep_interval must be at least one minute".to_string());
        }

        if self.dump_interval.is_some_and(|d| d < MIN_TASK_INTERVAL) {
            return Err("dump_interval must be at least one minute when set".to_string());
        }

        if self.dump_path.as_os_str().is_empty() {
            return Err("dump_path cannot be empty".to_string());
        }

        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("supergash")
    }
}
