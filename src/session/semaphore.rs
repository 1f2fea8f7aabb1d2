use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct GateState {
    count: usize,
    disabled: Option<String>,
    /// A `disable` call holds the reason and is waiting for the count to drain.
    draining: bool,
}

/// Counting admission gate.
///
/// Logins, builder phase-2 runs and similar activities take a permit with
/// [`increment`](Self::increment) and give it back with
/// [`decrement`](Self::decrement). Maintenance phases close the gate with
/// [`disable`](Self::disable), optionally waiting for the live count to drain
/// to zero. While a draining disable is in progress new increments are
/// already refused, so the drain cannot be starved.
#[derive(Debug, Default)]
pub struct AdmissionSemaphore {
    state: Mutex<GateState>,
    changed: Notify,
}

impl AdmissionSemaphore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take a permit. A zero `timeout` never blocks; otherwise wait up to
    /// `timeout` for the gate to be re-enabled. Fails with the disable reason.
    pub async fn increment(&self, timeout: Duration) -> Result<(), String> {
        self.increment_until(Some(Instant::now() + timeout)).await
    }

    /// Take a permit, waiting as long as the gate stays disabled.
    pub async fn increment_forever(&self) -> Result<(), String> {
        self.increment_until(None).await
    }

    async fn increment_until(&self, deadline: Option<Instant>) -> Result<(), String> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let reason = {
                let mut state = self.state();
                match state.disabled.clone() {
                    None => {
                        state.count += 1;
                        return Ok(());
                    }
                    Some(reason) => reason,
                }
            };

            match deadline {
                Some(deadline) if Instant::now() >= deadline => return Err(reason),
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified.as_mut()).await.is_err() {
                        return Err(self.check_enabled().unwrap_or(reason));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Give back a permit.
    ///
    /// # Panics
    /// When no permit is held; that is a bookkeeping bug in the caller.
    pub fn decrement(&self) {
        {
            let mut state = self.state();
            if state.count == 0 {
                panic!("admission semaphore decremented below zero");
            }
            state.count -= 1;
        }
        self.changed.notify_waiters();
    }

    /// Close the gate with `reason`.
    ///
    /// Without `wait_for_zero` this only fails if the gate is already closed.
    /// With it, the call claims the gate (waiting for any other holder of the
    /// disable to re-enable first) and then waits for the count to reach zero:
    /// `None` waits forever, `Some(Duration::ZERO)` fails at once when permits
    /// are out, and a positive timeout reopens the gate and fails when it runs
    /// out.
    pub async fn disable(
        &self,
        reason: &str,
        wait_for_zero: bool,
        timeout: Option<Duration>,
    ) -> Result<(), String> {
        if !wait_for_zero {
            let mut state = self.state();
            if let Some(current) = &state.disabled {
                return Err(format!("Logins already disabled: {}", current));
            }
            state.disabled = Some(reason.to_string());
            info!(reason, "admission disabled");
            return Ok(());
        }

        {
            let mut state = self.state();
            if state.disabled.is_none() && state.count == 0 {
                state.disabled = Some(reason.to_string());
                info!(reason, "admission disabled");
                return Ok(());
            }
            if timeout == Some(Duration::ZERO) {
                return match &state.disabled {
                    Some(current) => Err(format!("Logins already disabled: {}", current)),
                    None => Err(format!("Login count not zero: {}", state.count)),
                };
            }
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut claimed = false;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if !claimed && state.disabled.is_none() {
                    state.disabled = Some(reason.to_string());
                    state.draining = true;
                    claimed = true;
                    debug!(reason, count = state.count, "admission draining");
                }
                if claimed && state.count == 0 {
                    state.draining = false;
                    info!(reason, "admission disabled");
                    return Ok(());
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified.as_mut()).await.is_err() {
                        let remaining = {
                            let mut state = self.state();
                            if claimed {
                                state.disabled = None;
                                state.draining = false;
                            }
                            state.count
                        };
                        if claimed {
                            self.changed.notify_waiters();
                        }
                        debug!(reason, remaining, "admission drain timed out");
                        return Err(format!("Timeout ({} holders remaining)", remaining));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Reopen the gate and wake anyone waiting for it.
    pub fn enable(&self) {
        {
            let mut state = self.state();
            state.disabled = None;
            state.draining = false;
        }
        info!("admission enabled");
        self.changed.notify_waiters();
    }

    /// The disable reason, if closed. Never touches the count.
    pub fn check_enabled(&self) -> Option<String> {
        self.state().disabled.clone()
    }

    pub fn is_draining(&self) -> bool {
        self.state().draining
    }

    pub fn count(&self) -> usize {
        self.state().count
    }
}
