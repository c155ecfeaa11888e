//! Supervisor: keeps the reconciler running.
//!
//! Fatal errors end supervision with a distinct exit status; anything else restarts the
//! reconciler from initialize after a fixed delay.

use crate::engine::{EngineError, Reconciler};
use crate::responder::Responder;
use crate::source::EventSource;
use crate::state::StateStore;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Why supervision stopped.
#[derive(Debug)]
pub enum Exit {
    /// Unrecoverable error; the process should exit with `code`.
    Fatal { code: i32, error: EngineError },
    /// Shutdown was requested.
    Shutdown,
}

impl Exit {
    pub fn code(&self) -> i32 {
        match self {
            Exit::Fatal { code, .. } => *code,
            Exit::Shutdown => 0,
        }
    }
}

pub struct Supervisor<S, R, T> {
    engine: Reconciler<S, R, T>,
    restart_backoff: Duration,
    restarts: u64,
}

impl<S, R, T> Supervisor<S, R, T>
where
    S: EventSource,
    R: Responder,
    T: StateStore,
{
    pub fn new(engine: Reconciler<S, R, T>, restart_backoff: Duration) -> Self {
        Self {
            engine,
            restart_backoff,
            restarts: 0,
        }
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn engine(&self) -> &Reconciler<S, R, T> {
        &self.engine
    }

    /// Supervise until a fatal error.
    pub async fn run(&mut self) -> Exit {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Supervise until a fatal error or until `shutdown` completes. An in-flight iteration
    /// is dropped on shutdown; progress is only ever persisted after confirmation, so the
    /// next start resumes from the last persisted checkpoint.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Exit
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            let result = tokio::select! {
                r = self.engine.run() => r,
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    return Exit::Shutdown;
                }
            };
            let error = match result {
                Ok(never) => match never {},
                Err(e) => e,
            };
            if let Some(code) = error.exit_code() {
                tracing::error!(reason = %error, code, "fatal error, stopping");
                return Exit::Fatal { code, error };
            }
            self.restarts += 1;
            tracing::warn!(
                reason = %error,
                restarts = self.restarts,
                backoff_secs = self.restart_backoff.as_secs_f64(),
                "reconciler stopped, restarting"
            );
            tokio::select! {
                _ = sleep(self.restart_backoff) => {}
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    return Exit::Shutdown;
                }
            }
        }
    }
}
