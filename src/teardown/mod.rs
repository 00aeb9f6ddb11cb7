//! Last-in, first-out cleanup of acquired resources.
//!
//! Each step registers a [`TeardownAction`] as soon as the resource it
//! created exists. [`TeardownStack::run_all`] executes the actions in reverse
//! order exactly once; a failing action is logged and reported but never
//! stops the ones after it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::session::SessionError;
use crate::tunnel::{TunnelError, TunnelHandle};

/// Cleanup owed for one acquired resource.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TeardownAction {
    /// Cancel the Slurm job with this id.
    CancelJob(String),
    /// Delete the log of the job with this id.
    DeleteLog(String),
    /// Stop a tunnel.
    CancelTunnel(TunnelHandle),
    /// Leave the nested interactive shell.
    ExitNestedSession,
}

impl fmt::Display for TeardownAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CancelJob(id) => write!(f, "cancel job {id}"),
            Self::DeleteLog(id) => write!(f, "delete log of job {id}"),
            Self::CancelTunnel(handle) => write!(f, "cancel {handle}"),
            Self::ExitNestedSession => f.write_str("exit interactive session"),
        }
    }
}

/// Errors raised while executing a cleanup action.
#[derive(Debug, Error)]
pub enum TeardownError {
    /// The remote session failed.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Stopping a tunnel failed.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    /// The action needs a remote session and none is open.
    #[error("no remote session is available")]
    SessionUnavailable,
}

/// Future returned by [`TeardownExecutor::execute`].
pub type TeardownFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TeardownError>> + Send + 'a>>;

/// Interprets every [`TeardownAction`] variant.
pub trait TeardownExecutor {
    /// Performs `action`.
    fn execute<'a>(&'a mut self, action: &'a TeardownAction) -> TeardownFuture<'a>;
}

/// An action that failed during [`TeardownStack::run_all`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TeardownFailure {
    /// The action.
    pub action: TeardownAction,
    /// Rendered error.
    pub message: String,
}

/// Outcome of a teardown run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TeardownReport {
    /// Actions that succeeded, in execution order.
    pub completed: Vec<TeardownAction>,
    /// Actions that failed, in execution order.
    pub failed: Vec<TeardownFailure>,
}

impl TeardownReport {
    /// Returns `true` when nothing failed.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Registry of pending cleanup actions.
#[derive(Debug, Default)]
pub struct TeardownStack {
    actions: Vec<TeardownAction>,
    ran: bool,
}

impl TeardownStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `action`. Actions registered after the run are dropped.
    pub fn register(&mut self, action: TeardownAction) {
        if self.ran {
            warn!(%action, "teardown already ran; ignoring late action");
            return;
        }
        debug!(%action, "registered cleanup");
        self.actions.push(action);
    }

    /// Pending actions in registration order.
    #[must_use]
    pub fn pending(&self) -> &[TeardownAction] {
        &self.actions
    }

    /// Executes pending actions newest first. Only the first call does
    /// anything; later calls return an empty report.
    pub async fn run_all<E>(&mut self, executor: &mut E) -> TeardownReport
    where
        E: TeardownExecutor + ?Sized,
    {
        let mut report = TeardownReport::default();
        if self.ran {
            return report;
        }
        self.ran = true;

        while let Some(action) = self.actions.pop() {
            info!(%action, "cleaning up");
            match executor.execute(&action).await {
                Ok(()) => report.completed.push(action),
                Err(err) => {
                    warn!(%action, error = %err, "cleanup failed");
                    report.failed.push(TeardownFailure {
                        message: err.to_string(),
                        action,
                    });
                }
            }
        }
        report
    }
}
