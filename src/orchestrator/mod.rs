//! Composes the provisioning flow and owns its single error boundary.
//!
//! [`Orchestrator::run`] connects, submits the notebook job, waits for its
//! connection details, layers the tunnels, announces the notebook, and idles
//! until the operator cancels or a tunnel dies. Whatever happens, every
//! registered cleanup action then runs once and the session is closed.

use std::sync::Arc;
use std::time::Duration;

use shell_escape::unix::escape;
use thiserror::Error;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

use crate::cancel::Cancellation;
use crate::job::{
    self, JobController, JobError, JobMetadata, JobSettings, MetadataError, SubmissionRequest,
};
use crate::operator::{ConnectionInfo, Operator};
use crate::process::Spawner;
use crate::session::{Credentials, RemoteSession, SessionError, SessionSettings};
use crate::step::{InteractiveSessionLauncher, StepError};
use crate::teardown::{
    TeardownAction, TeardownError, TeardownExecutor, TeardownFuture, TeardownReport,
    TeardownStack,
};
use crate::tunnel::{TunnelError, TunnelManager, TunnelSettings};

const QUITTING: &str = "Quitting...";

/// Resolved settings for one run.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Login details.
    pub credentials: Credentials,
    /// Remote shell settings.
    pub session: SessionSettings,
    /// The `sbatch` request.
    pub submission: SubmissionRequest,
    /// Submission and polling bounds.
    pub job: JobSettings,
    /// Tunnel negotiation bounds.
    pub tunnel: TunnelSettings,
    /// Text printed once the interactive step is up.
    pub step_marker: String,
    /// Bound on the interactive step start.
    pub step_timeout: Duration,
    /// How often tunnels and the session are checked while idle.
    pub monitor_interval: Duration,
}

/// Errors that end provisioning.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The remote session failed.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Submitting or polling the job failed.
    #[error(transparent)]
    Job(#[from] JobError),
    /// The job log lacked connection details.
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    /// A tunnel failed or exited.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    /// The interactive step did not start.
    #[error(transparent)]
    Step(#[from] StepError),
    /// The login connection dropped while idle.
    #[error("the connection to the login host was lost")]
    SessionLost,
}

/// How a run without errors ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Ending {
    /// The operator cancelled before the notebook was ready.
    CancelledDuringProvisioning,
    /// The operator cancelled a running notebook.
    Interrupted,
}

/// Result of [`Orchestrator::run`].
#[derive(Debug)]
pub struct RunReport {
    /// How the run ended.
    pub outcome: Result<Ending, ProvisionError>,
    /// Details announced to the operator, if provisioning got that far.
    pub connection: Option<ConnectionInfo>,
    /// What cleanup did.
    pub teardown: TeardownReport,
}

impl RunReport {
    /// Process exit status: `0` unless provisioning failed.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self.outcome {
            Ok(_) => 0,
            Err(_) => 1,
        }
    }
}

/// Drives one notebook from connection to teardown.
pub struct Orchestrator {
    settings: Settings,
    spawner: Arc<dyn Spawner>,
    operator: Arc<dyn Operator>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub const fn new(
        settings: Settings,
        spawner: Arc<dyn Spawner>,
        operator: Arc<dyn Operator>,
    ) -> Self {
        Self {
            settings,
            spawner,
            operator,
        }
    }

    /// Runs the whole flow. Never returns before cleanup has run.
    ///
    /// Errors are reported to the operator and returned in the report
    /// rather than propagated.
    pub async fn run(&self, cancellation: &mut Cancellation) -> RunReport {
        let mut resources = Resources {
            session: None,
            tunnels: TunnelManager::new(
                Arc::clone(&self.spawner),
                Arc::clone(&self.operator),
                self.settings.tunnel.clone(),
            ),
            log_template: self.settings.job.log_template.clone(),
        };
        let mut teardown = TeardownStack::new();
        let mut connection = None;

        let outcome = match self
            .provision(&mut resources, &mut teardown, cancellation)
            .await
        {
            Err(Halt::Cancelled) => {
                info!("cancelled during provisioning");
                self.operator.notice(QUITTING);
                Ok(Ending::CancelledDuringProvisioning)
            }
            Ok(info) => {
                self.operator.announce(&info);
                connection = Some(info);
                self.idle(&mut resources, cancellation).await
            }
            Err(Halt::Failed(err)) => Err(err),
        };

        if let Err(err) = &outcome {
            error!(error = %err, "provisioning failed");
            self.operator.report(err);
        }

        let report = teardown.run_all(&mut resources).await;
        for failure in &report.failed {
            self.operator.warn(&format!(
                "cleanup step `{}` failed: {}",
                failure.action, failure.message
            ));
        }
        if let Some(session) = resources.session.as_mut() {
            session.close();
        }
        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            "teardown finished"
        );

        RunReport {
            outcome,
            connection,
            teardown: report,
        }
    }

    // Every step races cancellation except job submission: once `sbatch`
    // is sent the job id must be read so the job can be cancelled.
    async fn provision(
        &self,
        resources: &mut Resources,
        teardown: &mut TeardownStack,
        cancellation: &mut Cancellation,
    ) -> Result<ConnectionInfo, Halt> {
        let established = until_cancelled(
            cancellation,
            RemoteSession::establish(
                &self.settings.credentials,
                &self.settings.session,
                self.spawner.as_ref(),
            ),
        )
        .await?;
        let session = resources.session.insert(established);

        let controller = JobController::new(self.settings.job.clone());
        let job = controller
            .submit(session, &self.settings.submission, teardown)
            .await
            .map_err(failed)?;
        if cancellation.is_cancelled() {
            return Err(Halt::Cancelled);
        }

        let log =
            until_cancelled(cancellation, controller.poll_for_metadata(session, &job)).await?;
        let metadata = JobMetadata::parse(&log).map_err(failed)?;

        until_cancelled(
            cancellation,
            resources.tunnels.start_local(&metadata.local_tunnel, teardown),
        )
        .await?;

        let launcher =
            InteractiveSessionLauncher::new(&self.settings.step_marker, self.settings.step_timeout);
        until_cancelled(
            cancellation,
            launcher.start(session, &metadata.step_command, teardown),
        )
        .await?;

        until_cancelled(
            cancellation,
            resources
                .tunnels
                .start_reverse(session, &metadata.reverse_tunnel, teardown),
        )
        .await?;

        info!(job_id = job.id(), port = metadata.local_port, "notebook ready");
        Ok(ConnectionInfo::new(
            metadata.local_port,
            metadata.password,
            job.id(),
        ))
    }

    async fn idle(
        &self,
        resources: &mut Resources,
        cancellation: &mut Cancellation,
    ) -> Result<Ending, ProvisionError> {
        let mut ticks = interval(self.settings.monitor_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = cancellation.cancelled() => {
                    self.operator.notice(QUITTING);
                    return Ok(Ending::Interrupted);
                }
                _ = ticks.tick() => {
                    resources.tunnels.check_local()?;
                    if !resources.session.as_mut().is_some_and(RemoteSession::is_alive) {
                        return Err(ProvisionError::SessionLost);
                    }
                }
            }
        }
    }
}

/// Why provisioning stopped early.
enum Halt {
    Cancelled,
    Failed(ProvisionError),
}

fn failed(err: impl Into<ProvisionError>) -> Halt {
    Halt::Failed(err.into())
}

/// Runs `work` unless cancellation comes first; `work` is dropped then.
async fn until_cancelled<T, E, F>(cancellation: &mut Cancellation, work: F) -> Result<T, Halt>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ProvisionError>,
{
    tokio::select! {
        biased;
        () = cancellation.cancelled() => Err(Halt::Cancelled),
        result = work => result.map_err(failed),
    }
}

/// Everything teardown acts on.
struct Resources {
    session: Option<RemoteSession>,
    tunnels: TunnelManager,
    log_template: String,
}

impl Resources {
    /// The session, ready for a cleanup command.
    async fn ready_session(&mut self) -> Result<&mut RemoteSession, TeardownError> {
        let session = self
            .session
            .as_mut()
            .ok_or(TeardownError::SessionUnavailable)?;
        session.recover().await?;
        Ok(session)
    }
}

impl TeardownExecutor for Resources {
    fn execute<'a>(&'a mut self, action: &'a TeardownAction) -> TeardownFuture<'a> {
        Box::pin(async move {
            match action {
                TeardownAction::CancelTunnel(handle) => {
                    self.tunnels.cancel(*handle, self.session.as_mut()).await?;
                }
                TeardownAction::ExitNestedSession => {
                    self.ready_session().await?.run("exit").await?;
                }
                TeardownAction::DeleteLog(job_id) => {
                    let log = job::log_file(&self.log_template, job_id);
                    let command = format!("rm -f {}", escape(log.into()));
                    self.ready_session().await?.run(&command).await?;
                }
                TeardownAction::CancelJob(job_id) => {
                    let command = format!("scancel {}", escape(job_id.as_str().into()));
                    self.ready_session().await?.run(&command).await?;
                }
            }
            Ok(())
        })
    }
}
