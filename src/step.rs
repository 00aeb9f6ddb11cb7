//! Starts the nested interactive job step inside the remote session.
//!
//! The step command (`srun … --pty bash`) drops the remote shell into a new
//! login shell on the compute node. That shell announces itself with a marker,
//! usually the activated conda environment in parentheses, and resets `PS1`,
//! so the unique prompt is reinstalled once the marker is seen.

use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::session::{RemoteSession, SessionError};
use crate::teardown::{TeardownAction, TeardownStack};
use crate::transcript::{MatchError, Pattern};

/// Default wait for the step to start.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(120);

/// Marker printed by a shell with `environment` activated.
#[must_use]
pub fn default_marker(environment: &str) -> String {
    format!("({environment})")
}

/// Errors raised while starting the job step.
#[derive(Debug, Error)]
pub enum StepError {
    /// The marker never appeared.
    #[error("interactive step did not start: `{marker}` not seen; last output: {output}")]
    NotStarted {
        /// Marker that was awaited.
        marker: String,
        /// Tail of the remote output.
        output: String,
    },
    /// The remote session failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Launches the nested step and registers its exit.
#[derive(Clone, Debug)]
pub struct InteractiveSessionLauncher {
    marker: String,
    timeout: Duration,
}

impl InteractiveSessionLauncher {
    /// Creates a launcher waiting up to `timeout` for `marker`.
    #[must_use]
    pub fn new(marker: &str, timeout: Duration) -> Self {
        Self {
            marker: marker.to_owned(),
            timeout,
        }
    }

    /// Sends `command`, waits for the marker, then registers
    /// [`TeardownAction::ExitNestedSession`] and reinstalls the prompt.
    ///
    /// # Errors
    ///
    /// Returns [`StepError::NotStarted`] when the marker does not appear in
    /// time or the session ends first.
    pub async fn start(
        &self,
        session: &mut RemoteSession,
        command: &str,
        teardown: &mut TeardownStack,
    ) -> Result<(), StepError> {
        info!(%command, marker = %self.marker, "starting interactive step");
        session.send_line(command)?;

        let marker = [Pattern::literal(self.marker.as_str())];
        match session.await_pattern(&marker, self.timeout).await {
            Ok(_) => {}
            Err(SessionError::Match(
                MatchError::Timeout { tail, .. } | MatchError::StreamClosed { tail, .. },
            )) => {
                return Err(StepError::NotStarted {
                    marker: self.marker.clone(),
                    output: tail.trim().to_owned(),
                });
            }
            Err(err) => return Err(err.into()),
        }

        teardown.register(TeardownAction::ExitNestedSession);
        session.sync_prompt().await?;
        info!("interactive step ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Credentials, PROMPT_COMMAND, SessionSettings};
    use crate::test_support::{ScriptedProcess, ScriptedSpawner};
    use rstest::rstest;

    const PROMPT: &str = "[jsom]$ ";
    const STEP: &str = "srun --jobid 4242 --pty bash -l";

    async fn session_with(script: ScriptedProcess) -> (ScriptedSpawner, RemoteSession) {
        let spawner = ScriptedSpawner::new();
        spawner.push(script);
        let credentials = Credentials {
            address: String::from("hpc.example.org"),
            username: String::from("ada"),
            key_path: camino::Utf8PathBuf::from("/keys/id"),
        };
        let settings = SessionSettings {
            login_timeout: Duration::from_millis(200),
            prompt_timeout: Duration::from_millis(200),
            ..SessionSettings::default()
        };
        let session = RemoteSession::establish(&credentials, &settings, &spawner)
            .await
            .expect("session");
        (spawner, session)
    }

    #[rstest]
    fn marker_wraps_environment() {
        assert_eq!(default_marker("jupyter"), "(jupyter)");
    }

    #[rstest]
    #[tokio::test]
    async fn start_registers_exit_and_resyncs_prompt() {
        let (spawner, mut session) = session_with(
            ScriptedProcess::new()
                .reply(PROMPT)
                .reply("(jupyter) ada@node01:~$ ")
                .reply(PROMPT),
        )
        .await;
        let mut teardown = TeardownStack::new();
        let launcher = InteractiveSessionLauncher::new("(jupyter)", Duration::from_millis(200));

        launcher
            .start(&mut session, STEP, &mut teardown)
            .await
            .expect("step starts");

        assert_eq!(teardown.pending(), [TeardownAction::ExitNestedSession]);
        assert_eq!(
            spawner.inputs(0),
            [PROMPT_COMMAND, STEP, PROMPT_COMMAND]
        );
        assert!(!session.has_command_in_flight());
    }

    #[rstest]
    #[tokio::test]
    async fn missing_marker_registers_nothing() {
        let (_spawner, mut session) = session_with(
            ScriptedProcess::new()
                .reply(PROMPT)
                .reply("srun: job 4242 queued and waiting for resources\r\n"),
        )
        .await;
        let mut teardown = TeardownStack::new();
        let launcher = InteractiveSessionLauncher::new("(jupyter)", Duration::from_millis(50));

        let err = launcher
            .start(&mut session, STEP, &mut teardown)
            .await
            .expect_err("marker never appears");

        assert!(
            matches!(err, StepError::NotStarted { ref output, .. } if output.contains("waiting for resources")),
            "unexpected error: {err:?}"
        );
        assert!(teardown.pending().is_empty());
        assert!(session.has_command_in_flight());
    }
}
