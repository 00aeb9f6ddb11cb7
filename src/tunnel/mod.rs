//! Local and reverse SSH tunnels to the notebook.
//!
//! The local tunnel (`ssh -NL …`) runs on the operator's machine and forwards
//! a local port to the compute node. The reverse tunnel (`ssh -NR …`) runs
//! inside the interactive job step and needs a password typed by the
//! operator. [`TunnelManager`] starts both, tracks their state, and stops
//! them during teardown.

use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::operator::{Operator, OperatorError, Question};
use crate::process::{CommandSpec, ProcessHandle, SpawnError, Spawned, Spawner};
use crate::session::{RemoteSession, SessionError};
use crate::teardown::{TeardownAction, TeardownStack};
use crate::transcript::{MatchError, Pattern, Transcript};

const HOST_CHANGED: &str = "REMOTE HOST IDENTIFICATION HAS CHANGED";
const HOST_QUESTION: &str = r"Are you sure you want to continue connecting[^?]*\?";
const HOST_ADDED: &str = "Permanently added";
const PASSWORD_PROMPT: &str = r"(?i)password:";
const RETRY_PASSWORD: &str = "Permission denied, please try again";
const PASSWORD_REJECTED: &str = "Permission denied (";
const INTERRUPT: &[u8] = &[0x03];

/// Which side a tunnel runs on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TunnelKind {
    /// Runs on the operator's machine.
    Local,
    /// Runs inside the remote session.
    Reverse,
}

/// Lifecycle of a tunnel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TunnelState {
    /// Started, outcome unknown.
    Starting,
    /// Waiting for the operator to accept a host key.
    AwaitingHostKeyDecision,
    /// Forwarding traffic.
    Established,
    /// Stopped during teardown.
    Cancelled,
    /// Failed to start or exited.
    Failed,
}

/// Identifies a started tunnel for teardown.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TunnelHandle {
    /// A local tunnel process.
    Local(u32),
    /// The reverse tunnel in the remote session.
    Reverse,
}

impl TunnelHandle {
    /// Which side the tunnel runs on.
    #[must_use]
    pub const fn kind(self) -> TunnelKind {
        match self {
            Self::Local(_) => TunnelKind::Local,
            Self::Reverse => TunnelKind::Reverse,
        }
    }
}

impl fmt::Display for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(id) => write!(f, "local tunnel #{id}"),
            Self::Reverse => f.write_str("reverse tunnel"),
        }
    }
}

/// Errors raised by tunnels.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The remote host key differs from the recorded one.
    #[error("remote host identification has changed for `{command}`; refusing to connect")]
    HostKeyMismatch {
        /// Tunnel command.
        command: String,
    },
    /// The operator declined an unknown host key.
    #[error("host key for `{command}` was not accepted")]
    HostRejected {
        /// Tunnel command.
        command: String,
    },
    /// The reverse tunnel password was refused.
    #[error("reverse tunnel authentication rejected after {attempts} attempt(s)")]
    AuthRejected {
        /// Passwords tried.
        attempts: u32,
    },
    /// The tunnel process exited.
    #[error("tunnel `{command}` exited: {output}")]
    Exited {
        /// Tunnel command.
        command: String,
        /// Its last output.
        output: String,
    },
    /// The handle names no known tunnel.
    #[error("unknown {0}")]
    Unknown(TunnelHandle),
    /// The reverse tunnel needs the remote session and none is open.
    #[error("the reverse tunnel needs an open remote session")]
    SessionUnavailable,
    /// Writing to the tunnel process failed.
    #[error("failed to write to tunnel process: {0}")]
    Write(String),
    /// The tunnel process could not be started or stopped.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// A wait on tunnel output failed.
    #[error(transparent)]
    Match(#[from] MatchError),
    /// The remote session failed.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// Operator input failed.
    #[error(transparent)]
    Operator(#[from] OperatorError),
}

/// Timing for tunnel negotiation and shutdown.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TunnelSettings {
    /// Quiet period after which a tunnel counts as established.
    pub probe: Duration,
    /// Bound on confirmations and password prompts.
    pub confirm_timeout: Duration,
    /// Passwords tried before the reverse tunnel gives up.
    pub max_password_attempts: u32,
    /// Pause between interrupting and killing a local tunnel.
    pub interrupt_grace: Duration,
    /// Echo raw tunnel output to standard error.
    pub echo: bool,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            probe: Duration::from_secs(3),
            confirm_timeout: Duration::from_secs(30),
            max_password_attempts: 3,
            interrupt_grace: Duration::from_millis(500),
            echo: false,
        }
    }
}

struct LocalTunnel {
    id: u32,
    command: String,
    transcript: Transcript,
    input: Box<dyn Write + Send>,
    process: Box<dyn ProcessHandle>,
    state: TunnelState,
}

impl LocalTunnel {
    fn write_line(&mut self, text: &str) -> Result<(), TunnelError> {
        self.input
            .write_all(format!("{text}\n").as_bytes())
            .and_then(|()| self.input.flush())
            .map_err(|err| TunnelError::Write(err.to_string()))
    }
}

/// Starts, supervises, and stops tunnels.
pub struct TunnelManager {
    spawner: Arc<dyn Spawner>,
    operator: Arc<dyn Operator>,
    settings: TunnelSettings,
    local: Vec<LocalTunnel>,
    next_id: u32,
    reverse: Option<TunnelState>,
}

impl fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelManager")
            .field("settings", &self.settings)
            .field("local", &self.local.len())
            .field("reverse", &self.reverse)
            .finish_non_exhaustive()
    }
}

impl TunnelManager {
    /// Creates a manager with no tunnels.
    #[must_use]
    pub const fn new(
        spawner: Arc<dyn Spawner>,
        operator: Arc<dyn Operator>,
        settings: TunnelSettings,
    ) -> Self {
        Self {
            spawner,
            operator,
            settings,
            local: Vec::new(),
            next_id: 0,
            reverse: None,
        }
    }

    /// Current state of the tunnel behind `handle`.
    #[must_use]
    pub fn state(&self, handle: TunnelHandle) -> Option<TunnelState> {
        match handle {
            TunnelHandle::Local(id) => self
                .local
                .iter()
                .find(|tunnel| tunnel.id == id)
                .map(|tunnel| tunnel.state),
            TunnelHandle::Reverse => self.reverse,
        }
    }

    /// Spawns `command` locally and negotiates host key checks.
    ///
    /// A changed host key is never accepted. An unknown host key is relayed
    /// to the operator, and only an answer of `yes` continues. Silence
    /// throughout the probe period means the tunnel is up. A process that
    /// fails is killed rather than registered for teardown.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::HostKeyMismatch`], [`TunnelError::HostRejected`]
    /// or [`TunnelError::Exited`] when the tunnel does not come up.
    pub async fn start_local(
        &mut self,
        command: &str,
        teardown: &mut TeardownStack,
    ) -> Result<TunnelHandle, TunnelError> {
        let spec = CommandSpec::from_command_line(command)?;
        let Spawned {
            output,
            input,
            process,
        } = self.spawner.spawn(&spec)?;

        let mut tunnel = LocalTunnel {
            id: self.next_id,
            command: command.to_owned(),
            transcript: Transcript::new(output).with_echo(self.settings.echo),
            input,
            process,
            state: TunnelState::Starting,
        };
        self.next_id += 1;
        info!(%command, "starting local tunnel");

        if let Err(err) = self.negotiate(&mut tunnel).await {
            tunnel.state = TunnelState::Failed;
            if let Err(kill_err) = tunnel.process.kill() {
                warn!(error = %kill_err, "failed to stop local tunnel");
            }
            return Err(err);
        }

        tunnel.state = TunnelState::Established;
        let handle = TunnelHandle::Local(tunnel.id);
        teardown.register(TeardownAction::CancelTunnel(handle));
        info!(%handle, "local tunnel established");
        self.local.push(tunnel);
        Ok(handle)
    }

    async fn negotiate(&self, tunnel: &mut LocalTunnel) -> Result<(), TunnelError> {
        let patterns = [Pattern::literal(HOST_CHANGED), Pattern::regex(HOST_QUESTION)?];
        let found = match tunnel
            .transcript
            .expect(&patterns, Some(self.settings.probe))
            .await
        {
            Ok(found) => found,
            Err(MatchError::Timeout { .. }) => return Ok(()),
            Err(MatchError::StreamClosed { tail, .. }) => {
                return Err(TunnelError::Exited {
                    command: tunnel.command.clone(),
                    output: tail.trim().to_owned(),
                });
            }
            Err(err) => return Err(err.into()),
        };

        if found.index == 0 {
            warn!(command = %tunnel.command, "remote host key has changed");
            return Err(TunnelError::HostKeyMismatch {
                command: tunnel.command.clone(),
            });
        }

        tunnel.state = TunnelState::AwaitingHostKeyDecision;
        let prompt = format!("{}{}", found.before, found.matched)
            .trim()
            .to_owned();
        let answer = self.ask(Question::HostKey { prompt }).await?;
        if !answer.trim().eq_ignore_ascii_case("yes") {
            return Err(TunnelError::HostRejected {
                command: tunnel.command.clone(),
            });
        }

        tunnel.write_line("yes")?;
        match tunnel
            .transcript
            .expect(&[Pattern::literal(HOST_ADDED)], Some(self.settings.confirm_timeout))
            .await
        {
            Ok(_) => {
                info!(command = %tunnel.command, "host key accepted");
                Ok(())
            }
            Err(MatchError::StreamClosed { tail, .. }) => Err(TunnelError::Exited {
                command: tunnel.command.clone(),
                output: tail.trim().to_owned(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Runs `command` in the remote session and answers its password
    /// prompts.
    ///
    /// A "please try again" reply warns the operator and asks again, up to
    /// the configured number of attempts. Silence throughout the probe
    /// period after a password means the tunnel is up. Until the shell
    /// prompt returns, `command` stays in flight in the session.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::AuthRejected`] when the password is refused
    /// outright or the attempts run out.
    pub async fn start_reverse(
        &mut self,
        session: &mut RemoteSession,
        command: &str,
        teardown: &mut TeardownStack,
    ) -> Result<TunnelHandle, TunnelError> {
        info!(%command, "starting reverse tunnel");
        self.reverse = Some(TunnelState::Starting);
        match self.negotiate_reverse(session, command).await {
            Ok(()) => {
                self.reverse = Some(TunnelState::Established);
                let handle = TunnelHandle::Reverse;
                teardown.register(TeardownAction::CancelTunnel(handle));
                info!(%handle, "reverse tunnel established");
                Ok(handle)
            }
            Err(err) => {
                self.reverse = Some(TunnelState::Failed);
                Err(err)
            }
        }
    }

    async fn negotiate_reverse(
        &self,
        session: &mut RemoteSession,
        command: &str,
    ) -> Result<(), TunnelError> {
        let password_prompt = [Pattern::regex(PASSWORD_PROMPT)?];
        let verdicts = [
            Pattern::literal(RETRY_PASSWORD),
            Pattern::literal(PASSWORD_REJECTED),
        ];

        session.send_line(command)?;
        let mut attempts = 0;
        loop {
            let found = session
                .await_progress(&password_prompt, self.settings.confirm_timeout)
                .await?;
            attempts += 1;
            let prompt = found
                .before
                .lines()
                .last()
                .map(str::trim_start)
                .unwrap_or_default()
                .to_owned();
            let password = self
                .ask(Question::Password {
                    prompt: format!("{prompt}{}", found.matched),
                })
                .await?;
            session.send_secret(&password)?;

            let verdict = match session
                .await_progress(&verdicts, self.settings.probe)
                .await
            {
                Ok(verdict) => verdict,
                Err(SessionError::Match(MatchError::Timeout { .. })) => return Ok(()),
                Err(err) => return Err(err.into()),
            };

            if verdict.index == 1 {
                // ssh has given up and the shell prompt follows.
                session.await_prompt().await.ok();
                return Err(TunnelError::AuthRejected { attempts });
            }
            if attempts >= self.settings.max_password_attempts {
                session.interrupt()?;
                session.await_prompt().await.ok();
                return Err(TunnelError::AuthRejected { attempts });
            }
            self.operator.warn("Permission denied, please try again.");
        }
    }

    async fn ask(&self, question: Question) -> Result<String, TunnelError> {
        let operator = Arc::clone(&self.operator);
        let answer = task::spawn_blocking(move || operator.ask(&question))
            .await
            .map_err(|err| OperatorError::Input(err.to_string()))??;
        Ok(answer)
    }

    /// Stops the tunnel behind `handle`. Stopping a stopped tunnel does
    /// nothing.
    ///
    /// The reverse tunnel is interrupted inside `session`; a local tunnel is
    /// interrupted, given a short grace period, then killed.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Unknown`] for a foreign handle and
    /// [`TunnelError::SessionUnavailable`] when the reverse tunnel has no
    /// session to stop it in.
    pub async fn cancel(
        &mut self,
        handle: TunnelHandle,
        session: Option<&mut RemoteSession>,
    ) -> Result<(), TunnelError> {
        match handle {
            TunnelHandle::Reverse => {
                if self.reverse == Some(TunnelState::Cancelled) {
                    return Ok(());
                }
                let session = session.ok_or(TunnelError::SessionUnavailable)?;
                session.interrupt()?;
                session.await_prompt().await?;
                self.reverse = Some(TunnelState::Cancelled);
            }
            TunnelHandle::Local(id) => {
                let grace = self.settings.interrupt_grace;
                let tunnel = self
                    .local
                    .iter_mut()
                    .find(|tunnel| tunnel.id == id)
                    .ok_or(TunnelError::Unknown(handle))?;
                if tunnel.state == TunnelState::Cancelled {
                    return Ok(());
                }
                if tunnel.process.is_running() {
                    tunnel.input.write_all(INTERRUPT).ok();
                    tunnel.input.flush().ok();
                    sleep(grace).await;
                    tunnel.process.kill()?;
                }
                tunnel.state = TunnelState::Cancelled;
            }
        }
        info!(%handle, "tunnel stopped");
        Ok(())
    }

    /// Checks that every established local tunnel is still running.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Exited`] for the first tunnel found dead; it is
    /// marked failed so the check reports it once.
    pub fn check_local(&mut self) -> Result<(), TunnelError> {
        for tunnel in &mut self.local {
            if tunnel.state == TunnelState::Established && !tunnel.process.is_running() {
                tunnel.state = TunnelState::Failed;
                warn!(command = %tunnel.command, "local tunnel exited");
                return Err(TunnelError::Exited {
                    command: tunnel.command.clone(),
                    output: tunnel.transcript.tail().trim().to_owned(),
                });
            }
        }
        Ok(())
    }
}
