//! The authenticated remote shell that every job command runs through.
//!
//! [`RemoteSession`] drives the system `ssh` client on a pseudo-terminal. On
//! login it replaces the remote prompt with a unique marker so command
//! completion can be detected reliably, then serialises commands: a new line
//! may only be sent once the previous command's completion has been observed.

use std::fmt;
use std::io::Write;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::process::{CommandSpec, ProcessHandle, SpawnError, Spawner};
use crate::transcript::{Match, MatchError, Pattern, Transcript};

/// Regex matching the prompt installed by [`PROMPT_COMMAND`].
///
/// The command text uses `\$`, so the terminal echo of the command itself
/// never matches; the shell renders it as `$` (or `#` for root).
pub const PROMPT_PATTERN: &str = r"\[jsom\][$#] ";

/// Shell input that installs the unique prompt.
pub const PROMPT_COMMAND: &str = r"unset PROMPT_COMMAND; PS1='[jsom]\$ '";

/// Default `StrictHostKeyChecking` policy for the login connection.
pub const DEFAULT_HOST_KEY_POLICY: &str = "accept-new";

const INTERRUPT: &[u8] = &[0x03];

const LOGIN_FAILURES: [(&str, &str); 6] = [
    ("Permission denied", "authentication was rejected"),
    ("Could not resolve hostname", "the host name could not be resolved"),
    ("Connection refused", "the connection was refused"),
    ("Connection timed out", "the connection timed out"),
    ("No route to host", "there is no route to the host"),
    (
        "Host key verification failed",
        "the host key could not be verified",
    ),
];

/// Login details for the remote host.
///
/// Passwords are never stored here; they are read from the operator at the
/// point of use.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Credentials {
    /// Host name or address of the login node.
    pub address: String,
    /// Remote account name.
    pub username: String,
    /// Private key used for authentication.
    pub key_path: Utf8PathBuf,
}

impl Credentials {
    /// `user@host` destination for `ssh`.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.address)
    }
}

/// Connection and wait settings for a [`RemoteSession`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionSettings {
    /// `ssh` executable.
    pub ssh_bin: String,
    /// Value passed as `-o StrictHostKeyChecking=`.
    pub host_key_policy: String,
    /// Bound on the whole login.
    pub login_timeout: Duration,
    /// Bound on each wait for the prompt.
    pub prompt_timeout: Duration,
    /// Echo raw remote output to standard error.
    pub echo: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            host_key_policy: String::from(DEFAULT_HOST_KEY_POLICY),
            login_timeout: Duration::from_secs(30),
            prompt_timeout: Duration::from_secs(30),
            echo: false,
        }
    }
}

impl SessionSettings {
    /// Builds the `ssh` invocation for `credentials`.
    #[must_use]
    pub fn command(&self, credentials: &Credentials) -> CommandSpec {
        CommandSpec::new(self.ssh_bin.as_str())
            .arg("-i")
            .arg(credentials.key_path.as_str())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("StrictHostKeyChecking={}", self.host_key_policy))
            .arg("-o")
            .arg("ServerAliveInterval=30")
            .arg(credentials.destination())
    }
}

/// Errors raised by the remote session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// `ssh` could not be started.
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// Login failed.
    #[error("could not connect to {address}: {reason}")]
    Connection {
        /// Host that was contacted.
        address: String,
        /// What went wrong.
        reason: String,
    },
    /// A command was sent before the previous one finished.
    #[error("cannot send input while `{pending}` is still running")]
    CommandInFlight {
        /// The unfinished command.
        pending: String,
    },
    /// A wait failed.
    #[error(transparent)]
    Match(#[from] MatchError),
    /// Writing to the terminal failed.
    #[error("failed to write to the remote session: {0}")]
    Write(String),
    /// The session was already closed.
    #[error("the remote session is closed")]
    Closed,
}

/// One interactive shell on the remote login host.
pub struct RemoteSession {
    address: String,
    transcript: Transcript,
    input: Box<dyn Write + Send>,
    process: Box<dyn ProcessHandle>,
    prompt: Pattern,
    prompt_timeout: Duration,
    in_flight: Option<String>,
    closed: bool,
}

impl fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSession")
            .field("address", &self.address)
            .field("in_flight", &self.in_flight)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl RemoteSession {
    /// Logs in and installs the unique prompt.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Connection`] when login fails, times out, or
    /// `ssh` exits, and [`SessionError::Spawn`] when `ssh` cannot start.
    pub async fn establish(
        credentials: &Credentials,
        settings: &SessionSettings,
        spawner: &dyn Spawner,
    ) -> Result<Self, SessionError> {
        let spec = settings.command(credentials);
        info!(destination = %credentials.destination(), "connecting to login host");
        let spawned = spawner.spawn(&spec)?;

        let mut session = Self {
            address: credentials.address.clone(),
            transcript: Transcript::new(spawned.output).with_echo(settings.echo),
            input: spawned.input,
            process: spawned.process,
            prompt: Pattern::regex(PROMPT_PATTERN)?,
            prompt_timeout: settings.prompt_timeout,
            in_flight: None,
            closed: false,
        };

        // Typed ahead; the remote shell reads it once it is up.
        session.send_line(PROMPT_COMMAND)?;

        let mut patterns = vec![session.prompt.clone()];
        patterns.extend(
            LOGIN_FAILURES
                .iter()
                .map(|(text, _)| Pattern::literal(*text)),
        );

        let outcome = session
            .transcript
            .expect(&patterns, Some(settings.login_timeout))
            .await;
        let reason = match outcome {
            Ok(found) if found.index == 0 => {
                session.in_flight = None;
                info!(address = %session.address, "remote session ready");
                return Ok(session);
            }
            Ok(found) => found
                .index
                .checked_sub(1)
                .and_then(|slot| LOGIN_FAILURES.get(slot))
                .map_or_else(|| found.matched.clone(), |(_, reason)| (*reason).to_owned()),
            Err(MatchError::Timeout { waited, .. }) => {
                format!("no shell prompt after {waited:?}")
            }
            Err(MatchError::StreamClosed { tail, .. }) => {
                format!("ssh exited: {}", last_line(&tail))
            }
            Err(err) => err.to_string(),
        };

        session.close();
        Err(SessionError::Connection {
            address: credentials.address.clone(),
            reason,
        })
    }

    /// The unique prompt pattern.
    #[must_use]
    pub const fn prompt(&self) -> &Pattern {
        &self.prompt
    }

    /// Returns `true` while a sent command has not been seen to finish.
    #[must_use]
    pub const fn has_command_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Sends `line` followed by a newline.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::CommandInFlight`] while the previous command
    /// is unfinished.
    pub fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        if let Some(pending) = &self.in_flight {
            return Err(SessionError::CommandInFlight {
                pending: pending.clone(),
            });
        }
        debug!(command = line, "sending");
        self.write_raw(format!("{line}\n").as_bytes())?;
        self.in_flight = Some(line.to_owned());
        Ok(())
    }

    /// Answers a prompt of the running command with a secret such as a
    /// password; the text is never logged.
    ///
    /// The running command stays in flight. Sent with nothing running, the
    /// secret itself counts as the pending input.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Write`] when the terminal is gone.
    pub fn send_secret(&mut self, secret: &str) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        debug!("sending secret input");
        self.write_raw(format!("{secret}\n").as_bytes())?;
        self.in_flight
            .get_or_insert_with(|| String::from("<secret>"));
        Ok(())
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        self.input
            .write_all(bytes)
            .and_then(|()| self.input.flush())
            .map_err(|err| SessionError::Write(err.to_string()))
    }

    /// Waits for the unique prompt within the prompt timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Match`] when the prompt does not appear.
    pub async fn await_prompt(&mut self) -> Result<Match, SessionError> {
        let prompt = [self.prompt.clone()];
        self.await_pattern(&prompt, self.prompt_timeout).await
    }

    /// Waits for one of `patterns`; any match marks the in-flight command
    /// as finished.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Match`] on timeout or when `ssh` exits.
    pub async fn await_pattern(
        &mut self,
        patterns: &[Pattern],
        wait: Duration,
    ) -> Result<Match, SessionError> {
        let found = self.await_progress(patterns, wait).await?;
        self.in_flight = None;
        Ok(found)
    }

    /// Waits for one of `patterns` printed by a command that keeps running,
    /// such as a password prompt. The command stays in flight, so
    /// [`RemoteSession::recover`] still interrupts it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Match`] on timeout or when `ssh` exits.
    pub async fn await_progress(
        &mut self,
        patterns: &[Pattern],
        wait: Duration,
    ) -> Result<Match, SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        Ok(self.transcript.expect(patterns, Some(wait)).await?)
    }

    /// Sends `line` and waits for the prompt, returning the command output.
    ///
    /// # Errors
    ///
    /// Propagates send and wait failures.
    pub async fn run(&mut self, line: &str) -> Result<String, SessionError> {
        self.send_line(line)?;
        Ok(self.await_prompt().await?.before)
    }

    /// Reinstalls the unique prompt, for example after entering a nested
    /// shell whose startup files reset `PS1`.
    ///
    /// # Errors
    ///
    /// Propagates send and wait failures.
    pub async fn sync_prompt(&mut self) -> Result<(), SessionError> {
        self.run(PROMPT_COMMAND).await.map(drop)
    }

    /// Writes the terminal interrupt character. Always permitted.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Write`] when the terminal is gone.
    pub fn interrupt(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        debug!("interrupting remote command");
        self.write_raw(INTERRUPT)
    }

    /// Interrupts an unfinished command and waits for the prompt, leaving
    /// the session ready for the next command.
    ///
    /// # Errors
    ///
    /// Propagates interrupt and wait failures.
    pub async fn recover(&mut self) -> Result<(), SessionError> {
        let Some(pending) = self.in_flight.clone() else {
            return Ok(());
        };
        warn!(command = %pending, "interrupting unfinished command");
        self.interrupt()?;
        self.await_prompt().await.map(drop)
    }

    /// Returns `true` while `ssh` runs and its output is open.
    pub fn is_alive(&mut self) -> bool {
        !self.closed && !self.transcript.is_closed() && self.process.is_running()
    }

    /// Logs out and stops `ssh`. Calling it again does nothing.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.write_raw(b"exit\n").ok();
        if let Err(err) = self.process.kill() {
            warn!(error = %err, "failed to stop ssh");
        }
        self.closed = true;
        self.in_flight = None;
        info!(address = %self.address, "remote session closed");
    }
}

fn last_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .unwrap_or_default()
}
