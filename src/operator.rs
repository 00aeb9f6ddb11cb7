//! The operator-facing console.
//!
//! Host-key prompts and passwords need a human answer, and the final notebook
//! address must reach the operator. [`Operator`] keeps that interaction behind
//! a seam so the provisioning flow can be driven by scripted answers in tests.

use std::error::Error as StdError;
use std::fmt;
use std::io::{self, Write};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, warn};

static HIDDEN_PROMPT_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Something the flow needs the operator to answer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Question {
    /// An unknown host key; `prompt` is the client's text, relayed verbatim.
    HostKey {
        /// Prompt text from `ssh`.
        prompt: String,
    },
    /// A password, read without echo.
    Password {
        /// Prompt text from `ssh`.
        prompt: String,
    },
}

impl Question {
    /// The text shown to the operator.
    #[must_use]
    pub fn prompt(&self) -> &str {
        match self {
            Self::HostKey { prompt } | Self::Password { prompt } => prompt,
        }
    }
}

/// Errors raised while reading operator input.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum OperatorError {
    /// The terminal could not be read.
    #[error("failed to read operator input: {0}")]
    Input(String),
}

/// How to reach the running notebook.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionInfo {
    /// Local URL forwarded to the notebook.
    pub url: String,
    /// Notebook password.
    pub password: String,
    /// Slurm job hosting the notebook.
    pub job_id: String,
}

impl ConnectionInfo {
    /// Builds connection details for a notebook forwarded to `local_port`.
    #[must_use]
    pub fn new(local_port: u16, password: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            url: format!("http://localhost:{local_port}"),
            password: password.into(),
            job_id: job_id.into(),
        }
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(60);
        writeln!(f, "{rule}")?;
        writeln!(f, "  Jupyter notebook is running (job {})", self.job_id)?;
        writeln!(f)?;
        writeln!(f, "  URL:      {}", self.url)?;
        writeln!(f, "  Password: {}", self.password)?;
        writeln!(f)?;
        writeln!(f, "  Press Ctrl-C to stop the notebook and disconnect.")?;
        write!(f, "{rule}")
    }
}

/// Interaction with the person running the tool.
pub trait Operator: Send + Sync {
    /// Blocks until the operator answers `question`.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::Input`] when no answer can be read.
    fn ask(&self, question: &Question) -> Result<String, OperatorError>;

    /// Shows a recoverable problem.
    fn warn(&self, message: &str);

    /// Shows progress.
    fn notice(&self, message: &str);

    /// Shows the notebook address and password.
    fn announce(&self, info: &ConnectionInfo);

    /// Shows the error that ended provisioning.
    fn report(&self, error: &dyn StdError);
}

/// The real terminal.
#[derive(Clone, Copy, Debug, Default)]
pub struct Console;

impl Operator for Console {
    fn ask(&self, question: &Question) -> Result<String, OperatorError> {
        let read_error = |err: io::Error| OperatorError::Input(err.to_string());
        match question {
            Question::HostKey { prompt } => {
                let mut stdout = io::stdout();
                write!(stdout, "{} ", prompt.trim_end()).map_err(read_error)?;
                stdout.flush().map_err(read_error)?;
                let mut answer = String::new();
                io::stdin().read_line(&mut answer).map_err(read_error)?;
                Ok(answer.trim().to_owned())
            }
            Question::Password { prompt } => {
                let _hidden = HiddenPrompt::begin();
                rpassword::prompt_password(format!("{} ", prompt.trim())).map_err(read_error)
            }
        }
    }

    fn warn(&self, message: &str) {
        writeln!(io::stderr(), "warning: {message}").ok();
    }

    fn notice(&self, message: &str) {
        writeln!(io::stdout(), "{message}").ok();
    }

    fn announce(&self, info: &ConnectionInfo) {
        writeln!(io::stdout(), "{info}").ok();
    }

    fn report(&self, error: &dyn StdError) {
        writeln!(io::stderr(), "error: {error}").ok();
    }
}

/// Marks a password prompt with echo switched off.
struct HiddenPrompt;

impl HiddenPrompt {
    fn begin() -> Self {
        HIDDEN_PROMPT_ACTIVE.store(true, Ordering::SeqCst);
        Self
    }
}

impl Drop for HiddenPrompt {
    fn drop(&mut self) {
        HIDDEN_PROMPT_ACTIVE.store(false, Ordering::SeqCst);
    }
}

fn hidden_prompt_active() -> bool {
    HIDDEN_PROMPT_ACTIVE.load(Ordering::SeqCst)
}

/// Turns terminal echo back on when the process is about to exit while a
/// password prompt is still waiting for input.
///
/// The prompt runs on a blocking thread that never gets to restore the
/// terminal after Ctrl-C, so the caller does it before exiting.
pub fn restore_terminal() {
    if !hidden_prompt_active() {
        return;
    }
    debug!("restoring terminal echo after an unanswered password prompt");
    match Command::new("stty").arg("echo").status() {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(%status, "stty could not restore terminal echo"),
        Err(err) => warn!(error = %err, "failed to run stty"),
    }
}
