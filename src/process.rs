//! Spawning local programs attached to pseudo-terminals.
//!
//! Interactive programs such as `ssh` only print password and host-key
//! prompts when talking to a terminal, so every process is started on a PTY.
//! A reader thread pumps the terminal output into a channel that a
//! [`Transcript`](crate::transcript::Transcript) consumes.

use std::fmt;
use std::io::{self, Read, Write};
use std::thread;

use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use shell_escape::unix::escape;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tracing::debug;

use crate::transcript::OutputStream;

const READ_CHUNK: usize = 4096;

/// Program and arguments to launch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandSpec {
    /// Executable name or path.
    pub program: String,
    /// Arguments passed verbatim.
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Creates a spec with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Splits a command line published by a remote job on whitespace.
    ///
    /// Job logs print plain `ssh` invocations without quoting, so no shell
    /// parsing is attempted.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::EmptyCommand`] when `line` holds no words.
    pub fn from_command_line(line: &str) -> Result<Self, SpawnError> {
        let mut words = line.split_whitespace().map(str::to_owned);
        let program = words.next().ok_or(SpawnError::EmptyCommand)?;
        Ok(Self {
            program,
            args: words.collect(),
        })
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", escape(self.program.as_str().into()))?;
        for arg in &self.args {
            write!(f, " {}", escape(arg.as_str().into()))?;
        }
        Ok(())
    }
}

/// Errors raised while starting or stopping a process.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SpawnError {
    /// The command line was blank.
    #[error("cannot run an empty command")]
    EmptyCommand,
    /// The process or its terminal could not be created.
    #[error("failed to start {program}: {message}")]
    Start {
        /// Program that failed to start.
        program: String,
        /// Underlying error.
        message: String,
    },
    /// The process could not be terminated.
    #[error("failed to stop process: {message}")]
    Kill {
        /// Underlying error.
        message: String,
    },
}

/// Control over a running process.
pub trait ProcessHandle: Send {
    /// Operating system process id, if known.
    fn id(&self) -> Option<u32>;

    /// Returns `true` while the process has not exited.
    fn is_running(&mut self) -> bool;

    /// Terminates the process. Killing an exited process succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::Kill`] when the signal cannot be delivered.
    fn kill(&mut self) -> Result<(), SpawnError>;
}

/// The three ends of a spawned process.
pub struct Spawned {
    /// Terminal output.
    pub output: OutputStream,
    /// Terminal input.
    pub input: Box<dyn Write + Send>,
    /// Lifecycle control.
    pub process: Box<dyn ProcessHandle>,
}

impl fmt::Debug for Spawned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spawned")
            .field("pid", &self.process.id())
            .finish_non_exhaustive()
    }
}

/// Abstraction over process creation to support fakes in tests.
pub trait Spawner: Send + Sync {
    /// Starts `spec` attached to a terminal.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::Start`] when the process cannot be created.
    fn spawn(&self, spec: &CommandSpec) -> Result<Spawned, SpawnError>;
}

/// Real spawner backed by the host's pseudo-terminal system.
#[derive(Clone, Copy, Debug)]
pub struct PtySpawner {
    rows: u16,
    cols: u16,
}

impl Default for PtySpawner {
    // Wide enough that long job command lines never wrap.
    fn default() -> Self {
        Self {
            rows: 24,
            cols: 512,
        }
    }
}

impl Spawner for PtySpawner {
    fn spawn(&self, spec: &CommandSpec) -> Result<Spawned, SpawnError> {
        let start_error = |err: &dyn fmt::Display| SpawnError::Start {
            program: spec.program.clone(),
            message: err.to_string(),
        };

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: self.rows,
                cols: self.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| start_error(&err))?;

        let mut command = CommandBuilder::new(&spec.program);
        command.args(&spec.args);
        command.env("TERM", "dumb");
        if let Ok(cwd) = std::env::current_dir() {
            command.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|err| start_error(&err))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| start_error(&err))?;
        let input = pair
            .master
            .take_writer()
            .map_err(|err| start_error(&err))?;

        let (sender, output) = unbounded_channel();
        thread::Builder::new()
            .name(format!("pty-{}", spec.program))
            .spawn(move || pump(reader, &sender))
            .map_err(|err| start_error(&err))?;

        debug!(command = %spec, pid = ?child.process_id(), "spawned process");
        Ok(Spawned {
            output,
            input,
            process: Box::new(PtyProcess {
                child,
                _master: pair.master,
            }),
        })
    }
}

// Ends when the terminal closes (EIO on Linux) or nobody listens any more.
fn pump(mut reader: Box<dyn Read + Send>, sink: &UnboundedSender<Vec<u8>>) {
    let mut chunk = [0_u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => return,
            Ok(read) => {
                let Some(bytes) = chunk.get(..read) else {
                    return;
                };
                if sink.send(bytes.to_vec()).is_err() {
                    return;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return,
        }
    }
}

struct PtyProcess {
    child: Box<dyn Child + Send + Sync>,
    _master: Box<dyn MasterPty + Send>,
}

impl ProcessHandle for PtyProcess {
    fn id(&self) -> Option<u32> {
        self.child.process_id()
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn kill(&mut self) -> Result<(), SpawnError> {
        if !self.is_running() {
            return Ok(());
        }
        self.child.kill().map_err(|err| SpawnError::Kill {
            message: err.to_string(),
        })?;
        self.child.try_wait().ok();
        Ok(())
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.is_running() {
            self.child.kill().ok();
        }
    }
}
