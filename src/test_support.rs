//! Test support utilities shared across unit and integration tests.
//!
//! [`ScriptedSpawner`] hands out fake processes that answer each line written
//! to them with a pre-seeded reply, and [`ScriptedOperator`] answers operator
//! questions from a queue. Both record everything they see for assertions.

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};

use crate::cancel::CancelTrigger;
use crate::operator::{ConnectionInfo, Operator, OperatorError, Question};
use crate::process::{CommandSpec, ProcessHandle, SpawnError, Spawned, Spawner};

/// Marker recorded for a terminal interrupt byte.
pub const INTERRUPT_MARKER: &str = "^C";

const FAKE_PID_BASE: u32 = 40_000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Debug)]
enum Reply {
    Text(String),
    Chunks(Vec<String>),
    Delayed(Duration, String),
    HangUp,
}

/// Script for one fake process.
///
/// Each line (or interrupt) written to the process consumes the next reply in
/// order; once replies run out the process stays silent.
#[derive(Clone, Debug, Default)]
pub struct ScriptedProcess {
    banner: Option<String>,
    closed_at_start: bool,
    replies: VecDeque<Reply>,
}

impl ScriptedProcess {
    /// Creates a silent process.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Output printed as soon as the process starts.
    #[must_use]
    pub fn banner(mut self, text: impl Into<String>) -> Self {
        self.banner = Some(text.into());
        self
    }

    /// Closes the output right after the banner, as an exiting process does.
    #[must_use]
    pub const fn exits_at_start(mut self) -> Self {
        self.closed_at_start = true;
        self
    }

    /// Output printed in response to the next input.
    #[must_use]
    pub fn reply(mut self, text: impl Into<String>) -> Self {
        self.replies.push_back(Reply::Text(text.into()));
        self
    }

    /// Output printed in response to the next input, delivered as separate
    /// reads the way a terminal may split it.
    #[must_use]
    pub fn reply_in_chunks(mut self, chunks: &[&str]) -> Self {
        self.replies.push_back(Reply::Chunks(
            chunks.iter().map(|chunk| (*chunk).to_owned()).collect(),
        ));
        self
    }

    /// Output printed `delay` after the next input, like a slow remote
    /// command.
    #[must_use]
    pub fn reply_after(mut self, delay: Duration, text: impl Into<String>) -> Self {
        self.replies.push_back(Reply::Delayed(delay, text.into()));
        self
    }

    /// Prints nothing in response to the next input.
    #[must_use]
    pub fn silence(self) -> Self {
        self.reply("")
    }

    /// Closes the output in response to the next input.
    #[must_use]
    pub fn hang_up(mut self) -> Self {
        self.replies.push_back(Reply::HangUp);
        self
    }
}

#[derive(Debug, Default)]
struct ProcessLog {
    inputs: Vec<String>,
    killed: bool,
    exited: bool,
}

type SharedSender = Arc<Mutex<Option<UnboundedSender<Vec<u8>>>>>;

#[derive(Debug)]
struct SpawnRecord {
    spec: CommandSpec,
    log: Arc<Mutex<ProcessLog>>,
    sender: SharedSender,
}

#[derive(Debug, Default)]
struct SpawnerState {
    scripts: VecDeque<ScriptedProcess>,
    spawned: Vec<SpawnRecord>,
}

/// Spawner returning scripted processes in FIFO order.
#[derive(Clone, Debug, Default)]
pub struct ScriptedSpawner {
    state: Arc<Mutex<SpawnerState>>,
}

impl ScriptedSpawner {
    /// Creates a spawner with no scripts queued.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the script for the next spawned process.
    pub fn push(&self, script: ScriptedProcess) {
        lock(&self.state).scripts.push_back(script);
    }

    /// Commands spawned so far.
    #[must_use]
    pub fn spawned(&self) -> Vec<CommandSpec> {
        lock(&self.state)
            .spawned
            .iter()
            .map(|record| record.spec.clone())
            .collect()
    }

    /// Lines written to the `index`th process; interrupts appear as `^C`.
    #[must_use]
    pub fn inputs(&self, index: usize) -> Vec<String> {
        self.with_record(index, |record| lock(&record.log).inputs.clone())
            .unwrap_or_default()
    }

    /// Returns `true` when the `index`th process was killed.
    #[must_use]
    pub fn was_killed(&self, index: usize) -> bool {
        self.with_record(index, |record| lock(&record.log).killed)
            .unwrap_or_default()
    }

    /// Makes the `index`th process exit on its own.
    pub fn exit(&self, index: usize) {
        self.with_record(index, |record| {
            lock(&record.log).exited = true;
            lock(&record.sender).take();
        });
    }

    fn with_record<T>(&self, index: usize, read: impl FnOnce(&SpawnRecord) -> T) -> Option<T> {
        lock(&self.state).spawned.get(index).map(read)
    }
}

impl Spawner for ScriptedSpawner {
    fn spawn(&self, spec: &CommandSpec) -> Result<Spawned, SpawnError> {
        let mut state = lock(&self.state);
        let script = state.scripts.pop_front().ok_or_else(|| SpawnError::Start {
            program: spec.program.clone(),
            message: String::from("no scripted process left"),
        })?;

        let (tx, output) = unbounded_channel();
        if let Some(banner) = &script.banner {
            tx.send(banner.clone().into_bytes()).ok();
        }
        let sender: SharedSender = Arc::new(Mutex::new((!script.closed_at_start).then_some(tx)));
        let log = Arc::new(Mutex::new(ProcessLog {
            exited: script.closed_at_start,
            ..ProcessLog::default()
        }));
        let pid = FAKE_PID_BASE + u32::try_from(state.spawned.len()).unwrap_or_default();

        state.spawned.push(SpawnRecord {
            spec: spec.clone(),
            log: Arc::clone(&log),
            sender: Arc::clone(&sender),
        });

        Ok(Spawned {
            output,
            input: Box::new(ScriptedInput {
                partial: Vec::new(),
                replies: script.replies,
                log: Arc::clone(&log),
                sender: Arc::clone(&sender),
            }),
            process: Box::new(FakeProcess { pid, log, sender }),
        })
    }
}

struct ScriptedInput {
    partial: Vec<u8>,
    replies: VecDeque<Reply>,
    log: Arc<Mutex<ProcessLog>>,
    sender: SharedSender,
}

impl ScriptedInput {
    fn record(&mut self, entry: String) {
        lock(&self.log).inputs.push(entry);
        match self.replies.pop_front() {
            Some(Reply::Text(text)) => {
                if let Some(tx) = lock(&self.sender).as_ref() {
                    tx.send(text.into_bytes()).ok();
                }
            }
            Some(Reply::Chunks(chunks)) => {
                if let Some(tx) = lock(&self.sender).as_ref() {
                    for chunk in chunks {
                        tx.send(chunk.into_bytes()).ok();
                    }
                }
            }
            Some(Reply::Delayed(delay, text)) => {
                if let Some(tx) = lock(&self.sender).clone() {
                    thread::spawn(move || {
                        thread::sleep(delay);
                        tx.send(text.into_bytes()).ok();
                    });
                }
            }
            Some(Reply::HangUp) => {
                lock(&self.sender).take();
                lock(&self.log).exited = true;
            }
            None => {}
        }
    }
}

impl Write for ScriptedInput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for byte in buf {
            match byte {
                0x03 => self.record(String::from(INTERRUPT_MARKER)),
                b'\n' => {
                    let line = String::from_utf8_lossy(&self.partial).into_owned();
                    self.partial.clear();
                    self.record(line);
                }
                other => self.partial.push(*other),
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct FakeProcess {
    pid: u32,
    log: Arc<Mutex<ProcessLog>>,
    sender: SharedSender,
}

impl ProcessHandle for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn is_running(&mut self) -> bool {
        let log = lock(&self.log);
        !log.killed && !log.exited
    }

    fn kill(&mut self) -> Result<(), SpawnError> {
        lock(&self.log).killed = true;
        lock(&self.sender).take();
        Ok(())
    }
}

#[derive(Debug, Default)]
struct OperatorState {
    answers: VecDeque<String>,
    questions: Vec<Question>,
    warnings: Vec<String>,
    notices: Vec<String>,
    announcements: Vec<ConnectionInfo>,
    reports: Vec<String>,
    cancel_on_announce: Option<CancelTrigger>,
}

/// Operator answering from a queue and recording everything shown to it.
#[derive(Clone, Debug, Default)]
pub struct ScriptedOperator {
    state: Arc<Mutex<OperatorState>>,
}

impl ScriptedOperator {
    /// Creates an operator with no answers queued.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the answer to the next question.
    pub fn push_answer(&self, answer: impl Into<String>) {
        lock(&self.state).answers.push_back(answer.into());
    }

    /// Raises `trigger` as soon as connection details are announced, like an
    /// operator pressing Ctrl-C after reading them.
    pub fn cancel_on_announce(&self, trigger: CancelTrigger) {
        lock(&self.state).cancel_on_announce = Some(trigger);
    }

    /// Questions asked so far.
    #[must_use]
    pub fn questions(&self) -> Vec<Question> {
        lock(&self.state).questions.clone()
    }

    /// Warnings shown so far.
    #[must_use]
    pub fn warnings(&self) -> Vec<String> {
        lock(&self.state).warnings.clone()
    }

    /// Notices shown so far.
    #[must_use]
    pub fn notices(&self) -> Vec<String> {
        lock(&self.state).notices.clone()
    }

    /// Connection details announced so far.
    #[must_use]
    pub fn announcements(&self) -> Vec<ConnectionInfo> {
        lock(&self.state).announcements.clone()
    }

    /// Errors reported so far.
    #[must_use]
    pub fn reports(&self) -> Vec<String> {
        lock(&self.state).reports.clone()
    }
}

impl Operator for ScriptedOperator {
    fn ask(&self, question: &Question) -> Result<String, OperatorError> {
        let mut state = lock(&self.state);
        state.questions.push(question.clone());
        state
            .answers
            .pop_front()
            .ok_or_else(|| OperatorError::Input(String::from("no scripted answer left")))
    }

    fn warn(&self, message: &str) {
        lock(&self.state).warnings.push(message.to_owned());
    }

    fn notice(&self, message: &str) {
        lock(&self.state).notices.push(message.to_owned());
    }

    fn announce(&self, info: &ConnectionInfo) {
        let mut state = lock(&self.state);
        state.announcements.push(info.clone());
        if let Some(trigger) = &state.cancel_on_announce {
            trigger.cancel();
        }
    }

    fn report(&self, error: &dyn StdError) {
        lock(&self.state).reports.push(error.to_string());
    }
}
