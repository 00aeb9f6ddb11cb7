//! Slurm job submission and connection metadata.
//!
//! The notebook runs as a batch job. Once scheduled, the job writes a log
//! holding the commands needed to reach it: the `srun` line for an
//! interactive step, the `ssh -NL` and `ssh -NR` tunnel lines, and the
//! notebook password. [`JobController`] submits the job and polls that log;
//! [`JobMetadata::parse`] extracts the values.

use std::time::Duration;

use shell_escape::unix::escape;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::session::{RemoteSession, SessionError};
use crate::teardown::{TeardownAction, TeardownStack};
use crate::transcript::{MatchError, Pattern};

/// Default batch script submitted with `sbatch`.
pub const DEFAULT_SUBMIT_SCRIPT: &str = "jupyter.sbatch";

/// Default name of the job log; `{job_id}` is replaced with the job id.
pub const DEFAULT_LOG_TEMPLATE: &str = "slurm-{job_id}.out";

// Anchored to the line end so an id split across reads is never cut short.
const SUBMITTED: &str = r"Submitted batch job (\d+)\r?\n";
const LOCAL_TUNNEL_PREFIX: &str = "ssh -NL";
const REVERSE_TUNNEL_PREFIX: &str = "ssh -NR";
const STEP_PREFIX: &str = "srun";
const PASSWORD_LABEL: &str = "password:";

/// Inputs for `sbatch`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubmissionRequest {
    /// Batch script path on the remote host.
    pub script: String,
    /// Conda environment passed to the script.
    pub environment: String,
    /// `--mem` value, for example `16G`.
    pub memory: Option<String>,
    /// `--time` value, for example `04:00:00`.
    pub wall_time: Option<String>,
    /// `--cpus-per-task` value.
    pub cpus: Option<u32>,
}

impl SubmissionRequest {
    /// Request for the default script with no resource limits.
    #[must_use]
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            script: String::from(DEFAULT_SUBMIT_SCRIPT),
            environment: environment.into(),
            memory: None,
            wall_time: None,
            cpus: None,
        }
    }

    /// Renders `sbatch [--mem=M] [--time=T] [--cpus-per-task=N] <script> <env>`.
    #[must_use]
    pub fn command(&self) -> String {
        let mut parts = vec![String::from("sbatch")];
        if let Some(memory) = &self.memory {
            parts.push(format!("--mem={}", escape(memory.as_str().into())));
        }
        if let Some(wall_time) = &self.wall_time {
            parts.push(format!("--time={}", escape(wall_time.as_str().into())));
        }
        if let Some(cpus) = self.cpus {
            parts.push(format!("--cpus-per-task={cpus}"));
        }
        parts.push(escape(self.script.as_str().into()).into_owned());
        parts.push(escape(self.environment.as_str().into()).into_owned());
        parts.join(" ")
    }
}

/// A submitted batch job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Job {
    id: String,
}

impl Job {
    /// Wraps a job id reported by `sbatch`.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// The numeric job id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Log file name rendered from `template`.
    #[must_use]
    pub fn log_file(&self, template: &str) -> String {
        log_file(template, &self.id)
    }
}

/// Renders the log name for `job_id`.
#[must_use]
pub fn log_file(template: &str, job_id: &str) -> String {
    template.replace("{job_id}", job_id)
}

/// Connection details published in the job log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobMetadata {
    /// `srun …` line starting the interactive step.
    pub step_command: String,
    /// `ssh -NL …` line run on the operator's machine.
    pub local_tunnel: String,
    /// `ssh -NR …` line run inside the interactive step.
    pub reverse_tunnel: String,
    /// Notebook password.
    pub password: String,
    /// Local end of the `-NL` forward.
    pub local_port: u16,
    /// The log text the values were read from.
    pub raw: String,
}

/// Errors raised while reading the job log.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MetadataError {
    /// A required line is absent.
    #[error("job log has no {field}")]
    MissingField {
        /// Which value is missing.
        field: &'static str,
    },
    /// The `-NL` forward spec has no usable local port.
    #[error("cannot read a local port from forward spec {spec:?}")]
    InvalidPort {
        /// The forward spec as printed.
        spec: String,
    },
}

impl JobMetadata {
    /// Extracts connection details from job log text.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::MissingField`] naming the first absent value,
    /// or [`MetadataError::InvalidPort`] for an unreadable forward spec.
    pub fn parse(text: &str) -> Result<Self, MetadataError> {
        let line_starting = |prefix: &str| {
            text.lines()
                .map(str::trim)
                .find(|line| line.starts_with(prefix))
                .map(str::to_owned)
        };

        let step_command = line_starting(STEP_PREFIX).ok_or(MetadataError::MissingField {
            field: "interactive step command (srun)",
        })?;
        let local_tunnel =
            line_starting(LOCAL_TUNNEL_PREFIX).ok_or(MetadataError::MissingField {
                field: "local tunnel command (ssh -NL)",
            })?;
        let reverse_tunnel =
            line_starting(REVERSE_TUNNEL_PREFIX).ok_or(MetadataError::MissingField {
                field: "reverse tunnel command (ssh -NR)",
            })?;
        let password = text
            .lines()
            .filter_map(|line| line.rsplit_once(PASSWORD_LABEL))
            .filter_map(|(_, value)| value.split_whitespace().next())
            .next()
            .map(str::to_owned)
            .ok_or(MetadataError::MissingField {
                field: "notebook password",
            })?;
        let local_port = forwarded_port(&local_tunnel)?;

        Ok(Self {
            step_command,
            local_tunnel,
            reverse_tunnel,
            password,
            local_port,
            raw: text.to_owned(),
        })
    }
}

// Accepts `-NL port:host:hostport`, `-NL bind:port:host:hostport` and the
// joined `-NLport:host:hostport` form.
fn forwarded_port(command: &str) -> Result<u16, MetadataError> {
    let mut words = command.split_whitespace();
    let spec = words
        .find_map(|word| word.strip_prefix("-NL"))
        .and_then(|joined| {
            if joined.is_empty() {
                words.next()
            } else {
                Some(joined)
            }
        })
        .ok_or(MetadataError::MissingField {
            field: "local forward spec",
        })?;

    let fields: Vec<&str> = spec.split(':').collect();
    let port = match fields.as_slice() {
        [port, _, _] | [_, port, _, _] => port.parse::<u16>().ok(),
        _ => None,
    };
    port.filter(|port| *port != 0)
        .ok_or_else(|| MetadataError::InvalidPort {
            spec: spec.to_owned(),
        })
}

/// Timing and naming for job submission and polling.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobSettings {
    /// Bound on `sbatch` reporting a job id.
    pub submit_timeout: Duration,
    /// Pause before each read of the job log.
    pub poll_interval: Duration,
    /// Reads of the job log before giving up.
    pub max_polls: u32,
    /// Log file name template.
    pub log_template: String,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            submit_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            max_polls: 120,
            log_template: String::from(DEFAULT_LOG_TEMPLATE),
        }
    }
}

/// Errors raised while submitting or polling a job.
#[derive(Debug, Error)]
pub enum JobError {
    /// `sbatch` did not report a job id.
    #[error("job submission failed: {message}")]
    Submission {
        /// What the remote side printed, or why nothing was read.
        message: String,
    },
    /// The job log never published connection details.
    #[error("job {job_id} published no connection details after {attempts} polls")]
    NeverReady {
        /// Job that was polled.
        job_id: String,
        /// Number of log reads.
        attempts: u32,
    },
    /// The remote session failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Submits the notebook job and waits for its connection details.
#[derive(Clone, Debug)]
pub struct JobController {
    settings: JobSettings,
}

impl JobController {
    /// Creates a controller.
    #[must_use]
    pub const fn new(settings: JobSettings) -> Self {
        Self { settings }
    }

    /// Submits `request` and registers the job's cleanup actions.
    ///
    /// `CancelJob` and `DeleteLog` are registered as soon as the id is read,
    /// before waiting for the prompt.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Submission`] when no job id appears within the
    /// submit timeout or the prompt returns first.
    pub async fn submit(
        &self,
        session: &mut RemoteSession,
        request: &SubmissionRequest,
        teardown: &mut TeardownStack,
    ) -> Result<Job, JobError> {
        let command = request.command();
        info!(%command, "submitting notebook job");
        session.send_line(&command)?;

        let patterns = [
            Pattern::regex(SUBMITTED).map_err(SessionError::from)?,
            session.prompt().clone(),
        ];
        let found = match session
            .await_pattern(&patterns, self.settings.submit_timeout)
            .await
        {
            Ok(found) => found,
            Err(SessionError::Match(MatchError::Timeout { waited, tail, .. })) => {
                return Err(JobError::Submission {
                    message: format!("no job id reported after {waited:?}: {}", tail.trim()),
                });
            }
            Err(err) => return Err(err.into()),
        };

        let Some(id) = found.capture(1).filter(|_| found.index == 0) else {
            return Err(JobError::Submission {
                message: last_output_line(&found.before, &command),
            });
        };

        let job = Job::new(id);
        teardown.register(TeardownAction::CancelJob(job.id().to_owned()));
        teardown.register(TeardownAction::DeleteLog(job.id().to_owned()));
        session.await_prompt().await?;
        info!(job_id = job.id(), "job submitted");
        Ok(job)
    }

    /// Reads the job log until it carries a local tunnel line and returns
    /// its text.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NeverReady`] after `max_polls` reads without
    /// connection details.
    pub async fn poll_for_metadata(
        &self,
        session: &mut RemoteSession,
        job: &Job,
    ) -> Result<String, JobError> {
        let log = job.log_file(&self.settings.log_template);
        let command = format!("cat {}", escape(log.as_str().into()));
        info!(job_id = job.id(), %log, "waiting for the job to start");

        for attempt in 1..=self.settings.max_polls {
            sleep(self.settings.poll_interval).await;
            let output = session.run(&command).await?;
            let ready = output
                .lines()
                .any(|line| line.trim_start().starts_with(LOCAL_TUNNEL_PREFIX));
            debug!(job_id = job.id(), attempt, ready, "polled job log");
            if ready {
                return Ok(output);
            }
        }

        Err(JobError::NeverReady {
            job_id: job.id().to_owned(),
            attempts: self.settings.max_polls,
        })
    }
}

fn last_output_line(before: &str, command: &str) -> String {
    before
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty() && *line != command)
        .map_or_else(
            || String::from("no job id reported"),
            str::to_owned,
        )
}
