//! Core library for the jsom notebook connector.
//!
//! The crate drives an interactive SSH session to an HPC login host by
//! matching patterns in the remote transcript: it submits a Jupyter notebook
//! as a Slurm job, scrapes the job's connection details from its log, layers
//! a local and a reverse tunnel, and hands the notebook address to the
//! operator. Every acquired resource is released exactly once, in reverse
//! order, however the run ends.

pub mod cancel;
pub mod config;
pub mod job;
pub mod logging;
pub mod operator;
pub mod orchestrator;
pub mod process;
pub mod session;
pub mod step;
pub mod teardown;
pub mod test_support;
pub mod transcript;
pub mod tunnel;

pub use config::{ConfigError, ConfigOverrides, JsomConfig};
pub use job::{Job, JobController, JobError, JobMetadata, JobSettings, SubmissionRequest};
pub use operator::{ConnectionInfo, Console, Operator, Question};
pub use orchestrator::{Ending, Orchestrator, ProvisionError, RunReport, Settings};
pub use process::{CommandSpec, PtySpawner, Spawner};
pub use session::{Credentials, RemoteSession, SessionError, SessionSettings};
pub use step::{InteractiveSessionLauncher, StepError};
pub use teardown::{TeardownAction, TeardownReport, TeardownStack};
pub use transcript::{Match, MatchError, Pattern, Transcript};
pub use tunnel::{TunnelError, TunnelHandle, TunnelManager, TunnelSettings, TunnelState};
