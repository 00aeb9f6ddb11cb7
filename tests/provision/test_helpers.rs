//! Shared fixtures for provisioning BDD scenarios.

use std::time::Duration;

use camino::Utf8PathBuf;
use jsom::job::DEFAULT_LOG_TEMPLATE;
use jsom::test_support::{ScriptedOperator, ScriptedProcess, ScriptedSpawner};
use jsom::{
    Credentials, JobSettings, Settings, SessionSettings, SubmissionRequest, TeardownAction,
    TunnelSettings,
};
use rstest::fixture;
use thiserror::Error;

pub const PROMPT: &str = "[jsom]$ ";
pub const STEP: &str = "srun --jobid 12345 --pty bash -l";
pub const LOCAL: &str = "ssh -NL 8888:node01:8888 ada@hpc.example.org";
pub const REVERSE: &str = "ssh -NR 9999:localhost:22 ada@login01";

#[derive(Clone, Debug)]
pub struct ProvisionContext {
    pub spawner: ScriptedSpawner,
    pub operator: ScriptedOperator,
    pub settings: Settings,
    pub login: ScriptedProcess,
    pub local_tunnel: ScriptedProcess,
    pub interrupt_after_announce: bool,
    pub outcome: Option<ProvisionOutcome>,
}

/// What a finished run looked like from the outside.
#[derive(Clone, Debug)]
pub struct ProvisionOutcome {
    pub exit_code: i32,
    pub url: Option<String>,
    pub error: Option<String>,
    pub teardown: Vec<TeardownAction>,
}

#[derive(Clone, Debug, Error)]
pub enum ProvisionTestError {
    #[error("invalid provision fixture: {0}")]
    Fixture(String),
}

pub type ProvisionContextResult = Result<ProvisionContext, ProvisionTestError>;

#[fixture]
pub fn provision_context_result() -> ProvisionContextResult {
    Ok(ProvisionContext {
        spawner: ScriptedSpawner::new(),
        operator: ScriptedOperator::new(),
        settings: settings(),
        login: ScriptedProcess::new(),
        local_tunnel: ScriptedProcess::new(),
        interrupt_after_announce: false,
        outcome: None,
    })
}

#[fixture]
pub fn provision_context(provision_context_result: ProvisionContextResult) -> ProvisionContext {
    provision_context_result
        .unwrap_or_else(|err| panic!("provision context fixture should initialise: {err}"))
}

fn settings() -> Settings {
    Settings {
        credentials: Credentials {
            address: String::from("hpc.example.org"),
            username: String::from("ada"),
            key_path: Utf8PathBuf::from("/keys/id"),
        },
        session: SessionSettings {
            login_timeout: Duration::from_millis(500),
            prompt_timeout: Duration::from_millis(500),
            ..SessionSettings::default()
        },
        submission: SubmissionRequest::new("jupyter"),
        job: JobSettings {
            submit_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(1),
            max_polls: 3,
            log_template: String::from(DEFAULT_LOG_TEMPLATE),
        },
        tunnel: TunnelSettings {
            probe: Duration::from_millis(50),
            confirm_timeout: Duration::from_millis(500),
            max_password_attempts: 3,
            interrupt_grace: Duration::from_millis(1),
            echo: false,
        },
        step_marker: String::from("(jupyter)"),
        step_timeout: Duration::from_millis(500),
        monitor_interval: Duration::from_millis(10),
    }
}
