//! BDD step definitions for the provisioning workflow.

use std::sync::Arc;

use jsom::cancel;
use jsom::test_support::ScriptedProcess;
use jsom::{Orchestrator, TeardownAction, TunnelHandle};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{
    LOCAL, PROMPT, ProvisionContext, ProvisionOutcome, ProvisionTestError, REVERSE, STEP,
};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Setup(#[from] ProvisionTestError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a login host that submits job \"{job_id}\"")]
fn login_host_submits(mut provision_context: ProvisionContext, job_id: String) -> ProvisionContext {
    provision_context.login = ScriptedProcess::new()
        .reply(PROMPT)
        .reply(format!("Submitted batch job {job_id}\r\n{PROMPT}"));
    provision_context
}

#[given("the job log lists tunnels and the password \"{password}\"")]
fn job_log_lists_details(
    mut provision_context: ProvisionContext,
    password: String,
) -> ProvisionContext {
    let log = format!(
        "cat slurm-12345.out\r\n{STEP}\r\n{LOCAL}\r\n{REVERSE}\r\npassword: {password}\r\n{PROMPT}"
    );
    provision_context.login = provision_context.login.reply(log);
    provision_context
}

#[given("the nested step and the reverse tunnel succeed")]
fn nested_step_succeeds(mut provision_context: ProvisionContext) -> ProvisionContext {
    provision_context.login = provision_context
        .login
        .reply("(jupyter) ada@node01:~$ ")
        .reply(PROMPT)
        .reply("ada@login01's password: ")
        .silence()
        .reply(format!("^C\r\n{PROMPT}"))
        .reply(PROMPT)
        .reply(PROMPT)
        .reply(PROMPT);
    provision_context.operator.push_answer("hunter2");
    provision_context
}

#[given("the operator presses Ctrl-C once the notebook is announced")]
fn operator_interrupts(mut provision_context: ProvisionContext) -> ProvisionContext {
    provision_context.interrupt_after_announce = true;
    provision_context
}

#[given("the local tunnel reports a changed host key")]
fn local_tunnel_host_changed(mut provision_context: ProvisionContext) -> ProvisionContext {
    provision_context.local_tunnel = ScriptedProcess::new().banner(concat!(
        "@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@@\r\n",
        "@    WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!     @\r\n",
    ));
    provision_context.login = provision_context.login.reply(PROMPT).reply(PROMPT);
    provision_context
}

#[when("I provision the notebook")]
fn provision_notebook(provision_context: ProvisionContext) -> Result<ProvisionContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let ProvisionContext {
        spawner,
        operator,
        settings,
        login,
        local_tunnel,
        interrupt_after_announce,
        ..
    } = provision_context;

    spawner.push(login.clone());
    spawner.push(local_tunnel.clone());
    let (trigger, mut cancellation) = cancel::channel();
    if interrupt_after_announce {
        operator.cancel_on_announce(trigger.clone());
    }
    let orchestrator = Orchestrator::new(
        settings.clone(),
        Arc::new(spawner.clone()),
        Arc::new(operator.clone()),
    );

    let report = runtime.block_on(async move { orchestrator.run(&mut cancellation).await });
    drop(trigger);
    let outcome = ProvisionOutcome {
        exit_code: report.exit_code(),
        url: report.connection.map(|info| info.url),
        error: report.outcome.err().map(|err| err.to_string()),
        teardown: report.teardown.completed,
    };

    Ok(ProvisionContext {
        spawner,
        operator,
        settings,
        login,
        local_tunnel,
        interrupt_after_announce,
        outcome: Some(outcome),
    })
}

#[then("the notebook is announced at \"{url}\"")]
fn notebook_announced(provision_context: &ProvisionContext, url: String) -> Result<(), StepError> {
    let outcome = outcome(provision_context)?;
    let announced = provision_context.operator.announcements();
    let Some(info) = announced.first() else {
        return Err(StepError::Assertion(String::from(
            "operator saw no announcement",
        )));
    };
    if info.url == url && outcome.url.as_deref() == Some(url.as_str()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {url}, announced {} and reported {:?}",
            info.url, outcome.url
        )))
    }
}

#[then("teardown runs \"{actions}\"")]
fn teardown_runs(provision_context: &ProvisionContext, actions: String) -> Result<(), StepError> {
    let outcome = outcome(provision_context)?;
    let expected: Vec<&str> = actions.split(',').map(str::trim).collect();
    let observed: Vec<&str> = outcome.teardown.iter().map(action_label).collect();
    if observed == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected teardown {expected:?}, got {observed:?}"
        )))
    }
}

#[then("the run fails with an error mentioning \"{text}\"")]
fn run_fails_with(provision_context: &ProvisionContext, text: String) -> Result<(), StepError> {
    let outcome = outcome(provision_context)?;
    match &outcome.error {
        Some(message) if message.contains(&text) => {
            let reports = provision_context.operator.reports();
            if reports.iter().any(|report| report.contains(&text)) {
                Ok(())
            } else {
                Err(StepError::Assertion(format!(
                    "operator was not told about the failure: {reports:?}"
                )))
            }
        }
        Some(message) => Err(StepError::Assertion(format!(
            "error `{message}` does not mention `{text}`"
        ))),
        None => Err(StepError::Assertion(String::from("expected the run to fail"))),
    }
}

#[then("the local tunnel process is killed")]
fn local_tunnel_killed(provision_context: &ProvisionContext) -> Result<(), StepError> {
    if provision_context.spawner.was_killed(1) {
        Ok(())
    } else {
        Err(StepError::Assertion(String::from(
            "local tunnel process should be killed",
        )))
    }
}

#[then("the run exits with code \"{code}\"")]
fn run_exits_with(provision_context: &ProvisionContext, code: i32) -> Result<(), StepError> {
    let outcome = outcome(provision_context)?;
    if outcome.exit_code == code {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected exit code {code}, got {}",
            outcome.exit_code
        )))
    }
}

fn outcome(provision_context: &ProvisionContext) -> Result<&ProvisionOutcome, StepError> {
    provision_context
        .outcome
        .as_ref()
        .ok_or_else(|| StepError::Assertion(String::from("missing outcome")))
}

const fn action_label(action: &TeardownAction) -> &'static str {
    match action {
        TeardownAction::CancelTunnel(TunnelHandle::Reverse) => "CancelReverseTunnel",
        TeardownAction::CancelTunnel(TunnelHandle::Local(_)) => "CancelLocalTunnel",
        TeardownAction::ExitNestedSession => "ExitNestedSession",
        TeardownAction::DeleteLog(_) => "DeleteLog",
        TeardownAction::CancelJob(_) => "CancelJob",
    }
}
