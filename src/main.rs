//! Binary entry point for the jsom CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tokio::signal;
use tracing::{debug, warn};

use jsom::cancel::{self, CancelTrigger};
use jsom::config::{ConfigError, ConfigOverrides, JsomConfig};
use jsom::operator::Console;
use jsom::orchestrator::{Orchestrator, Settings};
use jsom::process::PtySpawner;

mod cli;

#[cfg(test)]
mod test_helpers;

use cli::Cli;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    jsom::operator::restore_terminal();
    process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<i32, CliError> {
    let (settings, debug_enabled) = resolve_settings(overrides_from(cli))?;
    jsom::logging::init(debug_enabled);
    debug!(?settings, "resolved settings");

    let (trigger, mut cancellation) = cancel::channel();
    tokio::spawn(forward_interrupts(trigger));

    let orchestrator = Orchestrator::new(
        settings,
        Arc::new(PtySpawner::default()),
        Arc::new(Console),
    );
    let report = orchestrator.run(&mut cancellation).await;
    Ok(report.exit_code())
}

fn overrides_from(cli: Cli) -> ConfigOverrides {
    ConfigOverrides {
        address: cli.address,
        username: cli.username,
        key: cli.key,
        conda_env: cli.conda,
        memory: cli.memory,
        wall_time: cli.time,
        cpus: cli.cpus,
        debug: cli.debug,
    }
}

fn resolve_settings(overrides: ConfigOverrides) -> Result<(Settings, bool), CliError> {
    let mut config = JsomConfig::load_without_cli_args()?;
    config.apply(overrides);
    let settings = config.settings()?;
    Ok((settings, config.debug))
}

async fn forward_interrupts(trigger: CancelTrigger) {
    loop {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for Ctrl-C");
            return;
        }
        trigger.cancel();
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::EnvGuard;

    #[test]
    fn overrides_carry_every_flag() {
        let cli = Cli::try_parse_from([
            "jsom", "-a", "hpc.example.org", "-u", "ada", "-k", "/keys/id", "-c", "torch",
            "--memory", "16G", "--time", "04:00:00", "--cpus", "4", "--debug",
        ])
        .expect("arguments parse");

        assert_eq!(
            overrides_from(cli),
            ConfigOverrides {
                address: Some(String::from("hpc.example.org")),
                username: Some(String::from("ada")),
                key: Some(String::from("/keys/id")),
                conda_env: Some(String::from("torch")),
                memory: Some(String::from("16G")),
                wall_time: Some(String::from("04:00:00")),
                cpus: Some(4),
                debug: true,
            }
        );
    }

    #[test]
    fn flags_are_optional() {
        let cli = Cli::try_parse_from(["jsom"]).expect("no arguments parse");

        assert_eq!(overrides_from(cli), ConfigOverrides::default());
    }

    #[tokio::test]
    async fn missing_address_is_a_configuration_error() {
        let _guard = EnvGuard::lock()
            .await
            .remove("JSOM_ADDRESS")
            .remove("JSOM_CONFIG_PATH");

        let err = resolve_settings(ConfigOverrides {
            username: Some(String::from("ada")),
            key: Some(String::from("/keys/id")),
            ..ConfigOverrides::default()
        })
        .expect_err("address is required");

        assert!(
            matches!(err, CliError::Config(ConfigError::MissingField(ref message)) if message.contains("JSOM_ADDRESS")),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        let err = CliError::Config(ConfigError::Invalid(String::from("probe_secs must be greater than zero")));
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).expect("utf8");
        assert!(
            rendered.contains("configuration error: invalid configuration: probe_secs"),
            "rendered: {rendered}"
        );
    }
}
