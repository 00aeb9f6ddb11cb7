//! Configuration loading via `ortho-config`.
//!
//! [`JsomConfig`] merges defaults, `jsom.toml`, and `JSOM_*` environment
//! variables; command-line flags are applied on top through
//! [`ConfigOverrides`]. [`JsomConfig::settings`] validates the result and
//! resolves it into the [`Settings`] the provisioning flow consumes.

use std::env;
use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::job::{DEFAULT_LOG_TEMPLATE, DEFAULT_SUBMIT_SCRIPT, JobSettings, SubmissionRequest};
use crate::orchestrator::Settings;
use crate::session::{Credentials, DEFAULT_HOST_KEY_POLICY, SessionSettings};
use crate::step::default_marker;
use crate::tunnel::TunnelSettings;

const CONFIG_FILE: &str = "jsom.toml";

/// Settings for one notebook session, layered via `OrthoConfig`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "JSOM",
    discovery(
        app_name = "jsom",
        env_var = "JSOM_CONFIG_PATH",
        config_file_name = "jsom.toml",
        dotfile_name = ".jsom.toml",
        project_file_name = "jsom.toml"
    )
)]
pub struct JsomConfig {
    /// Address of the SSH login host. Required.
    pub address: Option<String>,
    /// SSH user name. Required.
    pub username: Option<String>,
    /// Private key used to log in. Supports `~/` expansion. Required.
    pub key: Option<String>,
    /// Conda environment containing the Jupyter server.
    #[ortho_config(default = "jupyter".to_owned())]
    pub conda_env: String,
    /// Memory requested for the job, passed to `sbatch --mem`.
    pub memory: Option<String>,
    /// Wall-clock limit for the job, passed to `sbatch --time`.
    pub wall_time: Option<String>,
    /// CPUs per task, passed to `sbatch --cpus-per-task`.
    pub cpus: Option<u32>,
    /// Echo raw remote output and log at debug level.
    #[ortho_config(default = false)]
    pub debug: bool,
    /// Batch script submitted with `sbatch`.
    #[ortho_config(default = DEFAULT_SUBMIT_SCRIPT.to_owned())]
    pub submit_script: String,
    /// Job log name; `{job_id}` is replaced with the job id.
    #[ortho_config(default = DEFAULT_LOG_TEMPLATE.to_owned())]
    pub log_template: String,
    /// Text that marks the interactive step as started. Defaults to the
    /// conda environment in parentheses.
    pub step_marker: Option<String>,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// `StrictHostKeyChecking` policy for the login connection.
    #[ortho_config(default = DEFAULT_HOST_KEY_POLICY.to_owned())]
    pub host_key_policy: String,
    /// Seconds allowed for login.
    #[ortho_config(default = 30)]
    pub login_timeout_secs: u64,
    /// Seconds allowed for each remote command to return the prompt.
    #[ortho_config(default = 30)]
    pub prompt_timeout_secs: u64,
    /// Seconds allowed for `sbatch` to report a job id.
    #[ortho_config(default = 30)]
    pub submit_timeout_secs: u64,
    /// Seconds allowed for the interactive step to start.
    #[ortho_config(default = 120)]
    pub step_timeout_secs: u64,
    /// Quiet seconds after which a tunnel counts as established.
    #[ortho_config(default = 3)]
    pub probe_secs: u64,
    /// Seconds between reads of the job log.
    #[ortho_config(default = 5)]
    pub poll_interval_secs: u64,
    /// Reads of the job log before giving up.
    #[ortho_config(default = 120)]
    pub max_polls: u32,
    /// Reverse tunnel passwords tried before giving up.
    #[ortho_config(default = 3)]
    pub max_password_attempts: u32,
    /// Seconds between tunnel health checks while the notebook runs.
    #[ortho_config(default = 5)]
    pub monitor_interval_secs: u64,
}

/// Values given on the command line, applied over loaded configuration.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConfigOverrides {
    /// `--address`.
    pub address: Option<String>,
    /// `--username`.
    pub username: Option<String>,
    /// `--key`.
    pub key: Option<String>,
    /// `--conda`.
    pub conda_env: Option<String>,
    /// `--memory`.
    pub memory: Option<String>,
    /// `--time`.
    pub wall_time: Option<String>,
    /// `--cpus`.
    pub cpus: Option<u32>,
    /// `--debug`; only ever switches debugging on.
    pub debug: bool,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
    flag: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
        flag: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
            flag,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: pass {}, set {}, or add {} to {CONFIG_FILE}",
            self.description, self.flag, self.env_var, self.toml_key
        ))
    }
}

impl JsomConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("jsom")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Applies command-line values over the loaded ones.
    pub fn apply(&mut self, overrides: ConfigOverrides) {
        let ConfigOverrides {
            address,
            username,
            key,
            conda_env,
            memory,
            wall_time,
            cpus,
            debug,
        } = overrides;
        replace_if_some(&mut self.address, address);
        replace_if_some(&mut self.username, username);
        replace_if_some(&mut self.key, key);
        if let Some(env_name) = conda_env {
            self.conda_env = env_name;
        }
        replace_if_some(&mut self.memory, memory);
        replace_if_some(&mut self.wall_time, wall_time);
        replace_if_some(&mut self.cpus, cpus);
        self.debug |= debug;
    }

    /// Validates the configuration and resolves it into run settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the flag, environment
    /// variable, and file key for an absent required value, and
    /// [`ConfigError::Invalid`] for unusable values such as a missing key
    /// file or a zero bound.
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        let address = Self::require(
            self.address.as_deref(),
            &FieldMetadata::new("login host address", "JSOM_ADDRESS", "address", "--address"),
        )?;
        let username = Self::require(
            self.username.as_deref(),
            &FieldMetadata::new("SSH username", "JSOM_USERNAME", "username", "--username"),
        )?;
        let key = Self::require(
            self.key.as_deref(),
            &FieldMetadata::new("private key path", "JSOM_KEY", "key", "--key"),
        )?;
        let key_path = expand_home(key);
        if !key_path.is_file() {
            return Err(ConfigError::Invalid(format!(
                "private key {key_path} is not a readable file"
            )));
        }
        let conda_env = Self::require(
            Some(self.conda_env.as_str()),
            &FieldMetadata::new("conda environment", "JSOM_CONDA_ENV", "conda_env", "--conda"),
        )?;
        if self.cpus == Some(0) {
            return Err(ConfigError::Invalid(String::from(
                "cpus must be greater than zero",
            )));
        }

        let step_marker = self
            .step_marker
            .as_deref()
            .map(str::trim)
            .filter(|marker| !marker.is_empty())
            .map_or_else(|| default_marker(conda_env), str::to_owned);

        Ok(Settings {
            credentials: Credentials {
                address: address.to_owned(),
                username: username.to_owned(),
                key_path,
            },
            session: SessionSettings {
                ssh_bin: self.ssh_bin.clone(),
                host_key_policy: self.host_key_policy.clone(),
                login_timeout: positive_secs("login_timeout_secs", self.login_timeout_secs)?,
                prompt_timeout: positive_secs("prompt_timeout_secs", self.prompt_timeout_secs)?,
                echo: self.debug,
            },
            submission: SubmissionRequest {
                script: self.submit_script.clone(),
                environment: conda_env.to_owned(),
                memory: non_blank(self.memory.as_deref()),
                wall_time: non_blank(self.wall_time.as_deref()),
                cpus: self.cpus,
            },
            job: JobSettings {
                submit_timeout: positive_secs("submit_timeout_secs", self.submit_timeout_secs)?,
                poll_interval: positive_secs("poll_interval_secs", self.poll_interval_secs)?,
                max_polls: positive_count("max_polls", self.max_polls)?,
                log_template: self.log_template.clone(),
            },
            tunnel: TunnelSettings {
                probe: positive_secs("probe_secs", self.probe_secs)?,
                confirm_timeout: positive_secs("prompt_timeout_secs", self.prompt_timeout_secs)?,
                max_password_attempts: positive_count(
                    "max_password_attempts",
                    self.max_password_attempts,
                )?,
                echo: self.debug,
                ..TunnelSettings::default()
            },
            step_marker,
            step_timeout: positive_secs("step_timeout_secs", self.step_timeout_secs)?,
            monitor_interval: positive_secs(
                "monitor_interval_secs",
                self.monitor_interval_secs,
            )?,
        })
    }

    fn require<'a>(
        value: Option<&'a str>,
        metadata: &FieldMetadata,
    ) -> Result<&'a str, ConfigError> {
        value
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .ok_or_else(|| metadata.missing())
    }
}

fn replace_if_some<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn positive_secs(field: &str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Invalid(format!(
            "{field} must be greater than zero"
        )));
    }
    Ok(Duration::from_secs(secs))
}

fn positive_count(field: &str, count: u32) -> Result<u32, ConfigError> {
    if count == 0 {
        return Err(ConfigError::Invalid(format!(
            "{field} must be greater than zero"
        )));
    }
    Ok(count)
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_owned)
}

fn expand_home(path: &str) -> Utf8PathBuf {
    match (path.strip_prefix("~/"), env::var("HOME")) {
        (Some(rest), Ok(home)) => Utf8PathBuf::from(home).join(rest),
        _ => Utf8PathBuf::from(path),
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configured value cannot be used.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
