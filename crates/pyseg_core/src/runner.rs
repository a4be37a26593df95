//! External job execution.
//!
//! # Responsibility
//! - Describe one external program invocation (`JobSpec`).
//! - Run it inside the PySeg environment and surface failures.
//!
//! # Invariants
//! - A non-zero exit status is always an error; nothing is retried.
//! - Every job emits `job_run` start/ok/error events with its duration.

use crate::config::PysegConfig;
use crate::error::ErrorKind;
use log::{error, info};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::process::Command;
use std::time::Instant;

/// One external program invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobSpec {
    /// Program run after the environment activation prefix.
    pub program: String,
    pub args: Vec<String>,
    /// Shell prefix, e.g. the conda activation; empty for none.
    pub activation: String,
    /// Variables set for the job on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl JobSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Appends `--flag value`.
    pub fn flag(mut self, name: &str, value: impl ToString) -> Self {
        self.args.push(name.to_string());
        self.args.push(value.to_string());
        self
    }

    /// Appends `--flag v1 v2 ...`.
    pub fn flag_values(mut self, name: &str, values: &[f64]) -> Self {
        self.args.push(name.to_string());
        self.args.extend(values.iter().map(f64::to_string));
        self
    }

    pub fn arg(mut self, value: impl ToString) -> Self {
        self.args.push(value.to_string());
        self
    }

    /// Value following `name` in the argument list.
    pub fn flag_value(&self, name: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|arg| arg == name)
            .and_then(|index| self.args.get(index + 1))
            .map(String::as_str)
    }

    /// Full shell command line.
    pub fn command_line(&self) -> String {
        let mut line = String::new();
        if !self.activation.trim().is_empty() {
            line.push_str(self.activation.trim());
            line.push_str(" && ");
        }
        line.push_str(&self.program);
        for arg in &self.args {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        line
    }
}

/// PySeg program invocation: `<python> <script> <args>` in the PySeg
/// environment.
pub fn pyseg_job(config: &PysegConfig, script: impl Into<PathBuf>) -> JobSpec {
    let script: PathBuf = script.into();
    let mut spec = JobSpec::new(config.python.clone()).arg(script.display());
    spec.activation = config.activation_prefix();
    let base_path = std::env::var("PATH").ok();
    spec.env = config.environ(base_path.as_deref());
    spec
}

fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=+,@%".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

/// External job failures.
#[derive(Debug)]
pub enum RunError {
    Spawn {
        program: String,
        source: std::io::Error,
    },
    NonZeroExit {
        program: String,
        code: Option<i32>,
    },
}

impl RunError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ExternalProcess
    }
}

impl Display for RunError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn { program, source } => write!(f, "failed to launch `{program}`: {source}"),
            Self::NonZeroExit {
                program,
                code: Some(code),
            } => write!(f, "`{program}` exited with status {code}"),
            Self::NonZeroExit {
                program,
                code: None,
            } => write!(f, "`{program}` was terminated by a signal"),
        }
    }
}

impl Error for RunError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Spawn { source, .. } => Some(source),
            Self::NonZeroExit { .. } => None,
        }
    }
}

/// Executes external jobs.
///
/// The process runner is the production implementation; tests provide
/// doubles that record specs and fabricate outputs.
pub trait JobRunner {
    fn run_job(&self, spec: &JobSpec) -> Result<(), RunError>;
}

/// Runs jobs through `bash -c` so activation prefixes work.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    shell: String,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            shell: "bash".to_string(),
        }
    }

    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRunner for ProcessRunner {
    fn run_job(&self, spec: &JobSpec) -> Result<(), RunError> {
        let started_at = Instant::now();
        let line = spec.command_line();
        info!(
            "event=job_run module=runner status=start program={} command={}",
            spec.program, line
        );

        let mut command = Command::new(&self.shell);
        command.arg("-c").arg(&line).envs(&spec.env);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let status = command.status().map_err(|source| {
            error!(
                "event=job_run module=runner status=error program={} duration_ms={} error_code=spawn_failed error={}",
                spec.program,
                started_at.elapsed().as_millis(),
                source
            );
            RunError::Spawn {
                program: spec.program.clone(),
                source,
            }
        })?;

        if !status.success() {
            error!(
                "event=job_run module=runner status=error program={} duration_ms={} error_code=non_zero_exit exit_code={:?}",
                spec.program,
                started_at.elapsed().as_millis(),
                status.code()
            );
            return Err(RunError::NonZeroExit {
                program: spec.program.clone(),
                code: status.code(),
            });
        }

        info!(
            "event=job_run module=runner status=ok program={} duration_ms={}",
            spec.program,
            started_at.elapsed().as_millis()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{pyseg_job, shell_quote, JobRunner, JobSpec, ProcessRunner, RunError};
    use crate::config::PysegConfig;

    #[test]
    fn builds_flag_arguments_in_order() {
        let spec = JobSpec::new("python")
            .arg("script.py")
            .flag("--inStar", "in.star")
            .flag("--sSig", 1.5)
            .flag_values("--gRgLen", &[1.0, 60.0]);
        assert_eq!(
            spec.args,
            vec!["script.py", "--inStar", "in.star", "--sSig", "1.5", "--gRgLen", "1", "60"]
        );
        assert_eq!(spec.flag_value("--sSig"), Some("1.5"));
        assert_eq!(spec.flag_value("--missing"), None);
    }

    #[test]
    fn command_line_quotes_unsafe_arguments() {
        let mut spec = JobSpec::new("python").flag("--gRgLen", "1 60");
        spec.activation = "conda activate pySeg".to_string();
        assert_eq!(
            spec.command_line(),
            "conda activate pySeg && python --gRgLen '1 60'"
        );
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn pyseg_job_uses_config_environment() {
        let config = PysegConfig::new("/opt/pyseg");
        let spec = pyseg_job(&config, "/opt/pyseg/script.py");
        assert_eq!(spec.program, "python");
        assert_eq!(spec.args, vec!["/opt/pyseg/script.py"]);
        assert!(spec.env["PATH"].starts_with("/opt/pyseg/disperse_build/bin"));
        assert_eq!(spec.activation, "conda activate pySeg");
    }

    #[cfg(unix)]
    #[test]
    fn process_runner_reports_exit_status() {
        let runner = ProcessRunner::new();
        runner
            .run_job(&JobSpec::new("true"))
            .expect("true exits with zero");
        let err = runner
            .run_job(&JobSpec::new("exit 3"))
            .expect_err("non-zero exit must fail");
        assert!(matches!(err, RunError::NonZeroExit { code: Some(3), .. }));
    }
}
