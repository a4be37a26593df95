//! Protocol capabilities and the step sequencer.
//!
//! # Responsibility
//! - Split a stage into input staging, ordered steps and output
//!   registration.
//! - Run the steps in order and record the run in the output catalog.
//!
//! # Invariants
//! - A step runs only after all its prerequisites have run.
//! - The first failing step aborts the protocol; later steps never run.

use crate::catalog::{CatalogError, OutputCatalog, OutputSet, RunId, RunStatus};
use crate::error::ErrorKind;
use crate::stages::StageError;
use log::{error, info};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::time::Instant;

pub mod registry;

pub use registry::{
    ManifestError, ProtocolManifest, ProtocolRegistry, CAPABILITY_INPUT_STAGING,
    CAPABILITY_OUTPUT_REGISTRATION, CAPABILITY_STEP_SEQUENCE, CAPABILITY_VIEWER,
};

/// One unit of work and the steps it waits for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    pub prerequisites: Vec<String>,
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prerequisites: Vec::new(),
        }
    }

    pub fn after<I, S>(mut self, prerequisites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prerequisites
            .extend(prerequisites.into_iter().map(Into::into));
        self
    }
}

/// Prepares directories and input tables before any step.
pub trait InputStaging {
    fn stage_inputs(&mut self) -> Result<(), StageError>;
}

/// Ordered steps and their execution.
pub trait StepSequence {
    fn steps(&self) -> Vec<Step>;
    fn run_step(&mut self, name: &str) -> Result<(), StageError>;
}

/// Results of a finished protocol.
pub trait OutputRegistration {
    fn outputs(&self) -> Vec<OutputSet>;
    /// Human-readable summary lines.
    fn summary(&self) -> Vec<String> {
        Vec::new()
    }
}

/// A runnable stage protocol.
pub trait Protocol: InputStaging + StepSequence + OutputRegistration {
    fn protocol_id(&self) -> &'static str;
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolReport {
    pub protocol_id: &'static str,
    pub steps_run: Vec<String>,
    pub outputs: Vec<OutputSet>,
    pub summary: Vec<String>,
}

#[derive(Debug)]
pub enum ProtocolError {
    Staging(StageError),
    Step { step: String, source: StageError },
    /// A step names a prerequisite that is not an earlier step.
    BadPrerequisite { step: String, prerequisite: String },
    DuplicateStep(String),
    Catalog(CatalogError),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Staging(err) | Self::Step { source: err, .. } => err.kind(),
            Self::BadPrerequisite { .. } | Self::DuplicateStep(_) => ErrorKind::Configuration,
            Self::Catalog(err) => err.kind(),
        }
    }
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Staging(err) => write!(f, "input staging failed: {err}"),
            Self::Step { step, source } => write!(f, "step `{step}` failed: {source}"),
            Self::BadPrerequisite { step, prerequisite } => write!(
                f,
                "step `{step}` depends on `{prerequisite}`, which does not run before it"
            ),
            Self::DuplicateStep(step) => write!(f, "step `{step}` is declared twice"),
            Self::Catalog(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ProtocolError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Staging(err) | Self::Step { source: err, .. } => Some(err),
            Self::Catalog(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CatalogError> for ProtocolError {
    fn from(value: CatalogError) -> Self {
        Self::Catalog(value)
    }
}

/// Checks that every prerequisite refers to an earlier step.
pub fn validate_steps(steps: &[Step]) -> Result<(), ProtocolError> {
    let mut seen = BTreeSet::new();
    for step in steps {
        for prerequisite in &step.prerequisites {
            if !seen.contains(prerequisite.as_str()) {
                return Err(ProtocolError::BadPrerequisite {
                    step: step.name.clone(),
                    prerequisite: prerequisite.clone(),
                });
            }
        }
        if !seen.insert(step.name.as_str()) {
            return Err(ProtocolError::DuplicateStep(step.name.clone()));
        }
    }
    Ok(())
}

/// Stages inputs, then runs every step in declaration order.
pub fn run_protocol(protocol: &mut impl Protocol) -> Result<ProtocolReport, ProtocolError> {
    let protocol_id = protocol.protocol_id();
    let started_at = Instant::now();
    info!("event=protocol_run module=protocol status=start protocol={protocol_id}");

    protocol.stage_inputs().map_err(|err| {
        error!(
            "event=protocol_run module=protocol status=error protocol={} step=stage_inputs error_kind={} error={}",
            protocol_id,
            err.kind(),
            err
        );
        ProtocolError::Staging(err)
    })?;

    let steps = protocol.steps();
    validate_steps(&steps)?;

    let mut steps_run = Vec::with_capacity(steps.len());
    for step in steps {
        let step_started = Instant::now();
        info!(
            "event=protocol_step module=protocol status=start protocol={} step={}",
            protocol_id, step.name
        );
        if let Err(err) = protocol.run_step(&step.name) {
            error!(
                "event=protocol_step module=protocol status=error protocol={} step={} duration_ms={} error_kind={} error={}",
                protocol_id,
                step.name,
                step_started.elapsed().as_millis(),
                err.kind(),
                err
            );
            return Err(ProtocolError::Step {
                step: step.name,
                source: err,
            });
        }
        info!(
            "event=protocol_step module=protocol status=ok protocol={} step={} duration_ms={}",
            protocol_id,
            step.name,
            step_started.elapsed().as_millis()
        );
        steps_run.push(step.name);
    }

    let report = ProtocolReport {
        protocol_id,
        steps_run,
        outputs: protocol.outputs(),
        summary: protocol.summary(),
    };
    info!(
        "event=protocol_run module=protocol status=ok protocol={} steps={} outputs={} duration_ms={}",
        protocol_id,
        report.steps_run.len(),
        report.outputs.len(),
        started_at.elapsed().as_millis()
    );
    Ok(report)
}

/// Runs `protocol` and records the run and its output sets in `catalog`.
///
/// A failing protocol is recorded as `failed` before the error is returned.
pub fn run_and_record(
    protocol: &mut impl Protocol,
    catalog: &mut OutputCatalog<'_>,
    work_dir: &Path,
    params: &serde_json::Value,
) -> Result<(RunId, ProtocolReport), ProtocolError> {
    let run_id = catalog.begin_run(protocol.protocol_id(), work_dir, params)?;
    let report = match run_protocol(protocol) {
        Ok(report) => report,
        Err(err) => {
            // The protocol error wins; a failed status update is only logged.
            if let Err(record_err) =
                catalog.finish_run(run_id, RunStatus::Failed, Some(err.to_string().as_str()))
            {
                error!(
                    "event=catalog_run module=protocol status=error run_id={} error_kind={} error={}",
                    run_id,
                    record_err.kind(),
                    record_err
                );
            }
            return Err(err);
        }
    };

    for set in &report.outputs {
        catalog.register_set(run_id, set)?;
    }
    let summary = report.summary.join("\n");
    catalog.finish_run(
        run_id,
        RunStatus::Finished,
        (!summary.is_empty()).then_some(summary.as_str()),
    )?;
    Ok((run_id, report))
}

#[cfg(test)]
mod tests {
    use super::{
        run_protocol, validate_steps, InputStaging, OutputRegistration, Protocol, ProtocolError,
        Step, StepSequence,
    };
    use crate::stages::StageError;

    #[derive(Default)]
    struct Scripted {
        staged: bool,
        ran: Vec<String>,
        fail_at: Option<&'static str>,
    }

    impl InputStaging for Scripted {
        fn stage_inputs(&mut self) -> Result<(), StageError> {
            self.staged = true;
            Ok(())
        }
    }

    impl StepSequence for Scripted {
        fn steps(&self) -> Vec<Step> {
            vec![
                Step::new("a"),
                Step::new("b"),
                Step::new("c").after(["a", "b"]),
            ]
        }

        fn run_step(&mut self, name: &str) -> Result<(), StageError> {
            if self.fail_at == Some(name) {
                return Err(StageError::InvalidParams("scripted failure".to_string()));
            }
            self.ran.push(name.to_string());
            Ok(())
        }
    }

    impl OutputRegistration for Scripted {
        fn outputs(&self) -> Vec<crate::catalog::OutputSet> {
            Vec::new()
        }
    }

    impl Protocol for Scripted {
        fn protocol_id(&self) -> &'static str {
            "test.scripted"
        }
    }

    #[test]
    fn runs_steps_in_order_after_staging() {
        let mut protocol = Scripted::default();
        let report = run_protocol(&mut protocol).expect("protocol runs");
        assert!(protocol.staged);
        assert_eq!(protocol.ran, vec!["a", "b", "c"]);
        assert_eq!(report.steps_run, vec!["a", "b", "c"]);
    }

    #[test]
    fn first_failure_stops_the_sequence() {
        let mut protocol = Scripted {
            fail_at: Some("b"),
            ..Scripted::default()
        };
        let err = run_protocol(&mut protocol).expect_err("step b fails");
        assert!(matches!(err, ProtocolError::Step { ref step, .. } if step == "b"));
        assert_eq!(protocol.ran, vec!["a"]);
    }

    #[test]
    fn prerequisites_must_precede_their_step() {
        let steps = vec![Step::new("late").after(["early"]), Step::new("early")];
        assert!(matches!(
            validate_steps(&steps),
            Err(ProtocolError::BadPrerequisite { .. })
        ));
        let dup = vec![Step::new("x"), Step::new("x")];
        assert!(matches!(validate_steps(&dup), Err(ProtocolError::DuplicateStep(_))));
    }
}
