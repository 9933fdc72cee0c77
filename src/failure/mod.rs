//! Failure classification and the journal a run accumulates as it
//! executes (§4.5).
//!
//! A builtin classifier promotes a failure's `source` to `ExternalDep` when
//! the originating error's type lives under a known external-dependency
//! crate; a user-supplied classifier may further override it. Rust has no
//! runtime module introspection, so `std::any::type_name` prefix matching
//! stands in for the original's `type(error).__module__.startswith(...)`
//! check (see `DESIGN.md` Open Question 3).

pub mod outcome;

use miette::Diagnostic;
use thiserror::Error;

/// Which layer of the system originated a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Validation,
    Startup,
    Step,
    Shutdown,
    Infra,
    None,
}

impl FailureKind {
    /// Lower value wins ties in [`outcome::resolve_outcome`]'s primary-cause
    /// selection (§4.5). `None` sorts last.
    pub(crate) fn priority(self) -> u32 {
        match self {
            FailureKind::Validation => 0,
            FailureKind::Startup => 1,
            FailureKind::Step => 2,
            FailureKind::Shutdown => 3,
            FailureKind::Infra => 4,
            FailureKind::None => u32::MAX,
        }
    }
}

/// Where a failure is attributed to have originated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureSource {
    User,
    Framework,
    ExternalDep,
    None,
}

/// Machine-stable reason tag carried alongside a human `error_message`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureReason {
    StepRaised,
    StepTimeout,
    ValidationFailed,
    StartupFailed,
    ShutdownFailed,
    ClassifierError,
    Other,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::StepRaised => "step_raised",
            FailureReason::StepTimeout => "step_timeout",
            FailureReason::ValidationFailed => "validation_failed",
            FailureReason::StartupFailed => "startup_failed",
            FailureReason::ShutdownFailed => "shutdown_failed",
            FailureReason::ClassifierError => "classifier_error",
            FailureReason::Other => "other",
        }
    }
}

/// One entry in the failure journal: enough to classify, report, and —
/// later — chain as the cause of a synthesized pipeline error.
#[derive(Debug)]
pub struct FailureEntry {
    pub kind: FailureKind,
    pub source: FailureSource,
    pub reason: FailureReason,
    pub error_message: Option<String>,
    pub step: Option<String>,
    pub error: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// A diagnostic record surfaced to the caller alongside failures — used for
/// classifier misbehavior and other framework-level observations that are
/// not themselves run failures.
#[derive(Debug, Clone)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub source: FailureSource,
    pub reason: FailureReason,
    pub error: Option<String>,
    pub step: Option<String>,
}

/// Input to a user-supplied [`FailureSourceClassifier`].
pub struct FailureClassificationContext<'a> {
    pub error: Option<&'a (dyn std::error::Error + Send + Sync)>,
    pub kind: FailureKind,
    pub reason: FailureReason,
    pub step: Option<&'a str>,
    pub default_source: FailureSource,
}

pub type FailureSourceClassifier =
    Box<dyn Fn(&FailureClassificationContext<'_>) -> Option<FailureSource> + Send + Sync>;

/// Tunables for [`FailureJournal::new`]: additional external-dependency
/// crate-path prefixes beyond the builtin defaults, and an optional
/// user-supplied override classifier.
#[derive(Default)]
pub struct FailureClassificationConfig {
    pub external_dependency_prefixes: Vec<&'static str>,
    pub source_classifier: Option<FailureSourceClassifier>,
}

const DEFAULT_EXTERNAL_DEP_PREFIXES: &[&str] = &[
    "reqwest::",
    "hyper::",
    "tokio_postgres::",
    "sqlx::",
    "redis::",
    "rusqlite::",
    "aws_sdk",
    "rdkafka::",
    "lapin::",
];

#[derive(Debug, Error, Diagnostic)]
#[error("owns no public variants; classification never fails observably")]
#[diagnostic(code(workweave::failure::never))]
pub struct Never;

/// Owns failure classification policy and records failures/diagnostics
/// into an [`outcome::ExecutionLog`].
pub struct FailureJournal {
    external_dep_prefixes: Vec<&'static str>,
    source_classifier: Option<FailureSourceClassifier>,
}

impl FailureJournal {
    pub fn new(config: FailureClassificationConfig) -> Self {
        let mut external_dep_prefixes = DEFAULT_EXTERNAL_DEP_PREFIXES.to_vec();
        external_dep_prefixes.extend(config.external_dependency_prefixes);
        Self { external_dep_prefixes, source_classifier: config.source_classifier }
    }

    /// Classify and append a failure to `log`, including any diagnostic the
    /// classification step itself produced.
    #[allow(clippy::too_many_arguments)]
    pub fn record_failure(
        &self,
        log: &mut outcome::ExecutionLog,
        kind: FailureKind,
        source: FailureSource,
        reason: FailureReason,
        error_message: Option<String>,
        step: Option<String>,
        error: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) {
        let (resolved_source, diagnostic) =
            self.resolve_failure_source(error.as_deref(), kind, reason, step.as_deref(), source);
        log.record_failure(FailureEntry {
            kind,
            source: resolved_source,
            reason,
            error_message,
            step,
            error,
        });
        if let Some(diagnostic) = diagnostic {
            log.record_diagnostic(diagnostic);
        }
    }

    fn resolve_failure_source(
        &self,
        error: Option<&(dyn std::error::Error + Send + Sync)>,
        kind: FailureKind,
        reason: FailureReason,
        step: Option<&str>,
        default: FailureSource,
    ) -> (FailureSource, Option<FailureRecord>) {
        let builtin = self.classify_builtin(error, default);
        let Some(classifier) = &self.source_classifier else {
            return (builtin, None);
        };

        let context = FailureClassificationContext {
            error,
            kind,
            reason,
            step,
            default_source: builtin,
        };
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| classifier(&context))) {
            Ok(Some(user_source)) => (user_source, None),
            Ok(None) => (builtin, None),
            Err(_) => (
                builtin,
                Some(FailureRecord {
                    kind: FailureKind::Infra,
                    source: FailureSource::Framework,
                    reason: FailureReason::ClassifierError,
                    error: Some(
                        "failure_classification.source_classifier panicked".to_string(),
                    ),
                    step: step.map(str::to_string),
                }),
            ),
        }
    }

    fn classify_builtin(
        &self,
        error: Option<&(dyn std::error::Error + Send + Sync)>,
        default: FailureSource,
    ) -> FailureSource {
        let Some(error) = error else { return default };
        let type_name = type_name_of(error);
        if self.external_dep_prefixes.iter().any(|prefix| type_name.starts_with(prefix)) {
            FailureSource::ExternalDep
        } else {
            default
        }
    }
}

fn type_name_of(error: &(dyn std::error::Error + Send + Sync)) -> &'static str {
    // `Any::type_name` requires a concrete type, but `dyn Error` only gives
    // us the trait object; `std::any::type_name_of_val` works directly off
    // the reference without requiring `Any` at all.
    std::any::type_name_of_val(error)
}

#[allow(dead_code)]
fn assert_send_sync<T: Send + Sync>() {}
#[allow(dead_code)]
fn _assertions() {
    assert_send_sync::<FailureJournal>();
}
