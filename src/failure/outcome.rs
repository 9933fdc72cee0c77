//! The execution log a run accumulates, and resolving it into one terminal
//! outcome (§4.5).

use crate::failure::{FailureEntry, FailureKind, FailureReason, FailureRecord, FailureSource};

/// A non-failure reason to end a run early.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TerminalSignal {
    Timeout,
    Cancelled,
    ClientClosed,
}

/// The terminal status a run resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TerminalStatus {
    Success,
    Failed,
    Timeout,
    Cancelled,
    ClientClosed,
}

impl TerminalSignal {
    fn status(self) -> TerminalStatus {
        match self {
            TerminalSignal::Timeout => TerminalStatus::Timeout,
            TerminalSignal::Cancelled => TerminalStatus::Cancelled,
            TerminalSignal::ClientClosed => TerminalStatus::ClientClosed,
        }
    }
}

/// Ordered list of failures/diagnostics and terminal bookkeeping a run
/// accumulates as it executes. Owned exclusively by
/// [`crate::runstate::RunContext`]; mutated only by the scheduler's thread
/// of control.
#[derive(Default)]
pub struct ExecutionLog {
    pub failures: Vec<FailureEntry>,
    pub diagnostics: Vec<FailureRecord>,
    pub terminal_signal: Option<TerminalSignal>,
    pub terminal_reason: Option<FailureReason>,
    pub execution_started: bool,
    pub closing: bool,
    pub cancelled: bool,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&mut self, entry: FailureEntry) {
        self.failures.push(entry);
    }

    pub fn record_diagnostic(&mut self, record: FailureRecord) {
        self.diagnostics.push(record);
    }

    pub fn signal_terminal(&mut self, signal: TerminalSignal, reason: FailureReason) {
        self.terminal_signal = Some(signal);
        self.terminal_reason = Some(reason);
    }

    pub fn mark_started(&mut self) {
        self.execution_started = true;
    }

    pub fn mark_closing(&mut self) {
        self.closing = true;
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }
}

/// A synthesized pipeline error for a failure that was recorded with only a
/// message, no captured error object.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
#[error("{0}")]
#[diagnostic(code(workweave::failure::synthesized))]
pub struct SynthesizedError(pub String);

/// The fully resolved outcome of a run: exactly what a `FINISH` event's
/// payload is built from.
pub struct ResolvedOutcome {
    pub status: TerminalStatus,
    pub reason: Option<&'static str>,
    pub failure_kind: FailureKind,
    pub failure_source: FailureSource,
    pub failed_step: Option<String>,
    pub pipeline_error: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub errors: Vec<FailureRecord>,
}

/// Resolve `log` into a single terminal outcome (§4.5):
/// 1. A signalled terminal reason (timeout/cancelled/client-closed) wins
///    outright, with no failure kind/source attached.
/// 2. Otherwise the lowest-priority recorded failure
///    (`Validation < Startup < Step < Shutdown < Infra`, ties broken by
///    insertion order) becomes the primary cause.
/// 3. Otherwise the run succeeded.
///
/// All diagnostics are appended to `errors` in every branch.
pub fn resolve_outcome(log: ExecutionLog) -> ResolvedOutcome {
    let mut errors: Vec<FailureRecord> = log
        .failures
        .iter()
        .map(|f| FailureRecord {
            kind: f.kind,
            source: f.source,
            reason: f.reason,
            error: f.error_message.clone(),
            step: f.step.clone(),
        })
        .collect();
    errors.extend(log.diagnostics.iter().cloned());

    if let Some(signal) = log.terminal_signal {
        return ResolvedOutcome {
            status: signal.status(),
            reason: log.terminal_reason.map(FailureReason::as_str),
            failure_kind: FailureKind::None,
            failure_source: FailureSource::None,
            failed_step: None,
            pipeline_error: None,
            errors,
        };
    }

    if log.failures.is_empty() {
        return ResolvedOutcome {
            status: TerminalStatus::Success,
            reason: None,
            failure_kind: FailureKind::None,
            failure_source: FailureSource::None,
            failed_step: None,
            pipeline_error: None,
            errors,
        };
    }

    let primary_index = log
        .failures
        .iter()
        .enumerate()
        .min_by_key(|(index, failure)| (failure.kind.priority(), *index))
        .map(|(index, _)| index)
        .expect("checked non-empty above");

    let mut failures = log.failures;
    let primary = failures.swap_remove(primary_index);

    let pipeline_error: Option<Box<dyn std::error::Error + Send + Sync>> = match primary.error {
        Some(error) => Some(error),
        None => primary
            .error_message
            .clone()
            .map(|message| Box::new(SynthesizedError(message)) as Box<dyn std::error::Error + Send + Sync>),
    };

    ResolvedOutcome {
        status: TerminalStatus::Failed,
        reason: Some(primary.reason.as_str()),
        failure_kind: primary.kind,
        failure_source: primary.source,
        failed_step: primary.step,
        pipeline_error,
        errors,
    }
}
