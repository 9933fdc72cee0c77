//! Run lifecycle: the phase transition table (§4.6) and the per-run context
//! the scheduler owns exclusively for the duration of one `run()` call.

use std::sync::Arc;
use std::time::Instant;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::cancel::CancellationToken;
use crate::failure::outcome::ExecutionLog;
use crate::ids::{IdGen, RunId};

/// The five phases a run moves through, in one direction only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RunPhase {
    Init,
    Startup,
    Executing,
    Shutdown,
    Terminal,
}

/// Raised by [`RunStateMachine::transition`] for any transition not in the
/// allowed table of §4.6, including any attempt to leave `Terminal`.
#[derive(Debug, Error, Diagnostic, Clone, PartialEq, Eq)]
#[error("invalid run phase transition: {from:?} -> {to:?}")]
#[diagnostic(code(workweave::runstate::invalid_transition))]
pub struct PhaseTransitionError {
    pub from: RunPhase,
    pub to: RunPhase,
}

/// Enforces the phase transition table: `startup` from `Init`; `execute`
/// from `Startup`; `shutdown` from `Executing` or `Startup`; `terminal`
/// from `Shutdown`, `Executing`, or `Startup`. Every other pair, including
/// anything leaving `Terminal`, is an internal invariant error.
#[derive(Debug)]
pub struct RunStateMachine {
    phase: RunPhase,
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self { phase: RunPhase::Init }
    }
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn allowed(to: RunPhase) -> &'static [RunPhase] {
        match to {
            RunPhase::Init => &[],
            RunPhase::Startup => &[RunPhase::Init],
            RunPhase::Executing => &[RunPhase::Startup],
            RunPhase::Shutdown => &[RunPhase::Executing, RunPhase::Startup],
            RunPhase::Terminal => &[RunPhase::Shutdown, RunPhase::Executing, RunPhase::Startup],
        }
    }

    pub fn transition(&mut self, to: RunPhase) -> Result<(), PhaseTransitionError> {
        if Self::allowed(to).contains(&self.phase) {
            self.phase = to;
            Ok(())
        } else {
            Err(PhaseTransitionError { from: self.phase, to })
        }
    }
}

/// The one terminal record a [`RunSession`] ever produces, filled exactly
/// once by [`RunSession::close`].
#[derive(Debug, Clone)]
pub struct TerminalRecord {
    pub status: crate::failure::outcome::TerminalStatus,
    pub reason: Option<&'static str>,
    pub duration_secs: f64,
}

/// Tracks the run's wall-clock start time and its single terminal record.
#[derive(Debug)]
pub struct RunSession {
    start_time: Instant,
    terminal: Option<TerminalRecord>,
}

impl RunSession {
    pub fn start() -> Self {
        Self { start_time: Instant::now(), terminal: None }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64().max(0.0)
    }

    /// Fill the terminal record exactly once. Subsequent calls are ignored
    /// and return the record captured by the first call, matching the
    /// "single terminal event" invariant (§8.1).
    pub fn close(
        &mut self,
        status: crate::failure::outcome::TerminalStatus,
        reason: Option<&'static str>,
    ) -> &TerminalRecord {
        if self.terminal.is_none() {
            self.terminal = Some(TerminalRecord {
                status,
                reason,
                duration_secs: self.elapsed_secs(),
            });
        }
        self.terminal.as_ref().expect("just set above")
    }

    pub fn terminal(&self) -> Option<&TerminalRecord> {
        self.terminal.as_ref()
    }
}

/// Everything the scheduler's thread of control owns for the duration of
/// one `run()` call: the shared state/context handles, the phase machine,
/// the execution log, id generation, cancellation, and per-step attempt
/// counters. Never touched from a worker task directly — workers only
/// append events/results to the queue (§3's ownership rule).
pub struct RunContext<S, C> {
    pub state: Arc<S>,
    pub context: Arc<C>,
    pub closing: bool,
    pub run_id: RunId,
    pub session: RunSession,
    pub phase: RunStateMachine,
    pub log: ExecutionLog,
    pub id_gen: Arc<IdGen>,
    pub cancellation: CancellationToken,
    attempts: FxHashMap<String, u32>,
}

impl<S, C> RunContext<S, C> {
    pub fn new(state: Arc<S>, context: Arc<C>) -> Self {
        let run_id = RunId::generate();
        Self {
            state,
            context,
            closing: false,
            run_id: run_id.clone(),
            session: RunSession::start(),
            phase: RunStateMachine::new(),
            log: ExecutionLog::new(),
            id_gen: Arc::new(IdGen::new(run_id)),
            cancellation: CancellationToken::new(),
            attempts: FxHashMap::default(),
        }
    }

    /// Current attempt number for `step` (0 on first invocation), advanced
    /// by [`Self::next_attempt`] when the scheduler observes a `Retry`
    /// directive.
    pub fn attempt_of(&self, step: &str) -> u32 {
        self.attempts.get(step).copied().unwrap_or(0)
    }

    pub fn next_attempt(&mut self, step: &str) -> u32 {
        let entry = self.attempts.entry(step.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }
}
