//! Identifiers for runs, events, and step invocations.
//!
//! Run ids are opaque 128-bit values rendered as hex. Event sequence numbers
//! and invocation sequence numbers are per-run monotonic counters; both are
//! generated by [`IdGen`], which a [`crate::runstate::RunContext`] owns
//! exclusively for the lifetime of a single run.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque run identifier, rendered as lowercase hex (no dashes) to keep the
/// wire form compact and stable across serialization boundaries.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh run id from a random v4 UUID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifies a single execution of a step. Formatted `{run_id}:{seq}` so
/// that it remains human-readable in logs while staying unique per run.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationId(String);

impl InvocationId {
    fn new(run_id: &RunId, seq: u64) -> Self {
        Self(format!("{run_id}:{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic counters scoped to a single run: one sequence for emitted
/// events (`seq` in the wire shape), one for step invocations.
///
/// Both counters start at 1 so that `START.seq == 1` holds trivially (see
/// invariant 1 of the testable properties).
#[derive(Debug)]
pub struct IdGen {
    run_id: RunId,
    event_seq: AtomicU64,
    invocation_seq: AtomicU64,
}

impl IdGen {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            event_seq: AtomicU64::new(0),
            invocation_seq: AtomicU64::new(0),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Allocate the next event sequence number. Strictly increasing across
    /// the lifetime of the run regardless of which worker calls it.
    pub fn next_event_seq(&self) -> u64 {
        self.event_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Allocate a fresh invocation id for a new step execution.
    pub fn next_invocation_id(&self) -> InvocationId {
        let seq = self.invocation_seq.fetch_add(1, Ordering::SeqCst) + 1;
        InvocationId::new(&self.run_id, seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_seq_starts_at_one_and_strictly_increases() {
        let gen = IdGen::new(RunId::generate());
        assert_eq!(gen.next_event_seq(), 1);
        assert_eq!(gen.next_event_seq(), 2);
        assert_eq!(gen.next_event_seq(), 3);
    }

    #[test]
    fn invocation_ids_are_unique_and_carry_run_id() {
        let run_id = RunId::generate();
        let gen = IdGen::new(run_id.clone());
        let a = gen.next_invocation_id();
        let b = gen.next_invocation_id();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with(run_id.as_str()));
    }
}
