//! Engine-wide tunables sourced from the environment, following the
//! teacher's `.env`-then-`std::env::var`-then-default fallback chain
//! (`runtimes/runtime_config.rs::RuntimeConfig::resolve_sqlite_db_name`).

/// Tunables the scheduler reads at `run()` time: the work queue's bounded
/// capacity (§5 — zero or less means unbounded) and the default barrier
/// timeout applied when a step declares none of its own.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub queue_size: isize,
    pub default_barrier_timeout_ms: Option<u64>,
    pub observer_dispatch: ObserverDispatch,
}

/// Whether observer callbacks run one-at-a-time per event (the default) or
/// concurrently. §5: "observer callbacks must be tolerant to concurrent
/// invocations ONLY IF the caller enables a parallel observer dispatch
/// option."
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObserverDispatch {
    Serial,
    Parallel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_size: Self::resolve_queue_size(None),
            default_barrier_timeout_ms: None,
            observer_dispatch: ObserverDispatch::Serial,
        }
    }
}

impl EngineConfig {
    fn resolve_queue_size(provided: Option<isize>) -> isize {
        if let Some(size) = provided {
            return size;
        }
        dotenvy::dotenv().ok();
        std::env::var("WORKWEAVE_QUEUE_SIZE")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }

    pub fn new(queue_size: Option<isize>) -> Self {
        Self { queue_size: Self::resolve_queue_size(queue_size), ..Self::default() }
    }

    #[must_use]
    pub fn with_default_barrier_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_barrier_timeout_ms = Some(timeout_ms);
        self
    }

    #[must_use]
    pub fn with_parallel_observers(mut self) -> Self {
        self.observer_dispatch = ObserverDispatch::Parallel;
        self
    }

    /// `queue_size <= 0` means unbounded, per §5.
    pub fn bounded_capacity(&self) -> Option<usize> {
        if self.queue_size <= 0 {
            None
        } else {
            Some(self.queue_size as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_or_negative_queue_size_means_unbounded() {
        assert_eq!(EngineConfig::new(Some(0)).bounded_capacity(), None);
        assert_eq!(EngineConfig::new(Some(-1)).bounded_capacity(), None);
    }

    #[test]
    fn positive_queue_size_is_bounded() {
        assert_eq!(EngineConfig::new(Some(16)).bounded_capacity(), Some(16));
    }
}
