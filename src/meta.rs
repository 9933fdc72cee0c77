//! Scoped metadata stores: run-scoped, step-scoped, and the ambient
//! current-step binding that lets a worker discover "what step am I" without
//! threading it through every call.
//!
//! The ambient binding is a `tokio::task_local!`, which survives `.await`
//! points within a single task and is set fresh by the scheduler every time
//! it spawns a worker (see [`crate::scheduler`]). This matches the
//! thread-local-plus-explicit-propagation idiom called for by the design
//! notes: each concurrent worker gets an isolated binding.

use rustc_hash::FxHashMap;
use serde_json::Value;

tokio::task_local! {
    static CURRENT_STEP: StepMeta;
}

/// Run a future with `meta` bound as the ambient current-step metadata for
/// its duration, including across any `.await` points inside it.
pub async fn with_step_scope<F, T>(meta: StepMeta, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    CURRENT_STEP.scope(meta, fut).await
}

/// Read a clone of the ambient current-step metadata. Panics if called
/// outside a scope established by [`with_step_scope`] — mirrors the
/// teacher's convention of panicking on programmer error rather than
/// returning a sentinel (cf. `EventBus::event_stream`'s double-subscribe
/// panic).
pub fn current_step() -> StepMeta {
    CURRENT_STEP.with(Clone::clone)
}

/// Try to read the ambient current-step metadata, returning `None` outside
/// a scope rather than panicking.
pub fn try_current_step() -> Option<StepMeta> {
    CURRENT_STEP.try_with(Clone::clone).ok()
}

/// Key/value + tags + counters bag scoped to a single step invocation.
#[derive(Clone, Debug, Default)]
pub struct StepMeta {
    pub step_name: String,
    pub attempt: u32,
    tags: Vec<String>,
    values: FxHashMap<String, Value>,
    counters: FxHashMap<String, i64>,
}

impl StepMeta {
    pub fn new(step_name: impl Into<String>, attempt: u32) -> Self {
        Self {
            step_name: step_name.into(),
            attempt,
            tags: Vec::new(),
            values: FxHashMap::default(),
            counters: FxHashMap::default(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn increment(&mut self, counter: impl Into<String>, by: i64) -> i64 {
        let entry = self.counters.entry(counter.into()).or_insert(0);
        *entry += by;
        *entry
    }

    pub fn counters(&self) -> &FxHashMap<String, i64> {
        &self.counters
    }
}

/// Run-scoped metadata, shared (read-mostly) across all workers in a run.
/// Unlike [`StepMeta`], this is not task-local: it is held behind the
/// `RunContext` and cloned into the `FINISH` payload as `user_meta`.
#[derive(Clone, Debug, Default)]
pub struct RunMeta {
    values: FxHashMap<String, Value>,
}

impl RunMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn as_json(&self) -> Value {
        Value::Object(self.values.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ambient_step_binding_survives_await() {
        let meta = StepMeta::new("alpha", 0);
        with_step_scope(meta, async {
            tokio::task::yield_now().await;
            assert_eq!(current_step().step_name, "alpha");
        })
        .await;
    }

    #[test]
    fn without_scope_try_current_step_is_none() {
        assert!(try_current_step().is_none());
    }
}
