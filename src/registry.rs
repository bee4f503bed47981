use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::util;

/// Keyed store guaranteeing one task instance per tag, process-wide.
///
/// A task obtained here survives the teardown of whatever caller context
/// started it: a recreated caller asks for the same tag and reattaches to
/// the existing (possibly still running) instance. The registry never
/// removes entries itself; teardown belongs to whoever owns the registry.
///
/// Returned instances are shared. Callers must not assume exclusive
/// ownership, and concurrent `run()` requests against the same tag are
/// serialized by the tasks themselves rejecting a second run.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<Mutex<HashMap<&'static str, Arc<dyn Any + Send + Sync>>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the instance registered under `tag`, creating it with
    /// `create` on first request.
    pub fn obtain<T, F>(&self, tag: &'static str, create: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Arc<T>,
    {
        let mut map = util::lock(&self.inner);
        if let Some(existing) = map.get(tag) {
            match Arc::clone(existing).downcast::<T>() {
                Ok(task) => return task,
                Err(_) => {
                    tracing::warn!(tag, "registry tag reused with a different task type; replacing");
                }
            }
        }
        let task = create();
        map.insert(tag, Arc::clone(&task) as Arc<dyn Any + Send + Sync>);
        task
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tags: Vec<&'static str> = util::lock(&self.inner).keys().copied().collect();
        f.debug_struct("TaskRegistry").field("tags", &tags).finish()
    }
}
