use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex, recovering the guard if a previous holder panicked.
///
/// The orchestrator's shared state stays consistent across a poisoned lock:
/// every critical section either fully replaces a value or appends to a
/// list, so the inner data is usable regardless of where the panic hit.
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
