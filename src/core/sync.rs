//! Lock poisoning mapped onto the crate's error types
//!
//! The `std::sync` locks in relaybus guard in-process state: the simulated
//! brokers, the backend registry, subscription tables and the process
//! registry. A handler that panics while one is held poisons it; later callers
//! get an error naming the state instead of a second panic.
//!
//! ```
//! use std::sync::Mutex;
//! use relaybus::core::sync::Poisoned;
//!
//! let offsets = Mutex::new(vec![0u64; 3]);
//! let guard = offsets.lock().or_backend("partition offsets").unwrap();
//! assert_eq!(guard.len(), 3);
//! ```

use crate::broker::backends::BackendResult;
use crate::broker::BackendError;
use crate::process::{ProcessError, ProcessResult};
use std::sync::LockResult;

/// Conversions from a lock acquisition into a crate error
pub trait Poisoned<G> {
    /// Poisoning becomes `BackendError::Internal`
    fn or_backend(self, state: &str) -> BackendResult<G>;

    /// Poisoning becomes `ProcessError::Lock`
    fn or_process(self, state: &str) -> ProcessResult<G>;
}

impl<G> Poisoned<G> for LockResult<G> {
    fn or_backend(self, state: &str) -> BackendResult<G> {
        self.map_err(|_| BackendError::Internal(poisoned(state)))
    }

    fn or_process(self, state: &str) -> ProcessResult<G> {
        self.map_err(|_| ProcessError::Lock(poisoned(state)))
    }
}

fn poisoned(state: &str) -> String {
    log::error!("Lock on {} poisoned by a panicking holder", state);
    format!("{} is unusable after a panic while it was locked", state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, RwLock};
    use std::thread;

    fn poison<T: Send + Sync + 'static>(lock: Arc<RwLock<T>>) {
        let _ = thread::spawn(move || {
            let _guard = lock.write().unwrap();
            panic!("handler panicked");
        })
        .join();
    }

    #[test]
    fn test_healthy_lock_passes_guard_through() {
        let table = RwLock::new(HashMap::from([("orders", 1)]));
        table.write().or_backend("subscription table").unwrap().insert("payments", 2);

        let guard = table.read().or_process("subscription table").unwrap();
        assert_eq!(guard.len(), 2);
    }

    #[test]
    fn test_poisoned_lock_names_the_state() {
        let table = Arc::new(RwLock::new(HashMap::<String, u64>::new()));
        poison(table.clone());

        match table.read().or_backend("stream log") {
            Err(BackendError::Internal(detail)) => assert!(detail.starts_with("stream log ")),
            other => panic!("expected internal error, got {:?}", other.map(|g| g.len())),
        }
        match table.write().or_process("process registry") {
            Err(ProcessError::Lock(detail)) => assert!(detail.contains("process registry")),
            other => panic!("expected lock error, got {:?}", other.map(|g| g.len())),
        };
    }

    #[test]
    fn test_poisoned_mutex_maps_to_backend_error() {
        let state = Arc::new(Mutex::new(0u32));
        let holder = state.clone();
        let _ = thread::spawn(move || {
            let _guard = holder.lock().unwrap();
            panic!("handler panicked");
        })
        .join();

        let error = state.lock().or_backend("broker state").unwrap_err();
        assert!(!error.to_string().is_empty());
    }
}
