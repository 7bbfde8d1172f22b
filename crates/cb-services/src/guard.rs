//! Duplicate-submission guard.
//!
//! Stands in for the disabled submit button: while a ticket for a key is
//! alive, a second acquire for the same key is refused.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use cb_core::{AppError, Result};

#[derive(Debug, Clone, Default)]
pub struct SubmitGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Releases its slot when dropped.
#[derive(Debug)]
pub struct SubmitTicket {
    key: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl SubmitGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, key: impl Into<String>) -> Result<SubmitTicket> {
        let key = key.into();
        let mut slots = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !slots.insert(key.clone()) {
            return Err(AppError::Conflict(format!("{key} is already being submitted")));
        }
        Ok(SubmitTicket { key, in_flight: Arc::clone(&self.in_flight) })
    }

    pub fn is_busy(&self, key: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }
}

impl Drop for SubmitTicket {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}
