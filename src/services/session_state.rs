//! State a session learns while its pipeline runs.
//!
//! Stages receive an `Arc<SessionState>` at construction: earlier stages set
//! the Emissary context and user ids, the active-scan stage accumulates the
//! alert total, post-scanning records the verdict.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::errors::AppError;
use crate::models::scan::Verdict;

#[derive(Debug, Default)]
pub struct SessionState {
    context_id: Mutex<Option<String>>,
    user_id: Mutex<Option<String>>,
    alert_total: AtomicU64,
    verdict: Mutex<Option<Verdict>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_context_id(&self, id: impl Into<String>) {
        *self.context_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(id.into());
    }

    pub fn set_user_id(&self, id: impl Into<String>) {
        *self.user_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(id.into());
    }

    /// The context id learned from the Emissary.
    pub fn context_id(&self) -> Result<String, AppError> {
        self.context_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                AppError::Internal("Emissary context id has not been established".to_string())
            })
    }

    pub fn user_id(&self) -> Result<String, AppError> {
        self.user_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| {
                AppError::Internal("Emissary user id has not been established".to_string())
            })
    }

    /// Add a completed target's alert count, returning the new total.
    pub fn add_alerts(&self, count: u64) -> u64 {
        self.alert_total.fetch_add(count, Ordering::SeqCst) + count
    }

    pub fn alert_total(&self) -> u64 {
        self.alert_total.load(Ordering::SeqCst)
    }

    pub fn set_verdict(&self, verdict: Verdict) {
        *self.verdict.lock().unwrap_or_else(PoisonError::into_inner) = Some(verdict);
    }

    pub fn verdict(&self) -> Option<Verdict> {
        *self.verdict.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
