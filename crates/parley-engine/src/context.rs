use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parley_core::engine::ModelCatalog;

pub const DEFAULT_SUGGESTION_SAMPLE_SIZE: usize = 4;

/// Application-wide collaborators shared by every session.
#[derive(Clone)]
pub struct AppContext {
    pub models: Arc<dyn ModelCatalog>,
    opted_in: Arc<AtomicBool>,
    pub suggestion_sample_size: usize,
}

impl AppContext {
    pub fn new(models: Arc<dyn ModelCatalog>, opted_in: bool) -> Self {
        Self {
            models,
            opted_in: Arc::new(AtomicBool::new(opted_in)),
            suggestion_sample_size: DEFAULT_SUGGESTION_SAMPLE_SIZE,
        }
    }

    pub fn with_suggestion_sample_size(mut self, size: usize) -> Self {
        self.suggestion_sample_size = size;
        self
    }

    pub fn has_user_opted_in(&self) -> bool {
        self.opted_in.load(Ordering::Acquire)
    }

    /// Shared by every clone of this context.
    pub fn set_user_opted_in(&self, opted_in: bool) {
        self.opted_in.store(opted_in, Ordering::Release);
    }
}
