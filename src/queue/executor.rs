use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::queue::job::Job;

/// What a successful marking run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkOutcome {
    /// Percentage, 0..=100.
    pub mark: u8,
    pub feedback: Option<String>,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutorError {
    /// Worth another attempt (sandbox unavailable, resource exhaustion, ...).
    #[error("transient: {0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),

    /// The executor cannot mark this job; it needs a human marker.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl ExecutorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutorError::Transient(_))
    }
}

/// Marks one job. Implemented outside the coordinator, typically by a
/// sandboxed code-execution service.
#[async_trait]
pub trait MarkingExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<MarkOutcome, ExecutorError>;
}

/// Executors keyed by job kind.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    by_kind: HashMap<String, Arc<dyn MarkingExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, executor: Arc<dyn MarkingExecutor>) {
        let kind = kind.into();
        tracing::debug!(kind = %kind, "Executor registered");
        self.by_kind.insert(kind, executor);
    }

    pub fn with(mut self, kind: impl Into<String>, executor: Arc<dyn MarkingExecutor>) -> Self {
        self.register(kind, executor);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn MarkingExecutor>> {
        self.by_kind.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.by_kind.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
