use std::sync::Arc;

use crate::types::SearchableId;

/// Error returned by a [`Searchable`](crate::Searchable) whose search failed.
///
/// A failing search only removes that node's own contribution; the executor
/// keeps going and records the failure out of band.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("search failed: {0}")]
    Failed(String),

    #[error("search panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl SearchError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("search executor stopped")]
    Stopped,

    #[error("invalid executor options: {0}")]
    InvalidOptions(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// A rejected evaluation, kept until the node succeeds again or goes away.
#[derive(Debug, Clone)]
pub struct SearchFailure {
    pub id: SearchableId,
    pub error: Arc<SearchError>,
}
