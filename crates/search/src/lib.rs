//! Incremental recursive search engine for the launcher.
//!
//! This crate provides:
//! - A [`Searchable`] contract for recursive, async search sources
//! - A core executor that keeps the set of matching nodes current as the query
//!   changes, with priority scheduling and stale result defusal
//! - A pattern filter that hides plain items while any pattern match is live
//! - The [`SearchExecutor`] facade publishing a flat add/remove item stream

pub mod config;
pub mod core;
pub mod error;
pub mod executor;
pub mod pattern;
pub mod scheduler;
pub mod searchable;
pub mod store;
pub mod throttle;
pub mod types;

// Re-export main types
pub use crate::core::{CoreHandle, NodeListener};
pub use config::ExecutorOptions;
pub use error::{ExecutorError, SearchError, SearchFailure};
pub use executor::{ItemSink, SearchExecutor, SearchExecutorBuilder};
pub use pattern::{default_pattern_resolver, PatternFilter, PatternResolver};
pub use searchable::{searchable_fn, FnSearchable, InvalidationHook, Searchable, SearchableRef};
pub use throttle::{Throttle, ThrottledSearchable};
pub use types::{ItemEvent, NodeResult, PatternMatch, SearchOutput, SearchableId};

#[cfg(test)]
pub(crate) mod testing;
