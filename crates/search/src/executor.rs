//! Search executor facade.
//!
//! Wires the core executor into a [`PatternFilter`] and republishes the result
//! as a flat stream of item additions and removals.

use std::future::Future;

use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::WatchStream;

use crate::config::ExecutorOptions;
use crate::core::CoreHandle;
use crate::error::{Result, SearchFailure};
use crate::pattern::{default_pattern_resolver, PatternFilter, PatternResolver};
use crate::searchable::SearchableRef;
use crate::types::{ItemEvent, PatternMatch};

/// Consumer of the visible item set, e.g. a menu.
///
/// Items are reported by value; a consumer tracks what it shows by item
/// equality.
pub trait ItemSink<I>: Send + 'static {
    fn add(&mut self, item: I);
    fn remove(&mut self, item: I);
}

impl<I: Send + 'static> ItemSink<I> for mpsc::UnboundedSender<ItemEvent<I>> {
    fn add(&mut self, item: I) {
        let _ = self.send(ItemEvent::Added(item));
    }

    fn remove(&mut self, item: I) {
        let _ = self.send(ItemEvent::Removed(item));
    }
}

pub struct SearchExecutorBuilder<Q, I, S> {
    root: SearchableRef<Q, I>,
    sink: S,
    resolver: PatternResolver,
    options: ExecutorOptions,
}

impl<Q, I, S> SearchExecutorBuilder<Q, I, S>
where
    Q: Clone + Send + Sync + 'static,
    I: Clone + PartialEq + Send + Sync + 'static,
    S: ItemSink<I>,
{
    /// Overrides how equivalent pattern matches are recognized.
    pub fn pattern_resolver(mut self, resolver: PatternResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    /// Starts the executor on the current tokio runtime.
    pub fn spawn(self) -> SearchExecutor<Q> {
        let filter = PatternFilter::new(self.sink, self.resolver);
        let patterns = filter.subscribe();
        let core = CoreHandle::spawn(self.root, filter, self.options);
        SearchExecutor { core, patterns }
    }
}

/// Handle to a running search: set the query, observe state, tear down.
pub struct SearchExecutor<Q> {
    core: CoreHandle<Q>,
    patterns: watch::Receiver<Vec<PatternMatch>>,
}

impl<Q> Clone for SearchExecutor<Q> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            patterns: self.patterns.clone(),
        }
    }
}

impl<Q> SearchExecutor<Q>
where
    Q: Clone + Send + Sync + 'static,
{
    pub fn builder<I, S>(root: SearchableRef<Q, I>, sink: S) -> SearchExecutorBuilder<Q, I, S>
    where
        I: Clone + PartialEq + Send + Sync + 'static,
        S: ItemSink<I>,
    {
        SearchExecutorBuilder {
            root,
            sink,
            resolver: default_pattern_resolver(),
            options: ExecutorOptions::default(),
        }
    }

    /// Sets the query; the returned future resolves once every evaluation it
    /// caused has settled.
    pub fn set_query(&self, query: Q) -> impl Future<Output = Result<()>> + Send + 'static {
        self.core.set_query(query)
    }

    pub fn query(&self) -> Option<Q> {
        self.core.query()
    }

    pub fn subscribe_query(&self) -> watch::Receiver<Option<Q>> {
        self.core.subscribe_query()
    }

    pub fn is_searching(&self) -> bool {
        self.core.is_searching()
    }

    pub fn subscribe_searching(&self) -> watch::Receiver<bool> {
        self.core.subscribe_searching()
    }

    pub fn searching_changes(&self) -> WatchStream<bool> {
        self.core.searching_changes()
    }

    /// Pattern matches currently contributed by at least one node.
    pub fn pattern_matches(&self) -> Vec<PatternMatch> {
        self.patterns.borrow().clone()
    }

    pub fn subscribe_pattern_matches(&self) -> watch::Receiver<Vec<PatternMatch>> {
        self.patterns.clone()
    }

    pub fn failures(&self) -> Vec<SearchFailure> {
        self.core.failures()
    }

    pub fn is_stopped(&self) -> bool {
        self.core.is_stopped()
    }

    pub fn destroy(&self, keep_results: bool) -> impl Future<Output = Result<()>> + Send + 'static {
        self.core.destroy(keep_results)
    }

    pub fn core(&self) -> &CoreHandle<Q> {
        &self.core
    }
}
