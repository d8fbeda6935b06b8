//! Core search executor.
//!
//! A single actor task owns the node store, the work queues and every
//! in-flight evaluation. Handles talk to it over a channel; evaluations run as
//! concurrent tasks and report back through a [`JoinSet`], so the store is
//! only ever touched from the actor.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinSet};
use tokio_stream::wrappers::WatchStream;

use crate::config::ExecutorOptions;
use crate::error::{ExecutorError, Result, SearchError, SearchFailure};
use crate::scheduler::{WorkKind, WorkQueues};
use crate::searchable::{Invalidation, InvalidationHook, SearchableRef};
use crate::store::{CommitOutcome, NodeStore};
use crate::types::{NodeResult, SearchOutput, SearchableId};

/// Receives per-node changes from the core executor.
///
/// Callbacks run on the executor task, one at a time, in the order the
/// changes were committed.
pub trait NodeListener<I>: Send + 'static {
    fn on_update(
        &mut self,
        id: &SearchableId,
        result: &NodeResult<I>,
        previous: Option<&NodeResult<I>>,
    );

    fn on_remove(&mut self, id: &SearchableId, result: Option<&NodeResult<I>>);
}

enum CoreCommand<Q> {
    SetQuery {
        query: Q,
        reply: oneshot::Sender<()>,
    },
    Destroy {
        keep_results: bool,
        reply: oneshot::Sender<()>,
    },
}

struct Finished<Q, I> {
    id: SearchableId,
    version: u64,
    elapsed: Duration,
    outcome: std::result::Result<SearchOutput<Q, I>, SearchError>,
}

#[derive(Debug, Default)]
struct FailureLog {
    entries: Vec<SearchFailure>,
}

impl FailureLog {
    fn record(&mut self, failure: SearchFailure, limit: usize) -> bool {
        self.clear(&failure.id);
        if self.entries.len() >= limit {
            return false;
        }
        self.entries.push(failure);
        true
    }

    fn clear(&mut self, id: &SearchableId) {
        self.entries.retain(|entry| entry.id != *id);
    }
}

struct Shared<Q> {
    query: watch::Sender<Option<Q>>,
    searching: watch::Sender<bool>,
    /// Queries handed to the actor, compared against the count it applied so
    /// that `searching` never drops while a submitted query is still queued.
    submitted: AtomicU64,
    failures: Mutex<FailureLog>,
}

impl<Q> Shared<Q> {
    fn new() -> Self {
        Self {
            query: watch::Sender::new(None),
            searching: watch::Sender::new(false),
            submitted: AtomicU64::new(0),
            failures: Mutex::new(FailureLog::default()),
        }
    }
}

/// Handle to a running core executor.
pub struct CoreHandle<Q> {
    commands: mpsc::UnboundedSender<CoreCommand<Q>>,
    shared: Arc<Shared<Q>>,
}

impl<Q> Clone for CoreHandle<Q> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<Q> CoreHandle<Q>
where
    Q: Clone + Send + Sync + 'static,
{
    /// Spawns the executor actor on the current tokio runtime.
    ///
    /// Nothing is evaluated until the first query is set.
    pub fn spawn<I, L>(root: SearchableRef<Q, I>, listener: L, options: ExecutorOptions) -> Self
    where
        I: Send + Sync + 'static,
        L: NodeListener<I>,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new());
        let actor = CoreActor::new(root, listener, options, command_rx, shared.clone());
        tokio::spawn(actor.run());

        Self {
            commands: command_tx,
            shared,
        }
    }

    /// Replaces the query and re-evaluates every known node.
    ///
    /// The query is applied when this is called; the returned future only
    /// waits for the executor to go idle. A stopped executor keeps its last
    /// query.
    pub fn set_query(&self, query: Q) -> impl Future<Output = Result<()>> + Send + 'static {
        let (reply, settled) = oneshot::channel();
        let shared = &self.shared;
        let mut sent = false;
        // The searching lock is held across the send so the actor cannot
        // settle before `submitted` counts this query.
        shared.searching.send_if_modified(|searching| {
            let published = Some(query.clone());
            if self
                .commands
                .send(CoreCommand::SetQuery { query, reply })
                .is_err()
            {
                return false;
            }
            sent = true;
            shared.query.send_replace(published);
            shared.submitted.fetch_add(1, Ordering::AcqRel);
            let changed = !*searching;
            *searching = true;
            changed
        });

        async move {
            if !sent {
                return Err(ExecutorError::Stopped);
            }
            settled.await.map_err(|_| ExecutorError::Stopped)
        }
    }

    pub fn query(&self) -> Option<Q> {
        self.shared.query.borrow().clone()
    }

    pub fn subscribe_query(&self) -> watch::Receiver<Option<Q>> {
        self.shared.query.subscribe()
    }

    pub fn is_searching(&self) -> bool {
        *self.shared.searching.borrow()
    }

    pub fn subscribe_searching(&self) -> watch::Receiver<bool> {
        self.shared.searching.subscribe()
    }

    /// Stream of searching state, starting with the current value.
    pub fn searching_changes(&self) -> WatchStream<bool> {
        WatchStream::new(self.subscribe_searching())
    }

    /// Searches that were rejected and have not recovered since.
    pub fn failures(&self) -> Vec<SearchFailure> {
        self.shared.failures.lock().entries.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.commands.is_closed()
    }

    /// Disposes every invalidation hook and stops the executor. Unless
    /// `keep_results` is set, every node holding an item is reported removed
    /// first.
    pub fn destroy(&self, keep_results: bool) -> impl Future<Output = Result<()>> + Send + 'static {
        let (reply, done) = oneshot::channel();
        let sent = self
            .commands
            .send(CoreCommand::Destroy {
                keep_results,
                reply,
            })
            .is_ok();

        async move {
            if !sent {
                return Err(ExecutorError::Stopped);
            }
            done.await.map_err(|_| ExecutorError::Stopped)
        }
    }
}

struct CoreActor<Q, I, L> {
    store: NodeStore<Q, I>,
    queues: WorkQueues,
    tasks: JoinSet<Finished<Q, I>>,
    listener: L,
    query: Option<Q>,
    applied: u64,
    waiters: Vec<oneshot::Sender<()>>,
    commands: mpsc::UnboundedReceiver<CoreCommand<Q>>,
    invalidation_tx: mpsc::UnboundedSender<Invalidation>,
    invalidations: mpsc::UnboundedReceiver<Invalidation>,
    shared: Arc<Shared<Q>>,
    options: ExecutorOptions,
}

impl<Q, I, L> CoreActor<Q, I, L>
where
    Q: Clone + Send + Sync + 'static,
    I: Send + Sync + 'static,
    L: NodeListener<I>,
{
    fn new(
        root: SearchableRef<Q, I>,
        listener: L,
        options: ExecutorOptions,
        commands: mpsc::UnboundedReceiver<CoreCommand<Q>>,
        shared: Arc<Shared<Q>>,
    ) -> Self {
        let (invalidation_tx, invalidations) = mpsc::unbounded_channel();
        Self {
            store: NodeStore::new(root),
            queues: WorkQueues::new(),
            tasks: JoinSet::new(),
            listener,
            query: None,
            applied: 0,
            waiters: Vec::new(),
            commands,
            invalidation_tx,
            invalidations,
            shared,
            options,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        tracing::debug!("search executor handles dropped; stopping");
                        break;
                    };
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Some(invalidation) = self.invalidations.recv() => {
                    self.handle_invalidation(invalidation);
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.handle_finished(joined);
                }
            }
            self.dispatch();
        }
    }

    /// Returns false once the executor should stop.
    fn handle_command(&mut self, command: CoreCommand<Q>) -> bool {
        match command {
            CoreCommand::SetQuery { query, reply } => {
                tracing::debug!("search query changed; {} nodes known", self.store.len());
                self.query = Some(query);
                self.applied += 1;
                self.waiters.push(reply);
                self.store.schedule_refresh_all(&mut self.queues);
                self.mark_searching();
                true
            }
            CoreCommand::Destroy {
                keep_results,
                reply,
            } => {
                self.destroy(keep_results);
                let _ = reply.send(());
                false
            }
        }
    }

    fn handle_invalidation(&mut self, invalidation: Invalidation) {
        if self.query.is_none() || !self.store.is_current(&invalidation.id, invalidation.version)
        {
            tracing::trace!("outdated invalidation of {} ignored", invalidation.id);
            return;
        }
        if self.store.schedule_update(&mut self.queues, &invalidation.id) {
            self.mark_searching();
        }
    }

    fn handle_finished(&mut self, joined: std::result::Result<Finished<Q, I>, JoinError>) {
        let finished = match joined {
            Ok(finished) => finished,
            Err(error) => {
                tracing::warn!("search evaluation task ended abnormally: {}", error);
                return;
            }
        };
        let Finished {
            id,
            version,
            elapsed,
            outcome,
        } = finished;

        if !self.store.is_current(&id, version) {
            tracing::trace!("discarding superseded result for {}", id);
            return;
        }
        if elapsed.as_millis() >= u128::from(self.options.slow_search_warn_ms) {
            tracing::debug!("search for {} took {}ms", id, elapsed.as_millis());
        }

        let output = match outcome {
            Ok(output) => {
                self.shared.failures.lock().clear(&id);
                output
            }
            Err(error) => {
                tracing::warn!("search for {} failed: {}", id, error);
                let failure = SearchFailure {
                    id: id.clone(),
                    error: Arc::new(error),
                };
                if !self
                    .shared
                    .failures
                    .lock()
                    .record(failure, self.options.max_tracked_failures)
                {
                    tracing::debug!("failure log full; not tracking failure of {}", id);
                }
                SearchOutput::empty()
            }
        };

        match self.store.commit(&mut self.queues, &id, version, output) {
            CommitOutcome::Stale => {}
            CommitOutcome::Committed { previous } => {
                if let Some(result) = self.store.result(&id) {
                    self.listener.on_update(&id, result, previous.as_ref());
                }
            }
        }
    }

    /// Drains the queues in priority order. Removals run inline, everything
    /// else is launched without waiting for it.
    fn dispatch(&mut self) {
        while let Some(work) = self.queues.pop() {
            match work.kind {
                WorkKind::Removal => self.remove_node(&work.id),
                WorkKind::Refresh | WorkKind::Update | WorkKind::Addition => self.launch(&work.id),
            }
        }

        if self.tasks.is_empty() {
            self.settle();
        }
    }

    fn launch(&mut self, id: &SearchableId) {
        let Some(query) = self.query.clone() else {
            return;
        };
        let Some(evaluation) = self.store.begin_evaluation(id) else {
            return;
        };

        let hook = InvalidationHook::new(
            id.clone(),
            evaluation.version,
            evaluation.hook,
            self.invalidation_tx.clone(),
        );
        let searchable = evaluation.searchable;
        let version = evaluation.version;
        let id = id.clone();
        self.tasks.spawn(async move {
            let started = Instant::now();
            let outcome = match AssertUnwindSafe(searchable.search(&query, &hook))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic) => Err(SearchError::Panicked(panic_message(&*panic))),
            };
            Finished {
                id,
                version,
                elapsed: started.elapsed(),
                outcome,
            }
        });
    }

    fn remove_node(&mut self, id: &SearchableId) {
        let Some(node) = self.store.remove_node(&mut self.queues, id) else {
            return;
        };
        self.shared.failures.lock().clear(id);
        self.listener.on_remove(id, node.result.as_ref());
    }

    fn mark_searching(&self) {
        self.shared.searching.send_if_modified(|searching| {
            let changed = !*searching;
            *searching = true;
            changed
        });
    }

    /// Called whenever the queues are empty and nothing is in flight.
    fn settle(&mut self) {
        let shared = &self.shared;
        let applied = self.applied;
        shared.searching.send_if_modified(|searching| {
            if shared.submitted.load(Ordering::Acquire) != applied {
                return false;
            }
            let changed = *searching;
            *searching = false;
            changed
        });

        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn destroy(&mut self, keep_results: bool) {
        tracing::debug!(
            "destroying search executor; nodes={} keep_results={}",
            self.store.len(),
            keep_results
        );
        self.store.dispose_hooks();
        self.tasks.abort_all();
        self.queues.clear();

        if !keep_results {
            // Plain items first, so dropping the last pattern match cannot
            // bring hidden items back.
            let (plain, patterned): (Vec<_>, Vec<_>) = self
                .store
                .iter()
                .filter_map(|(id, node)| node.result.as_ref().map(|result| (id, result)))
                .filter(|(_, result)| result.item.is_some() || result.pattern_match.is_some())
                .partition(|(_, result)| result.pattern_match.is_none());
            for (id, result) in plain.into_iter().chain(patterned) {
                self.listener.on_remove(id, Some(result));
            }
        }

        self.shared.searching.send_replace(false);
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

/// Runs on every exit of the actor, including a panicking listener.
impl<Q, I, L> Drop for CoreActor<Q, I, L> {
    fn drop(&mut self) {
        self.store.dispose_hooks();
        self.shared.searching.send_if_modified(|searching| {
            let changed = *searching;
            *searching = false;
            changed
        });
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
