//! The contract search sources implement, and the hook they use to request
//! their own re-evaluation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SearchError;
use crate::types::{SearchOutput, SearchableId};

pub type SearchableRef<Q, I> = Arc<dyn Searchable<Q, I>>;

/// A unit of recursive search.
///
/// `search` may return an item for this node, the children to search next and
/// an optional pattern match. It is never preempted; a result that arrives
/// after a newer evaluation of the same node started is discarded.
#[async_trait]
pub trait Searchable<Q, I>: Send + Sync {
    fn id(&self) -> SearchableId;

    async fn search(
        &self,
        query: &Q,
        hook: &InvalidationHook,
    ) -> Result<SearchOutput<Q, I>, SearchError>;
}

/// Re-evaluation request sent from a hook to the executor.
#[derive(Debug, Clone)]
pub(crate) struct Invalidation {
    pub id: SearchableId,
    pub version: u64,
}

/// Single-use handle that lets a searchable ask for one more evaluation when
/// data it depends on changes outside of the query.
///
/// A hook belongs to one evaluation. It is disposed when it fires, when the
/// node is evaluated again or removed, and when the executor is destroyed;
/// calling [`invalidate`](Self::invalidate) on a disposed hook does nothing.
#[derive(Clone)]
pub struct InvalidationHook {
    id: SearchableId,
    version: u64,
    token: CancellationToken,
    tx: Option<mpsc::UnboundedSender<Invalidation>>,
}

impl InvalidationHook {
    pub(crate) fn new(
        id: SearchableId,
        version: u64,
        token: CancellationToken,
        tx: mpsc::UnboundedSender<Invalidation>,
    ) -> Self {
        Self {
            id,
            version,
            token,
            tx: Some(tx),
        }
    }

    /// A hook that is not connected to any executor.
    pub fn detached(id: impl Into<SearchableId>) -> Self {
        Self {
            id: id.into(),
            version: 0,
            token: CancellationToken::new(),
            tx: None,
        }
    }

    pub fn id(&self) -> &SearchableId {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Schedules one re-evaluation of the owning node.
    pub fn invalidate(&self) {
        if self.token.is_cancelled() {
            return;
        }
        self.token.cancel();
        if let Some(tx) = &self.tx {
            let _ = tx.send(Invalidation {
                id: self.id.clone(),
                version: self.version,
            });
        }
    }

    /// Resolves once the hook is disposed.
    pub async fn disposed(&self) {
        self.token.cancelled().await;
    }
}

impl fmt::Debug for InvalidationHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationHook")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("active", &self.is_active())
            .finish()
    }
}

type SearchFn<Q, I> = dyn Fn(Q, InvalidationHook) -> BoxFuture<'static, Result<SearchOutput<Q, I>, SearchError>>
    + Send
    + Sync;

/// Searchable backed by a closure.
pub struct FnSearchable<Q, I> {
    id: SearchableId,
    search: Box<SearchFn<Q, I>>,
}

impl<Q, I> FnSearchable<Q, I> {
    pub fn new<F>(id: impl Into<SearchableId>, search: F) -> Self
    where
        F: Fn(Q, InvalidationHook) -> BoxFuture<'static, Result<SearchOutput<Q, I>, SearchError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            id: id.into(),
            search: Box::new(search),
        }
    }
}

#[async_trait]
impl<Q, I> Searchable<Q, I> for FnSearchable<Q, I>
where
    Q: Clone + Send + Sync + 'static,
    I: Send + 'static,
{
    fn id(&self) -> SearchableId {
        self.id.clone()
    }

    async fn search(
        &self,
        query: &Q,
        hook: &InvalidationHook,
    ) -> Result<SearchOutput<Q, I>, SearchError> {
        (self.search)(query.clone(), hook.clone()).await
    }
}

/// Builds a shared searchable from a closure.
pub fn searchable_fn<Q, I, F>(id: impl Into<SearchableId>, search: F) -> SearchableRef<Q, I>
where
    Q: Clone + Send + Sync + 'static,
    I: Send + 'static,
    F: Fn(Q, InvalidationHook) -> BoxFuture<'static, Result<SearchOutput<Q, I>, SearchError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnSearchable::new(id, search))
}
