//! Concurrency limit for searchables that hit a shared backend.
//!
//! The executor launches every pending evaluation at once. Wrapping a subtree
//! in [`ThrottledSearchable`] bounds how many of its searches run together.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::error::SearchError;
use crate::searchable::{InvalidationHook, Searchable, SearchableRef};
use crate::types::{SearchOutput, SearchableId};

/// Shared pool of search permits.
#[derive(Debug, Clone)]
pub struct Throttle {
    permits: Arc<Semaphore>,
}

impl Throttle {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(permits.max(1))),
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wraps `searchable` and every child it returns.
    pub fn wrap<Q, I>(&self, searchable: SearchableRef<Q, I>) -> SearchableRef<Q, I>
    where
        Q: Send + Sync + 'static,
        I: Send + Sync + 'static,
    {
        Arc::new(ThrottledSearchable::new(searchable, self.clone()))
    }
}

pub struct ThrottledSearchable<Q, I> {
    inner: SearchableRef<Q, I>,
    throttle: Throttle,
}

impl<Q, I> ThrottledSearchable<Q, I> {
    pub fn new(inner: SearchableRef<Q, I>, throttle: Throttle) -> Self {
        Self { inner, throttle }
    }
}

#[async_trait]
impl<Q, I> Searchable<Q, I> for ThrottledSearchable<Q, I>
where
    Q: Send + Sync + 'static,
    I: Send + Sync + 'static,
{
    fn id(&self) -> SearchableId {
        self.inner.id()
    }

    async fn search(
        &self,
        query: &Q,
        hook: &InvalidationHook,
    ) -> Result<SearchOutput<Q, I>, SearchError> {
        let mut output = {
            let _permit = self
                .throttle
                .permits
                .acquire()
                .await
                .map_err(|_| SearchError::failed("search throttle closed"))?;
            self.inner.search(query, hook).await?
        };
        output.children = output
            .children
            .into_iter()
            .map(|child| self.throttle.wrap(child))
            .collect();
        Ok(output)
    }
}
