//! Fixtures shared by the executor tests.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::SearchError;
use crate::executor::ItemSink;
use crate::searchable::{InvalidationHook, Searchable, SearchableRef};
use crate::types::{ItemEvent, PatternMatch, SearchOutput, SearchableId};

pub(crate) type Matcher = Box<dyn Fn(&str) -> bool + Send + Sync>;
pub(crate) type PatternFn = Box<dyn Fn(&str) -> Option<PatternMatch> + Send + Sync>;
pub(crate) type DelayFn = Box<dyn Fn(&str) -> Option<Duration> + Send + Sync>;

/// Scriptable searchable. Matches every query and reports its ID as item
/// unless configured otherwise.
pub(crate) struct TestNode {
    id: &'static str,
    label: Mutex<Option<String>>,
    matcher: Matcher,
    pattern: Option<PatternFn>,
    delay: Option<DelayFn>,
    children: Mutex<Vec<Arc<TestNode>>>,
    failing: AtomicBool,
    panicking: AtomicBool,
    calls: AtomicUsize,
    hooks: Mutex<Vec<InvalidationHook>>,
}

impl TestNode {
    pub fn new(id: &'static str) -> Self {
        Self {
            id,
            label: Mutex::new(Some(id.to_string())),
            matcher: Box::new(|_| true),
            pattern: None,
            delay: None,
            children: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            panicking: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// A node that only groups children.
    pub fn group(id: &'static str, children: Vec<Arc<TestNode>>) -> Self {
        let node = Self::new(id).children(children);
        *node.label.lock() = None;
        node
    }

    pub fn matching(mut self, matcher: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.matcher = Box::new(matcher);
        self
    }

    pub fn pattern(
        mut self,
        pattern: impl Fn(&str) -> Option<PatternMatch> + Send + Sync + 'static,
    ) -> Self {
        self.pattern = Some(Box::new(pattern));
        self
    }

    pub fn delay(mut self, delay: impl Fn(&str) -> Option<Duration> + Send + Sync + 'static) -> Self {
        self.delay = Some(Box::new(delay));
        self
    }

    pub fn children(self, children: Vec<Arc<TestNode>>) -> Self {
        *self.children.lock() = children;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn set_children(&self, children: Vec<Arc<TestNode>>) {
        *self.children.lock() = children;
    }

    pub fn set_label(&self, label: &str) {
        *self.label.lock() = Some(label.to_string());
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_panicking(&self, panicking: bool) {
        self.panicking.store(panicking, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Hook handed to the most recent evaluation.
    pub fn last_hook(&self) -> Option<InvalidationHook> {
        self.hooks.lock().last().cloned()
    }

    pub fn hooks(&self) -> Vec<InvalidationHook> {
        self.hooks.lock().clone()
    }
}

pub(crate) fn to_searchable(node: &Arc<TestNode>) -> SearchableRef<String, String> {
    node.clone()
}

#[async_trait]
impl Searchable<String, String> for TestNode {
    fn id(&self) -> SearchableId {
        self.id.into()
    }

    async fn search(
        &self,
        query: &String,
        hook: &InvalidationHook,
    ) -> Result<SearchOutput<String, String>, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.hooks.lock().push(hook.clone());

        let delay = self.delay.as_ref().and_then(|delay| delay(query));
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.panicking.load(Ordering::SeqCst) {
            panic!("{} exploded", self.id);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(SearchError::failed(format!("{} is unavailable", self.id)));
        }

        let children = self.children.lock().iter().map(to_searchable).collect();
        let mut output = SearchOutput::empty().with_children(children);
        if (self.matcher)(query) {
            output.item = self.label.lock().clone();
        }
        output.pattern_match = self.pattern.as_ref().and_then(|pattern| pattern(query));
        Ok(output)
    }
}

/// Sink recording every item event.
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    events: Arc<Mutex<Vec<ItemEvent<String>>>>,
}

impl ItemSink<String> for Recorder {
    fn add(&mut self, item: String) {
        self.events.lock().push(ItemEvent::Added(item));
    }

    fn remove(&mut self, item: String) {
        self.events.lock().push(ItemEvent::Removed(item));
    }
}

impl Recorder {
    pub fn events(&self) -> Vec<ItemEvent<String>> {
        self.events.lock().clone()
    }

    /// Events recorded after the first `from`.
    pub fn events_since(&self, from: usize) -> Vec<ItemEvent<String>> {
        self.events.lock().get(from..).map(<[_]>::to_vec).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Replays the event log into the visible set. Panics if an item was added
    /// twice or removed while not visible.
    pub fn items(&self) -> BTreeSet<String> {
        let mut counts: HashMap<String, i64> = HashMap::new();
        for event in self.events.lock().iter() {
            match event {
                ItemEvent::Added(item) => *counts.entry(item.clone()).or_default() += 1,
                ItemEvent::Removed(item) => *counts.entry(item.clone()).or_default() -= 1,
            }
        }
        for (item, count) in &counts {
            assert!(
                (0..=1).contains(count),
                "item {item} has unbalanced events: {count}"
            );
        }
        counts
            .into_iter()
            .filter(|(_, count)| *count == 1)
            .map(|(item, _)| item)
            .collect()
    }
}

pub(crate) fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|item| item.to_string()).collect()
}

pub(crate) async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// Polls `condition` until it holds.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
}
