//! Pattern filter: turns per-node results into the flat visible item set.
//!
//! While at least one pattern match is live, only items of nodes that carry a
//! pattern match themselves stay visible.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;

use crate::core::NodeListener;
use crate::executor::ItemSink;
use crate::types::{NodeResult, PatternMatch, SearchableId};

/// Finds the already-registered match equivalent to a candidate, returning
/// its position in the list of known matches.
pub type PatternResolver = Arc<dyn Fn(&PatternMatch, &[PatternMatch]) -> Option<usize> + Send + Sync>;

/// Structural equality over the whole match, metadata included.
pub fn default_pattern_resolver() -> PatternResolver {
    Arc::new(|candidate, known| known.iter().position(|pattern| pattern == candidate))
}

struct FilterEntry<I> {
    item: Option<I>,
    pattern: Option<u64>,
}

enum Resolved {
    Existing(u64),
    New(PatternMatch),
}

pub struct PatternFilter<I, S> {
    entries: HashMap<SearchableId, FilterEntry<I>>,
    /// Registered matches; `known` and `slots` are kept index-aligned, each slot
    /// holding the match key and its reference count.
    known: Vec<PatternMatch>,
    slots: Vec<(u64, usize)>,
    next_key: u64,
    resolver: PatternResolver,
    sink: S,
    published: watch::Sender<Vec<PatternMatch>>,
}

impl<I, S> PatternFilter<I, S>
where
    I: Clone + PartialEq,
    S: ItemSink<I>,
{
    pub fn new(sink: S, resolver: PatternResolver) -> Self {
        Self {
            entries: HashMap::new(),
            known: Vec::new(),
            slots: Vec::new(),
            next_key: 0,
            resolver,
            sink,
            published: watch::Sender::new(Vec::new()),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn pattern_matches(&self) -> Vec<PatternMatch> {
        self.known.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<PatternMatch>> {
        self.published.subscribe()
    }

    /// Whether items without a pattern match are currently hidden.
    pub fn is_suppressing(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Replaces the item and pattern match contributed by `id`.
    pub fn update(&mut self, id: &SearchableId, item: Option<I>, pattern: Option<&PatternMatch>) {
        let (old_item, old_key, was_visible) = match self.entries.get(id) {
            Some(entry) => (entry.item.clone(), entry.pattern, self.is_visible(entry)),
            None => (None, None, false),
        };

        let resolved = pattern.map(|pattern| self.resolve(pattern));
        let new_key = match (resolved, old_key) {
            (Some(Resolved::Existing(key)), Some(old)) if key == old => Some(old),
            (None, None) => None,
            (resolved, old_key) => {
                // Register the new match before releasing the old one, so
                // swapping matches never passes through an unsuppressed state.
                let key = resolved.map(|resolved| self.acquire(resolved, id));
                if let Some(old) = old_key {
                    self.release(old, id);
                }
                key
            }
        };

        let entry = FilterEntry {
            item,
            pattern: new_key,
        };
        let is_visible = self.is_visible(&entry);
        match (was_visible, is_visible) {
            (true, true) if old_item != entry.item => {
                if let Some(old) = old_item {
                    self.sink.remove(old);
                }
                if let Some(new) = entry.item.clone() {
                    self.sink.add(new);
                }
            }
            (true, false) => {
                if let Some(old) = old_item {
                    self.sink.remove(old);
                }
            }
            (false, true) => {
                if let Some(new) = entry.item.clone() {
                    self.sink.add(new);
                }
            }
            _ => {}
        }

        if entry.item.is_none() && entry.pattern.is_none() {
            self.entries.remove(id);
        } else {
            self.entries.insert(id.clone(), entry);
        }
    }

    /// Drops everything `id` contributed.
    pub fn remove(&mut self, id: &SearchableId) {
        let Some(entry) = self.entries.get(id) else {
            return;
        };
        let was_visible = self.is_visible(entry);
        let Some(entry) = self.entries.remove(id) else {
            return;
        };

        if was_visible {
            if let Some(item) = entry.item {
                self.sink.remove(item);
            }
        }
        if let Some(key) = entry.pattern {
            self.release(key, id);
        }
    }

    fn is_visible(&self, entry: &FilterEntry<I>) -> bool {
        entry.item.is_some() && (!self.is_suppressing() || entry.pattern.is_some())
    }

    fn resolve(&self, pattern: &PatternMatch) -> Resolved {
        match (self.resolver)(pattern, &self.known) {
            Some(index) if index < self.slots.len() => Resolved::Existing(self.slots[index].0),
            _ => Resolved::New(pattern.clone()),
        }
    }

    fn acquire(&mut self, resolved: Resolved, source: &SearchableId) -> u64 {
        match resolved {
            Resolved::Existing(key) => {
                if let Some(slot) = self.slots.iter_mut().find(|slot| slot.0 == key) {
                    slot.1 += 1;
                }
                key
            }
            Resolved::New(pattern) => {
                let key = self.next_key;
                self.next_key += 1;
                let was_suppressing = self.is_suppressing();
                self.known.push(pattern);
                self.slots.push((key, 1));
                self.publish();
                if !was_suppressing {
                    self.hide_plain_items(source);
                }
                key
            }
        }
    }

    fn release(&mut self, key: u64, source: &SearchableId) {
        let Some(index) = self.slots.iter().position(|slot| slot.0 == key) else {
            return;
        };
        self.slots[index].1 -= 1;
        if self.slots[index].1 > 0 {
            return;
        }

        self.slots.remove(index);
        self.known.remove(index);
        self.publish();
        if !self.is_suppressing() {
            self.show_plain_items(source);
        }
    }

    fn hide_plain_items(&mut self, except: &SearchableId) {
        for (id, entry) in &self.entries {
            if id == except || entry.pattern.is_some() {
                continue;
            }
            if let Some(item) = &entry.item {
                self.sink.remove(item.clone());
            }
        }
    }

    fn show_plain_items(&mut self, except: &SearchableId) {
        for (id, entry) in &self.entries {
            if id == except || entry.pattern.is_some() {
                continue;
            }
            if let Some(item) = &entry.item {
                self.sink.add(item.clone());
            }
        }
    }

    fn publish(&self) {
        self.published.send_replace(self.known.clone());
    }
}

impl<I, S> NodeListener<I> for PatternFilter<I, S>
where
    I: Clone + PartialEq + Send + 'static,
    S: ItemSink<I>,
{
    fn on_update(
        &mut self,
        id: &SearchableId,
        result: &NodeResult<I>,
        _previous: Option<&NodeResult<I>>,
    ) {
        self.update(id, result.item.clone(), result.pattern_match.as_ref());
    }

    fn on_remove(&mut self, id: &SearchableId, _result: Option<&NodeResult<I>>) {
        self.remove(id);
    }
}
