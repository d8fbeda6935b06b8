//! Shared value types passed between searchables, the executor and consumers.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::searchable::SearchableRef;

/// Opaque identity of a searchable.
///
/// Several searchable instances may share one ID; the executor treats them as
/// the same node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SearchableId(Arc<str>);

impl SearchableId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SearchableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SearchableId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SearchableId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

/// Structural match marker a node reports alongside (or instead of) an item.
///
/// While any pattern match is live, items of nodes without one are hidden.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlight: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl PatternMatch {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            highlight: None,
            metadata: None,
        }
    }

    pub fn with_highlight(mut self, highlight: impl Into<String>) -> Self {
        self.highlight = Some(highlight.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// What a single `search` call produced.
pub struct SearchOutput<Q, I> {
    pub item: Option<I>,
    pub children: Vec<SearchableRef<Q, I>>,
    pub pattern_match: Option<PatternMatch>,
}

impl<Q, I> SearchOutput<Q, I> {
    pub fn empty() -> Self {
        Self {
            item: None,
            children: Vec::new(),
            pattern_match: None,
        }
    }

    pub fn with_item(mut self, item: I) -> Self {
        self.item = Some(item);
        self
    }

    pub fn with_children(mut self, children: Vec<SearchableRef<Q, I>>) -> Self {
        self.children = children;
        self
    }

    pub fn with_pattern_match(mut self, pattern_match: PatternMatch) -> Self {
        self.pattern_match = Some(pattern_match);
        self
    }
}

impl<Q, I> Default for SearchOutput<Q, I> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<Q, I: fmt::Debug> fmt::Debug for SearchOutput<Q, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let children: Vec<SearchableId> = self.children.iter().map(|child| child.id()).collect();
        f.debug_struct("SearchOutput")
            .field("item", &self.item)
            .field("children", &children)
            .field("pattern_match", &self.pattern_match)
            .finish()
    }
}

/// The last committed result of a node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeResult<I> {
    pub item: Option<I>,
    pub pattern_match: Option<PatternMatch>,
    /// Child IDs without duplicates, in the order the search returned them.
    pub children: Vec<SearchableId>,
}

impl<I> NodeResult<I> {
    pub fn empty() -> Self {
        Self {
            item: None,
            pattern_match: None,
            children: Vec::new(),
        }
    }
}

/// A change to the flat, pattern-filtered item set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemEvent<I> {
    Added(I),
    Removed(I),
}
