//! Arena of per-searchable node state.
//!
//! Nodes are keyed by [`SearchableId`] and reference counted through their
//! parent sets: a child shared by several parents is evaluated once and only
//! retired after the last parent lets go of it.

use std::collections::{HashMap, HashSet};

use tokio_util::sync::CancellationToken;

use crate::scheduler::{WorkKind, WorkQueues};
use crate::searchable::SearchableRef;
use crate::types::{NodeResult, SearchOutput, SearchableId};

/// Two-bit scheduling state: whether the node sits in a queue, and whether the
/// reason it was queued still holds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub scheduled: bool,
    pub required: bool,
}

pub struct SearchNode<Q, I> {
    pub searchable: SearchableRef<Q, I>,
    pub parents: HashSet<SearchableId>,
    pub removal: Schedule,
    pub update: Schedule,
    pub result: Option<NodeResult<I>>,
    pub execute_version: u64,
    /// Disposes the invalidation hook handed to the latest evaluation.
    pub hook: Option<CancellationToken>,
}

impl<Q, I> SearchNode<Q, I> {
    fn new(searchable: SearchableRef<Q, I>) -> Self {
        Self {
            searchable,
            parents: HashSet::new(),
            removal: Schedule::default(),
            update: Schedule::default(),
            result: None,
            execute_version: 0,
            hook: None,
        }
    }

    fn dispose_hook(&mut self) {
        if let Some(hook) = self.hook.take() {
            hook.cancel();
        }
    }
}

/// An evaluation that passed the scheduling checks and may be launched.
pub struct Evaluation<Q, I> {
    pub searchable: SearchableRef<Q, I>,
    pub version: u64,
    pub hook: CancellationToken,
}

#[derive(Debug)]
pub enum CommitOutcome<I> {
    /// The node is gone or a newer evaluation started.
    Stale,
    Committed { previous: Option<NodeResult<I>> },
}

pub struct NodeStore<Q, I> {
    root: SearchableId,
    nodes: HashMap<SearchableId, SearchNode<Q, I>>,
    last_version: u64,
}

impl<Q, I> NodeStore<Q, I> {
    /// Creates a store holding only the permanently rooted query root.
    pub fn new(root: SearchableRef<Q, I>) -> Self {
        let root_id = root.id();
        let mut nodes = HashMap::new();
        nodes.insert(root_id.clone(), SearchNode::new(root));
        Self {
            root: root_id,
            nodes,
            last_version: 0,
        }
    }

    pub fn root(&self) -> &SearchableId {
        &self.root
    }

    pub fn get(&self, id: &SearchableId) -> Option<&SearchNode<Q, I>> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &SearchableId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SearchableId, &SearchNode<Q, I>)> {
        self.nodes.iter()
    }

    pub fn result(&self, id: &SearchableId) -> Option<&NodeResult<I>> {
        self.nodes.get(id).and_then(|node| node.result.as_ref())
    }

    /// Whether `version` is the latest evaluation of a live node.
    pub fn is_current(&self, id: &SearchableId, version: u64) -> bool {
        self.nodes
            .get(id)
            .is_some_and(|node| node.execute_version == version)
    }

    /// Registers `parent` as a parent of `child`, creating and queueing the
    /// child if it is not known yet.
    pub fn schedule_addition(
        &mut self,
        queues: &mut WorkQueues,
        child: &SearchableRef<Q, I>,
        parent: &SearchableId,
    ) {
        let id = child.id();
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parents.insert(parent.clone());
            if node.removal.required {
                tracing::trace!("pending removal of {} defused by new parent {}", id, parent);
                node.removal.required = false;
                if node.update.required && !node.update.scheduled {
                    node.update.scheduled = true;
                    queues.push(WorkKind::Update, id);
                }
            }
            return;
        }

        let mut node = SearchNode::new(child.clone());
        node.parents.insert(parent.clone());
        node.update = Schedule {
            scheduled: true,
            required: true,
        };
        self.nodes.insert(id.clone(), node);
        queues.push(WorkKind::Addition, id);
    }

    /// Drops `parent` from the node's parents and queues the node for removal
    /// once no parent is left.
    pub fn schedule_removal(
        &mut self,
        queues: &mut WorkQueues,
        id: &SearchableId,
        parent: &SearchableId,
    ) {
        let Some(node) = self.nodes.get_mut(id) else {
            tracing::trace!("removal of unknown node {} ignored", id);
            return;
        };
        node.parents.remove(parent);
        if !node.parents.is_empty() || *id == self.root {
            return;
        }

        node.removal.required = true;
        if !node.removal.scheduled {
            node.removal.scheduled = true;
            queues.push(WorkKind::Removal, id.clone());
        }
    }

    /// Queues a reactive re-evaluation. Returns false when the node is unknown
    /// or about to be removed.
    pub fn schedule_update(&mut self, queues: &mut WorkQueues, id: &SearchableId) -> bool {
        let Some(node) = self.nodes.get_mut(id) else {
            return false;
        };
        if node.removal.required {
            return false;
        }

        node.update.required = true;
        if !node.update.scheduled {
            node.update.scheduled = true;
            queues.push(WorkKind::Update, id.clone());
        }
        true
    }

    /// Marks every node stale after a query change. Nodes holding a result go
    /// to the refresh queue, the rest to the update queue.
    pub fn schedule_refresh_all(&mut self, queues: &mut WorkQueues) {
        for (id, node) in &mut self.nodes {
            node.update.required = true;
            if node.update.scheduled {
                continue;
            }
            node.update.scheduled = true;
            let kind = if node.result.is_some() {
                WorkKind::Refresh
            } else {
                WorkKind::Update
            };
            queues.push(kind, id.clone());
        }
    }

    /// Runs the pre-launch checks for a popped node and starts a new
    /// evaluation generation, disposing the previous hook.
    pub fn begin_evaluation(&mut self, id: &SearchableId) -> Option<Evaluation<Q, I>> {
        let node = self.nodes.get_mut(id)?;
        node.update.scheduled = false;
        if node.removal.required {
            tracing::trace!("evaluation of {} skipped, removal pending", id);
            return None;
        }
        if !node.update.required {
            return None;
        }
        node.update.required = false;

        self.last_version += 1;
        node.execute_version = self.last_version;
        node.dispose_hook();
        let hook = CancellationToken::new();
        node.hook = Some(hook.clone());

        Some(Evaluation {
            searchable: node.searchable.clone(),
            version: node.execute_version,
            hook,
        })
    }

    /// Stores the output of evaluation `version`, scheduling added children
    /// and releasing dropped ones.
    pub fn commit(
        &mut self,
        queues: &mut WorkQueues,
        id: &SearchableId,
        version: u64,
        output: SearchOutput<Q, I>,
    ) -> CommitOutcome<I> {
        let previous_children: HashSet<SearchableId> = match self.nodes.get(id) {
            Some(node) if node.execute_version == version => node
                .result
                .as_ref()
                .map(|result| result.children.iter().cloned().collect())
                .unwrap_or_default(),
            _ => return CommitOutcome::Stale,
        };

        let SearchOutput {
            item,
            children,
            pattern_match,
        } = output;

        let mut child_ids = Vec::with_capacity(children.len());
        let mut seen = HashSet::with_capacity(children.len());
        for child in &children {
            let child_id = child.id();
            if !seen.insert(child_id.clone()) {
                continue;
            }
            if !previous_children.contains(&child_id) {
                self.schedule_addition(queues, child, id);
            }
            child_ids.push(child_id);
        }
        for child_id in previous_children.difference(&seen) {
            self.schedule_removal(queues, child_id, id);
        }

        let Some(node) = self.nodes.get_mut(id) else {
            return CommitOutcome::Stale;
        };
        let previous = node.result.replace(NodeResult {
            item,
            pattern_match,
            children: child_ids,
        });
        CommitOutcome::Committed { previous }
    }

    /// Retires a node popped from the removal queue, releasing its children.
    /// Returns `None` when a later addition defused the removal.
    pub fn remove_node(
        &mut self,
        queues: &mut WorkQueues,
        id: &SearchableId,
    ) -> Option<SearchNode<Q, I>> {
        let node = self.nodes.get_mut(id)?;
        node.removal.scheduled = false;
        if !node.removal.required || *id == self.root {
            return None;
        }

        let mut node = self.nodes.remove(id)?;
        node.dispose_hook();
        if let Some(result) = &node.result {
            for child in &result.children {
                self.schedule_removal(queues, child, id);
            }
        }
        Some(node)
    }

    /// Disposes every node's invalidation hook.
    pub fn dispose_hooks(&mut self) {
        for node in self.nodes.values_mut() {
            node.dispose_hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::error::SearchError;
    use crate::scheduler::Work;
    use crate::searchable::{InvalidationHook, Searchable};

    struct Stub(&'static str);

    #[async_trait]
    impl Searchable<String, String> for Stub {
        fn id(&self) -> SearchableId {
            self.0.into()
        }

        async fn search(
            &self,
            _query: &String,
            _hook: &InvalidationHook,
        ) -> Result<SearchOutput<String, String>, SearchError> {
            Ok(SearchOutput::empty())
        }
    }

    fn stub(id: &'static str) -> SearchableRef<String, String> {
        Arc::new(Stub(id))
    }

    fn drain(queues: &mut WorkQueues) -> Vec<Work> {
        std::iter::from_fn(|| queues.pop()).collect()
    }

    fn id(raw: &str) -> SearchableId {
        raw.into()
    }

    /// Evaluates `node` with the given children and commits the result.
    fn evaluate(
        store: &mut NodeStore<String, String>,
        queues: &mut WorkQueues,
        node: &str,
        children: Vec<SearchableRef<String, String>>,
    ) -> CommitOutcome<String> {
        let node = id(node);
        let mut scratch = WorkQueues::new();
        store.schedule_update(&mut scratch, &node);
        let evaluation = store.begin_evaluation(&node).expect("evaluation");
        store.commit(
            queues,
            &node,
            evaluation.version,
            SearchOutput::empty().with_children(children),
        )
    }

    #[test]
    fn new_store_holds_only_root() {
        let store = NodeStore::new(stub("root"));

        assert_eq!(store.len(), 1);
        assert_eq!(store.root(), &id("root"));
        assert!(store.get(&id("root")).is_some_and(|node| node.parents.is_empty()));
    }

    #[test]
    fn refresh_all_splits_on_existing_result() {
        let mut store = NodeStore::new(stub("root"));
        let mut queues = WorkQueues::new();
        evaluate(&mut store, &mut queues, "root", vec![stub("a")]);
        drain(&mut queues);
        store.begin_evaluation(&id("a")).expect("a evaluation");

        store.schedule_refresh_all(&mut queues);

        let work = drain(&mut queues);
        assert!(work.contains(&Work {
            kind: WorkKind::Refresh,
            id: id("root")
        }));
        assert!(work.contains(&Work {
            kind: WorkKind::Update,
            id: id("a")
        }));
    }

    #[test]
    fn commit_schedules_new_children_once() {
        let mut store = NodeStore::new(stub("root"));
        let mut queues = WorkQueues::new();

        let outcome = evaluate(
            &mut store,
            &mut queues,
            "root",
            vec![stub("a"), stub("b"), stub("a")],
        );

        assert!(matches!(outcome, CommitOutcome::Committed { previous: None }));
        let result = store.result(&id("root")).expect("result");
        assert_eq!(result.children, vec![id("a"), id("b")]);
        let additions: Vec<SearchableId> = drain(&mut queues)
            .into_iter()
            .filter(|work| work.kind == WorkKind::Addition)
            .map(|work| work.id)
            .collect();
        assert_eq!(additions, vec![id("a"), id("b")]);
        assert!(store
            .get(&id("a"))
            .is_some_and(|node| node.parents.contains(&id("root"))));
    }

    #[test]
    fn shared_child_survives_until_last_parent_releases_it() {
        let mut store = NodeStore::new(stub("root"));
        let mut queues = WorkQueues::new();
        evaluate(&mut store, &mut queues, "root", vec![stub("p1"), stub("p2")]);
        evaluate(&mut store, &mut queues, "p1", vec![stub("shared")]);
        evaluate(&mut store, &mut queues, "p2", vec![stub("shared")]);
        drain(&mut queues);

        assert_eq!(store.get(&id("shared")).map(|node| node.parents.len()), Some(2));

        evaluate(&mut store, &mut queues, "p1", Vec::new());
        assert!(drain(&mut queues).is_empty());
        assert!(store.contains(&id("shared")));

        evaluate(&mut store, &mut queues, "p2", Vec::new());
        let work = drain(&mut queues);
        assert_eq!(
            work,
            vec![Work {
                kind: WorkKind::Removal,
                id: id("shared")
            }]
        );
    }

    #[test]
    fn removal_cascades_to_children() {
        let mut store = NodeStore::new(stub("root"));
        let mut queues = WorkQueues::new();
        evaluate(&mut store, &mut queues, "root", vec![stub("a")]);
        evaluate(&mut store, &mut queues, "a", vec![stub("leaf")]);
        drain(&mut queues);

        evaluate(&mut store, &mut queues, "root", Vec::new());
        let removed = store.remove_node(&mut queues, &id("a")).expect("removed");

        assert!(removed.hook.is_none());
        assert!(!store.contains(&id("a")));
        assert_eq!(
            drain(&mut queues),
            vec![
                Work {
                    kind: WorkKind::Removal,
                    id: id("a")
                },
                Work {
                    kind: WorkKind::Removal,
                    id: id("leaf")
                }
            ]
        );
    }

    #[test]
    fn late_addition_defuses_pending_removal() {
        let mut store = NodeStore::new(stub("root"));
        let mut queues = WorkQueues::new();
        evaluate(&mut store, &mut queues, "root", vec![stub("a")]);
        drain(&mut queues);

        evaluate(&mut store, &mut queues, "root", Vec::new());
        evaluate(&mut store, &mut queues, "root", vec![stub("a")]);

        assert!(store.remove_node(&mut queues, &id("a")).is_none());
        assert!(store.contains(&id("a")));
    }

    #[test]
    fn root_is_never_removed() {
        let mut store = NodeStore::new(stub("root"));
        let mut queues = WorkQueues::new();
        evaluate(&mut store, &mut queues, "root", vec![stub("a")]);
        evaluate(&mut store, &mut queues, "a", vec![stub("root")]);
        drain(&mut queues);

        evaluate(&mut store, &mut queues, "a", Vec::new());

        assert!(drain(&mut queues).is_empty());
        assert!(store.contains(&id("root")));
    }

    #[test]
    fn superseded_evaluation_is_stale() {
        let mut store = NodeStore::new(stub("root"));
        let mut queues = WorkQueues::new();
        let root = id("root");

        store.schedule_update(&mut queues, &root);
        let first = store.begin_evaluation(&root).expect("first");
        store.schedule_update(&mut queues, &root);
        let second = store.begin_evaluation(&root).expect("second");

        assert!(first.hook.is_cancelled());
        assert!(!store.is_current(&root, first.version));
        assert!(matches!(
            store.commit(&mut queues, &root, first.version, SearchOutput::empty()),
            CommitOutcome::Stale
        ));
        assert!(matches!(
            store.commit(&mut queues, &root, second.version, SearchOutput::empty()),
            CommitOutcome::Committed { .. }
        ));
    }

    #[test]
    fn recreated_node_never_reuses_a_version() {
        let mut store = NodeStore::new(stub("root"));
        let mut queues = WorkQueues::new();
        evaluate(&mut store, &mut queues, "root", vec![stub("a")]);
        let stale = store.begin_evaluation(&id("a")).expect("a evaluation");

        evaluate(&mut store, &mut queues, "root", Vec::new());
        drain(&mut queues);
        store.remove_node(&mut queues, &id("a"));
        store.schedule_removal(&mut queues, &id("a"), &id("root"));
        assert!(!store.contains(&id("a")));

        evaluate(&mut store, &mut queues, "root", vec![stub("a")]);
        let fresh = store.begin_evaluation(&id("a")).expect("fresh evaluation");

        assert_ne!(stale.version, fresh.version);
        assert!(!store.is_current(&id("a"), stale.version));
    }

    #[test]
    fn unchanged_update_is_skipped() {
        let mut store = NodeStore::new(stub("root"));
        let mut queues = WorkQueues::new();

        assert!(store.begin_evaluation(&id("root")).is_none());
        assert!(!store.schedule_update(&mut queues, &id("missing")));
    }
}
