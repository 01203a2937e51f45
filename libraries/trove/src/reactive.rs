//! # Reactive dependency graph
//! Signals stand for cache cells; memos are computations over signals and other memos. Every memo
//! records which nodes it read during its last evaluation (its dependencies) and every node keeps
//! the set of memos that read it (its subscribers).
//!
//! - Writing a signal bumps its version and marks every transitive subscriber dirty right away.
//! - Reading a dirty memo first brings its dependencies up to date and only re-runs the memo if one
//!   of them actually changed version. A memo whose new value is the same as the old one keeps its
//!   old value and version, so nothing downstream recomputes.
//! - Listener callbacks are queued while marking and run once the outermost batch ends, at most
//!   once per batch each.
//!
//! No `RefCell` borrow is held while a memo's computation or a listener callback runs; both are
//! free to read (and write) the graph.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

use indexmap::IndexSet;
use slotmap::SlotMap;

use crate::error::{Error, Result};

slotmap::new_key_type! {
    pub struct NodeKey;
    pub struct ListenerKey;
}

/// Values a memo can hold. `same` decides whether a recomputation produced a change.
pub trait MemoValue: Clone {
    fn same(&self, other: &Self) -> bool;
}

pub struct Recomputed<V> {
    pub value: V,
    /// The value is a collection that was updated in place; treat it as changed even though it
    /// is the same object.
    pub mutated: bool,
}

impl<V> Recomputed<V> {
    pub fn new(value: V) -> Self {
        Self {
            value,
            mutated: false,
        }
    }
}

pub type Compute<V> = Rc<dyn Fn() -> Result<Recomputed<V>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MemoState {
    Uninit,
    Clean,
    Dirty,
    Computing,
}

struct Memo<V> {
    compute: Compute<V>,
    value: Option<V>,
    state: MemoState,
    deps: Vec<(NodeKey, u64)>,
    /// (field, type) for error messages.
    label: (String, String),
}

enum NodeKind<V> {
    Signal,
    Memo(Memo<V>),
}

struct Node<V> {
    version: u64,
    kind: NodeKind<V>,
    subscribers: HashSet<NodeKey>,
    listeners: Vec<ListenerKey>,
}

struct Listener {
    node: NodeKey,
    callback: Rc<dyn Fn()>,
}

pub struct Reactor<V> {
    nodes: RefCell<SlotMap<NodeKey, Node<V>>>,
    frames: RefCell<Vec<Vec<(NodeKey, u64)>>>,
    listeners: RefCell<SlotMap<ListenerKey, Listener>>,
    pending: RefCell<IndexSet<ListenerKey>>,
    batch_depth: Cell<usize>,
    flushing: Cell<bool>,
}

impl<V: MemoValue> Default for Reactor<V> {
    fn default() -> Self {
        Self {
            nodes: RefCell::new(SlotMap::with_key()),
            frames: RefCell::new(Vec::new()),
            listeners: RefCell::new(SlotMap::with_key()),
            pending: RefCell::new(IndexSet::new()),
            batch_depth: Cell::new(0),
            flushing: Cell::new(false),
        }
    }
}

/// Defers listener callbacks until dropped. Nested batches flush with the outermost one.
pub struct Batch<'r, V: MemoValue> {
    reactor: &'r Reactor<V>,
}

impl<V: MemoValue> Drop for Batch<'_, V> {
    fn drop(&mut self) {
        let depth = self.reactor.batch_depth.get() - 1;
        self.reactor.batch_depth.set(depth);
        if depth == 0 {
            self.reactor.flush();
        }
    }
}

impl<V: MemoValue> Reactor<V> {
    pub fn signal(&self) -> NodeKey {
        self.nodes.borrow_mut().insert(Node {
            version: 0,
            kind: NodeKind::Signal,
            subscribers: HashSet::new(),
            listeners: Vec::new(),
        })
    }

    pub fn memo(&self, label: (String, String), compute: Compute<V>) -> NodeKey {
        self.nodes.borrow_mut().insert(Node {
            version: 0,
            kind: NodeKind::Memo(Memo {
                compute,
                value: None,
                state: MemoState::Uninit,
                deps: Vec::new(),
                label,
            }),
            subscribers: HashSet::new(),
            listeners: Vec::new(),
        })
    }

    pub fn contains(&self, node: NodeKey) -> bool {
        self.nodes.borrow().contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.borrow().is_empty()
    }

    pub fn version(&self, node: NodeKey) -> Option<u64> {
        self.nodes.borrow().get(node).map(|n| n.version)
    }

    pub fn batch(&self) -> Batch<'_, V> {
        self.batch_depth.set(self.batch_depth.get() + 1);
        Batch { reactor: self }
    }

    /// Records a read of `node` in the evaluation currently running, if any.
    pub fn track(&self, node: NodeKey) {
        let Some(version) = self.version(node) else {
            return;
        };
        if let Some(frame) = self.frames.borrow_mut().last_mut() {
            frame.push((node, version));
        }
    }

    /// Reads a memo, recomputing it first if needed.
    pub fn read(&self, memo: NodeKey) -> Result<V> {
        let fresh = self.ensure_fresh(memo);
        // Evaluation may have written signals; their listeners were held back until now.
        self.flush_if_idle();
        fresh?;
        self.track(memo);
        let nodes = self.nodes.borrow();
        match nodes.get(memo).map(|n| &n.kind) {
            Some(NodeKind::Memo(Memo {
                value: Some(value), ..
            })) => Ok(value.clone()),
            _ => Err(Error::UnknownIdentity),
        }
    }

    pub fn is_clean(&self, memo: NodeKey) -> bool {
        matches!(
            self.nodes.borrow().get(memo).map(|n| &n.kind),
            Some(NodeKind::Memo(Memo {
                state: MemoState::Clean,
                ..
            }))
        )
    }

    fn ensure_fresh(&self, memo: NodeKey) -> Result<()> {
        let (state, deps, label) = {
            let nodes = self.nodes.borrow();
            match nodes.get(memo).map(|n| &n.kind) {
                Some(NodeKind::Memo(m)) => (m.state, m.deps.clone(), m.label.clone()),
                _ => return Err(Error::UnknownIdentity),
            }
        };

        match state {
            MemoState::Clean => Ok(()),
            MemoState::Computing => Err(Error::DerivationCycle {
                field: label.0,
                type_name: label.1,
            }),
            MemoState::Uninit => self.recompute(memo),
            MemoState::Dirty => {
                let mut changed = false;
                for (dep, seen) in deps {
                    let dep_is_memo = matches!(
                        self.nodes.borrow().get(dep).map(|n| &n.kind),
                        Some(NodeKind::Memo(_))
                    );
                    if dep_is_memo && self.ensure_fresh(dep).is_err() {
                        changed = true;
                        break;
                    }
                    if self.version(dep) != Some(seen) {
                        changed = true;
                        break;
                    }
                }
                if changed {
                    self.recompute(memo)
                } else {
                    self.set_state(memo, MemoState::Clean);
                    Ok(())
                }
            }
        }
    }

    fn set_state(&self, memo: NodeKey, state: MemoState) {
        if let Some(Node {
            kind: NodeKind::Memo(m),
            ..
        }) = self.nodes.borrow_mut().get_mut(memo)
        {
            m.state = state;
        }
    }

    fn recompute(&self, memo: NodeKey) -> Result<()> {
        let compute = {
            let mut nodes = self.nodes.borrow_mut();
            match nodes.get_mut(memo).map(|n| &mut n.kind) {
                Some(NodeKind::Memo(m)) => {
                    m.state = MemoState::Computing;
                    m.compute.clone()
                }
                _ => return Err(Error::UnknownIdentity),
            }
        };

        self.frames.borrow_mut().push(Vec::new());
        let result = compute();
        let deps = self.frames.borrow_mut().pop().unwrap_or_default();

        // Dependencies invalidated while we were running mean the result is already stale.
        let stale = deps.iter().any(|(dep, seen)| {
            let nodes = self.nodes.borrow();
            match nodes.get(*dep) {
                None => true,
                Some(node) => {
                    node.version != *seen
                        || matches!(&node.kind, NodeKind::Memo(m) if m.state != MemoState::Clean)
                }
            }
        });

        let mut nodes = self.nodes.borrow_mut();
        let old_deps = match nodes.get_mut(memo).map(|n| &mut n.kind) {
            Some(NodeKind::Memo(m)) => std::mem::take(&mut m.deps),
            _ => {
                drop(nodes);
                return result.map(|_| ());
            }
        };
        for (dep, _) in &old_deps {
            if let Some(node) = nodes.get_mut(*dep) {
                node.subscribers.remove(&memo);
            }
        }
        for (dep, _) in &deps {
            if let Some(node) = nodes.get_mut(*dep) {
                node.subscribers.insert(memo);
            }
        }

        let Some(Node {
            version,
            kind: NodeKind::Memo(m),
            ..
        }) = nodes.get_mut(memo)
        else {
            drop(nodes);
            return result.map(|_| ());
        };
        m.deps = deps;
        match result {
            Err(e) => {
                m.state = MemoState::Uninit;
                Err(e)
            }
            Ok(Recomputed { value, mutated }) => {
                let changed = mutated || !m.value.as_ref().is_some_and(|old| old.same(&value));
                // Values may own nodes of their own; they are released once the arena is free.
                let mut previous = None;
                if changed {
                    previous = m.value.replace(value);
                    *version += 1;
                }
                m.state = if stale {
                    MemoState::Dirty
                } else {
                    MemoState::Clean
                };
                drop(nodes);
                drop(previous);
                Ok(())
            }
        }
    }

    /// Marks a signal as written: bumps its version and dirties everything downstream.
    pub fn bump(&self, signal: NodeKey) {
        {
            let mut nodes = self.nodes.borrow_mut();
            let Some(node) = nodes.get_mut(signal) else {
                return;
            };
            node.version += 1;
        }
        self.mark_downstream(signal);
        self.flush_if_idle();
    }

    /// Listeners run once no batch is open and no memo is being evaluated.
    fn flush_if_idle(&self) {
        if self.batch_depth.get() == 0 && self.frames.borrow().is_empty() {
            self.flush();
        }
    }

    fn mark_downstream(&self, start: NodeKey) {
        let mut nodes = self.nodes.borrow_mut();
        let mut pending = self.pending.borrow_mut();
        let mut visited = HashSet::new();
        let mut stack = vec![start];
        while let Some(key) = stack.pop() {
            if !visited.insert(key) {
                continue;
            }
            let Some(node) = nodes.get_mut(key) else {
                continue;
            };
            if let NodeKind::Memo(m) = &mut node.kind {
                if m.state == MemoState::Clean {
                    m.state = MemoState::Dirty;
                }
            }
            pending.extend(node.listeners.iter().copied());
            stack.extend(node.subscribers.iter().copied());
        }
    }

    /// Removes a node. Memos that read it recompute on their next read.
    pub fn dispose(&self, key: NodeKey) {
        let removed = self.nodes.borrow_mut().remove(key);
        let Some(node) = removed else {
            return;
        };
        {
            let mut nodes = self.nodes.borrow_mut();
            if let NodeKind::Memo(m) = &node.kind {
                for (dep, _) in &m.deps {
                    if let Some(dep) = nodes.get_mut(*dep) {
                        dep.subscribers.remove(&key);
                    }
                }
            }
            for subscriber in &node.subscribers {
                if let Some(Node {
                    kind: NodeKind::Memo(m),
                    ..
                }) = nodes.get_mut(*subscriber)
                {
                    if m.state == MemoState::Clean {
                        m.state = MemoState::Dirty;
                    }
                }
            }
        }
        {
            let mut listeners = self.listeners.borrow_mut();
            for listener in &node.listeners {
                listeners.remove(*listener);
            }
        }
        for subscriber in node.subscribers {
            self.mark_downstream(subscriber);
        }
        self.flush_if_idle();
    }

    pub fn listen(&self, node: NodeKey, callback: impl Fn() + 'static) -> ListenerKey {
        let key = self.listeners.borrow_mut().insert(Listener {
            node,
            callback: Rc::new(callback),
        });
        if let Some(node) = self.nodes.borrow_mut().get_mut(node) {
            node.listeners.push(key);
        }
        key
    }

    pub fn unlisten(&self, key: ListenerKey) {
        let Some(listener) = self.listeners.borrow_mut().remove(key) else {
            return;
        };
        if let Some(node) = self.nodes.borrow_mut().get_mut(listener.node) {
            node.listeners.retain(|l| *l != key);
        }
        self.pending.borrow_mut().shift_remove(&key);
    }

    fn flush(&self) {
        if self.flushing.replace(true) {
            return;
        }
        loop {
            let keys: Vec<ListenerKey> = self.pending.borrow_mut().drain(..).collect();
            if keys.is_empty() {
                break;
            }
            for key in keys {
                let callback = self
                    .listeners
                    .borrow()
                    .get(key)
                    .map(|l| l.callback.clone());
                if let Some(callback) = callback {
                    callback();
                }
            }
        }
        self.flushing.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl MemoValue for i64 {
        fn same(&self, other: &Self) -> bool {
            self == other
        }
    }

    struct Harness {
        reactor: Rc<Reactor<i64>>,
        cells: Rc<RefCell<Vec<i64>>>,
        signals: Vec<NodeKey>,
    }

    impl Harness {
        fn new(values: &[i64]) -> Self {
            let reactor = Rc::new(Reactor::default());
            let signals = values.iter().map(|_| reactor.signal()).collect();
            Self {
                reactor,
                cells: Rc::new(RefCell::new(values.to_vec())),
                signals,
            }
        }

        fn write(&self, index: usize, value: i64) {
            self.cells.borrow_mut()[index] = value;
            self.reactor.bump(self.signals[index]);
        }

        /// Memo reading the given cells, counting its evaluations.
        fn memo(&self, reads: &[usize], f: fn(&[i64]) -> i64) -> (NodeKey, Rc<Cell<usize>>) {
            let runs = Rc::new(Cell::new(0));
            let reactor = Rc::downgrade(&self.reactor);
            let cells = self.cells.clone();
            let signals: Vec<_> = reads.iter().map(|i| self.signals[*i]).collect();
            let reads = reads.to_vec();
            let counter = runs.clone();
            let compute: Compute<i64> = Rc::new(move || {
                counter.set(counter.get() + 1);
                let reactor = reactor.upgrade().ok_or(Error::UnknownIdentity)?;
                for signal in &signals {
                    reactor.track(*signal);
                }
                let values: Vec<i64> = reads.iter().map(|i| cells.borrow()[*i]).collect();
                Ok(Recomputed::new(f(&values)))
            });
            let key = self
                .reactor
                .memo(("sum".to_string(), "test".to_string()), compute);
            (key, runs)
        }
    }

    #[test]
    fn memos_recompute_only_when_their_reads_change() {
        let h = Harness::new(&[1, 2, 3]);
        let (sum, runs) = h.memo(&[0, 1], |v| v.iter().sum());

        assert_eq!(h.reactor.read(sum).unwrap(), 3);
        assert_eq!(h.reactor.read(sum).unwrap(), 3);
        assert_eq!(runs.get(), 1);

        h.write(2, 10);
        assert_eq!(h.reactor.read(sum).unwrap(), 3);
        assert_eq!(runs.get(), 1);

        h.write(0, 5);
        assert_eq!(h.reactor.read(sum).unwrap(), 7);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn equal_results_stop_propagation() {
        let h = Harness::new(&[4]);
        let (parity, _) = h.memo(&[0], |v| v[0] % 2);

        let downstream_runs = Rc::new(Cell::new(0));
        let counter = downstream_runs.clone();
        let reactor = Rc::downgrade(&h.reactor);
        let downstream = h.reactor.memo(
            ("label".to_string(), "test".to_string()),
            Rc::new(move || {
                counter.set(counter.get() + 1);
                let reactor = reactor.upgrade().ok_or(Error::UnknownIdentity)?;
                Ok(Recomputed::new(reactor.read(parity)? * 100))
            }),
        );

        assert_eq!(h.reactor.read(downstream).unwrap(), 0);
        h.write(0, 6);
        assert_eq!(h.reactor.read(downstream).unwrap(), 0);
        assert_eq!(downstream_runs.get(), 1);

        h.write(0, 7);
        assert_eq!(h.reactor.read(downstream).unwrap(), 100);
        assert_eq!(downstream_runs.get(), 2);
    }

    #[test]
    fn listeners_fire_once_per_batch() {
        let h = Harness::new(&[1, 2]);
        let (sum, _) = h.memo(&[0, 1], |v| v.iter().sum());
        h.reactor.read(sum).unwrap();

        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        let key = h.reactor.listen(sum, move || counter.set(counter.get() + 1));

        {
            let _batch = h.reactor.batch();
            h.write(0, 10);
            h.write(1, 20);
            assert_eq!(calls.get(), 0);
        }
        assert_eq!(calls.get(), 1);

        h.write(0, 11);
        assert_eq!(calls.get(), 2);

        h.reactor.unlisten(key);
        h.write(0, 12);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn self_reads_are_reported_as_cycles() {
        let reactor: Rc<Reactor<i64>> = Rc::new(Reactor::default());
        let weak = Rc::downgrade(&reactor);
        let slot: Rc<Cell<Option<NodeKey>>> = Rc::new(Cell::new(None));
        let me = slot.clone();
        let memo = reactor.memo(
            ("loop".to_string(), "test".to_string()),
            Rc::new(move || {
                let reactor = weak.upgrade().ok_or(Error::UnknownIdentity)?;
                let me = me.get().ok_or(Error::UnknownIdentity)?;
                Ok(Recomputed::new(reactor.read(me)? + 1))
            }),
        );
        slot.set(Some(memo));
        assert!(matches!(
            reactor.read(memo),
            Err(Error::DerivationCycle { field, .. }) if field == "loop"
        ));
    }

    #[test]
    fn disposed_dependencies_force_recomputation() {
        let h = Harness::new(&[1]);
        let (memo, runs) = h.memo(&[0], |v| v[0]);
        h.reactor.read(memo).unwrap();
        h.reactor.dispose(h.signals[0]);
        assert!(!h.reactor.is_clean(memo));
        h.reactor.read(memo).unwrap();
        assert_eq!(runs.get(), 2);
    }
}
