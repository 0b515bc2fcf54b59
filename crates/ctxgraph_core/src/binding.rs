//! Thread-to-context bindings and the affinity check.
//!
//! Every record access funnels through [`ThreadBindings::check_access`]. A
//! thread resolves to the top of its binding stack; the UI thread (the one
//! that constructed the coordinator) resolves to the main read context when
//! nothing else is bound and can never be bound to a write context.

use crate::context::{ContextNode, NodeKind};
use crate::error::{fatal, UsageFault};
use crate::types::NodeId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// One entry of a thread's binding stack.
struct Binding {
    node: Arc<ContextNode>,
    inside_transaction: bool,
    suppress_implicit_commit: bool,
}

/// What the calling thread is currently bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Resolved {
    pub(crate) node: NodeId,
    pub(crate) kind: NodeKind,
    pub(crate) inside_transaction: bool,
}

/// Registry of per-thread bindings.
///
/// Bindings nest: a transaction started from inside another pushes a new
/// entry and the outer binding is restored when it closes. Only the top
/// entry is ever considered bound.
pub(crate) struct ThreadBindings {
    main_thread: ThreadId,
    main_node: NodeId,
    stacks: Mutex<HashMap<ThreadId, Vec<Binding>>>,
}

impl ThreadBindings {
    /// Creates the registry; the calling thread becomes the UI thread.
    pub(crate) fn new(main_node: NodeId) -> Self {
        Self {
            main_thread: thread::current().id(),
            main_node,
            stacks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true on the designated UI thread.
    pub(crate) fn is_main_thread(&self) -> bool {
        thread::current().id() == self.main_thread
    }

    /// Attaches `node` to the calling thread until the guard drops.
    pub(crate) fn bind(self: &Arc<Self>, node: Arc<ContextNode>, inside_transaction: bool) -> BindingGuard {
        let thread = thread::current().id();
        if thread == self.main_thread {
            fatal(UsageFault::MainThreadTransaction);
        }
        let node_id = node.id();
        self.stacks.lock().entry(thread).or_default().push(Binding {
            node,
            inside_transaction,
            suppress_implicit_commit: false,
        });
        BindingGuard {
            bindings: Arc::clone(self),
            thread,
            node: node_id,
        }
    }

    fn unbind(&self, thread: ThreadId, node: NodeId) {
        let mut stacks = self.stacks.lock();
        if let Some(stack) = stacks.get_mut(&thread) {
            if let Some(pos) = stack.iter().rposition(|b| b.node.id() == node) {
                stack.remove(pos);
            }
            if stack.is_empty() {
                stacks.remove(&thread);
            }
        }
    }

    /// Resolves the calling thread's bound context.
    pub(crate) fn resolve(&self) -> Option<Resolved> {
        let thread = thread::current().id();
        let stacks = self.stacks.lock();
        match stacks.get(&thread).and_then(|stack| stack.last()) {
            Some(top) => Some(Resolved {
                node: top.node.id(),
                kind: top.node.kind(),
                inside_transaction: top.inside_transaction,
            }),
            None if thread == self.main_thread => Some(Resolved {
                node: self.main_node,
                kind: NodeKind::MainRead,
                inside_transaction: false,
            }),
            None => None,
        }
    }

    /// Returns the node bound on top of the calling thread's stack.
    ///
    /// The UI thread's implicit main binding is not on any stack, so this
    /// returns `None` there.
    pub(crate) fn bound_node(&self) -> Option<Arc<ContextNode>> {
        let stacks = self.stacks.lock();
        stacks
            .get(&thread::current().id())
            .and_then(|stack| stack.last())
            .map(|top| Arc::clone(&top.node))
    }

    /// Returns true if the calling thread is running a transaction body.
    pub(crate) fn inside_transaction(&self) -> bool {
        self.resolve().is_some_and(|r| r.inside_transaction)
    }

    /// Marks the calling thread's binding of `node` so its implicit commit is skipped.
    ///
    /// Returns false if the thread has no such binding.
    pub(crate) fn suppress_implicit_commit(&self, node: NodeId) -> bool {
        let mut stacks = self.stacks.lock();
        let binding = stacks
            .get_mut(&thread::current().id())
            .and_then(|stack| stack.iter_mut().rev().find(|b| b.node.id() == node));
        match binding {
            Some(binding) => {
                binding.suppress_implicit_commit = true;
                true
            }
            None => false,
        }
    }

    /// Returns whether the implicit commit of `node` has been cancelled.
    pub(crate) fn is_commit_suppressed(&self, node: NodeId) -> bool {
        let stacks = self.stacks.lock();
        stacks
            .get(&thread::current().id())
            .and_then(|stack| stack.iter().rev().find(|b| b.node.id() == node))
            .is_some_and(|b| b.suppress_implicit_commit)
    }

    /// Validates that the calling thread may touch data owned by `owner`.
    ///
    /// Raises a usage fault on failure. Writes additionally require a write
    /// context inside an active transaction, off the UI thread.
    #[track_caller]
    pub(crate) fn check_access(&self, owner: &ContextNode, entity: &str, for_write: bool) {
        let Some(bound) = self.resolve() else {
            fatal(UsageFault::NoContextBound {
                thread: format!("{:?}", thread::current().id()),
            });
        };
        if for_write && (owner.kind() != NodeKind::Write || bound.kind == NodeKind::MainRead) {
            fatal(UsageFault::MainThreadWrite {
                entity: entity.to_string(),
                node: owner.id(),
            });
        }
        if bound.node != owner.id() {
            fatal(UsageFault::WrongContext {
                owner: owner.id(),
                bound: bound.node,
            });
        }
        if for_write && !bound.inside_transaction {
            fatal(UsageFault::NotInTransaction { node: owner.id() });
        }
    }

    /// Validates that two records may be linked.
    #[track_caller]
    pub(crate) fn check_relationship(&self, field: &str, from: NodeId, to: NodeId) {
        if from != to {
            fatal(UsageFault::CrossContextRelationship {
                field: field.to_string(),
                from,
                to,
            });
        }
    }
}

/// Detaches a binding when dropped.
pub(crate) struct BindingGuard {
    bindings: Arc<ThreadBindings>,
    thread: ThreadId,
    node: NodeId,
}

impl Drop for BindingGuard {
    fn drop(&mut self) {
        self.bindings.unbind(self.thread, self.node);
    }
}
