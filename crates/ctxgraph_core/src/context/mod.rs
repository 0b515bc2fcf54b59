//! The context tree: root, main read context and per-transaction write contexts.

mod node;
mod tree;

pub use node::{ContextNode, NodeKind};
pub(crate) use tree::ContextTree;
