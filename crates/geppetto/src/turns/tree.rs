//! Branch index over blocks.
//!
//! The authoritative conversation is the flat block list of a
//! [`Turn`](super::Turn). A tree is only needed to explore alternative
//! continuations, so it is kept as a side index: block id → block and
//! block id → successor ids. Paths are linearized lazily and cycles are
//! detected with a visited set.

use std::collections::{HashMap, HashSet};

use super::Block;
use crate::error::GeppettoError;

/// Blocks indexed by id with alternative successors per block.
#[derive(Debug, Clone, Default)]
pub struct ConversationTree {
    blocks: HashMap<String, Block>,
    successors: HashMap<String, Vec<String>>,
    roots: Vec<String>,
}

impl ConversationTree {
    /// An empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a single-branch tree from a linear block list.
    pub fn from_linear(blocks: &[Block]) -> Result<Self, GeppettoError> {
        let mut tree = Self::new();
        let mut parent: Option<String> = None;
        for block in blocks {
            let id = block.id.clone();
            tree.insert(parent.as_deref(), block.clone())?;
            parent = Some(id);
        }
        Ok(tree)
    }

    /// Inserts `block` as a successor of `parent` (or as a root).
    ///
    /// The block must have a non-empty id that is not already present.
    pub fn insert(&mut self, parent: Option<&str>, block: Block) -> Result<(), GeppettoError> {
        if block.id.is_empty() {
            return Err(GeppettoError::invariant("tree block requires an id"));
        }
        if self.blocks.contains_key(&block.id) {
            return Err(GeppettoError::invariant(format!(
                "block {} already in tree",
                block.id
            )));
        }
        match parent {
            Some(p) => {
                if !self.blocks.contains_key(p) {
                    return Err(GeppettoError::invariant(format!("unknown parent block {p}")));
                }
                self.successors
                    .entry(p.to_string())
                    .or_default()
                    .push(block.id.clone());
            }
            None => self.roots.push(block.id.clone()),
        }
        self.blocks.insert(block.id.clone(), block);
        Ok(())
    }

    /// Adds `to` as an alternative successor of `from`. Both must exist.
    ///
    /// This may introduce cycles; traversal detects them.
    pub fn link(&mut self, from: &str, to: &str) -> Result<(), GeppettoError> {
        if !self.blocks.contains_key(from) || !self.blocks.contains_key(to) {
            return Err(GeppettoError::invariant(format!(
                "cannot link unknown blocks {from} -> {to}"
            )));
        }
        self.successors
            .entry(from.to_string())
            .or_default()
            .push(to.to_string());
        Ok(())
    }

    /// Returns a block by id.
    pub fn get(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    /// Successor ids of a block, in insertion order.
    pub fn successors(&self, id: &str) -> &[String] {
        self.successors.get(id).map_or(&[], Vec::as_slice)
    }

    /// Number of blocks in the tree.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the tree is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Walks from the first root, always taking the most recent successor,
    /// and returns the blocks on that path.
    pub fn latest_path(&self) -> Result<Vec<Block>, GeppettoError> {
        let Some(root) = self.roots.first() else {
            return Ok(Vec::new());
        };
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        let mut current = Some(root.clone());
        while let Some(id) = current {
            if !visited.insert(id.clone()) {
                return Err(GeppettoError::invariant(format!(
                    "cycle detected at block {id}"
                )));
            }
            if let Some(block) = self.blocks.get(&id) {
                path.push(block.clone());
            }
            current = self.successors(&id).last().cloned();
        }
        Ok(path)
    }

    /// Linearizes the path from the root down to `leaf`.
    pub fn path_to(&self, leaf: &str) -> Result<Vec<Block>, GeppettoError> {
        if !self.blocks.contains_key(leaf) {
            return Err(GeppettoError::invariant(format!("unknown block {leaf}")));
        }
        let mut parents: HashMap<&str, &str> = HashMap::new();
        for (from, tos) in &self.successors {
            for to in tos {
                parents.entry(to.as_str()).or_insert(from.as_str());
            }
        }

        let mut ids = Vec::new();
        let mut visited = HashSet::new();
        let mut current = Some(leaf);
        while let Some(id) = current {
            if !visited.insert(id) {
                return Err(GeppettoError::invariant(format!(
                    "cycle detected at block {id}"
                )));
            }
            ids.push(id);
            current = parents.get(id).copied();
        }
        ids.reverse();
        Ok(ids
            .into_iter()
            .filter_map(|id| self.blocks.get(id).cloned())
            .collect())
    }
}
