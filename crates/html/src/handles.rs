//! Content handles: stand-ins for DOM nodes that do not exist yet.
//!
//! The parser side mints handles from a [`HandleTable`] and only ever passes
//! them around inside tree operations. The owner side keeps a [`HandleSlots`]
//! array and writes the real node into a slot when it replays the operation
//! that creates it. A handle is therefore a plain index; nothing crosses the
//! thread boundary that could be dereferenced early.
//!
//! Invariants:
//! - Handles are never reused within one table identity.
//! - A slot is written exactly once.
//! - Every table identity is distinct, so handles from a released table (or
//!   another parse) are rejected instead of silently aliasing.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::dom::NodeKey;

/// Number of slots added per growth step on the owner side.
pub const HANDLE_BLOCK_LEN: usize = 512;

/// Identity of one handle table instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleTableId(u32);

impl HandleTableId {
    fn next() -> Self {
        static NEXT_ID: AtomicU32 = AtomicU32::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Opaque, write-once reference to a node that will be created on the owner thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHandle {
    table: HandleTableId,
    index: u32,
}

impl ContentHandle {
    pub fn table(self) -> HandleTableId {
        self.table
    }

    pub fn index(self) -> u32 {
        self.index
    }
}

/// Parser-side allocator of content handles.
#[derive(Debug)]
pub struct HandleTable {
    id: HandleTableId,
    used: u32,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            id: HandleTableId::next(),
            used: 0,
        }
    }

    pub fn id(&self) -> HandleTableId {
        self.id
    }

    /// Number of handles minted since the table identity was last reset.
    pub fn len(&self) -> usize {
        self.used as usize
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn allocate(&mut self) -> ContentHandle {
        if self.used == u32::MAX {
            // Index space exhausted: continue under a fresh identity rather than
            // wrapping into indices that are still live on the owner side.
            log::warn!(target: "html.tree_builder", "handle table exhausted; rotating identity");
            self.drop_handles();
        }
        let handle = ContentHandle {
            table: self.id,
            index: self.used,
        };
        self.used += 1;
        handle
    }

    /// Releases every handle minted so far. Later handles use a new identity.
    pub fn drop_handles(&mut self) {
        self.id = HandleTableId::next();
        self.used = 0;
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HandleError {
    #[error("handle {0:?} used before the operation that creates it")]
    Unresolved(ContentHandle),
    #[error("handle {0:?} resolved twice")]
    AlreadyResolved(ContentHandle),
    #[error("handle {0:?} belongs to a different handle table")]
    Foreign(ContentHandle),
}

/// Owner-side slot array resolving handles from one table to real nodes.
#[derive(Debug, Default)]
pub struct HandleSlots {
    table: Option<HandleTableId>,
    slots: Vec<Option<NodeKey>>,
}

impl HandleSlots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the slots to a table up front. Unbound slots bind to the first
    /// handle they resolve.
    pub fn bound_to(table: HandleTableId) -> Self {
        Self {
            table: Some(table),
            slots: Vec::new(),
        }
    }

    pub fn table(&self) -> Option<HandleTableId> {
        self.table
    }

    pub fn resolve(&mut self, handle: ContentHandle, node: NodeKey) -> Result<(), HandleError> {
        match self.table {
            Some(table) if table != handle.table => return Err(HandleError::Foreign(handle)),
            Some(_) => {}
            None => self.table = Some(handle.table),
        }
        let index = handle.index as usize;
        if index >= self.slots.len() {
            let blocks = index / HANDLE_BLOCK_LEN + 1;
            self.slots.resize(blocks * HANDLE_BLOCK_LEN, None);
        }
        let slot = &mut self.slots[index];
        if slot.is_some() {
            return Err(HandleError::AlreadyResolved(handle));
        }
        *slot = Some(node);
        Ok(())
    }

    pub fn get(&self, handle: ContentHandle) -> Result<NodeKey, HandleError> {
        if self.table != Some(handle.table) {
            return match self.table {
                None => Err(HandleError::Unresolved(handle)),
                Some(_) => Err(HandleError::Foreign(handle)),
            };
        }
        self.slots
            .get(handle.index as usize)
            .copied()
            .flatten()
            .ok_or(HandleError::Unresolved(handle))
    }

    pub fn is_resolved(&self, handle: ContentHandle) -> bool {
        self.get(handle).is_ok()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Drops every slot in bulk; the slots rebind on next use.
    pub fn release(&mut self) {
        self.table = None;
        self.slots = Vec::new();
    }
}
