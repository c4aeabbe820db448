//! Producer-side buffer of tree operations and the hand-off seam to the owner.
//!
//! The queue is single-producer/single-consumer by ownership: the builder
//! appends into a `Vec`, and a flush moves that `Vec` to the sink wholesale,
//! leaving a fresh empty buffer behind. No state is shared between threads.

use crate::tree_op::TreeOperation;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("out of memory growing a parser queue to {requested} entries")]
    OutOfMemory { requested: usize },
    #[error("operation consumer disconnected")]
    SinkClosed,
}

/// Receives drained batches of operations, in order.
pub trait TreeOpSink: Send {
    fn move_ops_from(&mut self, ops: Vec<TreeOperation>) -> Result<(), QueueError>;
}

/// Sink that keeps every batch, preserving batch boundaries.
#[derive(Debug, Default)]
pub struct VecOpSink {
    pub batches: Vec<Vec<TreeOperation>>,
}

impl VecOpSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> impl Iterator<Item = &TreeOperation> {
        self.batches.iter().flatten()
    }

    pub fn take_ops(&mut self) -> Vec<TreeOperation> {
        self.batches.drain(..).flatten().collect()
    }
}

impl TreeOpSink for VecOpSink {
    fn move_ops_from(&mut self, ops: Vec<TreeOperation>) -> Result<(), QueueError> {
        self.batches.push(ops);
        Ok(())
    }
}

/// A shared sink, so tests can inspect what a builder flushed.
impl<S: TreeOpSink> TreeOpSink for std::sync::Arc<std::sync::Mutex<S>> {
    fn move_ops_from(&mut self, ops: Vec<TreeOperation>) -> Result<(), QueueError> {
        self.lock()
            .map_err(|_| QueueError::SinkClosed)?
            .move_ops_from(ops)
    }
}

/// Append-only operation buffer with fallible growth.
#[derive(Debug, Default)]
pub struct OpQueue {
    ops: Vec<TreeOperation>,
    limit: Option<usize>,
}

impl OpQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue that reports exhaustion once `limit` operations are buffered.
    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            ops: Vec::new(),
            limit,
        }
    }

    pub fn push(&mut self, op: TreeOperation) -> Result<(), QueueError> {
        let requested = self.ops.len() + 1;
        if self.limit.is_some_and(|limit| requested > limit) {
            return Err(QueueError::OutOfMemory { requested });
        }
        self.ops
            .try_reserve(1)
            .map_err(|_| QueueError::OutOfMemory { requested })?;
        self.ops.push(op);
        Ok(())
    }

    /// Pushes without consulting the cap; used for the single terminal
    /// `MarkAsBroken` operation after the queue has been cleared.
    pub(crate) fn push_reserved(&mut self, op: TreeOperation) -> Result<(), QueueError> {
        let requested = self.ops.len() + 1;
        self.ops
            .try_reserve(1)
            .map_err(|_| QueueError::OutOfMemory { requested })?;
        self.ops.push(op);
        Ok(())
    }

    /// Transfers ownership of everything buffered so far.
    pub fn take(&mut self) -> Vec<TreeOperation> {
        std::mem::take(&mut self.ops)
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn as_slice(&self) -> &[TreeOperation] {
        &self.ops
    }
}
