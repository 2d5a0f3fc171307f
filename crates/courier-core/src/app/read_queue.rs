//! Read queue - メモリ上だけの読み取り処理の列
//!
//! 永続化されません。両レーンが空のときに 1 つずつ実行されます。

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::domain::QueuedTask;

/// A deferred read block. It may queue follow-up tasks through the context.
pub type ReadBlock = Box<dyn FnOnce(&mut ReadContext) + Send + 'static>;

/// Handed to a running read block.
///
/// Tasks added here are queued as soon as the block returns, before the next
/// block is considered, so a block that produces work holds back the rest of
/// the read queue.
#[derive(Debug, Default)]
pub struct ReadContext {
    tasks: Vec<QueuedTask>,
}

impl ReadContext {
    pub fn add_task(&mut self, task: QueuedTask) {
        self.tasks.push(task);
    }

    pub(crate) fn into_tasks(self) -> Vec<QueuedTask> {
        self.tasks
    }
}

/// FIFO of read blocks.
///
/// The mutex only makes the queue `Sync` (blocks are `Send` but not `Sync`);
/// the drain engine is its sole user, so `&mut` access never locks.
#[derive(Default)]
pub(crate) struct ReadQueue {
    blocks: Mutex<VecDeque<ReadBlock>>,
}

impl ReadQueue {
    fn blocks(&mut self) -> &mut VecDeque<ReadBlock> {
        self.blocks.get_mut().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&mut self, block: ReadBlock) {
        self.blocks().push_back(block);
    }

    pub fn pop(&mut self) -> Option<ReadBlock> {
        self.blocks().pop_front()
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().map(|b| b.len()).unwrap_or_else(|e| e.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.blocks().clear();
    }
}
