//! Erased log blocks waiting to be assigned, oldest first.

use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct CleanList {
    blocks: VecDeque<u32>,
}

impl CleanList {
    pub fn new() -> Self {
        Self::default()
    }

    /// A list holding every log block of a bank.
    pub fn seeded(log_blocks: u32) -> Self {
        CleanList {
            blocks: (0..log_blocks).collect(),
        }
    }

    pub fn push(&mut self, lbn: u32) {
        debug_assert!(!self.contains(lbn), "block {lbn} already clean");
        self.blocks.push_back(lbn);
    }

    pub fn pop(&mut self) -> Option<u32> {
        self.blocks.pop_front()
    }

    pub fn len(&self) -> u32 {
        self.blocks.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, lbn: u32) -> bool {
        self.blocks.contains(&lbn)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.blocks.iter().copied()
    }
}
