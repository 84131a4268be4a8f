//! Victim heaps: completed log blocks ranked by valid-chunk count.
//!
//! Each bank keeps three of these (first-usage, second-usage, cold). A heap
//! is an indexed binary min-heap so the count of a member block can be
//! lowered or raised in place as chunks are overwritten or relocated.

/// Which of a bank's three heaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapKind {
    /// Hot blocks after their low-page pass.
    FirstUsage,
    /// Hot blocks after their high-page (reuse) pass.
    SecondUsage,
    Cold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    lbn: u32,
    valid: u32,
}

impl Entry {
    fn key(&self) -> (u32, u32) {
        (self.valid, self.lbn)
    }
}

#[derive(Debug)]
pub struct VictimHeap {
    entries: Vec<Entry>,
    /// Heap position of each block, or `None` when not a member.
    position: Vec<Option<usize>>,
}

impl VictimHeap {
    pub fn new(log_blocks: u32) -> Self {
        VictimHeap {
            entries: Vec::with_capacity(log_blocks as usize),
            position: vec![None; log_blocks as usize],
        }
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, lbn: u32) -> bool {
        self.position[lbn as usize].is_some()
    }

    /// Block with the fewest valid chunks and its count.
    pub fn peek(&self) -> Option<(u32, u32)> {
        self.entries.first().map(|e| (e.lbn, e.valid))
    }

    /// Valid-chunk count of the best candidate.
    pub fn best_valid(&self) -> Option<u32> {
        self.entries.first().map(|e| e.valid)
    }

    pub fn insert(&mut self, lbn: u32, valid: u32) {
        debug_assert!(!self.contains(lbn), "block {lbn} already in heap");
        let i = self.entries.len();
        self.entries.push(Entry { lbn, valid });
        self.position[lbn as usize] = Some(i);
        self.sift_up(i);
    }

    /// Set the count of `lbn` if it is a member; other blocks are ignored.
    pub fn update(&mut self, lbn: u32, valid: u32) {
        let Some(i) = self.position[lbn as usize] else {
            return;
        };
        let old = self.entries[i].valid;
        self.entries[i].valid = valid;
        if valid < old {
            self.sift_up(i);
        } else if valid > old {
            self.sift_down(i);
        }
    }

    /// Drop `lbn` from the heap. Returns false if it was not a member.
    pub fn remove(&mut self, lbn: u32) -> bool {
        let Some(i) = self.position[lbn as usize].take() else {
            return false;
        };
        let last = self.entries.len() - 1;
        if i != last {
            self.entries.swap(i, last);
            self.position[self.entries[i].lbn as usize] = Some(i);
        }
        self.entries.pop();
        if i < self.entries.len() {
            self.sift_up(i);
            self.sift_down(i);
        }
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.entries.iter().map(|e| (e.lbn, e.valid))
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.position[self.entries[a].lbn as usize] = Some(a);
        self.position[self.entries[b].lbn as usize] = Some(b);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.entries[i].key() >= self.entries[parent].key() {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let n = self.entries.len();
        loop {
            let left = 2 * i + 1;
            let right = left + 1;
            let mut smallest = i;
            if left < n && self.entries[left].key() < self.entries[smallest].key() {
                smallest = left;
            }
            if right < n && self.entries[right].key() < self.entries[smallest].key() {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.swap(i, smallest);
            i = smallest;
        }
    }
}
