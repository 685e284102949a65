//! Physical frame allocation boundary.
//!
//! The MMU core does not own physical memory. Page table nodes are backed by
//! frames obtained from a [`FrameAllocator`] supplied by the kernel, and the
//! frame number doubles as the node's handle. [`FramePool`] is a small
//! reference allocator over a contiguous frame range, used for early boot and
//! for tests.

use alloc::{collections::BTreeSet, vec::Vec};

use spin::Mutex;

use crate::FrameNumber;

/// Interface for physical frame allocation, consumed by the page table manager.
pub trait FrameAllocator: Send + Sync {
    /// Allocates one frame, or returns `None` when memory is exhausted.
    fn alloc_frame(&self) -> Option<FrameNumber>;

    /// Returns a frame previously handed out by [`FrameAllocator::alloc_frame`].
    fn free_frame(&self, frame: FrameNumber);
}

/// A frame allocator over a fixed range of frames.
///
/// Fresh frames are handed out in ascending order; freed frames are kept on a
/// LIFO free list and reused first.
pub struct FramePool {
    state: Mutex<PoolState>,
}

struct PoolState {
    next: usize,
    end: usize,
    free: Vec<FrameNumber>,
    allocated: BTreeSet<FrameNumber>,
}

impl FramePool {
    /// Creates a pool managing `count` frames starting at `first`.
    pub fn new(first: FrameNumber, count: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                next: first.as_usize(),
                end: first.as_usize() + count,
                free: Vec::new(),
                allocated: BTreeSet::new(),
            }),
        }
    }

    /// Returns the number of frames currently handed out.
    pub fn allocated(&self) -> usize {
        self.state.lock().allocated.len()
    }

    /// Returns the number of frames that can still be allocated.
    pub fn available(&self) -> usize {
        let state = self.state.lock();
        state.free.len() + (state.end - state.next)
    }

    /// Returns true if `frame` is currently allocated from this pool.
    pub fn is_allocated(&self, frame: FrameNumber) -> bool {
        self.state.lock().allocated.contains(&frame)
    }
}

impl FrameAllocator for FramePool {
    fn alloc_frame(&self) -> Option<FrameNumber> {
        let mut state = self.state.lock();
        let frame = match state.free.pop() {
            Some(frame) => frame,
            None if state.next < state.end => {
                let frame = FrameNumber::new(state.next);
                state.next += 1;
                frame
            }
            None => return None,
        };
        state.allocated.insert(frame);
        Some(frame)
    }

    fn free_frame(&self, frame: FrameNumber) {
        let mut state = self.state.lock();
        if !state.allocated.remove(&frame) {
            log::warn!("ignoring free of frame {} not allocated from this pool", frame);
            return;
        }
        state.free.push(frame);
    }
}
