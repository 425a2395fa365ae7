// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Scratch memory for tensor descriptors.
//!
//! Descriptor loads need a small global-memory staging area. The allocator is
//! passed explicitly to every tuning round; a [`RoundScratch`] owns whatever
//! was handed out during the round and gives it back when dropped.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::error::{Result, SgmmError};

/// Aligned byte buffer obtained from a [`ScratchAllocator`].
#[derive(Debug)]
pub struct ScratchBuffer {
    storage: Vec<u8>,
    offset: usize,
    size: usize,
    alignment: usize,
    stream: Option<u64>,
}

impl ScratchBuffer {
    /// Carves an aligned window of `size` bytes out of fresh host memory.
    pub fn host(size: usize, alignment: usize, stream: Option<u64>) -> Result<Self> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(SgmmError::Scratch {
                size,
                alignment,
                reason: "alignment must be a power of two".into(),
            });
        }
        let storage = vec![0u8; size + alignment];
        let misalignment = storage.as_ptr() as usize % alignment;
        let offset = if misalignment == 0 {
            0
        } else {
            alignment - misalignment
        };
        Ok(Self {
            storage,
            offset,
            size,
            alignment,
            stream,
        })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn stream(&self) -> Option<u64> {
        self.stream
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.size]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.size]
    }

    pub fn is_aligned(&self) -> bool {
        self.as_slice().as_ptr() as usize % self.alignment == 0
    }
}

pub trait ScratchAllocator: Send + Sync {
    fn allocate(&self, size: usize, alignment: usize, stream: Option<u64>) -> Result<ScratchBuffer>;
}

/// Host-memory allocator with an optional byte cap.
#[derive(Debug, Default)]
pub struct HostScratchAllocator {
    limit: Option<usize>,
    allocated: AtomicUsize,
}

impl HostScratchAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Bytes handed out so far.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl ScratchAllocator for HostScratchAllocator {
    fn allocate(&self, size: usize, alignment: usize, stream: Option<u64>) -> Result<ScratchBuffer> {
        let total = self.allocated.fetch_add(size, Ordering::Relaxed) + size;
        if let Some(limit) = self.limit {
            if total > limit {
                self.allocated.fetch_sub(size, Ordering::Relaxed);
                return Err(SgmmError::Scratch {
                    size,
                    alignment,
                    reason: format!("limit of {limit} bytes exceeded"),
                });
            }
        }
        ScratchBuffer::host(size, alignment, stream)
    }
}

/// Scratch owned by one tuning round.
pub struct RoundScratch<'a> {
    allocator: &'a dyn ScratchAllocator,
    stream: Option<u64>,
    buffers: Vec<ScratchBuffer>,
}

impl<'a> RoundScratch<'a> {
    pub fn new(allocator: &'a dyn ScratchAllocator, stream: Option<u64>) -> Self {
        Self {
            allocator,
            stream,
            buffers: Vec::new(),
        }
    }

    /// Pre-allocates one buffer so that allocation failures surface before any
    /// candidate runs.
    pub fn reserve(&mut self, size: usize, alignment: usize) -> Result<()> {
        self.acquire(size, alignment).map(|_| ())
    }

    /// Returns an owned buffer of at least `size` bytes with `alignment`,
    /// reusing one from earlier in the round when possible.
    pub fn acquire(&mut self, size: usize, alignment: usize) -> Result<&mut ScratchBuffer> {
        let reusable = self
            .buffers
            .iter()
            .position(|buffer| buffer.len() >= size && buffer.alignment() % alignment.max(1) == 0);
        let index = match reusable {
            Some(index) => index,
            None => {
                let buffer = self.allocator.allocate(size, alignment, self.stream)?;
                self.buffers.push(buffer);
                self.buffers.len() - 1
            }
        };
        Ok(&mut self.buffers[index])
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }
}

impl Drop for RoundScratch<'_> {
    fn drop(&mut self) {
        if !self.buffers.is_empty() {
            let bytes: usize = self.buffers.iter().map(ScratchBuffer::len).sum();
            debug!(buffers = self.buffers.len(), bytes, "released round scratch");
        }
    }
}
