// Copyright 2025 wharf Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The heap stevedore: a thin wrapper over the global allocator with a
//! byte budget. No internal reuse bookkeeping; exhaustion is a fast,
//! non-blocking failure and eviction is the director's business.

use std::{
    alloc::{alloc, dealloc, handle_alloc_error, realloc, Layout},
    ptr::NonNull,
    sync::{atomic::Ordering, Arc},
};

use parking_lot::Mutex;
use wharf_common::sys;

use crate::{
    error::{Error, Result},
    size::SizeSpec,
    statistics::Statistics,
};

/// Configuration of a heap backend.
#[derive(Debug, Clone, Default)]
pub struct HeapBackendConfig {
    /// Byte budget; `None` means unlimited. A percentage resolves against
    /// physical memory.
    pub budget: Option<SizeSpec>,
}

impl HeapBackendConfig {
    /// Create a config with an unlimited budget.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the byte budget.
    pub fn with_budget(mut self, budget: SizeSpec) -> Self {
        self.budget = Some(budget);
        self
    }
}

#[derive(Debug, Default)]
struct Counter {
    bytes: usize,
    blocks: usize,
}

#[derive(Debug)]
struct HeapInner {
    budget: usize,
    // Invariant: `bytes` equals the sum of live block capacities.
    counter: Mutex<Counter>,
    statistics: Arc<Statistics>,
}

/// Storage backend over the global allocator.
#[derive(Debug, Clone)]
pub struct HeapBackend {
    inner: Arc<HeapInner>,
}

impl HeapBackend {
    pub(crate) fn new(config: HeapBackendConfig) -> Result<Self> {
        let budget = match config.budget {
            None => usize::MAX,
            Some(SizeSpec::Bytes(n)) => usize::try_from(n).map_err(|_| Error::InvalidSize {
                spec: format!("{n}"),
                reason: "budget exceeds the address space".to_string(),
            })?,
            Some(SizeSpec::Percent(p)) => {
                let physical = sys::physical_memory().ok_or_else(|| Error::InvalidSize {
                    spec: format!("{p}%"),
                    reason: "physical memory size unknown on this platform".to_string(),
                })?;
                (physical as f64 * p / 100.0) as usize
            }
        };
        Ok(Self {
            inner: Arc::new(HeapInner {
                budget,
                counter: Mutex::new(Counter::default()),
                statistics: Arc::new(Statistics::default()),
            }),
        })
    }

    /// The configured byte budget, if bounded.
    pub fn budget(&self) -> Option<usize> {
        (self.inner.budget != usize::MAX).then_some(self.inner.budget)
    }

    pub(crate) fn statistics(&self) -> &Arc<Statistics> {
        &self.inner.statistics
    }

    pub(crate) fn open(&self) {
        match self.budget() {
            Some(budget) => tracing::info!("[heap backend]: open, budget {budget} bytes"),
            None => tracing::info!("[heap backend]: open, unlimited budget"),
        }
    }

    pub(crate) fn allocate_block(&self, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(size > 0);
        let statistics = &self.inner.statistics;
        statistics.allocations.fetch_add(1, Ordering::Relaxed);

        {
            let mut counter = self.inner.counter.lock();
            if counter.bytes.checked_add(size).is_none_or(|total| total > self.inner.budget) {
                drop(counter);
                statistics.failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("[heap backend]: {size} bytes over budget");
                return None;
            }
            counter.bytes += size;
            counter.blocks += 1;
        }

        let layout = Layout::from_size_align(size, 1).expect("valid layout");
        let Some(ptr) = NonNull::new(unsafe { alloc(layout) }) else {
            handle_alloc_error(layout);
        };
        statistics.segments.fetch_add(1, Ordering::Relaxed);
        statistics.bytes_used.fetch_add(size, Ordering::Relaxed);
        statistics.bytes_allocated.fetch_add(size, Ordering::Relaxed);
        Some(ptr)
    }

    pub(crate) fn release_block(&self, ptr: NonNull<u8>, size: usize) {
        let layout = Layout::from_size_align(size, 1).expect("valid layout");
        unsafe { dealloc(ptr.as_ptr(), layout) };

        let mut counter = self.inner.counter.lock();
        counter.bytes -= size;
        counter.blocks -= 1;
        drop(counter);

        let statistics = &self.inner.statistics;
        statistics.segments.fetch_sub(1, Ordering::Relaxed);
        statistics.bytes_used.fetch_sub(size, Ordering::Relaxed);
        statistics.bytes_freed.fetch_add(size, Ordering::Relaxed);
    }

    /// Reallocate a block down to `size` bytes. A failed shrink leaves the
    /// block and the budget untouched.
    pub(crate) fn trim_block(&self, ptr: NonNull<u8>, space: usize, size: usize) -> (NonNull<u8>, usize) {
        debug_assert!(size > 0);
        if size >= space {
            return (ptr, space);
        }
        let layout = Layout::from_size_align(space, 1).expect("valid layout");
        let Some(ptr) = NonNull::new(unsafe { realloc(ptr.as_ptr(), layout, size) }) else {
            return (ptr, space);
        };

        let released = space - size;
        self.inner.counter.lock().bytes -= released;
        let statistics = &self.inner.statistics;
        statistics.bytes_used.fetch_sub(released, Ordering::Relaxed);
        statistics.bytes_freed.fetch_add(released, Ordering::Relaxed);
        (ptr, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_accounting() {
        let heap = HeapBackend::new(HeapBackendConfig::new().with_budget(SizeSpec::Bytes(1024))).unwrap();

        let a = heap.allocate_block(512).unwrap();
        let b = heap.allocate_block(512).unwrap();
        assert!(heap.allocate_block(1).is_none(), "budget exhausted");

        let (b, space) = heap.trim_block(b, 512, 128);
        assert_eq!(space, 128);
        let c = heap.allocate_block(384).unwrap();

        heap.release_block(a, 512);
        heap.release_block(b, 128);
        heap.release_block(c, 384);
        assert_eq!(heap.inner.counter.lock().bytes, 0);
        assert_eq!(heap.inner.counter.lock().blocks, 0);
    }

    #[test]
    fn test_unlimited_budget() {
        let heap = HeapBackend::new(HeapBackendConfig::new()).unwrap();
        assert!(heap.budget().is_none());
        let ptr = heap.allocate_block(4096).unwrap();
        heap.release_block(ptr, 4096);
    }
}
