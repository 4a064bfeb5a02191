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

//! The storage director: owns the configured backend instances and gives
//! the cache one allocation surface, rotating requests across backends and
//! driving the eviction hook when they fill up.

use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crate::{
    backend::{Backend, BackendConfig},
    error::Result,
    handle::StorageHandle,
};

/// Hook into the external eviction policy.
///
/// Implementations discard one cached object, freeing whatever storage it
/// held, and report whether anything was left to discard. The director
/// guarantees the call is made with no backend lock held, so the evicted
/// object's teardown may free into any backend, including the one that
/// just failed to allocate.
pub trait Evictor: Send + Sync + 'static {
    /// Discard one cached object. `false` when nothing remains to evict.
    fn evict_one(&self) -> bool;
}

/// An eviction hook that never frees anything, for caches that would
/// rather fail an allocation than discard.
#[derive(Debug, Default)]
pub struct NoEviction;

impl Evictor for NoEviction {
    fn evict_one(&self) -> bool {
        false
    }
}

/// Registry and allocation front of all configured backends.
pub struct StorageDirector {
    backends: Vec<Backend>,
    cursor: AtomicUsize,
    evictor: Arc<dyn Evictor>,
}

impl Debug for StorageDirector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageDirector")
            .field("backends", &self.backends)
            .finish()
    }
}

impl StorageDirector {
    /// Create a director with the given eviction hook and no backends.
    pub fn new(evictor: Arc<dyn Evictor>) -> Self {
        Self {
            backends: Vec::new(),
            cursor: AtomicUsize::new(0),
            evictor,
        }
    }

    /// Register a backend from a spec string, e.g. `file,/var/cache,4G`.
    ///
    /// Errors are fatal configuration errors; the embedding process should
    /// report them and exit before serving traffic.
    pub fn add_backend(&mut self, spec: &str) -> Result<()> {
        self.add_backend_config(BackendConfig::parse(spec)?)
    }

    /// Register a backend from an already built configuration.
    pub fn add_backend_config(&mut self, config: BackendConfig) -> Result<()> {
        let backend = Backend::new(config)?;
        tracing::info!("[director]: registered {} backend #{}", backend.kind(), self.backends.len());
        self.backends.push(backend);
        Ok(())
    }

    /// Open every registered backend. Called once, after registration and
    /// before the first allocation; this is where the file backends map
    /// their extents.
    pub fn open_all(&self) -> Result<()> {
        for backend in &self.backends {
            backend.open()?;
        }
        Ok(())
    }

    /// Allocate `size` bytes from the next backend in rotation.
    ///
    /// The cursor advances exactly once per call, independent of the
    /// outcome, to keep the rotation fair. When the selected backend is
    /// full, the eviction hook is asked to discard one object and the same
    /// backend is retried, until it succeeds or the hook reports nothing
    /// left to evict.
    ///
    /// `size` must be positive; a zero-size allocation is a caller bug.
    pub fn allocate(&self, size: usize) -> Option<StorageHandle> {
        assert!(size > 0, "zero-size storage allocation");
        assert!(!self.backends.is_empty(), "no storage backends registered");

        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.backends.len();
        let backend = &self.backends[idx];
        loop {
            if let Some(handle) = backend.allocate(size) {
                return Some(handle);
            }
            // No lock is held here; eviction may free into this backend.
            if !self.evictor.evict_one() {
                tracing::debug!(
                    "[director]: allocation of {size} bytes from {} #{idx} failed, nothing left to evict",
                    backend.kind(),
                );
                return None;
            }
        }
    }

    /// Release a handle back to its owning backend.
    ///
    /// Purely delegation: the handle already knows its owner and releases
    /// on drop.
    pub fn free(&self, handle: StorageHandle) {
        drop(handle);
    }

    /// Shrink a handle to `new_size`, delegated to its owning backend.
    pub fn trim(&self, handle: &mut StorageHandle, new_size: usize) {
        handle.trim(new_size);
    }

    /// The registered backends, in registration order.
    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }
}
