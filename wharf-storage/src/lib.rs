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

//! Object-storage layer for an HTTP accelerator: pluggable backend storage
//! engines ("stevedores") that supply the byte ranges cached response
//! bodies are held in.
//!
//! The [`StorageDirector`] owns the backends configured at startup and
//! rotates allocation requests across them, driving the external eviction
//! hook when they fill up. The file backend manages a large, page-aligned,
//! mmap'd extent of a backing file as a self-managed heap with
//! address-ordered segment tracking, size-class free lists, splitting,
//! coalescing, and trimming; the heap backend wraps the global allocator
//! with a byte budget.
//!
//! Storage is transient by design: backing files carry no metadata and all
//! bookkeeping is rebuilt from nothing at every process start. Worker
//! threads call [`StorageDirector::allocate`], fill the returned
//! [`StorageHandle`], trim it to its final size, and drop it when the
//! cached object dies; every operation is synchronous and runs to
//! completion on the calling thread.

pub mod backend;
pub mod director;
pub mod error;
pub mod handle;
mod segment;
pub mod size;
pub mod statistics;

pub use backend::{
    file::{FileBackend, FileBackendConfig},
    heap::{HeapBackend, HeapBackendConfig},
    Backend, BackendConfig,
};
pub use director::{Evictor, NoEviction, StorageDirector};
pub use error::{Error, Result};
pub use handle::StorageHandle;
pub use size::{SizeContext, SizeSpec};
pub use statistics::Statistics;
