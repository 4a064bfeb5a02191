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

//! Per-backend counters kept for internal visibility, updated on every
//! operation without batching. There is no exporter layer here; embedders
//! that want metrics read these directly.

use std::sync::atomic::AtomicUsize;

/// Counters of one backend instance.
#[derive(Debug, Default)]
pub struct Statistics {
    /// Live segment records (file backend) or live blocks (heap backend).
    pub segments: AtomicUsize,
    /// Bytes currently handed out to storage handles.
    pub bytes_used: AtomicUsize,
    /// Cumulative bytes allocated over the backend lifetime.
    pub bytes_allocated: AtomicUsize,
    /// Cumulative bytes returned over the backend lifetime.
    pub bytes_freed: AtomicUsize,
    /// Allocation attempts, successful or not.
    pub allocations: AtomicUsize,
    /// Allocation attempts that failed for lack of space.
    pub failures: AtomicUsize,
}
