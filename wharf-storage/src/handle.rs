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

use std::{fmt::Debug, os::fd::RawFd, ptr::NonNull};

use crate::{backend::Backend, segment::SegmentId};

/// One allocated byte range of a storage backend.
///
/// A handle is produced only by a successful allocation and owns its range
/// exclusively until dropped. Dropping the handle returns the range to the
/// owning backend, so double-free and freeing through the wrong backend are
/// unrepresentable.
///
/// The range starts empty: [`StorageHandle::append`] fills it up to the
/// capacity, and [`StorageHandle::trim`] releases the capacity beyond what
/// was actually needed once the final length is known.
pub struct StorageHandle {
    backend: Backend,
    repr: Repr,
    ptr: NonNull<u8>,
    len: usize,
    space: usize,
}

#[derive(Debug)]
pub(crate) enum Repr {
    File { seg: SegmentId, offset: u64, fd: RawFd },
    Heap,
}

// The handle is the sole owner of its byte range; the backing mapping or
// heap block stays alive through the `backend` reference until drop.
unsafe impl Send for StorageHandle {}
unsafe impl Sync for StorageHandle {}

impl Debug for StorageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHandle")
            .field("backend", &self.backend.kind())
            .field("repr", &self.repr)
            .field("len", &self.len)
            .field("space", &self.space)
            .finish()
    }
}

impl StorageHandle {
    pub(crate) fn for_file(backend: Backend, seg: SegmentId, addr: usize, offset: u64, fd: RawFd, space: usize) -> Self {
        Self {
            backend,
            repr: Repr::File { seg, offset, fd },
            ptr: NonNull::new(addr as *mut u8).expect("mapped address must not be null"),
            len: 0,
            space,
        }
    }

    pub(crate) fn for_heap(backend: Backend, ptr: NonNull<u8>, space: usize) -> Self {
        Self {
            backend,
            repr: Repr::Heap,
            ptr,
            len: 0,
            space,
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Usable bytes of the underlying range.
    pub fn capacity(&self) -> usize {
        self.space
    }

    /// Bytes still writable before the capacity is reached.
    pub fn remaining(&self) -> usize {
        self.space - self.len
    }

    /// Kind of the owning backend.
    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind()
    }

    /// Base pointer of the range.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// The written prefix of the range.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Append `data` after the bytes already written.
    ///
    /// Writing past the capacity is a caller bug.
    pub fn append(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.remaining(),
            "append of {} bytes overflows handle: {} of {} used",
            data.len(),
            self.len,
            self.space,
        );
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(self.len), data.len());
        }
        self.len += data.len();
    }

    /// Offset of the range within the backing file, for zero-copy
    /// transmission. `None` for heap-backed storage.
    pub fn base_offset(&self) -> Option<u64> {
        match self.repr {
            Repr::File { offset, .. } => Some(offset),
            Repr::Heap => None,
        }
    }

    /// File descriptor of the backing file, for zero-copy transmission.
    /// `None` for heap-backed storage.
    pub fn raw_fd(&self) -> Option<RawFd> {
        match self.repr {
            Repr::File { fd, .. } => Some(fd),
            Repr::Heap => None,
        }
    }

    /// Shrink the capacity to `new_size`, releasing the unused tail to the
    /// owning backend.
    ///
    /// `new_size` must be positive, not exceed the current capacity, and
    /// not cut into bytes already written; violations are caller bugs.
    pub fn trim(&mut self, new_size: usize) {
        assert!(new_size > 0, "trim to zero");
        assert!(
            new_size <= self.space,
            "trim must shrink: {new_size} > capacity {}",
            self.space,
        );
        assert!(
            new_size >= self.len,
            "trim below written length: {new_size} < {}",
            self.len,
        );
        match (&self.backend, &self.repr) {
            (Backend::File(file), Repr::File { seg, .. }) => {
                self.space = file.trim_segment(*seg, self.space, new_size);
            }
            (Backend::Heap(heap), Repr::Heap) => {
                let (ptr, space) = heap.trim_block(self.ptr, self.space, new_size);
                self.ptr = ptr;
                self.space = space;
            }
            _ => unreachable!("handle does not match its backend"),
        }
    }
}

impl Drop for StorageHandle {
    fn drop(&mut self) {
        match (&self.backend, &self.repr) {
            (Backend::File(file), Repr::File { seg, .. }) => file.release_segment(*seg, self.space),
            (Backend::Heap(heap), Repr::Heap) => heap.release_block(self.ptr, self.space),
            _ => unreachable!("handle does not match its backend"),
        }
    }
}
