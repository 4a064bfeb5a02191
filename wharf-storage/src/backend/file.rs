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

//! The file stevedore: one page-aligned mmap'd extent of a backing file,
//! carved into segments by the [`SegmentPool`].
//!
//! Construction does the configuration-time work (create or reuse the
//! backing file, compute the extent size) and can fail fatally; `open`
//! performs the one-time, syscall-heavy mapping. Steady-state operations
//! take one short critical section on the pool mutex and never block on
//! I/O.

use std::{
    fs::{File, OpenOptions},
    io::ErrorKind,
    os::fd::{AsRawFd, RawFd},
    path::{Path, PathBuf},
    ptr::NonNull,
    sync::{atomic::Ordering, Arc},
};

use itertools::Itertools;
use parking_lot::Mutex;
use wharf_common::{bits, sys};

use crate::{
    error::{Error, Result},
    segment::{SegmentId, SegmentPool, SegmentView},
    size::{self, SizeContext, SizeSpec, MIN_PAGES},
    statistics::Statistics,
};

/// Upper bound on mapping attempts in the halving loop; far above anything
/// a real address space produces.
const MAX_MAP_ATTEMPTS: usize = 4096;

/// Configuration of a file backend.
#[derive(Debug, Clone)]
pub struct FileBackendConfig {
    /// Backing path: a file to create, an existing regular file to reuse,
    /// or a directory to hold an anonymous unlinked temp file.
    pub path: PathBuf,
    /// Extent size; `None` defaults to the existing file's size, or 80% of
    /// available filesystem space for a new file.
    pub size: Option<SizeSpec>,
}

impl FileBackendConfig {
    /// Create a config backed by `path` with a defaulted size.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().into(),
            size: None,
        }
    }

    /// Set the extent size.
    pub fn with_size(mut self, size: SizeSpec) -> Self {
        self.size = Some(size);
        self
    }
}

/// A mapped chunk of the backing file. Unmapped on drop.
#[derive(Debug)]
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is plain shared memory; range ownership is enforced by the
// segment pool above it.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
    }
}

#[derive(Debug)]
struct Extent {
    pool: SegmentPool,
    /// Held only to keep the chunks mapped for the backend lifetime.
    _mappings: Vec<Mapping>,
}

#[derive(Debug)]
struct FileInner {
    file: File,
    label: String,
    size: u64,
    page_size: usize,
    /// The whole in-memory bookkeeping sits behind one mutex; `None` until
    /// `open` maps the extent.
    state: Mutex<Option<Extent>>,
    statistics: Arc<Statistics>,
}

/// Storage backend over a single mmap'd file.
#[derive(Debug, Clone)]
pub struct FileBackend {
    inner: Arc<FileInner>,
}

impl FileBackend {
    pub(crate) fn new(config: FileBackendConfig) -> Result<Self> {
        let page_size = sys::page_size();
        let (file, label, existing_len, probe) = open_target(&config.path)?;
        let fragment_size = sys::fragment_size(&probe)?;
        let available = fs4::available_space(&probe)?;
        let ctx = SizeContext {
            page_size,
            fragment_size,
            available,
            existing_len,
        };
        let size = size::resolve_extent(config.size, &ctx)?;
        file.set_len(size)?;
        tracing::info!(
            "[file backend]: {label} size {size} bytes ({} fs-blocks, {} pages)",
            size / fragment_size,
            size / page_size as u64,
        );
        Ok(Self {
            inner: Arc::new(FileInner {
                file,
                label,
                size,
                page_size,
                state: Mutex::new(None),
                statistics: Arc::new(Statistics::default()),
            }),
        })
    }

    /// Map the extent and seed the segment pool. Called once, after which
    /// the backend serves allocations.
    pub(crate) fn open(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        assert!(state.is_none(), "file backend opened twice");

        let page_size = self.inner.page_size;
        let chunks = map_chunks(self.inner.file.as_raw_fd(), self.inner.size, page_size);

        let mut pool = SegmentPool::new(page_size);
        let mut mappings = Vec::with_capacity(chunks.len());
        for (offset, mapping) in chunks.into_iter().sorted_by_key(|(offset, _)| *offset) {
            pool.insert_chunk(mapping.ptr.as_ptr() as usize, offset, mapping.len);
            mappings.push(mapping);
        }

        let mapped = pool.capacity() as u64;
        tracing::info!(
            "[file backend]: {} mapped {mapped} of {} bytes in {} chunk(s)",
            self.inner.label,
            self.inner.size,
            mappings.len(),
        );
        let min = (MIN_PAGES * page_size) as u64;
        if mapped < min {
            return Err(Error::ExtentTooSmall { size: mapped, min });
        }

        self.inner.statistics.segments.store(pool.segments(), Ordering::Relaxed);
        *state = Some(Extent {
            pool,
            _mappings: mappings,
        });
        Ok(())
    }

    /// Extent size in bytes.
    pub fn extent_size(&self) -> u64 {
        self.inner.size
    }

    pub(crate) fn statistics(&self) -> &Arc<Statistics> {
        &self.inner.statistics
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.inner.file.as_raw_fd()
    }

    pub(crate) fn allocate_segment(&self, size: usize) -> Option<(SegmentId, SegmentView)> {
        debug_assert!(size > 0);
        let rounded = bits::align_up(self.inner.page_size, size);
        let statistics = &self.inner.statistics;
        statistics.allocations.fetch_add(1, Ordering::Relaxed);

        let mut state = self.inner.state.lock();
        let extent = state.as_mut().expect("file backend not opened");
        let Some(id) = extent.pool.allocate(rounded) else {
            drop(state);
            statistics.failures.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        let view = extent.pool.view(id);
        statistics.segments.store(extent.pool.segments(), Ordering::Relaxed);
        drop(state);

        debug_assert_eq!(view.len, rounded);
        statistics.bytes_used.fetch_add(rounded, Ordering::Relaxed);
        statistics.bytes_allocated.fetch_add(rounded, Ordering::Relaxed);
        Some((id, view))
    }

    pub(crate) fn release_segment(&self, seg: SegmentId, space: usize) {
        let mut state = self.inner.state.lock();
        let extent = state.as_mut().expect("file backend not opened");
        debug_assert_eq!(extent.pool.view(seg).len, space);
        extent.pool.free(seg);
        let statistics = &self.inner.statistics;
        statistics.segments.store(extent.pool.segments(), Ordering::Relaxed);
        drop(state);

        statistics.bytes_used.fetch_sub(space, Ordering::Relaxed);
        statistics.bytes_freed.fetch_add(space, Ordering::Relaxed);
    }

    /// Shrink a segment to the page-rounded `new_size`, returning the new
    /// capacity. Rounding can make this a no-op.
    pub(crate) fn trim_segment(&self, seg: SegmentId, space: usize, new_size: usize) -> usize {
        debug_assert!(new_size > 0);
        let rounded = bits::align_up(self.inner.page_size, new_size);
        if rounded >= space {
            return space;
        }

        let mut state = self.inner.state.lock();
        let extent = state.as_mut().expect("file backend not opened");
        debug_assert_eq!(extent.pool.view(seg).len, space);
        extent.pool.trim(seg, rounded);
        let statistics = &self.inner.statistics;
        statistics.segments.store(extent.pool.segments(), Ordering::Relaxed);
        drop(state);

        statistics.bytes_used.fetch_sub(space - rounded, Ordering::Relaxed);
        statistics.bytes_freed.fetch_add(space - rounded, Ordering::Relaxed);
        rounded
    }
}

/// Create or reuse the backing file: a fresh file at a non-existent path,
/// an existing regular file as-is, or an anonymous unlinked temp file
/// inside a directory. Returns the file, a display label, the existing
/// length when reusing, and the path to probe filesystem geometry with.
fn open_target(path: &Path) -> Result<(File, String, Option<u64>, PathBuf)> {
    match OpenOptions::new().read(true).write(true).create_new(true).open(path) {
        Ok(file) => Ok((file, path.display().to_string(), None, path.to_path_buf())),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            let meta = std::fs::metadata(path)?;
            if meta.is_file() {
                let file = OpenOptions::new().read(true).write(true).open(path)?;
                Ok((file, path.display().to_string(), Some(meta.len()), path.to_path_buf()))
            } else if meta.is_dir() {
                let file = tempfile::tempfile_in(path)?;
                Ok((file, format!("{} (unlinked)", path.display()), None, path.to_path_buf()))
            } else {
                Err(Error::InvalidSpec {
                    spec: path.display().to_string(),
                    reason: "is neither a regular file nor a directory".to_string(),
                })
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Map the extent in as few chunks as the address space allows.
///
/// One mapping call can fail for very large sizes, so the whole span is
/// attempted first and halved (rounded down to a page multiple) on
/// failure, iteratively, until chunks drop below [`MIN_PAGES`] pages. A
/// failure watermark skips attempt sizes already known not to fit.
fn map_chunks(fd: RawFd, size: u64, page_size: usize) -> Vec<(u64, Mapping)> {
    let min_chunk = (MIN_PAGES * page_size) as u64;
    let mut spans = vec![(0u64, size)];
    let mut chunks = Vec::new();
    let mut fail = u64::MAX;
    let mut attempts = 0;

    while let Some((offset, len)) = spans.pop() {
        if len < min_chunk {
            continue;
        }
        attempts += 1;
        if attempts > MAX_MAP_ATTEMPTS {
            tracing::warn!("[file backend]: giving up mapping after {MAX_MAP_ATTEMPTS} attempts");
            break;
        }
        if len < fail {
            match map(fd, offset, len as usize) {
                Some(ptr) => {
                    chunks.push((offset, Mapping { ptr, len: len as usize }));
                    continue;
                }
                None => fail = len,
            }
        }
        let half = bits::align_down(page_size as u64, len / 2);
        if half == 0 {
            continue;
        }
        // Tail pushed first so the head is attempted next; the walk stays
        // in ascending offset order.
        spans.push((offset + half, len - half));
        spans.push((offset, half));
    }
    chunks
}

fn map(fd: RawFd, offset: u64, len: usize) -> Option<NonNull<u8>> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            offset as libc::off_t,
        )
    };
    if ptr == libc::MAP_FAILED {
        tracing::debug!(
            "[file backend]: mmap of {len} bytes at offset {offset} failed: {}",
            std::io::Error::last_os_error(),
        );
        return None;
    }
    NonNull::new(ptr.cast())
}
