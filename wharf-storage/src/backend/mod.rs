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

//! Storage backends ("stevedores") and their configuration.
//!
//! A backend is configured from one spec string,
//! `"<kind>,<arg1>[,<arg2>...]"`, e.g. `file,/var/cache,4G` or
//! `malloc,256M`. Kinds are fixed at compile time and dispatched by enum
//! match; an unrecognized kind is a fatal configuration error.

pub mod file;
pub mod heap;

use std::{path::PathBuf, sync::Arc};

use file::{FileBackend, FileBackendConfig};
use heap::{HeapBackend, HeapBackendConfig};

use crate::{
    error::{Error, Result},
    handle::StorageHandle,
    statistics::Statistics,
};

/// Parsed configuration of one backend instance.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    /// A file backend.
    File(FileBackendConfig),
    /// A heap backend.
    Heap(HeapBackendConfig),
}

impl BackendConfig {
    /// Parse a backend spec string.
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidSpec {
            spec: spec.to_string(),
            reason,
        };

        let mut parts = spec.split(',').map(str::trim);
        let kind = parts.next().unwrap_or("");
        let args: Vec<&str> = parts.collect();

        match kind {
            "file" => {
                if args.len() > 2 {
                    return Err(invalid(format!("expected at most 2 arguments, got {}", args.len())));
                }
                let path = args
                    .first()
                    .filter(|p| !p.is_empty())
                    .map(|p| PathBuf::from(*p))
                    .unwrap_or_else(std::env::temp_dir);
                let mut config = FileBackendConfig::new(path);
                if let Some(size) = args.get(1).filter(|s| !s.is_empty()) {
                    config = config.with_size(size.parse()?);
                }
                Ok(Self::File(config))
            }
            "malloc" => {
                if args.len() > 1 {
                    return Err(invalid(format!("expected at most 1 argument, got {}", args.len())));
                }
                let mut config = HeapBackendConfig::new();
                if let Some(budget) = args.first().filter(|s| !s.is_empty()) {
                    config = config.with_budget(budget.parse()?);
                }
                Ok(Self::Heap(config))
            }
            _ => Err(Error::UnknownBackend(kind.to_string())),
        }
    }
}

impl From<FileBackendConfig> for BackendConfig {
    fn from(config: FileBackendConfig) -> Self {
        Self::File(config)
    }
}

impl From<HeapBackendConfig> for BackendConfig {
    fn from(config: HeapBackendConfig) -> Self {
        Self::Heap(config)
    }
}

/// A configured backend instance.
#[derive(Debug, Clone)]
pub enum Backend {
    /// A file backend.
    File(FileBackend),
    /// A heap backend.
    Heap(HeapBackend),
}

impl Backend {
    /// Construct a backend, performing the configuration-time work (file
    /// creation, size computation). Failures are fatal to startup.
    pub(crate) fn new(config: BackendConfig) -> Result<Self> {
        match config {
            BackendConfig::File(config) => Ok(Self::File(FileBackend::new(config)?)),
            BackendConfig::Heap(config) => Ok(Self::Heap(HeapBackend::new(config)?)),
        }
    }

    /// The backend kind, as named in spec strings.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::File(_) => "file",
            Self::Heap(_) => "malloc",
        }
    }

    /// One-time, potentially slow setup: the file backend maps its extent
    /// here.
    pub(crate) fn open(&self) -> Result<()> {
        match self {
            Self::File(file) => file.open(),
            Self::Heap(heap) => {
                heap.open();
                Ok(())
            }
        }
    }

    /// Allocate `size` bytes. `None` means this backend is out of space;
    /// the director decides whether to drive eviction and retry.
    pub(crate) fn allocate(&self, size: usize) -> Option<StorageHandle> {
        debug_assert!(size > 0);
        match self {
            Self::File(file) => {
                let (seg, view) = file.allocate_segment(size)?;
                Some(StorageHandle::for_file(
                    self.clone(),
                    seg,
                    view.addr,
                    view.offset,
                    file.raw_fd(),
                    view.len,
                ))
            }
            Self::Heap(heap) => {
                let ptr = heap.allocate_block(size)?;
                Some(StorageHandle::for_heap(self.clone(), ptr, size))
            }
        }
    }

    /// Counters of this backend instance.
    pub fn statistics(&self) -> &Arc<Statistics> {
        match self {
            Self::File(file) => file.statistics(),
            Self::Heap(heap) => heap.statistics(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size::SizeSpec;

    #[test]
    fn test_parse_file_spec() {
        let BackendConfig::File(config) = BackendConfig::parse("file,/var/cache,4G").unwrap() else {
            panic!("expected a file config");
        };
        assert_eq!(config.path, std::path::PathBuf::from("/var/cache"));
        assert_eq!(config.size, Some(SizeSpec::Bytes(4 << 30)));

        let BackendConfig::File(config) = BackendConfig::parse("file").unwrap() else {
            panic!("expected a file config");
        };
        assert_eq!(config.path, std::env::temp_dir());
        assert_eq!(config.size, None);
    }

    #[test]
    fn test_parse_malloc_spec() {
        let BackendConfig::Heap(config) = BackendConfig::parse("malloc,256M").unwrap() else {
            panic!("expected a heap config");
        };
        assert_eq!(config.budget, Some(SizeSpec::Bytes(256 << 20)));

        let BackendConfig::Heap(config) = BackendConfig::parse("malloc").unwrap() else {
            panic!("expected a heap config");
        };
        assert_eq!(config.budget, None);
    }

    #[test]
    fn test_parse_rejects() {
        assert!(matches!(
            BackendConfig::parse("ramdisk,1G"),
            Err(Error::UnknownBackend(kind)) if kind == "ramdisk"
        ));
        assert!(matches!(BackendConfig::parse(""), Err(Error::UnknownBackend(_))));
        assert!(matches!(
            BackendConfig::parse("malloc,1G,extra"),
            Err(Error::InvalidSpec { .. })
        ));
        assert!(matches!(
            BackendConfig::parse("file,/tmp,banana"),
            Err(Error::InvalidSize { .. })
        ));
    }
}
