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

/// Storage layer error type.
///
/// Every variant except [`Error::Other`] is a configuration-time failure:
/// the embedding process is expected to report it and exit non-zero before
/// serving traffic. Runtime allocation exhaustion is not an error, it is a
/// `None` from the allocation surface.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The backend kind in a storage spec is not recognized.
    #[error("unknown storage backend kind {0:?}")]
    UnknownBackend(String),
    /// A storage spec string is malformed.
    #[error("invalid backend spec {spec:?}: {reason}")]
    InvalidSpec {
        /// The offending spec string.
        spec: String,
        /// Why it was rejected.
        reason: String,
    },
    /// A size argument does not follow the size grammar.
    #[error("invalid size {spec:?}: {reason}")]
    InvalidSize {
        /// The offending size string.
        spec: String,
        /// Why it was rejected.
        reason: String,
    },
    /// The usable extent ended up below the minimum viable size.
    #[error("extent too small: {size} bytes usable, at least {min} required")]
    ExtentTooSmall {
        /// Usable bytes.
        size: u64,
        /// Minimum viable bytes.
        min: u64,
    },
    /// I/O error from the backing file or filesystem probes.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Other error.
    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Storage layer result type.
pub type Result<T> = core::result::Result<T, Error>;
