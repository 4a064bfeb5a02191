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

//! Human size grammar and extent size computation.
//!
//! Grammar: `<number>[k|K|m|M|g|G|t|T][b|B]` or `<number>%`. Units scale by
//! powers of 1024, a trailing `b`/`B` is ignored, and the magnitude may be
//! decimal (`1.5k` is 1536). A percentage resolves against filesystem
//! available space when a backing file is created, against the existing
//! file's size when one is reused, and against physical memory for the
//! heap backend.

use std::str::FromStr;

use crate::error::{Error, Result};

/// Smallest viable extent, in pages.
pub const MIN_PAGES: usize = 128;

/// A parsed, not yet resolved size argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SizeSpec {
    /// An absolute byte count.
    Bytes(u64),
    /// A percentage of the referent the backend resolves against.
    Percent(f64),
}

impl FromStr for SizeSpec {
    type Err = Error;

    fn from_str(spec: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidSize {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let s = spec.trim();
        if s.is_empty() {
            return Err(invalid("empty size"));
        }

        if let Some(magnitude) = s.strip_suffix('%') {
            let percent: f64 = magnitude.trim().parse().map_err(|_| invalid("malformed percentage"))?;
            if !percent.is_finite() || percent <= 0.0 {
                return Err(invalid("percentage must be positive"));
            }
            return Ok(SizeSpec::Percent(percent));
        }

        // Trailing `b`/`B` is accepted and ignored, as in "1.5kB".
        let mut body = s;
        if body.len() > 1 && matches!(body.as_bytes()[body.len() - 1], b'b' | b'B') {
            body = &body[..body.len() - 1];
        }

        let (magnitude, multiplier) = match body.as_bytes()[body.len() - 1] {
            b'k' | b'K' => (&body[..body.len() - 1], 1u64 << 10),
            b'm' | b'M' => (&body[..body.len() - 1], 1u64 << 20),
            b'g' | b'G' => (&body[..body.len() - 1], 1u64 << 30),
            b't' | b'T' => (&body[..body.len() - 1], 1u64 << 40),
            _ => (body, 1),
        };

        let value: f64 = magnitude.trim().parse().map_err(|_| invalid("malformed magnitude"))?;
        if !value.is_finite() {
            return Err(invalid("malformed magnitude"));
        }
        if value <= 0.0 {
            return Err(invalid("zero size not permitted"));
        }
        let bytes = value * multiplier as f64;
        if bytes >= u64::MAX as f64 {
            return Err(invalid("size too large"));
        }
        Ok(SizeSpec::Bytes(bytes as u64))
    }
}

/// What the extent size computation resolves against, probed once at
/// configuration time.
#[derive(Debug, Clone, Copy)]
pub struct SizeContext {
    /// Virtual memory page size.
    pub page_size: usize,
    /// Filesystem fragment size; extents are rounded to
    /// `max(page_size, fragment_size)`.
    pub fragment_size: u64,
    /// Filesystem bytes available to this process.
    pub available: u64,
    /// Size of the backing file when an existing one is reused.
    pub existing_len: Option<u64>,
}

/// Compute the extent size for a file backend.
///
/// Fatal (configuration-time) failure when the result falls below
/// [`MIN_PAGES`] pages.
pub fn resolve_extent(spec: Option<SizeSpec>, ctx: &SizeContext) -> Result<u64> {
    let unit = ctx.fragment_size.max(ctx.page_size as u64);
    let explicit = matches!(spec, Some(SizeSpec::Bytes(_)));

    let mut len = match spec {
        Some(SizeSpec::Bytes(n)) => n,
        Some(SizeSpec::Percent(p)) => {
            let base = ctx.existing_len.unwrap_or(ctx.available);
            (base as f64 * p / 100.0) as u64
        }
        None => match ctx.existing_len {
            Some(existing) if existing > 0 => existing,
            _ => {
                tracing::info!("[file backend]: no size given, defaulting to 80% of available space");
                ctx.available / 10 * 8
            }
        },
    };

    // Growing the backing file past what the filesystem holds cannot work.
    let existing = ctx.existing_len.unwrap_or(0);
    if len > existing && len - existing > ctx.available {
        len = ctx.available / 10 * 8;
        tracing::warn!(
            "[file backend]: size larger than filesystem free space, reduced to {len} bytes (80% of available)",
        );
    }

    // Fragment sizes need not be powers of two, so round by remainder.
    len -= len % unit;

    // A 32-bit address space cannot hold arbitrarily large mappings; cap a
    // non-explicit size at 2 GiB there. An explicit size overrides.
    if usize::BITS == 32 && !explicit && len > 1 << 31 {
        len = 1 << 31;
        tracing::warn!("[file backend]: size limited to 2 GiB to preserve address space");
    }

    let min = (MIN_PAGES * ctx.page_size) as u64;
    if len < min {
        return Err(Error::ExtentTooSmall { size: len, min });
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> SizeSpec {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_absolute() {
        assert_eq!(parse("1024"), SizeSpec::Bytes(1024));
        assert_eq!(parse("1G"), SizeSpec::Bytes(1073741824));
        assert_eq!(parse("1.5kB"), SizeSpec::Bytes(1536));
        assert_eq!(parse("4g"), SizeSpec::Bytes(4 << 30));
        assert_eq!(parse("2T"), SizeSpec::Bytes(2 << 40));
        assert_eq!(parse("512b"), SizeSpec::Bytes(512));
        assert_eq!(parse(" 256M "), SizeSpec::Bytes(256 << 20));
    }

    #[test]
    fn test_parse_percent() {
        assert_eq!(parse("50%"), SizeSpec::Percent(50.0));
        assert_eq!(parse("12.5%"), SizeSpec::Percent(12.5));
    }

    #[test]
    fn test_parse_rejects() {
        for s in ["", "k", "1q", "one", "0", "0%", "-1", "-5G", "%", "1.2.3G"] {
            assert!(s.parse::<SizeSpec>().is_err(), "accepted {s:?}");
        }
    }

    #[test]
    fn test_resolve_percent_of_free_space() {
        // 1000 available 4096-byte filesystem blocks.
        let ctx = SizeContext {
            page_size: 4096,
            fragment_size: 4096,
            available: 1000 * 4096,
            existing_len: None,
        };
        let len = resolve_extent(Some(parse("50%")), &ctx).unwrap();
        assert_eq!(len, 2048000);
        assert_eq!(len % 4096, 0);
    }

    #[test]
    fn test_resolve_existing_file_default() {
        let ctx = SizeContext {
            page_size: 4096,
            fragment_size: 4096,
            available: 1 << 30,
            existing_len: Some(800 * 4096),
        };
        assert_eq!(resolve_extent(None, &ctx).unwrap(), 800 * 4096);
    }

    #[test]
    fn test_resolve_rounds_down_to_fragment() {
        let ctx = SizeContext {
            page_size: 4096,
            fragment_size: 8192,
            available: 1 << 30,
            existing_len: None,
        };
        let len = resolve_extent(Some(parse("1000001k")), &ctx).unwrap();
        assert_eq!(len % 8192, 0);
        assert!(len <= 1000001 * 1024);
    }

    #[test]
    fn test_resolve_clamps_to_free_space() {
        let ctx = SizeContext {
            page_size: 4096,
            fragment_size: 4096,
            available: 100 << 20,
            existing_len: None,
        };
        let len = resolve_extent(Some(parse("10G")), &ctx).unwrap();
        assert_eq!(len, (100 << 20) / 10 * 8);
    }

    #[test]
    fn test_resolve_too_small_is_fatal() {
        let ctx = SizeContext {
            page_size: 4096,
            fragment_size: 4096,
            available: 1 << 30,
            existing_len: None,
        };
        assert!(matches!(
            resolve_extent(Some(parse("64k")), &ctx),
            Err(Error::ExtentTooSmall { .. })
        ));
    }
}
