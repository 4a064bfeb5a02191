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

//! Probes for platform properties the allocator sizes itself by.

use std::{ffi::CString, io, os::unix::ffi::OsStrExt, path::Path, sync::OnceLock};

/// Size of a virtual memory page in bytes.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// Fundamental fragment size of the filesystem holding `path`, in bytes.
///
/// This is the unit disk space is accounted in; extents are rounded to the
/// larger of this and the page size.
pub fn fragment_size(path: impl AsRef<Path>) -> io::Result<u64> {
    let stat = statvfs(path.as_ref())?;
    Ok(stat.f_frsize as u64)
}

/// Physical memory of the machine in bytes, if the platform exposes it.
pub fn physical_memory() -> Option<usize> {
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    if pages <= 0 {
        return None;
    }
    Some(pages as usize * page_size())
}

fn statvfs(path: &Path) -> io::Result<libc::statvfs> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let mut stat = unsafe { std::mem::zeroed::<libc::statvfs>() };
    if unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size() {
        let page = page_size();
        assert!(page.is_power_of_two());
        assert!(page >= 4096);
    }

    #[test]
    fn test_fragment_size() {
        let dir = tempfile::tempdir().unwrap();
        let frag = fragment_size(dir.path()).unwrap();
        assert!(frag > 0);
    }
}
