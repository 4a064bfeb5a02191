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

//! Alignment arithmetic over the unsigned integer widths the storage layer
//! deals in (`usize` for in-memory lengths, `u64` for file offsets).

use std::{
    fmt::Debug,
    ops::{Add, BitAnd, Not, Sub},
};

/// Unsigned integer usable with the alignment helpers.
pub trait Unsigned:
    Add<Output = Self> + Sub<Output = Self> + BitAnd<Output = Self> + Not<Output = Self> + Copy + Eq + Ord + Debug
{
    /// The additive identity.
    const ZERO: Self;
    /// The multiplicative identity.
    const ONE: Self;
}

macro_rules! impl_unsigned {
    ($($t:ty),*) => {
        $(
            impl Unsigned for $t {
                const ZERO: Self = 0;
                const ONE: Self = 1;
            }
        )*
    };
}

impl_unsigned! { u32, u64, usize }

/// Check if `v` is a power of two. Zero is not.
#[inline(always)]
pub fn is_pow2<U: Unsigned>(v: U) -> bool {
    v != U::ZERO && v & (v - U::ONE) == U::ZERO
}

/// Check if `v` is a multiple of `align`.
///
/// `align` must be a power of two.
#[inline(always)]
pub fn is_aligned<U: Unsigned>(align: U, v: U) -> bool {
    debug_assert!(is_pow2(align), "align: {align:?}");
    v & (align - U::ONE) == U::ZERO
}

/// Round `v` up to the next multiple of `align`.
///
/// `align` must be a power of two.
#[inline(always)]
pub fn align_up<U: Unsigned>(align: U, v: U) -> U {
    debug_assert!(is_pow2(align), "align: {align:?}");
    (v + align - U::ONE) & !(align - U::ONE)
}

/// Round `v` down to the previous multiple of `align`.
///
/// `align` must be a power of two.
#[inline(always)]
pub fn align_down<U: Unsigned>(align: U, v: U) -> U {
    debug_assert!(is_pow2(align), "align: {align:?}");
    v & !(align - U::ONE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pow2() {
        assert!(is_pow2(1u64));
        assert!(is_pow2(4096usize));
        assert!(!is_pow2(0u32));
        assert!(!is_pow2(12usize));
    }

    #[test]
    fn test_align() {
        assert_eq!(align_up(4096usize, 1), 4096);
        assert_eq!(align_up(4096usize, 4096), 4096);
        assert_eq!(align_up(4096usize, 4097), 8192);
        assert_eq!(align_down(4096u64, 8191), 4096);
        assert_eq!(align_down(4096u64, 4096), 4096);
        assert_eq!(align_down(4096u64, 42), 0);
        assert!(is_aligned(4096usize, 0));
        assert!(is_aligned(4096usize, 12288));
        assert!(!is_aligned(4096usize, 12289));
    }
}
