use core::fmt;
use std::ops::BitAnd;

/// Marks which bytes of a 32-bit little-endian word a sub-width access touches.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ByteMask {
    mask: u32,
}

impl ByteMask {
    pub const WORD: ByteMask = ByteMask { mask: !0 };

    /// `width` and `alignment` are in bytes. Alignment is the offset of the access inside the word.
    #[inline(always)]
    pub fn new<W, A>(width: W, alignment: A) -> Self
    where u32: From<W>, u32: From<A> {
        let width = u32::from(width);
        let alignment = u32::from(alignment) & 3;
        let mask = (!0u32).wrapping_shr(32 - width * 8).wrapping_shl(alignment * 8);
        ByteMask { mask }
    }

    #[inline(always)]
    pub fn apply(&self, data: u32) -> u32 {
        data & self.mask
    }

    #[inline(always)]
    pub fn masked_insert(&self, dest: &mut u32, value: u32) {
        *dest = (*dest & !self.mask) | (value & self.mask);
    }

    #[inline(always)]
    pub fn value(&self) -> u32 {
        self.mask
    }

    /// Number of bytes covered
    pub fn size(&self) -> u32 {
        self.mask.count_ones() / 8
    }

    /// Bit position of the lowest byte covered
    pub fn shift(&self) -> u32 {
        self.mask.trailing_zeros() & !7
    }

    pub fn is_word(&self) -> bool {
        self.mask == !0
    }
}

impl BitAnd for ByteMask {
    type Output = Self;

    #[inline(always)]
    fn bitand(self, rhs: Self) -> Self::Output {
        ByteMask {
            mask: self.mask & rhs.mask,
        }
    }
}

impl Default for ByteMask {
    #[inline(always)]
    fn default() -> Self {
        ByteMask::WORD
    }
}

impl fmt::Debug for ByteMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteMask({:08x})", self.mask)
    }
}
