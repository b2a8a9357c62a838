//! The fixed PlayStation memory map. Everything here is masking arithmetic, no lookups.

use crate::AddressError;
use super::tags::Tag;

pub const RAM_SIZE: u32 = 2 * 1024 * 1024;
/// RAM repeats four times across this window
pub const RAM_WINDOW: u32 = 8 * 1024 * 1024;
pub const RAM_MASK: u32 = RAM_SIZE - 1;

pub const PARAM_BASE: u32 = 0x1f00_0000;
pub const PARAM_SIZE: u32 = 64 * 1024;

pub const SCRATCH_BASE: u32 = 0x1f80_0000;
pub const SCRATCH_SIZE: u32 = 4 * 1024;

pub const HW_BASE: u32 = 0x1f80_1000;
pub const HW_SIZE: u32 = 8 * 1024;

pub const BIOS_BASE: u32 = 0x1fc0_0000;
pub const BIOS_SIZE: u32 = 512 * 1024;

/// KSEG2 cache control register. The only thing up there we implement.
pub const CACHE_CONTROL: u32 = 0xfffe_0130;

/// Per 512MiB segment: KUSEG, KSEG0, KSEG1, KSEG2
const SEGMENT_MASKS: [u32; 8] = [
    0xffff_ffff, 0xffff_ffff, 0xffff_ffff, 0xffff_ffff,
    0x7fff_ffff,
    0x1fff_ffff,
    0xffff_ffff, 0xffff_ffff,
];

/// Strips the KSEG0/KSEG1 bits and folds the RAM mirrors onto the 2MiB backing, so every
/// mirror of a location compares equal
#[inline(always)]
pub fn physical(address: u32) -> u32 {
    let p = address & SEGMENT_MASKS[(address >> 29) as usize];
    if p < RAM_WINDOW { p & RAM_MASK } else { p }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Ram,
    Scratch,
    Hw,
    Bios,
    Param,
    CacheControl,
}

impl Region {
    pub fn tag(self) -> Tag {
        match self {
            Region::Ram => Tag::RAM,
            Region::Scratch => Tag::SCRATCH,
            Region::Hw | Region::CacheControl => Tag::HW,
            Region::Bios => Tag::BIOS,
            Region::Param => Tag::PAR,
        }
    }

    /// Bytes of backing (or dispatch) space behind the region
    pub fn len(self) -> u32 {
        match self {
            Region::Ram => RAM_SIZE,
            Region::Scratch => SCRATCH_SIZE,
            Region::Hw => HW_SIZE,
            Region::Bios => BIOS_SIZE,
            Region::Param => PARAM_SIZE,
            Region::CacheControl => 4,
        }
    }

    /// Physical address of offset zero
    pub fn base(self) -> u32 {
        match self {
            Region::Ram => 0,
            Region::Scratch => SCRATCH_BASE,
            Region::Hw => HW_BASE,
            Region::Bios => BIOS_BASE,
            Region::Param => PARAM_BASE,
            Region::CacheControl => CACHE_CONTROL,
        }
    }

    pub fn is_memory(self) -> bool {
        matches!(self, Region::Ram | Region::Scratch | Region::Bios)
    }
}

/// Where an address lands. Callers keep one around and hand it to `resolve` over and over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub region: Region,
    /// Byte offset into the region's backing
    pub offset: u32,
    /// Byte lane inside the word
    pub low_bits: u32,
    /// Region classification plus everything recorded at the word so far
    pub tag: Tag,
}

impl Default for ResolvedAddress {
    fn default() -> Self {
        ResolvedAddress {
            region: Region::Param,
            offset: 0,
            low_bits: 0,
            tag: Tag::NONE,
        }
    }
}

impl ResolvedAddress {
    /// Canonical physical address of the resolved byte
    pub fn physical(&self) -> u32 {
        self.region.base() + self.offset
    }

    pub fn word_index(&self) -> usize {
        (self.offset >> 2) as usize
    }
}

/// Region and offset for a single byte
pub fn decode(address: u32) -> Result<(Region, u32), AddressError> {
    let p = physical(address);
    let found = if p < RAM_WINDOW {
        (Region::Ram, p & RAM_MASK)
    } else if (PARAM_BASE..PARAM_BASE + PARAM_SIZE).contains(&p) {
        (Region::Param, p - PARAM_BASE)
    } else if (SCRATCH_BASE..SCRATCH_BASE + SCRATCH_SIZE).contains(&p) {
        (Region::Scratch, p - SCRATCH_BASE)
    } else if (HW_BASE..HW_BASE + HW_SIZE).contains(&p) {
        (Region::Hw, p - HW_BASE)
    } else if (BIOS_BASE..BIOS_BASE + BIOS_SIZE).contains(&p) {
        (Region::Bios, p - BIOS_BASE)
    } else if p & !3 == CACHE_CONTROL {
        (Region::CacheControl, p & 3)
    } else {
        return Err(AddressError::Unbacked(address));
    };
    Ok(found)
}

/// Region and offset for `[address, address + size)`, which must sit in one contiguous stretch
/// of a single region
pub fn decode_sized(address: u32, size: u32) -> Result<(Region, u32), AddressError> {
    let (region, offset) = decode(address)?;
    if size <= 1 {
        return Ok((region, offset));
    }
    let last = address.checked_add(size - 1)
        .ok_or(AddressError::Straddle { address, size })?;
    match decode(last) {
        Ok((last_region, last_offset)) if last_region == region && last_offset == offset + size - 1 => {
            Ok((region, offset))
        }
        _ => Err(AddressError::Straddle { address, size }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_mirror_ram() {
        assert_eq!(decode(0x8000_1234), Ok((Region::Ram, 0x1234)));
        assert_eq!(decode(0xa000_1234), Ok((Region::Ram, 0x1234)));
        assert_eq!(decode(0x0060_1234), Ok((Region::Ram, 0x1234)));
        assert_eq!(decode(0x2000_0000), Err(AddressError::Unbacked(0x2000_0000)));
    }

    #[test]
    fn mirrors_share_a_physical_address() {
        assert_eq!(physical(0x8002_0000), 0x2_0000);
        assert_eq!(physical(0x8022_0000), 0x2_0000);
        assert_eq!(physical(0xa062_0000), 0x2_0000);
        assert_eq!(physical(0x0042_0000), 0x2_0000);
        assert_eq!(physical(0xbfc0_0180), BIOS_BASE + 0x180);
        assert_eq!(physical(0x1f80_1070), HW_BASE + 0x70);
    }

    #[test]
    fn fixed_regions() {
        assert_eq!(decode(0x1f80_0000), Ok((Region::Scratch, 0)));
        assert_eq!(decode(0x1f80_1070), Ok((Region::Hw, 0x70)));
        assert_eq!(decode(0xbfc0_0180), Ok((Region::Bios, 0x180)));
        assert_eq!(decode(0x1f00_fffc), Ok((Region::Param, 0xfffc)));
        assert_eq!(decode(0xfffe_0130), Ok((Region::CacheControl, 0)));
        assert!(decode(0xfffe_0134).is_err());
        assert!(decode(0x1f80_3000).is_err());
    }

    #[test]
    fn straddles_are_reported() {
        // Scratchpad runs straight into the hardware window
        assert_eq!(decode_sized(0x1f80_0ffc, 4), Ok((Region::Scratch, 0xffc)));
        assert_eq!(decode_sized(0x1f80_0ffe, 4),
            Err(AddressError::Straddle { address: 0x1f80_0ffe, size: 4 }));
        // The end of one RAM mirror wraps to the start of the backing
        assert!(decode_sized(0x001f_fffc, 8).is_err());
        assert!(decode_sized(0xffff_fffe, 4).is_err());
    }
}
