use std::sync::atomic::{AtomicU8, Ordering};

use super::map::{Region, BIOS_SIZE, HW_SIZE, PARAM_SIZE, RAM_SIZE, SCRATCH_SIZE};

/// Per-word access history. Bits only accumulate until something explicitly clears them.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct Tag(u8);

impl Tag {
    pub const NONE: Tag = Tag(0);
    pub const RAM: Tag = Tag(1 << 0);
    pub const SCRATCH: Tag = Tag(1 << 1);
    pub const HW: Tag = Tag(1 << 2);
    pub const BIOS: Tag = Tag(1 << 3);
    pub const PAR: Tag = Tag(1 << 4);
    /// Read in a busy-wait loop
    pub const POLL: Tag = Tag(1 << 5);
    /// Fetched as an instruction. First of the two bits the compiler owns.
    pub const CODE: Tag = Tag(1 << 6);
    pub const RESERVED: Tag = Tag(1 << 7);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Tag {
        Tag(bits)
    }

    pub const fn contains(self, other: Tag) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Tag) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for Tag {
    type Output = Tag;
    fn bitor(self, rhs: Tag) -> Tag {
        Tag(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Tag {
    fn bitor_assign(&mut self, rhs: Tag) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Debug for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: [&str; 8] = ["RAM", "SCRATCH", "HW", "BIOS", "PAR", "POLL", "CODE", "RESERVED"];
        let set: Vec<&str> = NAMES.iter().enumerate()
            .filter(|(bit, _)| self.0 & (1 << bit) != 0)
            .map(|(_, name)| *name)
            .collect();
        write!(f, "Tag({})", set.join("|"))
    }
}

/// One tag byte per word of every region. Shared, so writers on other threads can see which
/// words are code or being polled.
pub struct TagTable {
    ram: Box<[AtomicU8]>,
    scratch: Box<[AtomicU8]>,
    hw: Box<[AtomicU8]>,
    bios: Box<[AtomicU8]>,
    param: Box<[AtomicU8]>,
    cache_control: AtomicU8,
}

fn words(bytes: u32) -> Box<[AtomicU8]> {
    (0..bytes / 4).map(|_| AtomicU8::new(0)).collect()
}

impl TagTable {
    pub fn new() -> TagTable {
        TagTable {
            ram: words(RAM_SIZE),
            scratch: words(SCRATCH_SIZE),
            hw: words(HW_SIZE),
            bios: words(BIOS_SIZE),
            param: words(PARAM_SIZE),
            cache_control: AtomicU8::new(0),
        }
    }

    fn slot(&self, region: Region, offset: u32) -> &AtomicU8 {
        let index = (offset >> 2) as usize;
        let table = match region {
            Region::Ram => &self.ram,
            Region::Scratch => &self.scratch,
            Region::Hw => &self.hw,
            Region::Bios => &self.bios,
            Region::Param => &self.param,
            Region::CacheControl => return &self.cache_control,
        };
        // Offsets come from map::decode, which keeps them inside the region
        &table[index]
    }

    pub fn get(&self, region: Region, offset: u32) -> Tag {
        Tag(self.slot(region, offset).load(Ordering::Acquire))
    }

    /// ORs `tag` in, returning what was there before
    pub fn mark(&self, region: Region, offset: u32, tag: Tag) -> Tag {
        let slot = self.slot(region, offset);
        // Skip the read-modify-write on the hot path when nothing would change
        let current = slot.load(Ordering::Relaxed);
        if current & tag.0 == tag.0 {
            return Tag(current);
        }
        Tag(slot.fetch_or(tag.0, Ordering::AcqRel))
    }

    /// Clears `tag`, returning what was there before
    pub fn clear(&self, region: Region, offset: u32, tag: Tag) -> Tag {
        Tag(self.slot(region, offset).fetch_and(!tag.0, Ordering::AcqRel))
    }

    /// Clears `tag` everywhere
    pub fn clear_all(&self, tag: Tag) {
        for table in [&self.ram, &self.scratch, &self.hw, &self.bios, &self.param] {
            for slot in table.iter() {
                slot.fetch_and(!tag.0, Ordering::AcqRel);
            }
        }
        self.cache_control.fetch_and(!tag.0, Ordering::AcqRel);
    }
}

impl Default for TagTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_accumulate_until_cleared() {
        let tags = TagTable::new();
        tags.mark(Region::Ram, 0x100, Tag::RAM);
        tags.mark(Region::Ram, 0x102, Tag::CODE);
        assert_eq!(tags.get(Region::Ram, 0x100), Tag::RAM | Tag::CODE);

        let before = tags.clear(Region::Ram, 0x100, Tag::CODE);
        assert!(before.contains(Tag::CODE));
        assert_eq!(tags.get(Region::Ram, 0x100), Tag::RAM);
    }

    #[test]
    fn debug_lists_bits() {
        assert_eq!(format!("{:?}", Tag::SCRATCH | Tag::POLL), "Tag(SCRATCH|POLL)");
    }
}
