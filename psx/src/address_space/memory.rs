use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use common::util::ByteMask;
use timing::Rendezvous;

use crate::AddressError;
use super::map::{self, Region, BIOS_SIZE, RAM_SIZE, SCRATCH_SIZE};
use super::tags::{Tag, TagTable};

const NOT_POLLING: u32 = u32::MAX;

/// The machine's backing storage, shared between the execution thread and everything that moves
/// memory behind its back (DMA, loaders, devices on other threads).
pub(crate) struct Memory {
    ram: Box<[AtomicU32]>,
    scratch: Box<[AtomicU32]>,
    bios: Box<[AtomicU32]>,
    pub(crate) tags: TagTable,
    bios_unlocked: AtomicBool,
    dirty: Mutex<Option<Range<u32>>>,
    has_dirty: AtomicBool,
    /// Physical word the execution thread is parked on, or NOT_POLLING
    polled: AtomicU32,
    park: AtomicBool,
    rendezvous: Arc<Rendezvous>,
}

fn storage(bytes: u32) -> Box<[AtomicU32]> {
    (0..bytes / 4).map(|_| AtomicU32::new(0)).collect()
}

impl Memory {
    pub(crate) fn new(rendezvous: Arc<Rendezvous>) -> Memory {
        Memory {
            ram: storage(RAM_SIZE),
            scratch: storage(SCRATCH_SIZE),
            bios: storage(BIOS_SIZE),
            tags: TagTable::new(),
            bios_unlocked: AtomicBool::new(false),
            dirty: Mutex::new(None),
            has_dirty: AtomicBool::new(false),
            polled: AtomicU32::new(NOT_POLLING),
            park: AtomicBool::new(false),
            rendezvous,
        }
    }

    fn words(&self, region: Region) -> Option<&[AtomicU32]> {
        match region {
            Region::Ram => Some(&self.ram),
            Region::Scratch => Some(&self.scratch),
            Region::Bios => Some(&self.bios),
            _ => None,
        }
    }

    /// Word containing `offset`. None for regions without storage.
    #[inline(always)]
    pub(crate) fn load(&self, region: Region, offset: u32) -> Option<u32> {
        self.words(region).map(|words| words[(offset >> 2) as usize].load(Ordering::Acquire))
    }

    /// Replaces the lanes of `mask` in the word containing `offset`. Returns false for regions
    /// without storage, or the BIOS while it is locked.
    pub(crate) fn store(&self, region: Region, offset: u32, value: u32, mask: ByteMask) -> bool {
        if region == Region::Bios && !self.bios_unlocked.load(Ordering::Acquire) {
            return false;
        }
        let Some(words) = self.words(region) else {
            return false;
        };
        let word = &words[(offset >> 2) as usize];
        if mask.is_word() {
            word.store(value, Ordering::Release);
        } else {
            // Only the execution thread writes sub-word, but keep it atomic anyway
            let _ = word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |mut current| {
                mask.masked_insert(&mut current, value);
                Some(current)
            });
        }
        self.after_store(region, offset);
        true
    }

    /// Notices stores to code (needs recompiling) and to the polled word (needs waking)
    fn after_store(&self, region: Region, offset: u32) {
        let physical = region.base() + (offset & !3);
        if self.tags.get(region, offset).contains(Tag::CODE) {
            self.tags.clear(region, offset, Tag::CODE);
            self.mark_dirty(physical..physical + 4);
        }
        self.wake_if_polled(physical);
    }

    pub(crate) fn mark_dirty(&self, range: Range<u32>) {
        let mut dirty = self.dirty.lock().expect("dirty code range poisoned");
        *dirty = Some(match dirty.take() {
            Some(existing) => existing.start.min(range.start)..existing.end.max(range.end),
            None => range,
        });
        self.has_dirty.store(true, Ordering::Release);
    }

    pub(crate) fn take_dirty(&self) -> Option<Range<u32>> {
        if !self.has_dirty.load(Ordering::Acquire) {
            return None;
        }
        let mut dirty = self.dirty.lock().expect("dirty code range poisoned");
        self.has_dirty.store(false, Ordering::Release);
        dirty.take()
    }

    pub(crate) fn bios_unlocked(&self) -> bool {
        self.bios_unlocked.load(Ordering::Acquire)
    }

    pub(crate) fn set_bios_unlocked(&self, unlocked: bool) {
        self.bios_unlocked.store(unlocked, Ordering::Release);
    }

    /// Asks for the execution thread to be parked on `physical`
    pub(crate) fn arm_poll(&self, physical: u32) {
        self.polled.store(physical & !3, Ordering::SeqCst);
        self.park.store(true, Ordering::SeqCst);
    }

    pub(crate) fn disarm_poll(&self) {
        self.polled.store(NOT_POLLING, Ordering::SeqCst);
        self.park.store(false, Ordering::SeqCst);
    }

    pub(crate) fn polled(&self) -> Option<u32> {
        let polled = self.polled.load(Ordering::SeqCst);
        (polled != NOT_POLLING).then_some(polled)
    }

    pub(crate) fn park_requested(&self) -> bool {
        self.park.load(Ordering::SeqCst)
    }

    /// Something changed the word at `physical`. If the execution thread is waiting on it, let
    /// it go.
    pub(crate) fn wake_if_polled(&self, physical: u32) {
        if self.polled.load(Ordering::SeqCst) == physical & !3 {
            tracing::debug!("polled word {:08x} changed, waking", physical);
            self.disarm_poll();
            self.rendezvous.cpu_thread_notify();
        }
    }
}

/// Side-effect free access to the machine's memory for bulk transfers and loaders. Cheap to
/// clone and usable from any thread.
///
/// Accesses don't tag and never reach hardware registers, but overwriting code still gets it
/// recompiled and writing a polled word still wakes the execution thread.
#[derive(Clone)]
pub struct MemoryHandle {
    pub(crate) memory: Arc<Memory>,
}

impl MemoryHandle {
    pub fn internal_read32(&self, address: u32) -> Result<u32, AddressError> {
        let (region, offset) = map::decode_sized(address & !3, 4)?;
        match region {
            Region::Param => Ok(!0),
            _ => self.memory.load(region, offset).ok_or(AddressError::NoStorage(address)),
        }
    }

    pub fn internal_write32(&self, address: u32, value: u32) -> Result<(), AddressError> {
        let (region, offset) = map::decode_sized(address & !3, 4)?;
        match region {
            Region::Param => Ok(()),
            Region::Bios if !self.memory.bios_unlocked() => {
                Err(AddressError::ReadOnly(address))
            }
            _ if self.memory.store(region, offset, value, ByteMask::WORD) => Ok(()),
            _ => Err(AddressError::NoStorage(address)),
        }
    }

    /// Copies `bytes` in starting at `address`, leaving the rest of any partly covered word alone
    pub fn write_bytes(&self, address: u32, bytes: &[u8]) -> Result<(), AddressError> {
        let size = u32::try_from(bytes.len()).map_err(|_| AddressError::Straddle { address, size: u32::MAX })?;
        map::decode_sized(address, size)?;

        let mut word_address = address & !3;
        let mut lane = (address & 3) as usize;
        let mut done = 0;
        while done < bytes.len() {
            let take = (4 - lane).min(bytes.len() - done);
            let mut word = if take == 4 {
                [0; 4]
            } else {
                self.internal_read32(word_address)?.to_le_bytes()
            };
            word[lane..lane + take].copy_from_slice(&bytes[done..done + take]);
            self.internal_write32(word_address, u32::from_le_bytes(word))?;
            done += take;
            lane = 0;
            word_address += 4;
        }
        Ok(())
    }

    pub fn read_bytes(&self, address: u32, len: u32) -> Result<Vec<u8>, AddressError> {
        map::decode_sized(address, len)?;
        let mut bytes = Vec::with_capacity(len as usize);
        let mut word_address = address & !3;
        while (bytes.len() as u32) < len + (address & 3) {
            bytes.extend_from_slice(&self.internal_read32(word_address)?.to_le_bytes());
            word_address += 4;
        }
        let start = (address & 3) as usize;
        Ok(bytes[start..start + len as usize].to_vec())
    }

    /// Tells a parked execution thread that the hardware register at `address` changed.
    /// Owners of poll32 registers call this whenever the value they return changes.
    pub fn register_changed(&self, address: u32) {
        self.memory.wake_if_polled(map::physical(address));
    }

    /// Runs `f` with the BIOS writable
    pub fn with_bios_unlocked<T>(&self, f: impl FnOnce(&MemoryHandle) -> T) -> T {
        self.memory.set_bios_unlocked(true);
        let result = f(self);
        self.memory.set_bios_unlocked(false);
        result
    }

    pub fn tag(&self, address: u32) -> Result<Tag, AddressError> {
        let (region, offset) = map::decode(address)?;
        Ok(self.memory.tags.get(region, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> MemoryHandle {
        MemoryHandle { memory: Arc::new(Memory::new(Arc::new(Rendezvous::new()))) }
    }

    #[test]
    fn bios_is_read_only_until_unlocked() {
        let memory = handle();
        assert_eq!(memory.internal_write32(0xbfc0_0000, 1), Err(AddressError::ReadOnly(0xbfc0_0000)));
        memory.with_bios_unlocked(|m| m.internal_write32(0xbfc0_0000, 1)).unwrap();
        assert_eq!(memory.internal_read32(0x1fc0_0000), Ok(1));
    }

    #[test]
    fn byte_copies_keep_neighbours() {
        let memory = handle();
        memory.internal_write32(0x104, 0xaabb_ccdd).unwrap();
        memory.write_bytes(0x100, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(memory.internal_read32(0x100), Ok(0x0403_0201));
        assert_eq!(memory.internal_read32(0x104), Ok(0xaabb_cc05));
        assert_eq!(memory.read_bytes(0x103, 3).unwrap(), vec![4, 5, 0xcc]);

        memory.write_bytes(0x101, &[9, 9]).unwrap();
        assert_eq!(memory.internal_read32(0x100), Ok(0x0409_0901));
    }

    #[test]
    fn overwriting_code_is_reported_once() {
        let memory = handle();
        memory.memory.tags.mark(Region::Ram, 0x200, Tag::CODE);
        memory.internal_write32(0x8000_0200, 0).unwrap();
        memory.internal_write32(0x8000_0200, 0).unwrap();
        assert_eq!(memory.memory.take_dirty(), Some(0x200..0x204));
        assert_eq!(memory.memory.take_dirty(), None);
    }

    #[test]
    fn hardware_has_no_storage() {
        let memory = handle();
        assert_eq!(memory.internal_read32(0x1f80_1070), Err(AddressError::NoStorage(0x1f80_1070)));
        assert_eq!(memory.internal_read32(0x1f00_0000), Ok(0xffff_ffff));
    }
}
