//! The CPU's view of the machine: RAM, scratchpad, BIOS, the parameter window and the hardware
//! register window, all resolved by masking.
//!
//! Every access made through the `Bus` interface is tagged. Two things come out of the tags:
//! stores to words previously fetched as code are reported to the compiler as dirty ranges, and
//! a tight loop that does nothing but read one word is recognised as a busy-wait, so the
//! execution thread can park instead of spinning.

use std::ops::Range;
use std::sync::Arc;

use common::util::ByteMask;
use r3000::{Bus, Exception};
use timing::Rendezvous;

use crate::interrupts::InterruptController;
use crate::{AddressError, ConfigError};

mod hw;
pub mod map;
mod memory;
mod poll;
pub mod tags;

use hw::{Dispatch, HwTable};
use map::{Region, ResolvedAddress, BIOS_BASE, BIOS_SIZE};
use memory::Memory;
pub use memory::MemoryHandle;
pub use poll::{PollConfig, PollDetector};
pub use tags::Tag;

pub struct AddressSpace {
    memory: Arc<Memory>,
    hw: HwTable,
    poll: PollDetector,
    writes_enabled: bool,
    cache_control: u32,
    interrupts: Option<Arc<InterruptController>>,
}

/// Picks the bytes of an access out of the word holding it
#[inline(always)]
fn lane(word: u32, offset: u32, width: u32) -> u32 {
    let mask = ByteMask::new(width, offset & 3);
    mask.apply(word) >> mask.shift()
}

impl AddressSpace {
    pub fn new(poll: PollConfig, rendezvous: Arc<Rendezvous>) -> AddressSpace {
        AddressSpace {
            memory: Arc::new(Memory::new(rendezvous)),
            hw: HwTable::new(),
            poll: PollDetector::new(poll),
            writes_enabled: true,
            cache_control: 0,
            interrupts: None,
        }
    }

    /// Handle for bulk access from other components and threads
    pub fn memory(&self) -> MemoryHandle {
        MemoryHandle { memory: self.memory.clone() }
    }

    /// Where Cause.IP2 comes from
    pub fn attach_interrupts(&mut self, interrupts: Arc<InterruptController>) {
        self.interrupts = Some(interrupts);
    }

    /// Resolves a single byte
    pub fn resolve(&self, address: u32, result: &mut ResolvedAddress) -> Result<(), AddressError> {
        let (region, offset) = map::decode(address)?;
        self.fill(region, offset, result);
        Ok(())
    }

    /// Resolves `[address, address + size)`, which has to lie entirely inside one region
    pub fn resolve_sized(&self, address: u32, size: u32, write: bool, result: &mut ResolvedAddress) -> Result<(), AddressError> {
        let (region, offset) = map::decode_sized(address, size)?;
        if write && region == Region::Bios && !self.memory.bios_unlocked() {
            return Err(AddressError::ReadOnly(address));
        }
        self.fill(region, offset, result);
        Ok(())
    }

    fn fill(&self, region: Region, offset: u32, result: &mut ResolvedAddress) {
        result.region = region;
        result.offset = offset;
        result.low_bits = offset & 3;
        result.tag = region.tag() | self.memory.tags.get(region, offset);
    }

    pub fn internal_read32(&self, address: u32) -> Result<u32, AddressError> {
        self.memory().internal_read32(address)
    }

    pub fn internal_write32(&self, address: u32, value: u32) -> Result<(), AddressError> {
        self.memory().internal_write32(address, value)
    }

    pub fn load_bios(&self, image: &[u8]) -> Result<(), ConfigError> {
        if image.len() != BIOS_SIZE as usize {
            return Err(ConfigError::BiosSize(image.len()));
        }
        self.memory().with_bios_unlocked(|memory| memory.write_bytes(BIOS_BASE, image))?;
        tracing::info!("loaded {}KiB BIOS", image.len() / 1024);
        Ok(())
    }

    pub fn tag(&self, address: u32) -> Result<Tag, AddressError> {
        let (region, offset) = map::decode(address)?;
        Ok(self.memory.tags.get(region, offset))
    }

    /// Forgets `tag` everywhere
    pub fn clear_tags(&self, tag: Tag) {
        self.memory.tags.clear_all(tag);
    }

    pub fn writes_enabled(&self) -> bool {
        self.writes_enabled
    }

    /// Word the execution thread wants to park on, if a busy-wait was recognised
    pub fn poll_address(&self) -> Option<u32> {
        self.memory.polled()
    }

    /// Drops a park request, after parking or if it is no longer wanted
    pub fn unpark(&self) {
        self.memory.disarm_poll();
    }

    pub fn register_read32_callback(&mut self, address: u32, allow_sub_width: bool,
        handler: impl FnMut(u32) -> u32 + Send + 'static) -> Result<(), ConfigError>
    {
        self.hw.add_read(address, 4, allow_sub_width, false, Box::new(handler))
    }

    pub fn register_read16_callback(&mut self, address: u32, allow_sub_width: bool,
        mut handler: impl FnMut(u32) -> u16 + Send + 'static) -> Result<(), ConfigError>
    {
        self.hw.add_read(address, 2, allow_sub_width, false, Box::new(move |address| handler(address) as u32))
    }

    pub fn register_read8_callback(&mut self, address: u32,
        mut handler: impl FnMut(u32) -> u8 + Send + 'static) -> Result<(), ConfigError>
    {
        self.hw.add_read(address, 1, false, false, Box::new(move |address| handler(address) as u32))
    }

    /// A 32-bit register that is safe to park on while the guest polls it: its owner calls
    /// `MemoryHandle::register_changed` whenever the value it returns changes.
    pub fn register_poll32_callback(&mut self, address: u32, allow_sub_width: bool,
        handler: impl FnMut(u32) -> u32 + Send + 'static) -> Result<(), ConfigError>
    {
        self.hw.add_read(address, 4, allow_sub_width, true, Box::new(handler))
    }

    /// The handler gets the register address, the written value in the lanes the access covers,
    /// and a mask of those lanes.
    pub fn register_write32_callback(&mut self, address: u32, allow_sub_width: bool,
        handler: impl FnMut(u32, u32, ByteMask) + Send + 'static) -> Result<(), ConfigError>
    {
        self.hw.add_write(address, 4, allow_sub_width, Box::new(handler))
    }

    pub fn register_write16_callback(&mut self, address: u32, allow_sub_width: bool,
        mut handler: impl FnMut(u32, u16, ByteMask) + Send + 'static) -> Result<(), ConfigError>
    {
        self.hw.add_write(address, 2, allow_sub_width,
            Box::new(move |address, value, mask| handler(address, value as u16, mask)))
    }

    pub fn register_write8_callback(&mut self, address: u32,
        mut handler: impl FnMut(u32, u8) + Send + 'static) -> Result<(), ConfigError>
    {
        self.hw.add_write(address, 1, false, Box::new(move |address, value, _| handler(address, value as u8)))
    }

    fn read(&mut self, pc: u32, address: u32, width: u32) -> Result<u32, Exception> {
        let (region, offset) = map::decode(address).map_err(|_| Exception::BusData(address))?;
        self.memory.tags.mark(region, offset, region.tag());

        let value = match region {
            Region::Ram | Region::Scratch | Region::Bios => {
                let word = self.memory.load(region, offset).ok_or(Exception::BusData(address))?;
                lane(word, offset, width)
            }
            Region::Param => lane(!0, offset, width),
            Region::CacheControl => 0,
            Region::Hw => match self.hw.read(offset, width) {
                Dispatch::Handled(value) => value,
                Dispatch::WrongWidth => {
                    tracing::debug!("{}-bit read of {:08x} at {:08x} has the wrong width", width * 8, address, pc);
                    return Err(Exception::BusData(address));
                }
                Dispatch::Unhandled => {
                    if self.hw.first_warning(address) {
                        tracing::warn!("unhandled {}-bit read of {:08x} at {:08x}", width * 8, address, pc);
                    }
                    0
                }
            },
        };

        if self.poll.read(region.base() + offset) {
            self.busy_wait(region, offset, width, value);
        }
        Ok(value)
    }

    /// The guest is spinning on a read of `offset`, which just returned `value`
    fn busy_wait(&mut self, region: Region, offset: u32, width: u32, value: u32) {
        let physical = region.base() + offset;
        let before = self.memory.tags.mark(region, offset, Tag::POLL);
        if !before.contains(Tag::POLL) {
            tracing::debug!("busy-wait on {:08x} recognised", physical);
        }

        // Only park where something is guaranteed to wake us
        let parkable = match region {
            Region::Ram | Region::Scratch => true,
            Region::Hw => self.hw.poll_safe(offset),
            _ => false,
        };
        if !parkable || self.memory.park_requested() {
            return;
        }

        self.memory.arm_poll(physical);
        // A writer that landed between the read and arming would not have seen us polling
        let again = match region {
            Region::Hw => match self.hw.read(offset, width) {
                Dispatch::Handled(value) => value,
                _ => value,
            },
            _ => self.memory.load(region, offset).map_or(value, |word| lane(word, offset, width)),
        };
        if again != value {
            self.memory.disarm_poll();
        }
    }

    fn write(&mut self, pc: u32, address: u32, width: u32, value: u32) -> Result<(), Exception> {
        let (region, offset) = map::decode(address).map_err(|_| Exception::BusData(address))?;
        self.poll.write();
        self.memory.tags.mark(region, offset, region.tag());

        let mask = ByteMask::new(width, offset & 3);
        let value = mask.apply(value << mask.shift());
        match region {
            Region::Ram if !self.writes_enabled => {
                // Cache isolated, the store lands in the i-cache
            }
            Region::Ram | Region::Scratch => {
                self.memory.store(region, offset, value, mask);
            }
            Region::Bios => {
                if !self.memory.store(region, offset, value, mask) {
                    tracing::debug!("dropped write to BIOS {:08x} at {:08x}", address, pc);
                }
            }
            Region::Param => {}
            Region::CacheControl => mask.masked_insert(&mut self.cache_control, value),
            Region::Hw => match self.hw.write(offset, width, value >> mask.shift()) {
                Dispatch::Handled(()) => {}
                Dispatch::WrongWidth => {
                    tracing::debug!("{}-bit write of {:08x} at {:08x} has the wrong width", width * 8, address, pc);
                    return Err(Exception::BusData(address));
                }
                Dispatch::Unhandled => {
                    if self.hw.first_warning(address) {
                        tracing::warn!("unhandled {}-bit write of {:08x} to {:08x} at {:08x}",
                            width * 8, value >> mask.shift(), address, pc);
                    }
                }
            },
        }
        Ok(())
    }
}

impl Bus for AddressSpace {
    fn fetch(&mut self, pc: u32) -> Result<u32, Exception> {
        let (region, offset) = map::decode(pc).map_err(|_| Exception::BusInstruction(pc))?;
        if !region.is_memory() {
            return Err(Exception::BusInstruction(pc));
        }
        self.poll.fetch();
        self.memory.tags.mark(region, offset, region.tag() | Tag::CODE);
        self.memory.load(region, offset).ok_or(Exception::BusInstruction(pc))
    }

    fn read8(&mut self, pc: u32, address: u32) -> Result<u8, Exception> {
        self.read(pc, address, 1).map(|v| v as u8)
    }

    fn read16(&mut self, pc: u32, address: u32) -> Result<u16, Exception> {
        self.read(pc, address, 2).map(|v| v as u16)
    }

    fn read32(&mut self, pc: u32, address: u32) -> Result<u32, Exception> {
        self.read(pc, address, 4)
    }

    fn write8(&mut self, pc: u32, address: u32, value: u8) -> Result<(), Exception> {
        self.write(pc, address, 1, value as u32)
    }

    fn write16(&mut self, pc: u32, address: u32, value: u16) -> Result<(), Exception> {
        self.write(pc, address, 2, value as u32)
    }

    fn write32(&mut self, pc: u32, address: u32, value: u32) -> Result<(), Exception> {
        self.write(pc, address, 4, value)
    }

    fn interrupt_pending(&self) -> bool {
        self.interrupts.as_ref().map_or(false, |interrupts| interrupts.pending())
    }

    fn enable_memory_write(&mut self, enabled: bool) {
        if enabled != self.writes_enabled {
            tracing::trace!("RAM writes {}", if enabled { "enabled" } else { "disabled" });
        }
        self.writes_enabled = enabled;
    }

    fn physical(&self, address: u32) -> u32 {
        map::physical(address)
    }

    fn take_dirty_code(&mut self) -> Option<Range<u32>> {
        self.memory.take_dirty()
    }

    fn clear_poll_counters(&mut self) {
        self.poll.clear();
    }

    fn park_requested(&self) -> bool {
        self.memory.park_requested()
    }
}
