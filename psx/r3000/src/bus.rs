use std::ops::Range;

use crate::Exception;

/// Everything the CPU core needs from the machine it is plugged into.
///
/// Every access carries the PC of the instruction making it, so the address space can tag it.
/// Reads and writes are always naturally aligned by the time they get here; the CPU raises the
/// address errors itself.
pub trait Bus {
    /// Instruction fetch. Marks the word as code.
    fn fetch(&mut self, pc: u32) -> Result<u32, Exception>;

    fn read8(&mut self, pc: u32, address: u32) -> Result<u8, Exception>;
    fn read16(&mut self, pc: u32, address: u32) -> Result<u16, Exception>;
    fn read32(&mut self, pc: u32, address: u32) -> Result<u32, Exception>;

    fn write8(&mut self, pc: u32, address: u32, value: u8) -> Result<(), Exception>;
    fn write16(&mut self, pc: u32, address: u32, value: u16) -> Result<(), Exception>;
    fn write32(&mut self, pc: u32, address: u32, value: u32) -> Result<(), Exception>;

    /// Level of the interrupt line feeding Cause.IP2
    fn interrupt_pending(&self) -> bool;

    /// Cache isolation: while disabled, stores to RAM are dropped
    fn enable_memory_write(&mut self, enabled: bool);

    /// Canonical physical address, so mirrors of the same storage compare equal
    fn physical(&self, address: u32) -> u32 {
        address & 0x1fff_ffff
    }

    /// Physical range of code words overwritten since the last call
    fn take_dirty_code(&mut self) -> Option<Range<u32>>;

    /// Forget partial busy-wait detection, after control flow jumped somewhere unexpected
    fn clear_poll_counters(&mut self);

    /// A busy-wait was recognised and the execution thread should park
    fn park_requested(&self) -> bool;
}
