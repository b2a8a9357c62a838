//! A flat little-endian RAM bus and a tiny assembler for unit tests.

use std::ops::Range;

use crate::{Bus, Exception};

pub struct FlatBus {
    words: Vec<u32>,
    code: Vec<bool>,
    dirty: Option<Range<u32>>,
    pub irq: bool,
    pub park: bool,
    pub writes_enabled: bool,
    pub poll_clears: u32,
}

impl FlatBus {
    pub fn new(bytes: usize) -> FlatBus {
        FlatBus {
            words: vec![0; bytes / 4],
            code: vec![false; bytes / 4],
            dirty: None,
            irq: false,
            park: false,
            writes_enabled: true,
            poll_clears: 0,
        }
    }

    /// Writes a program starting at `address`, without touching tags
    pub fn load(&mut self, address: u32, program: &[u32]) {
        for (i, word) in program.iter().enumerate() {
            self.poke32(address + i as u32 * 4, *word);
        }
    }

    pub fn poke32(&mut self, address: u32, value: u32) {
        let index = self.index(address).expect("poke outside test memory");
        self.words[index] = value;
    }

    pub fn peek32(&self, address: u32) -> u32 {
        self.words[self.index(address).expect("peek outside test memory")]
    }

    fn index(&self, address: u32) -> Option<usize> {
        let index = ((address & 0x1fff_ffff) >> 2) as usize;
        (index < self.words.len()).then_some(index)
    }

    fn word(&self, address: u32) -> Result<u32, Exception> {
        self.index(address).map(|i| self.words[i]).ok_or(Exception::BusData(address))
    }

    fn store(&mut self, address: u32, value: u32, mask: u32) -> Result<(), Exception> {
        let index = self.index(address).ok_or(Exception::BusData(address))?;
        if !self.writes_enabled {
            return Ok(());
        }
        self.words[index] = (self.words[index] & !mask) | (value & mask);
        if self.code[index] {
            self.code[index] = false;
            let physical = (index * 4) as u32;
            self.dirty = Some(match self.dirty.take() {
                Some(range) => range.start.min(physical)..range.end.max(physical + 4),
                None => physical..physical + 4,
            });
        }
        Ok(())
    }
}

impl Bus for FlatBus {
    fn fetch(&mut self, pc: u32) -> Result<u32, Exception> {
        let index = self.index(pc).ok_or(Exception::BusInstruction(pc))?;
        self.code[index] = true;
        Ok(self.words[index])
    }

    fn read8(&mut self, _pc: u32, address: u32) -> Result<u8, Exception> {
        Ok((self.word(address)? >> ((address & 3) * 8)) as u8)
    }

    fn read16(&mut self, _pc: u32, address: u32) -> Result<u16, Exception> {
        Ok((self.word(address)? >> ((address & 2) * 8)) as u16)
    }

    fn read32(&mut self, _pc: u32, address: u32) -> Result<u32, Exception> {
        self.word(address)
    }

    fn write8(&mut self, _pc: u32, address: u32, value: u8) -> Result<(), Exception> {
        let shift = (address & 3) * 8;
        self.store(address, (value as u32) << shift, 0xff << shift)
    }

    fn write16(&mut self, _pc: u32, address: u32, value: u16) -> Result<(), Exception> {
        let shift = (address & 2) * 8;
        self.store(address, (value as u32) << shift, 0xffff << shift)
    }

    fn write32(&mut self, _pc: u32, address: u32, value: u32) -> Result<(), Exception> {
        self.store(address, value, 0xffff_ffff)
    }

    fn interrupt_pending(&self) -> bool {
        self.irq
    }

    fn enable_memory_write(&mut self, enabled: bool) {
        self.writes_enabled = enabled;
    }

    fn take_dirty_code(&mut self) -> Option<Range<u32>> {
        self.dirty.take()
    }

    fn clear_poll_counters(&mut self) {
        self.poll_clears += 1;
    }

    fn park_requested(&self) -> bool {
        self.park
    }
}
