//! Dispatch table for the hardware register window.
//!
//! Every handler is registered at its own address with its native width. A narrower access
//! inside a wider handler only reaches it if the handler was registered with `allow_sub_width`;
//! otherwise it is a bus error, same as the hardware when a register is poked with the wrong
//! width. Nothing registered at all means an unhandled register: reads give zero and writes are
//! dropped, with a warning the first time each address is seen.

use std::collections::HashSet;

use common::util::ByteMask;

use crate::ConfigError;
use super::map::{HW_BASE, HW_SIZE};

pub type ReadFn = Box<dyn FnMut(u32) -> u32 + Send>;
pub type WriteFn = Box<dyn FnMut(u32, u32, ByteMask) + Send>;

struct ReadEntry {
    width: u32,
    allow_sub_width: bool,
    /// The owner wakes the execution thread whenever the value changes
    poll_safe: bool,
    handler: ReadFn,
}

struct WriteEntry {
    width: u32,
    allow_sub_width: bool,
    handler: WriteFn,
}

trait Width {
    fn width(&self) -> u32;
}

impl Width for ReadEntry {
    fn width(&self) -> u32 {
        self.width
    }
}

impl Width for WriteEntry {
    fn width(&self) -> u32 {
        self.width
    }
}

/// What a hardware access turned into
pub enum Dispatch<T> {
    Handled(T),
    /// Nothing registered there
    Unhandled,
    /// A handler is there but doesn't take accesses of this width
    WrongWidth,
}

pub struct HwTable {
    reads: Vec<Option<ReadEntry>>,
    writes: Vec<Option<WriteEntry>>,
    warned: HashSet<u32>,
}

/// The registered entry covering `[offset, offset + width)`, and where it starts
fn covering<E: Width>(table: &[Option<E>], offset: u32, width: u32) -> Option<(u32, &E)> {
    [offset, offset & !1, offset & !3]
        .into_iter()
        .filter_map(|base| table[base as usize].as_ref().map(|entry| (base, entry)))
        .find(|(base, entry)| base + entry.width() >= offset + width)
}

/// Makes sure a `width` byte handler at `offset` doesn't overlap anything
fn check_free<E: Width>(table: &[Option<E>], offset: u32, width: u32, kind: &'static str) -> Result<(), ConfigError> {
    let address = HW_BASE + offset;
    if offset % width != 0 || offset + width > HW_SIZE {
        return Err(ConfigError::NotHardware(address));
    }
    if let Some(existing) = &table[offset as usize] {
        if existing.width() == width {
            return Err(ConfigError::DuplicateCallback { address, kind });
        }
    }
    let word = offset & !3;
    for base in word..word + 4 {
        if let Some(existing) = &table[base as usize] {
            let overlaps = base < offset + width && offset < base + existing.width();
            if overlaps {
                return Err(ConfigError::WidthConflict {
                    address,
                    kind,
                    existing: HW_BASE + base,
                    width: existing.width() * 8,
                });
            }
        }
    }
    Ok(())
}

fn hw_offset(address: u32) -> Result<u32, ConfigError> {
    let physical = super::map::physical(address);
    if (HW_BASE..HW_BASE + HW_SIZE).contains(&physical) {
        Ok(physical - HW_BASE)
    } else {
        Err(ConfigError::NotHardware(address))
    }
}

impl HwTable {
    pub fn new() -> HwTable {
        HwTable {
            reads: (0..HW_SIZE).map(|_| None).collect(),
            writes: (0..HW_SIZE).map(|_| None).collect(),
            warned: HashSet::new(),
        }
    }

    pub fn add_read(&mut self, address: u32, width: u32, allow_sub_width: bool, poll_safe: bool, handler: ReadFn) -> Result<(), ConfigError> {
        let offset = hw_offset(address)?;
        check_free(&self.reads, offset, width, "read")?;
        self.reads[offset as usize] = Some(ReadEntry { width, allow_sub_width, poll_safe, handler });
        Ok(())
    }

    pub fn add_write(&mut self, address: u32, width: u32, allow_sub_width: bool, handler: WriteFn) -> Result<(), ConfigError> {
        let offset = hw_offset(address)?;
        check_free(&self.writes, offset, width, "write")?;
        self.writes[offset as usize] = Some(WriteEntry { width, allow_sub_width, handler });
        Ok(())
    }

    /// `offset` is relative to the start of the window. The value comes back in the low bits.
    pub fn read(&mut self, offset: u32, width: u32) -> Dispatch<u32> {
        let base = match covering(&self.reads, offset, width) {
            Some((base, entry)) if entry.width == width || entry.allow_sub_width => base,
            Some(_) => return Dispatch::WrongWidth,
            None => return Dispatch::Unhandled,
        };
        let Some(entry) = self.reads[base as usize].as_mut() else {
            return Dispatch::Unhandled;
        };
        let value = (entry.handler)(HW_BASE + base);
        let mask = ByteMask::new(width, offset - base);
        Dispatch::Handled(mask.apply(value) >> mask.shift())
    }

    /// `value` is in the low bits. Handlers see it moved into the lanes the access covers.
    pub fn write(&mut self, offset: u32, width: u32, value: u32) -> Dispatch<()> {
        let base = match covering(&self.writes, offset, width) {
            Some((base, entry)) if entry.width == width || entry.allow_sub_width => base,
            Some(_) => return Dispatch::WrongWidth,
            None => return Dispatch::Unhandled,
        };
        let Some(entry) = self.writes[base as usize].as_mut() else {
            return Dispatch::Unhandled;
        };
        let mask = ByteMask::new(width, offset - base);
        (entry.handler)(HW_BASE + base, mask.apply(value << mask.shift()), mask);
        Dispatch::Handled(())
    }

    /// True if a busy-wait on this register can safely park the execution thread
    pub fn poll_safe(&self, offset: u32) -> bool {
        covering(&self.reads, offset & !3, 1)
            .map_or(false, |(_, entry)| entry.poll_safe)
    }

    /// True the first time it is asked about `address`
    pub fn first_warning(&mut self, address: u32) -> bool {
        self.warned.insert(address)
    }
}

impl Default for HwTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn sub_width_needs_permission() {
        let mut table = HwTable::new();
        table.add_read(0x1f80_1070, 4, true, false, Box::new(|_| 0x1234_5678)).unwrap();
        table.add_read(0x1f80_1074, 4, false, false, Box::new(|_| 0x1234_5678)).unwrap();

        assert!(matches!(table.read(0x72, 2), Dispatch::Handled(0x1234)));
        assert!(matches!(table.read(0x71, 1), Dispatch::Handled(0x56)));
        assert!(matches!(table.read(0x76, 2), Dispatch::WrongWidth));
        assert!(matches!(table.read(0x78, 4), Dispatch::Unhandled));
    }

    #[test]
    fn writes_arrive_in_their_lanes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut table = HwTable::new();
        let log = seen.clone();
        table.add_write(0x1f80_1070, 4, true, Box::new(move |address, value, mask| {
            log.lock().unwrap().push((address, value, mask.value()));
        })).unwrap();

        assert!(matches!(table.write(0x72, 1, 0xab), Dispatch::Handled(())));
        assert_eq!(seen.lock().unwrap()[0], (0x1f80_1070, 0x00ab_0000, 0x00ff_0000));
    }

    #[test]
    fn overlapping_registrations_are_rejected() {
        let mut table = HwTable::new();
        table.add_read(0x1f80_1070, 2, false, false, Box::new(|_| 0)).unwrap();
        assert!(matches!(
            table.add_read(0x1f80_1070, 2, false, false, Box::new(|_| 0)),
            Err(ConfigError::DuplicateCallback { .. })));
        assert!(matches!(
            table.add_read(0x1f80_1070, 4, false, false, Box::new(|_| 0)),
            Err(ConfigError::WidthConflict { .. })));
        assert!(matches!(
            table.add_read(0x1f80_1071, 1, false, false, Box::new(|_| 0)),
            Err(ConfigError::WidthConflict { .. })));
        table.add_read(0x1f80_1072, 2, false, false, Box::new(|_| 0)).unwrap();
        assert!(matches!(
            table.add_read(0x1f00_0000, 4, false, false, Box::new(|_| 0)),
            Err(ConfigError::NotHardware(_))));
    }
}
