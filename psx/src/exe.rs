//! PS-X EXE executables: a 2KiB header followed by the text image.

use r3000::RegFile;

use crate::address_space::map::{self, Region};
use crate::address_space::MemoryHandle;
use crate::{AddressError, ConfigError};

const MAGIC: &[u8; 8] = b"PS-X EXE";
const HEADER_SIZE: usize = 0x800;

/// Where the BIOS hands over to the shell. Executables are side-loaded when it gets there.
pub const SHELL_ENTRY: u32 = 0x8003_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executable {
    pub pc: u32,
    pub gp: u32,
    pub load_address: u32,
    /// Initial stack pointer, if the header asks for one
    pub sp: Option<u32>,
    pub bss_address: u32,
    pub bss_size: u32,
    pub text: Vec<u8>,
}

fn word(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}

impl Executable {
    pub fn parse(bytes: &[u8]) -> Result<Executable, ConfigError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ConfigError::MalformedExe("shorter than its header"));
        }
        if &bytes[..8] != MAGIC {
            return Err(ConfigError::MalformedExe("bad magic"));
        }

        let text_size = word(bytes, 0x1c) as usize;
        let available = bytes.len() - HEADER_SIZE;
        if text_size > available {
            return Err(ConfigError::MalformedExe("text runs past the end of the file"));
        }

        let load_address = word(bytes, 0x18);
        let in_ram = |address: u32, size: u32| {
            size == 0 || matches!(map::decode_sized(address, size), Ok((Region::Ram, _)))
        };
        if load_address & 3 != 0 || !in_ram(load_address, text_size as u32) {
            return Err(ConfigError::MalformedExe("text does not fit in RAM"));
        }

        let bss_address = word(bytes, 0x28);
        let bss_size = word(bytes, 0x2c);
        if !in_ram(bss_address, bss_size) {
            return Err(ConfigError::MalformedExe("bss does not fit in RAM"));
        }

        let sp_base = word(bytes, 0x30);
        let sp = (sp_base != 0).then(|| sp_base.wrapping_add(word(bytes, 0x34)));

        Ok(Executable {
            pc: word(bytes, 0x10),
            gp: word(bytes, 0x14),
            load_address,
            sp,
            bss_address,
            bss_size,
            text: bytes[HEADER_SIZE..HEADER_SIZE + text_size].to_vec(),
        })
    }

    /// Copies the text into RAM and zeroes the bss
    pub fn load(&self, memory: &MemoryHandle) -> Result<(), AddressError> {
        memory.write_bytes(self.load_address, &self.text)?;
        if self.bss_size != 0 {
            memory.write_bytes(self.bss_address, &vec![0; self.bss_size as usize])?;
        }
        tracing::info!("loaded {} bytes of text at {:08x}, entry {:08x}", self.text.len(), self.load_address, self.pc);
        Ok(())
    }

    /// Points the register file at the entry point
    pub fn apply(&self, regs: &mut RegFile) {
        regs.jump(self.pc);
        regs.write(28, self.gp);
        if let Some(sp) = self.sp {
            regs.write(29, sp);
            regs.write(30, sp);
        }
    }
}

#[cfg(test)]
pub(crate) fn build(pc: u32, load_address: u32, text: &[u32]) -> Vec<u8> {
    let mut bytes = vec![0; HEADER_SIZE];
    bytes[..8].copy_from_slice(MAGIC);
    bytes[0x10..0x14].copy_from_slice(&pc.to_le_bytes());
    bytes[0x18..0x1c].copy_from_slice(&load_address.to_le_bytes());
    bytes[0x1c..0x20].copy_from_slice(&(text.len() as u32 * 4).to_le_bytes());
    bytes[0x30..0x34].copy_from_slice(&0x801f_fff0u32.to_le_bytes());
    for word in text {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use timing::Rendezvous;

    use super::*;
    use crate::address_space::{AddressSpace, PollConfig};

    #[test]
    fn parses_and_loads() {
        let bytes = build(0x8001_0000, 0x8001_0000, &[0x2408_0001, 0x0000_0000]);
        let exe = Executable::parse(&bytes).unwrap();
        assert_eq!(exe.pc, 0x8001_0000);
        assert_eq!(exe.sp, Some(0x801f_fff0));
        assert_eq!(exe.text.len(), 8);

        let space = AddressSpace::new(PollConfig::default(), Arc::new(Rendezvous::new()));
        exe.load(&space.memory()).unwrap();
        assert_eq!(space.internal_read32(0x1_0000), Ok(0x2408_0001));

        let mut regs = RegFile::new();
        exe.apply(&mut regs);
        assert_eq!(regs.pc, 0x8001_0000);
        assert_eq!(regs.read(29), 0x801f_fff0);
    }

    #[test]
    fn rejects_malformed_images() {
        assert!(matches!(Executable::parse(&[0; 16]), Err(ConfigError::MalformedExe(_))));

        let mut bytes = build(0x8001_0000, 0x8001_0000, &[0]);
        bytes[0] = b'X';
        assert!(matches!(Executable::parse(&bytes), Err(ConfigError::MalformedExe("bad magic"))));

        let mut bytes = build(0x8001_0000, 0x8001_0000, &[0]);
        bytes[0x1c] = 0x40;
        assert!(matches!(Executable::parse(&bytes), Err(ConfigError::MalformedExe(_))));

        let bytes = build(0x8001_0000, 0xbfc0_0000, &[0]);
        assert!(matches!(Executable::parse(&bytes), Err(ConfigError::MalformedExe("text does not fit in RAM"))));
    }
}
