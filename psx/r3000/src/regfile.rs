use crate::instructions::MIPS_REG_NAMES;

/// Where the R3000 starts executing after reset
pub const RESET_VECTOR: u32 = 0xbfc0_0000;

/// The canonical architectural register state.
///
/// `pc` is the instruction about to execute and `next_pc` the one after it, which is how branch
/// delay slots fall out: a branch only ever rewrites `next_pc`.
#[derive(Clone, PartialEq, Eq)]
pub struct RegFile {
    regs: [u32; 32],
    pub pc: u32,
    pub next_pc: u32,
    /// The instruction at `pc` sits in a branch delay slot
    pub delay_slot: bool,
    pub hi: u32,
    pub lo: u32,
}

impl RegFile {
    pub fn new() -> RegFile {
        RegFile {
            regs: [0; 32],
            pc: RESET_VECTOR,
            next_pc: RESET_VECTOR.wrapping_add(4),
            delay_slot: false,
            hi: 0,
            lo: 0,
        }
    }

    #[inline(always)]
    pub fn read(&self, reg: u8) -> u32 {
        self.regs[reg as usize & 31]
    }

    #[inline(always)]
    pub fn write(&mut self, reg: u8, val: u32) {
        if reg != 0 {
            self.regs[reg as usize & 31] = val;
        }
    }

    /// Redirects execution to `pc`, discarding any pending delay slot
    pub fn jump(&mut self, pc: u32) {
        self.pc = pc;
        self.next_pc = pc.wrapping_add(4);
        self.delay_slot = false;
    }

    pub fn gprs(&self) -> &[u32; 32] {
        &self.regs
    }
}

impl Default for RegFile {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RegFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "pc: {:08x} next: {:08x}{}", self.pc, self.next_pc, if self.delay_slot { " (delay slot)" } else { "" })?;
        for (i, chunk) in self.regs.chunks(4).enumerate() {
            for (j, value) in chunk.iter().enumerate() {
                write!(f, "{:>5}: {:08x}  ", MIPS_REG_NAMES[i * 4 + j], value)?;
            }
            writeln!(f)?;
        }
        write!(f, "   hi: {:08x}     lo: {:08x}", self.hi, self.lo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_register_is_hardwired() {
        let mut regs = RegFile::new();
        regs.write(0, 0xdead_beef);
        regs.write(31, 0x1234);
        assert_eq!(regs.read(0), 0);
        assert_eq!(regs.read(31), 0x1234);
    }

    #[test]
    fn jump_clears_delay_slot() {
        let mut regs = RegFile::new();
        regs.delay_slot = true;
        regs.jump(0x8000_0080);
        assert_eq!((regs.pc, regs.next_pc, regs.delay_slot), (0x8000_0080, 0x8000_0084, false));
    }
}
