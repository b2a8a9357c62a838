//! System control coprocessor: status, cause and the exception entry/return sequence.

use crate::exception::Exception;

pub const COP0_REG_NAMES: [&str; 32] = [
    "r0", "r1", "r2", "BPC", "r4", "BDA", "JUMPDEST", "DCIC",
    "BadVAddr", "BDAM", "r10", "BPCM", "SR", "Cause", "EPC", "PRId",
    "r16", "r17", "r18", "r19", "r20", "r21", "r22", "r23",
    "r24", "r25", "r26", "r27", "r28", "r29", "r30", "r31",
];

pub const BAD_VADDR: u8 = 8;
pub const SR: u8 = 12;
pub const CAUSE: u8 = 13;
pub const EPC: u8 = 14;
pub const PRID: u8 = 15;

/// R3000A
const PRID_VALUE: u32 = 0x0000_0002;

const SR_IEC: u32 = 1 << 0;
const SR_ISC: u32 = 1 << 16;
const SR_BEV: u32 = 1 << 22;
const SR_CU0: u32 = 1 << 28;

/// Hardware interrupt line 0, which the interrupt controller drives
const CAUSE_IP2: u32 = 1 << 10;
/// Software interrupt bits are the only guest-writable part of Cause
const CAUSE_SW: u32 = 0x0300;
const CAUSE_BD: u32 = 1 << 31;

const GENERAL_VECTOR: u32 = 0x8000_0080;
const BOOT_VECTOR: u32 = 0xbfc0_0180;

pub struct Cop0 {
    regs: [u32; 32],
}

impl Cop0 {
    pub fn new() -> Cop0 {
        let mut regs = [0; 32];
        regs[SR as usize] = SR_BEV;
        regs[PRID as usize] = PRID_VALUE;
        Cop0 { regs }
    }

    pub fn read(&self, reg: u8) -> u32 {
        self.regs[reg as usize & 31]
    }

    /// MTC0. Returns true if the write changed cache isolation.
    pub fn write(&mut self, reg: u8, value: u32) -> bool {
        match reg {
            SR => {
                let old = self.regs[SR as usize];
                self.regs[SR as usize] = value;
                (old ^ value) & SR_ISC != 0
            }
            CAUSE => {
                let cause = &mut self.regs[CAUSE as usize];
                *cause = (*cause & !CAUSE_SW) | (value & CAUSE_SW);
                false
            }
            // read only
            BAD_VADDR | PRID => false,
            reg => {
                self.regs[reg as usize & 31] = value;
                false
            }
        }
    }

    pub fn sr(&self) -> u32 {
        self.regs[SR as usize]
    }

    pub fn cause(&self) -> u32 {
        self.regs[CAUSE as usize]
    }

    pub fn epc(&self) -> u32 {
        self.regs[EPC as usize]
    }

    /// Status.IsC: loads and stores hit the (isolated) cache instead of memory
    pub fn cache_isolated(&self) -> bool {
        self.sr() & SR_ISC != 0
    }

    pub fn coprocessor_usable(&self, cop: u8) -> bool {
        cop == 0 || self.sr() & (SR_CU0 << cop) != 0
    }

    /// Mirrors the interrupt controller's output onto Cause.IP2
    pub fn set_interrupt_line(&mut self, pending: bool) {
        let cause = &mut self.regs[CAUSE as usize];
        if pending {
            *cause |= CAUSE_IP2;
        } else {
            *cause &= !CAUSE_IP2;
        }
    }

    /// An interrupt will be taken before the next instruction
    pub fn interrupt_enabled(&self) -> bool {
        let sr = self.sr();
        sr & SR_IEC != 0 && sr & self.cause() & 0xff00 != 0
    }

    /// Exception entry. `pc` is the faulting instruction. Returns the vector to continue at.
    pub fn enter_exception(&mut self, exception: Exception, pc: u32, delay_slot: bool) -> u32 {
        // Push a new kernel mode, interrupts off, level onto the KU/IE stack
        let sr = self.sr();
        self.regs[SR as usize] = (sr & !0x3f) | ((sr << 2) & 0x3f);

        let mut cause = self.cause() & !(CAUSE_BD | 0x7c | (3 << 28));
        cause |= exception.code() << 2;
        if let Exception::CoprocessorUnusable(cop) = exception {
            cause |= (cop as u32 & 3) << 28;
        }
        if delay_slot {
            cause |= CAUSE_BD;
            self.regs[EPC as usize] = pc.wrapping_sub(4);
        } else {
            self.regs[EPC as usize] = pc;
        }
        self.regs[CAUSE as usize] = cause;

        if let Some(addr) = exception.bad_vaddr() {
            self.regs[BAD_VADDR as usize] = addr;
        }

        if sr & SR_BEV != 0 {
            BOOT_VECTOR
        } else {
            GENERAL_VECTOR
        }
    }

    /// RFE pops the KU/IE stack
    pub fn rfe(&mut self) {
        let sr = self.sr();
        self.regs[SR as usize] = (sr & !0xf) | ((sr >> 2) & 0xf);
    }
}

impl Default for Cop0 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_entry_and_return() {
        let mut cop0 = Cop0::new();
        cop0.write(SR, 0x0000_0401); // IM2 | IEc, BEV clear

        let vector = cop0.enter_exception(Exception::Syscall, 0x8001_0010, false);
        assert_eq!(vector, GENERAL_VECTOR);
        assert_eq!(cop0.epc(), 0x8001_0010);
        assert_eq!((cop0.cause() >> 2) & 0x1f, 8);
        assert_eq!(cop0.sr() & 0x3f, 0x04);

        cop0.rfe();
        assert_eq!(cop0.sr() & 0x3f, 0x01);
    }

    #[test]
    fn delay_slot_exceptions_point_at_the_branch() {
        let mut cop0 = Cop0::new();
        let vector = cop0.enter_exception(Exception::AddressLoad(0x1235), 0x8001_0014, true);
        assert_eq!(vector, BOOT_VECTOR);
        assert_eq!(cop0.epc(), 0x8001_0010);
        assert_ne!(cop0.cause() & CAUSE_BD, 0);
        assert_eq!(cop0.read(BAD_VADDR), 0x1235);
    }

    #[test]
    fn interrupt_gating() {
        let mut cop0 = Cop0::new();
        cop0.set_interrupt_line(true);
        assert!(!cop0.interrupt_enabled());
        cop0.write(SR, 0x0000_0401);
        assert!(cop0.interrupt_enabled());
        cop0.set_interrupt_line(false);
        assert!(!cop0.interrupt_enabled());
    }

    #[test]
    fn cause_is_mostly_read_only() {
        let mut cop0 = Cop0::new();
        cop0.write(CAUSE, 0xffff_ffff);
        assert_eq!(cop0.cause(), CAUSE_SW);
        assert!(cop0.write(SR, SR_ISC));
        assert!(cop0.cache_isolated());
    }
}
