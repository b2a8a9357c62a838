use crate::cop0::{self, Cop0};
use crate::instructions::{Instruction, Op};
use crate::{Bus, Exception, RegFile};

/// Geometry transformation engine, plugged in as coprocessor 2.
///
/// The maths is somebody else's problem. Without one installed, every COP2 instruction raises
/// coprocessor-unusable.
pub trait Gte: Send {
    fn read_data(&mut self, reg: u8) -> u32;
    fn write_data(&mut self, reg: u8, value: u32);
    fn read_control(&mut self, reg: u8) -> u32;
    fn write_control(&mut self, reg: u8, value: u32);
    fn command(&mut self, command: u32);
}

/// Architectural state plus the execute stage shared by the interpreter and compiled code
pub struct Cpu {
    pub regs: RegFile,
    pub cop0: Cop0,
    gte: Option<Box<dyn Gte>>,
    /// Instructions retired since reset
    pub retired: u64,
    /// Times compiled execution handed control back because of an interrupt
    pub compiler_interrupts: u64,
}

impl Cpu {
    pub fn new() -> Cpu {
        Cpu {
            regs: RegFile::new(),
            cop0: Cop0::new(),
            gte: None,
            retired: 0,
            compiler_interrupts: 0,
        }
    }

    pub fn install_gte(&mut self, gte: Box<dyn Gte>) {
        self.gte = Some(gte);
    }

    pub fn fetch<B: Bus + ?Sized>(&mut self, bus: &mut B) -> Result<Instruction, Exception> {
        let pc = self.regs.pc;
        if pc & 3 != 0 {
            return Err(Exception::AddressLoad(pc));
        }
        bus.fetch(pc).map(Instruction::decode)
    }

    /// Executes `inst` as the instruction at `regs.pc`.
    ///
    /// On an exception nothing has been written and the PC still points at the faulting
    /// instruction, ready for `raise`.
    pub fn execute<B: Bus + ?Sized>(&mut self, bus: &mut B, inst: Instruction) -> Result<(), Exception> {
        let pc = self.regs.pc;
        let next_pc = self.regs.next_pc;
        let delay_slot = self.regs.delay_slot;

        self.regs.pc = next_pc;
        self.regs.next_pc = next_pc.wrapping_add(4);
        self.regs.delay_slot = false;

        match self.run_op(bus, inst, pc) {
            Ok(()) => {
                self.retired += 1;
                Ok(())
            }
            Err(e) => {
                self.regs.pc = pc;
                self.regs.next_pc = next_pc;
                self.regs.delay_slot = delay_slot;
                Err(e)
            }
        }
    }

    /// Retires a simulatable instruction whose result was worked out ahead of time
    pub fn retire_folded(&mut self, inst: Instruction, value: u32) {
        self.regs.pc = self.regs.next_pc;
        self.regs.next_pc = self.regs.pc.wrapping_add(4);
        self.regs.delay_slot = false;
        if let Some(dest) = inst.dest() {
            self.regs.write(dest, value);
        }
        self.retired += 1;
    }

    /// Vectors into the guest's exception handler, from the instruction at `regs.pc`
    pub fn raise<B: Bus + ?Sized>(&mut self, bus: &mut B, exception: Exception) {
        let pc = self.regs.pc;
        let vector = self.cop0.enter_exception(exception, pc, self.regs.delay_slot);
        match exception {
            Exception::Interrupt => {
                tracing::trace!("interrupt at {:08x}", pc);
                bus.clear_poll_counters();
            }
            _ => tracing::debug!("{} at {:08x}, vectoring to {:08x}", exception, pc, vector),
        }
        self.regs.jump(vector);
    }

    /// Samples the interrupt line. Returns true if an interrupt would be taken now.
    pub fn interrupt_ready<B: Bus + ?Sized>(&mut self, bus: &mut B) -> bool {
        self.cop0.set_interrupt_line(bus.interrupt_pending());
        self.cop0.interrupt_enabled()
    }

    /// Takes a pending interrupt if it is enabled
    pub fn check_interrupts<B: Bus + ?Sized>(&mut self, bus: &mut B) -> bool {
        if self.interrupt_ready(bus) {
            self.raise(bus, Exception::Interrupt);
            true
        } else {
            false
        }
    }

    /// Acknowledges that compiled execution stopped because it was interrupted.
    /// Runs on the execution thread.
    pub fn compiler_interrupted<B: Bus + ?Sized>(&mut self, bus: &mut B) {
        self.compiler_interrupts += 1;
        bus.clear_poll_counters();
        self.cop0.set_interrupt_line(bus.interrupt_pending());
    }

    fn branch(&mut self, taken: bool, target: u32) {
        if taken {
            self.regs.next_pc = target;
        }
        self.regs.delay_slot = true;
    }

    fn gte(&mut self) -> Result<&mut dyn Gte, Exception> {
        if !self.cop0.coprocessor_usable(2) {
            return Err(Exception::CoprocessorUnusable(2));
        }
        match &mut self.gte {
            Some(gte) => Ok(gte.as_mut()),
            None => Err(Exception::CoprocessorUnusable(2)),
        }
    }

    fn run_op<B: Bus + ?Sized>(&mut self, bus: &mut B, inst: Instruction, pc: u32) -> Result<(), Exception> {
        let rs = self.regs.read(inst.rs());
        let rt = self.regs.read(inst.rt());
        let rd = inst.rd();
        let addr = rs.wrapping_add(inst.simm());

        match inst.op() {
            Op::Nop => {}
            Op::Sll => self.regs.write(rd, rt << inst.sa()),
            Op::Srl => self.regs.write(rd, rt >> inst.sa()),
            Op::Sra => self.regs.write(rd, ((rt as i32) >> inst.sa()) as u32),
            Op::Sllv => self.regs.write(rd, rt << (rs & 31)),
            Op::Srlv => self.regs.write(rd, rt >> (rs & 31)),
            Op::Srav => self.regs.write(rd, ((rt as i32) >> (rs & 31)) as u32),
            Op::Jr => self.branch(true, rs),
            Op::Jalr => {
                self.regs.write(rd, pc.wrapping_add(8));
                self.branch(true, rs);
            }
            Op::Syscall => return Err(Exception::Syscall),
            Op::Break => return Err(Exception::Breakpoint),
            Op::Mfhi => self.regs.write(rd, self.regs.hi),
            Op::Mthi => self.regs.hi = rs,
            Op::Mflo => self.regs.write(rd, self.regs.lo),
            Op::Mtlo => self.regs.lo = rs,
            Op::Mult => {
                let product = (rs as i32 as i64) * (rt as i32 as i64);
                self.regs.hi = (product >> 32) as u32;
                self.regs.lo = product as u32;
            }
            Op::Multu => {
                let product = (rs as u64) * (rt as u64);
                self.regs.hi = (product >> 32) as u32;
                self.regs.lo = product as u32;
            }
            Op::Div => {
                let (n, d) = (rs as i32, rt as i32);
                let (lo, hi) = if d == 0 {
                    (if n >= 0 { 0xffff_ffff } else { 1 }, n as u32)
                } else if n == i32::MIN && d == -1 {
                    (0x8000_0000, 0)
                } else {
                    ((n / d) as u32, (n % d) as u32)
                };
                self.regs.lo = lo;
                self.regs.hi = hi;
            }
            Op::Divu => {
                if rt == 0 {
                    self.regs.lo = 0xffff_ffff;
                    self.regs.hi = rs;
                } else {
                    self.regs.lo = rs / rt;
                    self.regs.hi = rs % rt;
                }
            }
            Op::Add => {
                let sum = (rs as i32).checked_add(rt as i32).ok_or(Exception::Overflow)?;
                self.regs.write(rd, sum as u32);
            }
            Op::Addu => self.regs.write(rd, rs.wrapping_add(rt)),
            Op::Sub => {
                let diff = (rs as i32).checked_sub(rt as i32).ok_or(Exception::Overflow)?;
                self.regs.write(rd, diff as u32);
            }
            Op::Subu => self.regs.write(rd, rs.wrapping_sub(rt)),
            Op::And => self.regs.write(rd, rs & rt),
            Op::Or => self.regs.write(rd, rs | rt),
            Op::Xor => self.regs.write(rd, rs ^ rt),
            Op::Nor => self.regs.write(rd, !(rs | rt)),
            Op::Slt => self.regs.write(rd, ((rs as i32) < (rt as i32)) as u32),
            Op::Sltu => self.regs.write(rd, (rs < rt) as u32),
            Op::Bltz => self.branch((rs as i32) < 0, inst.branch_target(pc)),
            Op::Bgez => self.branch((rs as i32) >= 0, inst.branch_target(pc)),
            // These link whether or not the branch is taken
            Op::Bltzal => {
                self.regs.write(31, pc.wrapping_add(8));
                self.branch((rs as i32) < 0, inst.branch_target(pc));
            }
            Op::Bgezal => {
                self.regs.write(31, pc.wrapping_add(8));
                self.branch((rs as i32) >= 0, inst.branch_target(pc));
            }
            Op::J => self.branch(true, inst.jump_target(pc)),
            Op::Jal => {
                self.regs.write(31, pc.wrapping_add(8));
                self.branch(true, inst.jump_target(pc));
            }
            Op::Beq => self.branch(rs == rt, inst.branch_target(pc)),
            Op::Bne => self.branch(rs != rt, inst.branch_target(pc)),
            Op::Blez => self.branch((rs as i32) <= 0, inst.branch_target(pc)),
            Op::Bgtz => self.branch((rs as i32) > 0, inst.branch_target(pc)),
            Op::Addi => {
                let sum = (rs as i32).checked_add(inst.simm() as i32).ok_or(Exception::Overflow)?;
                self.regs.write(inst.rt(), sum as u32);
            }
            Op::Addiu => self.regs.write(inst.rt(), rs.wrapping_add(inst.simm())),
            Op::Slti => self.regs.write(inst.rt(), ((rs as i32) < (inst.simm() as i32)) as u32),
            Op::Sltiu => self.regs.write(inst.rt(), (rs < inst.simm()) as u32),
            Op::Andi => self.regs.write(inst.rt(), rs & inst.imm()),
            Op::Ori => self.regs.write(inst.rt(), rs | inst.imm()),
            Op::Xori => self.regs.write(inst.rt(), rs ^ inst.imm()),
            Op::Lui => self.regs.write(inst.rt(), inst.imm() << 16),
            Op::Mfc0 => self.regs.write(inst.rt(), self.cop0.read(rd)),
            Op::Mtc0 => {
                if self.cop0.write(rd, rt) {
                    bus.enable_memory_write(!self.cop0.cache_isolated());
                }
                if rd == cop0::SR || rd == cop0::CAUSE {
                    tracing::trace!("{} = {:08x}", cop0::COP0_REG_NAMES[rd as usize], rt);
                }
            }
            Op::Rfe => self.cop0.rfe(),
            Op::Mfc2 => {
                let value = self.gte()?.read_data(rd);
                self.regs.write(inst.rt(), value);
            }
            Op::Cfc2 => {
                let value = self.gte()?.read_control(rd);
                self.regs.write(inst.rt(), value);
            }
            Op::Mtc2 => self.gte()?.write_data(rd, rt),
            Op::Ctc2 => self.gte()?.write_control(rd, rt),
            Op::Cop2 => self.gte()?.command(inst.word() & 0x01ff_ffff),
            Op::CopUnusable(cop) => return Err(Exception::CoprocessorUnusable(cop)),
            Op::Lb => {
                let value = bus.read8(pc, addr)? as i8 as u32;
                self.regs.write(inst.rt(), value);
            }
            Op::Lbu => {
                let value = bus.read8(pc, addr)? as u32;
                self.regs.write(inst.rt(), value);
            }
            Op::Lh => {
                if addr & 1 != 0 {
                    return Err(Exception::AddressLoad(addr));
                }
                let value = bus.read16(pc, addr)? as i16 as u32;
                self.regs.write(inst.rt(), value);
            }
            Op::Lhu => {
                if addr & 1 != 0 {
                    return Err(Exception::AddressLoad(addr));
                }
                let value = bus.read16(pc, addr)? as u32;
                self.regs.write(inst.rt(), value);
            }
            Op::Lw => {
                if addr & 3 != 0 {
                    return Err(Exception::AddressLoad(addr));
                }
                let value = bus.read32(pc, addr)?;
                self.regs.write(inst.rt(), value);
            }
            Op::Lwl => {
                let word = bus.read32(pc, addr & !3)?;
                let value = match addr & 3 {
                    0 => (rt & 0x00ff_ffff) | (word << 24),
                    1 => (rt & 0x0000_ffff) | (word << 16),
                    2 => (rt & 0x0000_00ff) | (word << 8),
                    _ => word,
                };
                self.regs.write(inst.rt(), value);
            }
            Op::Lwr => {
                let word = bus.read32(pc, addr & !3)?;
                let value = match addr & 3 {
                    0 => word,
                    1 => (rt & 0xff00_0000) | (word >> 8),
                    2 => (rt & 0xffff_0000) | (word >> 16),
                    _ => (rt & 0xffff_ff00) | (word >> 24),
                };
                self.regs.write(inst.rt(), value);
            }
            Op::Sb => bus.write8(pc, addr, rt as u8)?,
            Op::Sh => {
                if addr & 1 != 0 {
                    return Err(Exception::AddressStore(addr));
                }
                bus.write16(pc, addr, rt as u16)?;
            }
            Op::Sw => {
                if addr & 3 != 0 {
                    return Err(Exception::AddressStore(addr));
                }
                bus.write32(pc, addr, rt)?;
            }
            Op::Swl => {
                let word = bus.read32(pc, addr & !3)?;
                let value = match addr & 3 {
                    0 => (word & 0xffff_ff00) | (rt >> 24),
                    1 => (word & 0xffff_0000) | (rt >> 16),
                    2 => (word & 0xff00_0000) | (rt >> 8),
                    _ => rt,
                };
                bus.write32(pc, addr & !3, value)?;
            }
            Op::Swr => {
                let word = bus.read32(pc, addr & !3)?;
                let value = match addr & 3 {
                    0 => rt,
                    1 => (word & 0x0000_00ff) | (rt << 8),
                    2 => (word & 0x0000_ffff) | (rt << 16),
                    _ => (word & 0x00ff_ffff) | (rt << 24),
                };
                bus.write32(pc, addr & !3, value)?;
            }
            Op::Lwc2 => {
                self.gte()?;
                if addr & 3 != 0 {
                    return Err(Exception::AddressLoad(addr));
                }
                let value = bus.read32(pc, addr)?;
                self.gte()?.write_data(inst.rt(), value);
            }
            Op::Swc2 => {
                let value = self.gte()?.read_data(inst.rt());
                if addr & 3 != 0 {
                    return Err(Exception::AddressStore(addr));
                }
                bus.write32(pc, addr, value)?;
            }
            Op::Invalid => return Err(Exception::ReservedInstruction),
        }
        Ok(())
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm;
    use crate::testing::FlatBus;

    fn cpu_at(pc: u32) -> Cpu {
        let mut cpu = Cpu::new();
        cpu.regs.jump(pc);
        cpu
    }

    fn exec(cpu: &mut Cpu, bus: &mut FlatBus, word: u32) -> Result<(), Exception> {
        cpu.execute(bus, Instruction::decode(word))
    }

    #[test]
    fn overflow_leaves_destination_alone() {
        let mut bus = FlatBus::new(0x1000);
        let mut cpu = cpu_at(0x100);
        cpu.regs.write(8, 0x7fff_ffff);
        cpu.regs.write(9, 1);
        cpu.regs.write(10, 0x55);

        assert_eq!(exec(&mut cpu, &mut bus, asm::add(10, 8, 9)), Err(Exception::Overflow));
        assert_eq!(cpu.regs.read(10), 0x55);
        assert_eq!(cpu.regs.pc, 0x100);

        exec(&mut cpu, &mut bus, asm::addu(10, 8, 9)).unwrap();
        assert_eq!(cpu.regs.read(10), 0x8000_0000);
    }

    #[test]
    fn division_edge_cases() {
        let mut bus = FlatBus::new(0x1000);
        let mut cpu = cpu_at(0);

        cpu.regs.write(8, 7);
        cpu.regs.write(9, 0);
        exec(&mut cpu, &mut bus, asm::div(8, 9)).unwrap();
        assert_eq!((cpu.regs.lo, cpu.regs.hi), (0xffff_ffff, 7));

        cpu.regs.write(8, (-7i32) as u32);
        exec(&mut cpu, &mut bus, asm::div(8, 9)).unwrap();
        assert_eq!((cpu.regs.lo, cpu.regs.hi), (1, (-7i32) as u32));

        cpu.regs.write(8, 0x8000_0000);
        cpu.regs.write(9, 0xffff_ffff);
        exec(&mut cpu, &mut bus, asm::div(8, 9)).unwrap();
        assert_eq!((cpu.regs.lo, cpu.regs.hi), (0x8000_0000, 0));

        cpu.regs.write(8, 3);
        cpu.regs.write(9, 0xffff_ffff);
        exec(&mut cpu, &mut bus, asm::mult(8, 9)).unwrap();
        assert_eq!((cpu.regs.hi, cpu.regs.lo), (0xffff_ffff, 0xffff_fffd));
    }

    #[test]
    fn unaligned_word_helpers() {
        let mut bus = FlatBus::new(0x1000);
        bus.poke32(0x200, 0x4433_2211);
        bus.poke32(0x204, 0x8877_6655);
        let mut cpu = cpu_at(0);
        cpu.regs.write(4, 0x200);

        // lwr $t0, 1($a0); lwl $t0, 4($a0) loads the unaligned word at 0x201
        exec(&mut cpu, &mut bus, asm::lwr(8, 4, 1)).unwrap();
        exec(&mut cpu, &mut bus, asm::lwl(8, 4, 4)).unwrap();
        assert_eq!(cpu.regs.read(8), 0x5544_3322);

        cpu.regs.write(9, 0xaabb_ccdd);
        exec(&mut cpu, &mut bus, asm::swr(9, 4, 1)).unwrap();
        exec(&mut cpu, &mut bus, asm::swl(9, 4, 4)).unwrap();
        assert_eq!(bus.peek32(0x200), 0xbbcc_dd11);
        assert_eq!(bus.peek32(0x204), 0x8877_66aa);
    }

    #[test]
    fn misaligned_load_raises_address_error() {
        let mut bus = FlatBus::new(0x1000);
        let mut cpu = cpu_at(0x40);
        cpu.regs.write(4, 0x202);
        let result = exec(&mut cpu, &mut bus, asm::lw(8, 4, 0));
        assert_eq!(result, Err(Exception::AddressLoad(0x202)));

        cpu.cop0.write(cop0::SR, 0);
        cpu.raise(&mut bus, Exception::AddressLoad(0x202));
        assert_eq!(cpu.regs.pc, 0x8000_0080);
        assert_eq!(cpu.cop0.epc(), 0x40);
        assert_eq!(cpu.cop0.read(cop0::BAD_VADDR), 0x202);
    }

    #[test]
    fn branch_links_even_when_not_taken() {
        let mut bus = FlatBus::new(0x1000);
        let mut cpu = cpu_at(0x100);
        cpu.regs.write(4, 5);
        exec(&mut cpu, &mut bus, asm::bltzal(4, 0x10)).unwrap();
        assert_eq!(cpu.regs.read(31), 0x108);
        assert_eq!(cpu.regs.next_pc, 0x108);
        assert!(cpu.regs.delay_slot);
    }

    #[test]
    fn cop2_needs_a_gte_and_cu2() {
        struct Echo(u32);
        impl Gte for Echo {
            fn read_data(&mut self, _reg: u8) -> u32 { self.0 }
            fn write_data(&mut self, _reg: u8, value: u32) { self.0 = value }
            fn read_control(&mut self, _reg: u8) -> u32 { 0 }
            fn write_control(&mut self, _reg: u8, _value: u32) {}
            fn command(&mut self, _command: u32) {}
        }

        let mut bus = FlatBus::new(0x1000);
        let mut cpu = cpu_at(0);
        cpu.regs.write(8, 42);
        assert_eq!(exec(&mut cpu, &mut bus, asm::mtc2(8, 1)), Err(Exception::CoprocessorUnusable(2)));

        cpu.install_gte(Box::new(Echo(0)));
        cpu.cop0.write(cop0::SR, 1 << 30);
        exec(&mut cpu, &mut bus, asm::mtc2(8, 1)).unwrap();
        exec(&mut cpu, &mut bus, asm::mfc2(9, 1)).unwrap();
        assert_eq!(cpu.regs.read(9), 42);
    }

    #[test]
    fn cache_isolation_toggles_memory_writes() {
        let mut bus = FlatBus::new(0x1000);
        let mut cpu = cpu_at(0);
        cpu.regs.write(8, 0x0001_0000);
        exec(&mut cpu, &mut bus, asm::mtc0(8, cop0::SR)).unwrap();
        assert!(!bus.writes_enabled);
        cpu.regs.write(8, 0);
        exec(&mut cpu, &mut bus, asm::mtc0(8, cop0::SR)).unwrap();
        assert!(bus.writes_enabled);
    }
}
