use crate::instructions::{Instruction, Op};

/// What is known about each register at some point in a unit, ahead of execution
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct KnownRegs {
    values: [Option<u32>; 32],
}

impl KnownRegs {
    /// Only `$zero` is known
    pub fn new() -> Self {
        let mut values = [None; 32];
        values[0] = Some(0);
        KnownRegs { values }
    }

    pub fn get(&self, reg: u8) -> Option<u32> {
        self.values[reg as usize & 31]
    }

    pub fn set(&mut self, reg: u8, value: u32) {
        if reg != 0 {
            self.values[reg as usize & 31] = Some(value);
        }
    }

    pub fn forget(&mut self, reg: u8) {
        if reg != 0 {
            self.values[reg as usize & 31] = None;
        }
    }

    pub fn forget_all(&mut self) {
        *self = Self::new();
    }
}

impl Default for KnownRegs {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluates a simulatable instruction at compile time.
///
/// Returns false, without touching `known`, if the instruction isn't a pure function of its
/// inputs or any input is unknown.
pub fn simulate(inst: Instruction, known: &mut KnownRegs) -> bool {
    if !inst.info().is_simulatable() {
        return false;
    }
    match evaluate(inst, known) {
        Some(value) => {
            if let Some(dest) = inst.dest() {
                known.set(dest, value);
            }
            true
        }
        None => false,
    }
}

fn evaluate(inst: Instruction, known: &KnownRegs) -> Option<u32> {
    let rs = || known.get(inst.rs());
    let rt = || known.get(inst.rt());

    Some(match inst.op() {
        Op::Nop => 0,
        Op::Sll => rt()? << inst.sa(),
        Op::Srl => rt()? >> inst.sa(),
        Op::Sra => ((rt()? as i32) >> inst.sa()) as u32,
        Op::Sllv => rt()? << (rs()? & 31),
        Op::Srlv => rt()? >> (rs()? & 31),
        Op::Srav => ((rt()? as i32) >> (rs()? & 31)) as u32,
        Op::Addu => rs()?.wrapping_add(rt()?),
        Op::Subu => rs()?.wrapping_sub(rt()?),
        Op::And => rs()? & rt()?,
        Op::Or => rs()? | rt()?,
        Op::Xor => rs()? ^ rt()?,
        Op::Nor => !(rs()? | rt()?),
        Op::Slt => ((rs()? as i32) < (rt()? as i32)) as u32,
        Op::Sltu => (rs()? < rt()?) as u32,
        Op::Addiu => rs()?.wrapping_add(inst.simm()),
        Op::Slti => ((rs()? as i32) < (inst.simm() as i32)) as u32,
        Op::Sltiu => (rs()? < inst.simm()) as u32,
        Op::Andi => rs()? & inst.imm(),
        Op::Ori => rs()? | inst.imm(),
        Op::Xori => rs()? ^ inst.imm(),
        Op::Lui => inst.imm() << 16,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm;

    fn decode(word: u32) -> Instruction {
        Instruction::decode(word)
    }

    #[test]
    fn folds_lui_ori_pairs() {
        let mut known = KnownRegs::new();
        assert!(simulate(decode(asm::lui(8, 0x1f80)), &mut known));
        assert!(simulate(decode(asm::ori(8, 8, 0x1070)), &mut known));
        assert_eq!(known.get(8), Some(0x1f80_1070));
    }

    #[test]
    fn unknown_inputs_leave_state_untouched() {
        let mut known = KnownRegs::new();
        known.set(4, 10);
        let before = known.clone();
        assert!(!simulate(decode(asm::addu(2, 4, 5)), &mut known));
        assert_eq!(known, before);
    }

    #[test]
    fn impure_instructions_are_never_simulated() {
        let mut known = KnownRegs::new();
        known.set(4, 1);
        known.set(5, 2);
        let before = known.clone();
        // add can overflow, lw touches memory
        assert!(!simulate(decode(asm::add(2, 4, 5)), &mut known));
        assert!(!simulate(decode(asm::lw(2, 4, 0)), &mut known));
        assert_eq!(known, before);
    }

    #[test]
    fn zero_register_stays_zero() {
        let mut known = KnownRegs::new();
        assert!(simulate(decode(asm::lui(0, 0x1234)), &mut known));
        assert_eq!(known.get(0), Some(0));
        assert!(simulate(decode(asm::NOP), &mut known));
    }
}
