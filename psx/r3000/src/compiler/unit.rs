use std::collections::BTreeSet;
use std::ops::Range;

use crate::instructions::{BranchType, Form, Instruction};

use super::simulate::{simulate, KnownRegs};

/// One pre-decoded instruction of a unit
#[derive(Debug, Clone, Copy)]
pub struct MicroOp {
    pub inst: Instruction,
    /// Result worked out at compile time, valid only when execution ran straight through from
    /// `block`
    pub folded: Option<u32>,
    /// Index of the first op of the basic block this op belongs to
    pub block: usize,
}

/// A contiguous run of guest code, pre-decoded into threaded micro-ops
#[derive(Debug)]
pub struct CompiledUnit {
    pub start: u32,
    pub physical: Range<u32>,
    pub ops: Vec<MicroOp>,
}

impl CompiledUnit {
    /// Index of the op at `pc`, if this unit covers it
    #[inline(always)]
    pub fn index(&self, pc: u32) -> Option<usize> {
        let offset = pc.wrapping_sub(self.start);
        let index = (offset >> 2) as usize;
        (offset & 3 == 0 && index < self.ops.len()).then_some(index)
    }

    pub fn end(&self) -> u32 {
        self.start.wrapping_add(self.ops.len() as u32 * 4)
    }

    pub fn contains(&self, pc: u32) -> bool {
        self.index(pc).is_some()
    }

    pub fn overlaps(&self, range: &Range<u32>) -> bool {
        self.physical.start < range.end && range.start < self.physical.end
    }

    pub fn folded_ops(&self) -> usize {
        self.ops.iter().filter(|op| op.folded.is_some()).count()
    }
}

/// Builds a unit from `instructions`, which start at virtual `start` / physical `physical_start`.
///
/// Basic blocks start at the unit entry, at every branch target inside the unit and right after
/// every delay slot. Register knowledge is reset at each block, so a folded op only depends on
/// instructions earlier in its own block.
pub fn compile_region(start: u32, physical_start: u32, instructions: &[Instruction]) -> CompiledUnit {
    let len = instructions.len();
    let mut leaders = BTreeSet::new();
    leaders.insert(0usize);

    for (i, inst) in instructions.iter().enumerate() {
        let info = inst.info();
        if info.branch == BranchType::Never {
            continue;
        }
        leaders.insert(i + 2);
        let pc = start.wrapping_add(i as u32 * 4);
        let target = match info.form {
            Form::J26 => Some(inst.jump_target(pc)),
            Form::BranchReg | Form::BranchRegReg => Some(inst.branch_target(pc)),
            _ => None,
        };
        if let Some(target) = target {
            let offset = target.wrapping_sub(start);
            if offset & 3 == 0 && ((offset >> 2) as usize) < len {
                leaders.insert((offset >> 2) as usize);
            }
        }
    }

    let mut known = KnownRegs::new();
    let mut block = 0;
    let mut ops = Vec::with_capacity(len);

    for (i, inst) in instructions.iter().enumerate() {
        if leaders.contains(&i) {
            known.forget_all();
            block = i;
        }

        let mut folded = None;
        if simulate(*inst, &mut known) {
            folded = inst.dest().and_then(|dest| known.get(dest));
        } else if let Some(dest) = inst.dest() {
            known.forget(dest);
        }

        ops.push(MicroOp { inst: *inst, folded, block });
    }

    CompiledUnit {
        start,
        physical: physical_start..physical_start.wrapping_add(len as u32 * 4),
        ops,
    }
}
