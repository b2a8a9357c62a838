use modular_bitfield::{bitfield, specifiers::*};

use crate::cop0::COP0_REG_NAMES;

#[bitfield(bits = 32)]
#[derive(Debug, Copy, Clone)]
pub struct IType {
    pub imm: B16,
    pub rt: B5,
    pub rs: B5,
    #[skip]
    op: B6,
}

#[bitfield(bits = 32)]
#[derive(Debug, Copy, Clone)]
pub struct JType {
    pub target: B26,
    #[skip]
    op: B6,
}

#[bitfield(bits = 32)]
#[derive(Debug, Copy, Clone)]
pub struct RType {
    pub funct: B6,
    pub sa: B5,
    pub rd: B5,
    pub rt: B5,
    pub rs: B5,
    pub op: B6,
}

pub const MIPS_REG_NAMES: [&str; 32] = [
    "$zero", // Always 0
    "$at",   // r1 - Reserved for assembler
    "$v0", "$v1", // r2-r3 - Function return values
    "$a0", "$a1", "$a2", "$a3", // r4-r7 - function arguments
    "$t0", "$t1", "$t2", "$t3", "$t4", "$t5", "$t6",
    "$t7", // r8-r15 - Temporaries (Caller saved)
    "$s0", "$s1", "$s2", "$s3", "$s4", "$s5", "$s6", "$s7", // r16-r23 - Saved  (Callee saved)
    "$t8", "$t9", // r24-r25 - Caller-saved temporaries
    "$k0", "$k1", // Reserved for OS kernel
    "$gp", // r28 - Global pointer
    "$sp", // r29 - Stack pointer
    "$fp", // r30 - Frame pointer
    "$ra", // r31 - Return address
];

/// How an instruction affects control flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchType {
    Never,
    Conditional,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemWidth {
    None,
    B8,
    B16,
    B32,
}

impl MemWidth {
    pub fn bytes(self) -> u32 {
        match self {
            MemWidth::None => 0,
            MemWidth::B8 => 1,
            MemWidth::B16 => 2,
            MemWidth::B32 => 4,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Flags(u16);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const READS_RS: Flags = Flags(1 << 0);
    pub const READS_RT: Flags = Flags(1 << 1);
    pub const WRITES_RT: Flags = Flags(1 << 2);
    pub const WRITES_RD: Flags = Flags(1 << 3);
    pub const WRITES_RA: Flags = Flags(1 << 4);
    /// Result is a pure function of the register inputs, so it can be constant folded
    pub const SIMULATABLE: Flags = Flags(1 << 5);
    /// May fault, so machine state must be precise when it executes
    pub const COMPLETE_STATE: Flags = Flags(1 << 6);
    /// A call: the return address lands in a register
    pub const LINKS: Flags = Flags(1 << 7);
    /// `jr $ra`
    pub const RETURN: Flags = Flags(1 << 8);
    pub const READS_HILO: Flags = Flags(1 << 9);
    pub const WRITES_HILO: Flags = Flags(1 << 10);
    pub const LOAD: Flags = Flags(1 << 11);
    pub const STORE: Flags = Flags(1 << 12);

    pub const fn from_bits(bits: u16) -> Flags {
        Flags(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn union(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        self.union(rhs)
    }
}

impl std::fmt::Debug for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Flags({:#06x})", self.0)
    }
}

/// Operand layout, used for disassembly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Form {
    None,
    J26,
    RegImm(bool), // true == signed
    LoadUpper,
    BranchRegReg,
    BranchReg,
    LoadStore,
    JReg,
    JRegLink,
    ShiftImm,
    ShiftReg,
    MoveFrom,
    MoveTo,
    MulDiv,
    RegRegReg,
    CopMove(u8),
    CopCommand,
    Exception,
}

/// Selects the execution routine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Nop,
    Sll, Srl, Sra, Sllv, Srlv, Srav,
    Jr, Jalr,
    Syscall, Break,
    Mfhi, Mthi, Mflo, Mtlo,
    Mult, Multu, Div, Divu,
    Add, Addu, Sub, Subu, And, Or, Xor, Nor, Slt, Sltu,
    Bltz, Bgez, Bltzal, Bgezal,
    J, Jal, Beq, Bne, Blez, Bgtz,
    Addi, Addiu, Slti, Sltiu, Andi, Ori, Xori, Lui,
    Mfc0, Mtc0, Rfe,
    Mfc2, Cfc2, Mtc2, Ctc2, Cop2,
    /// COP1/COP3 and their load/stores: no such coprocessor
    CopUnusable(u8),
    Lb, Lh, Lwl, Lw, Lbu, Lhu, Lwr,
    Sb, Sh, Swl, Sw, Swr,
    Lwc2, Swc2,
    Invalid,
}

/// Immutable template shared by every instruction word of one opcode class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionDescriptor {
    pub name: &'static str,
    pub form: Form,
    pub op: Op,
    pub branch: BranchType,
    pub flags: Flags,
    pub width: MemWidth,
}

impl InstructionDescriptor {
    const fn new(name: &'static str, form: Form, op: Op, branch: BranchType, flags: u16, width: MemWidth) -> Self {
        InstructionDescriptor { name, form, op, branch, flags: Flags(flags), width }
    }

    pub fn is_simulatable(&self) -> bool {
        self.flags.contains(Flags::SIMULATABLE)
    }

    pub fn requires_complete_state(&self) -> bool {
        self.flags.contains(Flags::COMPLETE_STATE)
    }

    pub fn is_branch(&self) -> bool {
        self.branch != BranchType::Never
    }

    pub fn is_call(&self) -> bool {
        self.flags.contains(Flags::LINKS)
    }

    pub fn is_return(&self) -> bool {
        self.flags.contains(Flags::RETURN)
    }

    pub fn is_store(&self) -> bool {
        self.flags.contains(Flags::STORE)
    }

    pub fn is_invalid(&self) -> bool {
        std::ptr::eq(self, &INVALID)
    }
}

// Shorthands for the tables below
const RS: u16 = Flags::READS_RS.0;
const RT: u16 = Flags::READS_RT.0;
const WT: u16 = Flags::WRITES_RT.0;
const WD: u16 = Flags::WRITES_RD.0;
const WRA: u16 = Flags::WRITES_RA.0;
const SIM: u16 = Flags::SIMULATABLE.0;
const CS: u16 = Flags::COMPLETE_STATE.0;
const LNK: u16 = Flags::LINKS.0;
const RHL: u16 = Flags::READS_HILO.0;
const WHL: u16 = Flags::WRITES_HILO.0;
const LD: u16 = Flags::LOAD.0;
const ST: u16 = Flags::STORE.0;

/// Every undefined encoding decodes to this one descriptor
pub static INVALID: InstructionDescriptor =
    InstructionDescriptor::new("INVALID", Form::Exception, Op::Invalid, BranchType::Never, CS, MemWidth::None);

/// `sll $zero, $zero, 0`, picked out so it reads as what it is
pub static NOP: InstructionDescriptor =
    InstructionDescriptor::new("NOP", Form::None, Op::Nop, BranchType::Never, SIM, MemWidth::None);

/// `jr $ra` gets its own descriptor so function returns can be recognised without looking at fields
pub static JR_RA: InstructionDescriptor =
    InstructionDescriptor::new("JR", Form::JReg, Op::Jr, BranchType::Always, RS | Flags::RETURN.0, MemWidth::None);

#[derive(Debug, Clone, Copy)]
enum Entry {
    Reserved,
    Special,
    RegImm,
    Cop0,
    Cop2,
    Op(InstructionDescriptor),
}

use BranchType::{Always, Conditional, Never};

const fn op(name: &'static str, form: Form, op: Op, flags: u16) -> Entry {
    Entry::Op(InstructionDescriptor::new(name, form, op, Never, flags, MemWidth::None))
}

const fn branch(name: &'static str, form: Form, op: Op, kind: BranchType, flags: u16) -> Entry {
    Entry::Op(InstructionDescriptor::new(name, form, op, kind, flags, MemWidth::None))
}

const fn mem(name: &'static str, op: Op, width: MemWidth, flags: u16) -> Entry {
    Entry::Op(InstructionDescriptor::new(name, Form::LoadStore, op, Never, flags | RS | CS, width))
}

const fn build_primary_table() -> [Entry; 64] {
    use Entry::{Cop0, Cop2, RegImm, Reserved, Special};

    [
        Special,
        RegImm,
        branch("J", Form::J26, Op::J, Always, 0),
        branch("JAL", Form::J26, Op::Jal, Always, WRA | LNK),
        branch("BEQ", Form::BranchRegReg, Op::Beq, Conditional, RS | RT),
        branch("BNE", Form::BranchRegReg, Op::Bne, Conditional, RS | RT),
        branch("BLEZ", Form::BranchReg, Op::Blez, Conditional, RS),
        branch("BGTZ", Form::BranchReg, Op::Bgtz, Conditional, RS),
        // 1
        op("ADDI", Form::RegImm(true), Op::Addi, RS | WT | CS),
        op("ADDIU", Form::RegImm(true), Op::Addiu, RS | WT | SIM),
        op("SLTI", Form::RegImm(true), Op::Slti, RS | WT | SIM),
        op("SLTIU", Form::RegImm(true), Op::Sltiu, RS | WT | SIM),
        op("ANDI", Form::RegImm(false), Op::Andi, RS | WT | SIM),
        op("ORI", Form::RegImm(false), Op::Ori, RS | WT | SIM),
        op("XORI", Form::RegImm(false), Op::Xori, RS | WT | SIM),
        op("LUI", Form::LoadUpper, Op::Lui, WT | SIM),
        // 2
        Cop0,
        op("COP1", Form::CopCommand, Op::CopUnusable(1), CS),
        Cop2,
        op("COP3", Form::CopCommand, Op::CopUnusable(3), CS),
        Reserved,
        Reserved,
        Reserved,
        Reserved,
        // 3
        Reserved,
        Reserved,
        Reserved,
        Reserved,
        Reserved,
        Reserved,
        Reserved,
        Reserved,
        // 4
        mem("LB", Op::Lb, MemWidth::B8, WT | LD),
        mem("LH", Op::Lh, MemWidth::B16, WT | LD),
        mem("LWL", Op::Lwl, MemWidth::B32, RT | WT | LD),
        mem("LW", Op::Lw, MemWidth::B32, WT | LD),
        mem("LBU", Op::Lbu, MemWidth::B8, WT | LD),
        mem("LHU", Op::Lhu, MemWidth::B16, WT | LD),
        mem("LWR", Op::Lwr, MemWidth::B32, RT | WT | LD),
        Reserved,
        // 5
        mem("SB", Op::Sb, MemWidth::B8, RT | ST),
        mem("SH", Op::Sh, MemWidth::B16, RT | ST),
        mem("SWL", Op::Swl, MemWidth::B32, RT | ST),
        mem("SW", Op::Sw, MemWidth::B32, RT | ST),
        Reserved,
        Reserved,
        mem("SWR", Op::Swr, MemWidth::B32, RT | ST),
        Reserved,
        // 6
        mem("LWC0", Op::CopUnusable(0), MemWidth::B32, LD),
        mem("LWC1", Op::CopUnusable(1), MemWidth::B32, LD),
        mem("LWC2", Op::Lwc2, MemWidth::B32, LD),
        mem("LWC3", Op::CopUnusable(3), MemWidth::B32, LD),
        Reserved,
        Reserved,
        Reserved,
        Reserved,
        // 7
        mem("SWC0", Op::CopUnusable(0), MemWidth::B32, ST),
        mem("SWC1", Op::CopUnusable(1), MemWidth::B32, ST),
        mem("SWC2", Op::Swc2, MemWidth::B32, ST),
        mem("SWC3", Op::CopUnusable(3), MemWidth::B32, ST),
        Reserved,
        Reserved,
        Reserved,
        Reserved,
    ]
}

const fn build_special_table() -> [Entry; 64] {
    use Entry::Reserved;

    [
        // 0
        op("SLL", Form::ShiftImm, Op::Sll, RT | WD | SIM),
        Reserved,
        op("SRL", Form::ShiftImm, Op::Srl, RT | WD | SIM),
        op("SRA", Form::ShiftImm, Op::Sra, RT | WD | SIM),
        op("SLLV", Form::ShiftReg, Op::Sllv, RS | RT | WD | SIM),
        Reserved,
        op("SRLV", Form::ShiftReg, Op::Srlv, RS | RT | WD | SIM),
        op("SRAV", Form::ShiftReg, Op::Srav, RS | RT | WD | SIM),
        // 1
        branch("JR", Form::JReg, Op::Jr, Always, RS),
        branch("JALR", Form::JRegLink, Op::Jalr, Always, RS | WD | LNK),
        Reserved,
        Reserved,
        op("SYSCALL", Form::Exception, Op::Syscall, CS),
        op("BREAK", Form::Exception, Op::Break, CS),
        Reserved,
        Reserved,
        // 2
        op("MFHI", Form::MoveFrom, Op::Mfhi, WD | RHL),
        op("MTHI", Form::MoveTo, Op::Mthi, RS | WHL),
        op("MFLO", Form::MoveFrom, Op::Mflo, WD | RHL),
        op("MTLO", Form::MoveTo, Op::Mtlo, RS | WHL),
        Reserved,
        Reserved,
        Reserved,
        Reserved,
        // 3
        op("MULT", Form::MulDiv, Op::Mult, RS | RT | WHL),
        op("MULTU", Form::MulDiv, Op::Multu, RS | RT | WHL),
        op("DIV", Form::MulDiv, Op::Div, RS | RT | WHL),
        op("DIVU", Form::MulDiv, Op::Divu, RS | RT | WHL),
        Reserved,
        Reserved,
        Reserved,
        Reserved,
        // 4
        op("ADD", Form::RegRegReg, Op::Add, RS | RT | WD | CS),
        op("ADDU", Form::RegRegReg, Op::Addu, RS | RT | WD | SIM),
        op("SUB", Form::RegRegReg, Op::Sub, RS | RT | WD | CS),
        op("SUBU", Form::RegRegReg, Op::Subu, RS | RT | WD | SIM),
        op("AND", Form::RegRegReg, Op::And, RS | RT | WD | SIM),
        op("OR", Form::RegRegReg, Op::Or, RS | RT | WD | SIM),
        op("XOR", Form::RegRegReg, Op::Xor, RS | RT | WD | SIM),
        op("NOR", Form::RegRegReg, Op::Nor, RS | RT | WD | SIM),
        // 5
        Reserved,
        Reserved,
        op("SLT", Form::RegRegReg, Op::Slt, RS | RT | WD | SIM),
        op("SLTU", Form::RegRegReg, Op::Sltu, RS | RT | WD | SIM),
        Reserved,
        Reserved,
        Reserved,
        Reserved,
        // 6
        Reserved, Reserved, Reserved, Reserved, Reserved, Reserved, Reserved, Reserved,
        // 7
        Reserved, Reserved, Reserved, Reserved, Reserved, Reserved, Reserved, Reserved,
    ]
}

/// The R3000 only looks at two bits of rt here: bit 0 picks BGEZ over BLTZ and rt=0b1000x links.
/// Every other encoding is a plain compare, which is what the hardware does.
const fn build_regimm_table() -> [Entry; 32] {
    let mut table = [Entry::Reserved; 32];
    let mut rt = 0;
    while rt < 32 {
        let ge = rt & 1 != 0;
        let link = rt & 0x1e == 0x10;
        table[rt] = match (ge, link) {
            (false, false) => branch("BLTZ", Form::BranchReg, Op::Bltz, Conditional, RS),
            (true, false) => branch("BGEZ", Form::BranchReg, Op::Bgez, Conditional, RS),
            (false, true) => branch("BLTZAL", Form::BranchReg, Op::Bltzal, Conditional, RS | WRA),
            (true, true) => branch("BGEZAL", Form::BranchReg, Op::Bgezal, Conditional, RS | WRA),
        };
        rt += 1;
    }
    table
}

/// Keyed on rs. Everything with the CO bit (rs >= 16) is a command, and RFE is the only one
/// without an MMU.
const fn build_cop0_table() -> [Entry; 32] {
    let mut table = [Entry::Reserved; 32];
    table[0x0] = op("MFC0", Form::CopMove(0), Op::Mfc0, WT | CS);
    table[0x4] = op("MTC0", Form::CopMove(0), Op::Mtc0, RT | CS);
    table
}

const fn build_cop2_table() -> [Entry; 32] {
    let mut table = [Entry::Reserved; 32];
    table[0x0] = op("MFC2", Form::CopMove(2), Op::Mfc2, WT | CS);
    table[0x2] = op("CFC2", Form::CopMove(2), Op::Cfc2, WT | CS);
    table[0x4] = op("MTC2", Form::CopMove(2), Op::Mtc2, RT | CS);
    table[0x6] = op("CTC2", Form::CopMove(2), Op::Ctc2, RT | CS);
    let mut rs = 16;
    while rs < 32 {
        table[rs] = op("COP2", Form::CopCommand, Op::Cop2, CS);
        rs += 1;
    }
    table
}

static RFE: InstructionDescriptor =
    InstructionDescriptor::new("RFE", Form::None, Op::Rfe, Never, CS, MemWidth::None);

static PRIMARY_TABLE: [Entry; 64] = build_primary_table();
static SPECIAL_TABLE: [Entry; 64] = build_special_table();
static REGIMM_TABLE: [Entry; 32] = build_regimm_table();
static COP0_TABLE: [Entry; 32] = build_cop0_table();
static COP2_TABLE: [Entry; 32] = build_cop2_table();

/// Maps an instruction word to its descriptor. Total: unknown encodings give `&INVALID`.
pub fn decode(word: u32) -> &'static InstructionDescriptor {
    if word == 0 {
        return &NOP;
    }

    // we pre-decode to R-Type, as it's the only type decode logic uses
    let inst = RType::from_bytes(word.to_le_bytes());

    let mut entry = &PRIMARY_TABLE[inst.op() as usize];
    loop {
        match entry {
            Entry::Special => {
                if inst.funct() == 0x08 && inst.rs() == 31 {
                    return &JR_RA;
                }
                entry = &SPECIAL_TABLE[inst.funct() as usize];
            }
            Entry::RegImm => {
                entry = &REGIMM_TABLE[inst.rt() as usize];
            }
            Entry::Cop0 => {
                if inst.rs() >= 16 {
                    return if inst.funct() == 0x10 { &RFE } else { &INVALID };
                }
                entry = &COP0_TABLE[inst.rs() as usize];
            }
            Entry::Cop2 => {
                entry = &COP2_TABLE[inst.rs() as usize];
            }
            Entry::Op(info) => return info,
            Entry::Reserved => return &INVALID,
        }
    }
}

/// A decoded instruction word: the raw bits plus the descriptor for its opcode class
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    word: u32,
    info: &'static InstructionDescriptor,
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x} {}", self.word, self.info.name)
    }
}

impl Instruction {
    pub fn decode(word: u32) -> Instruction {
        Instruction { word, info: decode(word) }
    }

    #[inline(always)]
    pub fn word(self) -> u32 {
        self.word
    }

    #[inline(always)]
    pub fn info(self) -> &'static InstructionDescriptor {
        self.info
    }

    #[inline(always)]
    pub fn op(self) -> Op {
        self.info.op
    }

    fn r(self) -> RType {
        RType::from_bytes(self.word.to_le_bytes())
    }

    fn i(self) -> IType {
        IType::from_bytes(self.word.to_le_bytes())
    }

    #[inline(always)]
    pub fn rs(self) -> u8 {
        self.r().rs()
    }

    #[inline(always)]
    pub fn rt(self) -> u8 {
        self.r().rt()
    }

    #[inline(always)]
    pub fn rd(self) -> u8 {
        self.r().rd()
    }

    #[inline(always)]
    pub fn sa(self) -> u32 {
        self.r().sa() as u32
    }

    #[inline(always)]
    pub fn imm(self) -> u32 {
        self.i().imm() as u32
    }

    /// Sign extended immediate
    #[inline(always)]
    pub fn simm(self) -> u32 {
        self.i().imm() as i16 as i32 as u32
    }

    /// The register this instruction writes, if any. Writes to `$zero` count as none.
    pub fn dest(self) -> Option<u8> {
        let flags = self.info.flags;
        let reg = if flags.contains(Flags::WRITES_RD) {
            self.rd()
        } else if flags.contains(Flags::WRITES_RT) {
            self.rt()
        } else if flags.contains(Flags::WRITES_RA) {
            31
        } else {
            0
        };
        (reg != 0).then_some(reg)
    }

    /// Target of a PC-relative branch at `pc`
    pub fn branch_target(self, pc: u32) -> u32 {
        pc.wrapping_add(4).wrapping_add(self.simm() << 2)
    }

    /// Target of a J/JAL at `pc`
    pub fn jump_target(self, pc: u32) -> u32 {
        let j = JType::from_bytes(self.word.to_le_bytes());
        (pc.wrapping_add(4) & 0xf000_0000) | (j.target() << 2)
    }

    pub fn name(self) -> &'static str {
        self.info.name
    }

    /// Provides a string representation of the instruction (as disassembly)
    pub fn disassemble(self, address: u32) -> String {
        use Form::*;

        let reg = |r: u8| MIPS_REG_NAMES[r as usize].to_owned();
        let args: Vec<String> = match self.info.form {
            None | Exception => Vec::new(),
            J26 => vec![format!("{:#010x}", self.jump_target(address))],
            RegImm(true) => vec![reg(self.rt()), reg(self.rs()), format!("{:#x}", self.simm() as i32)],
            RegImm(false) => vec![reg(self.rt()), reg(self.rs()), format!("{:#x}", self.imm())],
            LoadUpper => vec![reg(self.rt()), format!("{:#x}", self.imm())],
            BranchRegReg => vec![
                reg(self.rs()),
                reg(self.rt()),
                format!("{:#010x}", self.branch_target(address)),
            ],
            BranchReg => vec![reg(self.rs()), format!("{:#010x}", self.branch_target(address))],
            LoadStore => {
                let offset = self.simm() as i32;
                let base = reg(self.rs());
                let target = match self.info.op {
                    Op::Lwc2 | Op::Swc2 | Op::CopUnusable(_) => format!("${}", self.rt()),
                    _ => reg(self.rt()),
                };
                vec![target, format!("{}({})", offset, base)]
            }
            JReg | MoveTo => vec![reg(self.rs())],
            JRegLink if self.rd() == 31 => vec![reg(self.rs())],
            JRegLink => vec![reg(self.rd()), reg(self.rs())],
            ShiftImm => vec![reg(self.rd()), reg(self.rt()), format!("{}", self.sa())],
            ShiftReg => vec![reg(self.rd()), reg(self.rt()), reg(self.rs())],
            MoveFrom => vec![reg(self.rd())],
            MulDiv => vec![reg(self.rs()), reg(self.rt())],
            RegRegReg => vec![reg(self.rd()), reg(self.rs()), reg(self.rt())],
            CopMove(0) => vec![reg(self.rt()), COP0_REG_NAMES[self.rd() as usize].to_owned()],
            CopMove(_) => vec![reg(self.rt()), format!("${}", self.rd())],
            CopCommand => vec![format!("{:#x}", self.word & 0x01ff_ffff)],
        };

        if args.is_empty() {
            self.info.name.to_owned()
        } else {
            format!("{:<7} {}", self.info.name, args.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(op: u32, rs: u32, rt: u32, rd: u32, sa: u32, funct: u32) -> u32 {
        op << 26 | rs << 21 | rt << 16 | rd << 11 | sa << 6 | funct
    }

    fn i(op: u32, rs: u32, rt: u32, imm: u16) -> u32 {
        op << 26 | rs << 21 | rt << 16 | imm as u32
    }

    #[test]
    fn zero_is_a_side_effect_free_nop() {
        let nop = decode(0);
        assert_eq!(nop.name, "NOP");
        assert!(nop.is_simulatable());
        assert_eq!(nop.width, MemWidth::None);
        assert_eq!(nop.branch, BranchType::Never);
        assert!(!nop.flags.contains(Flags::WRITES_RD));
        assert!(!nop.flags.contains(Flags::WRITES_RT));
        assert_eq!(Instruction::decode(0).dest(), None);
    }

    #[test]
    fn reserved_encodings_share_the_invalid_singleton() {
        for word in [0xfc00_0000u32, r(0, 0, 0, 0, 0, 0x01), r(0x10, 0x10, 0, 0, 0, 0x01), 0x7000_0000] {
            let info = decode(word);
            assert!(std::ptr::eq(info, &INVALID), "{:08x} decoded to {}", word, info.name);
            assert!(info.requires_complete_state());
        }
    }

    #[test]
    fn decodes_common_instructions() {
        // lui $t0, 0x1f80
        let lui = Instruction::decode(i(0x0f, 0, 8, 0x1f80));
        assert_eq!(lui.op(), Op::Lui);
        assert_eq!(lui.dest(), Some(8));
        assert!(lui.info().is_simulatable());

        // addu $v0, $a0, $a1
        let addu = Instruction::decode(r(0, 4, 5, 2, 0, 0x21));
        assert_eq!(addu.op(), Op::Addu);
        assert_eq!((addu.rs(), addu.rt(), addu.rd()), (4, 5, 2));

        // add traps on overflow, so it can't be folded
        let add = decode(r(0, 4, 5, 2, 0, 0x20));
        assert!(!add.is_simulatable());
        assert!(add.requires_complete_state());

        let sw = decode(i(0x2b, 29, 31, 0x10));
        assert_eq!(sw.width, MemWidth::B32);
        assert!(sw.is_store());
        assert!(sw.requires_complete_state());
    }

    #[test]
    fn calls_and_returns() {
        let jal = decode(3 << 26 | 0x40);
        assert!(jal.is_call());
        assert_eq!(jal.branch, BranchType::Always);

        let jalr = decode(r(0, 8, 0, 31, 0, 0x09));
        assert!(jalr.is_call());

        let ret = decode(r(0, 31, 0, 0, 0, 0x08));
        assert!(ret.is_return());
        let jr = decode(r(0, 8, 0, 0, 0, 0x08));
        assert_eq!(jr.op, Op::Jr);
        assert!(!jr.is_return());
    }

    #[test]
    fn regimm_uses_only_two_bits() {
        assert_eq!(decode(i(1, 4, 0x00, 1)).op, Op::Bltz);
        assert_eq!(decode(i(1, 4, 0x01, 1)).op, Op::Bgez);
        assert_eq!(decode(i(1, 4, 0x10, 1)).op, Op::Bltzal);
        assert_eq!(decode(i(1, 4, 0x11, 1)).op, Op::Bgezal);
        assert_eq!(decode(i(1, 4, 0x03, 1)).op, Op::Bgez);
        assert_eq!(decode(i(1, 4, 0x12, 1)).op, Op::Bltz);
    }

    #[test]
    fn coprocessor_sub_decode() {
        assert_eq!(decode(r(0x10, 0x00, 8, 12, 0, 0)).op, Op::Mfc0);
        assert_eq!(decode(r(0x10, 0x04, 8, 12, 0, 0)).op, Op::Mtc0);
        assert_eq!(decode(r(0x10, 0x10, 0, 0, 0, 0x10)).op, Op::Rfe);
        assert_eq!(decode(r(0x12, 0x10, 0, 0, 0, 0x06)).op, Op::Cop2);
        assert_eq!(decode(r(0x12, 0x04, 8, 3, 0, 0)).op, Op::Mtc2);
        assert_eq!(decode(i(0x32, 29, 1, 0)).op, Op::Lwc2);
        assert_eq!(decode(i(0x32, 29, 1, 0)).width, MemWidth::B32);
        assert_eq!(decode(i(0x3a, 29, 1, 0)).op, Op::Swc2);
        assert_eq!(decode(i(0x3a, 29, 1, 0)).width, MemWidth::B32);
        assert_eq!(decode(r(0x11, 0, 0, 0, 0, 0)).op, Op::CopUnusable(1));
    }

    #[test]
    fn branch_and_jump_targets() {
        let beq = Instruction::decode(i(4, 1, 2, 0xffff));
        assert_eq!(beq.branch_target(0x8001_0000), 0x8001_0000);
        let j = Instruction::decode(2 << 26 | 0x0004_0000);
        assert_eq!(j.jump_target(0x8000_1000), 0x8010_0000);
    }

    #[test]
    fn disassembly() {
        assert_eq!(Instruction::decode(0).disassemble(0), "NOP");
        assert_eq!(
            Instruction::decode(r(0, 4, 5, 2, 0, 0x21)).disassemble(0),
            "ADDU    $v0, $a0, $a1"
        );
        assert_eq!(
            Instruction::decode(i(0x23, 29, 31, 0x14)).disassemble(0),
            "LW      $ra, 20($sp)"
        );
        assert_eq!(
            Instruction::decode(r(0x10, 0x04, 8, 12, 0, 0)).disassemble(0),
            "MTC0    $t0, SR"
        );
    }

    proptest::proptest! {
        #[test]
        fn decode_is_total_and_deterministic(word: u32) {
            let first = decode(word);
            let second = decode(word);
            proptest::prop_assert!(std::ptr::eq(first, second));
            proptest::prop_assert!(!first.name.is_empty());
        }
    }
}
