//! Just enough of an assembler to hand-write guest programs for tests and demos.

fn r(rs: u8, rt: u8, rd: u8, sa: u32, funct: u32) -> u32 {
    (rs as u32) << 21 | (rt as u32) << 16 | (rd as u32) << 11 | sa << 6 | funct
}

fn i(op: u32, rs: u8, rt: u8, imm: i32) -> u32 {
    op << 26 | (rs as u32) << 21 | (rt as u32) << 16 | (imm as u32 & 0xffff)
}

pub const NOP: u32 = 0;

// Branch offsets count instructions from the delay slot

pub fn sll(rd: u8, rt: u8, sa: u32) -> u32 { r(0, rt, rd, sa, 0x00) }
pub fn jr(rs: u8) -> u32 { r(rs, 0, 0, 0, 0x08) }
pub fn jalr(rd: u8, rs: u8) -> u32 { r(rs, 0, rd, 0, 0x09) }
pub fn syscall() -> u32 { 0x0c }
pub fn mult(rs: u8, rt: u8) -> u32 { r(rs, rt, 0, 0, 0x18) }
pub fn div(rs: u8, rt: u8) -> u32 { r(rs, rt, 0, 0, 0x1a) }
pub fn add(rd: u8, rs: u8, rt: u8) -> u32 { r(rs, rt, rd, 0, 0x20) }
pub fn addu(rd: u8, rs: u8, rt: u8) -> u32 { r(rs, rt, rd, 0, 0x21) }
pub fn or(rd: u8, rs: u8, rt: u8) -> u32 { r(rs, rt, rd, 0, 0x25) }
pub fn bltzal(rs: u8, offset: i32) -> u32 { i(1, rs, 0x10, offset) }
pub fn j(target: u32) -> u32 { 2 << 26 | (target >> 2 & 0x03ff_ffff) }
pub fn jal(target: u32) -> u32 { 3 << 26 | (target >> 2 & 0x03ff_ffff) }
pub fn beq(rs: u8, rt: u8, offset: i32) -> u32 { i(4, rs, rt, offset) }
pub fn bne(rs: u8, rt: u8, offset: i32) -> u32 { i(5, rs, rt, offset) }
pub fn addiu(rt: u8, rs: u8, imm: i32) -> u32 { i(0x09, rs, rt, imm) }
pub fn ori(rt: u8, rs: u8, imm: u16) -> u32 { i(0x0d, rs, rt, imm as i32) }
pub fn lui(rt: u8, imm: u16) -> u32 { i(0x0f, 0, rt, imm as i32) }
pub fn mfc0(rt: u8, rd: u8) -> u32 { 0x10 << 26 | r(0, rt, rd, 0, 0) }
pub fn mtc0(rt: u8, rd: u8) -> u32 { 0x10 << 26 | r(0x04, rt, rd, 0, 0) }
pub fn rfe() -> u32 { 0x10 << 26 | r(0x10, 0, 0, 0, 0x10) }
pub fn mfc2(rt: u8, rd: u8) -> u32 { 0x12 << 26 | r(0, rt, rd, 0, 0) }
pub fn mtc2(rt: u8, rd: u8) -> u32 { 0x12 << 26 | r(0x04, rt, rd, 0, 0) }
pub fn lbu(rt: u8, base: u8, offset: i32) -> u32 { i(0x24, base, rt, offset) }
pub fn lw(rt: u8, base: u8, offset: i32) -> u32 { i(0x23, base, rt, offset) }
pub fn lwl(rt: u8, base: u8, offset: i32) -> u32 { i(0x22, base, rt, offset) }
pub fn lwr(rt: u8, base: u8, offset: i32) -> u32 { i(0x26, base, rt, offset) }
pub fn sb(rt: u8, base: u8, offset: i32) -> u32 { i(0x28, base, rt, offset) }
pub fn sw(rt: u8, base: u8, offset: i32) -> u32 { i(0x2b, base, rt, offset) }
pub fn swl(rt: u8, base: u8, offset: i32) -> u32 { i(0x2a, base, rt, offset) }
pub fn swr(rt: u8, base: u8, offset: i32) -> u32 { i(0x2e, base, rt, offset) }
