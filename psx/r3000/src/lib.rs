//! The R3000A: the 32-bit MIPS-I CPU at the heart of the PlayStation.
//!
//! The core is split the same way the hardware is: a table driven decoder, the architectural
//! state (`RegFile` and the `Cop0` system control coprocessor), and an execute stage (`Cpu`) that
//! both the `Interpreter` and compiled code drive. Everything outside the CPU is reached through
//! the `Bus` trait.

pub mod asm;
pub mod bus;
pub mod compiler;
pub mod cop0;
pub mod cpu;
pub mod exception;
pub mod instructions;
pub mod interpreter;
pub mod regfile;
#[cfg(test)]
mod testing;

pub use bus::Bus;
pub use compiler::{BridgeStats, CompilerBridge, CompilerConfig, DecliningBridge, InterruptHandle, ThreadedBridge};
pub use cpu::{Cpu, Gte};
pub use exception::Exception;
pub use instructions::{decode, Instruction, InstructionDescriptor};
pub use interpreter::{Interpreter, RunExit, StepOutcome};
pub use regfile::{RegFile, RESET_VECTOR};
