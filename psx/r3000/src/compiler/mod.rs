//! The optional acceleration layer between the interpreter and hot call targets.
//!
//! The interpreter offers every `jal`/`jalr` target to a `CompilerBridge` once the delay slot has
//! executed. The bridge either runs the whole call to its return and reports true, or hands
//! control straight back. Declining is always correct: the interpreter on its own is a complete
//! implementation.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::instructions::Instruction;
use crate::{Bus, Cpu, Exception, RegFile};

mod simulate;
mod threaded;
mod unit;

pub use simulate::{simulate, KnownRegs};
pub use threaded::ThreadedBridge;
pub use unit::{compile_region, CompiledUnit, MicroOp};

/// Everything a bridge may touch while it holds control
pub struct CallContext<'a> {
    pub cpu: &'a mut Cpu,
    pub bus: &'a mut dyn Bus,
    /// Instructions left in the current slice. Compiled code decrements it as it retires.
    pub budget: &'a mut u64,
}

/// Something that went wrong while compiled code held control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerFault {
    /// The guest faulted; state is precise at the faulting instruction
    Guest(Exception),
    /// The unit being executed was overwritten underneath us
    Invalidated,
}

/// How `exception_in_compiler` dealt with a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Resolved in place, compiled execution may carry on
    Handled,
    /// Handed to the guest's exception handler, control goes back to the interpreter
    Propagate,
}

/// Asks compiled code to hand control back at its next safe point. Cheap to clone, callable from
/// any thread.
#[derive(Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Consumes a pending request
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompilerConfig {
    /// Calls to a target before it is compiled
    pub threshold: u32,
    /// Longest unit, in instructions
    pub max_unit_len: usize,
    /// Invalidations after which a target is left to the interpreter for good
    pub max_invalidations: u32,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            threshold: 8,
            max_unit_len: 1024,
            max_invalidations: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub compiled_units: u64,
    pub invalidations: u64,
    pub completed_calls: u64,
    pub declined_calls: u64,
    pub early_exits: u64,
    pub guest_faults: u64,
    pub folded_ops: u64,
}

pub trait CompilerBridge: Send {
    /// Offered after the delay slot of a call to `address` has executed. Returns true if the call
    /// ran to completion, leaving the PC at `return_address`.
    fn jump_and_link(&mut self, ctx: &mut CallContext<'_>, address: u32, return_address: u32) -> bool;

    /// Classifies a fault raised while compiled code held control. Leaves the register file
    /// consistent either way.
    fn exception_in_compiler(&mut self, cpu: &mut Cpu, bus: &mut dyn Bus, fault: CompilerFault) -> Disposition;

    /// Discards everything compiled from the physical `range`
    fn clear_cache(&mut self, range: Range<u32>);

    /// Returns false if compiled execution can't be guaranteed to stop at `address`, in which case
    /// the caller must stop using the bridge until the breakpoint is accepted.
    fn add_breakpoint(&mut self, address: u32) -> bool;

    fn remove_breakpoint(&mut self, address: u32);

    fn interrupt_handle(&self) -> InterruptHandle;

    /// Any thread. Compiled execution hands back at its next safe point.
    fn interrupt(&self) {
        self.interrupt_handle().raise()
    }

    /// Puts the interpreter back in charge, dropping any bookkeeping about calls in progress
    fn restore_interpreter_state(&mut self, cpu: &mut Cpu);

    /// Snapshot of the canonical register file
    fn registers(&self, cpu: &Cpu) -> RegFile {
        cpu.regs.clone()
    }

    fn set_registers(&mut self, cpu: &mut Cpu, regs: RegFile) {
        cpu.regs = regs;
    }

    /// Constant-folds `inst` if it is simulatable and its inputs are known. Leaves `known`
    /// untouched when it returns false.
    fn simulate(&self, inst: Instruction, known: &mut KnownRegs) -> bool {
        simulate(inst, known)
    }

    fn stats(&self) -> BridgeStats {
        BridgeStats::default()
    }
}

/// Never compiles anything
#[derive(Default)]
pub struct DecliningBridge {
    interrupt: InterruptHandle,
    declined: u64,
}

impl DecliningBridge {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CompilerBridge for DecliningBridge {
    fn jump_and_link(&mut self, _ctx: &mut CallContext<'_>, _address: u32, _return_address: u32) -> bool {
        self.declined += 1;
        false
    }

    fn exception_in_compiler(&mut self, cpu: &mut Cpu, bus: &mut dyn Bus, fault: CompilerFault) -> Disposition {
        match fault {
            CompilerFault::Guest(exception) => {
                cpu.raise(bus, exception);
                Disposition::Propagate
            }
            CompilerFault::Invalidated => Disposition::Handled,
        }
    }

    fn clear_cache(&mut self, _range: Range<u32>) {}

    fn add_breakpoint(&mut self, _address: u32) -> bool {
        true
    }

    fn remove_breakpoint(&mut self, _address: u32) {}

    fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    fn restore_interpreter_state(&mut self, _cpu: &mut Cpu) {}

    fn simulate(&self, _inst: Instruction, _known: &mut KnownRegs) -> bool {
        false
    }

    fn stats(&self) -> BridgeStats {
        BridgeStats {
            declined_calls: self.declined,
            ..BridgeStats::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_handle_is_shared() {
        let handle = InterruptHandle::new();
        let other = handle.clone();
        assert!(!handle.is_raised());
        std::thread::spawn(move || other.raise()).join().unwrap();
        assert!(handle.take());
        assert!(!handle.take());
    }
}
