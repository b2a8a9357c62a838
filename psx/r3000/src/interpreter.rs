use std::collections::BTreeSet;

use crate::compiler::{CallContext, CompilerBridge, DecliningBridge, InterruptHandle};
use crate::{Bus, Cpu, Exception, RegFile};

/// Why `run` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// The instruction budget ran out
    Budget,
    /// About to execute a breakpointed address
    Breakpoint(u32),
    /// The address space recognised a busy-wait and wants the thread parked
    PollBlocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Retired,
    /// The guest took an exception (already vectored)
    Exception(Exception),
    Breakpoint(u32),
}

#[derive(Clone, Copy)]
struct PendingCall {
    target: u32,
    return_address: u32,
}

/// Fetch, decode, execute. Offers calls to the compiler bridge once their delay slot has run.
pub struct Interpreter {
    pub cpu: Cpu,
    bridge: Box<dyn CompilerBridge>,
    interrupt: InterruptHandle,
    breakpoints: BTreeSet<u32>,
    /// Breakpoints the bridge refused; compiled execution is off while any are waiting
    deferred: BTreeSet<u32>,
    /// Set after stopping at a breakpoint, so resuming executes it instead of stopping again
    resume_from: Option<u32>,
    pending_call: Option<PendingCall>,
    steps: u64,
}

impl Interpreter {
    pub fn new(bridge: Box<dyn CompilerBridge>) -> Interpreter {
        let interrupt = bridge.interrupt_handle();
        Interpreter {
            cpu: Cpu::new(),
            bridge,
            interrupt,
            breakpoints: BTreeSet::new(),
            deferred: BTreeSet::new(),
            resume_from: None,
            pending_call: None,
            steps: 0,
        }
    }

    /// Plain interpreter, never compiles
    pub fn interpreter_only() -> Interpreter {
        Self::new(Box::new(DecliningBridge::new()))
    }

    pub fn bridge(&self) -> &dyn CompilerBridge {
        self.bridge.as_ref()
    }

    /// Handle other threads use to pull execution out of compiled code
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn registers(&self) -> RegFile {
        self.bridge.registers(&self.cpu)
    }

    pub fn set_registers(&mut self, regs: RegFile) {
        self.pending_call = None;
        self.bridge.set_registers(&mut self.cpu, regs);
    }

    pub fn add_breakpoint(&mut self, address: u32) {
        self.breakpoints.insert(address);
        if !self.bridge.add_breakpoint(address) {
            tracing::debug!("compiled code can't stop at {:08x} yet, interpreting until it can", address);
            self.deferred.insert(address);
        }
    }

    pub fn remove_breakpoint(&mut self, address: u32) {
        self.breakpoints.remove(&address);
        self.deferred.remove(&address);
        self.bridge.remove_breakpoint(address);
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = u32> + '_ {
        self.breakpoints.iter().copied()
    }

    /// True while the bridge may be offered calls
    pub fn compiled_execution_enabled(&self) -> bool {
        self.deferred.is_empty()
    }

    /// Executes a single instruction (or takes a pending interrupt)
    pub fn step<B: Bus>(&mut self, bus: &mut B) -> StepOutcome {
        let mut budget = 1;
        self.step_inner(bus, &mut budget)
    }

    /// Runs until the budget is spent, a breakpoint is reached or the bus asks to park
    pub fn run<B: Bus>(&mut self, bus: &mut B, budget: u64) -> RunExit {
        if !self.deferred.is_empty() {
            let bridge = &mut self.bridge;
            self.deferred.retain(|address| !bridge.add_breakpoint(*address));
        }
        // Code may have been overwritten by DMA since the last slice
        self.sync_code(bus);

        let mut remaining = budget;
        let exit = loop {
            if bus.park_requested() {
                break RunExit::PollBlocked;
            }
            if remaining == 0 {
                break RunExit::Budget;
            }
            if let StepOutcome::Breakpoint(pc) = self.step_inner(bus, &mut remaining) {
                break RunExit::Breakpoint(pc);
            }
        };
        self.steps += budget - remaining;
        exit
    }

    /// Budget consumed by `run` so far, counting interrupts and exceptions as well as
    /// instructions
    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn step_inner<B: Bus>(&mut self, bus: &mut B, budget: &mut u64) -> StepOutcome {
        *budget = budget.saturating_sub(1);

        if !self.cpu.regs.delay_slot && self.cpu.check_interrupts(bus) {
            self.pending_call = None;
            return StepOutcome::Exception(Exception::Interrupt);
        }

        let pc = self.cpu.regs.pc;
        if self.breakpoints.contains(&pc) && self.resume_from.take() != Some(pc) {
            *budget += 1;
            self.resume_from = Some(pc);
            return StepOutcome::Breakpoint(pc);
        }
        self.resume_from = None;

        let offered = self.pending_call.take();

        let inst = match self.cpu.fetch(bus) {
            Ok(inst) => inst,
            Err(e) => {
                self.cpu.raise(bus, e);
                return StepOutcome::Exception(e);
            }
        };
        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!("{:08x}: {}", pc, inst.disassemble(pc));
        }

        if let Err(e) = self.cpu.execute(bus, inst) {
            self.cpu.raise(bus, e);
            return StepOutcome::Exception(e);
        }

        if inst.info().is_store() {
            self.sync_code(bus);
        }

        if inst.info().is_call() {
            self.pending_call = Some(PendingCall {
                target: self.cpu.regs.next_pc,
                return_address: pc.wrapping_add(8),
            });
        } else if let Some(call) = offered {
            if self.cpu.regs.pc == call.target {
                self.offer(bus, call, budget);
            }
        }

        StepOutcome::Retired
    }

    fn offer<B: Bus>(&mut self, bus: &mut B, call: PendingCall, budget: &mut u64) {
        if !self.compiled_execution_enabled() || *budget == 0 {
            return;
        }
        if self.interrupt.take() {
            // Take the interrupt in the interpreter first
            self.cpu.compiler_interrupted(bus);
            return;
        }

        let mut ctx = CallContext {
            cpu: &mut self.cpu,
            bus,
            budget,
        };
        if !self.bridge.jump_and_link(&mut ctx, call.target, call.return_address) {
            self.bridge.restore_interpreter_state(&mut self.cpu);
        }
    }

    /// Forwards overwritten code ranges to the bridge
    fn sync_code<B: Bus>(&mut self, bus: &mut B) {
        if let Some(range) = bus.take_dirty_code() {
            self.bridge.clear_cache(range);
        }
    }
}
