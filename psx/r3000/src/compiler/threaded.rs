use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use std::sync::Arc;

use crate::instructions::{BranchType, Instruction};
use crate::{Bus, Cpu};

use super::unit::{compile_region, CompiledUnit};
use super::{BridgeStats, CallContext, CompilerBridge, CompilerConfig, CompilerFault, Disposition, InterruptHandle};

/// Nested calls deeper than this run inline in the outer call's loop
const MAX_CALL_DEPTH: usize = 64;

const SP: u8 = 29;

enum TargetState {
    Interpreted { calls: u32 },
    Compiled { unit: Arc<CompiledUnit>, invalidations: u32 },
    Invalidated { count: u32 },
}

enum CallExit {
    /// Returned to the caller
    Completed,
    /// Nothing was executed
    Declined,
    /// Stopped part way through; the interpreter carries on from the current PC
    Exited,
}

/// Runs hot call targets as pre-decoded threaded code.
///
/// Units execute directly against the canonical register file, so there is never any state to
/// write back when control returns to the interpreter.
pub struct ThreadedBridge {
    config: CompilerConfig,
    targets: HashMap<u32, TargetState>,
    breakpoints: BTreeSet<u32>,
    /// Entry points of the units currently executing, innermost last
    in_flight: Vec<Arc<CompiledUnit>>,
    interrupt: InterruptHandle,
    stats: BridgeStats,
}

impl ThreadedBridge {
    pub fn new(config: CompilerConfig) -> Self {
        ThreadedBridge {
            config,
            targets: HashMap::new(),
            breakpoints: BTreeSet::new(),
            in_flight: Vec::new(),
            interrupt: InterruptHandle::new(),
            stats: BridgeStats::default(),
        }
    }

    /// The live unit for `address`, if it is compiled
    pub fn unit(&self, address: u32) -> Option<Arc<CompiledUnit>> {
        match self.targets.get(&address) {
            Some(TargetState::Compiled { unit, .. }) => Some(unit.clone()),
            _ => None,
        }
    }

    fn is_live(&self, unit: &Arc<CompiledUnit>) -> bool {
        matches!(self.targets.get(&unit.start), Some(TargetState::Compiled { unit: live, .. }) if Arc::ptr_eq(live, unit))
    }

    /// True when `unit` was invalidated and the frame running it should carry on from the freshly
    /// written memory instead.
    fn drop_stale(&mut self, ctx: &mut CallContext<'_>, unit: &Option<Arc<CompiledUnit>>) -> bool {
        let stale = unit.as_ref().map_or(false, |unit| !self.is_live(unit));
        stale && self.exception_in_compiler(ctx.cpu, &mut *ctx.bus, CompilerFault::Invalidated) == Disposition::Handled
    }

    fn lookup(&mut self, bus: &mut dyn Bus, address: u32) -> Option<Arc<CompiledUnit>> {
        if self.breakpoints.contains(&address) {
            return None;
        }

        let invalidations = match self.targets.entry(address).or_insert(TargetState::Interpreted { calls: 0 }) {
            TargetState::Compiled { unit, .. } => return Some(unit.clone()),
            TargetState::Interpreted { calls } => {
                *calls += 1;
                if *calls < self.config.threshold {
                    return None;
                }
                0
            }
            TargetState::Invalidated { count } => {
                if *count >= self.config.max_invalidations {
                    return None;
                }
                *count
            }
        };

        match self.compile(bus, address) {
            Some(unit) => {
                let unit = Arc::new(unit);
                tracing::debug!(
                    "compiled {:08x}..{:08x}, {} ops, {} folded",
                    unit.start,
                    unit.end(),
                    unit.ops.len(),
                    unit.folded_ops()
                );
                self.stats.compiled_units += 1;
                self.stats.folded_ops += unit.folded_ops() as u64;
                self.targets.insert(address, TargetState::Compiled { unit: unit.clone(), invalidations });
                Some(unit)
            }
            None => {
                self.targets.insert(address, TargetState::Interpreted { calls: 0 });
                None
            }
        }
    }

    /// Scans forward from `address` to find the body of the function.
    ///
    /// Stops at a breakpoint, an unreadable word, or the delay slot of a return or jump that no
    /// earlier branch reaches past.
    fn compile(&self, bus: &mut dyn Bus, address: u32) -> Option<CompiledUnit> {
        if address & 3 != 0 {
            return None;
        }

        let mut instructions: Vec<Instruction> = Vec::new();
        let mut furthest_target = address;
        let mut stop_after: Option<usize> = None;

        while instructions.len() < self.config.max_unit_len {
            let pc = address.wrapping_add(instructions.len() as u32 * 4);
            if self.breakpoints.contains(&pc) {
                break;
            }
            let inst = match bus.fetch(pc) {
                Ok(word) => Instruction::decode(word),
                Err(_) => break,
            };
            instructions.push(inst);

            if stop_after == Some(instructions.len()) {
                break;
            }

            let info = inst.info();
            if info.is_invalid() {
                break;
            }
            match info.branch {
                BranchType::Never => {}
                BranchType::Conditional => {
                    let target = inst.branch_target(pc);
                    if target > furthest_target {
                        furthest_target = target;
                    }
                }
                BranchType::Always => {
                    let leaves = info.is_return() || !info.is_call();
                    if leaves && furthest_target <= pc.wrapping_add(4) {
                        // include the delay slot, then stop
                        stop_after = Some(instructions.len() + 1);
                    }
                }
            }
        }

        if instructions.is_empty() {
            return None;
        }
        Some(compile_region(address, bus.physical(address), &instructions))
    }

    fn call(&mut self, ctx: &mut CallContext<'_>, address: u32, return_address: u32, depth: usize) -> CallExit {
        let unit = match self.lookup(&mut *ctx.bus, address) {
            Some(unit) => unit,
            None => return CallExit::Declined,
        };

        self.in_flight.push(unit.clone());
        let exit = self.execute(ctx, unit, return_address, depth);
        self.in_flight.pop();
        exit
    }

    fn execute(&mut self, ctx: &mut CallContext<'_>, unit: Arc<CompiledUnit>, return_address: u32, depth: usize) -> CallExit {
        let entry_sp = ctx.cpu.regs.read(SP);
        let mut unit = Some(unit);
        let mut last_index: Option<usize> = None;
        let mut run_start = 0;
        let mut pending_call: Option<(u32, u32)> = None;

        loop {
            let pc = ctx.cpu.regs.pc;

            if !ctx.cpu.regs.delay_slot {
                if pc == return_address && ctx.cpu.regs.read(SP) == entry_sp {
                    return CallExit::Completed;
                }

                // Safe point: state is precise between instructions outside a delay slot
                if self.interrupt.take() {
                    ctx.cpu.compiler_interrupted(&mut *ctx.bus);
                    return CallExit::Exited;
                }
                if *ctx.budget == 0 || ctx.bus.park_requested() || ctx.cpu.interrupt_ready(&mut *ctx.bus) {
                    return CallExit::Exited;
                }
            }

            if self.breakpoints.contains(&pc) {
                return CallExit::Exited;
            }

            let index = unit.as_ref().and_then(|unit| unit.index(pc));
            let (inst, folded) = match (unit.as_ref(), index) {
                (Some(unit), Some(index)) => {
                    if index == 0 || last_index != Some(index - 1) {
                        run_start = index;
                    }
                    let op = &unit.ops[index];
                    (op.inst, op.folded.filter(|_| run_start <= op.block))
                }
                _ => match ctx.cpu.fetch(&mut *ctx.bus) {
                    Ok(inst) => (inst, None),
                    Err(e) => match self.exception_in_compiler(ctx.cpu, &mut *ctx.bus, CompilerFault::Guest(e)) {
                        Disposition::Handled => continue,
                        Disposition::Propagate => return CallExit::Exited,
                    },
                },
            };
            last_index = index;
            *ctx.budget = ctx.budget.saturating_sub(1);

            let result = match folded {
                Some(value) => {
                    ctx.cpu.retire_folded(inst, value);
                    Ok(())
                }
                None => ctx.cpu.execute(&mut *ctx.bus, inst),
            };
            if let Err(e) = result {
                match self.exception_in_compiler(ctx.cpu, &mut *ctx.bus, CompilerFault::Guest(e)) {
                    Disposition::Handled => continue,
                    Disposition::Propagate => return CallExit::Exited,
                }
            }

            if inst.info().is_store() {
                if let Some(range) = ctx.bus.take_dirty_code() {
                    self.clear_cache(range);
                    if self.drop_stale(ctx, &unit) {
                        unit = None;
                        last_index = None;
                    }
                }
            }

            let offered = pending_call.take();
            if inst.info().is_call() {
                pending_call = Some((ctx.cpu.regs.next_pc, pc.wrapping_add(8)));
            } else if let Some((target, link)) = offered {
                if ctx.cpu.regs.pc == target && depth < MAX_CALL_DEPTH {
                    match self.call(ctx, target, link, depth + 1) {
                        // Callee is uncompiled, run it from here
                        CallExit::Declined => {}
                        // The callee may have rewritten this unit
                        CallExit::Completed => {
                            if self.drop_stale(ctx, &unit) {
                                unit = None;
                                last_index = None;
                            }
                        }
                        CallExit::Exited => return CallExit::Exited,
                    }
                }
            }
        }
    }
}

impl CompilerBridge for ThreadedBridge {
    fn jump_and_link(&mut self, ctx: &mut CallContext<'_>, address: u32, return_address: u32) -> bool {
        match self.call(ctx, address, return_address, 0) {
            CallExit::Completed => {
                self.stats.completed_calls += 1;
                true
            }
            CallExit::Declined => {
                self.stats.declined_calls += 1;
                false
            }
            CallExit::Exited => {
                self.stats.early_exits += 1;
                false
            }
        }
    }

    fn exception_in_compiler(&mut self, cpu: &mut Cpu, bus: &mut dyn Bus, fault: CompilerFault) -> Disposition {
        match fault {
            CompilerFault::Invalidated => Disposition::Handled,
            CompilerFault::Guest(exception) => {
                self.stats.guest_faults += 1;
                cpu.raise(bus, exception);
                Disposition::Propagate
            }
        }
    }

    fn clear_cache(&mut self, range: Range<u32>) {
        for state in self.targets.values_mut() {
            if let TargetState::Compiled { unit, invalidations } = state {
                if unit.overlaps(&range) {
                    tracing::debug!("invalidating {:08x}..{:08x}", unit.start, unit.end());
                    *state = TargetState::Invalidated { count: *invalidations + 1 };
                    self.stats.invalidations += 1;
                }
            }
        }
    }

    fn add_breakpoint(&mut self, address: u32) -> bool {
        if self.in_flight.iter().any(|unit| unit.contains(address)) {
            return false;
        }

        self.breakpoints.insert(address);
        for state in self.targets.values_mut() {
            if let TargetState::Compiled { unit, invalidations } = state {
                if unit.contains(address) {
                    // Doesn't count against the target, the code didn't change
                    *state = TargetState::Invalidated { count: *invalidations };
                }
            }
        }
        true
    }

    fn remove_breakpoint(&mut self, address: u32) {
        self.breakpoints.remove(&address);
        // Units cut short by the breakpoint get rebuilt at full length
        for state in self.targets.values_mut() {
            if let TargetState::Compiled { unit, invalidations } = state {
                if unit.end() == address {
                    *state = TargetState::Invalidated { count: *invalidations };
                }
            }
        }
    }

    fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    fn restore_interpreter_state(&mut self, _cpu: &mut Cpu) {
        self.in_flight.clear();
    }

    fn stats(&self) -> BridgeStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm;
    use crate::cop0;
    use crate::testing::FlatBus;

    const CALLER: u32 = 0x100;
    const FUNC: u32 = 0x400;

    /// `func` adds 0x10 to $v0 through a folded constant and returns
    fn program(bus: &mut FlatBus) {
        bus.load(FUNC, &[
            asm::lui(8, 0),
            asm::ori(8, 8, 0x10),
            asm::addu(2, 2, 8),
            asm::jr(31),
            asm::NOP,
        ]);
    }

    fn config() -> CompilerConfig {
        CompilerConfig { threshold: 1, ..CompilerConfig::default() }
    }

    fn enter(cpu: &mut Cpu) {
        // State right after `jal FUNC` at CALLER and its delay slot
        cpu.regs.jump(FUNC);
        cpu.regs.write(31, CALLER + 8);
    }

    fn run_call(bridge: &mut ThreadedBridge, cpu: &mut Cpu, bus: &mut FlatBus, budget: &mut u64) -> bool {
        let mut ctx = CallContext { cpu, bus, budget };
        bridge.jump_and_link(&mut ctx, FUNC, CALLER + 8)
    }

    #[test]
    fn compiles_and_completes_a_call() {
        let mut bus = FlatBus::new(0x1000);
        program(&mut bus);
        let mut bridge = ThreadedBridge::new(config());
        let mut cpu = Cpu::new();
        enter(&mut cpu);
        let mut budget = 100;

        assert!(run_call(&mut bridge, &mut cpu, &mut bus, &mut budget));
        assert_eq!(cpu.regs.pc, CALLER + 8);
        assert_eq!(cpu.regs.read(2), 0x10);
        assert_eq!(budget, 95);

        let unit = bridge.unit(FUNC).unwrap();
        assert_eq!(unit.ops.len(), 5);
        assert_eq!(bridge.stats().compiled_units, 1);
        assert_eq!(bridge.stats().completed_calls, 1);
    }

    #[test]
    fn declines_until_the_threshold() {
        let mut bus = FlatBus::new(0x1000);
        program(&mut bus);
        let mut bridge = ThreadedBridge::new(CompilerConfig { threshold: 3, ..CompilerConfig::default() });
        let mut cpu = Cpu::new();
        let mut budget = 100;

        for _ in 0..2 {
            enter(&mut cpu);
            assert!(!run_call(&mut bridge, &mut cpu, &mut bus, &mut budget));
            assert_eq!(cpu.regs.pc, FUNC);
        }
        enter(&mut cpu);
        assert!(run_call(&mut bridge, &mut cpu, &mut bus, &mut budget));
        assert_eq!(bridge.stats().declined_calls, 2);
    }

    #[test]
    fn overwritten_code_is_never_run_stale() {
        let mut bus = FlatBus::new(0x1000);
        program(&mut bus);
        let mut bridge = ThreadedBridge::new(config());
        let mut cpu = Cpu::new();
        let mut budget = 100;

        enter(&mut cpu);
        assert!(run_call(&mut bridge, &mut cpu, &mut bus, &mut budget));

        // Guest rewrites `ori $t0, $t0, 0x10` to `ori $t0, $t0, 0x20`
        cpu.regs.jump(0x200);
        bus.load(0x200, &[asm::sw(9, 0, (FUNC + 4) as i32)]);
        cpu.regs.write(9, asm::ori(8, 8, 0x20));
        let inst = cpu.fetch(&mut bus).unwrap();
        cpu.execute(&mut bus, inst).unwrap();
        let dirty = bus.take_dirty_code().unwrap();
        bridge.clear_cache(dirty);
        assert!(bridge.unit(FUNC).is_none());

        enter(&mut cpu);
        cpu.regs.write(2, 0);
        assert!(run_call(&mut bridge, &mut cpu, &mut bus, &mut budget));
        assert_eq!(cpu.regs.read(2), 0x20);
        assert_eq!(bridge.stats().invalidations, 1);
    }

    #[test]
    fn self_modification_inside_the_unit() {
        let mut bus = FlatBus::new(0x1000);
        // Patches its own next instruction before reaching it
        bus.load(FUNC, &[
            asm::sw(9, 0, (FUNC + 8) as i32),
            asm::NOP,
            asm::addiu(2, 0, 1),
            asm::jr(31),
            asm::NOP,
        ]);
        let mut bridge = ThreadedBridge::new(config());
        let mut cpu = Cpu::new();
        let mut budget = 100;

        enter(&mut cpu);
        cpu.regs.write(9, asm::addiu(2, 0, 2));
        assert!(run_call(&mut bridge, &mut cpu, &mut bus, &mut budget));
        assert_eq!(cpu.regs.read(2), 2);
    }

    #[test]
    fn interrupt_request_exits_at_a_safe_point() {
        let mut bus = FlatBus::new(0x1000);
        program(&mut bus);
        let mut bridge = ThreadedBridge::new(config());
        let mut cpu = Cpu::new();
        let mut budget = 100;

        bridge.interrupt();
        enter(&mut cpu);
        assert!(!run_call(&mut bridge, &mut cpu, &mut bus, &mut budget));
        assert_eq!(cpu.regs.pc, FUNC);
        assert_eq!(cpu.compiler_interrupts, 1);
        assert_eq!(bus.poll_clears, 1);

        // The request was consumed
        enter(&mut cpu);
        assert!(run_call(&mut bridge, &mut cpu, &mut bus, &mut budget));
    }

    #[test]
    fn budget_exhaustion_hands_back() {
        let mut bus = FlatBus::new(0x1000);
        program(&mut bus);
        let mut bridge = ThreadedBridge::new(config());
        let mut cpu = Cpu::new();
        let mut budget = 2;

        enter(&mut cpu);
        assert!(!run_call(&mut bridge, &mut cpu, &mut bus, &mut budget));
        assert_eq!(cpu.regs.pc, FUNC + 8);
        assert_eq!(budget, 0);
    }

    #[test]
    fn guest_faults_vector_and_propagate() {
        let mut bus = FlatBus::new(0x1000);
        bus.load(FUNC, &[asm::syscall(), asm::jr(31), asm::NOP]);
        let mut bridge = ThreadedBridge::new(config());
        let mut cpu = Cpu::new();
        cpu.cop0.write(cop0::SR, 0);
        let mut budget = 100;

        enter(&mut cpu);
        assert!(!run_call(&mut bridge, &mut cpu, &mut bus, &mut budget));
        assert_eq!(cpu.regs.pc, 0x8000_0080);
        assert_eq!(cpu.cop0.epc(), FUNC);
        assert_eq!(bridge.stats().guest_faults, 1);
    }

    #[test]
    fn breakpoints_are_never_compiled_over() {
        let mut bus = FlatBus::new(0x1000);
        program(&mut bus);
        let mut bridge = ThreadedBridge::new(config());
        let mut cpu = Cpu::new();
        let mut budget = 100;

        enter(&mut cpu);
        assert!(run_call(&mut bridge, &mut cpu, &mut bus, &mut budget));

        // Idle unit: accepted, and the unit is thrown away
        assert!(bridge.add_breakpoint(FUNC + 8));
        assert!(bridge.unit(FUNC).is_none());

        enter(&mut cpu);
        assert!(!run_call(&mut bridge, &mut cpu, &mut bus, &mut budget));
        assert_eq!(cpu.regs.pc, FUNC + 8);
        assert_eq!(bridge.unit(FUNC).unwrap().ops.len(), 2);

        bridge.remove_breakpoint(FUNC + 8);
        assert!(bridge.unit(FUNC).is_none());
    }

    #[test]
    fn breakpoints_inside_running_units_are_refused() {
        let mut bridge = ThreadedBridge::new(config());
        let instructions: Vec<_> = [asm::NOP, asm::jr(31), asm::NOP].iter().copied().map(Instruction::decode).collect();
        bridge.in_flight.push(Arc::new(compile_region(FUNC, FUNC, &instructions)));

        assert!(!bridge.add_breakpoint(FUNC + 4));
        assert!(bridge.add_breakpoint(FUNC + 0x100));

        let mut cpu = Cpu::new();
        bridge.restore_interpreter_state(&mut cpu);
        assert!(bridge.add_breakpoint(FUNC + 4));
    }

    #[test]
    fn nested_calls_run_in_place() {
        let mut bus = FlatBus::new(0x1000);
        const LEAF: u32 = 0x600;
        bus.load(FUNC, &[
            asm::addiu(29, 29, -8),
            asm::sw(31, 29, 0),
            asm::jal(LEAF),
            asm::NOP,
            asm::lw(31, 29, 0),
            asm::addiu(29, 29, 8),
            asm::jr(31),
            asm::NOP,
        ]);
        bus.load(LEAF, &[asm::jr(31), asm::addiu(2, 2, 5)]);
        let mut bridge = ThreadedBridge::new(config());
        let mut cpu = Cpu::new();
        cpu.regs.write(SP, 0x800);
        let mut budget = 100;

        enter(&mut cpu);
        assert!(run_call(&mut bridge, &mut cpu, &mut bus, &mut budget));
        assert_eq!(cpu.regs.read(2), 5);
        assert_eq!(cpu.regs.read(SP), 0x800);
        assert!(bridge.unit(LEAF).is_some());
    }

    #[test]
    fn callee_rewriting_its_caller_is_seen_on_return() {
        let mut bus = FlatBus::new(0x1000);
        const LEAF: u32 = 0x600;
        bus.load(FUNC, &[
            asm::addiu(29, 29, -8),
            asm::sw(31, 29, 0),
            asm::jal(LEAF),
            asm::NOP,
            asm::addiu(2, 0, 1),
            asm::lw(31, 29, 0),
            asm::addiu(29, 29, 8),
            asm::jr(31),
            asm::NOP,
        ]);
        // Rewrites `addiu $v0, $zero, 1` in the caller to `addiu $v0, $zero, 2`
        bus.load(LEAF, &[asm::sw(9, 0, (FUNC + 16) as i32), asm::jr(31), asm::NOP]);
        let mut bridge = ThreadedBridge::new(config());
        let mut cpu = Cpu::new();
        cpu.regs.write(SP, 0x800);
        cpu.regs.write(9, asm::addiu(2, 0, 2));
        let mut budget = 100;

        enter(&mut cpu);
        assert!(run_call(&mut bridge, &mut cpu, &mut bus, &mut budget));
        assert_eq!(cpu.regs.read(2), 2);
        assert_eq!(cpu.regs.read(SP), 0x800);
        assert_eq!(bridge.stats().invalidations, 1);
        assert!(bridge.unit(LEAF).is_some());
        assert!(bridge.unit(FUNC).is_none());
    }

    #[test]
    fn repeatedly_invalidated_targets_stay_interpreted() {
        let mut bus = FlatBus::new(0x1000);
        program(&mut bus);
        let mut bridge = ThreadedBridge::new(CompilerConfig { threshold: 1, max_invalidations: 2, ..CompilerConfig::default() });
        let mut cpu = Cpu::new();
        let mut budget = 1000;

        for _ in 0..2 {
            enter(&mut cpu);
            assert!(run_call(&mut bridge, &mut cpu, &mut bus, &mut budget));
            bridge.clear_cache(FUNC..FUNC + 4);
        }
        enter(&mut cpu);
        assert!(!run_call(&mut bridge, &mut cpu, &mut bus, &mut budget));
        assert_eq!(cpu.regs.pc, FUNC);
    }
}
