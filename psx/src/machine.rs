//! One emulated PlayStation: the CPU, its address space and the components wired to it.
//!
//! Everything that used to be process-wide lives here, so several machines can run side by side.

use std::sync::mpsc::{self, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use common::{ControlMessage, Instance, MakeNamed, Stopped, UpdateMessage, Waker};
use r3000::{BridgeStats, CompilerBridge, DecliningBridge, Gte, Interpreter, RegFile, RunExit, ThreadedBridge};
use timing::{Clock, CpuThread, ManualTimeSource, Rendezvous, Scheduler, SchedulerThread, SystemTimeSource, Time, TimeSource};

use crate::address_space::{AddressSpace, MemoryHandle};
use crate::config::{MachineConfig, TimeMode};
use crate::dma::DmaController;
use crate::exe::{Executable, SHELL_ENTRY};
use crate::interrupts::InterruptController;
use crate::registry::{Component, Device, Registry, Wiring};
use crate::vblank::VBlank;
use crate::ConfigError;

/// Longest a parked execution thread sleeps before taking another look
const MAX_PARK: Duration = Duration::from_millis(50);

/// Told about every busy-wait before the execution thread parks on it
pub trait PollBlockListener: Send + Sync {
    fn poll_blocked(&self, address: u32);
}

/// Why `run_for` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    /// Ran the requested number of instructions
    Budget,
    Breakpoint(u32),
}

pub struct MachineBuilder {
    config: MachineConfig,
    devices: Vec<(Component, Arc<dyn Device>)>,
    gte: Option<Box<dyn Gte>>,
}

impl MachineBuilder {
    pub fn component(mut self, component: Component, device: Arc<dyn Device>) -> Self {
        self.devices.push((component, device));
        self
    }

    pub fn gte(mut self, gte: Box<dyn Gte>) -> Self {
        self.gte = Some(gte);
        self
    }

    pub fn build(self) -> Result<Machine, ConfigError> {
        let config = self.config;
        let rendezvous = Arc::new(Rendezvous::new());

        let bridge: Box<dyn CompilerBridge> = if config.compiler_enabled {
            Box::new(ThreadedBridge::new(config.compiler))
        } else {
            Box::new(DecliningBridge::new())
        };
        let mut interpreter = Interpreter::new(bridge);
        if let Some(gte) = self.gte {
            interpreter.cpu.install_gte(gte);
        }

        let manual = match config.time {
            TimeMode::Realtime => None,
            TimeMode::Deterministic { .. } => Some(Arc::new(ManualTimeSource::new())),
        };
        let source: Arc<dyn TimeSource> = match &manual {
            Some(manual) => manual.clone(),
            None => Arc::new(SystemTimeSource::new()),
        };
        let clock = Arc::new(Clock::new(source, config.clock_granularity)?);
        if manual.is_none() {
            // Real time only moves while the machine runs
            clock.pause();
        }
        let scheduler = Scheduler::new(clock);

        let mut address_space = AddressSpace::new(config.poll, rendezvous.clone());
        let interrupts = InterruptController::new(rendezvous.clone(), interpreter.interrupt_handle());
        address_space.attach_interrupts(interrupts.clone());
        let dma = DmaController::new(address_space.memory(), interrupts.clone());

        let mut registry = Registry::new();
        registry.register(Component::Interrupts, interrupts.clone())?;
        registry.register(Component::Dma, dma.clone())?;
        if let Some(hz) = config.vblank_hz {
            registry.register(Component::VBlank, VBlank::new(hz, interrupts.clone()))?;
        }
        for (component, device) in self.devices {
            registry.register(component, device)?;
        }
        registry.attach_all(&mut Wiring {
            address_space: &mut address_space,
            interrupts: &interrupts,
            dma: &dma,
            scheduler: &scheduler,
        })?;

        tracing::debug!("machine built with {}",
            registry.registered().map(|c| c.name()).collect::<Vec<_>>().join(", "));

        Ok(Machine {
            interpreter,
            address_space,
            interrupts,
            dma,
            scheduler,
            manual_time: manual,
            scheduler_thread: None,
            rendezvous,
            cpu_thread: Arc::new(CpuThread::new()),
            listeners: Vec::new(),
            registry,
            bios_loaded: false,
            pending_exe: None,
            instruction_limit: None,
            parks: 0,
            config,
        })
    }
}

pub struct Machine {
    interpreter: Interpreter,
    address_space: AddressSpace,
    interrupts: Arc<InterruptController>,
    dma: Arc<DmaController>,
    scheduler: Arc<Scheduler>,
    /// Set in deterministic mode, where the machine moves time itself
    manual_time: Option<Arc<ManualTimeSource>>,
    scheduler_thread: Option<SchedulerThread>,
    rendezvous: Arc<Rendezvous>,
    cpu_thread: Arc<CpuThread>,
    listeners: Vec<Arc<dyn PollBlockListener>>,
    registry: Registry,
    bios_loaded: bool,
    /// Waiting for the BIOS to reach the shell
    pending_exe: Option<Executable>,
    instruction_limit: Option<u64>,
    parks: u64,
    config: MachineConfig,
}

impl Machine {
    pub fn builder(config: MachineConfig) -> MachineBuilder {
        MachineBuilder {
            config,
            devices: Vec::new(),
            gte: None,
        }
    }

    pub fn build(config: MachineConfig) -> Result<Machine, ConfigError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn address_space(&mut self) -> &mut AddressSpace {
        &mut self.address_space
    }

    pub fn memory(&self) -> MemoryHandle {
        self.address_space.memory()
    }

    pub fn interrupts(&self) -> &Arc<InterruptController> {
        &self.interrupts
    }

    pub fn dma(&self) -> &Arc<DmaController> {
        &self.dma
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn rendezvous(&self) -> &Arc<Rendezvous> {
        &self.rendezvous
    }

    /// Which host thread is currently running guest code
    pub fn cpu_thread(&self) -> &Arc<CpuThread> {
        &self.cpu_thread
    }

    pub fn is_registered(&self, component: Component) -> bool {
        self.registry.contains(component)
    }

    pub fn registers(&self) -> RegFile {
        self.interpreter.registers()
    }

    pub fn set_registers(&mut self, regs: RegFile) {
        self.interpreter.set_registers(regs);
    }

    pub fn interpreter(&mut self) -> &mut Interpreter {
        &mut self.interpreter
    }

    pub fn bridge_stats(&self) -> BridgeStats {
        self.interpreter.bridge().stats()
    }

    /// Instructions (and exception entries) executed so far
    pub fn steps(&self) -> u64 {
        self.interpreter.steps()
    }

    /// Times the execution thread parked on a busy-wait
    pub fn parks(&self) -> u64 {
        self.parks
    }

    pub fn add_poll_block_listener(&mut self, listener: Arc<dyn PollBlockListener>) {
        self.listeners.push(listener);
    }

    pub fn add_breakpoint(&mut self, address: u32) {
        self.interpreter.add_breakpoint(address);
    }

    pub fn remove_breakpoint(&mut self, address: u32) {
        self.interpreter.remove_breakpoint(address);
    }

    /// `Instance::run` finishes once this many steps have run in total
    pub fn set_instruction_limit(&mut self, limit: Option<u64>) {
        self.instruction_limit = limit;
    }

    pub fn load_bios(&mut self, image: &[u8]) -> Result<(), ConfigError> {
        self.address_space.load_bios(image)?;
        self.bios_loaded = true;
        Ok(())
    }

    /// With a BIOS the executable is side-loaded once the BIOS has booted to the shell,
    /// without one it is loaded and jumped to straight away.
    pub fn load_exe(&mut self, exe: Executable) -> Result<(), ConfigError> {
        if self.bios_loaded {
            tracing::debug!("executable waits for the shell at {:08x}", SHELL_ENTRY);
            self.pending_exe = Some(exe);
            self.interpreter.add_breakpoint(SHELL_ENTRY);
        } else {
            self.start_exe(&exe)?;
        }
        Ok(())
    }

    fn start_exe(&mut self, exe: &Executable) -> Result<(), ConfigError> {
        exe.load(&self.memory())?;
        let mut regs = self.interpreter.registers();
        exe.apply(&mut regs);
        self.interpreter.set_registers(regs);
        Ok(())
    }

    /// Runs `instructions` steps, servicing time and parking on busy-waits along the way
    pub fn run_for(&mut self, instructions: u64) -> Result<Halt, ConfigError> {
        let mut remaining = instructions;
        while remaining > 0 {
            let slice = remaining.min(self.config.slice.max(1));
            let before = self.interpreter.steps();
            let exit = self.interpreter.run(&mut self.address_space, slice);
            let used = self.interpreter.steps() - before;
            remaining = remaining.saturating_sub(used);
            self.advance_time(used);

            match exit {
                RunExit::Budget => {}
                RunExit::PollBlocked => self.park(),
                RunExit::Breakpoint(SHELL_ENTRY) if self.pending_exe.is_some() => {
                    self.interpreter.remove_breakpoint(SHELL_ENTRY);
                    if let Some(exe) = self.pending_exe.take() {
                        tracing::info!("BIOS reached the shell, side-loading executable");
                        self.start_exe(&exe)?;
                    }
                }
                RunExit::Breakpoint(pc) => return Ok(Halt::Breakpoint(pc)),
            }
        }
        Ok(Halt::Budget)
    }

    /// Deterministic mode moves virtual time by the work done and runs whatever fell due
    fn advance_time(&mut self, steps: u64) {
        if let (Some(manual), TimeMode::Deterministic { nanos_per_instruction }) = (&self.manual_time, self.config.time) {
            manual.advance(steps.saturating_mul(nanos_per_instruction));
            self.scheduler.run_due();
        }
    }

    fn park(&mut self) {
        let Some(address) = self.address_space.poll_address() else {
            return;
        };
        for listener in &self.listeners {
            listener.poll_blocked(address);
        }
        self.parks += 1;
        tracing::debug!("parking on {:08x}", address);

        match (&self.manual_time, self.scheduler.next_due()) {
            (Some(manual), Some(due)) => {
                // Nothing else can happen before the next scheduled action, skip straight to it
                let now = self.scheduler.clock().now();
                manual.advance(due.since(now));
                self.scheduler.run_due();
            }
            (Some(_), None) => {}
            (None, _) => loop {
                let due = self.scheduler.next_due();
                let wait = due
                    .and_then(|due| self.scheduler.clock().wall_until(due))
                    .map_or(MAX_PARK, |wait| wait.min(MAX_PARK));
                if self.cpu_thread_wait(wait) || self.address_space.poll_address().is_none() {
                    break;
                }
                if due.map_or(false, |due| self.scheduler.clock().now() >= due) {
                    break;
                }
            },
        }
        self.address_space.unpark();
    }

    /// Blocks until a component notifies the rendezvous or `timeout` passes
    pub fn cpu_thread_wait(&self, timeout: Duration) -> bool {
        let notified = self.rendezvous.cpu_thread_wait_timeout(timeout);
        if notified {
            tracing::debug!("woken");
        }
        notified
    }

    /// Realtime machines start their clock thread, deterministic ones drive time themselves
    fn resume_time(&mut self) -> Result<(), anyhow::Error> {
        if self.manual_time.is_some() {
            return Ok(());
        }
        self.scheduler.clock().resume();
        if self.scheduler_thread.is_none() {
            self.scheduler_thread = Some(self.scheduler.spawn()?);
        }
        self.scheduler.wake();
        Ok(())
    }

    fn pause_time(&mut self) {
        if self.manual_time.is_some() {
            return;
        }
        self.scheduler.clock().pause();
        if let Some(thread) = self.scheduler_thread.take() {
            thread.stop();
        }
    }

    pub fn now(&self) -> Time {
        self.scheduler.clock().now()
    }
}

impl Instance for Machine {
    fn run(&mut self,
        control_rx: &mpsc::Receiver<ControlMessage>,
        update: mpsc::SyncSender<UpdateMessage>
    ) -> Result<Stopped, anyhow::Error> {
        self.cpu_thread.bind_current();
        self.resume_time()?;

        let result = loop {
            match control_rx.try_recv() {
                Ok(ControlMessage::Pause) => break Ok(Stopped::Paused),
                Ok(ControlMessage::Stop) | Err(TryRecvError::Disconnected) => break Ok(Stopped::Finished),
                Err(TryRecvError::Empty) => {}
            }
            let slice = match self.instruction_limit {
                Some(limit) => limit.saturating_sub(self.steps()).min(self.config.slice),
                None => self.config.slice,
            };
            if slice == 0 {
                tracing::info!("instruction limit reached after {} steps", self.steps());
                break Ok(Stopped::Finished);
            }
            match self.run_for(slice) {
                Ok(Halt::Budget) => {}
                Ok(Halt::Breakpoint(pc)) => {
                    tracing::info!("breakpoint at {:08x}", pc);
                    break Ok(Stopped::Paused);
                }
                Err(e) => break Err(anyhow::Error::from(e)),
            }
        };

        self.pause_time();
        self.cpu_thread.release();
        if let Ok(Stopped::Paused) = result {
            // Nobody listening is fine, the instance coming back says the same
            let _ = update.try_send(UpdateMessage::Paused);
        }
        result
    }

    fn waker(&self) -> Waker {
        let rendezvous = self.rendezvous.clone();
        Arc::new(move || rendezvous.cpu_thread_notify())
    }

    fn as_any(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Wiring;

    struct Status;

    impl Device for Status {
        fn attach(self: Arc<Self>, wiring: &mut Wiring<'_>) -> Result<(), ConfigError> {
            wiring.address_space.register_read32_callback(0x1f80_1814, false, |_| 0x1c00_0000)
        }
    }

    #[test]
    fn builds_with_defaults() {
        let machine = Machine::build(MachineConfig::deterministic()).unwrap();
        assert!(machine.is_registered(Component::Interrupts));
        assert!(machine.is_registered(Component::VBlank));
        assert_eq!(machine.scheduler().pending(), 1);
    }

    #[test]
    fn duplicate_components_fail_the_build() {
        let config = MachineConfig::deterministic();
        let result = Machine::builder(config.clone())
            .component(Component::Gpu, Arc::new(Status))
            .component(Component::Gpu, Arc::new(Status))
            .build();
        assert!(matches!(result, Err(ConfigError::DuplicateComponent("gpu"))));

        // Registering the same register from two components is caught too
        let result = Machine::builder(config)
            .component(Component::Gpu, Arc::new(Status))
            .component(Component::Timers, Arc::new(Status))
            .build();
        assert!(matches!(result, Err(ConfigError::DuplicateCallback { address: 0x1f80_1814, .. })));
    }

    #[test]
    fn a_vblank_component_replaces_the_builtin_only_when_disabled() {
        let config = MachineConfig::deterministic();
        let result = Machine::builder(config.clone())
            .component(Component::VBlank, Arc::new(Status))
            .build();
        assert!(matches!(result, Err(ConfigError::DuplicateComponent("vblank"))));

        let config = MachineConfig { vblank_hz: None, ..config };
        Machine::builder(config).component(Component::VBlank, Arc::new(Status)).build().unwrap();
    }
}
