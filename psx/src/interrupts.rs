use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use common::util::ByteMask;
use common::{EnumMap, MakeNamed, Named};
use r3000::InterruptHandle;
use timing::Rendezvous;

use crate::registry::{Device, Wiring};
use crate::ConfigError;

pub const I_STAT: u32 = 0x1f80_1070;
pub const I_MASK: u32 = 0x1f80_1074;

#[derive(Named, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    #[named(name = "vblank")]
    VBlank,
    Gpu,
    Cdrom,
    Dma,
    Timer0,
    Timer1,
    Timer2,
    Serial,
}

impl Interrupt {
    pub fn bit(self) -> u32 {
        1 << usize::from(self)
    }
}

/// I_STAT and I_MASK. Any thread may raise a line; the CPU samples `pending` between
/// instructions, it is never preempted.
pub struct InterruptController {
    stat: AtomicU32,
    mask: AtomicU32,
    owners: Mutex<EnumMap<Option<String>, Interrupt>>,
    rendezvous: Arc<Rendezvous>,
    compiler: InterruptHandle,
}

impl InterruptController {
    pub fn new(rendezvous: Arc<Rendezvous>, compiler: InterruptHandle) -> Arc<Self> {
        Arc::new(InterruptController {
            stat: AtomicU32::new(0),
            mask: AtomicU32::new(0),
            owners: Mutex::new(EnumMap::new()),
            rendezvous,
            compiler,
        })
    }

    /// Claims `line` for `owner`. Each line has one owner.
    pub fn register_owner(&self, line: Interrupt, owner: &str) -> Result<(), ConfigError> {
        let mut owners = self.owners.lock().expect("interrupt owners poisoned");
        if let Some(existing) = &owners[line] {
            return Err(ConfigError::DuplicateInterruptOwner { line: line.name(), owner: existing.clone() });
        }
        owners[line] = Some(owner.to_owned());
        Ok(())
    }

    pub fn owner(&self, line: Interrupt) -> Option<String> {
        self.owners.lock().expect("interrupt owners poisoned")[line].clone()
    }

    /// Latches `line` in I_STAT. Safe from any thread.
    pub fn raise_interrupt(&self, line: Interrupt) {
        let previous = self.stat.fetch_or(line.bit(), Ordering::SeqCst);
        if previous & line.bit() == 0 {
            tracing::trace!("interrupt {} raised", line.name());
        }
        if self.pending() {
            self.compiler.raise();
        }
        // A parked CPU needs to look at the new state whether or not it is masked
        self.rendezvous.cpu_thread_notify();
    }

    pub fn stat(&self) -> u32 {
        self.stat.load(Ordering::SeqCst)
    }

    pub fn mask(&self) -> u32 {
        self.mask.load(Ordering::SeqCst)
    }

    /// Level of the line into Cause.IP2
    pub fn pending(&self) -> bool {
        self.stat() & self.mask() != 0
    }

    /// Writing I_STAT clears every bit written as zero
    pub fn acknowledge(&self, value: u32) {
        self.stat.fetch_and(value, Ordering::SeqCst);
    }

    pub fn set_mask(&self, value: u32) {
        self.mask.store(value & 0x7ff, Ordering::SeqCst);
        if self.pending() {
            self.compiler.raise();
        }
    }
}

impl Device for InterruptController {
    fn attach(self: Arc<Self>, wiring: &mut Wiring<'_>) -> Result<(), ConfigError> {
        let ic = self.clone();
        // BIOS vblank waits spin on I_STAT, and every raise notifies
        wiring.address_space.register_poll32_callback(I_STAT, true, move |_| ic.stat())?;
        let ic = self.clone();
        wiring.address_space.register_write32_callback(I_STAT, true, move |_, value, mask: ByteMask| {
            // Lanes the access didn't cover are left alone
            ic.acknowledge(value | !mask.value());
        })?;
        let ic = self.clone();
        wiring.address_space.register_read32_callback(I_MASK, true, move |_| ic.mask())?;
        let ic = self;
        wiring.address_space.register_write32_callback(I_MASK, true, move |_, value, mask: ByteMask| {
            let mut current = ic.mask();
            mask.masked_insert(&mut current, value);
            ic.set_mask(current);
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> Arc<InterruptController> {
        InterruptController::new(Arc::new(Rendezvous::new()), InterruptHandle::new())
    }

    #[test]
    fn raise_latches_until_acknowledged() {
        let ic = controller();
        ic.raise_interrupt(Interrupt::Dma);
        assert_eq!(ic.stat(), 1 << 3);
        assert!(!ic.pending());

        ic.set_mask(Interrupt::Dma.bit());
        assert!(ic.pending());
        ic.acknowledge(!Interrupt::Dma.bit());
        assert_eq!(ic.stat(), 0);
        assert!(!ic.pending());
    }

    #[test]
    fn raising_pokes_the_compiler_only_when_unmasked() {
        let compiler = InterruptHandle::new();
        let ic = InterruptController::new(Arc::new(Rendezvous::new()), compiler.clone());
        ic.raise_interrupt(Interrupt::Gpu);
        assert!(!compiler.is_raised());
        ic.set_mask(Interrupt::VBlank.bit());
        ic.raise_interrupt(Interrupt::VBlank);
        assert!(compiler.take());
    }

    #[test]
    fn lines_have_one_owner() {
        let ic = controller();
        ic.register_owner(Interrupt::Cdrom, "cdrom").unwrap();
        assert!(matches!(
            ic.register_owner(Interrupt::Cdrom, "other"),
            Err(ConfigError::DuplicateInterruptOwner { line: "cdrom", .. })));
        assert_eq!(ic.owner(Interrupt::Cdrom).as_deref(), Some("cdrom"));
    }
}
