use std::sync::Arc;

use common::{EnumMap, MakeNamed, Named};
use timing::Scheduler;

use crate::address_space::AddressSpace;
use crate::dma::DmaController;
use crate::interrupts::InterruptController;
use crate::ConfigError;

/// Every kind of component a machine can be built from. At most one of each.
#[derive(Named, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    #[named(required, name = "interrupt-controller")]
    Interrupts,
    #[named(required)]
    Dma,
    #[named(name = "vblank")]
    VBlank,
    Gpu,
    Cdrom,
    Spu,
    Mdec,
    Timers,
    Sio,
}

/// What a component gets to touch while it hooks itself up
pub struct Wiring<'a> {
    pub address_space: &'a mut AddressSpace,
    pub interrupts: &'a Arc<InterruptController>,
    pub dma: &'a Arc<DmaController>,
    pub scheduler: &'a Arc<Scheduler>,
}

/// A hardware component. Attaching registers its registers, interrupt lines, DMA channels and
/// scheduled actions with the machine.
pub trait Device: Send + Sync {
    fn attach(self: Arc<Self>, wiring: &mut Wiring<'_>) -> Result<(), ConfigError>;
}

/// The components a machine is being built from, keyed by what they are
#[derive(Default)]
pub struct Registry {
    devices: EnumMap<Option<Arc<dyn Device>>, Component>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn register(&mut self, component: Component, device: Arc<dyn Device>) -> Result<(), ConfigError> {
        if self.devices[component].is_some() {
            return Err(ConfigError::DuplicateComponent(component.name()));
        }
        tracing::debug!("registered {}", component.name());
        self.devices[component] = Some(device);
        Ok(())
    }

    pub fn contains(&self, component: Component) -> bool {
        self.devices[component].is_some()
    }

    pub fn registered(&self) -> impl Iterator<Item = Component> + '_ {
        self.devices.iter().filter(|(_, device)| device.is_some()).map(|(component, _)| component)
    }

    /// Fails on the first required component nobody registered
    pub fn check_required(&self) -> Result<(), ConfigError> {
        match Component::iter().find(|component| component.required() && !self.contains(*component)) {
            Some(missing) => Err(ConfigError::MissingComponent(missing.name())),
            None => Ok(()),
        }
    }

    /// Attaches everything, in `Component` order
    pub fn attach_all(&self, wiring: &mut Wiring<'_>) -> Result<(), ConfigError> {
        self.check_required()?;
        for (component, device) in self.devices.iter() {
            if let Some(device) = device {
                tracing::trace!("attaching {}", component.name());
                device.clone().attach(wiring)?;
            }
        }
        Ok(())
    }
}
