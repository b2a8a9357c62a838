//! A PlayStation built around the R3000 core: the address space the CPU sees, the interrupt and
//! DMA controllers, a vblank source, and the `Machine` tying them to a clock and an execution
//! thread. Other hardware plugs in as `Device`s through the component registry.

pub mod address_space;
pub mod config;
pub mod dma;
mod error;
pub mod exe;
pub mod interrupts;
pub mod machine;
pub mod registry;
pub mod vblank;

pub use address_space::{AddressSpace, MemoryHandle, PollConfig, Tag};
pub use config::{MachineConfig, TimeMode};
pub use dma::{DmaChannel, DmaController, DmaOwner, Transfer};
pub use error::{AddressError, ConfigError};
pub use exe::Executable;
pub use interrupts::{Interrupt, InterruptController};
pub use machine::{Halt, Machine, MachineBuilder, PollBlockListener};
pub use registry::{Component, Device, Registry, Wiring};
